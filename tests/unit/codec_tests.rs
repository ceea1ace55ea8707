use bibot_mcp::transport::codec::{FrameCodec, MAX_FRAME_BYTES};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn decodes_one_frame_per_line() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&b"{\"id\":\"1\"}\n{\"id\":\"2\"}\n{\"id\""[..]);

    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"id\":\"1\"}"));
    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"id\":\"2\"}"));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);

    buf.extend_from_slice(b":\"3\"}\n");
    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"id\":\"3\"}"));
}

#[test]
fn strips_carriage_returns() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&b"{}\r\n"[..]);
    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{}"));
}

#[test]
fn unterminated_tail_is_returned_at_eof() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&b"{\"last\":true}"[..]);
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    assert_eq!(
        codec.decode_eof(&mut buf).unwrap().as_deref(),
        Some("{\"last\":true}")
    );
}

#[test]
fn oversized_frame_is_discarded_and_stream_recovers() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(MAX_FRAME_BYTES + 64);
    buf.extend_from_slice(&vec![b'x'; MAX_FRAME_BYTES + 1]);
    buf.extend_from_slice(b"\n{\"ok\":1}\n");

    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"ok\":1}"));
    assert!(buf.is_empty());
}

#[test]
fn oversized_frame_arriving_in_pieces_is_discarded() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&vec![b'x'; MAX_FRAME_BYTES + 1][..]);
    assert_eq!(codec.decode(&mut buf).unwrap(), None);

    buf.extend_from_slice(b"more of the same line\n{\"ok\":2}\n");
    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"ok\":2}"));
}

#[test]
fn non_utf8_line_is_discarded_and_stream_recovers() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&b"\xff\xfe garbage\n{\"ok\":3}\n"[..]);
    assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"ok\":3}"));

    let mut tail = BytesMut::from(&b"\xc3"[..]);
    assert_eq!(codec.decode_eof(&mut tail).unwrap(), None);
}

#[test]
fn encode_appends_newline() {
    let mut codec = FrameCodec::new();
    let mut dst = BytesMut::new();
    codec.encode("{\"id\":\"a\"}".to_owned(), &mut dst).unwrap();
    assert_eq!(&dst[..], b"{\"id\":\"a\"}\n");
}
