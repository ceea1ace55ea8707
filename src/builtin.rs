//! In-process tools shipped with the router binary, so the surface can be
//! exercised without any sidecar.

use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::time::sleep;

use crate::protocol::{Progress, Tool};
use crate::server::{ToolContext, ToolError, ToolServer};

/// Registration name of the built-in server.
pub const BUILTIN_SERVER: &str = "builtin";

/// Longest sleep `wait` accepts.
const MAX_WAIT_MS: u64 = 60_000;

/// Server exposing `echo` and `wait`.
#[must_use]
pub fn builtin_server() -> ToolServer {
    let server = ToolServer::new(BUILTIN_SERVER, env!("CARGO_PKG_VERSION"));

    server.register_tool(
        Tool::new(
            "echo",
            "Return the arguments unchanged.",
            json!({ "type": "object" }),
        )
        .with_tag("diagnostics"),
        |args: Map<String, Value>, _ctx: ToolContext| async move {
            Ok::<_, ToolError>(Value::Object(args))
        },
    );

    server.register_tool(
        Tool::new(
            "wait",
            "Sleep for `ms` milliseconds, reporting progress every tenth.",
            json!({
                "type": "object",
                "properties": { "ms": { "type": "integer" } },
                "required": ["ms"],
                "additionalProperties": false
            }),
        )
        .with_tag("diagnostics"),
        |args: Map<String, Value>, ctx: ToolContext| async move { wait(&args, &ctx).await },
    );

    server
}

async fn wait(args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
    let ms = args
        .get("ms")
        .and_then(Value::as_u64)
        .ok_or_else(|| ToolError::execution("ms must be a non-negative integer"))?;
    if ms > MAX_WAIT_MS {
        return Err(ToolError::execution(format!("ms must not exceed {MAX_WAIT_MS}")));
    }

    let step = Duration::from_millis(ms / 10);
    for i in 1..=10_u32 {
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                return Err(ToolError::execution("wait cancelled"));
            }
            () = sleep(step) => {}
        }
        let percent = i * 10;
        ctx.report(Progress::message(
            f64::from(i) / 10.0,
            Some(1.0),
            format!("{percent}%"),
        ))
        .await;
    }
    Ok(json!({ "waited_ms": ms }))
}
