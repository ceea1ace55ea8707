#![forbid(unsafe_code)]

//! `bibot-mcp-ctl`: operator CLI for a running `bibot-mcp` router.
//!
//! Talks to the router's HTTP surface: health summary, tool listing, ad-hoc
//! tool calls, and cancellation of live calls.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(
    name = "bibot-mcp-ctl",
    about = "Operator CLI for the bibot-mcp router",
    version,
    long_about = None
)]
struct Cli {
    /// Base URL of the router's HTTP surface.
    #[arg(long, default_value = "http://127.0.0.1:8765")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show router health, servers, and call counters.
    Health,

    /// List routable tools.
    Tools,

    /// Call a tool.
    Call {
        /// Tool name.
        name: String,
        /// Arguments as a JSON object.
        #[arg(default_value = "{}")]
        arguments: String,
        /// Request id; generated by the router when omitted.
        #[arg(long)]
        id: Option<String>,
    },

    /// Cancel a live call.
    Cancel {
        /// Request id of the call.
        id: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Cli::parse();
    let base = args.url.trim_end_matches('/').to_owned();

    match run(&base, args.command).await {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            if value.get("error").is_some() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("Error: {err}");
            eprintln!("Is bibot-mcp serving on {base}?");
            ExitCode::FAILURE
        }
    }
}

async fn run(base: &str, command: Command) -> Result<Value, Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let value = match command {
        Command::Health => client.get(format!("{base}/mcp/health")).send().await?.json().await?,
        Command::Tools => {
            let reply: Value = post_envelope(&client, base, &envelope(None, "tools/list", json!({}))).await?;
            reply.get("result").and_then(|r| r.get("tools")).cloned().unwrap_or(reply)
        }
        Command::Call { name, arguments, id } => {
            let arguments: Value = serde_json::from_str(&arguments)?;
            let request = envelope(
                id,
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
            );
            post_envelope(&client, base, &request).await?
        }
        Command::Cancel { id } => {
            client
                .post(format!("{base}/mcp/cancel/{id}"))
                .send()
                .await?
                .json()
                .await?
        }
    };
    Ok(value)
}

fn envelope(id: Option<String>, method: &str, params: Value) -> Value {
    let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    json!({
        "protocol_version": "2024-11-05",
        "id": id,
        "method": method,
        "params": params,
    })
}

async fn post_envelope(
    client: &reqwest::Client,
    base: &str,
    request: &Value,
) -> Result<Value, reqwest::Error> {
    client
        .post(format!("{base}/mcp"))
        .json(request)
        .send()
        .await?
        .json()
        .await
}
