//! UVZ CLI entry point

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use uvz::pipeline::ToolPipeline;

#[derive(Parser)]
#[command(name = "uvz")]
#[command(about = "UVZ research and content generation tool server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve tool invocations as JSON lines over stdio
    Serve,

    /// List the available tools as JSON definitions
    Tools,

    /// Invoke a single tool and print the generated text
    Invoke {
        /// Tool name
        tool: String,

        /// JSON object of tool arguments
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Caller identity used for quota accounting
        #[arg(short, long, default_value = "cli:default")]
        identity: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol in serve mode, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = uvz::config::Config::from_env()?;
    if config.gemini_api_key.is_empty() {
        tracing::warn!("GEMINI_API_KEY not set; completion calls will be rejected by the backend");
    }
    let pipeline = ToolPipeline::from_config(&config)?;

    match cli.command {
        Commands::Tools => {
            println!("{}", serde_json::to_string_pretty(&pipeline.definitions())?);
        }

        Commands::Invoke {
            tool,
            args,
            identity,
        } => {
            let args: Value = serde_json::from_str(&args)?;
            match pipeline.invoke(&tool, &args, &identity).await {
                Ok(response) => println!("{}", response.text),
                Err(e) => {
                    eprintln!("{}", failure(Value::Null, &e));
                    std::process::exit(1);
                }
            }
        }

        Commands::Serve => serve(pipeline).await?,
    }

    Ok(())
}

/// One request line in serve mode.
#[derive(Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    tool: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    identity: Option<String>,
}

/// JSON-lines loop over stdio: one request per line in, one response per
/// line out. Invocations run concurrently; a response channel keeps
/// stdout writes whole.
async fn serve(pipeline: ToolPipeline) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    tracing::info!("serving tool invocations on stdio");

    let pipeline = Arc::new(pipeline);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("{line}");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let _ = tx.send(
                    json!({
                        "id": Value::Null,
                        "ok": false,
                        "error": {"kind": "bad_request", "message": e.to_string()},
                    })
                    .to_string(),
                );
                continue;
            }
        };

        let pipeline = pipeline.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let identity = request.identity.as_deref().unwrap_or("stdio:default");
            let response = match pipeline.invoke(&request.tool, &request.args, identity).await {
                Ok(response) => json!({
                    "id": request.id,
                    "ok": true,
                    "text": response.text,
                    "tokens_used": response.tokens_used,
                    "latency_ms": response.latency_ms,
                    "research_degraded": response.research_degraded,
                })
                .to_string(),
                Err(e) => failure(request.id, &e),
            };
            let _ = tx.send(response);
        });
    }

    drop(tx);
    writer.await?;
    Ok(())
}

fn failure(id: Value, error: &uvz::Error) -> String {
    let mut body = json!({
        "kind": error.kind(),
        "message": error.to_string(),
    });
    if let Some(retry_after_ms) = error.retry_after_ms() {
        body["retry_after_ms"] = json!(retry_after_ms);
    }
    json!({"id": id, "ok": false, "error": body}).to_string()
}
