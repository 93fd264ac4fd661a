//! FlowLLM command-line entry point.
//!
//! `flowllm serve` starts the configured service backend (`http` or `mcp`);
//! `flowllm run <flow>` executes one flow in-process (the `cmd` backend)
//! and prints the response as JSON. Both accept `-o key.path=value`
//! overrides on top of the loaded config file.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use flowllm_core::logging::init_tracing;
use flowllm_core::{ChunkKind, ServiceConfig};
use flowllm_runtime::{DispatchOptions, FlowOutcome};

#[derive(Parser)]
#[command(name = "flowllm")]
#[command(about = "Serve composable LLM flows over HTTP and MCP", long_about = None)]
struct Cli {
    /// Config file path (defaults to ./flowllm.toml, then ~/.flowllm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Dotted config overrides, e.g. -o http.port=9000
    #[arg(short = 'o', long = "override", global = true, value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured service backend.
    Serve {
        /// Override the configured backend (http | mcp).
        #[arg(long)]
        backend: Option<String>,
    },
    /// Execute one flow and print the response JSON.
    Run {
        /// Flow name from the config.
        flow: String,
        /// JSON object with the flow inputs.
        #[arg(long, default_value = "{}")]
        input: String,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<ServiceConfig> {
    let config = flowllm_config::load(cli.config.as_deref()).context("loading configuration")?;
    let config = flowllm_config::apply_overrides(config, &cli.overrides)
        .context("applying config overrides")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info,flowllm=debug");
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Serve { backend } => {
            if let Some(backend) = backend {
                config.backend = backend;
            }
            let dispatcher = flowllm_server::bootstrap(config)?;
            flowllm_server::serve(dispatcher).await
        }
        Commands::Run { flow, input } => {
            let body: serde_json::Value =
                serde_json::from_str(&input).context("parsing --input as JSON")?;
            let kwargs = body
                .as_object()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("--input must be a JSON object"))?;

            let dispatcher = flowllm_server::bootstrap(config)?;
            let outcome = dispatcher
                .execute(&flow, kwargs, DispatchOptions::default())
                .await?;
            match outcome {
                FlowOutcome::Response(response) => {
                    println!("{}", serde_json::to_string_pretty(&response.to_body())?);
                }
                FlowOutcome::Stream(mut rx) => {
                    // Stream flows print chunks as they arrive, then the
                    // final response line.
                    while let Some(chunk) = rx.recv().await {
                        match chunk.kind {
                            ChunkKind::Done => break,
                            kind => println!(
                                "[{}] {}",
                                kind.as_str(),
                                chunk.content_str().unwrap_or_default()
                            ),
                        }
                    }
                }
            }
            Ok(())
        }
    }
}
