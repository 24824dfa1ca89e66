//! CLI front-end for the gateway's SPI (spec.md §9): load a configuration
//! file, resolve one or more logical indices, and run a single search or
//! retrieval against them. Not a long-running daemon in the network-service
//! sense — the gateway itself holds no listening socket (spec.md §1
//! "out of scope: ... the low-level sockets layer"); this binary is the
//! thing an operator or a front-end process shells out to, the same role
//! `sg-tape-cmd` plays for the teacher's tape subsystem.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use lwps_gateway::dispatch::DispatchRequest;
use lwps_gateway::gateway::Gateway;
use lwps_gateway::lwps::line_protocol::LineProtocolTransport;
use lwps_gateway::lwps::Transport;

#[derive(Parser)]
#[command(name = "lwps-gatewayd", about = "Federated LWPS search gateway")]
struct Cli {
    /// Path to the gateway configuration file.
    #[arg(short, long, default_value = "/etc/lwps-gateway/gateway.conf")]
    config: std::path::PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fan out a search across one or more logical indices and print the
    /// merged, spliced response as JSON.
    Search {
        /// Logical index names to search (space-separated).
        #[arg(required = true)]
        indices: Vec<String>,
        /// Search text, including any `{modifier}` clauses.
        #[arg(short, long, default_value = "")]
        text: String,
        #[arg(long, default_value_t = 0)]
        start: u32,
        #[arg(long, default_value_t = 9)]
        end: u32,
        #[arg(long)]
        language: Option<String>,
    },
    /// Retrieve one document chunk via a single logical index.
    Retrieve {
        index: String,
        document_key: String,
        item: String,
        #[arg(long)]
        mime_type: Option<String>,
        #[arg(long)]
        chunk_type: Option<String>,
        #[arg(long)]
        chunk_start: Option<u64>,
        #[arg(long)]
        chunk_end: Option<u64>,
    },
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let transport: Arc<dyn Transport> = Arc::new(LineProtocolTransport);
    let gateway = Gateway::open(&cli.config, transport)
        .with_context(|| format!("failed to open gateway config {:?}", cli.config))?;

    match cli.command {
        Command::Search { indices, text, start, end, language } => {
            let request = DispatchRequest {
                language,
                search_text: text,
                positive_feedback: None,
                negative_feedback: None,
                start_index: start,
                end_index: end,
            };
            let response = gateway.search(&indices, &request)?;
            println!("{}", serde_json::to_string_pretty(&SearchResponseView::from(&response))?);
        }
        Command::Retrieve {
            index,
            document_key,
            item,
            mime_type,
            chunk_type,
            chunk_start,
            chunk_end,
        } => {
            let chunk = gateway.retrieve(
                &index,
                &document_key,
                &item,
                mime_type.as_deref(),
                chunk_type.as_deref(),
                chunk_start,
                chunk_end,
                false,
            )?;
            println!("retrieved {} bytes, mime type {}", chunk.data.len(), chunk.mime_type);
        }
    }
    Ok(())
}

/// Thin serializable view over [`lwps_gateway::dispatch::DispatchResponse`];
/// kept separate so the library type stays free to evolve without touching
/// this binary's JSON shape.
#[derive(serde::Serialize)]
struct SearchResponseView {
    total_results: u64,
    max_sort_key: Option<f64>,
    sort_type: String,
    elapsed_ms: u64,
    rows: Vec<lwps_gateway::lwps::ResultRow>,
}

impl From<&lwps_gateway::dispatch::DispatchResponse> for SearchResponseView {
    fn from(r: &lwps_gateway::dispatch::DispatchResponse) -> Self {
        SearchResponseView {
            total_results: r.total_results,
            max_sort_key: r.max_sort_key,
            sort_type: format!("{:?}", r.sort_type),
            elapsed_ms: r.elapsed_ms,
            rows: r.rows.clone(),
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
