use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;

use worldsync::config::SyncConfig;
use worldsync::server::{self, SubmitResponse};
use worldsync::sync::session_url;
use worldsync::{telemetry, NewOperation, OperationSink, SequencedOperation, SyncClient};

#[derive(Parser)]
#[command(name = "worldsync")]
#[command(about = "Real-time operation sync for shared 3D sessions", version)]
#[command(after_help = "Every operation submitted to a session gets the next gap-free sequence
number and is broadcast to all connected clients. Clients that miss
operations request the range again, or fall back to a full snapshot.")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync server
    Serve {
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Follow a session and print operations as they are applied
    Follow {
        /// Server WebSocket url, e.g. ws://localhost:3000/ws
        #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
        url: String,

        #[arg(short, long)]
        session: String,

        #[arg(long, default_value = "worldsync-cli")]
        client_id: String,
    },

    /// Submit one operation over HTTP
    Submit {
        /// Server HTTP url
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        url: String,

        #[arg(short, long)]
        session: String,

        #[arg(long, default_value = "worldsync-cli")]
        client_id: String,

        /// Operation type, e.g. entity_update or avatar_move
        #[arg(short = 't', long = "type")]
        kind: String,

        /// Operation payload as JSON
        #[arg(short, long)]
        data: String,
    },

    /// List retained operations of a session
    Ops {
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        url: String,

        #[arg(short, long)]
        session: String,

        #[arg(long)]
        from: Option<u64>,

        #[arg(long)]
        to: Option<u64>,
    },
}

/// Prints each applied operation on one line.
struct PrintSink;

impl OperationSink for PrintSink {
    fn apply(&mut self, op: &SequencedOperation) {
        println!(
            "{} {} {} {}",
            format!("#{}", op.seq_num).bright_yellow(),
            op.operation.kind.tag().cyan(),
            op.operation.client_id.bright_white(),
            op.operation.timestamp.format("%H:%M:%S%.3f").to_string().dimmed()
        );
    }

    fn reset(&mut self) {
        println!("{}", "↺ full sync, rebuilding from snapshot".yellow());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = SyncConfig::load_or_default(cli.config.as_deref())?;
    let _telemetry = telemetry::init(&config.logging)?;

    let command = match cli.command {
        Some(cmd) => cmd,
        None => Commands::Serve { port: None },
    };

    match command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            println!("{}", "🌐 Starting operation sync server...".cyan().bold());
            server::serve(config).await?;
            println!("{}", "✓ Server stopped".green());
        }

        Commands::Follow {
            url,
            session,
            client_id,
        } => {
            let target = session_url(&url, &session, &client_id)?;
            println!(
                "{} Following {} at {}",
                "👁".cyan(),
                session.bright_white(),
                target.as_str().bright_blue()
            );
            let client = SyncClient::new(target, client_id, PrintSink)
                .with_retry_policy(config.retry_policy())
                .with_gap_timeout(config.gap_request_timeout());
            client.run().await?;
        }

        Commands::Submit {
            url,
            session,
            client_id,
            kind,
            data,
        } => {
            let data: serde_json::Value =
                serde_json::from_str(&data).context("--data must be valid JSON")?;
            let body = serde_json::json!({ "client_id": client_id, "type": kind, "data": data });
            let op: NewOperation =
                serde_json::from_value(body).context("not a valid operation")?;

            let endpoint = format!("{}/sessions/{}/ops", url.trim_end_matches('/'), session);
            let resp = reqwest::Client::new().post(&endpoint).json(&op).send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                anyhow::bail!("server rejected operation ({status}): {text}");
            }
            let accepted: SubmitResponse = resp.json().await?;
            println!(
                "{} Sequenced as {}",
                "✓".green(),
                format!("#{}", accepted.seq_num).bright_yellow()
            );
        }

        Commands::Ops {
            url,
            session,
            from,
            to,
        } => {
            let endpoint = format!("{}/sessions/{}/ops", url.trim_end_matches('/'), session);
            let mut query = Vec::new();
            if let Some(from) = from {
                query.push(("from", from));
            }
            if let Some(to) = to {
                query.push(("to", to));
            }
            let resp = reqwest::Client::new()
                .get(&endpoint)
                .query(&query)
                .send()
                .await?;
            if resp.status() == reqwest::StatusCode::GONE {
                println!(
                    "{} Range no longer retained; fetch {} instead",
                    "⚠".yellow(),
                    "/snapshot".bright_white()
                );
                return Ok(());
            }
            let resp = resp.error_for_status()?;
            let ops: Vec<SequencedOperation> = resp.json().await?;

            println!("{}", format!("📜 {} ({} ops)", session, ops.len()).cyan().bold());
            let mut sink = PrintSink;
            for op in &ops {
                sink.apply(op);
            }
        }
    }

    Ok(())
}
