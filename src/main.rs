// SPDX-License-Identifier: MIT

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use ensemble_rs::ensemble::engine::ExecutionCoordinator;
use ensemble_rs::ensemble::server;
use ensemble_rs::ensemble::workflow::WorkflowLoader;
use ensemble_rs::ensemble::Settings;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a workflow file and wait for it to finish
    Run {
        /// Path to the workflow definition (YAML or JSON)
        #[arg(short, long)]
        file: PathBuf,

        /// External job id; a second run with an active job id attaches to it
        #[arg(short, long)]
        job_id: Option<String>,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 3600)]
        timeout_secs: u64,

        /// Directory for task outputs (overrides ENSEMBLE_OUTPUT_ROOT)
        #[arg(long)]
        output_root: Option<PathBuf>,
    },
    /// Serve the HTTP API
    Serve {
        #[arg(short, long, default_value_t = 3000)]
        port: u16,

        /// Directory for execution records (overrides ENSEMBLE_STORE_DIR)
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();
    let mut settings = Settings::from_env().context("invalid ENSEMBLE_* setting")?;

    match args.command {
        Commands::Run {
            file,
            job_id,
            timeout_secs,
            output_root,
        } => {
            env_logger::init();
            if let Some(root) = output_root {
                settings.output_root = root;
            }
            let coordinator = ExecutionCoordinator::from_settings(&settings).await?;
            let definition = WorkflowLoader::new()
                .load_workflow(&file)
                .with_context(|| format!("cannot load {}", file.display()))?;

            let created = coordinator.create(&definition, job_id)?;
            println!(
                "Execution {} (job {}) is {}",
                created.execution_id, created.job_id, created.status
            );

            let report = coordinator
                .wait_for_completion(
                    &created.execution_id,
                    Duration::from_millis(500),
                    Duration::from_secs(timeout_secs),
                )
                .await?;

            let mut cursor = 0;
            loop {
                let page = coordinator
                    .get_trace(&created.execution_id, cursor, 200)
                    .await?;
                if page.events.is_empty() {
                    break;
                }
                for event in &page.events {
                    println!(
                        "#{:<4} {:<16} {:<12} {}",
                        event.sequence,
                        serde_json::to_string(&event.kind)?.trim_matches('"'),
                        event.task_id.as_deref().unwrap_or("-"),
                        event.payload
                    );
                }
                cursor = page.next_cursor;
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Serve { port, store_dir } => {
            // Also forwards `log` records, so env_logger is not installed here.
            let _ = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::INFO)
                .try_init();
            if store_dir.is_some() {
                settings.store_dir = store_dir;
            }
            let coordinator = ExecutionCoordinator::from_settings(&settings).await?;
            server::serve(coordinator, port)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
        }
    }

    Ok(())
}
