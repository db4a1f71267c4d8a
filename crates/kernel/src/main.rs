//! `testbook` -- run every code cell of a notebook through the test runner.
//!
//! Loads the notebook given as the first argument, starts the worker in the
//! configured workspace, executes all code cells and prints each result as
//! it arrives. Exits non-zero if a cell fails or does not finish in time.
//!
//! Configuration is read from the environment (and `.env`); see
//! [`KernelConfig::from_env`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use testbook_core::notebook::deserialize_notebook;
use testbook_kernel::console::render_record;
use testbook_kernel::{Kernel, KernelConfig, MemoryHost};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "testbook_kernel=info,testbook_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let notebook_arg: PathBuf = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: testbook <notebook-file>")?;
    let config = KernelConfig::from_env()?;

    let path = std::fs::canonicalize(&notebook_arg)
        .with_context(|| format!("Notebook {} not found", notebook_arg.display()))?;
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let (host, mut finished) = MemoryHost::with_completions();
    let host = Arc::new(host);
    host.open(path.clone(), deserialize_notebook(&bytes));

    let cells = host.code_cells(&path);
    if cells.is_empty() {
        tracing::info!(path = %path.display(), "Notebook has no code cells");
        return Ok(());
    }

    tracing::info!(
        path = %path.display(),
        cells = cells.len(),
        workspace = %config.workspace.display(),
        "Running notebook",
    );

    let kernel = Kernel::start(config.worker_config(), host.clone());
    if let Some(e) = kernel.launch_error() {
        let message = e.to_string();
        kernel.shutdown().await;
        anyhow::bail!(message);
    }

    let deadline = tokio::time::Instant::now() + config.run_timeout;
    match tokio::time::timeout_at(deadline, kernel.worker().wait_for_client()).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            kernel.shutdown().await;
            anyhow::bail!("Worker stopped before accepting connections");
        }
        Err(_) => {
            kernel.shutdown().await;
            anyhow::bail!("Timed out waiting for the worker to accept connections");
        }
    }

    let expected = cells.len();
    kernel.execute_all(cells);

    // Latest result per cell; a superseded run is replaced by its successor.
    let mut results = HashMap::new();
    while results.len() < expected {
        match tokio::time::timeout_at(deadline, finished.recv()).await {
            Ok(Some(record)) => {
                println!("{}", render_record(&record));
                results.insert(record.key.clone(), record.success == Some(true));
            }
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(
                    finished = results.len(),
                    expected,
                    "Timed out waiting for cells to finish"
                );
                break;
            }
        }
    }

    kernel.shutdown().await;

    let failed = results.values().filter(|ok| !**ok).count();
    let unfinished = expected - results.len();
    if failed > 0 || unfinished > 0 {
        anyhow::bail!("{failed} cell(s) failed, {unfinished} did not finish");
    }
    println!("{expected} cell(s) passed");
    Ok(())
}
