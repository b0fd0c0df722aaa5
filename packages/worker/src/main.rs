use std::sync::Arc;

use job_queue::connect_job_queue;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use worker::{ExecFuture, ExecRequest, Executor, ProcessorPool, WorkerConfig};

/// Stand-in executor: reports what it was asked to run and passes.
struct EchoExecutor;

impl Executor for EchoExecutor {
    fn run(&self, request: ExecRequest) -> ExecFuture<'_> {
        Box::pin(async move {
            let image = request.start_attributes.image.as_deref().unwrap_or("default");
            let line = format!("Running job {} on image {image}\n", request.payload.id);
            // A closed channel means the job was stopped; nothing left to report.
            let _ = request.output.send(line).await;
            Ok(0)
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = WorkerConfig::from_env()?;
    let queue = connect_job_queue(&config.queue).await?;
    let pool = ProcessorPool::new(config.queue.pool_size, config.policy);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutting down, waiting for running jobs");
                    cancel.cancel();
                }
                Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
    });

    pool.run(queue.as_ref(), Arc::new(EchoExecutor), cancel).await?;
    Ok(())
}
