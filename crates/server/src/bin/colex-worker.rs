use std::error::Error;
use std::net::TcpListener;
use std::sync::Arc;

use colex_common::ProcessorConfig;
use colex_executor::{ExecutorContext, MemoryBlockSource};
use colex_scheduler::FairScheduler;
use colex_server::{serve, BatchService};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ProcessorConfig::from_env()?;
    let source = Arc::new(MemoryBlockSource::new());
    let ctx = ExecutorContext::new(config.clone(), source);
    let scheduler = Arc::new(FairScheduler::new(
        "colex-pp",
        config.processor_threads,
        ctx.metrics.clone(),
    ));

    #[cfg(feature = "profiling")]
    start_metrics_exporter(ctx.metrics.clone())?;

    let listener = TcpListener::bind(&config.listen_addr)?;
    info!(
        listen_addr = %config.listen_addr,
        processor_threads = config.processor_threads,
        connections_per_consumer = config.connections_per_consumer,
        "colex-worker started"
    );
    serve(listener, Arc::new(BatchService::new(ctx, scheduler)))?;
    Ok(())
}

#[cfg(feature = "profiling")]
fn start_metrics_exporter(metrics: colex_common::MetricsRegistry) -> Result<(), Box<dyn Error>> {
    let addr: std::net::SocketAddr = std::env::var("COLEX_METRICS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9620".to_string())
        .parse()?;
    std::thread::Builder::new()
        .name("colex-metrics".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(error = %e, "metrics runtime failed to start");
                    return;
                }
            };
            if let Err(e) = runtime.block_on(colex_common::run_metrics_exporter(addr, metrics)) {
                tracing::error!(error = %e, "metrics exporter stopped");
            }
        })?;
    info!(%addr, "metrics exporter listening");
    Ok(())
}
