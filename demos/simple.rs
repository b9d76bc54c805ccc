//! Simple host example: one background worker, one start/stop service, and
//! pooled request contexts. Stop it with Ctrl+C.

use proc_host::{Config, ContextPool, Host, Result, StopSignal};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

async fn ticker(stop: StopSignal, contexts: Arc<ContextPool>) -> Result<()> {
    let mut counter: u64 = 0;

    loop {
        tokio::select! {
            () = stop.triggered() => {
                info!("Ticker shutting down after {} iterations", counter);
                return Ok(());
            }
            () = tokio::time::sleep(Duration::from_secs(1)) => {
                counter += 1;
                let mut context = contexts.get();
                context.request_id = Some(counter);
                context.scratch.push_str("tick");
                info!(request_id = counter, pooled = contexts.contexts().len(), "Ticker iteration");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let builder = Host::builder(Config::load()?);
    let contexts = builder.context_pool();

    let report = builder
        .with_service_fn(
            "listener",
            |_cancel| async {
                info!("Listener bound");
                Ok(())
            },
            |_deadline| async {
                info!("Listener closed");
                Ok(())
            },
        )
        .with_task("ticker", move |stop| ticker(stop, contexts))
        .run()
        .await?;

    info!(reason = %report.reason, elapsed_ms = report.elapsed.as_millis(), "Host exited");
    report.outcome
}
