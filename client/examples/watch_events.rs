//! Example: Follow contract events and print them as they arrive
//!
//! Starts at the chain head unless `SAHAKARI_START_BLOCK` is set. Stop with
//! Ctrl-C.

use anyhow::Context;
use sahakari_client::{init_tracing, ClientConfig, EventKind, SahakariClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let path = std::env::var("SAHAKARI_CONFIG").unwrap_or_else(|_| "sahakari".to_string());
    let config = ClientConfig::load(&path).context("loading configuration")?;
    let client = SahakariClient::new(config)?;

    let mut watcher = client.watcher()?;
    if let Ok(block) = std::env::var("SAHAKARI_START_BLOCK") {
        watcher = watcher.with_start_block(block.parse().context("SAHAKARI_START_BLOCK")?);
    }

    let _subscriptions: Vec<_> = EventKind::ALL
        .into_iter()
        .map(|kind| {
            client.events().subscribe(kind, |record| {
                println!(
                    "#{} {} block {:?}: {}",
                    record.observed_order,
                    record.event_type,
                    record.block_number,
                    record.payload
                );
            })
        })
        .collect();

    println!("Watching {} event types, Ctrl-C to stop", EventKind::ALL.len());

    let runner = watcher.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    watcher.stop().await;
    handle.await??;

    println!("\nObserved {} events", client.events().len());
    Ok(())
}
