//! Publisher demo.
//!
//! Sends numbered ticks to the `rhtest` fanout exchange, one every 10ms.
//! Restart the broker while it runs to watch the supervisor reconnect.
//!
//! Run with: cargo run --example publish -- [count]
//!
//! Requires: RabbitMQ on `WARREN_HOST` (default localhost:5672)
mod common;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{broker_config, init_logging, Tick};
use warren::Writer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    init_logging();

    let count: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 1_000,
    };

    let (writer, port) = Writer::connect(broker_config("warren-publish"), "rhtest", "fanout+ad", "").await?;
    writer.start()?;

    for seq in 1..=count {
        let tick = Tick {
            seq,
            sent_at_ms: SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis(),
        };
        port.send(serde_json::to_vec(&tick)?).await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    println!("queued {count} ticks");

    // Give the publish task a moment to drain the port.
    tokio::time::sleep(Duration::from_millis(500)).await;
    writer.close().await;

    Ok(())
}
