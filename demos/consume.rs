//! Consumer demo.
//!
//! Prints every tick delivered from the `rhtest` fanout exchange and reports
//! gaps in the sequence, e.g. the message lost while the broker restarted.
//!
//! Run with: cargo run --example consume
//!
//! Requires: RabbitMQ on `WARREN_HOST` (default localhost:5672)
mod common;

use common::{broker_config, init_logging, Tick};
use tokio::sync::mpsc;
use warren::Reader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    init_logging();

    let reader = Reader::connect(broker_config("warren-consume"), "rhtest", "fanout+ad", "").await?;

    let (tx, mut rx) = mpsc::channel(1024);
    reader.start_eating(tx).await?;
    println!("eating from queue {:?}, Ctrl+C to stop", reader.queue_name());

    let mut last = 0;
    loop {
        tokio::select! {
            delivery = rx.recv() => {
                let Some(delivery) = delivery else { break };
                let tick: Tick = serde_json::from_slice(&delivery.body)?;
                if last != 0 && tick.seq != last + 1 {
                    println!("gap: {} -> {}", last, tick.seq);
                }
                last = tick.seq;
                println!("tick {} (sent at {})", tick.seq, tick.sent_at_ms);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    reader.close().await;
    Ok(())
}
