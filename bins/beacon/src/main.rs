//! Demo publisher: emits `message <n>` on the configured topic at a fixed pace.
//!
//! Usage: `beacon [config.toml]`

use anyhow::Context;
use basalt_bus::TopicRegistry;
use basalt_config::BasaltConfig;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let config = BasaltConfig::load_or_default(std::env::args().nth(1))
        .context("failed to load beacon config")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let registry = TopicRegistry::new(config.bus_options());
    let mut publisher = registry
        .publisher(&config.topic)
        .with_context(|| format!("failed to open topic '{}'", config.topic))?;
    info!(
        topic = %config.topic,
        shm = %publisher.topic().shm_name(),
        capacity = publisher.topic().capacity(),
        interval = ?config.publish_interval(),
        "BEACON: publishing"
    );

    let mut last = Instant::now();
    let mut published: u64 = 0;
    let mut i: u64 = 0;

    while config.count.is_none_or(|count| i < count) {
        let msg = format!("message {i}");
        let seq = publisher.publish(msg.as_bytes())?;
        debug!(seq, %msg, "published");
        i += 1;
        published += 1;

        if last.elapsed() >= Duration::from_secs(1) {
            info!("BEACON: publish rate ~ {published} msg/s");
            published = 0;
            last = Instant::now();
        }
        std::thread::sleep(config.publish_interval());
    }

    info!(total = i, "BEACON: done");
    Ok(())
}
