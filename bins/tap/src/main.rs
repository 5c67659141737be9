//! Demo subscriber: prints every message of the configured topic.
//!
//! Usage: `tap [config.toml]`

use anyhow::Context;
use basalt_bus::{BusError, Liveness, PollOutcome, StartPosition, Subscriber, TopicRegistry};
use basalt_config::BasaltConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);
const ATTACH_RETRY: Duration = Duration::from_millis(500);

fn subscribe(registry: &TopicRegistry, config: &BasaltConfig) -> anyhow::Result<Subscriber> {
    let start = if config.replay {
        StartPosition::Oldest
    } else {
        StartPosition::Latest
    };
    loop {
        match registry.subscribe(&config.topic, start) {
            Ok(subscriber) => return Ok(subscriber),
            Err(BusError::TopicNotFound { .. }) => {
                info!(topic = %config.topic, "TAP: waiting for topic to appear");
                std::thread::sleep(ATTACH_RETRY);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to subscribe to '{}'", config.topic));
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let config = BasaltConfig::load_or_default(std::env::args().nth(1))
        .context("failed to load tap config")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let registry = TopicRegistry::new(config.bus_options());
    let subscriber = subscribe(&registry, &config)?;
    info!(topic = %config.topic, seq = subscriber.position(), "TAP: subscribed");

    let topic = Arc::clone(subscriber.topic());
    let mut overruns = 0u64;
    let subscription = subscriber
        .spawn(move |outcome| match outcome {
            PollOutcome::Messages(msgs) => {
                for msg in msgs {
                    println!("{} {}", msg.seq, String::from_utf8_lossy(&msg.payload));
                }
            }
            PollOutcome::Gap { missed, resync } => {
                overruns += missed;
                warn!(missed, resync, overruns, "TAP: fell behind");
            }
            PollOutcome::TimedOut | PollOutcome::Cancelled => {}
        })
        .context("failed to start subscription thread")?;

    let mut reported_dead = false;
    while !subscription.is_finished() {
        std::thread::sleep(LIVENESS_INTERVAL);
        match topic.publisher_liveness() {
            Liveness::Dead { pid } if !reported_dead => {
                warn!(pid, last_publish = ?topic.last_publish(), "TAP: publisher is gone");
                reported_dead = true;
            }
            Liveness::Alive { .. } => reported_dead = false,
            _ => {}
        }
    }
    subscription.stop().context("subscription stopped")?;
    Ok(())
}
