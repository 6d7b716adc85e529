//! Simulated live event
//!
//! Run with: cargo run --example simulated_event [SECONDS]
//!
//! Spins up the service over in-memory collaborators, lets a handful of
//! devices come and go at random, and prints every metrics update. Two of
//! the devices belong to the same viewer, so concurrency never exceeds the
//! number of distinct viewers. Stops after SECONDS (default 30) or Ctrl-C,
//! then ends the event and prints the final numbers. A housekeeping ticker
//! purges presence entries that stopped refreshing.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use viewer_metrics::{DeviceId, EventId, TrackerConfig, ViewerId, ViewerMetricsService};

const DEVICES: &[(&str, &str)] = &[
    ("alice-phone", "alice"),
    ("alice-tv", "alice"),
    ("bob-laptop", "bob"),
    ("carol-tablet", "carol"),
    ("dave-phone", "dave"),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let seconds: u64 = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(30);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("viewer_metrics=info".parse()?)
                .add_directive("simulated_event=info".parse()?),
        )
        .init();

    let config = TrackerConfig::default()
        .active_window(Duration::from_secs(5))
        .reaper_interval(Duration::from_secs(10));
    let (service, backends) = ViewerMetricsService::in_memory(config);

    let event = EventId::new("launch-keynote");
    backends.status.set_live(&event, true).await;
    for (device, viewer) in DEVICES {
        backends
            .identity
            .register(&event, &DeviceId::new(*device), &ViewerId::new(*viewer))
            .await;
    }

    let mut updates = service
        .subscribe_metrics()
        .ok_or("in-memory service has a metrics channel")?;
    tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            println!(
                "[{}] concurrent={} peak={} unique={}",
                update.event_id,
                update.current_concurrent_viewers,
                update.peak_concurrent_viewers,
                update.total_unique_viewers,
            );
        }
    });

    service.watch(&event).await;
    service.start_reaper().await;

    // Presence housekeeping runs independently of the watcher
    let housekeeping = {
        let presence = backends.presence.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let purged = presence
                    .purge_stale(Utc::now(), chrono::Duration::seconds(20))
                    .await;
                if purged > 0 {
                    println!("Purged {} stale presence entries", purged);
                }
            }
        })
    };

    println!("Simulating {} for {}s (Ctrl-C to stop early)", event, seconds);

    let simulation = async {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        for _ in 0..seconds {
            ticker.tick().await;
            for (device, _) in DEVICES {
                let device = DeviceId::new(*device);
                let roll: f64 = rand::thread_rng().gen();
                if roll < 0.6 {
                    backends.presence.set_online(&event, &device, Utc::now()).await;
                } else if roll < 0.75 {
                    backends.presence.set_offline(&event, &device, Utc::now()).await;
                }
            }
        }
    };

    tokio::select! {
        _ = simulation => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
    }

    housekeeping.abort();
    let metrics = service.end_event(&event, Utc::now()).await;
    println!(
        "Final: peak={} unique={}",
        metrics.peak_concurrent_viewers, metrics.total_unique_viewers
    );
    println!("Pipeline: {}", serde_json::to_string(&service.stats())?);

    service.shutdown().await;
    Ok(())
}
