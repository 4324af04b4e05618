//! events-smoke
//!
//! Tracks a burst of events against a collector and disposes the tracker,
//! printing delivery metrics at the end. Useful for checking an endpoint,
//! API key and batch ceiling before wiring the tracker into a checkout.

use anyhow::{Context, Result};
use billing_events::config::TrackerConfig;
use billing_events::event::{ExternalEvent, UserIdentity};
use billing_events::sdk_events::{ModeOnly, PurchaseMode, SdkEvent};
use billing_events::tracker::EventsTracker;
use clap::Parser;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "events.toml")]
    config: String,

    /// Number of external events to track after the SDK lifecycle events
    #[arg(short, long, default_value_t = 10)]
    events: usize,

    /// Collector base URL, overrides the config file
    #[arg(long, env = "EVENTS_ENDPOINT_BASE")]
    endpoint: Option<String>,

    /// Workflow identifier for a persisted trace id
    #[arg(long)]
    workflow: Option<String>,

    /// App user id events are attributed to
    #[arg(long, default_value = "$RCAnonymousID:events-smoke")]
    app_user_id: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting events smoke run");

    let mut config = load_config(&args.config)?;
    if let Some(endpoint) = args.endpoint {
        config.collector.endpoint_base = endpoint;
    }
    if let Some(workflow) = args.workflow {
        config.trace.workflow_identifier = Some(workflow);
    }
    config.validate().context("Invalid configuration")?;

    info!(
        endpoint = %config.collector.events_url(),
        max_batch_bytes = config.flush.max_batch_bytes,
        "Collector configured"
    );

    let is_anonymous = args.app_user_id.starts_with("$RCAnonymousID:");
    let tracker = EventsTracker::new(config, UserIdentity::new(args.app_user_id, is_anonymous))
        .context("Failed to create events tracker")?;

    let started = Instant::now();
    tracker.track_event(SdkEvent::sdk_initialized());
    let session = tracker.generate_checkout_session_id();
    info!(trace_id = %tracker.trace_id(), checkout_session_id = %session, "Tracking events");

    tracker.track_event(SdkEvent::CheckoutBillingFormImpression(ModeOnly {
        mode: PurchaseMode::SdkCheckout,
    }));
    for i in 0..args.events {
        tracker.track_external_event(
            ExternalEvent::new("smoke_test_event", "events-smoke")
                .with_property("sequence", i as u64)
                .with_property("runStartedAt", chrono::Utc::now().to_rfc3339()),
        );
    }
    tracker.track_event(SdkEvent::session_closed(PurchaseMode::SdkCheckout));

    tracker.dispose().await;

    let metrics = tracker.metrics();
    info!(
        tracked = metrics.events_tracked.get(),
        sent = metrics.events_sent.get(),
        batches = metrics.batches_sent.get(),
        failures = metrics.flush_failures.get(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Smoke run finished"
    );
    if tracker.queue_len() > 0 {
        warn!(undelivered = tracker.queue_len(), "Collector did not accept every event");
    }

    if args.verbose {
        println!("{}", metrics.encode_text());
    }

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool, json: bool) {
    let env_filter = if verbose {
        "billing_events=debug,events_smoke=debug,info"
    } else {
        "billing_events=info,events_smoke=info,warn"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| env_filter.into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

/// Load configuration from file with fallback to defaults
fn load_config(path: &str) -> Result<TrackerConfig> {
    if std::path::Path::new(path).exists() {
        TrackerConfig::from_file_with_env(path)
            .with_context(|| format!("Failed to load config from {}", path))
    } else {
        warn!("Config file '{}' not found, using defaults", path);
        TrackerConfig::with_env_overrides()
    }
}
