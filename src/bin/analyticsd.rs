//! analyticsd - video analytics pipeline daemon
//!
//! This daemon:
//! 1. Loads layered configuration (file, then environment)
//! 2. Builds the pipeline with the configured detector and event sink
//! 3. Registers and autostarts configured sources
//! 4. Logs pipeline health every 5 seconds, flagging long-failing sources
//! 5. Shuts everything down on Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::path::PathBuf;
use std::time::Duration;

use video_analytics::config::AnalyticsConfig;
use video_analytics::dispatch::{
    EventSink, InMemoryOutbox, LogSink, MqttSink, Outbox, SqliteOutbox,
};
use video_analytics::Orchestrator;

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the video analytics pipeline")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "ANALYTICS_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// Register configured sources without starting them.
    #[arg(long)]
    no_autostart: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = AnalyticsConfig::load_from(args.config.as_deref())?;

    let sink: Box<dyn EventSink> = if config.mqtt.enabled {
        Box::new(MqttSink::connect(&config.mqtt_settings()).context("MQTT sink")?)
    } else {
        log::info!("MQTT disabled, events go to the log");
        Box::new(LogSink)
    };
    let outbox: Box<dyn Outbox> = match &config.events.outbox_path {
        Some(path) => Box::new(
            SqliteOutbox::open(path, config.events.outbox_capacity)
                .with_context(|| format!("event outbox {}", path.display()))?,
        ),
        None => Box::new(InMemoryOutbox::new(config.events.outbox_capacity)),
    };

    let pipeline = Orchestrator::builder(config.orchestrator_settings())
        .sink(sink)
        .outbox(outbox)
        .build()?;

    for source in &config.sources {
        pipeline
            .add_source(source.spec())
            .map_err(|e| anyhow!("source {}: {}", source.id, e))?;
        if source.autostart && !args.no_autostart {
            pipeline
                .start_source(&source.id)
                .map_err(|e| anyhow!("source {}: {}", source.id, e))?;
        }
    }
    log::info!(
        "analyticsd running: {} sources, backend {}, {} workers",
        config.sources.len(),
        config.detection.backend,
        config.detection.workers
    );

    let (tx, rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("error setting Ctrl-C handler")?;

    loop {
        match rx.recv_timeout(HEALTH_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => log_health(&pipeline, &config),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("shutdown signal received, stopping pipeline...");
    pipeline.shutdown();
    Ok(())
}

fn log_health(pipeline: &Orchestrator, config: &AnalyticsConfig) {
    let stats = pipeline.stats();
    log::info!(
        "health: sources={} streams={} detect[submitted={} replaced={} evicted={} completed={} failed={} stale={} pending={}] events[delivered={} dropped={} pending={}]",
        stats.sources,
        stats.streams,
        stats.detection.submitted,
        stats.detection.replaced,
        stats.detection.evicted,
        stats.detection.completed,
        stats.detection.failed,
        stats.detection.stale,
        stats.detection.pending,
        stats.events.delivered,
        stats.events.dropped,
        stats.events.pending
    );

    for source in pipeline.sources() {
        log::debug!(
            "source {} state={} frames={} attempt={}",
            source.id,
            source.state,
            source.frames_captured,
            source.reconnect_attempt
        );
        if let Some(duration) = source.error_duration {
            if duration >= config.capture.error_alert_after {
                log::warn!(
                    "source {} failing for {}s (attempt {}): {}",
                    source.id,
                    duration.as_secs(),
                    source.reconnect_attempt,
                    source.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
}
