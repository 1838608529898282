use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::CaptureSettings;
use crate::detect::{DetectorSettings, PoolConfig};
use crate::dispatch::{DispatcherConfig, MqttSettings};
use crate::ingest::IngestOptions;
use crate::orchestrator::OrchestratorSettings;
use crate::registry::SourceSpec;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FRAME_SKIP: u32 = 1;
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_ERROR_ALERT_SECS: u64 = 300;
const DEFAULT_WORKERS: usize = 2;
const DEFAULT_QUEUE_CAPACITY: usize = 8;
const DEFAULT_BACKEND: &str = "motion";
const DEFAULT_CONFIDENCE: f32 = 0.4;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_TOPIC_PREFIX: &str = "video_analytics";
const DEFAULT_RETRY_BASE_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_MS: u64 = 60_000;
const DEFAULT_OUTBOX_CAPACITY: usize = 1_000;
const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Deserialize, Default)]
struct AnalyticsConfigFile {
    sources: Option<Vec<SourceConfigFile>>,
    capture: Option<CaptureConfigFile>,
    detection: Option<DetectionConfigFile>,
    events: Option<EventsConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize)]
struct SourceConfigFile {
    id: String,
    url: String,
    width: Option<u32>,
    height: Option<u32>,
    autostart: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    frame_skip: Option<u32>,
    target_fps: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    loop_files: Option<bool>,
    error_alert_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    backend: Option<String>,
    confidence: Option<f32>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    heatmap: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsConfigFile {
    channel_capacity: Option<usize>,
    topic_prefix: Option<String>,
    retry_base_ms: Option<u64>,
    retry_max_ms: Option<u64>,
    outbox_capacity: Option<usize>,
    outbox_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    enabled: Option<bool>,
    broker: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    ca_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub sources: Vec<SourceConfig>,
    pub capture: CaptureConfig,
    pub detection: DetectionConfig,
    pub events: EventsConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub id: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub autostart: bool,
}

impl SourceConfig {
    pub fn spec(&self) -> SourceSpec {
        SourceSpec::new(self.id.as_str(), self.url.as_str(), self.width, self.height)
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub frame_skip: u32,
    pub target_fps: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub loop_files: bool,
    pub error_alert_after: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub backend: String,
    pub confidence: f32,
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub heatmap: bool,
}

#[derive(Debug, Clone)]
pub struct EventsConfig {
    pub channel_capacity: usize,
    pub topic_prefix: String,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub outbox_capacity: usize,
    pub outbox_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
}

impl AnalyticsConfig {
    /// Load from the file named by `ANALYTICS_CONFIG` (if any), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ANALYTICS_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with an explicit file taking the place of
    /// `ANALYTICS_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AnalyticsConfigFile) -> Result<Self> {
        let sources = file
            .sources
            .unwrap_or_default()
            .into_iter()
            .map(|source| SourceConfig {
                id: source.id,
                url: source.url,
                width: source.width.unwrap_or(DEFAULT_WIDTH),
                height: source.height.unwrap_or(DEFAULT_HEIGHT),
                autostart: source.autostart.unwrap_or(true),
            })
            .collect();

        let capture = file.capture.unwrap_or_default();
        let capture = CaptureConfig {
            frame_skip: capture.frame_skip.unwrap_or(DEFAULT_FRAME_SKIP),
            target_fps: capture.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            backoff_base: Duration::from_millis(
                capture.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS),
            ),
            backoff_max: Duration::from_millis(
                capture.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS),
            ),
            loop_files: capture.loop_files.unwrap_or(true),
            error_alert_after: Duration::from_secs(
                capture
                    .error_alert_after_secs
                    .unwrap_or(DEFAULT_ERROR_ALERT_SECS),
            ),
        };

        let detection = file.detection.unwrap_or_default();
        let detection = DetectionConfig {
            workers: detection.workers.unwrap_or(DEFAULT_WORKERS),
            queue_capacity: detection.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            backend: detection
                .backend
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            confidence: detection.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            model_path: detection.model_path,
            input_width: detection.input_width.unwrap_or(640),
            input_height: detection.input_height.unwrap_or(640),
            heatmap: detection.heatmap.unwrap_or(true),
        };

        let events = file.events.unwrap_or_default();
        let events = EventsConfig {
            channel_capacity: events.channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY),
            topic_prefix: events
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            retry_base: Duration::from_millis(
                events.retry_base_ms.unwrap_or(DEFAULT_RETRY_BASE_MS),
            ),
            retry_max: Duration::from_millis(events.retry_max_ms.unwrap_or(DEFAULT_RETRY_MAX_MS)),
            outbox_capacity: events.outbox_capacity.unwrap_or(DEFAULT_OUTBOX_CAPACITY),
            outbox_path: events.outbox_path,
        };

        let mqtt = file.mqtt.unwrap_or_default();
        let mqtt = MqttConfig {
            enabled: mqtt.enabled.unwrap_or(false),
            broker: mqtt.broker.unwrap_or_else(|| "localhost".to_string()),
            port: mqtt.port.unwrap_or(DEFAULT_MQTT_PORT),
            client_id: mqtt.client_id,
            username: mqtt.username,
            password: mqtt.password,
            use_tls: mqtt.use_tls.unwrap_or(false),
            ca_path: mqtt.ca_path,
            client_cert_path: mqtt.client_cert_path,
            client_key_path: mqtt.client_key_path,
        };

        Ok(Self {
            sources,
            capture,
            detection,
            events,
            mqtt,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(sources) = std::env::var("VIDEO_SOURCES") {
            for entry in split_csv(&sources) {
                let (id, url) = entry.split_once('=').ok_or_else(|| {
                    anyhow!("VIDEO_SOURCES entries must look like id=url, got '{}'", entry)
                })?;
                self.sources.push(SourceConfig {
                    id: id.trim().to_string(),
                    url: url.trim().to_string(),
                    width: DEFAULT_WIDTH,
                    height: DEFAULT_HEIGHT,
                    autostart: true,
                });
            }
        }
        if let Some(skip) = env_parse::<u32>("DETECTION_INTERVAL")? {
            self.capture.frame_skip = skip;
        }
        if let Some(backend) = env_string("DETECTION_MODEL") {
            self.detection.backend = backend;
        }
        if let Some(confidence) = env_parse::<f32>("DETECTION_CONFIDENCE")? {
            self.detection.confidence = confidence;
        }
        if let Some(heatmap) = env_bool("HEATMAP_ENABLED")? {
            self.detection.heatmap = heatmap;
        }
        if let Some(prefix) = env_string("MQTT_TOPIC_PREFIX") {
            self.events.topic_prefix = prefix;
        }
        if let Some(enabled) = env_bool("MQTT_ENABLED")? {
            self.mqtt.enabled = enabled;
        }
        if let Some(broker) = env_string("MQTT_BROKER") {
            self.mqtt.broker = broker;
        }
        if let Some(port) = env_parse::<u16>("MQTT_PORT")? {
            self.mqtt.port = port;
        }
        if let Some(username) = env_string("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = env_string("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(use_tls) = env_bool("MQTT_USE_TLS")? {
            self.mqtt.use_tls = use_tls;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.capture.frame_skip == 0 {
            return Err(anyhow!("capture.frame_skip must be at least 1"));
        }
        if self.capture.target_fps == 0 {
            return Err(anyhow!("capture.target_fps must be at least 1"));
        }
        if self.capture.backoff_base.is_zero() {
            return Err(anyhow!("capture.backoff_base_ms must be greater than zero"));
        }
        if self.capture.backoff_base > self.capture.backoff_max {
            return Err(anyhow!(
                "capture.backoff_base_ms must not exceed capture.backoff_max_ms"
            ));
        }
        if self.detection.workers == 0 {
            return Err(anyhow!("detection.workers must be at least 1"));
        }
        if self.detection.queue_capacity == 0 {
            return Err(anyhow!("detection.queue_capacity must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.detection.confidence) {
            return Err(anyhow!("detection.confidence must be within 0..=1"));
        }
        if self.events.retry_base > self.events.retry_max {
            return Err(anyhow!("events.retry_base_ms must not exceed events.retry_max_ms"));
        }
        if self.events.channel_capacity == 0 || self.events.outbox_capacity == 0 {
            return Err(anyhow!("event channel and outbox capacities must be at least 1"));
        }
        if self.mqtt.enabled && self.mqtt.broker.trim().is_empty() {
            return Err(anyhow!("mqtt.broker is required when MQTT is enabled"));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(anyhow!("source ids must not be empty"));
            }
            if source.url.trim().is_empty() {
                return Err(anyhow!("source {} has no url", source.id));
            }
            if source.width == 0 || source.height == 0 {
                return Err(anyhow!("source {} has zero resolution", source.id));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(anyhow!("duplicate source id {}", source.id));
            }
        }
        Ok(())
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            capture: CaptureSettings {
                frame_skip: self.capture.frame_skip,
                backoff_base: self.capture.backoff_base,
                backoff_max: self.capture.backoff_max,
            },
            ingest: IngestOptions {
                target_fps: self.capture.target_fps,
                loop_files: self.capture.loop_files,
            },
            pool: PoolConfig {
                workers: self.detection.workers,
                queue_capacity: self.detection.queue_capacity,
            },
            detector: DetectorSettings {
                confidence: self.detection.confidence,
                model_path: self.detection.model_path.clone(),
                input_width: self.detection.input_width,
                input_height: self.detection.input_height,
            },
            backend: self.detection.backend.clone(),
            heatmap: self.detection.heatmap,
            dispatcher: DispatcherConfig {
                channel_capacity: self.events.channel_capacity,
                topic_prefix: self.events.topic_prefix.clone(),
                retry_base: self.events.retry_base,
                retry_max: self.events.retry_max,
            },
            outbox_capacity: self.events.outbox_capacity,
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            broker: self.mqtt.broker.clone(),
            port: self.mqtt.port,
            client_id: self.mqtt.client_id.clone(),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
            use_tls: self.mqtt.use_tls,
            ca_path: self.mqtt.ca_path.clone(),
            client_cert_path: self.mqtt.client_cert_path.clone(),
            client_key_path: self.mqtt.client_key_path.clone(),
            topic_prefix: self.events.topic_prefix.clone(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<AnalyticsConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value: '{}'", key, value)),
        None => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match env_string(key).map(|value| value.to_ascii_lowercase()) {
        None => Ok(None),
        Some(value) => match value.as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(anyhow!("{} must be true or false, got '{}'", key, value)),
        },
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
