//! MQTT event sink (rumqttc, MQTT v5).
//!
//! The broker connection is driven by its own thread. While disconnected,
//! `publish` fails so the dispatcher keeps events in its outbox and retries.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;
use rumqttc::v5::mqttbytes::v5::{LastWill, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, MqttOptions};
use rumqttc::Transport;

use crate::capture::Backoff;
use crate::error::DispatchError;

use super::sink::EventSink;

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

#[derive(Clone, Debug, Default)]
pub struct MqttSettings {
    /// `host`, `host:port` or `mqtt(s)://host:port`.
    pub broker: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub topic_prefix: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct MqttEndpoint {
    host: String,
    port: u16,
    use_tls: bool,
}

#[derive(Clone, Debug, Default)]
struct TlsMaterials {
    ca: Option<Vec<u8>>,
    client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

pub struct MqttSink {
    client: Client,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    status_topic: String,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttSink {
    pub fn connect(settings: &MqttSettings) -> Result<Self, DispatchError> {
        let endpoint = parse_mqtt_endpoint(&settings.broker, settings.port, settings.use_tls)?;
        let tls = load_tls_materials(
            settings.ca_path.as_ref(),
            settings.client_cert_path.as_ref(),
            settings.client_key_path.as_ref(),
        )?;
        let client_id = settings.client_id.clone().unwrap_or_else(|| {
            let suffix: u32 = rand::thread_rng().gen();
            format!("video-analytics-{suffix:08x}")
        });
        let status_topic = format!("{}/status", settings.topic_prefix.trim_end_matches('/'));

        let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        let will = LastWill::new(
            status_topic.as_str(),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        );
        options.set_last_will(will);
        options.set_transport(build_transport(&endpoint, &tls)?);

        let (client, connection) = Client::new(options, 10);
        let connected = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection(
            connection,
            client.clone(),
            status_topic.clone(),
            Arc::clone(&connected),
            Arc::clone(&stopping),
        )?;

        log::info!(
            "MQTT sink targeting {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(Self {
            client,
            connected,
            stopping,
            status_topic,
            connection_handle: Some(handle),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn spawn_connection(
    mut connection: Connection,
    client: Client,
    status_topic: String,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, DispatchError> {
    std::thread::Builder::new()
        .name("mqtt-connection".to_string())
        .spawn(move || {
            let mut backoff = Backoff::from_millis(1_000, 60_000);
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff.reset();
                        connected.store(true, Ordering::SeqCst);
                        log::info!("MQTT connected");
                        if let Err(err) = client.try_publish(
                            status_topic.as_str(),
                            QoS::AtLeastOnce,
                            true,
                            PAYLOAD_ONLINE.as_bytes().to_vec(),
                        ) {
                            log::warn!("MQTT online status not queued: {}", err);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if stopping.load(Ordering::SeqCst) {
                            break;
                        }
                        let delay = backoff.next_delay();
                        if connected.swap(false, Ordering::SeqCst) {
                            log::warn!("MQTT connection lost: {} (retry in {:?})", err, delay);
                        } else {
                            log::debug!("MQTT connect failed: {} (retry in {:?})", err, delay);
                        }
                        if !sleep_unless_stopping(delay, &stopping) {
                            break;
                        }
                    }
                }
            }
        })
        .map_err(|err| DispatchError(format!("spawn MQTT connection thread: {err}")))
}

/// Returns false if `stopping` was raised before `delay` elapsed.
fn sleep_unless_stopping(delay: Duration, stopping: &AtomicBool) -> bool {
    let deadline = std::time::Instant::now() + delay;
    loop {
        if stopping.load(Ordering::SeqCst) {
            return false;
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

impl EventSink for MqttSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), DispatchError> {
        if !self.is_connected() {
            return Err(DispatchError("MQTT broker not connected".to_string()));
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(|err| DispatchError(format!("MQTT publish to {topic}: {err}")))
    }

    fn close(&mut self) {
        if self.is_connected() {
            let _ = self.client.try_publish(
                self.status_topic.as_str(),
                QoS::AtLeastOnce,
                true,
                PAYLOAD_OFFLINE.as_bytes().to_vec(),
            );
        }
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(err) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect: {}", err);
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        if self.connection_handle.is_some() {
            self.close();
        }
    }
}

fn parse_mqtt_endpoint(
    addr: &str,
    default_port: u16,
    tls_override: bool,
) -> Result<MqttEndpoint, DispatchError> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();
    if remainder.is_empty() {
        return Err(DispatchError("MQTT broker address is empty".to_string()));
    }

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(DispatchError(format!("unsupported MQTT scheme: {other}"))),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder, default_port)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16), DispatchError> {
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| DispatchError(format!("invalid MQTT port in {addr}")))
    };

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| DispatchError(format!("invalid MQTT address: {addr}")))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        // A bare IPv6 literal has more than one colon and no port.
        Some((host, _)) if host.contains(':') => Ok((addr.to_string(), default_port)),
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((addr.to_string(), default_port)),
    }
}

fn load_tls_materials(
    ca_path: Option<&PathBuf>,
    client_cert_path: Option<&PathBuf>,
    client_key_path: Option<&PathBuf>,
) -> Result<TlsMaterials, DispatchError> {
    let read = |path: &PathBuf, what: &str| {
        std::fs::read(path)
            .map_err(|err| DispatchError(format!("read MQTT TLS {what} {}: {err}", path.display())))
    };

    let ca = ca_path.map(|path| read(path, "CA")).transpose()?;
    let client_auth = match (client_cert_path, client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            Some((read(cert_path, "client cert")?, read(key_path, "client key")?))
        }
        (None, None) => None,
        _ => {
            return Err(DispatchError(
                "MQTT TLS client cert and key must be provided together".to_string(),
            ))
        }
    };

    Ok(TlsMaterials { ca, client_auth })
}

fn build_transport(endpoint: &MqttEndpoint, tls: &TlsMaterials) -> Result<Transport, DispatchError> {
    if !endpoint.use_tls {
        if tls.ca.is_some() || tls.client_auth.is_some() {
            return Err(DispatchError(
                "MQTT TLS materials provided but TLS is disabled".to_string(),
            ));
        }
        return Ok(Transport::tcp());
    }

    if tls.ca.is_none() && tls.client_auth.is_none() {
        return Ok(Transport::tls_with_default_config());
    }

    let ca = tls.ca.clone().ok_or_else(|| {
        DispatchError("MQTT TLS CA certificate is required with client certificates".to_string())
    })?;
    Ok(Transport::tls(ca, tls.client_auth.clone(), None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults_port_and_detects_tls_scheme() {
        let endpoint = parse_mqtt_endpoint("broker.local", 1883, false).unwrap();
        assert_eq!(endpoint.host, "broker.local");
        assert_eq!(endpoint.port, 1883);
        assert!(!endpoint.use_tls);

        let endpoint = parse_mqtt_endpoint("mqtts://broker.local:8883", 1883, false).unwrap();
        assert_eq!(endpoint.port, 8883);
        assert!(endpoint.use_tls);
    }

    #[test]
    fn endpoint_handles_ipv6() {
        let endpoint = parse_mqtt_endpoint("[::1]:1884", 1883, false).unwrap();
        assert_eq!((endpoint.host.as_str(), endpoint.port), ("::1", 1884));
        let endpoint = parse_mqtt_endpoint("::1", 1883, false).unwrap();
        assert_eq!((endpoint.host.as_str(), endpoint.port), ("::1", 1883));
    }

    #[test]
    fn endpoint_rejects_bad_input() {
        assert!(parse_mqtt_endpoint("ws://broker:1883", 1883, false).is_err());
        assert!(parse_mqtt_endpoint("broker:notaport", 1883, false).is_err());
        assert!(parse_mqtt_endpoint("  ", 1883, false).is_err());
    }

    #[test]
    fn tls_materials_must_match_transport() {
        let endpoint = parse_mqtt_endpoint("broker:1883", 1883, false).unwrap();
        let tls = TlsMaterials {
            ca: Some(b"ca".to_vec()),
            client_auth: None,
        };
        assert!(build_transport(&endpoint, &tls).is_err());

        let cert = PathBuf::from("/nonexistent/cert.pem");
        let err = load_tls_materials(None, Some(&cert), None).unwrap_err();
        assert!(err.0.contains("together"));
    }
}
