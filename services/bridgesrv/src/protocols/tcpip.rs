//! Generic TCP/IP stream adapter
//!
//! Event driven: every inbound chunk is decoded with the configured format
//! and published as one reading. Chunks are not reassembled, so a device
//! message split across TCP segments arrives as several readings. Protocols
//! that need framing need their own adapter.

pub mod link;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gridlink_model::{DeviceIdentity, FieldValue, Reading};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::bridge::ProtocolBridge;
use crate::error::{BridgeError, ErrorExt, Result};
use crate::protocols::{param_str, AdapterCore, DeviceAdapter, DeviceInfo, PeriodicTask};
use crate::runtime::reconnect::{Connector, ReconnectPolicy};
use crate::storage::ReadingSink;

pub use link::{
    EchoStream, StreamEvent, StreamEventReceiver, StreamEvents, StreamLink, TcpStreamLink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Hex,
    Ascii,
    #[default]
    Utf8,
    Json,
}

impl DataFormat {
    /// Decode one received chunk into native fields
    pub fn decode(&self, data: &[u8]) -> Result<Reading> {
        let mut reading = Reading::new();
        match self {
            Self::Hex => reading.insert("data", hex::encode(data)),
            Self::Ascii => {
                let text: String = data
                    .iter()
                    .map(|b| if b.is_ascii() { *b as char } else { '?' })
                    .collect();
                reading.insert("data", text);
            },
            Self::Utf8 => reading.insert("data", String::from_utf8_lossy(data).into_owned()),
            Self::Json => {
                let value: serde_json::Value = serde_json::from_slice(data)
                    .protocol_error("Invalid JSON payload")?;
                match value {
                    serde_json::Value::Object(map) => flatten_into(&mut reading.fields, "", &map),
                    other => {
                        if let Some(field) = FieldValue::from_json(&other) {
                            reading.insert("data", field);
                        }
                    },
                }
            },
        }
        reading.insert("length", data.len() as f64);
        Ok(reading)
    }

    /// Encode outbound text
    pub fn encode(&self, text: &str) -> Result<Bytes> {
        match self {
            Self::Hex => {
                let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                hex::decode(&compact)
                    .map(Bytes::from)
                    .map_err(|e| BridgeError::validation(format!("Invalid hex '{text}': {e}")))
            },
            Self::Ascii if !text.is_ascii() => Err(BridgeError::validation(format!(
                "'{text}' is not ASCII"
            ))),
            Self::Json => {
                serde_json::from_str::<serde_json::Value>(text).map_err(|e| {
                    BridgeError::validation(format!("Invalid JSON '{text}': {e}"))
                })?;
                Ok(Bytes::copy_from_slice(text.as_bytes()))
            },
            Self::Ascii | Self::Utf8 => Ok(Bytes::copy_from_slice(text.as_bytes())),
        }
    }
}

/// Nested objects become dotted field names
fn flatten_into(
    fields: &mut BTreeMap<String, FieldValue>,
    prefix: &str,
    map: &serde_json::Map<String, serde_json::Value>,
) {
    for (key, value) in map {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            serde_json::Value::Object(inner) => flatten_into(fields, &name, inner),
            other => {
                if let Some(field) = FieldValue::from_json(other) {
                    fields.insert(name, field);
                }
            },
        }
    }
}

/// Substitute `{name}` placeholders from `params`
fn render_template(template: &str, params: &serde_json::Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            BridgeError::validation(format!("Unclosed placeholder in '{template}'"))
        })?;
        let key = &after[..end];
        let value = params.get(key).filter(|v| !v.is_null()).ok_or_else(|| {
            BridgeError::validation(format!("Missing template parameter '{key}'"))
        })?;
        match value {
            serde_json::Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpParams {
    pub host: String,
    pub port: u16,
    pub format: DataFormat,
    pub connect_timeout_ms: u64,
    /// Named command templates for `execute`
    pub commands: BTreeMap<String, String>,
}

impl Default for TcpParams {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            format: DataFormat::default(),
            connect_timeout_ms: 5000,
            commands: BTreeMap::new(),
        }
    }
}

impl TcpParams {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let params: Self = if value.is_null() {
            Self::default()
        } else {
            serde_json::from_value(value.clone())
                .config_error("Invalid TCP parameters")?
        };
        if params.host.trim().is_empty() {
            return Err(BridgeError::config("TCP host is empty"));
        }
        if params.port == 0 {
            return Err(BridgeError::config("TCP port must be non-zero"));
        }
        Ok(params)
    }
}

struct LinkConnector {
    link: Arc<dyn StreamLink>,
    events: StreamEvents,
    /// Bumped on every open and close; events of older links are stale
    epoch: Arc<AtomicU64>,
}

#[async_trait]
impl Connector for LinkConnector {
    async fn connect_link(&self) -> Result<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.link.open(self.events.with_epoch(epoch)).await
    }

    async fn disconnect_link(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.link.close().await;
    }
}

struct Inner {
    core: AdapterCore,
    link: Arc<dyn StreamLink>,
    params: TcpParams,
    events: tokio::sync::Mutex<StreamEventReceiver>,
    epoch: Arc<AtomicU64>,
    last_reading: Mutex<Option<Reading>>,
}

pub struct TcpAdapter {
    inner: Arc<Inner>,
}

impl TcpAdapter {
    pub fn new(
        name: impl Into<String>,
        bridge: Arc<ProtocolBridge>,
        sink: Arc<dyn ReadingSink>,
        policy: ReconnectPolicy,
        params: TcpParams,
        link: Arc<dyn StreamLink>,
    ) -> Self {
        let (tx, rx) = StreamEvents::channel();
        let epoch = Arc::new(AtomicU64::new(0));
        let connector = Arc::new(LinkConnector {
            link: Arc::clone(&link),
            events: tx,
            epoch: Arc::clone(&epoch),
        });
        Self {
            inner: Arc::new(Inner {
                core: AdapterCore::new(name, bridge, sink, policy, connector),
                link,
                params,
                events: tokio::sync::Mutex::new(rx),
                epoch,
                last_reading: Mutex::new(None),
            }),
        }
    }

    fn consumer_task(&self) -> PeriodicTask {
        let inner = Arc::clone(&self.inner);
        PeriodicTask::spawn_with_token(
            format!("tcp-consumer-{}", inner.core.identity.device_id),
            move |token| async move { inner.consume(token).await },
        )
    }
}

impl Inner {
    async fn consume(&self, token: CancellationToken) {
        let mut events = self.events.lock().await;
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return,
                event = events.recv() => event,
            };
            let Some((epoch, event)) = event else {
                return;
            };
            if epoch != self.epoch.load(Ordering::SeqCst) {
                debug!("{} dropped event of closed link #{}", self.core.identity, epoch);
                continue;
            }
            match event {
                StreamEvent::Data(data) => self.on_data(&data).await,
                StreamEvent::Closed(reason) => {
                    self.core.controller.handle_link_failure(&reason).await;
                },
            }
        }
    }

    async fn on_data(&self, data: &[u8]) {
        let reading = match self.params.format.decode(data) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("{} dropped {} bytes: {}", self.core.identity, data.len(), e);
                return;
            },
        };
        *self.last_reading.lock() = Some(reading.clone());
        if let Err(e) = self.core.publish_reading(&reading).await {
            warn!("{} reading not published: {}", self.core.identity, e);
        }
    }

    async fn send_text(&self, text: &str) -> Result<usize> {
        self.core.ensure_connected()?;
        let payload = self.params.format.encode(text)?;
        let length = payload.len();
        if let Err(e) = self.link.send(payload).await {
            self.core.report_error("send", &e).await;
            return Err(e);
        }
        debug!("{} sent {} bytes", self.core.identity, length);
        Ok(length)
    }
}

#[async_trait]
impl DeviceAdapter for TcpAdapter {
    fn identity(&self) -> DeviceIdentity {
        self.inner.core.identity
    }

    fn name(&self) -> &str {
        &self.inner.core.name
    }

    fn bridge(&self) -> &Arc<ProtocolBridge> {
        &self.inner.core.bridge
    }

    fn is_connected(&self) -> bool {
        self.inner.core.is_connected()
    }

    async fn connect(&self) -> Result<()> {
        self.inner.core.start_tasks(|| vec![self.consumer_task()]);
        self.inner.core.controller.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.core.stop_tasks().await;
        self.inner.core.controller.disconnect().await
    }

    /// Most recent decoded message
    async fn read_data(&self) -> Result<Reading> {
        self.inner.core.ensure_connected()?;
        self.inner
            .last_reading
            .lock()
            .clone()
            .ok_or_else(|| BridgeError::data("No data received yet"))
    }

    /// `{"data": text}` encoded with the configured format
    async fn write_data(&self, params: &serde_json::Value) -> Result<()> {
        let text = match params.get("data") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) if !other.is_null() && self.inner.params.format == DataFormat::Json => {
                other.to_string()
            },
            _ => return Err(BridgeError::validation("Missing string parameter 'data'")),
        };
        self.inner.send_text(&text).await.map(|_| ())
    }

    async fn execute_command(
        &self,
        command: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        match command {
            "send" => {
                let text = param_str(params, "data")?;
                let sent = self.inner.send_text(text).await?;
                Ok(json!({ "sent": sent }))
            },
            "execute" => {
                let name = param_str(params, "name")?;
                let template = self.inner.params.commands.get(name).ok_or_else(|| {
                    BridgeError::validation(format!("Unknown command template '{name}'"))
                })?;
                let args = params.get("params").cloned().unwrap_or(json!({}));
                let text = render_template(template, &args)?;
                let sent = self.inner.send_text(&text).await?;
                Ok(json!({ "command": name, "payload": text, "sent": sent }))
            },
            "read" => {
                let reading = self.read_data().await?;
                self.inner.core.read_command(reading).await
            },
            other => Err(BridgeError::validation(format!(
                "Unsupported TCP command '{other}'"
            ))),
        }
    }

    fn device_info(&self) -> DeviceInfo {
        let params = &self.inner.params;
        self.inner.core.info(json!({
            "host": params.host,
            "port": params.port,
            "format": params.format,
            "commands": params.commands.keys().collect::<Vec<_>>(),
        }))
    }
}

/// Real TCP link for the given parameters
pub fn tcp_link(params: &TcpParams) -> TcpStreamLink {
    TcpStreamLink::new(
        params.host.clone(),
        params.port,
        Duration::from_millis(params.connect_timeout_ms),
    )
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::core::bridge::BridgePolicy;
    use crate::core::mapping::MappingEngine;
    use crate::storage::NullSink;
    use gridlink_model::{DeviceType, Protocol};

    #[test]
    fn test_decode_formats() {
        let reading = DataFormat::Hex.decode(&[0x01, 0xab]).unwrap();
        assert_eq!(reading.get("data").unwrap().as_str(), Some("01ab"));
        assert_eq!(reading.get_f64("length"), Some(2.0));

        let reading = DataFormat::Ascii.decode(&[b'o', b'k', 0xff]).unwrap();
        assert_eq!(reading.get("data").unwrap().as_str(), Some("ok?"));

        let reading = DataFormat::Json
            .decode(br#"{"power": 1500, "meta": {"phase": "L1"}, "ok": true}"#)
            .unwrap();
        assert_eq!(reading.get_f64("power"), Some(1500.0));
        assert_eq!(reading.get("meta.phase").unwrap().as_str(), Some("L1"));
        assert_eq!(reading.get("ok"), Some(&FieldValue::Bool(true)));

        assert!(DataFormat::Json.decode(b"{not json").is_err());
    }

    #[test]
    fn test_encode_formats() {
        assert_eq!(
            DataFormat::Hex.encode("01 AB ff").unwrap(),
            Bytes::from_static(&[0x01, 0xab, 0xff])
        );
        assert!(DataFormat::Hex.encode("0g").unwrap_err().is_validation());
        assert!(DataFormat::Ascii.encode("grüß").unwrap_err().is_validation());
        assert!(DataFormat::Json.encode("{").unwrap_err().is_validation());
    }

    #[test]
    fn test_render_template() {
        let params = json!({"channel": 2, "state": "on"});
        assert_eq!(
            render_template("SET {channel} {state}\r\n", &params).unwrap(),
            "SET 2 on\r\n"
        );
        assert!(render_template("SET {missing}", &params)
            .unwrap_err()
            .is_validation());
        assert!(render_template("SET {channel", &params)
            .unwrap_err()
            .is_validation());
    }

    fn adapter(bus: Arc<MemoryBus>, link: Arc<EchoStream>, format: DataFormat) -> TcpAdapter {
        let identity = DeviceIdentity::new(55, DeviceType::Meter, Protocol::Tcpip);
        let bridge = Arc::new(ProtocolBridge::new(
            identity,
            bus,
            MappingEngine::for_device_type(DeviceType::Meter),
            BridgePolicy::default(),
        ));
        let mut commands = BTreeMap::new();
        commands.insert("relay".to_string(), "SET {channel} {state}".to_string());
        commands.insert("status".to_string(), "STATUS".to_string());
        TcpAdapter::new(
            "meter-55",
            bridge,
            Arc::new(NullSink),
            ReconnectPolicy::default(),
            TcpParams {
                format,
                commands,
                ..TcpParams::default()
            },
            link,
        )
    }

    #[tokio::test]
    async fn test_inbound_json_is_published() {
        let bus = Arc::new(MemoryBus::new());
        let link = Arc::new(EchoStream::new());
        let adapter = adapter(bus.clone(), link.clone(), DataFormat::Json);
        adapter.connect().await.unwrap();

        assert!(link.inject(Bytes::from_static(
            br#"{"energy_wh": 125000, "power_watts": 900}"#
        )));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reading = adapter.read_data().await.unwrap();
        assert_eq!(reading.get_f64("energy_wh"), Some(125000.0));
        let meter = bus.retained("meter/55/reading").unwrap();
        let body: serde_json::Value = meter.json().unwrap();
        assert_eq!(body["energy"].as_f64(), Some(125.0));

        adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_and_unknown_template() {
        let bus = Arc::new(MemoryBus::new());
        let link = Arc::new(EchoStream::new());
        link.set_echo(false);
        let adapter = adapter(bus, link.clone(), DataFormat::Utf8);
        adapter.connect().await.unwrap();

        let result = adapter
            .execute_command("execute", &json!({"name": "status"}))
            .await
            .unwrap();
        assert_eq!(result["sent"], 6);
        assert_eq!(link.sent(), vec![Bytes::from_static(b"STATUS")]);

        let result = adapter
            .execute_command(
                "execute",
                &json!({"name": "relay", "params": {"channel": 2, "state": "on"}}),
            )
            .await
            .unwrap();
        assert_eq!(result["payload"], "SET 2 on");

        let err = adapter
            .execute_command("execute", &json!({"name": "reboot"}))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = adapter.read_data().await.unwrap_err();
        assert!(matches!(err, BridgeError::DataError(_)));

        adapter.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_triggers_reconnect() {
        let bus = Arc::new(MemoryBus::new());
        let link = Arc::new(EchoStream::new());
        let adapter = adapter(bus, link.clone(), DataFormat::Utf8);
        adapter.connect().await.unwrap();

        link.drop_link("peer reset");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!adapter.is_connected());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(adapter.is_connected());
        assert!(link.is_open());
        assert_eq!(
            adapter.device_info().lifecycle.stats.link_failures,
            1
        );

        adapter.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_of_previous_link_spares_new_one() {
        let bus = Arc::new(MemoryBus::new());
        let link = Arc::new(EchoStream::new());
        let adapter = adapter(bus.clone(), link.clone(), DataFormat::Utf8);
        adapter.connect().await.unwrap();

        // peer closes, then the device is restarted before the event is consumed
        link.drop_link("peer reset");
        adapter.disconnect().await.unwrap();
        adapter.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(adapter.is_connected());
        assert!(link.is_open());
        assert!(!adapter.device_info().lifecycle.retry_pending);
        let last = bus.published_on("devices/55/status").pop().unwrap();
        let last: serde_json::Value = last.json().unwrap();
        assert_eq!(last["status"], "online");

        // traffic of the new link still flows
        assert!(link.inject(Bytes::from_static(b"hello")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let reading = adapter.read_data().await.unwrap();
        assert_eq!(reading.get("data").unwrap().as_str(), Some("hello"));

        adapter.disconnect().await.unwrap();
    }
}
