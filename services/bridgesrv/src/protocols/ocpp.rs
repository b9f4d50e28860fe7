//! OCPP charge point adapter
//!
//! Session oriented: charging is controlled through start/stop transaction
//! commands, and a sampling task reports meter values for every active
//! transaction on the connector's session topic. Charger status is
//! `charging` while any connector has an active transaction, otherwise
//! `available`.

pub mod link;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use gridlink_model::{DeviceIdentity, Reading};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::core::bridge::ProtocolBridge;
use crate::error::{BridgeError, ErrorExt, Result};
use crate::protocols::{param_str, param_u32, AdapterCore, DeviceAdapter, DeviceInfo, PeriodicTask};
use crate::runtime::reconnect::{Connector, ReconnectPolicy};
use crate::storage::ReadingSink;

pub use link::{ChargePointLink, SimulatedChargePoint};
pub use session::{Transaction, TransactionBook, TransactionStatus};

const DEFAULT_ID_TAG: &str = "REMOTE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcppParams {
    /// Central system endpoint the charge point is reached through
    pub endpoint: String,
    pub charge_point_id: String,
    pub connectors: u32,
    pub meter_interval_ms: u64,
    /// Charging power of the simulated charge point
    pub max_power_w: f64,
}

impl Default for OcppParams {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9000/ocpp".to_string(),
            charge_point_id: "CP001".to_string(),
            connectors: 2,
            meter_interval_ms: 10_000,
            max_power_w: 11_000.0,
        }
    }
}

impl OcppParams {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let params: Self = if value.is_null() {
            Self::default()
        } else {
            serde_json::from_value(value.clone())
                .config_error("Invalid OCPP parameters")?
        };
        if params.connectors == 0 {
            return Err(BridgeError::config("connectors must be at least 1"));
        }
        if params.meter_interval_ms == 0 {
            return Err(BridgeError::config("meter_interval_ms must be positive"));
        }
        if params.charge_point_id.trim().is_empty() {
            return Err(BridgeError::config("charge_point_id is empty"));
        }
        Ok(params)
    }
}

struct LinkConnector {
    link: Arc<dyn ChargePointLink>,
}

#[async_trait]
impl Connector for LinkConnector {
    async fn connect_link(&self) -> Result<()> {
        self.link.open().await
    }

    async fn disconnect_link(&self) {
        self.link.close().await;
    }
}

struct Inner {
    core: AdapterCore,
    link: Arc<dyn ChargePointLink>,
    params: OcppParams,
    book: Mutex<TransactionBook>,
    /// Serializes start/stop so the one-per-connector check and the
    /// remote call happen atomically
    ops: tokio::sync::Mutex<()>,
}

pub struct OcppAdapter {
    inner: Arc<Inner>,
}

impl OcppAdapter {
    pub fn new(
        name: impl Into<String>,
        bridge: Arc<ProtocolBridge>,
        sink: Arc<dyn ReadingSink>,
        policy: ReconnectPolicy,
        params: OcppParams,
        link: Arc<dyn ChargePointLink>,
    ) -> Self {
        let connector = Arc::new(LinkConnector {
            link: Arc::clone(&link),
        });
        Self {
            inner: Arc::new(Inner {
                core: AdapterCore::new(name, bridge, sink, policy, connector),
                link,
                params,
                book: Mutex::new(TransactionBook::new()),
                ops: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Start charging on a connector
    ///
    /// Returns `Ok(None)` when the connector already has an active transaction.
    pub async fn start_transaction(
        &self,
        connector_id: u32,
        id_tag: &str,
    ) -> Result<Option<Transaction>> {
        self.inner.start_transaction(connector_id, id_tag).await
    }

    /// Stop charging on a connector; `Ok(None)` when nothing was active
    pub async fn stop_transaction(&self, connector_id: u32) -> Result<Option<Transaction>> {
        self.inner.stop_transaction(connector_id).await
    }

    pub fn active_transaction(&self, connector_id: u32) -> Option<Transaction> {
        self.inner.book.lock().active(connector_id).cloned()
    }

    pub fn completed_transactions(&self) -> Vec<Transaction> {
        self.inner.book.lock().completed().cloned().collect()
    }

    fn meter_task(&self) -> PeriodicTask {
        let inner = Arc::clone(&self.inner);
        PeriodicTask::spawn(
            format!("ocpp-meter-{}", inner.core.identity.device_id),
            Duration::from_millis(inner.params.meter_interval_ms),
            move || {
                let inner = Arc::clone(&inner);
                async move { inner.sample_meters().await }
            },
        )
    }
}

impl Inner {
    fn check_connector(&self, connector_id: u32) -> Result<()> {
        if connector_id == 0 || connector_id > self.params.connectors {
            return Err(BridgeError::validation(format!(
                "Connector {connector_id} out of range 1..={}",
                self.params.connectors
            )));
        }
        Ok(())
    }

    /// Run a link call, routing connection-class failures to the controller
    async fn link_call<T>(
        &self,
        context: &str,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let result = call.await;
        if let Err(e) = &result {
            self.core.report_error(context, e).await;
        }
        result
    }

    async fn start_transaction(
        &self,
        connector_id: u32,
        id_tag: &str,
    ) -> Result<Option<Transaction>> {
        self.check_connector(connector_id)?;
        self.core.ensure_connected()?;
        let _ops = self.ops.lock().await;

        if let Some(active) = self.book.lock().active(connector_id) {
            warn!(
                "{} connector {} busy with transaction {}",
                self.core.identity, connector_id, active.id
            );
            return Ok(None);
        }

        let meter_start = self
            .link_call("meter", self.link.meter_value(connector_id))
            .await?;
        self.link_call("remote start", self.link.remote_start(connector_id, id_tag))
            .await?;

        let transaction = self
            .book
            .lock()
            .begin(connector_id, id_tag, meter_start, Utc::now());
        if let Some(transaction) = &transaction {
            info!(
                "{} transaction {} started on connector {}",
                self.core.identity, transaction.id, connector_id
            );
            self.publish_session(connector_id, "started", transaction, meter_start)
                .await;
        }
        Ok(transaction)
    }

    async fn stop_transaction(&self, connector_id: u32) -> Result<Option<Transaction>> {
        self.check_connector(connector_id)?;
        self.core.ensure_connected()?;
        let _ops = self.ops.lock().await;

        if self.book.lock().active(connector_id).is_none() {
            return Ok(None);
        }

        // meterStop is taken before the stop request, so once the charge point
        // has stopped nothing can fail before the book is closed
        let meter_stop = self
            .link_call("meter", self.link.meter_value(connector_id))
            .await?;
        self.link_call("remote stop", self.link.remote_stop(connector_id))
            .await?;

        let transaction = self
            .book
            .lock()
            .finish(connector_id, meter_stop, Utc::now());
        if let Some(transaction) = &transaction {
            info!(
                "{} transaction {} stopped, {:.1} Wh",
                self.core.identity,
                transaction.id,
                transaction.energy_wh(meter_stop)
            );
            self.publish_session(connector_id, "stopped", transaction, meter_stop)
                .await;
        }
        Ok(transaction)
    }

    async fn publish_session(
        &self,
        connector_id: u32,
        event: &str,
        transaction: &Transaction,
        meter_wh: f64,
    ) {
        let session = json!({
            "event": event,
            "transactionId": transaction.id,
            "connectorId": connector_id,
            "idTag": transaction.id_tag,
            "status": transaction.status,
            "startTime": transaction.start_time,
            "meterWh": meter_wh,
            "energyWh": transaction.energy_wh(meter_wh),
        });
        if let Err(e) = self.core.bridge.bridge_session(connector_id, session).await {
            warn!("{} session update not published: {}", self.core.identity, e);
        }
    }

    /// Meter update for each active transaction, then a telemetry reading
    async fn sample_meters(&self) {
        if !self.core.is_connected() {
            return;
        }
        let active: Vec<Transaction> = self.book.lock().active_transactions().cloned().collect();
        for transaction in &active {
            match self.link.meter_value(transaction.connector_id).await {
                Ok(meter) => {
                    self.publish_session(transaction.connector_id, "meter", transaction, meter)
                        .await;
                },
                Err(e) => {
                    self.core.report_error("meter sample", &e).await;
                    return;
                },
            }
        }

        match self.read_all().await {
            Ok(reading) => {
                if let Err(e) = self.core.publish_reading(&reading).await {
                    warn!("{} reading not published: {}", self.core.identity, e);
                }
            },
            Err(e) => self.core.report_error("meter sample", &e).await,
        }
    }

    async fn read_all(&self) -> Result<Reading> {
        let mut reading = Reading::new();
        let mut total = 0.0;
        for connector_id in 1..=self.params.connectors {
            let meter = self.link.meter_value(connector_id).await?;
            let status = if self.book.lock().active(connector_id).is_some() {
                "Charging"
            } else {
                "Available"
            };
            reading.insert(format!("connector_{connector_id}_status"), status);
            reading.insert(format!("connector_{connector_id}_energy_wh"), meter);
            total += meter;
        }

        let book = self.book.lock();
        let status = if book.is_charging() {
            "charging"
        } else {
            "available"
        };
        reading.insert("status", status);
        reading.insert("active_transactions", book.active_count() as f64);
        reading.insert("total_energy_wh", total);
        Ok(reading)
    }

    fn status_report(&self) -> serde_json::Value {
        let book = self.book.lock();
        let connectors: Vec<serde_json::Value> = (1..=self.params.connectors)
            .map(|connector_id| {
                let transaction = book.active(connector_id);
                json!({
                    "connectorId": connector_id,
                    "status": if transaction.is_some() { "Charging" } else { "Available" },
                    "transaction": transaction,
                })
            })
            .collect();
        json!({
            "status": if book.is_charging() { "charging" } else { "available" },
            "activeTransactions": book.active_count(),
            "connectors": connectors,
        })
    }
}

fn transaction_result(transaction: Option<Transaction>, busy: String) -> Result<serde_json::Value> {
    let transaction = transaction.ok_or_else(|| BridgeError::validation(busy))?;
    Ok(serde_json::to_value(transaction)?)
}

#[async_trait]
impl DeviceAdapter for OcppAdapter {
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
        let result = self.inner.core.controller.connect().await;
        self.inner.core.start_tasks(|| vec![self.meter_task()]);
        result
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.core.stop_tasks().await;
        self.inner.core.controller.disconnect().await
    }

    async fn read_data(&self) -> Result<Reading> {
        self.inner.core.ensure_connected()?;
        self.inner.link_call("read", self.inner.read_all()).await
    }

    /// ChangeConfiguration: `{"key": k, "value": v}`
    async fn write_data(&self, params: &serde_json::Value) -> Result<()> {
        self.inner.core.ensure_connected()?;
        let key = param_str(params, "key")?;
        let value = match params.get("value") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => return Err(BridgeError::validation("Missing parameter 'value'")),
        };
        self.inner
            .link_call(
                "change configuration",
                self.inner.link.change_configuration(key, &value),
            )
            .await?;
        debug!("{} configuration {} = {}", self.inner.core.identity, key, value);
        Ok(())
    }

    async fn execute_command(
        &self,
        command: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        match command {
            "start_transaction" => {
                let connector_id = param_u32(params, "connectorId")?;
                let id_tag = params
                    .get("idTag")
                    .and_then(|v| v.as_str())
                    .unwrap_or(DEFAULT_ID_TAG);
                let transaction = self.start_transaction(connector_id, id_tag).await?;
                transaction_result(
                    transaction,
                    format!("Connector {connector_id} already has an active transaction"),
                )
            },
            "stop_transaction" => {
                let connector_id = param_u32(params, "connectorId")?;
                let transaction = self.stop_transaction(connector_id).await?;
                transaction_result(
                    transaction,
                    format!("Connector {connector_id} has no active transaction"),
                )
            },
            "get_status" => Ok(self.inner.status_report()),
            "change_configuration" => {
                self.write_data(params).await?;
                Ok(json!({ "accepted": true }))
            },
            "read" => {
                let reading = self.read_data().await?;
                self.inner.core.read_command(reading).await
            },
            other => Err(BridgeError::validation(format!(
                "Unsupported OCPP command '{other}'"
            ))),
        }
    }

    fn device_info(&self) -> DeviceInfo {
        let params = &self.inner.params;
        let mut details = self.inner.status_report();
        if let Some(map) = details.as_object_mut() {
            map.insert("endpoint".into(), json!(params.endpoint));
            map.insert("chargePointId".into(), json!(params.charge_point_id));
            map.insert(
                "completedTransactions".into(),
                json!(self.inner.book.lock().completed().count()),
            );
        }
        self.inner.core.info(details)
    }
}
