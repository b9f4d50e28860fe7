//! Adapter managers
//!
//! One `AdapterManager` per protocol family keeps the live adapters keyed by
//! device id. `DeviceRegistry` is the composition root that owns the managers
//! together with the factory registry and shared adapter context.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use gridlink_model::{DeviceId, ProtocolFamily};
use tracing::{debug, error, info, warn};

use crate::core::config::DeviceConfig;
use crate::error::{BridgeError, Result};
use crate::protocols::{AdapterContext, AdapterFactoryRegistry, DeviceAdapter, DeviceInfo};

pub struct AdapterManager {
    family: ProtocolFamily,
    adapters: DashMap<DeviceId, Arc<dyn DeviceAdapter>>,
}

impl AdapterManager {
    pub fn new(family: ProtocolFamily) -> Self {
        Self {
            family,
            adapters: DashMap::new(),
        }
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    /// Register and connect an adapter
    ///
    /// Returns `false` without touching anything when the id is already
    /// registered. A failed first connect is logged; the adapter stays
    /// registered and its controller keeps retrying.
    pub async fn add(&self, adapter: Arc<dyn DeviceAdapter>) -> Result<bool> {
        let identity = adapter.identity();
        if identity.protocol.family() != self.family {
            return Err(BridgeError::config(format!(
                "Dev{} speaks {}, not {}",
                identity.device_id, identity.protocol, self.family
            )));
        }

        match self.adapters.entry(identity.device_id) {
            Entry::Occupied(_) => {
                debug!("Dev{} already registered", identity.device_id);
                return Ok(false);
            },
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&adapter));
            },
        }

        if let Err(e) = adapter.connect().await {
            warn!("Dev{} initial connect failed: {}", identity.device_id, e);
        }
        info!("Dev{} added ({})", identity.device_id, adapter.name());
        Ok(true)
    }

    /// Disconnect, then evict
    pub async fn remove(&self, device_id: DeviceId) -> Result<()> {
        let adapter = self
            .get(device_id)
            .ok_or(BridgeError::DeviceNotFound(device_id))?;
        if let Err(e) = adapter.disconnect().await {
            warn!("Dev{} disconnect err: {}", device_id, e);
        }
        self.adapters.remove(&device_id);
        info!("Dev{} removed", device_id);
        Ok(())
    }

    pub fn get(&self, device_id: DeviceId) -> Option<Arc<dyn DeviceAdapter>> {
        self.adapters.get(&device_id).map(|a| Arc::clone(a.value()))
    }

    pub fn contains(&self, device_id: DeviceId) -> bool {
        self.adapters.contains_key(&device_id)
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.adapters.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.adapters.iter().filter(|e| e.is_connected()).count()
    }

    /// Disconnect every adapter concurrently and clear the map
    pub async fn shutdown(&self) {
        let adapters: Vec<(DeviceId, Arc<dyn DeviceAdapter>)> = self
            .adapters
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        if adapters.is_empty() {
            return;
        }

        let results = join_all(adapters.iter().map(|(_, adapter)| adapter.disconnect())).await;
        for ((device_id, _), result) in adapters.iter().zip(results) {
            if let Err(e) = result {
                error!("Dev{} shutdown err: {}", device_id, e);
            }
            self.adapters.remove(device_id);
        }
        info!("{} manager stopped {} adapter(s)", self.family, adapters.len());
    }
}

/// Every device of the process, across protocol families
pub struct DeviceRegistry {
    factories: AdapterFactoryRegistry,
    context: AdapterContext,
    managers: HashMap<ProtocolFamily, AdapterManager>,
    /// Ids with an add in flight, claimed before the adapter is built
    pending: DashMap<DeviceId, ProtocolFamily>,
}

/// Releases a pending id however the add ends
struct PendingAdd<'a> {
    pending: &'a DashMap<DeviceId, ProtocolFamily>,
    device_id: DeviceId,
}

impl Drop for PendingAdd<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.device_id);
    }
}

impl DeviceRegistry {
    pub fn new(factories: AdapterFactoryRegistry, context: AdapterContext) -> Self {
        let managers = ProtocolFamily::ALL
            .iter()
            .map(|family| (*family, AdapterManager::new(*family)))
            .collect();
        Self {
            factories,
            context,
            managers,
            pending: DashMap::new(),
        }
    }

    pub fn factories(&self) -> &AdapterFactoryRegistry {
        &self.factories
    }

    pub fn context(&self) -> &AdapterContext {
        &self.context
    }

    pub fn manager(&self, family: ProtocolFamily) -> Option<&AdapterManager> {
        self.managers.get(&family)
    }

    fn manager_for(&self, family: ProtocolFamily) -> Result<&AdapterManager> {
        self.manager(family)
            .ok_or_else(|| BridgeError::internal(format!("No manager for {family}")))
    }

    /// Build the device's adapter and register it
    ///
    /// Idempotent on the device id, across families. Concurrent adds of one
    /// id race for a pending slot; the loser returns `false`.
    pub async fn add_device(&self, config: &DeviceConfig) -> Result<bool> {
        let family = config.protocol.family();
        let _claim = match self.pending.entry(config.id) {
            Entry::Occupied(slot) => {
                debug!("Dev{} add already in flight ({}), skipping", config.id, slot.get());
                return Ok(false);
            },
            // checked under the slot lock so a finished add is seen
            Entry::Vacant(_) if self.contains(config.id) => {
                debug!("Dev{} already registered, skipping", config.id);
                return Ok(false);
            },
            Entry::Vacant(slot) => {
                slot.insert(family);
                PendingAdd {
                    pending: &self.pending,
                    device_id: config.id,
                }
            },
        };
        let adapter = self.factories.create(config, &self.context).await?;
        self.manager_for(config.protocol.family())?
            .add(adapter)
            .await
    }

    pub async fn remove_device(&self, device_id: DeviceId) -> Result<()> {
        match self.managers.values().find(|m| m.contains(device_id)) {
            Some(manager) => manager.remove(device_id).await,
            None => Err(BridgeError::DeviceNotFound(device_id)),
        }
    }

    pub fn get(&self, device_id: DeviceId) -> Option<Arc<dyn DeviceAdapter>> {
        self.managers.values().find_map(|m| m.get(device_id))
    }

    pub fn contains(&self, device_id: DeviceId) -> bool {
        self.managers.values().any(|m| m.contains(device_id))
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.managers.values().flat_map(|m| m.device_ids()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn device_infos(&self) -> Vec<DeviceInfo> {
        self.device_ids()
            .into_iter()
            .filter_map(|id| self.get(id))
            .map(|adapter| adapter.device_info())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.managers.values().map(AdapterManager::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down all managers concurrently
    pub async fn shutdown(&self) {
        info!("Shutting down {} device(s)", self.len());
        join_all(self.managers.values().map(AdapterManager::shutdown)).await;
    }

    /// Number of adds still building or connecting
    pub fn pending_adds(&self) -> usize {
        self.pending.len()
    }
}
