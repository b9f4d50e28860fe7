//! Reading persistence seam
//!
//! Adapters hand every native reading and status change to a `ReadingSink`
//! before bridging it. The service runs with `NullSink` unless an embedding
//! application supplies its own; `MemorySink` keeps history in process.

use std::collections::VecDeque;

use async_trait::async_trait;
use gridlink_model::{DeviceId, DeviceIdentity, DeviceStatus, Reading};
use parking_lot::Mutex;

use crate::error::Result;

#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn store_reading(&self, identity: &DeviceIdentity, reading: &Reading) -> Result<()>;

    async fn store_status(&self, identity: &DeviceIdentity, status: DeviceStatus) -> Result<()>;
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl ReadingSink for NullSink {
    async fn store_reading(&self, _identity: &DeviceIdentity, _reading: &Reading) -> Result<()> {
        Ok(())
    }

    async fn store_status(&self, _identity: &DeviceIdentity, _status: DeviceStatus) -> Result<()> {
        Ok(())
    }
}

/// Bounded in-memory history, newest last
pub struct MemorySink {
    capacity: usize,
    readings: Mutex<VecDeque<(DeviceId, Reading)>>,
    statuses: Mutex<VecDeque<(DeviceId, DeviceStatus)>>,
}

impl MemorySink {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            readings: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
        }
    }

    pub fn readings_for(&self, device_id: DeviceId) -> Vec<Reading> {
        self.readings
            .lock()
            .iter()
            .filter(|(id, _)| *id == device_id)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn latest_status(&self, device_id: DeviceId) -> Option<DeviceStatus> {
        self.statuses
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| *id == device_id)
            .map(|(_, s)| *s)
    }

    pub fn statuses_for(&self, device_id: DeviceId) -> Vec<DeviceStatus> {
        self.statuses
            .lock()
            .iter()
            .filter(|(id, _)| *id == device_id)
            .map(|(_, s)| *s)
            .collect()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, capacity: usize) {
    if queue.len() >= capacity {
        queue.pop_front();
    }
    queue.push_back(item);
}

#[async_trait]
impl ReadingSink for MemorySink {
    async fn store_reading(&self, identity: &DeviceIdentity, reading: &Reading) -> Result<()> {
        push_bounded(
            &mut self.readings.lock(),
            (identity.device_id, reading.clone()),
            self.capacity,
        );
        Ok(())
    }

    async fn store_status(&self, identity: &DeviceIdentity, status: DeviceStatus) -> Result<()> {
        push_bounded(
            &mut self.statuses.lock(),
            (identity.device_id, status),
            self.capacity,
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use gridlink_model::{DeviceType, Protocol};

    #[tokio::test]
    async fn test_memory_sink_is_bounded() {
        let sink = MemorySink::with_capacity(2);
        let meter = DeviceIdentity::new(3, DeviceType::Meter, Protocol::Modbus);
        for i in 0..3 {
            let reading = Reading::new().with_field("energy_wh", i as f64);
            sink.store_reading(&meter, &reading).await.unwrap();
        }
        let kept = sink.readings_for(3);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].get_f64("energy_wh"), Some(1.0));
    }

    #[tokio::test]
    async fn test_latest_status() {
        let sink = MemorySink::new();
        let meter = DeviceIdentity::new(3, DeviceType::Meter, Protocol::Modbus);
        sink.store_status(&meter, DeviceStatus::Online).await.unwrap();
        sink.store_status(&meter, DeviceStatus::Offline).await.unwrap();
        assert_eq!(sink.latest_status(3), Some(DeviceStatus::Offline));
        assert_eq!(sink.latest_status(4), None);
    }
}
