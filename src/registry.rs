//! Device registry
//!
//! The registry owns device records (identity, network address, binding,
//! lifetime). The protocol core only reads from it, except for the
//! registration interface which creates, refreshes and removes records.

use crate::error::{Lwm2mError, Result};
use crate::types::DeviceId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

/// Shortest period between two lifetime scans
const MIN_LIFETIME_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Lifetime applied when a registration omits `lt`
pub const DEFAULT_LIFETIME_SECS: u64 = 86400;

/// Binding applied when a registration omits `b`
pub const DEFAULT_BINDING: &str = "U";

/// A registered device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Server-assigned id, 0 until registered
    pub id: DeviceId,
    /// Endpoint client name (`ep`)
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    /// Binding mode, `U` or containing `Q` for queue mode
    pub binding: String,
    /// Registration lifetime in seconds
    pub lifetime: u64,
    pub lwm2m_version: Option<String>,
    pub device_type: Option<String>,
    /// Registration url the device used
    pub path: String,
    pub creation_date: SystemTime,
    pub last_seen: SystemTime,
}

impl Device {
    /// New unregistered device seen at `source` now
    pub fn new(name: impl Into<String>, source: SocketAddr) -> Self {
        let now = SystemTime::now();
        Self {
            id: 0,
            name: name.into(),
            address: source.ip(),
            port: source.port(),
            binding: DEFAULT_BINDING.to_string(),
            lifetime: DEFAULT_LIFETIME_SECS,
            lwm2m_version: None,
            device_type: None,
            path: "/rd".to_string(),
            creation_date: now,
            last_seen: now,
        }
    }

    pub fn with_binding(mut self, binding: impl Into<String>) -> Self {
        self.binding = binding.into();
        self
    }

    pub fn with_lifetime(mut self, lifetime: u64) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Whether the device sleeps between contacts (binding contains `Q`)
    pub fn is_queue_mode(&self) -> bool {
        self.binding.contains('Q')
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn lifetime_duration(&self) -> Duration {
        Duration::from_secs(self.lifetime)
    }

    /// Whether `last_seen + lifetime` lies before `now`
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now.duration_since(self.last_seen)
            .map(|elapsed| elapsed > self.lifetime_duration())
            .unwrap_or(false)
    }
}

/// Storage of device records
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Look up a device by id
    async fn get(&self, id: DeviceId) -> Result<Device>;

    /// Look up a device by endpoint name
    async fn get_by_name(&self, name: &str) -> Result<Device>;

    /// Store a new device and return its id
    async fn register(&self, device: Device) -> Result<DeviceId>;

    /// Replace the record of an existing device
    async fn update(&self, id: DeviceId, device: Device) -> Result<()>;

    /// Remove a device, returning its last record
    async fn unregister(&self, id: DeviceId) -> Result<Device>;

    /// Stop any background expiry checking
    async fn stop_lifetime_check(&self);
}

#[derive(Default)]
struct RegistryState {
    next_id: DeviceId,
    devices: HashMap<DeviceId, Device>,
}

/// Process-local registry
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<Mutex<RegistryState>>,
    lifetime_check: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every device whose lifetime has run out, returning their ids
    pub fn remove_expired(&self, now: SystemTime) -> Vec<DeviceId> {
        let mut state = self.lock();
        let expired: Vec<DeviceId> = state
            .devices
            .values()
            .filter(|device| device.is_expired(now))
            .map(|device| device.id)
            .collect();
        for id in &expired {
            state.devices.remove(id);
        }
        expired
    }

    /// Scan for expired registrations every `interval`, at least once a second
    ///
    /// Replaces any scan already running. Must be called inside a tokio runtime.
    pub fn start_lifetime_check(&self, interval: Duration) {
        let interval = interval.max(MIN_LIFETIME_CHECK_INTERVAL);
        let registry = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for id in registry.remove_expired(SystemTime::now()) {
                    tracing::info!(device_id = id, "Registration lifetime expired, device removed");
                }
            }
        });

        let previous = self
            .lifetime_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn is_checking_lifetime(&self) -> bool {
        self.lifetime_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryRegistry {
    async fn get(&self, id: DeviceId) -> Result<Device> {
        self.lock()
            .devices
            .get(&id)
            .cloned()
            .ok_or_else(|| Lwm2mError::DeviceNotFound(id.to_string()))
    }

    async fn get_by_name(&self, name: &str) -> Result<Device> {
        self.lock()
            .devices
            .values()
            .find(|device| device.name == name)
            .cloned()
            .ok_or_else(|| Lwm2mError::DeviceNotFound(name.to_string()))
    }

    async fn register(&self, mut device: Device) -> Result<DeviceId> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        device.id = id;
        state.devices.insert(id, device);
        Ok(id)
    }

    async fn update(&self, id: DeviceId, mut device: Device) -> Result<()> {
        let mut state = self.lock();
        let slot = state
            .devices
            .get_mut(&id)
            .ok_or_else(|| Lwm2mError::DeviceNotFound(id.to_string()))?;
        device.id = id;
        *slot = device;
        Ok(())
    }

    async fn unregister(&self, id: DeviceId) -> Result<Device> {
        self.lock()
            .devices
            .remove(&id)
            .ok_or_else(|| Lwm2mError::DeviceNotFound(id.to_string()))
    }

    async fn stop_lifetime_check(&self) {
        let task = self
            .lifetime_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            tracing::debug!("Lifetime check stopped");
        }
    }
}
