//! Fingerprint registry
//!
//! The FingerprintCollection owns every live Fingerprint and coordinates:
//! - admission of sightings through the IdentityMatcher
//! - find-or-create by identity key and sample ingestion
//! - the housekeeping sweep (close, count, forget)
//! - runtime commands and per-device configuration
//!
//! All state sits behind one mutex shared by the reception path and the
//! housekeeping loop.

mod arena;

pub use arena::{Arena, FingerprintHandle};

use crate::domain::types::{monotonic_ms, Advertisement, DeviceConfig};
use crate::infra::metrics::Metrics;
use crate::services::devices::DeviceTable;
use crate::services::fingerprint::{Fingerprint, Lifecycle};
use crate::services::matcher::Admission;
use crate::services::tunables::Tunables;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Receiver of lifecycle notifications.
///
/// Every method is called synchronously while the registry lock is held.
/// Implementations must return quickly, must not block, and must not call
/// back into the collection (that would deadlock). The `&Fingerprint` is
/// only valid for the duration of the call; clone what you need to keep.
pub trait PresenceListener: Send + Sync {
    /// Admission was enabled (`true`) or paused (`false`)
    fn on_seen(&self, _enabled: bool) {}
    fn on_add(&self, _fingerprint: &Fingerprint) {}
    /// Fingerprint evicted after `forget_ms` of silence
    fn on_del(&self, _fingerprint: &Fingerprint) {}
    fn on_close(&self, _fingerprint: &Fingerprint) {}
    fn on_left(&self, _fingerprint: &Fingerprint) {}
    fn on_count_add(&self, _fingerprint: &Fingerprint) {}
    fn on_count_del(&self, _fingerprint: &Fingerprint) {}
    /// A closing or closed device was seen again
    fn on_reopen(&self, _fingerprint: &Fingerprint) {}
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl PresenceListener for NoopListener {}

struct Registry {
    arena: Arena<Fingerprint>,
    index: FxHashMap<String, FingerprintHandle>,
    devices: DeviceTable,
    tunables: Tunables,
    disabled: bool,
}

impl Registry {
    /// Existing handle for the identity, refreshed, or a freshly created one
    fn find_or_create(&mut self, admission: &Admission, now_ms: u64) -> FingerprintHandle {
        if let Some(&handle) = self.index.get(&admission.key) {
            if let Some(fingerprint) = self.arena.get_mut(handle) {
                fingerprint.refresh_identity(admission);
                return handle;
            }
        }
        let handle = self.arena.insert(Fingerprint::new(admission, &self.tunables, now_ms));
        self.index.insert(admission.key.clone(), handle);
        debug!(id = %admission.key, irk = admission.resolved_by_irk, "fingerprint_created");
        handle
    }
}

pub struct FingerprintCollection {
    inner: Mutex<Registry>,
    listener: Arc<dyn PresenceListener>,
    metrics: Arc<Metrics>,
}

impl FingerprintCollection {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            inner: Mutex::new(Registry {
                arena: Arena::new(),
                index: FxHashMap::default(),
                devices: DeviceTable::new(),
                tunables,
                disabled: false,
            }),
            listener: Arc::new(NoopListener),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn PresenceListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Seed the calibration table (e.g. from the config file)
    pub fn with_devices(self, devices: impl IntoIterator<Item = DeviceConfig>) -> Self {
        {
            let mut reg = self.inner.lock();
            for device in devices {
                reg.devices.upsert(device);
            }
        }
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Feed one advertisement using the process clock
    pub fn seen(&self, adv: &Advertisement) -> bool {
        self.seen_at(adv, monotonic_ms())
    }

    /// Feed one advertisement at `now_ms`. Returns whether it was admitted.
    pub fn seen_at(&self, adv: &Advertisement, now_ms: u64) -> bool {
        self.metrics.record_advert();
        let started = Instant::now();

        let mut guard = self.inner.lock();
        let reg = &mut *guard;
        if reg.disabled {
            self.metrics.record_disabled_drop();
            return false;
        }
        let Some(admission) = reg.tunables.matcher.admit(adv, &reg.devices) else {
            self.metrics.record_rejected();
            return false;
        };

        let handle = reg.find_or_create(&admission, now_ms);
        let Some(fingerprint) = reg.arena.get_mut(handle) else {
            return false;
        };
        let transitions = fingerprint.ingest(adv.rssi, now_ms, &reg.tunables);
        for lifecycle in transitions {
            self.dispatch(lifecycle, fingerprint);
        }
        drop(guard);

        self.metrics.record_admitted(started.elapsed().as_micros() as u64);
        true
    }

    /// Admit and find-or-create without applying a sample
    pub fn get_fingerprint(&self, adv: &Advertisement) -> Option<FingerprintHandle> {
        self.get_fingerprint_at(adv, monotonic_ms())
    }

    pub fn get_fingerprint_at(&self, adv: &Advertisement, now_ms: u64) -> Option<FingerprintHandle> {
        let mut guard = self.inner.lock();
        let reg = &mut *guard;
        let admission = reg.tunables.matcher.admit(adv, &reg.devices)?;
        if reg.disabled {
            return reg.index.get(&admission.key).copied();
        }
        Some(reg.find_or_create(&admission, now_ms))
    }

    /// Copy of the fingerprint behind a handle; `None` once evicted
    pub fn get(&self, handle: FingerprintHandle) -> Option<Fingerprint> {
        self.inner.lock().arena.get(handle).cloned()
    }

    /// Housekeeping sweep using the process clock
    pub fn cleanup_old_fingerprints(&self) {
        self.cleanup_at(monotonic_ms());
    }

    /// Close, count and forget every fingerprint as of `now_ms`
    pub fn cleanup_at(&self, now_ms: u64) {
        let mut guard = self.inner.lock();
        let reg = &mut *guard;

        for handle in reg.arena.handles() {
            let Some(fingerprint) = reg.arena.get_mut(handle) else {
                continue;
            };
            for lifecycle in fingerprint.check_close(now_ms, &reg.tunables) {
                self.dispatch(lifecycle, fingerprint);
            }
            if let Some(lifecycle) = fingerprint.check_count(now_ms, &reg.tunables) {
                self.dispatch(lifecycle, fingerprint);
            }
            if !fingerprint.should_forget(now_ms, &reg.tunables) {
                continue;
            }
            if let Some(lifecycle) = fingerprint.release_count() {
                self.dispatch(lifecycle, fingerprint);
            }

            let Some(evicted) = reg.arena.remove(handle) else {
                continue;
            };
            reg.index.remove(evicted.id());
            self.metrics.record_fingerprint_evicted();
            // Never announced, so nothing to retract
            if evicted.seen_count() > 0 {
                info!(id = %evicted.id(), seen = evicted.seen_count(), "fingerprint_deleted");
                self.listener.on_del(&evicted);
            }
        }
    }

    /// Consistent snapshot, taken under the lock and released before returning
    pub fn get_copy(&self) -> Vec<Fingerprint> {
        let reg = self.inner.lock();
        reg.arena.iter().map(|(_, fingerprint)| fingerprint.clone()).collect()
    }

    pub fn find_device_config(&self, id: &str) -> Option<DeviceConfig> {
        self.inner.lock().devices.find(id).cloned()
    }

    /// Apply a runtime command; `false` when unknown or unparseable
    pub fn command(&self, name: &str, payload: &str) -> bool {
        let mut reg = self.inner.lock();
        match reg.tunables.apply(name, payload) {
            Ok(applied) => {
                info!(command = applied, value = %payload.trim(), "command_applied");
                if applied == "absorption" && reg.tunables.absorption <= 0.0 {
                    warn!(
                        value = reg.tunables.absorption,
                        effective = reg.tunables.absorption(),
                        "absorption_not_positive"
                    );
                }
                self.metrics.record_command(true);
                true
            }
            Err(e) => {
                warn!(command = %name, value = %payload.trim(), error = %e, "command_rejected");
                self.metrics.record_command(false);
                false
            }
        }
    }

    /// Store a per-device JSON record; an empty payload removes the entry
    pub fn config(&self, id: &str, json: &str) -> bool {
        let id = id.trim();
        if id.is_empty() {
            warn!("device_config_missing_id");
            return false;
        }
        if json.trim().is_empty() {
            let removed = self.inner.lock().devices.remove(id).is_some();
            info!(id = %id, removed, "device_config_removed");
            return true;
        }
        match DeviceConfig::from_json(id, json) {
            Ok(config) => {
                info!(id = %id, alias = %config.alias, cal_rssi = ?config.cal_rssi, "device_config_stored");
                self.inner.lock().devices.upsert(config);
                true
            }
            Err(e) => {
                warn!(id = %id, error = %e, "device_config_rejected");
                false
            }
        }
    }

    /// Pause or resume admission. Existing fingerprints keep aging out.
    pub fn set_disable(&self, disable: bool) {
        let mut reg = self.inner.lock();
        if reg.disabled == disable {
            return;
        }
        reg.disabled = disable;
        info!(disabled = disable, "admission_state_changed");
        self.listener.on_seen(!disable);
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.lock().disabled
    }

    pub fn len(&self) -> usize {
        self.inner.lock().arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of currently counted devices
    pub fn counted(&self) -> Vec<String> {
        let reg = self.inner.lock();
        reg.arena
            .iter()
            .filter(|(_, fingerprint)| fingerprint.counted())
            .map(|(_, fingerprint)| fingerprint.id().to_string())
            .collect()
    }

    pub fn tunables(&self) -> Tunables {
        self.inner.lock().tunables.clone()
    }

    fn dispatch(&self, lifecycle: Lifecycle, fingerprint: &Fingerprint) {
        let id = fingerprint.id();
        let distance = fingerprint.distance().map(|d| format!("{d:.2}")).unwrap_or_default();
        match lifecycle {
            Lifecycle::Add => {
                info!(id = %id, name = %fingerprint.name(), distance = %distance, "fingerprint_added");
                self.metrics.record_fingerprint_added();
                self.listener.on_add(fingerprint);
            }
            Lifecycle::Reopen => {
                info!(id = %id, distance = %distance, "fingerprint_reopened");
                self.listener.on_reopen(fingerprint);
            }
            Lifecycle::Close => {
                debug!(id = %id, "fingerprint_closing");
                self.listener.on_close(fingerprint);
            }
            Lifecycle::Left => {
                info!(id = %id, "fingerprint_left");
                self.listener.on_left(fingerprint);
            }
            Lifecycle::CountAdd => {
                info!(id = %id, distance = %distance, "count_added");
                self.listener.on_count_add(fingerprint);
            }
            Lifecycle::CountDel => {
                info!(id = %id, distance = %distance, "count_removed");
                self.listener.on_count_del(fingerprint);
            }
        }
    }
}
