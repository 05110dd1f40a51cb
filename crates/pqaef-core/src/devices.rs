//! Accelerator device bookkeeping.
//!
//! The set of visible devices is an explicit value built from the job (the union of
//! every provider's `device_ids`) and handed to provider construction. In-process
//! providers take an exclusive [`DeviceLease`]; the orchestrator calls
//! [`DevicePool::reclaim`] between stages so only one stage ever holds devices.

use crate::errors::{PipelineError, PipelineResult};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct PoolState {
    visible: BTreeSet<u32>,
    leased: BTreeMap<u32, String>,
    reclaims: u64,
}

/// Shared view of the devices this process may use.
#[derive(Debug, Clone, Default)]
pub struct DevicePool {
    inner: Arc<Mutex<PoolState>>,
}

/// What a [`DevicePool::reclaim`] pass found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Leases still outstanding at reclaim time, force-released: `(device, holder)`.
    pub stale: Vec<(u32, String)>,
}

impl DevicePool {
    pub fn new(visible: impl IntoIterator<Item = u32>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolState {
                visible: visible.into_iter().collect(),
                ..PoolState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn visible(&self) -> Vec<u32> {
        self.state().visible.iter().copied().collect()
    }

    /// Devices currently leased, with their holder.
    pub fn leased(&self) -> Vec<(u32, String)> {
        self.state()
            .leased
            .iter()
            .map(|(d, h)| (*d, h.clone()))
            .collect()
    }

    pub fn reclaim_count(&self) -> u64 {
        self.state().reclaims
    }

    /// Exclusively lease `devices` for `holder`. An empty list yields a CPU lease.
    pub fn acquire(&self, holder: &str, devices: &[u32]) -> PipelineResult<DeviceLease> {
        let mut state = self.state();
        for d in devices {
            if !state.visible.contains(d) {
                return Err(PipelineError::resource(
                    holder,
                    format!(
                        "device {} is not visible (visible: {:?})",
                        d, state.visible
                    ),
                ));
            }
            if let Some(owner) = state.leased.get(d) {
                return Err(PipelineError::resource(
                    holder,
                    format!("device {} is already leased by '{}'", d, owner),
                ));
            }
        }
        for d in devices {
            state.leased.insert(*d, holder.to_string());
        }
        if !devices.is_empty() {
            debug!(holder, devices = ?devices, "device lease acquired");
        }
        Ok(DeviceLease {
            pool: self.clone(),
            holder: holder.to_string(),
            devices: devices.to_vec(),
            released: false,
        })
    }

    fn give_back(&self, holder: &str, devices: &[u32]) {
        let mut state = self.state();
        for d in devices {
            if state.leased.get(d).map(String::as_str) == Some(holder) {
                state.leased.remove(d);
            }
        }
    }

    /// Drop every outstanding lease and count the pass. Called between stages.
    pub fn reclaim(&self) -> ReclaimReport {
        let mut state = self.state();
        state.reclaims += 1;
        let stale: Vec<(u32, String)> = std::mem::take(&mut state.leased).into_iter().collect();
        if !stale.is_empty() {
            warn!(stale = ?stale, "reclaiming device leases left behind by a stage");
        }
        ReclaimReport { stale }
    }
}

/// Exclusive hold on a set of devices. Returned to the pool on release or drop.
#[derive(Debug)]
pub struct DeviceLease {
    pool: DevicePool,
    holder: String,
    devices: Vec<u32>,
    released: bool,
}

impl DeviceLease {
    pub fn devices(&self) -> &[u32] {
        &self.devices
    }

    pub fn is_cpu(&self) -> bool {
        self.devices.is_empty()
    }

    /// Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.pool.give_back(&self.holder, &self.devices);
        if !self.devices.is_empty() {
            debug!(holder = %self.holder, devices = ?self.devices, "device lease released");
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.release();
    }
}
