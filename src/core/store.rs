//! Shared state container for a batch of per-device records.
//!
//! Records are keyed by device id and listed in insertion order. Every write
//! goes through [`RecordStore::apply`], which computes the next state from
//! the current one under the write lock, so results that resolve back to
//! back never overwrite each other.
//!
//! Each dispatched call carries a ticket. A result is only applied while the
//! record still holds the ticket it was dispatched with; a later action on
//! the same record (or a fresh batch) makes older results stale.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use super::record::{BatchSummary, OperationRecord, RecordStatus};
use crate::api::Device;

/// Keys for records without a device id; never collide with real ids.
static NEXT_ORPHAN_KEY: AtomicU64 = AtomicU64::new(1);

fn orphan_key() -> String {
    format!("\u{0}orphan-{}", NEXT_ORPHAN_KEY.fetch_add(1, Ordering::Relaxed))
}

/// A call that has been issued for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub key: String,
    pub device_id: String,
    pub ticket: u64,
}

#[derive(Debug, Clone)]
pub struct RecordSet<S> {
    records: HashMap<String, OperationRecord<S>>,
    order: Vec<String>,
    /// Survives `reset`, so tickets from a previous batch never match again.
    next_ticket: u64,
}

impl<S> Default for RecordSet<S> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            order: Vec::new(),
            next_ticket: 0,
        }
    }
}

impl<S: RecordStatus> RecordSet<S> {
    /// Replace every record with one per device. Duplicate ids keep the
    /// first occurrence; every device without an id gets its own record.
    pub fn reset(&mut self, devices: &[Device], initial: S) {
        self.records.clear();
        self.order.clear();

        for device in devices {
            let key = if device.id.is_empty() {
                orphan_key()
            } else if self.records.contains_key(&device.id) {
                continue;
            } else {
                device.id.clone()
            };
            self.order.push(key.clone());
            self.records
                .insert(key, OperationRecord::new(device, initial));
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&OperationRecord<S>> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut OperationRecord<S>> {
        self.records.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<OperationRecord<S>> {
        let record = self.records.remove(key)?;
        self.order.retain(|k| k != key);
        Some(record)
    }

    /// Records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OperationRecord<S>)> {
        self.order
            .iter()
            .filter_map(|key| self.records.get(key).map(|r| (key.as_str(), r)))
    }

    /// Keys of the records within `scope` (device ids; `None` means all)
    /// that satisfy `filter`, in insertion order.
    pub fn select(
        &self,
        scope: Option<&[String]>,
        filter: impl Fn(&OperationRecord<S>) -> bool,
    ) -> Vec<String> {
        self.iter()
            .filter(|(_, record)| match scope {
                Some(ids) => ids.iter().any(|id| id == &record.device_id),
                None => true,
            })
            .filter(|(_, record)| filter(record))
            .map(|(key, _)| key.to_string())
            .collect()
    }

    /// Stamp a fresh ticket on `key` so any result still in flight for it
    /// is discarded when it lands.
    pub fn invalidate(&mut self, key: &str) {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        if let Some(record) = self.records.get_mut(key) {
            record.ticket = ticket;
        }
    }

    /// Issue tickets for `keys`, mark them loading and apply `transition`.
    pub fn dispatch(
        &mut self,
        keys: &[String],
        transition: impl Fn(&mut OperationRecord<S>),
    ) -> Vec<Dispatch> {
        let mut dispatched = Vec::with_capacity(keys.len());
        for key in keys {
            self.next_ticket += 1;
            let ticket = self.next_ticket;
            let Some(record) = self.records.get_mut(key) else {
                continue;
            };
            record.ticket = ticket;
            record.is_loading = true;
            transition(record);
            dispatched.push(Dispatch {
                key: key.clone(),
                device_id: record.device_id.clone(),
                ticket,
            });
        }
        dispatched
    }

    /// The record `dispatch` was issued for, if that dispatch is still current.
    pub fn current_mut(&mut self, dispatch: &Dispatch) -> Option<&mut OperationRecord<S>> {
        match self.records.get_mut(&dispatch.key) {
            Some(record) if record.ticket == dispatch.ticket => Some(record),
            _ => {
                debug!(
                    device_id = %dispatch.device_id,
                    ticket = dispatch.ticket,
                    "Discarding stale result"
                );
                None
            }
        }
    }

    pub fn is_current(&self, dispatch: &Dispatch) -> bool {
        self.records
            .get(&dispatch.key)
            .is_some_and(|record| record.ticket == dispatch.ticket)
    }

    pub fn summary(&self) -> BatchSummary<S> {
        BatchSummary::from_records(self.iter().map(|(_, r)| r))
    }

    pub fn to_vec(&self) -> Vec<OperationRecord<S>> {
        self.iter().map(|(_, r)| r.clone()).collect()
    }
}

/// Marks an action as in flight until dropped.
pub struct BusyGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Injectable, cloneable handle to a [`RecordSet`].
#[derive(Clone)]
pub struct RecordStore<S> {
    inner: Arc<RwLock<RecordSet<S>>>,
    in_flight: Arc<AtomicUsize>,
}

impl<S: RecordStatus> Default for RecordStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RecordStatus> RecordStore<S> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RecordSet::default())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Ordered copy of the current records.
    pub async fn snapshot(&self) -> Vec<OperationRecord<S>> {
        self.inner.read().await.to_vec()
    }

    /// Read-modify-write against the latest state.
    pub async fn apply<R>(&self, update: impl FnOnce(&mut RecordSet<S>) -> R) -> R {
        let mut set = self.inner.write().await;
        update(&mut set)
    }

    /// Apply `update` to the record behind `dispatch` unless it went stale.
    /// Returns whether the update was applied.
    pub async fn resolve(
        &self,
        dispatch: &Dispatch,
        update: impl FnOnce(&mut OperationRecord<S>),
    ) -> bool {
        self.apply(|set| match set.current_mut(dispatch) {
            Some(record) => {
                update(record);
                record.is_loading = false;
                true
            }
            None => false,
        })
        .await
    }

    pub async fn summary(&self) -> BatchSummary<S> {
        self.inner.read().await.summary()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub fn begin_action(&self) -> BusyGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        BusyGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    /// True while any action is waiting for its calls to settle.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }
}
