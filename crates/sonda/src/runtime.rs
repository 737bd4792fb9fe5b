//! Probe store and execution data.
//!
//! [`ProbeArray`] is the per-unit hit array the instrumented code writes
//! into while it runs. Writes are monotonic true-setting of individual
//! slots, so concurrent writers need no locking; a snapshot taken while
//! execution is ongoing may under-report probes that fire afterwards, but
//! never reports an unfired probe as fired.
//!
//! [`RuntimeData`] is the process-wide registry the execution harness talks
//! to: it hands out probe arrays at unit load and collects them into an
//! [`ExecutionStore`] after (or during) execution, optionally resetting the
//! arrays for incremental session accounting.

use crate::error::{SondaError, SondaResult};
use crate::probe::ProbeId;
use crate::unit::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Per-unit probe hit array
///
/// Shared between the harness and arbitrarily many executing threads via
/// `Arc`. Slots only ever go from `false` to `true`, which makes races
/// benign: first write and last write are equivalent.
#[derive(Debug)]
pub struct ProbeArray {
    slots: Vec<AtomicBool>,
}

impl ProbeArray {
    /// Allocate an all-false array of the given size
    #[must_use]
    pub fn new(probe_count: u32) -> Self {
        let mut slots = Vec::with_capacity(probe_count as usize);
        slots.resize_with(probe_count as usize, AtomicBool::default);
        Self { slots }
    }

    /// Mark a probe as hit
    ///
    /// Hot path of every instrumented unit; relaxed ordering is sufficient
    /// for write-once-true slots.
    #[inline]
    pub fn hit(&self, probe: ProbeId) {
        debug_assert!(probe.index() < self.slots.len());
        if let Some(slot) = self.slots.get(probe.index()) {
            slot.store(true, Ordering::Relaxed);
        }
    }

    /// Whether a probe has been hit
    #[must_use]
    pub fn is_hit(&self, probe: ProbeId) -> bool {
        self.slots
            .get(probe.index())
            .is_some_and(|slot| slot.load(Ordering::Relaxed))
    }

    /// Point-in-time, non-destructive copy of the hit flags
    ///
    /// May race with in-flight writes: probes completing before the call
    /// returns are visible, later ones may not be.
    #[must_use]
    pub fn snapshot(&self) -> Vec<bool> {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }

    /// Clear every slot back to unfired
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.store(false, Ordering::Relaxed);
        }
    }

    /// Number of probe slots
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the array has no slots
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Recorded probe results of one or more runs of an instrumented unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionData {
    /// Unit name the probes belong to
    pub name: String,
    /// Fingerprint of the original unit that was instrumented
    pub fingerprint: Fingerprint,
    /// One hit flag per probe
    pub probes: Vec<bool>,
}

impl ExecutionData {
    /// Create execution data from a probe snapshot
    #[must_use]
    pub fn new(name: impl Into<String>, fingerprint: Fingerprint, probes: Vec<bool>) -> Self {
        Self {
            name: name.into(),
            fingerprint,
            probes,
        }
    }

    /// OR-merge another run of the same unit into this one
    ///
    /// Merging never clears a hit flag, so coverage derived from merged data
    /// is monotonic in the number of sessions. A fingerprint or size
    /// disagreement means the data came from different class bytes and is a
    /// [`SondaError::DataMismatch`].
    pub fn merge(&mut self, other: &Self) -> SondaResult<()> {
        self.assert_compatible(&other.name, other.fingerprint, other.probes.len())?;
        for (mine, theirs) in self.probes.iter_mut().zip(&other.probes) {
            *mine |= *theirs;
        }
        Ok(())
    }

    /// Check that the given identity matches this data
    pub fn assert_compatible(
        &self,
        name: &str,
        fingerprint: Fingerprint,
        probe_count: usize,
    ) -> SondaResult<()> {
        if self.name != name {
            return Err(SondaError::mismatch(
                name,
                format!("execution data belongs to '{}'", self.name),
            ));
        }
        if self.fingerprint != fingerprint {
            return Err(SondaError::mismatch(
                name,
                format!(
                    "fingerprint {} does not match collected {}",
                    fingerprint, self.fingerprint
                ),
            ));
        }
        if self.probes.len() != probe_count {
            return Err(SondaError::mismatch(
                name,
                format!(
                    "probe count {} does not match collected {}",
                    probe_count,
                    self.probes.len()
                ),
            ));
        }
        Ok(())
    }

    /// Number of fired probes
    #[must_use]
    pub fn hit_count(&self) -> usize {
        self.probes.iter().filter(|&&hit| hit).count()
    }
}

/// Execution data for many units, additive across sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStore {
    units: BTreeMap<String, ExecutionData>,
}

impl ExecutionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one unit's execution data into the store
    ///
    /// First sight of a unit stores the data as-is; later sights OR-merge,
    /// failing on any identity mismatch.
    pub fn put(&mut self, data: ExecutionData) -> SondaResult<()> {
        match self.units.get_mut(&data.name) {
            Some(existing) => existing.merge(&data),
            None => {
                self.units.insert(data.name.clone(), data);
                Ok(())
            }
        }
    }

    /// Execution data for one unit, if any was collected
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ExecutionData> {
        self.units.get(name)
    }

    /// All collected unit data, in name order
    pub fn contents(&self) -> impl Iterator<Item = &ExecutionData> {
        self.units.values()
    }

    /// Number of units with collected data
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the store holds no data
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Serialize the store for a later or out-of-process analysis
    pub fn save(&self, writer: impl Write) -> SondaResult<()> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// Deserialize a previously saved store
    pub fn load(reader: impl Read) -> SondaResult<Self> {
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Metadata about one execution session
///
/// Labels groups of execution data; carries no correctness weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Unique session identifier
    pub id: Uuid,
    /// When the session started
    pub start: DateTime<Utc>,
    /// When the session's data was collected
    pub dump: DateTime<Utc>,
}

/// Ordered collection of session metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStore {
    sessions: Vec<SessionInfo>,
}

impl SessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session
    pub fn push(&mut self, session: SessionInfo) {
        self.sessions.push(session);
    }

    /// Recorded sessions in collection order
    #[must_use]
    pub fn sessions(&self) -> &[SessionInfo] {
        &self.sessions
    }
}

struct RegisteredUnit {
    fingerprint: Fingerprint,
    probes: Arc<ProbeArray>,
}

/// Process-wide probe store for all instrumented units
///
/// The execution harness registers each unit at load time and requests a
/// collection after execution. Registration and collection take a lock;
/// probe writes go straight to the shared [`ProbeArray`] and never block.
pub struct RuntimeData {
    units: Mutex<BTreeMap<String, RegisteredUnit>>,
    session_start: Mutex<DateTime<Utc>>,
}

impl RuntimeData {
    /// Start up a runtime with an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            units: Mutex::new(BTreeMap::new()),
            session_start: Mutex::new(Utc::now()),
        }
    }

    /// Register an instrumented unit, allocating its probe array
    ///
    /// Re-registering the same unit with the same fingerprint returns the
    /// existing array (several loads of one unit share their probes);
    /// a different fingerprint under the same name is a
    /// [`SondaError::DataMismatch`].
    pub fn register(
        &self,
        name: &str,
        fingerprint: Fingerprint,
        probe_count: u32,
    ) -> SondaResult<Arc<ProbeArray>> {
        let mut units = self.units.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = units.get(name) {
            if existing.fingerprint != fingerprint {
                return Err(SondaError::mismatch(
                    name,
                    format!(
                        "already registered with fingerprint {}, got {}",
                        existing.fingerprint, fingerprint
                    ),
                ));
            }
            return Ok(Arc::clone(&existing.probes));
        }
        let probes = Arc::new(ProbeArray::new(probe_count));
        units.insert(
            name.to_string(),
            RegisteredUnit {
                fingerprint,
                probes: Arc::clone(&probes),
            },
        );
        debug!(unit = name, probes = probe_count, "registered probe array");
        Ok(probes)
    }

    /// Probe array of a registered unit
    #[must_use]
    pub fn probes(&self, name: &str) -> Option<Arc<ProbeArray>> {
        let units = self.units.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        units.get(name).map(|u| Arc::clone(&u.probes))
    }

    /// Collect a snapshot of every registered unit into the given stores
    ///
    /// Collection is non-destructive unless `reset` is set, in which case
    /// the probe arrays are cleared afterwards and the next collection
    /// accounts only probes fired since - incremental session accounting.
    pub fn collect(
        &self,
        executions: &mut ExecutionStore,
        sessions: &mut SessionStore,
        reset: bool,
    ) -> SondaResult<()> {
        let units = self.units.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (name, unit) in units.iter() {
            executions.put(ExecutionData::new(
                name.clone(),
                unit.fingerprint,
                unit.probes.snapshot(),
            ))?;
            if reset {
                unit.probes.reset();
            }
        }
        let mut start = self
            .session_start
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        sessions.push(SessionInfo {
            id: Uuid::new_v4(),
            start: *start,
            dump: now,
        });
        if reset {
            *start = now;
        }
        debug!(units = units.len(), reset, "collected execution data");
        Ok(())
    }

    /// Shut the runtime down after a final collection
    ///
    /// The closing session is recorded and every registered unit is dropped
    /// from the registry; recording execution again requires
    /// re-registration. Probe arrays still held by executing code keep
    /// accepting hits, but nothing collects them anymore.
    pub fn shutdown(
        &self,
        executions: &mut ExecutionStore,
        sessions: &mut SessionStore,
    ) -> SondaResult<()> {
        self.collect(executions, sessions, false)?;
        let mut units = self.units.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let dropped = units.len();
        units.clear();
        debug!(units = dropped, "runtime shut down");
        Ok(())
    }

    /// Clear all probe arrays without collecting
    pub fn reset(&self) {
        let units = self.units.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for unit in units.values() {
            unit.probes.reset();
        }
    }
}

impl Default for RuntimeData {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuntimeData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let units = self.units.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f.debug_struct("RuntimeData")
            .field("units", &units.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fp(raw: u64) -> Fingerprint {
        Fingerprint::from_raw(raw)
    }

    #[test]
    fn test_probe_array_starts_all_false() {
        let array = ProbeArray::new(4);
        assert_eq!(array.snapshot(), vec![false; 4]);
    }

    #[test]
    fn test_hit_is_monotonic_and_idempotent() {
        let array = ProbeArray::new(3);
        array.hit(ProbeId::new(1));
        array.hit(ProbeId::new(1));
        assert_eq!(array.snapshot(), vec![false, true, false]);
        array.reset();
        assert_eq!(array.snapshot(), vec![false; 3]);
    }

    #[test]
    fn test_concurrent_hits_all_visible_after_join() {
        let array = Arc::new(ProbeArray::new(64));
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let array = Arc::clone(&array);
            handles.push(thread::spawn(move || {
                for i in 0..64u32 {
                    if i % 8 == t {
                        array.hit(ProbeId::new(i));
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(array.snapshot().iter().all(|&hit| hit));
    }

    #[test]
    fn test_merge_is_logical_or() {
        let mut a = ExecutionData::new("U", fp(1), vec![true, false, false]);
        let b = ExecutionData::new("U", fp(1), vec![false, true, false]);
        a.merge(&b).unwrap();
        assert_eq!(a.probes, vec![true, true, false]);
    }

    #[test]
    fn test_merge_rejects_size_mismatch() {
        let mut a = ExecutionData::new("U", fp(1), vec![true, false]);
        let b = ExecutionData::new("U", fp(1), vec![false, true, true]);
        assert!(matches!(a.merge(&b), Err(SondaError::DataMismatch { .. })));
    }

    #[test]
    fn test_merge_rejects_fingerprint_mismatch() {
        let mut a = ExecutionData::new("U", fp(1), vec![true]);
        let b = ExecutionData::new("U", fp(2), vec![true]);
        assert!(matches!(a.merge(&b), Err(SondaError::DataMismatch { .. })));
    }

    #[test]
    fn test_store_accumulates_across_sessions() {
        let mut store = ExecutionStore::new();
        store
            .put(ExecutionData::new("U", fp(1), vec![true, false]))
            .unwrap();
        store
            .put(ExecutionData::new("U", fp(1), vec![false, true]))
            .unwrap();
        assert_eq!(store.get("U").unwrap().probes, vec![true, true]);
    }

    #[test]
    fn test_store_round_trips_through_json() {
        let mut store = ExecutionStore::new();
        store
            .put(ExecutionData::new("U", fp(7), vec![true, false, true]))
            .unwrap();
        let mut buffer = Vec::new();
        store.save(&mut buffer).unwrap();
        let loaded = ExecutionStore::load(buffer.as_slice()).unwrap();
        assert_eq!(loaded, store);
    }

    #[test]
    fn test_runtime_collect_with_reset_restarts_accounting() {
        let runtime = RuntimeData::new();
        let probes = runtime.register("U", fp(1), 2).unwrap();
        probes.hit(ProbeId::new(0));

        let mut executions = ExecutionStore::new();
        let mut sessions = SessionStore::new();
        runtime.collect(&mut executions, &mut sessions, true).unwrap();
        assert_eq!(executions.get("U").unwrap().probes, vec![true, false]);
        assert_eq!(sessions.sessions().len(), 1);

        // After reset only newly fired probes show up; the store keeps the
        // earlier hits via OR-merge.
        probes.hit(ProbeId::new(1));
        runtime.collect(&mut executions, &mut sessions, false).unwrap();
        assert_eq!(executions.get("U").unwrap().probes, vec![true, true]);
        assert_eq!(sessions.sessions().len(), 2);
    }

    #[test]
    fn test_shutdown_collects_then_clears_registry() {
        let runtime = RuntimeData::new();
        let probes = runtime.register("U", fp(1), 2).unwrap();
        probes.hit(ProbeId::new(1));

        let mut executions = ExecutionStore::new();
        let mut sessions = SessionStore::new();
        runtime.shutdown(&mut executions, &mut sessions).unwrap();
        assert_eq!(executions.get("U").unwrap().probes, vec![false, true]);
        assert_eq!(sessions.sessions().len(), 1);
        assert!(runtime.probes("U").is_none());

        // The registry is empty again: the same name may come back with
        // different bytes and a clean array.
        let fresh = runtime.register("U", fp(2), 2).unwrap();
        assert_eq!(fresh.snapshot(), vec![false, false]);
    }

    #[test]
    fn test_register_rejects_conflicting_fingerprint() {
        let runtime = RuntimeData::new();
        runtime.register("U", fp(1), 2).unwrap();
        assert!(matches!(
            runtime.register("U", fp(2), 2),
            Err(SondaError::DataMismatch { .. })
        ));
    }

    #[test]
    fn test_reregister_same_fingerprint_shares_array() {
        let runtime = RuntimeData::new();
        let a = runtime.register("U", fp(1), 2).unwrap();
        let b = runtime.register("U", fp(1), 2).unwrap();
        a.hit(ProbeId::new(0));
        assert!(b.is_hit(ProbeId::new(0)));
    }
}
