//! In-process expectation tracking for cache consistency
//!
//! A reconcile invocation that has just mutated the cluster cannot trust the
//! next cache read: the informer cache lags the write it issued itself. The
//! [`ExpectationLedger`] records every issued mutation as a pending
//! expectation and clears it once the watch stream delivers the matching
//! observation (object present for create, resource version advanced for
//! update, object absent for delete). Reconcile loops consult
//! [`ExpectationLedger::satisfied`] before acting and requeue while any
//! expectation for their owner is outstanding.
//!
//! Expectations older than the configured timeout are treated as satisfied
//! so a lost watch event cannot stall an owner forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Default bound after which an unsatisfied expectation is dropped.
pub const DEFAULT_EXPECTATION_TIMEOUT: Duration = Duration::from_secs(300);

/// The mutation an owner is waiting to observe in its cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExpectedAction {
    /// Object must appear in the cache.
    Create,
    /// Cache copy must reach at least this resource version.
    /// `None` clears on the next observed apply for the key.
    Update { resource_version: Option<String> },
    /// Object must disappear from the cache.
    Delete,
}

/// Tracked child identity within one owner's ledger.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ExpectationKey {
    kind: String,
    name: String,
}

#[derive(Clone, Debug)]
struct Expectation {
    action: ExpectedAction,
    recorded_at: Instant,
}

#[derive(Default)]
struct OwnerLedger {
    pending: HashMap<ExpectationKey, Expectation>,
}

/// Process-wide ledger of pending mutations, keyed by owner identity
/// (`namespace/name` of the employer that issued them).
///
/// Constructed once at operator startup and injected into every controller;
/// lock granularity is per owner so unrelated reconciles never contend.
pub struct ExpectationLedger {
    owners: RwLock<HashMap<String, Arc<Mutex<OwnerLedger>>>>,
    timeout: Duration,
}

impl Default for ExpectationLedger {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_EXPECTATION_TIMEOUT)
    }
}

impl ExpectationLedger {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            owners: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    fn owner_entry(&self, owner: &str) -> Arc<Mutex<OwnerLedger>> {
        if let Some(entry) = self.owners.read().expect("ledger lock poisoned").get(owner) {
            return entry.clone();
        }
        self.owners
            .write()
            .expect("ledger lock poisoned")
            .entry(owner.to_string())
            .or_default()
            .clone()
    }

    fn record(&self, owner: &str, kind: &str, name: &str, action: ExpectedAction) {
        let entry = self.owner_entry(owner);
        let mut ledger = entry.lock().expect("owner ledger poisoned");
        debug!(owner, kind, name, ?action, "recording expectation");
        ledger.pending.insert(
            ExpectationKey {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            Expectation {
                action,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Record that a create was issued for `kind`/`name` on behalf of `owner`.
    ///
    /// Must only be called after the mutating call succeeded; a recorded
    /// expectation for a mutation that never happened stalls the owner until
    /// the timeout fires.
    pub fn expect_create(&self, owner: &str, kind: &str, name: &str) {
        self.record(owner, kind, name, ExpectedAction::Create);
    }

    /// Record that an update was issued. `resource_version` is the version
    /// returned by the write; the expectation clears once the cache catches
    /// up to it.
    pub fn expect_update(&self, owner: &str, kind: &str, name: &str, resource_version: Option<&str>) {
        self.record(
            owner,
            kind,
            name,
            ExpectedAction::Update {
                resource_version: resource_version.map(String::from),
            },
        );
    }

    /// Record that a delete was issued for `kind`/`name`.
    pub fn expect_delete(&self, owner: &str, kind: &str, name: &str) {
        self.record(owner, kind, name, ExpectedAction::Delete);
    }

    /// Drop a single recorded expectation, e.g. when the mutating call it
    /// belongs to turned out to have failed.
    pub fn retract(&self, owner: &str, kind: &str, name: &str) {
        let entry = self.owner_entry(owner);
        let mut ledger = entry.lock().expect("owner ledger poisoned");
        ledger.pending.remove(&ExpectationKey {
            kind: kind.to_string(),
            name: name.to_string(),
        });
    }

    /// Drop every expectation for an owner (the owner itself is gone).
    pub fn forget(&self, owner: &str) {
        self.owners
            .write()
            .expect("ledger lock poisoned")
            .remove(owner);
    }

    /// True iff every expectation recorded for `owner` has been cleared or
    /// has outlived the timeout. Expired entries are pruned here and treated
    /// as satisfied: liveness wins over strict cache consistency.
    pub fn satisfied(&self, owner: &str) -> bool {
        let entry = {
            match self.owners.read().expect("ledger lock poisoned").get(owner) {
                Some(entry) => entry.clone(),
                None => return true,
            }
        };
        let mut ledger = entry.lock().expect("owner ledger poisoned");
        let timeout = self.timeout;
        ledger.pending.retain(|key, exp| {
            if exp.recorded_at.elapsed() >= timeout {
                warn!(
                    owner,
                    kind = %key.kind,
                    name = %key.name,
                    action = ?exp.action,
                    "expectation timed out; treating as satisfied"
                );
                false
            } else {
                true
            }
        });
        ledger.pending.is_empty()
    }

    /// Number of outstanding expectations for an owner.
    pub fn pending(&self, owner: &str) -> usize {
        match self.owners.read().expect("ledger lock poisoned").get(owner) {
            Some(entry) => entry.lock().expect("owner ledger poisoned").pending.len(),
            None => 0,
        }
    }

    /// Feed from the watch stream: an object of `kind` was applied (created
    /// or updated) in the cache. Clears create expectations for the key, and
    /// update expectations whose recorded resource version has been reached.
    pub fn observe_applied(&self, kind: &str, name: &str, resource_version: Option<&str>) {
        let key = ExpectationKey {
            kind: kind.to_string(),
            name: name.to_string(),
        };
        for entry in self.owners.read().expect("ledger lock poisoned").values() {
            let mut ledger = entry.lock().expect("owner ledger poisoned");
            let clear = match ledger.pending.get(&key) {
                Some(exp) => match &exp.action {
                    ExpectedAction::Create => true,
                    ExpectedAction::Update { resource_version: expected } => {
                        version_reached(expected.as_deref(), resource_version)
                    }
                    ExpectedAction::Delete => false,
                },
                None => false,
            };
            if clear {
                ledger.pending.remove(&key);
            }
        }
    }

    /// Feed from the watch stream: an object of `kind` was deleted from the
    /// cache. Clears delete and update expectations for the key (the object
    /// is gone, there is nothing left to converge on).
    pub fn observe_deleted(&self, kind: &str, name: &str) {
        let key = ExpectationKey {
            kind: kind.to_string(),
            name: name.to_string(),
        };
        for entry in self.owners.read().expect("ledger lock poisoned").values() {
            let mut ledger = entry.lock().expect("owner ledger poisoned");
            let clear = matches!(
                ledger.pending.get(&key).map(|e| &e.action),
                Some(ExpectedAction::Delete) | Some(ExpectedAction::Update { .. })
            );
            if clear {
                ledger.pending.remove(&key);
            }
        }
    }
}

/// Resource versions are opaque strings, but in practice etcd revisions are
/// numeric; compare numerically when both sides parse, otherwise fall back
/// to "any different version clears".
fn version_reached(expected: Option<&str>, observed: Option<&str>) -> bool {
    match (expected, observed) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(exp), Some(obs)) => match (exp.parse::<u64>(), obs.parse::<u64>()) {
            (Ok(e), Ok(o)) => o >= e,
            _ => exp != obs,
        },
    }
}
