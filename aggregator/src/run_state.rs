//! In-memory "is this job running" flags, one per (domain, operation kind).
//!
//! The registry is built once with every flag present and is shared through an
//! `Arc`. Each flag has its own reader/writer lock, so flags never contend with
//! one another. Nothing is persisted: a restart starts with every flag cleared.

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Domain {
    #[serde(rename = "federation-saml")]
    FederationSaml,
    #[serde(rename = "federation-oidc")]
    FederationOidc,
    #[serde(rename = "legacy-connections")]
    Legacy,
    CmdbApplications,
    CmdbUsers,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::FederationSaml,
        Domain::FederationOidc,
        Domain::Legacy,
        Domain::CmdbApplications,
        Domain::CmdbUsers,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Domain::FederationSaml => "federation-saml",
            Domain::FederationOidc => "federation-oidc",
            Domain::Legacy => "legacy-connections",
            Domain::CmdbApplications => "cmdb-applications",
            Domain::CmdbUsers => "cmdb-users",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown domain: {0}")]
pub struct UnknownDomain(pub String);

impl FromStr for Domain {
    type Err = UnknownDomain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| UnknownDomain(s.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Aggregation,
    Purge,
}

impl OperationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Aggregation => "aggregation",
            OperationKind::Purge => "purge",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RunFlag {
    pub domain: Domain,
    pub kind: OperationKind,
}

impl RunFlag {
    pub const fn new(domain: Domain, kind: OperationKind) -> Self {
        RunFlag { domain, kind }
    }

    pub const fn aggregation(domain: Domain) -> Self {
        RunFlag::new(domain, OperationKind::Aggregation)
    }

    pub const fn purge(domain: Domain) -> Self {
        RunFlag::new(domain, OperationKind::Purge)
    }
}

impl fmt::Display for RunFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain.as_str(), self.kind.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RunStateError {
    #[error("{} of {} already in progress", .0.kind.as_str(), .0.domain)]
    AlreadyRunning(RunFlag),
}

#[derive(Debug)]
pub struct RunStateRegistry {
    flags: IndexMap<RunFlag, RwLock<bool>>,
}

impl Default for RunStateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateRegistry {
    pub fn new() -> Self {
        let mut flags = IndexMap::new();
        for domain in Domain::ALL {
            for kind in [OperationKind::Aggregation, OperationKind::Purge] {
                flags.insert(RunFlag::new(domain, kind), RwLock::new(false));
            }
        }
        RunStateRegistry { flags }
    }

    pub fn get(&self, flag: RunFlag) -> bool {
        *self.lock(flag).read()
    }

    pub fn set(&self, flag: RunFlag, running: bool) {
        *self.lock(flag).write() = running;
    }

    /// Marks `flag` as running and returns a guard that clears it on drop.
    ///
    /// Rejects immediately if the flag is already set; callers never wait.
    pub fn try_begin(self: &Arc<Self>, flag: RunFlag) -> Result<RunGuard, RunStateError> {
        let mut running = self.lock(flag).write();
        if *running {
            return Err(RunStateError::AlreadyRunning(flag));
        }
        *running = true;
        Ok(RunGuard {
            registry: Arc::clone(self),
            flag,
        })
    }

    pub fn snapshot(&self) -> Vec<(RunFlag, bool)> {
        self.flags
            .iter()
            .map(|(flag, lock)| (*flag, *lock.read()))
            .collect()
    }

    fn lock(&self, flag: RunFlag) -> &RwLock<bool> {
        // Every (domain, kind) pair is inserted in `new`.
        &self.flags[&flag]
    }
}

/// Holds a run flag for the lifetime of a job body.
#[derive(Debug)]
#[must_use = "the run flag is cleared as soon as the guard is dropped"]
pub struct RunGuard {
    registry: Arc<RunStateRegistry>,
    flag: RunFlag,
}

impl RunGuard {
    pub fn flag(&self) -> RunFlag {
        self.flag
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.set(self.flag, false);
        tracing::debug!(flag = %self.flag, "run flag cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_cleared() {
        let registry = RunStateRegistry::new();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 10);
        assert!(snapshot.iter().all(|(_, running)| !running));
    }

    #[test]
    fn get_and_set_are_independent_per_flag() {
        let registry = RunStateRegistry::new();
        let saml = RunFlag::aggregation(Domain::FederationSaml);

        registry.set(saml, true);
        assert!(registry.get(saml));
        assert!(!registry.get(RunFlag::purge(Domain::FederationSaml)));
        assert!(!registry.get(RunFlag::aggregation(Domain::CmdbUsers)));

        registry.set(saml, false);
        assert!(!registry.get(saml));
    }

    #[test]
    fn second_begin_is_rejected_without_touching_other_flags() {
        let registry = Arc::new(RunStateRegistry::new());
        let flag = RunFlag::aggregation(Domain::Legacy);

        let guard = registry.try_begin(flag).unwrap();
        assert_eq!(
            registry.try_begin(flag).unwrap_err(),
            RunStateError::AlreadyRunning(flag)
        );
        let running: Vec<_> = registry
            .snapshot()
            .into_iter()
            .filter(|(_, running)| *running)
            .collect();
        assert_eq!(running, vec![(flag, true)]);

        drop(guard);
        assert!(!registry.get(flag));
        assert!(registry.try_begin(flag).is_ok());
    }

    #[test]
    fn guard_clears_flag_on_panic() {
        let registry = Arc::new(RunStateRegistry::new());
        let flag = RunFlag::purge(Domain::CmdbApplications);

        let cloned = Arc::clone(&registry);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.try_begin(flag).unwrap();
            panic!("job body failed");
        }));

        assert!(result.is_err());
        assert!(!registry.get(flag));
    }

    #[test]
    fn concurrent_begins_admit_exactly_one() {
        let registry = Arc::new(RunStateRegistry::new());
        let flag = RunFlag::aggregation(Domain::FederationOidc);
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    // Keep the guard alive past the barrier so no thread can re-acquire.
                    registry.try_begin(flag).map(std::mem::forget).is_ok()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
        assert!(registry.get(flag));
    }

    #[test]
    fn domain_names_round_trip() {
        for domain in Domain::ALL {
            assert_eq!(domain.as_str().parse::<Domain>(), Ok(domain));
        }
        assert!("ldap".parse::<Domain>().is_err());
        assert_eq!(
            RunFlag::purge(Domain::CmdbUsers).to_string(),
            "cmdb-users:purge"
        );
    }
}
