//! Name-keyed directory of live reference probes
//!
//! The registry lives as long as the host process and is handed to every
//! component that creates or acquires probes. A processor acquires a probe by
//! name for the duration of its stream and releases it on stop.
//!
//! ## Lock ordering
//!
//! The registry lock serializes directory changes and the acquire scan. A
//! probe's own lock is only taken while the registry lock is already held, and
//! is released first. Nothing ever takes the registry lock while holding a
//! probe lock.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use thiserror::Error;

use super::ReferenceProbe;

/// Errors returned by [`ProbeRegistry::acquire`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No reference probe named '{0}'")]
    NotFound(String),

    #[error("Reference probe '{0}' is already acquired")]
    AlreadyAcquired(String),
}

/// Shared directory state
#[derive(Debug, Default)]
pub(crate) struct RegistryInner {
    /// Newest registration first
    probes: Mutex<Vec<Weak<ReferenceProbe>>>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, Vec<Weak<ReferenceProbe>>> {
        self.probes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove a probe that is being dropped
    pub(crate) fn unregister(&self, probe: *const ReferenceProbe) {
        let mut probes = self.lock();
        probes.retain(|entry| !std::ptr::eq(entry.as_ptr(), probe));
        tracing::debug!(remaining = probes.len(), "probe_unregistered");
    }
}

/// Process-scoped probe directory
///
/// Cloning yields another handle to the same directory.
///
/// # Example
/// ```
/// use aecsync_core::{ProbeRegistry, ProbeSettings, ReferenceProbe, RegistryError};
///
/// let registry = ProbeRegistry::new();
/// let _probe = ReferenceProbe::new(ProbeSettings::default(), &registry);
///
/// let handle = registry.acquire("probe0").unwrap();
/// assert!(matches!(registry.acquire("probe0"), Err(RegistryError::AlreadyAcquired(_))));
///
/// registry.release(handle);
/// assert!(registry.acquire("probe0").is_ok());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProbeRegistry {
    inner: Arc<RegistryInner>,
}

impl ProbeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn register(&self, probe: &Arc<ReferenceProbe>) {
        let mut probes = self.inner.lock();
        probes.insert(0, Arc::downgrade(probe));
        tracing::debug!(probe = probe.name(), registered = probes.len(), "probe_registered");
    }

    /// Acquire the first unacquired probe with the given name
    ///
    /// The scan and the acquired-flag update happen under the registry lock, so
    /// concurrent acquires of the same name yield exactly one success.
    pub fn acquire(&self, name: &str) -> Result<ProbeHandle, RegistryError> {
        // Upgraded probes are dropped only after the registry lock is released:
        // a probe dropped under the lock would deadlock unregistering itself.
        let mut visited: Vec<Arc<ReferenceProbe>> = Vec::new();
        let mut found_busy = false;
        let mut acquired = None;

        {
            let probes = self.inner.lock();
            for probe in probes.iter().filter_map(Weak::upgrade) {
                if probe.name() == name {
                    if probe.try_mark_acquired() {
                        acquired = Some(probe);
                        break;
                    }
                    found_busy = true;
                }
                visited.push(probe);
            }
        }
        drop(visited);

        match acquired {
            Some(probe) => {
                tracing::info!(probe = name, "probe_acquired");
                Ok(ProbeHandle { probe })
            }
            None if found_busy => Err(RegistryError::AlreadyAcquired(name.to_string())),
            None => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    /// Release a previously acquired probe
    ///
    /// Equivalent to dropping the handle.
    pub fn release(&self, handle: ProbeHandle) {
        drop(handle);
    }

    /// Number of live registered probes
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .iter()
            .filter(|probe| probe.strong_count() > 0)
            .count()
    }

    /// Whether no probe is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive hold on an acquired probe
///
/// Dropping the handle clears the acquired flag and releases the reference.
#[derive(Debug)]
pub struct ProbeHandle {
    probe: Arc<ReferenceProbe>,
}

impl ProbeHandle {
    /// The acquired probe
    pub fn probe(&self) -> &ReferenceProbe {
        &self.probe
    }
}

impl std::ops::Deref for ProbeHandle {
    type Target = ReferenceProbe;

    fn deref(&self) -> &Self::Target {
        &self.probe
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.probe.clear_acquired();
        tracing::info!(probe = self.probe.name(), "probe_released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeSettings;

    fn named(name: &str) -> ProbeSettings {
        ProbeSettings {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_register_on_create_unregister_on_drop() {
        let registry = ProbeRegistry::new();
        assert!(registry.is_empty());

        let probe = ReferenceProbe::new(named("a"), &registry);
        assert_eq!(registry.len(), 1);

        drop(probe);
        assert!(registry.is_empty());
        assert_eq!(registry.inner.lock().len(), 0);
    }

    #[test]
    fn test_acquire_unknown_name() {
        let registry = ProbeRegistry::new();
        let _probe = ReferenceProbe::new(named("a"), &registry);
        assert_eq!(
            registry.acquire("b").unwrap_err(),
            RegistryError::NotFound("b".to_string())
        );
    }

    #[test]
    fn test_acquire_is_exclusive() {
        let registry = ProbeRegistry::new();
        let probe = ReferenceProbe::new(named("a"), &registry);

        let handle = registry.acquire("a").unwrap();
        assert!(probe.is_acquired());
        assert_eq!(
            registry.acquire("a").unwrap_err(),
            RegistryError::AlreadyAcquired("a".to_string())
        );

        registry.release(handle);
        assert!(!probe.is_acquired());
        assert!(registry.acquire("a").is_ok());
    }

    #[test]
    fn test_same_name_probes_acquired_in_turn() {
        let registry = ProbeRegistry::new();
        let _first = ReferenceProbe::new(named("a"), &registry);
        let _second = ReferenceProbe::new(named("a"), &registry);

        let h1 = registry.acquire("a").unwrap();
        let h2 = registry.acquire("a").unwrap();
        assert!(!std::ptr::eq(h1.probe(), h2.probe()));
        assert!(registry.acquire("a").is_err());
    }

    #[test]
    fn test_handle_keeps_probe_registered() {
        let registry = ProbeRegistry::new();
        let probe = ReferenceProbe::new(named("a"), &registry);
        let handle = registry.acquire("a").unwrap();

        drop(probe);
        assert_eq!(registry.len(), 1);
        assert_eq!(handle.name(), "a");

        drop(handle);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_probe_outlives_registry() {
        let registry = ProbeRegistry::new();
        let probe = ReferenceProbe::new(named("a"), &registry);
        drop(registry);
        // Dropping after the registry is gone must not panic
        drop(probe);
    }
}
