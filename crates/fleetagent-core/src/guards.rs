//! Named single-flight flags for operations that must never overlap.
//!
//! Acquisition never waits: a held guard means the caller reports "busy" and
//! does nothing. State lives only as long as the process.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardName {
    OsUpdateScan,
    OsUpdateInstall,
    SelfUpdate,
}

impl GuardName {
    fn index(self) -> usize {
        match self {
            GuardName::OsUpdateScan => 0,
            GuardName::OsUpdateInstall => 1,
            GuardName::SelfUpdate => 2,
        }
    }
}

impl fmt::Display for GuardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuardName::OsUpdateScan => "os-update-scan",
            GuardName::OsUpdateInstall => "os-update-install",
            GuardName::SelfUpdate => "self-update",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Default)]
pub struct GuardSet {
    flags: Arc<[AtomicBool; 3]>,
}

impl GuardSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically move `name` from free to held. Returns whether this call won.
    pub fn try_acquire(&self, name: GuardName) -> bool {
        self.flags[name.index()]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark `name` free, whoever holds it.
    pub fn release(&self, name: GuardName) {
        self.flags[name.index()].store(false, Ordering::Release);
    }

    pub fn is_held(&self, name: GuardName) -> bool {
        self.flags[name.index()].load(Ordering::Acquire)
    }

    /// Like [`try_acquire`](Self::try_acquire), but the guard is released when
    /// the returned permit is dropped.
    pub fn try_hold(&self, name: GuardName) -> Option<GuardPermit> {
        self.try_acquire(name).then(|| GuardPermit {
            guards: self.clone(),
            name,
            released: false,
        })
    }
}

/// Holds a guard until dropped or explicitly released.
pub struct GuardPermit {
    guards: GuardSet,
    name: GuardName,
    released: bool,
}

impl GuardPermit {
    pub fn name(&self) -> GuardName {
        self.name
    }

    pub fn release(mut self) {
        self.guards.release(self.name);
        self.released = true;
    }
}

impl Drop for GuardPermit {
    fn drop(&mut self) {
        if !self.released {
            self.guards.release(self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let guards = GuardSet::new();
        assert!(guards.try_acquire(GuardName::SelfUpdate));
        assert!(!guards.try_acquire(GuardName::SelfUpdate));
        guards.release(GuardName::SelfUpdate);
        assert!(guards.try_acquire(GuardName::SelfUpdate));
    }

    #[test]
    fn guards_are_independent() {
        let guards = GuardSet::new();
        assert!(guards.try_acquire(GuardName::OsUpdateScan));
        assert!(guards.try_acquire(GuardName::OsUpdateInstall));
        assert!(!guards.is_held(GuardName::SelfUpdate));
    }

    #[test]
    fn permit_releases_on_drop() {
        let guards = GuardSet::new();
        {
            let permit = guards.try_hold(GuardName::OsUpdateScan).unwrap();
            assert_eq!(permit.name(), GuardName::OsUpdateScan);
            assert!(guards.try_hold(GuardName::OsUpdateScan).is_none());
        }
        assert!(!guards.is_held(GuardName::OsUpdateScan));
    }

    #[test]
    fn clones_share_state() {
        let guards = GuardSet::new();
        let other = guards.clone();
        let permit = guards.try_hold(GuardName::SelfUpdate).unwrap();
        assert!(!other.try_acquire(GuardName::SelfUpdate));
        permit.release();
        assert!(other.try_acquire(GuardName::SelfUpdate));
    }

    #[test]
    fn release_of_free_guard_is_harmless() {
        let guards = GuardSet::new();
        guards.release(GuardName::OsUpdateInstall);
        assert!(!guards.is_held(GuardName::OsUpdateInstall));
    }

    #[tokio::test]
    async fn concurrent_acquire_has_one_winner() {
        let guards = GuardSet::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let guards = guards.clone();
            handles.push(tokio::spawn(async move {
                guards.try_acquire(GuardName::SelfUpdate)
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
