// belt_probe/src/extras/session_guard.rs
// Admission control for probe sessions: at most one may be active.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::extras::probe_helper::ProbeError;

const FREE: u64 = 0;

/// Shared "a session is active" flag.
///
/// Cloning the guard shares the flag. The flag holds the id of the lease that
/// owns it, so a stale lease can never clear a newer session.
#[derive(Debug, Clone)]
pub struct SessionGuard {
    owner: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
}

impl Default for SessionGuard {
    fn default() -> Self {
        SessionGuard {
            owner: Arc::new(AtomicU64::new(FREE)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl SessionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.owner.load(Ordering::Acquire) != FREE
    }

    /// Marks a session active, or fails if one already is. Never blocks.
    pub fn try_acquire(&self) -> Result<SessionLease, ProbeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.owner
            .compare_exchange(FREE, id, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ProbeError::SessionConflict)?;
        debug!("probe session {} acquired", id);
        Ok(SessionLease {
            owner: Some(self.owner.clone()),
            id,
        })
    }

    /// Clears the flag regardless of which lease holds it.
    /// Releasing an idle guard is tolerated.
    pub fn release(&self) {
        if self.owner.swap(FREE, Ordering::AcqRel) == FREE {
            warn!("probe session guard released while idle");
        }
    }
}

/// Proof of admission. Released explicitly at finalize, or on drop.
#[derive(Debug)]
pub struct SessionLease {
    owner: Option<Arc<AtomicU64>>,
    id: u64,
}

impl SessionLease {
    pub fn is_held(&self) -> bool {
        self.owner.is_some()
    }

    /// Gives up the lease. Only the first call has an effect.
    pub fn release(&mut self) {
        if let Some(owner) = self.owner.take() {
            if owner
                .compare_exchange(self.id, FREE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!("probe session {} released", self.id);
            }
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_conflicts() {
        let guard = SessionGuard::new();
        let lease = guard.try_acquire().unwrap();
        assert!(guard.is_active());
        assert!(lease.is_held());
        assert_eq!(guard.try_acquire().unwrap_err(), ProbeError::SessionConflict);
        assert!(guard.is_active());
    }

    #[test]
    fn test_release_is_idempotent() {
        let guard = SessionGuard::new();
        let mut lease = guard.try_acquire().unwrap();
        lease.release();
        assert!(!guard.is_active());
        assert!(!lease.is_held());

        let _next = guard.try_acquire().unwrap();
        // A second release of the old lease must not free the new session
        lease.release();
        assert!(guard.is_active());
    }

    #[test]
    fn test_drop_releases() {
        let guard = SessionGuard::new();
        {
            let _lease = guard.try_acquire().unwrap();
            assert!(guard.is_active());
        }
        assert!(!guard.is_active());
        assert!(guard.try_acquire().is_ok());
    }

    #[test]
    fn test_release_when_idle_is_noop() {
        let guard = SessionGuard::new();
        guard.release();
        assert!(!guard.is_active());
        let shared = guard.clone();
        let _lease = guard.try_acquire().unwrap();
        assert!(shared.is_active());
        shared.release();
        assert!(!guard.is_active());
    }
}
