//! Single-flight slot shared by the gated job kinds.
//!
//! ```text
//! empty --[try_acquire]--> occupied(kind) --[guard dropped]--> empty
//! ```
//!
//! Release happens in [`SlotGuard`]'s `Drop`, so every exit path of a job
//! body (return, `?`, panic, task abort) frees the slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::job::JobKind;

const EMPTY: u8 = 0;

/// Process-wide slot holding at most one in-flight gated job.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencySlot {
    state: Arc<AtomicU8>,
}

impl ConcurrencySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Occupy the slot for `kind`, or report which kind already holds it.
    pub fn try_acquire(&self, kind: JobKind) -> Result<SlotGuard, JobKind> {
        match self
            .state
            .compare_exchange(EMPTY, kind.code(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(SlotGuard {
                state: Arc::clone(&self.state),
                kind,
            }),
            // A code that fails to decode cannot be stored by this type; treat it as the requester.
            Err(code) => Err(JobKind::from_code(code).unwrap_or(kind)),
        }
    }

    /// The kind currently holding the slot.
    pub fn current(&self) -> Option<JobKind> {
        JobKind::from_code(self.state.load(Ordering::Acquire))
    }

    pub fn is_occupied(&self) -> bool {
        self.current().is_some()
    }
}

/// Scoped ownership of the slot; releases it on drop.
#[derive(Debug)]
pub struct SlotGuard {
    state: Arc<AtomicU8>,
    kind: JobKind,
}

impl SlotGuard {
    pub fn kind(&self) -> JobKind {
        self.kind
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.state.store(EMPTY, Ordering::Release);
        tracing::debug!(job = %self.kind, "Released job slot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release() {
        let slot = ConcurrencySlot::new();
        assert_eq!(slot.current(), None);

        let guard = slot.try_acquire(JobKind::Full).unwrap();
        assert_eq!(guard.kind(), JobKind::Full);
        assert_eq!(slot.current(), Some(JobKind::Full));

        drop(guard);
        assert_eq!(slot.current(), None);
    }

    #[test]
    fn second_acquire_reports_holder() {
        let slot = ConcurrencySlot::new();
        let _guard = slot.try_acquire(JobKind::Full).unwrap();

        let err = slot.try_acquire(JobKind::Incremental).unwrap_err();
        assert_eq!(err, JobKind::Full);
        assert_eq!(slot.current(), Some(JobKind::Full));
    }

    #[test]
    fn clones_share_state() {
        let slot = ConcurrencySlot::new();
        let other = slot.clone();
        let _guard = slot.try_acquire(JobKind::PriceUpdate).unwrap();
        assert!(other.is_occupied());
        assert!(other.try_acquire(JobKind::Full).is_err());
    }

    #[test]
    fn panic_while_held_releases_slot() {
        let slot = ConcurrencySlot::new();
        let inner = slot.clone();

        let result = std::panic::catch_unwind(move || {
            let _guard = inner.try_acquire(JobKind::Full).unwrap();
            panic!("job body exploded");
        });

        assert!(result.is_err());
        assert_eq!(slot.current(), None);
        assert!(slot.try_acquire(JobKind::Incremental).is_ok());
    }

    #[test]
    fn concurrent_acquire_has_single_winner() {
        let slot = ConcurrencySlot::new();
        let winners: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let slot = slot.clone();
                    s.spawn(move || slot.try_acquire(JobKind::Incremental).ok())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(winners.iter().filter(|g| g.is_some()).count(), 1);
    }
}
