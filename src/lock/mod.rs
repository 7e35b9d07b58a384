//! Lock Arbiter
//!
//! Serializes a critical section across independently launched processes
//! by taking one of N advisory lock slots. Callers in the same process are
//! additionally serialized by an in-process gate shared per lock directory.
//!
//! Cross-process exclusion is strict only with a single slot. With N > 1,
//! up to N processes may be inside at once; callers relying on that mode
//! must tolerate concurrent critical sections from other processes.
//!
//! The arbiter retries until it gets a slot. There is no timeout and no
//! cancellation; a caller that needs a deadline wraps the call itself.

pub mod file;

pub use file::{FileLockProvider, LockDirectory};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{LoaderError, Result};

/// Index of one lock slot, `0..N`.
pub type LockSlot = usize;

/// Non-blocking access to a fixed set of lock slots.
///
/// `try_acquire` returns `Ok(false)` on contention; `Err` means the slot
/// cannot be used at all and must not be retried.
pub trait LockProvider: Send + Sync {
    fn slot_count(&self) -> usize;
    fn try_acquire(&self, slot: LockSlot) -> Result<bool>;
    fn release(&self, slot: LockSlot) -> Result<()>;
}

/// Sleep between full scans that found every slot busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max: max.max(initial) }
    }

    /// Exponential delay for the given failed scan (0-based), capped,
    /// with up to 50% random jitter.
    pub fn delay(&self, failed_scans: u32) -> Duration {
        let factor = 1u32.checked_shl(failed_scans.min(16)).unwrap_or(u32::MAX);
        let base = self.initial.saturating_mul(factor).min(self.max);
        let base_ms = base.as_millis() as u64;
        if base_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
        Duration::from_millis(base_ms + jitter).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_millis(250))
    }
}

lazy_static::lazy_static! {
    /// In-process gates, one per lock directory, so that separate arbiters
    /// over the same directory still exclude each other inside one process.
    static ref PROCESS_GATES: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> = Mutex::new(HashMap::new());
}

fn process_gate(dir: &std::path::Path) -> Arc<Mutex<()>> {
    let key = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let mut gates = PROCESS_GATES.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    gates.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
}

/// Runs closures exclusively across every caller contending for the same
/// lock slots.
#[derive(Clone)]
pub struct LockArbiter {
    provider: Arc<dyn LockProvider>,
    gate: Arc<Mutex<()>>,
    backoff: BackoffPolicy,
    /// Slot the next scan starts from; rotates so one slot is not hammered.
    cursor: Arc<AtomicUsize>,
}

impl LockArbiter {
    /// Arbiter over an arbitrary provider with its own private in-process gate.
    pub fn new(provider: Arc<dyn LockProvider>) -> Result<Self> {
        if provider.slot_count() == 0 {
            return Err(LoaderError::Configuration("lock arbiter needs at least one slot".into()));
        }
        Ok(Self {
            provider,
            gate: Arc::new(Mutex::new(())),
            backoff: BackoffPolicy::default(),
            cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Arbiter over lock files in `layout`, sharing the in-process gate with
    /// every other arbiter on the same directory.
    pub fn for_directory(layout: LockDirectory) -> Result<Self> {
        if layout.slots() > 1 {
            warn!(
                "{} lock slots in {}: separate processes may run critical sections concurrently",
                layout.slots(),
                layout.dir().display()
            );
        }
        let gate = process_gate(layout.dir());
        let provider = FileLockProvider::new(layout)?;
        let mut arbiter = Self::new(Arc::new(provider))?;
        arbiter.gate = gate;
        Ok(arbiter)
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn slot_count(&self) -> usize {
        self.provider.slot_count()
    }

    /// Execute `critical_section` while holding a lock slot.
    ///
    /// The slot is released whether the closure returns or panics. Errors
    /// from opening a lock slot abort immediately.
    pub fn run_exclusively<F, R>(&self, critical_section: F) -> Result<R>
    where
        F: FnOnce() -> R,
    {
        let _gate = self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = self.acquire_any()?;
        let _held = SlotGuard {
            provider: self.provider.as_ref(),
            slot,
        };
        Ok(critical_section())
    }

    fn acquire_any(&self) -> Result<LockSlot> {
        let slots = self.provider.slot_count();
        let mut failed_scans: u32 = 0;
        loop {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % slots;
            for offset in 0..slots {
                let slot = (start + offset) % slots;
                if self.provider.try_acquire(slot)? {
                    return Ok(slot);
                }
            }

            let delay = self.backoff.delay(failed_scans);
            failed_scans = failed_scans.saturating_add(1);
            debug!("All {} lock slots busy (scan {}), retrying in {:?}", slots, failed_scans, delay);
            std::thread::sleep(delay);
        }
    }
}

struct SlotGuard<'a> {
    provider: &'a dyn LockProvider,
    slot: LockSlot,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.provider.release(self.slot) {
            warn!("Failed to release lock slot {}: {}", self.slot, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;
    use tempfile::tempdir;

    /// Reports every slot busy for the first `busy_attempts` acquire calls.
    struct ScriptedProvider {
        slots: usize,
        busy_attempts: u32,
        attempts: AtomicU32,
        held: Mutex<HashSet<LockSlot>>,
        releases: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(slots: usize, busy_attempts: u32) -> Self {
            Self {
                slots,
                busy_attempts,
                attempts: AtomicU32::new(0),
                held: Mutex::new(HashSet::new()),
                releases: AtomicU32::new(0),
            }
        }
    }

    impl LockProvider for ScriptedProvider {
        fn slot_count(&self) -> usize {
            self.slots
        }

        fn try_acquire(&self, slot: LockSlot) -> Result<bool> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.busy_attempts {
                return Ok(false);
            }
            Ok(self.held.lock().unwrap().insert(slot))
        }

        fn release(&self, slot: LockSlot) -> Result<()> {
            self.held.lock().unwrap().remove(&slot);
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenProvider;

    impl LockProvider for BrokenProvider {
        fn slot_count(&self) -> usize {
            2
        }
        fn try_acquire(&self, _slot: LockSlot) -> Result<bool> {
            Err(LoaderError::Configuration("permission denied".into()))
        }
        fn release(&self, _slot: LockSlot) -> Result<()> {
            Ok(())
        }
    }

    fn fast() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn test_retries_through_contention() {
        let provider = Arc::new(ScriptedProvider::new(3, 7));
        let arbiter = LockArbiter::new(provider.clone()).unwrap().with_backoff(fast());

        let value = arbiter.run_exclusively(|| 42).unwrap();

        assert_eq!(value, 42);
        // Seven refused attempts spread over three scans, then a grant.
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 8);
        assert_eq!(provider.releases.load(Ordering::SeqCst), 1);
        assert!(provider.held.lock().unwrap().is_empty());
    }

    #[test]
    fn test_open_failure_is_not_retried() {
        let arbiter = LockArbiter::new(Arc::new(BrokenProvider)).unwrap();
        let mut ran = false;
        let err = arbiter.run_exclusively(|| ran = true).unwrap_err();
        assert!(matches!(err, LoaderError::Configuration(_)));
        assert!(!ran);
    }

    #[test]
    fn test_slot_released_when_critical_section_panics() {
        let provider = Arc::new(ScriptedProvider::new(1, 0));
        let arbiter = LockArbiter::new(provider.clone()).unwrap();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            arbiter.run_exclusively(|| panic!("boom")).ok();
        }));

        assert!(outcome.is_err());
        assert_eq!(provider.releases.load(Ordering::SeqCst), 1);
        assert!(arbiter.run_exclusively(|| ()).is_ok());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(40));
        for scan in 0..40 {
            assert!(policy.delay(scan) <= Duration::from_millis(40));
        }
        assert!(policy.delay(0) >= Duration::from_millis(5));
    }

    /// Runs `sections` concurrent read-increment-write sections, one arbiter
    /// per thread, and returns (final counter, most sections seen inside at once).
    fn race_sections(arbiters: Vec<LockArbiter>) -> (u32, u32) {
        let counter = Arc::new(AtomicU32::new(0));
        let inside = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = arbiters
            .into_iter()
            .map(|arbiter| {
                let counter = counter.clone();
                let inside = inside.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    arbiter
                        .run_exclusively(|| {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            // Deliberately non-atomic read-increment-write.
                            let seen = counter.load(Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(5));
                            counter.store(seen + 1, Ordering::SeqCst);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        })
                        .unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        (counter.load(Ordering::SeqCst), peak.load(Ordering::SeqCst))
    }

    fn provisioned_layout(dir: &std::path::Path, slots: usize) -> LockDirectory {
        let layout = LockDirectory::new(dir, "stable_id.lock.", slots).unwrap();
        layout.provision().unwrap();
        layout
    }

    #[test]
    fn test_in_process_exclusion_with_three_file_slots() {
        let dir = tempdir().unwrap();
        let layout = provisioned_layout(dir.path(), 3);

        let arbiters = (0..10)
            .map(|_| LockArbiter::for_directory(layout.clone()).unwrap().with_backoff(fast()))
            .collect();
        let (counter, peak) = race_sections(arbiters);

        assert_eq!(counter, 10);
        assert_eq!(peak, 1);
    }

    #[test]
    fn test_file_lock_excludes_arbiters_with_private_gates() {
        // Each arbiter has its own gate and its own file handles, the same
        // position separate processes are in; only the file lock serializes.
        let dir = tempdir().unwrap();
        let layout = provisioned_layout(dir.path(), 1);

        let arbiters = (0..10)
            .map(|_| {
                let provider = FileLockProvider::new(layout.clone()).unwrap();
                LockArbiter::new(Arc::new(provider)).unwrap().with_backoff(fast())
            })
            .collect();
        let (counter, peak) = race_sections(arbiters);

        assert_eq!(counter, 10, "lost update between critical sections");
        assert_eq!(peak, 1, "critical sections overlapped");
    }

    #[test]
    fn test_private_gates_bounded_by_slot_count() {
        let dir = tempdir().unwrap();
        let layout = provisioned_layout(dir.path(), 3);

        let arbiters = (0..10)
            .map(|_| {
                let provider = FileLockProvider::new(layout.clone()).unwrap();
                LockArbiter::new(Arc::new(provider)).unwrap().with_backoff(fast())
            })
            .collect();
        let (_, peak) = race_sections(arbiters);

        assert!(peak <= 3, "{} holders with 3 slots", peak);
    }

    /// Grants every slot without locking anything.
    struct PermissiveProvider;

    impl LockProvider for PermissiveProvider {
        fn slot_count(&self) -> usize {
            1
        }
        fn try_acquire(&self, _slot: LockSlot) -> Result<bool> {
            Ok(true)
        }
        fn release(&self, _slot: LockSlot) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_race_detects_missing_exclusion() {
        let arbiters = (0..10)
            .map(|_| LockArbiter::new(Arc::new(PermissiveProvider)).unwrap())
            .collect();
        let (_, peak) = race_sections(arbiters);
        assert!(peak > 1);
    }
}
