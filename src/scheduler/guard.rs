//! Single-flight guard: at most one concurrent run per job class.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Atomic in-progress flag for one job class. Callers that lose the race must
/// skip the cycle, never wait for the slot.
pub struct SingleFlightGuard {
    name: &'static str,
    busy: AtomicBool,
}

impl SingleFlightGuard {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            busy: AtomicBool::new(false),
        })
    }

    /// Try to claim the slot. Returns a permit iff this call won the
    /// idle-to-busy transition; the permit releases the slot on drop, so the
    /// flag is cleared on every exit path of the guarded job.
    pub fn try_enter(self: &Arc<Self>) -> Option<FlightPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| FlightPermit {
                guard: Arc::clone(self),
            })
    }

    pub fn in_progress(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

pub struct FlightPermit {
    guard: Arc<SingleFlightGuard>,
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_exactly_one_winner_under_contention() {
        let guard = SingleFlightGuard::new("speed-check");
        let wins = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let guard = Arc::clone(&guard);
            let wins = Arc::clone(&wins);
            handles.push(std::thread::spawn(move || {
                if let Some(permit) = guard.try_enter() {
                    wins.fetch_add(1, Ordering::SeqCst);
                    // Hold the slot long enough for every other thread to lose.
                    std::thread::sleep(std::time::Duration::from_millis(50));
                    drop(permit);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_permit_drop_releases_slot() {
        let guard = SingleFlightGuard::new("ip-quality");
        let permit = guard.try_enter().unwrap();
        assert!(guard.in_progress());
        assert!(guard.try_enter().is_none());
        drop(permit);
        assert!(!guard.in_progress());
        assert!(guard.try_enter().is_some());
    }

    #[test]
    fn test_release_is_unconditional_on_panic() {
        let guard = SingleFlightGuard::new("speed-check");
        let g2 = Arc::clone(&guard);
        let result = std::thread::spawn(move || {
            let _permit = g2.try_enter().unwrap();
            panic!("job blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(!guard.in_progress());
    }
}
