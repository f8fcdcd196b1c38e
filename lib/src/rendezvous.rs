//! Single-shot cross-processor rendezvous.
//!
//! Every participating processor calls [`Rendezvous::arrive`]. The first one
//! to arrive becomes the leader: it waits until all participants have
//! arrived, runs the routine exactly once, then publishes completion. The
//! others spin until the leader is done, so the routine runs while every
//! other processor is known to be parked.
//!
//! # Known limitation
//!
//! There is no timeout. A participant that never arrives (an offline
//! processor, a miscounted participant total) hangs every caller forever.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct Rendezvous {
    participants: usize,
    arrived: AtomicUsize,
    done: AtomicBool,
}

impl Rendezvous {
    pub const fn new(participants: usize) -> Self {
        Self {
            participants,
            arrived: AtomicUsize::new(0),
            done: AtomicBool::new(false),
        }
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    /// Arrive at the barrier. The leader runs `routine` and gets `Some` of
    /// its result; everybody else gets `None` once the leader has finished.
    pub fn arrive<R>(&self, routine: impl FnOnce() -> R) -> Option<R> {
        let ticket = self.arrived.fetch_add(1, Ordering::AcqRel);
        if ticket == 0 {
            while self.arrived.load(Ordering::Acquire) < self.participants {
                core::hint::spin_loop();
            }
            let result = routine();
            self.done.store(true, Ordering::Release);
            Some(result)
        } else {
            while !self.done.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
            None
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_single_participant_runs_inline() {
        let rv = Rendezvous::new(1);
        assert_eq!(rv.arrive(|| 7), Some(7));
        assert!(rv.is_complete());
    }

    #[test]
    fn test_routine_runs_once_with_everyone_parked() {
        const CPUS: usize = 4;
        let rv = Arc::new(Rendezvous::new(CPUS));
        let runs = Arc::new(AtomicU32::new(0));
        let parked_at_run = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..CPUS)
            .map(|_| {
                let rv = Arc::clone(&rv);
                let runs = Arc::clone(&runs);
                let parked = Arc::clone(&parked_at_run);
                std::thread::spawn(move || {
                    rv.arrive(|| {
                        parked.store(rv.arrived.load(Ordering::Acquire), Ordering::Release);
                        runs.fetch_add(1, Ordering::AcqRel);
                    })
                    .is_some()
                })
            })
            .collect();

        let leaders = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|leader| *leader)
            .count();

        assert_eq!(leaders, 1);
        assert_eq!(runs.load(Ordering::Acquire), 1);
        assert_eq!(parked_at_run.load(Ordering::Acquire), CPUS);
    }
}
