//! Rank and missed-block accounting.
//!
//! Every SignCTRL process holds a rank. Rank 1 is the active signer, every
//! higher rank is a standby. Standbys count consecutive heights whose commit is
//! missing the active signer's signature and, once the threshold is reached,
//! move one rank closer to 1. The active signer cannot be promoted any further,
//! so reaching the threshold at rank 1 means the process must shut down.
//!
//! ## Counter lock
//!
//! Right after startup and after every reconnect the process has not yet seen
//! a live signature from the active signer, so it cannot tell a missed block
//! from a block it simply has not observed. While the counter is locked, misses
//! are not counted at all. This is what keeps a set of validators that was
//! started in the wrong order from promoting a standby next to a healthy
//! rank 1, which would end in a double-signature.

use thiserror::Error;
use tracing::{debug, info};

/// Smallest permitted threshold.
///
/// The height right after a threshold-triggered promotion still carries the
/// commit of the superseded signer and is skipped, so a threshold of 1 would
/// re-trigger promotion on that very height.
pub const MIN_THRESHOLD: u32 = 2;

/// Errors and control-flow signals of the rank counter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CounterError {
    #[error("waiting for first commitsig from validator to unlock counter for missed blocks in a row")]
    CounterLocked,

    #[error("threshold exceeded due to too many blocks missed in a row")]
    ThresholdExceeded,

    #[error("node cannot be promoted anymore, so it must be shut down")]
    MustShutdown,

    #[error("missed blocks in a row ({missed}) exceed threshold ({threshold})")]
    InvariantViolation { missed: u32, threshold: u32 },

    #[error("threshold must be at least {MIN_THRESHOLD}, got {0}")]
    InvalidThreshold(u32),

    #[error("rank must be at least 1, got {0}")]
    InvalidRank(u32),
}

impl CounterError {
    /// Whether the caller has to stop signing and terminate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CounterError::MustShutdown | CounterError::InvariantViolation { .. }
        )
    }
}

/// Progress report of a counted miss that stayed below the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissProgress {
    pub missed: u32,
    pub threshold: u32,
}

/// Observer of rank transitions.
///
/// Both hooks default to doing nothing, so implementors only override the
/// transitions they care about.
pub trait RankObserver: Send {
    /// Called once the threshold is reached, right before promotion is attempted.
    fn on_missed_too_many(&mut self, _threshold: u32) {}

    /// Called after a successful promotion.
    fn on_promote(&mut self, _from: u32, _to: u32) {}
}

/// Observer that ignores every transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RankObserver for NoopObserver {}

/// The rank/failover state machine.
pub struct RankCounter {
    counter_locked: bool,
    current_height: u64,
    missed_in_a_row: u32,
    threshold: u32,
    rank: u32,
    observer: Box<dyn RankObserver>,
}

impl std::fmt::Debug for RankCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankCounter")
            .field("counter_locked", &self.counter_locked)
            .field("current_height", &self.current_height)
            .field("missed_in_a_row", &self.missed_in_a_row)
            .field("threshold", &self.threshold)
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

impl RankCounter {
    /// Create a locked counter at genesis height.
    pub fn new(threshold: u32, rank: u32) -> Result<Self, CounterError> {
        Self::with_observer(threshold, rank, Box::new(NoopObserver))
    }

    /// Create a locked counter at genesis height that reports rank transitions
    /// to `observer`.
    pub fn with_observer(
        threshold: u32,
        rank: u32,
        observer: Box<dyn RankObserver>,
    ) -> Result<Self, CounterError> {
        if threshold < MIN_THRESHOLD {
            return Err(CounterError::InvalidThreshold(threshold));
        }
        if rank < 1 {
            return Err(CounterError::InvalidRank(rank));
        }

        Ok(Self {
            counter_locked: true,
            current_height: 1,
            missed_in_a_row: 0,
            threshold,
            rank,
            observer,
        })
    }

    /// Stop counting missed blocks in a row until the next `unlock_counter`.
    pub fn lock_counter(&mut self) {
        if !self.counter_locked {
            info!("Looking for first commitsig from validator after reconnect, stop counting missed blocks in a row...");
            self.counter_locked = true;
        }
    }

    /// Resume counting missed blocks in a row.
    pub fn unlock_counter(&mut self) {
        if self.counter_locked {
            info!("Found first commitsig from validator since fully synced, start counting missed blocks in a row...");
            self.counter_locked = false;
        }
    }

    pub fn is_locked(&self) -> bool {
        self.counter_locked
    }

    pub fn current_height(&self) -> u64 {
        self.current_height
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn missed_in_a_row(&self) -> u32 {
        self.missed_in_a_row
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Move the current height forward to `height`.
    ///
    /// Returns `false` and leaves the height untouched if `height` is not ahead
    /// of the current one.
    pub fn advance_to(&mut self, height: u64) -> bool {
        if height > self.current_height {
            self.current_height = height;
            true
        } else {
            false
        }
    }

    /// Move on to the next height.
    pub fn next_height(&mut self) {
        self.current_height += 1;
    }

    /// Count a missed block.
    ///
    /// Returns the progress towards the threshold if it has not been reached.
    /// Otherwise the validator is promoted and `ThresholdExceeded` tells the
    /// caller that the next height has already been skipped. At rank 1 the
    /// promotion fails and `MustShutdown` is returned instead.
    pub fn record_miss(&mut self) -> Result<MissProgress, CounterError> {
        if self.counter_locked {
            return Err(CounterError::CounterLocked);
        }
        if self.missed_in_a_row >= self.threshold {
            return Err(CounterError::InvariantViolation {
                missed: self.missed_in_a_row,
                threshold: self.threshold,
            });
        }

        self.missed_in_a_row += 1;
        if self.missed_in_a_row < self.threshold {
            info!(
                "Missed a block ({}/{})",
                self.missed_in_a_row, self.threshold
            );
            return Ok(MissProgress {
                missed: self.missed_in_a_row,
                threshold: self.threshold,
            });
        }

        info!(
            "Missed too many blocks in a row ({}/{})",
            self.missed_in_a_row, self.threshold
        );
        self.observer.on_missed_too_many(self.threshold);
        self.promote()?;

        // The next block carries the commit of the height we just counted as
        // missed, so it cannot contain our signature either.
        self.current_height += 1;
        Err(CounterError::ThresholdExceeded)
    }

    /// Reset the counter for missed blocks in a row.
    pub fn reset(&mut self) {
        if self.missed_in_a_row > 0 {
            debug!("Reset counter for missed blocks in a row");
            self.missed_in_a_row = 0;
        }
    }

    /// Move one rank up.
    ///
    /// Meant to be driven by `record_miss`; calling it directly bypasses the
    /// height skip that follows a threshold-triggered promotion.
    pub fn promote(&mut self) -> Result<(), CounterError> {
        if self.rank == 1 {
            return Err(CounterError::MustShutdown);
        }

        let from = self.rank;
        info!("Promote validator ({} -> {})", from, from - 1);
        self.rank -= 1;
        self.reset();
        self.observer.on_promote(from, self.rank);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn unlocked(threshold: u32, rank: u32) -> RankCounter {
        let mut counter = RankCounter::new(threshold, rank).unwrap();
        counter.unlock_counter();
        counter
    }

    #[derive(Default, Clone)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl RankObserver for Recorder {
        fn on_missed_too_many(&mut self, threshold: u32) {
            self.events
                .lock()
                .unwrap()
                .push(format!("missed_too_many/{threshold}"));
        }

        fn on_promote(&mut self, from: u32, to: u32) {
            self.events
                .lock()
                .unwrap()
                .push(format!("promote/{from}->{to}"));
        }
    }

    #[test]
    fn test_new_counter_is_locked_at_genesis() {
        let counter = RankCounter::new(3, 2).unwrap();
        assert!(counter.is_locked());
        assert_eq!(counter.current_height(), 1);
        assert_eq!(counter.missed_in_a_row(), 0);
        assert_eq!(counter.threshold(), 3);
        assert_eq!(counter.rank(), 2);
    }

    #[test]
    fn test_invalid_construction_rejected() {
        assert_eq!(
            RankCounter::new(1, 2).unwrap_err(),
            CounterError::InvalidThreshold(1)
        );
        assert_eq!(
            RankCounter::new(0, 2).unwrap_err(),
            CounterError::InvalidThreshold(0)
        );
        assert_eq!(RankCounter::new(2, 0).unwrap_err(), CounterError::InvalidRank(0));
    }

    #[test]
    fn test_locked_counter_ignores_misses() {
        let mut counter = RankCounter::new(2, 2).unwrap();
        for _ in 0..10 {
            assert_eq!(counter.record_miss(), Err(CounterError::CounterLocked));
        }
        assert_eq!(counter.missed_in_a_row(), 0);
        assert_eq!(counter.rank(), 2);
        assert_eq!(counter.current_height(), 1);

        counter.unlock_counter();
        assert_eq!(
            counter.record_miss(),
            Ok(MissProgress {
                missed: 1,
                threshold: 2
            })
        );
    }

    #[test]
    fn test_promotion_after_threshold() {
        let mut counter = unlocked(3, 3);
        counter.advance_to(10);

        assert_eq!(
            counter.record_miss(),
            Ok(MissProgress {
                missed: 1,
                threshold: 3
            })
        );
        assert_eq!(
            counter.record_miss(),
            Ok(MissProgress {
                missed: 2,
                threshold: 3
            })
        );
        assert_eq!(counter.record_miss(), Err(CounterError::ThresholdExceeded));

        assert_eq!(counter.rank(), 2);
        assert_eq!(counter.missed_in_a_row(), 0);
        assert_eq!(counter.current_height(), 11);
    }

    #[test]
    fn test_promotions_repeat_until_rank_one() {
        let mut counter = unlocked(2, 3);
        for expected_rank in [2, 1] {
            assert!(counter.record_miss().is_ok());
            assert_eq!(counter.record_miss(), Err(CounterError::ThresholdExceeded));
            assert_eq!(counter.rank(), expected_rank);
        }
        assert!(counter.record_miss().is_ok());
        assert_eq!(counter.record_miss(), Err(CounterError::MustShutdown));
    }

    #[test]
    fn test_rank_one_must_shut_down() {
        let mut counter = unlocked(2, 1);
        counter.advance_to(7);

        assert!(counter.record_miss().is_ok());
        let err = counter.record_miss().unwrap_err();
        assert_eq!(err, CounterError::MustShutdown);
        assert!(err.is_fatal());
        assert_eq!(counter.rank(), 1);
        assert_eq!(counter.current_height(), 7);
    }

    #[test]
    fn test_promote_at_rank_one_changes_nothing() {
        let mut counter = unlocked(3, 1);
        counter.record_miss().unwrap();
        assert_eq!(counter.promote(), Err(CounterError::MustShutdown));
        assert_eq!(counter.rank(), 1);
        assert_eq!(counter.missed_in_a_row(), 1);
        assert!(!counter.is_locked());
        assert_eq!(counter.current_height(), 1);
    }

    #[test]
    fn test_direct_promote_resets_without_skipping() {
        let mut counter = unlocked(3, 2);
        counter.record_miss().unwrap();
        counter.promote().unwrap();
        assert_eq!(counter.rank(), 1);
        assert_eq!(counter.missed_in_a_row(), 0);
        assert_eq!(counter.current_height(), 1);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut counter = unlocked(5, 2);
        counter.record_miss().unwrap();
        counter.record_miss().unwrap();
        counter.reset();
        assert_eq!(counter.missed_in_a_row(), 0);
        counter.reset();
        assert_eq!(counter.missed_in_a_row(), 0);
    }

    #[test]
    fn test_lock_unlock_round_trip() {
        let mut counter = RankCounter::new(2, 2).unwrap();
        counter.unlock_counter();
        counter.unlock_counter();
        assert!(!counter.is_locked());
        counter.lock_counter();
        counter.lock_counter();
        assert!(counter.is_locked());
        counter.unlock_counter();
        assert!(!counter.is_locked());
    }

    #[test]
    fn test_lock_keeps_partial_count() {
        let mut counter = unlocked(3, 2);
        counter.record_miss().unwrap();
        counter.lock_counter();
        assert_eq!(counter.record_miss(), Err(CounterError::CounterLocked));
        assert_eq!(counter.missed_in_a_row(), 1);
    }

    #[test]
    fn test_height_never_moves_backwards() {
        let mut counter = RankCounter::new(2, 2).unwrap();
        assert!(counter.advance_to(5));
        assert!(!counter.advance_to(3));
        assert!(!counter.advance_to(5));
        assert_eq!(counter.current_height(), 5);
        counter.next_height();
        assert_eq!(counter.current_height(), 6);
    }

    #[test]
    fn test_observer_sees_transitions_in_order() {
        let recorder = Recorder::default();
        let mut counter = RankCounter::with_observer(2, 2, Box::new(recorder.clone())).unwrap();
        counter.unlock_counter();

        counter.record_miss().unwrap();
        assert!(recorder.events.lock().unwrap().is_empty());

        assert_eq!(counter.record_miss(), Err(CounterError::ThresholdExceeded));
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["missed_too_many/2".to_string(), "promote/2->1".to_string()]
        );

        counter.record_miss().unwrap();
        assert_eq!(counter.record_miss(), Err(CounterError::MustShutdown));
        assert_eq!(
            recorder.events.lock().unwrap().last().map(String::as_str),
            Some("missed_too_many/2")
        );
    }
}
