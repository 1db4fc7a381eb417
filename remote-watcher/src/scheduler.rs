//! Poll timing.
//!
//! Intervals are measured from the completion of the previous poll, so a
//! slow poll never causes back-to-back polls.

use std::time::Duration;

use tokio::time::Instant;

/// When the next poll should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextPoll {
    /// On the next turn of the watcher loop.
    Now,

    /// At a deadline.
    At(Instant),
}

/// Tracks poll completions and the armed timer.
#[derive(Debug)]
pub struct PollScheduler {
    interval: Duration,
    last_completed: Option<Instant>,
    deadline: Option<Instant>,
    due: bool,
    poked: bool,
}

impl PollScheduler {
    /// Create a scheduler for a poll interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_completed: None,
            deadline: None,
            due: false,
            poked: false,
        }
    }

    /// Time left until the next poll is allowed.
    pub fn time_to_next_poll(&self, now: Instant) -> Duration {
        match self.last_completed {
            None => Duration::ZERO,
            Some(completed) => (completed + self.interval).saturating_duration_since(now),
        }
    }

    /// Decide the next poll and arm the timer accordingly.
    pub fn schedule(&mut self, now: Instant) -> NextPoll {
        let wait = self.time_to_next_poll(now);
        if wait.is_zero() {
            self.deadline = None;
            self.due = true;
            NextPoll::Now
        } else {
            let at = now + wait;
            self.deadline = Some(at);
            NextPoll::At(at)
        }
    }

    /// Request a poll on the next turn, cancelling any timer.
    ///
    /// Unlike a scheduled poll, a poke survives [`cancel`](Self::cancel).
    pub fn poke(&mut self) {
        self.deadline = None;
        self.poked = true;
    }

    /// Cancel the armed timer and any scheduled immediate poll.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.due = false;
    }

    /// The armed timer, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether a poll should start now; consumes the request.
    pub fn take_due(&mut self) -> bool {
        let due = self.due || self.poked;
        self.due = false;
        self.poked = false;
        due
    }

    /// Mark the armed timer as fired.
    pub fn fire(&mut self) {
        self.deadline = None;
        self.due = true;
    }

    /// Record the completion of a poll.
    pub fn completed(&mut self, at: Instant) {
        self.last_completed = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn first_poll_is_immediate() {
        let mut scheduler = PollScheduler::new(Duration::from_secs(60));
        let now = Instant::now();
        assert_eq!(scheduler.schedule(now), NextPoll::Now);
        assert!(scheduler.take_due());
        assert!(!scheduler.take_due());
    }

    #[test]
    fn waits_out_remaining_interval() {
        let mut scheduler = PollScheduler::new(Duration::from_secs(5));
        let start = Instant::now();
        scheduler.completed(start);

        let later = start + Duration::from_secs(2);
        assert_eq!(scheduler.time_to_next_poll(later), Duration::from_secs(3));
        assert_eq!(
            scheduler.schedule(later),
            NextPoll::At(start + Duration::from_secs(5))
        );
        assert_eq!(scheduler.deadline(), Some(start + Duration::from_secs(5)));

        let overdue = start + Duration::from_secs(9);
        assert_eq!(scheduler.schedule(overdue), NextPoll::Now);
        assert_eq!(scheduler.deadline(), None);
    }

    #[test]
    fn poke_cancels_timer() {
        let mut scheduler = PollScheduler::new(Duration::from_secs(5));
        let start = Instant::now();
        scheduler.completed(start);
        scheduler.schedule(start);
        assert!(scheduler.deadline().is_some());

        scheduler.poke();
        assert_eq!(scheduler.deadline(), None);
        assert!(scheduler.take_due());
    }

    #[test]
    fn cancel_keeps_poke() {
        let mut scheduler = PollScheduler::new(Duration::from_secs(5));
        scheduler.poke();
        scheduler.cancel();
        assert!(scheduler.take_due());

        scheduler.fire();
        scheduler.cancel();
        assert!(!scheduler.take_due());
    }
}
