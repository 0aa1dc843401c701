use std::time::Duration;

use shared::domain::RoomId;
use tokio::{task::JoinHandle, time::Instant};

/// Rate limit for outbound `typing` emissions.
#[derive(Debug)]
pub struct TypingThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl TypingThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Returns true when an emission is allowed at `now`, and records it.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_emit = None;
    }
}

/// "Other participant is typing" flag for one room, with its auto-clear timer.
///
/// Every signal bumps the epoch; a clear timer only takes effect if the epoch
/// it was armed with is still current.
#[derive(Debug, Default)]
pub struct TypingIndicator {
    room: Option<RoomId>,
    epoch: u64,
    clear_task: Option<JoinHandle<()>>,
}

impl TypingIndicator {
    pub fn is_active(&self) -> bool {
        self.room.is_some()
    }

    pub fn is_active_for(&self, room_id: RoomId) -> bool {
        self.room == Some(room_id)
    }

    /// Marks `room_id` as typing and cancels the previous clear timer.
    /// Returns the epoch the new timer must be armed with, and whether the
    /// flag was off before.
    pub fn signal(&mut self, room_id: RoomId) -> (u64, bool) {
        self.abort_timer();
        let was_active = self.is_active_for(room_id);
        self.room = Some(room_id);
        self.epoch += 1;
        (self.epoch, !was_active)
    }

    pub fn arm(&mut self, clear_task: JoinHandle<()>) {
        self.abort_timer();
        self.clear_task = Some(clear_task);
    }

    /// Called by the clear timer. Returns the room that stopped typing, unless
    /// a newer signal arrived in the meantime.
    pub fn expire(&mut self, epoch: u64) -> Option<RoomId> {
        if epoch != self.epoch {
            return None;
        }
        self.clear_task = None;
        self.room.take()
    }

    /// Forgets the flag and cancels the timer. Returns the room that was
    /// typing, if any.
    pub fn reset(&mut self) -> Option<RoomId> {
        self.abort_timer();
        self.epoch += 1;
        self.room.take()
    }

    fn abort_timer(&mut self) {
        if let Some(task) = self.clear_task.take() {
            task.abort();
        }
    }
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        self.abort_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_allows_one_emission_per_interval() {
        let mut throttle = TypingThrottle::new(Duration::from_millis(800));
        let start = Instant::now();

        assert!(throttle.try_acquire(start));
        assert!(!throttle.try_acquire(start + Duration::from_millis(100)));
        assert!(!throttle.try_acquire(start + Duration::from_millis(799)));
        assert!(throttle.try_acquire(start + Duration::from_millis(800)));

        throttle.reset();
        assert!(throttle.try_acquire(start + Duration::from_millis(801)));
    }

    #[test]
    fn stale_epoch_does_not_clear_a_refreshed_flag() {
        let mut indicator = TypingIndicator::default();
        let (first, turned_on) = indicator.signal(RoomId(1));
        assert!(turned_on);
        let (second, turned_on) = indicator.signal(RoomId(1));
        assert!(!turned_on);

        assert_eq!(indicator.expire(first), None);
        assert!(indicator.is_active_for(RoomId(1)));
        assert_eq!(indicator.expire(second), Some(RoomId(1)));
        assert!(!indicator.is_active());
    }

    #[test]
    fn reset_invalidates_pending_expiry() {
        let mut indicator = TypingIndicator::default();
        let (epoch, _) = indicator.signal(RoomId(3));
        assert_eq!(indicator.reset(), Some(RoomId(3)));
        assert_eq!(indicator.expire(epoch), None);
        assert!(!indicator.is_active_for(RoomId(3)));
    }
}
