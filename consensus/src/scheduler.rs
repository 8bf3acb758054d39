//! Frame timing
//!
//! Frames are aligned to the Unix epoch so independently started nodes tick
//! together without coordinating. Each frame carries two triggers: publish at
//! the frame start and pull+advance half a frame later.

use chrono::Utc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Periodic trigger at a fixed offset into every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSchedule {
    /// Frame length
    pub frame: Duration,

    /// Offset of the trigger inside the frame
    pub offset: Duration,
}

impl FrameSchedule {
    /// Trigger at the start of every frame
    pub fn publish(frame: Duration) -> Self {
        Self {
            frame,
            offset: Duration::ZERO,
        }
    }

    /// Trigger half a frame in
    pub fn pull(frame: Duration) -> Self {
        Self {
            frame,
            offset: frame / 2,
        }
    }

    /// Delay from `now_ms` (epoch millis) to the next trigger
    pub fn delay_from(&self, now_ms: u64) -> Duration {
        let frame = (self.frame.as_millis() as u64).max(1);
        let offset = self.offset.as_millis() as u64 % frame;
        let position = now_ms % frame;
        let wait = if position < offset {
            offset - position
        } else {
            frame - position + offset
        };
        Duration::from_millis(wait)
    }

    /// Delay from the current wall clock to the next trigger
    pub fn delay_from_now(&self) -> Duration {
        self.delay_from(Utc::now().timestamp_millis().max(0) as u64)
    }

    /// Ticker firing on this schedule; late ticks are skipped, never bunched
    pub fn interval(&self) -> Interval {
        let period = self.frame.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + self.delay_from_now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_publish_aligns_to_frame_start() {
        let schedule = FrameSchedule::publish(Duration::from_millis(2_000));
        assert_eq!(schedule.delay_from(10_000), Duration::from_millis(2_000));
        assert_eq!(schedule.delay_from(10_500), Duration::from_millis(1_500));
        assert_eq!(schedule.delay_from(11_999), Duration::from_millis(1));
    }

    #[test]
    fn test_pull_offset() {
        let schedule = FrameSchedule::pull(Duration::from_millis(2_000));
        assert_eq!(schedule.offset, Duration::from_millis(1_000));
        assert_eq!(schedule.delay_from(10_000), Duration::from_millis(1_000));
        assert_eq!(schedule.delay_from(11_000), Duration::from_millis(2_000));
        assert_eq!(schedule.delay_from(11_400), Duration::from_millis(1_600));
    }

    #[test]
    fn test_nodes_started_apart_share_boundaries() {
        let schedule = FrameSchedule::pull(Duration::from_millis(500));
        let a = 1_000_123 + schedule.delay_from(1_000_123).as_millis() as u64;
        let b = 1_000_200 + schedule.delay_from(1_000_200).as_millis() as u64;
        assert_eq!(a % 500, 250);
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn test_trigger_lands_on_offset(now in 0u64..10_000_000_000, frame in 1u64..60_000) {
            let schedule = FrameSchedule::pull(Duration::from_millis(frame));
            let wait = schedule.delay_from(now).as_millis() as u64;
            prop_assert!(wait >= 1 && wait <= frame);
            prop_assert_eq!((now + wait) % frame, (frame / 2) % frame);
        }
    }

    #[tokio::test]
    async fn test_interval_ticks() {
        let mut ticker = FrameSchedule::publish(Duration::from_millis(20)).interval();
        let started = Instant::now();
        ticker.tick().await;
        ticker.tick().await;
        assert!(started.elapsed() <= Duration::from_millis(500));
    }
}
