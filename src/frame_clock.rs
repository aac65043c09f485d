//! Per-output frame timing.
//!
//! Tracks when frames were actually presented and predicts the next
//! presentation deadline, so compositing starts at the right time and
//! animations sample the time their frame will be on screen.

use std::time::Duration;

#[derive(Debug)]
pub struct FrameClock {
    refresh_interval: Option<Duration>,
    vrr: bool,
    last_presentation_time: Option<Duration>,
}

impl FrameClock {
    pub fn new(refresh_interval: Option<Duration>, vrr: bool) -> Self {
        Self {
            refresh_interval,
            vrr,
            last_presentation_time: None,
        }
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval
    }

    pub fn vrr(&self) -> bool {
        self.vrr
    }

    pub fn set_vrr(&mut self, vrr: bool) {
        if self.vrr != vrr {
            self.vrr = vrr;
            self.last_presentation_time = None;
        }
    }

    /// Records a presentation timestamp reported by the backend.
    ///
    /// A zero timestamp means the backend could not tell when the frame hit
    /// the screen; prediction then falls back to the current time.
    pub fn presented(&mut self, time: Duration) {
        if time.is_zero() {
            self.last_presentation_time = None;
            return;
        }

        if let Some(last) = self.last_presentation_time {
            if time <= last {
                // Out-of-order timestamps from the backend; the clock only
                // ever moves forward.
                warn!("presentation time went backwards: {last:?} -> {time:?}");
                return;
            }
        }

        self.last_presentation_time = Some(time);
    }

    pub fn next_presentation_time(&self, now: Duration) -> Duration {
        let Some(interval) = self.refresh_interval else {
            return now;
        };
        let Some(last) = self.last_presentation_time else {
            return now;
        };

        // With variable refresh the display will present whenever we submit.
        if self.vrr {
            return now.max(last);
        }

        if last >= now {
            return last + interval;
        }

        let since_last = now - last;
        let intervals_passed = since_last.as_nanos() / interval.as_nanos();
        let intervals = u32::try_from(intervals_passed + 1).unwrap_or(u32::MAX);
        last + interval * intervals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_nanos(16_666_667);

    #[test]
    fn predicts_next_vblank() {
        let mut clock = FrameClock::new(Some(INTERVAL), false);

        // No history: present as soon as possible.
        assert_eq!(clock.next_presentation_time(Duration::from_secs(1)), Duration::from_secs(1));

        clock.presented(Duration::from_secs(1));

        let now = Duration::from_secs(1) + Duration::from_millis(1);
        assert_eq!(
            clock.next_presentation_time(now),
            Duration::from_secs(1) + INTERVAL,
        );

        // A missed cycle skips ahead a whole interval.
        let now = Duration::from_secs(1) + Duration::from_millis(20);
        assert_eq!(
            clock.next_presentation_time(now),
            Duration::from_secs(1) + INTERVAL * 2,
        );
    }

    #[test]
    fn timestamps_are_monotonic() {
        let mut clock = FrameClock::new(Some(INTERVAL), false);
        clock.presented(Duration::from_secs(2));
        clock.presented(Duration::from_secs(1));

        assert_eq!(
            clock.next_presentation_time(Duration::from_secs(1)),
            Duration::from_secs(2) + INTERVAL,
        );
    }

    #[test]
    fn vrr_presents_immediately() {
        let mut clock = FrameClock::new(Some(INTERVAL), true);
        clock.presented(Duration::from_secs(1));

        let now = Duration::from_secs(1) + Duration::from_millis(3);
        assert_eq!(clock.next_presentation_time(now), now);
    }
}
