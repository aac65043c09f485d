//! Animation timing.
//!
//! Animations sample a shared [`Clock`] rather than wall time. The render
//! loop sets the clock to the target presentation time of the frame being
//! composited, so every animation in a frame agrees on "now" and tests can
//! drive time by hand.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use keyframe::functions::{EaseOutCubic, EaseOutExpo, EaseOutQuad, Linear};
use keyframe::EasingFunction;

use crate::utils::{get_monotonic_time, mul_duration};

#[derive(Debug, Clone, Default)]
pub struct Clock {
    inner: Rc<RefCell<ClockInner>>,
}

#[derive(Debug)]
struct ClockInner {
    time_override: Option<Duration>,
    slowdown: f64,
}

impl Default for ClockInner {
    fn default() -> Self {
        Self {
            time_override: None,
            slowdown: 1.,
        }
    }
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.inner
            .borrow()
            .time_override
            .unwrap_or_else(get_monotonic_time)
    }

    /// Pins the clock to a fixed time until the next call.
    pub fn set(&self, time: Duration) {
        self.inner.borrow_mut().time_override = Some(time);
    }

    pub fn slowdown(&self) -> f64 {
        self.inner.borrow().slowdown
    }

    pub fn set_slowdown(&self, slowdown: f64) {
        if slowdown.is_finite() && slowdown > 0. {
            self.inner.borrow_mut().slowdown = slowdown;
        }
    }
}

impl PartialEq for Clock {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    Linear,
    EaseOutQuad,
    EaseOutCubic,
    EaseOutExpo,
}

impl Curve {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Curve::Linear => Linear.y(x),
            Curve::EaseOutQuad => EaseOutQuad.y(x),
            Curve::EaseOutCubic => EaseOutCubic.y(x),
            Curve::EaseOutExpo => EaseOutExpo.y(x),
        }
    }
}

impl From<scrim_config::Curve> for Curve {
    fn from(curve: scrim_config::Curve) -> Self {
        match curve {
            scrim_config::Curve::Linear => Curve::Linear,
            scrim_config::Curve::EaseOutQuad => Curve::EaseOutQuad,
            scrim_config::Curve::EaseOutCubic => Curve::EaseOutCubic,
            scrim_config::Curve::EaseOutExpo => Curve::EaseOutExpo,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Animation {
    clock: Clock,
    from: f64,
    to: f64,
    started_at: Duration,
    duration: Duration,
    curve: Curve,
}

impl Animation {
    pub fn new(clock: Clock, from: f64, to: f64, config: scrim_config::Animation) -> Self {
        let duration = Duration::from_millis(u64::from(config.duration_ms.unwrap_or(150)));
        let duration = mul_duration(duration, clock.slowdown());
        let curve = config.curve.map_or(Curve::EaseOutCubic, Curve::from);
        let started_at = clock.now();

        Self {
            clock,
            from,
            to,
            started_at,
            duration,
            curve,
        }
    }

    pub fn from(&self) -> f64 {
        self.from
    }

    pub fn to(&self) -> f64 {
        self.to
    }

    pub fn is_done(&self) -> bool {
        self.clock.now() >= self.started_at + self.duration
    }

    pub fn value(&self) -> f64 {
        if self.duration.is_zero() {
            return self.to;
        }

        let elapsed = self.clock.now().saturating_sub(self.started_at);
        let t = (elapsed.as_secs_f64() / self.duration.as_secs_f64()).clamp(0., 1.);
        self.from + (self.to - self.from) * self.curve.apply(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_the_clock() {
        let clock = Clock::new();
        clock.set(Duration::ZERO);

        let anim = Animation::new(
            clock.clone(),
            0.,
            1.,
            scrim_config::Animation {
                duration_ms: Some(100),
                curve: Some(scrim_config::Curve::Linear),
            },
        );

        assert_eq!(anim.value(), 0.);
        assert!(!anim.is_done());

        clock.set(Duration::from_millis(50));
        assert!((anim.value() - 0.5).abs() < 1e-9);

        clock.set(Duration::from_millis(100));
        assert_eq!(anim.value(), 1.);
        assert!(anim.is_done());

        // Values never overshoot past the end.
        clock.set(Duration::from_millis(500));
        assert_eq!(anim.value(), 1.);
    }

    #[test]
    fn eased_values_are_monotonic() {
        let clock = Clock::new();
        clock.set(Duration::ZERO);

        let anim = Animation::new(
            clock.clone(),
            1.,
            0.,
            scrim_config::Animation {
                duration_ms: Some(100),
                curve: Some(scrim_config::Curve::EaseOutExpo),
            },
        );

        let mut prev = anim.value();
        for ms in (10..=100).step_by(10) {
            clock.set(Duration::from_millis(ms));
            let value = anim.value();
            assert!(value <= prev, "fade-out must be non-increasing");
            prev = value;
        }
        assert!(prev.abs() < 1e-2);
    }

    #[test]
    fn slowdown_stretches_duration() {
        let clock = Clock::new();
        clock.set(Duration::ZERO);
        clock.set_slowdown(2.);

        let anim = Animation::new(
            clock.clone(),
            0.,
            1.,
            scrim_config::Animation {
                duration_ms: Some(100),
                curve: Some(scrim_config::Curve::Linear),
            },
        );

        clock.set(Duration::from_millis(100));
        assert!(!anim.is_done());
        clock.set(Duration::from_millis(200));
        assert!(anim.is_done());
    }
}
