//! Data types for the compositor core.

use std::collections::HashMap;
use std::time::Duration;

use calloop::RegistrationToken;

use crate::frame_clock::FrameClock;
use crate::scene::WindowId;
use crate::utils::geometry::Physical;
use crate::utils::region::Region;

// =============================================================================
// RedrawState
// =============================================================================

/// Render loop state, per output.
#[derive(Debug, Default)]
pub enum RedrawState {
    /// Nothing to do; the loop is dormant.
    #[default]
    Idle,
    /// A redraw will happen on the next dispatch.
    Queued,
    /// A frame was submitted; its vblank timer will fire at the target
    /// presentation time.
    WaitingForVBlank {
        token: RegistrationToken,
        redraw_needed: bool,
    },
    /// Nothing was submitted; a timer fires at the estimated vblank so
    /// frame callbacks keep their cadence.
    WaitingForEstimatedVBlank(RegistrationToken),
    /// A redraw is queued on top of the above.
    WaitingForEstimatedVBlankAndQueued(RegistrationToken),
}

impl RedrawState {
    pub fn queue_redraw(self) -> Self {
        match self {
            RedrawState::Idle => RedrawState::Queued,
            RedrawState::WaitingForEstimatedVBlank(token) => {
                RedrawState::WaitingForEstimatedVBlankAndQueued(token)
            }

            // A redraw is already queued.
            value @ (RedrawState::Queued | RedrawState::WaitingForEstimatedVBlankAndQueued(_)) => {
                value
            }

            // A frame is in flight; redraw right after it presents.
            RedrawState::WaitingForVBlank { token, .. } => RedrawState::WaitingForVBlank {
                token,
                redraw_needed: true,
            },
        }
    }
}

// =============================================================================
// Render bookkeeping
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderResult {
    /// The frame was handed to the backend.
    Submitted,
    /// Nothing needed painting.
    NoDamage,
    /// Rendering failed or was not possible.
    Skipped,
}

/// Which parts of the output each window actually painted last frame.
#[derive(Debug, Default)]
pub struct PaintStats {
    pub painted: HashMap<WindowId, Region<Physical>>,
}

impl PaintStats {
    pub fn painted_region(&self, window: WindowId) -> Option<&Region<Physical>> {
        self.painted.get(&window)
    }

    pub fn painted_windows(&self) -> impl Iterator<Item = WindowId> + '_ {
        self.painted.keys().copied()
    }
}

/// A submitted frame waiting for its vblank.
#[derive(Debug)]
pub struct InFlightFrame {
    pub target_presentation_time: Duration,
    pub sequence: u64,
    pub painted: Vec<WindowId>,
}

pub struct OutputState {
    pub frame_clock: FrameClock,
    pub redraw_state: RedrawState,
    /// Effects requested more frames during the last paint.
    pub unfinished_animations_remain: bool,
    /// Bumped once per refresh cycle; throttles frame callbacks.
    pub frame_callback_sequence: u32,
    pub in_flight: Option<InFlightFrame>,
    pub last_paint_stats: Option<PaintStats>,
}

impl OutputState {
    pub fn new(frame_clock: FrameClock) -> Self {
        Self {
            frame_clock,
            redraw_state: RedrawState::Idle,
            unfinished_animations_remain: false,
            frame_callback_sequence: 0,
            in_flight: None,
            last_paint_stats: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queueing_is_idempotent() {
        let state = RedrawState::Idle.queue_redraw();
        assert!(matches!(state, RedrawState::Queued));
        let state = state.queue_redraw();
        assert!(matches!(state, RedrawState::Queued));
    }
}
