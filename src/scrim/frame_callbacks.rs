//! Frame callbacks and presentation feedback to clients.
//!
//! The protocol layer drains these queues and turns them into the actual
//! wire events; the core only decides who gets notified and when.

use std::time::Duration;

use bitflags::bitflags;

use crate::scene::WindowId;
use crate::utils::get_monotonic_time;

use super::Scrim;
use crate::output::Output;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FeedbackFlags: u32 {
        /// Presentation was synchronized to vblank.
        const VSYNC = 1;
        /// The timestamp came from the display hardware clock.
        const HW_CLOCK = 1 << 1;
    }
}

/// Tells a client when and how its content was actually shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationFeedback {
    pub window: WindowId,
    pub time: Duration,
    /// Duration of one refresh cycle, if the output has a fixed cadence.
    pub refresh: Option<Duration>,
    pub sequence: u64,
    pub flags: FeedbackFlags,
}

/// Frame-done event: a good moment for the client to draw its next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCallback {
    pub window: WindowId,
    pub time: Duration,
}

impl Scrim {
    /// Sends throttled frame callbacks to every live window visible on the
    /// output: at most one per window per refresh cycle, to avoid
    /// empty-damage commit busy loops.
    pub fn send_frame_callbacks(&mut self, output: &Output) {
        let _span = tracy_client::span!("Scrim::send_frame_callbacks");

        let Some(state) = self.outputs.get(output) else {
            return;
        };
        let sequence = state.frame_callback_sequence;
        let time = get_monotonic_time();
        let output_geometry = output.geometry();

        for &id in self.scene.stacking() {
            if self.scene.is_remnant(id) {
                // The client behind a remnant is gone.
                continue;
            }
            let Some(window) = self.scene.window(id) else {
                continue;
            };
            if !window.bounds().overlaps(output_geometry) {
                continue;
            }

            let already_sent = self
                .frame_callback_state
                .get(&id)
                .is_some_and(|(last_output, last_sequence)| {
                    last_output == output && *last_sequence == sequence
                });
            if already_sent {
                continue;
            }

            self.frame_callback_state
                .insert(id, (output.clone(), sequence));
            self.pending_frame_callbacks
                .push_back(FrameCallback { window: id, time });
        }
    }

    /// Frame-done events queued since the last drain.
    pub fn drain_frame_callbacks(&mut self) -> Vec<FrameCallback> {
        self.pending_frame_callbacks.drain(..).collect()
    }

    /// Presentation feedback queued since the last drain.
    pub fn drain_presentation_feedback(&mut self) -> Vec<PresentationFeedback> {
        self.pending_presentation_feedback.drain(..).collect()
    }
}
