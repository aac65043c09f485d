#[macro_use]
extern crate tracing;

pub mod animation;
pub mod backend;
pub mod buffer;
pub mod effect;
pub mod frame_clock;
pub mod output;
pub mod scene;
pub mod scrim;
pub mod utils;

pub use crate::scrim::{Scrim, State};
