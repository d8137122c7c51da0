//! Frame pacing: the work/render slot split, the turn gates between the
//! producer and the submitter, and per-frame statistics.

mod scheduler;
mod stats;

pub use scheduler::{FrameGates, FrameInfo, FrameScheduler, ListenerId, TurnGate};
pub use stats::{FrameStats, FrameStatsSnapshot};
