//! Realtime primitives shared by the audio IO backends.

pub mod dll;
pub mod freewheel;
pub mod queue;
pub mod stats;
pub mod thread;

pub use dll::{DelayLockedLoop, DEFAULT_DLL_BANDWIDTH};
pub use freewheel::{freewheel_channel, FreewheelControl, FreewheelError, FreewheelResponder};
pub use queue::{EventQueue, QueueError};
pub use stats::{CycleStats, DspLoadMeter};
pub use thread::{
    apply_realtime_priority, enable_ftz_daz, lock_memory, prepare_current_thread, spawn_realtime,
    RealtimeHints,
};
