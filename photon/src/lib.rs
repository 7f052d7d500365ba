/// Seconds between process-wide housekeeping ticks.
pub const NODE_BEAT: f64 = 10.0;

pub type StepSeq = u32;
pub type ChannelSeq = u32;
pub type WorkerIndex = u32;

pub mod logging;
pub mod shared;
pub mod time;
