//! Round-trip measurement and remote clock estimation.

mod info;
mod sync;

pub use info::{DEFAULT_PING_INTERVAL, PING_SAMPLE_COUNT, PingInfo};
pub use sync::FrameSynchronizer;
