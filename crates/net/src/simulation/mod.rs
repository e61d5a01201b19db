mod clock;

pub use clock::{DEFAULT_FRAME_RATE, FixedTimestep, FrameClock};
