use std::time::Instant;

/// Monotonic microsecond clock. Timestamps are relative to the moment the epoch was created.
#[derive(Clone, Copy, Debug)]
pub struct Epoch {
    time_base: Instant,
}

impl Epoch {
    pub fn new() -> Self {
        Self {
            time_base: Instant::now(),
        }
    }

    pub fn time_now_us(&self) -> u64 {
        self.time_base.elapsed().as_micros() as u64
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}
