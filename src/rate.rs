//! Leaky bucket admission control.
//!
//! The bucket holds a token budget in bytes. Each check refills the budget in proportion to the
//! time elapsed since the previous check, capped at one interval's worth of tokens, then charges
//! the packet plus its IP header. The interval is a millisecond when the rate covers at least one
//! maximum-size packet per millisecond, and a second otherwise.

use parking_lot::Mutex;

use crate::error::RateError;
use crate::session::Epoch;

const US_PER_SEC: i64 = 1_000_000;
const US_PER_MSEC: i64 = 1_000;

struct BucketState {
    // Remaining budget in bytes; negative while a blocking send is paying off its deficit
    rate_limit: i64,
    last_check: u64,
}

pub struct RateBucket {
    rate_per_sec: i64,
    // Non-zero when refilling at millisecond granularity
    rate_per_msec: i64,
    iphdr_len: i64,
    epoch: Epoch,
    state: Mutex<BucketState>,
}

impl RateBucket {
    /// Creates a bucket admitting `rate_per_sec` bytes per second. A rate of zero disables
    /// limiting.
    pub fn new(rate_per_sec: u64, iphdr_len: usize, max_tpdu: usize, epoch: Epoch) -> Self {
        let rate_per_sec = rate_per_sec as i64;
        let rate_per_msec = if rate_per_sec / 1000 >= max_tpdu as i64 {
            rate_per_sec / 1000
        } else {
            0
        };

        let rate_limit = if rate_per_msec != 0 {
            rate_per_msec
        } else {
            rate_per_sec
        };

        Self {
            rate_per_sec,
            rate_per_msec,
            iphdr_len: iphdr_len as i64,
            state: Mutex::new(BucketState {
                rate_limit,
                last_check: epoch.time_now_us(),
            }),
            epoch,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.rate_per_sec != 0
    }

    pub fn rate_per_sec(&self) -> u64 {
        self.rate_per_sec as u64
    }

    fn refilled(&self, state: &BucketState, now: u64) -> i64 {
        let elapsed = now.saturating_sub(state.last_check) as i64;

        if self.rate_per_msec != 0 {
            if elapsed > US_PER_MSEC {
                self.rate_per_msec
            } else {
                let limit = state.rate_limit + self.rate_per_msec * elapsed / US_PER_MSEC;
                limit.min(self.rate_per_msec)
            }
        } else if elapsed > US_PER_SEC {
            self.rate_per_sec
        } else {
            let limit = state.rate_limit + self.rate_per_sec * elapsed / US_PER_SEC;
            limit.min(self.rate_per_sec)
        }
    }

    fn cost(&self, size: usize) -> i64 {
        self.iphdr_len + size as i64
    }

    /// Admits `size` bytes at time `now`, or returns `WouldBlock` without modifying the bucket.
    pub fn try_check(&self, size: usize, now: u64) -> Result<(), RateError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut state = self.state.lock();

        let limit = self.refilled(&state, now) - self.cost(size);
        if limit < 0 {
            return Err(RateError::WouldBlock);
        }

        state.rate_limit = limit;
        state.last_check = now;

        Ok(())
    }

    /// Admits `size` bytes. When `allow_block` is set, an over-budget send is committed and the
    /// calling thread yields until the deficit has cleared.
    pub fn check(&self, size: usize, allow_block: bool) -> Result<(), RateError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let now = self.epoch.time_now_us();

        if !allow_block {
            return self.try_check(size, now);
        }

        let mut state = self.state.lock();

        state.rate_limit = self.refilled(&state, now) - self.cost(size);
        state.last_check = now;

        while state.rate_limit < 0 {
            std::thread::yield_now();

            let now = self.epoch.time_now_us();
            let elapsed = now.saturating_sub(state.last_check) as i64;
            let refill = self.rate_per_sec * elapsed / US_PER_SEC;

            if state.rate_limit + refill >= 0 {
                state.rate_limit += refill;
                state.last_check = now;
            }
        }

        Ok(())
    }

    /// Time in microseconds until `size` bytes would be admitted.
    pub fn remaining(&self, size: usize, now: u64) -> u64 {
        if !self.is_enabled() {
            return 0;
        }

        let state = self.state.lock();

        let deficit = self.cost(size) - self.refilled(&state, now);
        if deficit <= 0 {
            0
        } else {
            (deficit * US_PER_SEC / self.rate_per_sec).max(1) as u64
        }
    }
}

/// Admits `size` bytes through both `major` and `minor`, or through neither.
pub fn try_check_pair(
    major: &RateBucket,
    minor: &RateBucket,
    size: usize,
    now: u64,
) -> Result<(), RateError> {
    if !minor.is_enabled() {
        return major.try_check(size, now);
    }
    if !major.is_enabled() {
        return minor.try_check(size, now);
    }

    let mut major_state = major.state.lock();
    let mut minor_state = minor.state.lock();

    let major_limit = major.refilled(&major_state, now) - major.cost(size);
    let minor_limit = minor.refilled(&minor_state, now) - minor.cost(size);

    if major_limit < 0 || minor_limit < 0 {
        return Err(RateError::WouldBlock);
    }

    major_state.rate_limit = major_limit;
    major_state.last_check = now;
    minor_state.rate_limit = minor_limit;
    minor_state.last_check = now;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(rate_per_sec: u64, max_tpdu: usize) -> RateBucket {
        RateBucket::new(rate_per_sec, 0, max_tpdu, Epoch::new())
    }

    #[test]
    fn zero_rate_always_admits() {
        let b = bucket(0, 1500);

        for size in [0, 1, 1500, 65535, usize::MAX / 2] {
            assert_eq!(b.try_check(size, 0), Ok(()));
            assert_eq!(b.check(size, false), Ok(()));
        }
        assert_eq!(b.remaining(1_000_000, 0), 0);
    }

    #[test]
    fn per_second_budget() {
        let b = bucket(10_000, 1500);
        let t0 = b.state.lock().last_check;

        // Pre-filled with one second of tokens
        for _ in 0..10 {
            assert_eq!(b.try_check(1000, t0), Ok(()));
        }
        assert_eq!(b.try_check(1000, t0), Err(RateError::WouldBlock));

        // A rejected check does not touch the bucket
        assert_eq!(b.state.lock().rate_limit, 0);

        // 100ms refills 1000 bytes
        assert_eq!(b.remaining(1000, t0), 100_000);
        assert_eq!(b.try_check(1000, t0 + 100_000), Ok(()));
        assert_eq!(b.try_check(1, t0 + 100_000), Err(RateError::WouldBlock));
    }

    #[test]
    fn per_millisecond_budget() {
        // 1.5 MB/s covers one 1500-byte packet per millisecond
        let b = bucket(1_500_000, 1500);
        let t0 = b.state.lock().last_check;

        assert_eq!(b.rate_per_msec, 1500);
        assert_eq!(b.try_check(1500, t0), Ok(()));
        assert_eq!(b.try_check(1, t0), Err(RateError::WouldBlock));

        // Refill is capped at one millisecond's worth
        assert_eq!(b.try_check(1500, t0 + 10_000_000), Ok(()));
        assert_eq!(b.try_check(1, t0 + 10_000_000), Err(RateError::WouldBlock));
    }

    #[test]
    fn header_overhead_is_charged() {
        let b = RateBucket::new(1000, 28, 1500, Epoch::new());
        let t0 = b.state.lock().last_check;

        assert_eq!(b.try_check(972, t0), Ok(()));
        assert_eq!(b.try_check(0, t0), Err(RateError::WouldBlock));
    }

    #[test]
    fn blocking_check_pays_deficit() {
        // 1 MB/s: a 2000-byte deficit clears in about 2ms
        let b = bucket(1_000_000, 1500);

        let start = std::time::Instant::now();
        assert_eq!(b.check(1_000_000, true), Ok(()));
        assert_eq!(b.check(2000, true), Ok(()));
        assert!(start.elapsed() >= std::time::Duration::from_micros(1500));
    }

    #[test]
    fn pair_admits_both_or_neither() {
        let major = bucket(10_000, 1500);
        let minor = bucket(2_000, 1500);
        let t0 = major.state.lock().last_check.max(minor.state.lock().last_check);

        assert_eq!(try_check_pair(&major, &minor, 1000, t0), Ok(()));
        assert_eq!(try_check_pair(&major, &minor, 1000, t0), Ok(()));
        assert_eq!(
            try_check_pair(&major, &minor, 1000, t0),
            Err(RateError::WouldBlock)
        );

        // Major still holds the tokens the minor bucket refused
        assert_eq!(major.try_check(8000, t0), Ok(()));
    }
}
