//! Conversion between the hardware cycle-counter domain and the profiler's
//! wall-clock sample-time domain.
//!
//! The conversion triple (shift, multiplier, zero offset) is delivered once in
//! the trace-info descriptor and never changes for the lifetime of a session.
//! Estimated and authoritative counter values convert identically; choosing
//! between them is the stream decoder's job.

/// Pure integer cycle <-> nanosecond converter.
///
/// `to_wall_time` computes `zero + (cycles * mult) >> shift` without losing
/// the low bits: the quotient and remainder of the shift are scaled
/// separately so the result is exact up to integer truncation.
#[derive(Clone, Copy, Debug)]
pub struct ClockConverter {
    time_shift: u32,
    time_mult: u32,
    time_zero: u64,
}

impl ClockConverter {
    pub fn new(time_shift: u32, time_mult: u32, time_zero: u64) -> Self {
        Self {
            time_shift,
            time_mult,
            time_zero,
        }
    }

    /// Convert a cycle-counter value to wall-clock nanoseconds.
    pub fn to_wall_time(&self, cycles: u64) -> u64 {
        let quot = cycles >> self.time_shift;
        let rem = cycles & ((1u64 << self.time_shift) - 1);
        self.time_zero
            .wrapping_add(quot * u64::from(self.time_mult))
            .wrapping_add((rem * u64::from(self.time_mult)) >> self.time_shift)
    }

    /// Convert wall-clock nanoseconds back to a cycle-counter value.
    pub fn to_cycles(&self, ns: u64) -> u64 {
        let ns = ns.saturating_sub(self.time_zero);
        let quot = ns / u64::from(self.time_mult);
        let rem = ns % u64::from(self.time_mult);
        (quot << self.time_shift) + ((rem << self.time_shift) / u64::from(self.time_mult))
    }

    /// One wall-clock unit of the converter's shift resolution: the error
    /// bound for a cycles -> time -> cycles round trip.
    pub fn resolution_ns(&self) -> u64 {
        (u64::from(self.time_mult) >> self.time_shift).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::ClockConverter;

    #[test]
    fn round_trip_within_resolution() {
        let tc = ClockConverter::new(10, 4242, 1 << 40);
        let eps = tc.resolution_ns() + 1;
        for &t in &[
            (1u64 << 40),
            (1 << 40) + 1,
            (1 << 40) + 123_456_789,
            (1 << 40) + (1 << 52),
            u64::MAX >> 4,
        ] {
            let back = tc.to_wall_time(tc.to_cycles(t));
            let diff = t.abs_diff(back);
            assert!(diff <= eps, "t={t} back={back} diff={diff} eps={eps}");
        }
    }

    #[test]
    fn zero_offset_is_identity_point() {
        let tc = ClockConverter::new(16, 1 << 16, 77);
        // shift and mult cancel out, so conversion is a pure offset.
        assert_eq!(tc.to_wall_time(0), 77);
        assert_eq!(tc.to_cycles(77), 0);
        assert_eq!(tc.to_wall_time(tc.to_cycles(1077)), 1077);
    }

    #[test]
    fn monotonic() {
        let tc = ClockConverter::new(13, 30_000, 0);
        let mut last = 0;
        for c in (0..10_000_000u64).step_by(999_983) {
            let ns = tc.to_wall_time(c);
            assert!(ns >= last);
            last = ns;
        }
    }
}
