//! Serial number arithmetic over the 32-bit sequence space (RFC 1982).
//!
//! Two sequence numbers may only be compared while they lie within 2^31 of one another.

pub type Sqn = u32;

#[inline]
pub fn lt(a: Sqn, b: Sqn) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn lte(a: Sqn, b: Sqn) -> bool {
    a == b || lt(a, b)
}

#[inline]
pub fn gt(a: Sqn, b: Sqn) -> bool {
    (b.wrapping_sub(a) as i32) < 0
}

#[inline]
pub fn gte(a: Sqn, b: Sqn) -> bool {
    a == b || gt(a, b)
}

/// Number of sequence numbers in the inclusive range `[trail, lead]`, or zero when the range is
/// empty (`lead == trail - 1`).
#[inline]
pub fn span(trail: Sqn, lead: Sqn) -> u32 {
    lead.wrapping_add(1).wrapping_sub(trail)
}

/// Transmission group arithmetic for groups of `2^shift` packets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GroupMask {
    shift: u32,
}

impl GroupMask {
    pub fn new(group_size: u32) -> Self {
        assert!(
            group_size.is_power_of_two(),
            "transmission group size must be a power of two"
        );

        Self {
            shift: group_size.trailing_zeros(),
        }
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn group_size(&self) -> u32 {
        1 << self.shift
    }

    fn mask(&self) -> u32 {
        0xffff_ffff_u32.checked_shl(self.shift).unwrap_or(0)
    }

    /// Sequence number of the first packet of the group containing `sqn`.
    pub fn tg_sqn(&self, sqn: Sqn) -> Sqn {
        sqn & self.mask()
    }

    /// Offset of `sqn` within its transmission group. For parity NAKs this is the requested
    /// packet count.
    pub fn pkt_sqn(&self, sqn: Sqn) -> u32 {
        sqn & !self.mask()
    }

    pub fn is_last_of_group(&self, sqn: Sqn) -> bool {
        self.pkt_sqn(sqn.wrapping_add(1)) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWEEP_SIZE: u32 = 64;

    #[test]
    fn wraparound() {
        assert!(lt(u32::MAX, 0));
        assert!(gt(0, u32::MAX));
        assert!(lte(u32::MAX, 0));
        assert!(gte(0, u32::MAX));
        assert!(!lt(0, u32::MAX));
        assert!(!gt(u32::MAX, 0));
    }

    #[test]
    fn equality() {
        for a in [0, 1, 0x7fff_ffff, 0x8000_0000, u32::MAX] {
            assert!(lte(a, a));
            assert!(gte(a, a));
            assert!(!lt(a, a));
            assert!(!gt(a, a));
        }
    }

    #[test]
    fn transitive_across_wrap() {
        let base = 0_u32.wrapping_sub(SWEEP_SIZE / 2);

        for i in 0..SWEEP_SIZE {
            for j in i + 1..SWEEP_SIZE {
                for k in j + 1..SWEEP_SIZE {
                    let a = base.wrapping_add(i);
                    let b = base.wrapping_add(j);
                    let c = base.wrapping_add(k);

                    assert!(lt(a, b) && lt(b, c));
                    assert!(lt(a, c));
                    assert!(gt(c, a));
                }
            }
        }
    }

    #[test]
    fn half_space_limit() {
        assert!(lt(0, 0x7fff_ffff));
        assert!(gt(0, 0x8000_0001));
    }

    #[test]
    fn span_of_window() {
        assert_eq!(span(0, u32::MAX), 0);
        assert_eq!(span(0, 0), 1);
        assert_eq!(span(u32::MAX - 1, 1), 4);
    }

    #[test]
    fn group_mask() {
        let mask = GroupMask::new(8);

        assert_eq!(mask.shift(), 3);
        assert_eq!(mask.tg_sqn(21), 16);
        assert_eq!(mask.pkt_sqn(21), 5);
        assert!(mask.is_last_of_group(23));
        assert!(!mask.is_last_of_group(22));
        assert!(mask.is_last_of_group(u32::MAX));
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn group_mask_invalid() {
        GroupMask::new(6);
    }
}
