//! Sequence number comparisons that stay correct across wraparound.

/// Mask covering the 16 bit sequence number space.
pub const SEQ_MASK: u32 = 0xffff;

/// Compare if lhs is less than rhs, taking wrapping into account.
///
/// If lhs is close to the mask and rhs is close to 0, lhs is assumed to
/// have wrapped and is considered smaller. The shorter of the two walking
/// distances determines the order.
pub fn compare_less_wrap(lhs: u32, rhs: u32, mask: u32) -> bool {
    let dist_down = lhs.wrapping_sub(rhs) & mask;
    let dist_up = rhs.wrapping_sub(lhs) & mask;

    dist_up < dist_down
}

/// True if lhs is strictly less than rhs in the 16 bit sequence space.
pub fn seq_less(lhs: u16, rhs: u16) -> bool {
    compare_less_wrap(u32::from(lhs), u32::from(rhs), SEQ_MASK)
}

/// True if lhs is less than or equal to rhs in the 16 bit sequence space.
pub fn seq_less_equal(lhs: u16, rhs: u16) -> bool {
    lhs == rhs || seq_less(lhs, rhs)
}

/// Distance walking upwards from `from` to `to` in the 16 bit sequence space.
pub fn seq_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

/// Advance a sequence number by the given amount, wrapping around.
pub fn seq_add(seq: u16, amount: u16) -> u16 {
    seq.wrapping_add(amount)
}

#[cfg(test)]
mod tests {

    #[test]
    fn positive_less_than_no_wrap() {
        assert!(super::seq_less(1, 2));
        assert!(!super::seq_less(2, 1));
        assert!(!super::seq_less(2, 2));
    }

    #[test]
    fn positive_less_than_wrap() {
        assert!(super::seq_less(0xffff, 0));
        assert!(super::seq_less(0xfff0, 0x000f));
        assert!(!super::seq_less(0x000f, 0xfff0));
    }

    #[test]
    fn positive_distance_wraps() {
        assert_eq!(1, super::seq_distance(0xffff, 0));
        assert_eq!(5, super::seq_distance(0xfffe, 3));
        assert_eq!(0, super::seq_distance(100, 100));
    }

    #[test]
    fn positive_half_space_boundary() {
        // Distances of exactly half the space order by the upward walk.
        assert!(!super::seq_less(0, 0x8000));
        assert!(super::seq_less(0, 0x7fff));
    }

    #[test]
    fn positive_add_wraps() {
        assert_eq!(0, super::seq_add(0xffff, 1));
        assert_eq!(4, super::seq_add(0xfffe, 6));
    }
}
