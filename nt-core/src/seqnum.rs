//! 16-bit wrapping sequence numbers.

/// Per-entry sequence number. Comparison uses a half-range window so the
/// counter can wrap; values exactly 32768 apart are not ordered either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SequenceNumber(pub u16);

impl SequenceNumber {
    pub fn value(self) -> u16 {
        self.0
    }

    /// Next value, wrapping 65535 to 0.
    pub fn next(self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    /// is_newer_than(2, 1) is true, (1, 2) false, (1, 1) false,
    /// (0, 65535) true.
    pub fn is_newer_than(self, other: SequenceNumber) -> bool {
        let (a, b) = (self.0, other.0);
        (a > b && a - b < 32768) || (a < b && b - a > 32768)
    }
}

impl From<u16> for SequenceNumber {
    fn from(v: u16) -> Self {
        SequenceNumber(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn s(v: u16) -> SequenceNumber {
        SequenceNumber(v)
    }

    #[test]
    fn ordering_basics() {
        assert!(s(2).is_newer_than(s(1)));
        assert!(!s(1).is_newer_than(s(2)));
        assert!(!s(1).is_newer_than(s(1)));
    }

    #[test]
    fn wraps_around() {
        assert!(s(0).is_newer_than(s(65535)));
        assert!(!s(65535).is_newer_than(s(0)));
        assert_eq!(s(65535).next(), s(0));
        assert!(s(10).is_newer_than(s(65530)));
    }

    #[test]
    fn antipodal_is_unordered() {
        assert!(!s(0).is_newer_than(s(32768)));
        assert!(!s(32768).is_newer_than(s(0)));
        assert!(!s(100).is_newer_than(s(32868)));
        assert!(!s(32868).is_newer_than(s(100)));
    }

    #[test]
    fn sampled_pairs_are_antisymmetric() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let a = s(rng.gen());
            let b = s(rng.gen());
            assert!(!(a.is_newer_than(b) && b.is_newer_than(a)), "{a:?} {b:?}");
            if a != b && a.0.wrapping_sub(b.0) != 32768 {
                assert!(a.is_newer_than(b) || b.is_newer_than(a), "{a:?} {b:?}");
            }
        }
    }

    #[test]
    fn next_is_always_newer() {
        let mut rng = rand::thread_rng();
        for _ in 0..1_000 {
            let a = s(rng.gen());
            assert!(a.next().is_newer_than(a));
        }
    }
}
