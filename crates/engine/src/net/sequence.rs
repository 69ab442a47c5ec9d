use std::fmt;

pub const SEQUENCE_RANGE: u64 = 1 << 16;
pub const HALFWAY_POINT: u16 = 1 << 15;
pub const QUARTER_POINT: u16 = 1 << 14;

/// Wrapping 16-bit counter compared against a half-range horizon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SequenceNumber(pub u16);

impl SequenceNumber {
    pub fn value(self) -> u16 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub fn wrapping_add(self, n: u16) -> Self {
        Self(self.0.wrapping_add(n))
    }

    pub fn wrapping_sub(self, n: u16) -> Self {
        Self(self.0.wrapping_sub(n))
    }

    /// Forward distance from `earlier` to `self`, modulo the range.
    pub fn distance_from(self, earlier: SequenceNumber) -> u16 {
        self.0.wrapping_sub(earlier.0)
    }

    #[inline]
    pub fn is_greater_than(self, other: SequenceNumber) -> bool {
        sequence_greater_than(self.0, other.0)
    }

    pub fn is_less_than(self, other: SequenceNumber) -> bool {
        other.is_greater_than(self)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[inline]
pub fn sequence_greater_than(a: u16, b: u16) -> bool {
    let half = i32::from(HALFWAY_POINT);
    let diff = i32::from(a) - i32::from(b);
    (diff > 0 && diff <= half) || diff < -half
}

/// Promotes wrapping sequence numbers to a monotonic absolute counter.
///
/// After a wrap the translator stays "near the epoch" until the highest value
/// seen reaches the halfway point; inside that window, values in the upper half
/// of the range belong to the previous epoch.
#[derive(Debug, Default, Clone)]
pub struct AbsoluteSequenceNumberTranslator {
    highest: Option<SequenceNumber>,
    epoch: u64,
    near_epoch: bool,
}

impl AbsoluteSequenceNumberTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn highest(&self) -> Option<SequenceNumber> {
        self.highest
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn translate(&mut self, sequence: SequenceNumber) -> u64 {
        match self.highest {
            None => self.highest = Some(sequence),
            Some(highest) if sequence.is_greater_than(highest) => {
                if sequence.0 < highest.0 {
                    self.epoch += 1;
                    self.near_epoch = true;
                }
                self.highest = Some(sequence);
            }
            Some(_) => {}
        }

        if self.near_epoch && self.highest.is_some_and(|h| h.0 >= HALFWAY_POINT) {
            self.near_epoch = false;
        }

        let base = self.epoch * SEQUENCE_RANGE;
        if self.near_epoch && sequence.0 >= HALFWAY_POINT {
            base - SEQUENCE_RANGE + u64::from(sequence.0)
        } else {
            base + u64::from(sequence.0)
        }
    }
}
