//! Priority values, the priority map and the two-level priority bitmap
//!
//! Application-visible priorities follow the classic real-time convention:
//! a lower number is more urgent. Each scheduler instance maps its
//! configured range onto a dense index used to size ready-queue arrays.

use core::fmt;

use crate::error::{SchedError, SchedResult};

/// Highest configurable priority number (least urgent level)
pub const MAX_PRIORITY: u32 = 255;

/// Number of dense priority levels a bitmap can track
pub const PRIORITY_LEVELS: usize = 256;

/// Application-visible priority. Lower values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub u32);

impl Priority {
    /// Most urgent priority
    pub const HIGHEST: Priority = Priority(0);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// True if `self` is strictly more urgent than `other`
    pub fn is_higher_than(self, other: Priority) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority as cached by a scheduler node.
///
/// `value` is in the scheduler's internal order (lower first). For fixed
/// priority schedulers it is the dense index, for EDF it is an absolute
/// deadline or a background-band priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodePriority {
    pub value: u64,
    /// Place ahead of equal-priority peers on the next requeue
    pub prepend_it: bool,
}

impl NodePriority {
    pub const fn new(value: u64) -> Self {
        Self {
            value,
            prepend_it: false,
        }
    }

    pub const fn prepend(value: u64) -> Self {
        Self {
            value,
            prepend_it: true,
        }
    }
}

/// EDF node priorities at or above this value are background priorities,
/// below it they are absolute deadlines.
pub const EDF_BACKGROUND: u64 = 1 << 63;

impl NodePriority {
    /// EDF priority of a job due at the absolute tick `deadline`
    pub fn deadline(deadline: u64) -> Self {
        Self::new(deadline.min(EDF_BACKGROUND - 1))
    }

    /// EDF priority belongs to a released job
    pub fn is_deadline(&self) -> bool {
        self.value < EDF_BACKGROUND
    }
}

/// Bidirectional mapping between application priorities `[min, max]` and
/// dense indices `[0, max - min]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityMap {
    min: u32,
    max: u32,
}

impl PriorityMap {
    /// Map covering `[0, max]`
    pub const fn new(max: Priority) -> Self {
        Self { min: 0, max: max.0 }
    }

    /// Map covering `[min, max]`; `None` for an empty or oversized range.
    pub fn with_range(min: Priority, max: Priority) -> Option<Self> {
        if min.0 > max.0 || (max.0 - min.0) as usize >= PRIORITY_LEVELS {
            None
        } else {
            Some(Self {
                min: min.0,
                max: max.0,
            })
        }
    }

    pub fn min(&self) -> Priority {
        Priority(self.min)
    }

    pub fn max(&self) -> Priority {
        Priority(self.max)
    }

    /// Number of dense levels
    pub fn levels(&self) -> usize {
        (self.max - self.min) as usize + 1
    }

    pub fn is_valid(&self, priority: Priority) -> bool {
        priority.0 >= self.min && priority.0 <= self.max
    }

    /// Application priority to dense index
    pub fn map(&self, priority: Priority) -> SchedResult<usize> {
        if self.is_valid(priority) {
            Ok((priority.0 - self.min) as usize)
        } else {
            Err(SchedError::InvalidPriority { priority })
        }
    }

    /// Dense index back to application priority
    pub fn unmap(&self, index: usize) -> Option<Priority> {
        if index < self.levels() {
            Some(Priority(self.min + index as u32))
        } else {
            None
        }
    }

    /// EDF background priority: behind every deadline, ordered by
    /// `priority` among threads without a job.
    pub fn map_background(&self, priority: Priority) -> SchedResult<NodePriority> {
        self.map(priority)
            .map(|index| NodePriority::new(EDF_BACKGROUND | index as u64))
    }

    pub fn unmap_background(&self, priority: NodePriority) -> Option<Priority> {
        if priority.is_deadline() {
            return None;
        }
        self.unmap((priority.value & !EDF_BACKGROUND) as usize)
    }

    /// POSIX priorities grow with urgency; `max` is the least urgent level.
    pub fn to_posix(&self, priority: Priority) -> SchedResult<u32> {
        self.map(priority).map(|index| (self.levels() - 1 - index) as u32)
    }

    pub fn from_posix(&self, posix: u32) -> SchedResult<Priority> {
        let levels = self.levels() as u32;
        if posix >= levels {
            return Err(SchedError::InvalidPriority {
                priority: Priority(posix),
            });
        }
        Ok(Priority(self.min + (levels - 1 - posix)))
    }
}

/// Two-level bitmap over [`PRIORITY_LEVELS`] dense levels.
///
/// Bit `minor` of `minors[major]` is set iff level `major * 16 + minor` is
/// non-empty; bit `major` of `major` is set iff `minors[major] != 0`.
#[derive(Debug, Clone, Default)]
pub struct PriorityBitMap {
    major: u16,
    minors: [u16; 16],
}

impl PriorityBitMap {
    pub const fn new() -> Self {
        Self {
            major: 0,
            minors: [0; 16],
        }
    }

    #[inline]
    fn split(level: usize) -> (usize, usize) {
        (level / 16, level % 16)
    }

    pub fn add(&mut self, level: usize) {
        debug_assert!(level < PRIORITY_LEVELS);
        let (major, minor) = Self::split(level & (PRIORITY_LEVELS - 1));
        self.minors[major] |= 1 << minor;
        self.major |= 1 << major;
    }

    pub fn remove(&mut self, level: usize) {
        debug_assert!(level < PRIORITY_LEVELS);
        let (major, minor) = Self::split(level & (PRIORITY_LEVELS - 1));
        self.minors[major] &= !(1 << minor);
        if self.minors[major] == 0 {
            self.major &= !(1 << major);
        }
    }

    pub fn contains(&self, level: usize) -> bool {
        if level >= PRIORITY_LEVELS {
            return false;
        }
        let (major, minor) = Self::split(level);
        self.minors[major] & (1 << minor) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.major == 0
    }

    /// Most urgent non-empty level
    pub fn highest(&self) -> Option<usize> {
        if self.major == 0 {
            return None;
        }
        let major = self.major.trailing_zeros() as usize;
        let minor = self.minors[major].trailing_zeros() as usize;
        Some(major * 16 + minor)
    }

    /// Next non-empty level strictly after `level`
    pub fn next_after(&self, level: usize) -> Option<usize> {
        let start = level + 1;
        if start >= PRIORITY_LEVELS {
            return None;
        }
        let (major, minor) = Self::split(start);
        let rest = self.minors[major] & (!0u16 << minor);
        if rest != 0 {
            return Some(major * 16 + rest.trailing_zeros() as usize);
        }
        if major == 15 {
            return None;
        }
        let majors = self.major & (!0u16 << (major + 1));
        if majors == 0 {
            return None;
        }
        let next = majors.trailing_zeros() as usize;
        Some(next * 16 + self.minors[next].trailing_zeros() as usize)
    }
}
