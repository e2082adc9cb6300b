use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Identifier of one registered object.
///
/// Ids are handed out by the dispatcher from a rolling 32-bit counter. An id
/// is never issued while another live object holds it, even after the counter
/// has wrapped past `u32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u32);

impl ObjectId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw counter value
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<ObjectId> for u32 {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl FromStr for ObjectId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Rolling id allocator.
///
/// Allocation probes linearly from the last issued value and skips every
/// candidate the caller reports as live.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Start the counter at an arbitrary value. Mostly useful for exercising
    /// the wrap at `u32::MAX`.
    pub fn starting_at(next: u32) -> Self {
        Self { next }
    }

    /// Allocate the next id for which `is_live` returns false.
    ///
    /// ## Panics
    ///
    /// Panics if every one of the 2^32 ids is live.
    pub fn allocate(&mut self, mut is_live: impl FnMut(ObjectId) -> bool) -> ObjectId {
        let start = self.next;
        loop {
            let candidate = ObjectId(self.next);
            self.next = self.next.wrapping_add(1);
            if !is_live(candidate) {
                return candidate;
            }
            assert!(self.next != start, "object id space exhausted");
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
