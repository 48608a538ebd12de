//! Utilities for globally unique identifiers.

use std::fmt::{Debug, Formatter};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UUID: AtomicU64 = AtomicU64::new(1);

/// A process wide unique identifier.
///
/// Used to track native objects across recreation cycles where the raw vulkan
/// handle may be reused by the driver.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UUID(NonZeroU64);

impl UUID {
    pub fn new() -> Self {
        let id = NEXT_UUID.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(id).unwrap())
    }

    pub const fn from_raw(id: u64) -> Self {
        if id == 0u64 {
            panic!("Zero id")
        }
        Self(unsafe { NonZeroU64::new_unchecked(id) })
    }

    pub const fn get_raw(&self) -> u64 {
        self.0.get()
    }
}

impl Default for UUID {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for UUID {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("UUID({:#016X})", self.get_raw()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_are_unique() {
        let a = UUID::new();
        let b = UUID::new();
        assert_ne!(a, b);
        assert!(a.get_raw() != 0);
    }

    #[test]
    fn from_raw_round_trips() {
        let id = UUID::from_raw(42);
        assert_eq!(id.get_raw(), 42);
    }
}
