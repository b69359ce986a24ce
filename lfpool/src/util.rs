use std::fmt::{self, Debug};

use crate::loom_testing::*;

/// Round `num` up to a multiple of `align` (which must be a power of 2)
pub const fn roundto(num: usize, align: usize) -> usize {
    (num + align - 1) & !(align - 1)
}

/// Pointer that prints as an address and is `Send`, for trace events
/// and for moving addresses between test threads
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsizePtr(pub usize);

impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as *const () as usize)
    }
}
impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as *const () as usize)
    }
}
impl<T: ?Sized> From<&T> for UsizePtr {
    fn from(value: &T) -> Self {
        Self(value as *const T as *const () as usize)
    }
}
impl<T: ?Sized> From<std::ptr::NonNull<T>> for UsizePtr {
    fn from(value: std::ptr::NonNull<T>) -> Self {
        Self(value.as_ptr() as *const () as usize)
    }
}

impl Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Number of times to spin before starting to yield to the OS scheduler
#[cfg(not(loom))]
const SPIN_LIMIT: usize = 40;
#[cfg(loom)]
const SPIN_LIMIT: usize = 1;

/// Spin-then-yield waiting helper
///
/// Waits that are expected to finish within a handful of instructions
/// spin first, but stop hogging the core once that turns out to be wrong.
#[derive(Debug, Default)]
pub struct SpinWait {
    spins: usize,
}

impl SpinWait {
    pub fn new() -> Self {
        Self { spins: 0 }
    }

    pub fn spin(&mut self) {
        if self.spins < SPIN_LIMIT {
            self.spins += 1;
            spin_hint();
        } else {
            yield_now();
        }
    }

    /// Spin until `cond` returns true
    pub fn until(mut self, mut cond: impl FnMut() -> bool) {
        while !cond() {
            self.spin();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundto_test() {
        assert_eq!(roundto(0, 32), 0);
        assert_eq!(roundto(1, 32), 32);
        assert_eq!(roundto(32, 32), 32);
        assert_eq!(roundto(33, 32), 64);
    }

    #[test]
    fn usizeptr_debug() {
        let p = UsizePtr(0x1234);
        assert_eq!(format!("{:?}", p), "0x1234");
        let x = 5u8;
        assert_eq!(UsizePtr::from(&x).0, &x as *const u8 as usize);
    }

    #[cfg(not(loom))]
    #[test]
    fn spin_wait_until_terminates() {
        let mut n = 0;
        SpinWait::new().until(|| {
            n += 1;
            n == 100
        });
        assert_eq!(n, 100);
    }
}
