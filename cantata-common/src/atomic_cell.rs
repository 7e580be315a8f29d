//! A critical-section backed cell with atomic load/store semantics
//!
//! Used for state which is shared between a receive context (a CAN IRQ, or
//! the bus dispatch thread) and the processing loop. A critical section is
//! used rather than CAS atomics so that the same code runs on targets
//! without CAS support.

use core::cell::Cell;
use critical_section::Mutex;

#[derive(Debug)]
pub struct AtomicCell<T: Copy> {
    inner: Mutex<Cell<T>>,
}

impl<T: Default + Copy + Send> Default for AtomicCell<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Cell::new(T::default())),
        }
    }
}

impl<T: Send + Copy> AtomicCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Cell::new(value)),
        }
    }

    pub fn load(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).get())
    }

    pub fn store(&self, value: T) {
        critical_section::with(|cs| self.inner.borrow(cs).set(value));
    }
}

impl<T: Send + Copy + Default> AtomicCell<T> {
    /// Replace the stored value with `T::default()` and return the old value
    pub fn take(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).take())
    }
}

impl<T: Send + Copy + core::ops::Add<Output = T>> AtomicCell<T> {
    /// Add `value` to the stored value, returning the previous value
    pub fn fetch_add(&self, value: T) -> T {
        critical_section::with(|cs| {
            let old = self.inner.borrow(cs).get();
            self.inner.borrow(cs).set(old + value);
            old
        })
    }
}
