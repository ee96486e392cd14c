/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! A shared, wired-OR interrupt request line.
use core::cell::Cell;
use std::rc::Rc;

/// A handle to a single interrupt source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IrqHandle(u32);

/// Aggregates interrupt sources into a single level-triggered IRQ line.
///
/// The controller is cheaply cloneable; clones share the same line.
#[derive(Clone, Debug, Default)]
pub struct IrqController {
    inner: Rc<IrqInner>,
}

#[derive(Debug, Default)]
struct IrqInner {
    allocated: Cell<u32>,
    asserted: Cell<u32>,
}

impl IrqController {
    pub fn new() -> Self {
        IrqController::default()
    }
    /// Allocates a new interrupt source. Returns `None` if all 32 sources are in use.
    pub fn allocate(&self) -> Option<IrqHandle> {
        let allocated = self.inner.allocated.get();
        let free = !allocated;
        if free == 0 {
            return None
        }
        let bit = free.trailing_zeros();
        self.inner.allocated.set(allocated | (1 << bit));
        Some(IrqHandle(bit))
    }
    /// Releases the source, negating it first.
    pub fn free(&self, handle: IrqHandle) {
        self.negate(handle);
        self.inner.allocated.set(self.inner.allocated.get() & !(1 << handle.0));
    }
    pub fn assert(&self, handle: IrqHandle) {
        self.inner.asserted.set(self.inner.asserted.get() | (1 << handle.0));
    }
    pub fn negate(&self, handle: IrqHandle) {
        self.inner.asserted.set(self.inner.asserted.get() & !(1 << handle.0));
    }
    pub fn set(&self, handle: IrqHandle, asserted: bool) {
        if asserted { self.assert(handle) } else { self.negate(handle) }
    }
    /// Returns `true` if the source is asserted.
    pub fn is_asserted(&self, handle: IrqHandle) -> bool {
        self.inner.asserted.get() & (1 << handle.0) != 0
    }
    /// Returns `true` if any source is asserted.
    pub fn is_irq_asserted(&self) -> bool {
        self.inner.asserted.get() != 0
    }
}
