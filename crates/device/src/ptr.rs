// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Opaque device addresses.

use std::fmt;
use std::ptr::NonNull;

/// The address of a block owned by a [`Device`](crate::Device).
///
/// On the CPU this is a host pointer; on the GPU it is a device address that
/// must never be dereferenced from the host. The pool uses it as a map key,
/// so it is `Copy`, `Hash` and `Ord`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(NonNull<u8>);

// SAFETY: a `DevicePtr` is an address token. Access to the memory behind it
// is synchronised by the graph protocol, not by this type.
unsafe impl Send for DevicePtr {}
unsafe impl Sync for DevicePtr {}

impl DevicePtr {
    /// Wraps a non-null pointer.
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Wraps a raw address, returning `None` for zero.
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut u8).map(Self)
    }

    /// Returns the raw pointer.
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Returns the numeric address.
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Returns the address `offset` bytes past this one.
    ///
    /// # Safety
    /// The result must stay within the block this pointer belongs to.
    pub unsafe fn byte_add(self, offset: usize) -> Self {
        Self(NonNull::new_unchecked(self.0.as_ptr().add(offset)))
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_addr() {
        assert!(DevicePtr::from_addr(0).is_none());
        let p = DevicePtr::from_addr(0x1000).unwrap();
        assert_eq!(p.addr(), 0x1000);
        assert_eq!(format!("{p:?}"), "DevicePtr(0x1000)");
    }

    #[test]
    fn test_ordering_follows_address() {
        let a = DevicePtr::from_addr(0x20).unwrap();
        let b = DevicePtr::from_addr(0x40).unwrap();
        assert!(a < b);
        assert_eq!(unsafe { a.byte_add(0x20) }, b);
    }
}
