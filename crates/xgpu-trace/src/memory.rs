//! Guest memory read interface consumed by the trace writer.
//!
//! The emulator provides the real implementation; the writer only needs a stable snapshot of
//! `size` bytes at a guest address for the duration of one call.

use std::cell::{Ref, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("guest memory access out of bounds: address=0x{address:08x}, len=0x{len:x}")]
pub struct GuestMemoryError {
    pub address: u32,
    pub len: usize,
}

pub trait GuestMemory {
    fn read(&self, address: u32, dst: &mut [u8]) -> Result<(), GuestMemoryError>;
}

impl<T: GuestMemory + ?Sized> GuestMemory for &T {
    fn read(&self, address: u32, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        (**self).read(address, dst)
    }
}

impl<T: GuestMemory + ?Sized> GuestMemory for Rc<T> {
    fn read(&self, address: u32, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        (**self).read(address, dst)
    }
}

impl<T: GuestMemory + ?Sized> GuestMemory for Arc<T> {
    fn read(&self, address: u32, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        (**self).read(address, dst)
    }
}

/// Flat guest RAM starting at address 0, for tests and tooling.
#[derive(Clone, Debug)]
pub struct VecGuestMemory {
    mem: RefCell<Vec<u8>>,
}

impl VecGuestMemory {
    pub fn new(size_bytes: usize) -> Self {
        Self {
            mem: RefCell::new(vec![0u8; size_bytes]),
        }
    }

    pub fn as_slice(&self) -> Ref<'_, [u8]> {
        Ref::map(self.mem.borrow(), |v| v.as_slice())
    }

    pub fn write(&self, address: u32, data: &[u8]) -> Result<(), GuestMemoryError> {
        let err = GuestMemoryError {
            address,
            len: data.len(),
        };
        let start = address as usize;
        let end = start.checked_add(data.len()).ok_or(err.clone())?;
        let mut mem = self.mem.borrow_mut();
        let slice = mem.get_mut(start..end).ok_or(err)?;
        slice.copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&self, address: u32, len: usize, value: u8) -> Result<(), GuestMemoryError> {
        self.write(address, &vec![value; len])
    }
}

impl GuestMemory for VecGuestMemory {
    fn read(&self, address: u32, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        let err = GuestMemoryError {
            address,
            len: dst.len(),
        };
        let start = address as usize;
        let end = start.checked_add(dst.len()).ok_or(err.clone())?;
        let mem = self.mem.borrow();
        let slice = mem.get(start..end).ok_or(err)?;
        dst.copy_from_slice(slice);
        Ok(())
    }
}
