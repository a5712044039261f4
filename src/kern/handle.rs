//! Process handle table
//!
//! Handles are the per-process references to kernel objects (files, pipes,
//! sockets, devices). The table has fixed capacity and preserves slot
//! numbers across process cloning. Each handle pairs a kind tag with a
//! static operations table so callers (and tests) can dispatch or stub any
//! operation.

use crate::errno::{Errno, KResult};

/// Handle table capacity per process.
pub const PROCESS_MAX_HANDLES: usize = 64;

/// What kind of object a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Pipe,
    Socket,
    Device,
}

/// Operations a handle's backing object supports. Absent entries mean the
/// object does not support the operation.
pub struct HandleOps {
    /// Duplicate the backing object for a cloned process; a plain copy of
    /// the handle is made when absent.
    pub clone: Option<fn(&Handle) -> KResult<Handle>>,
    /// Release the backing object.
    pub free: Option<fn(&Handle)>,
    /// Poll operations used by `select`.
    pub can_read: Option<fn(&Handle) -> bool>,
    pub can_write: Option<fn(&Handle) -> bool>,
    pub has_except: Option<fn(&Handle) -> bool>,
}

/// Default operations: plain-copy clone, nothing pollable.
pub static DEFAULT_HANDLE_OPS: HandleOps = HandleOps {
    clone: None,
    free: None,
    can_read: None,
    can_write: None,
    has_except: None,
};

/// One handle table entry.
#[derive(Clone)]
pub struct Handle {
    pub kind: HandleKind,
    pub ops: &'static HandleOps,
    /// Object cookie, interpreted by the operations table
    pub value: u64,
}

impl Handle {
    pub fn new(kind: HandleKind, ops: &'static HandleOps, value: u64) -> Self {
        Self { kind, ops, value }
    }
}

/// Fixed-capacity handle table.
pub struct HandleTable {
    slots: [Option<Handle>; PROCESS_MAX_HANDLES],
}

impl HandleTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; PROCESS_MAX_HANDLES],
        }
    }

    /// Install a handle in the first free slot and return its index.
    pub fn alloc(&mut self, handle: Handle) -> KResult<usize> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return Ok(i);
            }
        }
        Err(Errno::OutOfHandles)
    }

    /// Install a handle at a specific slot; used when cloning so slot
    /// numbers survive.
    pub fn install_at(&mut self, index: usize, handle: Handle) -> KResult<()> {
        let slot = self.slots.get_mut(index).ok_or(Errno::BadHandle)?;
        if slot.is_some() {
            return Err(Errno::BadHandle);
        }
        *slot = Some(handle);
        Ok(())
    }

    pub fn get(&self, index: usize) -> KResult<&Handle> {
        self.slots
            .get(index)
            .and_then(|s| s.as_ref())
            .ok_or(Errno::BadHandle)
    }

    /// Release the handle in `index`.
    pub fn free(&mut self, index: usize) -> KResult<()> {
        let slot = self.slots.get_mut(index).ok_or(Errno::BadHandle)?;
        let handle = slot.take().ok_or(Errno::BadHandle)?;
        if let Some(free) = handle.ops.free {
            free(&handle);
        }
        Ok(())
    }

    /// Release every handle; used at process destruction.
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(handle) = slot.take() {
                if let Some(free) = handle.ops.free {
                    free(&handle);
                }
            }
        }
    }

    /// Clone every live handle into a fresh table, preserving slots.
    pub fn clone_table(&self) -> KResult<HandleTable> {
        let mut table = HandleTable::new();
        for (i, slot) in self.slots.iter().enumerate() {
            let Some(handle) = slot else { continue };
            let cloned = match handle.ops.clone {
                Some(f) => f(handle)?,
                None => handle.clone(),
            };
            table.install_at(i, cloned)?;
        }
        Ok(table)
    }

    /// Live handles with their slot numbers, for polling scans.
    pub fn iter_live(&self) -> impl Iterator<Item = (usize, &Handle)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|h| (i, h)))
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_uses_first_free_slot() {
        let mut table = HandleTable::new();
        let h = Handle::new(HandleKind::File, &DEFAULT_HANDLE_OPS, 1);
        assert_eq!(table.alloc(h.clone()).unwrap(), 0);
        assert_eq!(table.alloc(h.clone()).unwrap(), 1);
        table.free(0).unwrap();
        assert_eq!(table.alloc(h).unwrap(), 0);
    }

    #[test]
    fn test_table_fills_up() {
        let mut table = HandleTable::new();
        for _ in 0..PROCESS_MAX_HANDLES {
            table
                .alloc(Handle::new(HandleKind::Pipe, &DEFAULT_HANDLE_OPS, 0))
                .unwrap();
        }
        assert_eq!(
            table.alloc(Handle::new(HandleKind::Pipe, &DEFAULT_HANDLE_OPS, 0)),
            Err(Errno::OutOfHandles)
        );
    }

    #[test]
    fn test_clone_preserves_slots() {
        let mut table = HandleTable::new();
        table
            .alloc(Handle::new(HandleKind::File, &DEFAULT_HANDLE_OPS, 10))
            .unwrap();
        table
            .alloc(Handle::new(HandleKind::Pipe, &DEFAULT_HANDLE_OPS, 20))
            .unwrap();
        table.free(0).unwrap();

        let cloned = table.clone_table().unwrap();
        assert!(cloned.get(0).is_err());
        assert_eq!(cloned.get(1).unwrap().value, 20);
        assert_eq!(cloned.live_count(), 1);
    }

    #[test]
    fn test_bad_handle_errors() {
        let mut table = HandleTable::new();
        assert_eq!(table.get(0).err(), Some(Errno::BadHandle));
        assert_eq!(table.free(3).err(), Some(Errno::BadHandle));
        assert_eq!(table.get(PROCESS_MAX_HANDLES).err(), Some(Errno::BadHandle));
    }
}
