//! Semispace copying collection (Cheney).
//!
//! A collection flips the semispaces, copies everything reachable from the
//! roots into the new to-space, then scans the copies breadth-first until
//! the scan cursor meets the free cursor. Objects that were not copied are
//! simply left behind in from-space.

use crate::error::VmError;
use crate::memory::{CLASS_OFFSET, HEADER_BYTES, ObjectMemory, SIZE_OFFSET, SizeFlags, WORD_BYTES};
use crate::value::{Address, Value};

/// Anything that owns object references the collector must update.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// Extra values kept alive (and updated) for the duration of one call.
pub(crate) struct PinnedRoots<'a> {
    roots: &'a mut dyn RootProvider,
    pinned: &'a mut [Value],
}

impl<'a> PinnedRoots<'a> {
    pub(crate) fn new(roots: &'a mut dyn RootProvider, pinned: &'a mut [Value]) -> Self {
        Self { roots, pinned }
    }
}

impl RootProvider for PinnedRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.roots.visit_roots(visitor);
        for value in self.pinned.iter_mut() {
            visitor(value);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub collections: usize,
    pub bytes_allocated: usize,
    pub objects_allocated: usize,
    /// Allocation since the most recent collection.
    pub bytes_since_collection: usize,
    pub objects_since_collection: usize,
    /// Survivors of the most recent collection.
    pub bytes_copied: usize,
    pub objects_copied: usize,
}

impl GcStats {
    pub(crate) fn record_allocation(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
        self.objects_allocated += 1;
        self.bytes_since_collection += bytes;
        self.objects_since_collection += 1;
    }
}

impl ObjectMemory {
    /// Runs one full collection. Every root slot is rewritten to the new
    /// address of its object.
    pub fn collect(&mut self, roots: &mut dyn RootProvider) -> Result<(), VmError> {
        std::mem::swap(&mut self.to, &mut self.from);
        self.free = self.to.start;
        let mut scan = self.to.start;
        let mut objects_copied = 0usize;

        let mut failure = None;
        roots.visit_roots(&mut |slot| {
            if failure.is_some() {
                return;
            }
            match self.relocate(*slot, &mut objects_copied) {
                Ok(moved) => *slot = moved,
                Err(e) => failure = Some(e),
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }

        while scan < self.free {
            let class = Value::decode(self.read_word(scan + CLASS_OFFSET));
            let class = self.relocate(class, &mut objects_copied)?;
            self.write_word(scan + CLASS_OFFSET, class.encode());

            if self.flags_at(scan).contains(SizeFlags::HAS_POINTERS) {
                let body = scan + HEADER_BYTES;
                for i in 0..self.count_at(scan) {
                    let at = body + i * WORD_BYTES;
                    let field = self.relocate(Value::decode(self.read_word(at)), &mut objects_copied)?;
                    self.write_word(at, field.encode());
                }
            }
            scan += self.extent_at(scan);
        }
        if scan != self.free || self.free > self.to.end {
            return Err(VmError::CollectorOverflow);
        }

        self.stats.collections += 1;
        self.stats.bytes_copied = self.free - self.to.start;
        self.stats.objects_copied = objects_copied;
        log::debug!(
            "gc #{}: allocated {} bytes in {} objects, copied {} bytes in {} objects, {} bytes free",
            self.stats.collections,
            self.stats.bytes_since_collection,
            self.stats.objects_since_collection,
            self.stats.bytes_copied,
            self.stats.objects_copied,
            self.free_bytes(),
        );
        self.stats.bytes_since_collection = 0;
        self.stats.objects_since_collection = 0;
        Ok(())
    }

    /// Moves one object to to-space unless it already moved, returning its
    /// new reference. Small integers pass through.
    fn relocate(&mut self, value: Value, copied: &mut usize) -> Result<Value, VmError> {
        let Value::Ref(address) = value else {
            return Ok(value);
        };
        let old = address.offset();
        if !self.from.contains(old, HEADER_BYTES) {
            return Err(VmError::DanglingReference {
                operation: "collect",
                value,
            });
        }
        if let Some(forward) = self.forwarding_address(old) {
            return Ok(forward);
        }

        let len = self.extent_at(old);
        let new = self.free;
        if !self.to.contains(new, len) {
            return Err(VmError::CollectorOverflow);
        }
        self.arena.copy_within(old..old + len, new);
        self.free += len;
        *copied += 1;

        let moved = Address::from_offset(new)
            .map(Value::Ref)
            .ok_or(VmError::CollectorOverflow)?;
        self.mark_forwarded(old, moved);
        Ok(moved)
    }

    /// The new location of a from-space object that was already copied.
    fn forwarding_address(&self, offset: usize) -> Option<Value> {
        if self.flags_at(offset).contains(SizeFlags::BROKEN_HEART) {
            Some(Value::decode(self.read_word(offset + CLASS_OFFSET)))
        } else {
            None
        }
    }

    fn mark_forwarded(&mut self, offset: usize, to: Value) {
        let size = self.read_word(offset + SIZE_OFFSET);
        self.write_word(offset + SIZE_OFFSET, size | SizeFlags::BROKEN_HEART.bits());
        self.write_word(offset + CLASS_OFFSET, to.encode());
    }
}
