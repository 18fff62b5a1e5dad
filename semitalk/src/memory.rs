use bitflags::bitflags;

use crate::error::VmError;
use crate::gc::{GcStats, PinnedRoots, RootProvider};
use crate::value::{Address, Value};

/// class word + hash word + size word
pub const HEADER_BYTES: usize = 12;
pub const WORD_BYTES: usize = 4;
pub const ALIGN: usize = 4;

pub(crate) const CLASS_OFFSET: usize = 0;
pub(crate) const HASH_OFFSET: usize = 4;
pub(crate) const SIZE_OFFSET: usize = 8;

const COUNT_MASK: u32 = (1 << 29) - 1;
const HASH_MASK: u32 = (1 << 30) - 1;
const HASH_SEED: u32 = 314_159_265;
const HASH_STEP: u32 = 0x9E37_79B9;

/// Largest semispace that keeps both halves below 2^31.
pub const MAX_SEMISPACE: usize = 1 << 30;
pub const MIN_SEMISPACE: usize = 1024;

bitflags! {
    /// Flag bits of the size word; the low 29 bits hold the element count.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SizeFlags: u32 {
        /// Only set while collecting: the class word is a forwarding address.
        const BROKEN_HEART = 1 << 31;
        const HAS_POINTERS = 1 << 30;
        const HAS_WORDS = 1 << 29;
    }
}

/// What the body of an object is made of.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Pointers,
    Words,
    Bytes,
}

impl ObjectKind {
    fn flags(self) -> SizeFlags {
        match self {
            ObjectKind::Pointers => SizeFlags::HAS_POINTERS,
            ObjectKind::Words => SizeFlags::HAS_WORDS,
            ObjectKind::Bytes => SizeFlags::empty(),
        }
    }

    fn from_flags(flags: SizeFlags) -> Self {
        if flags.contains(SizeFlags::HAS_POINTERS) {
            ObjectKind::Pointers
        } else if flags.contains(SizeFlags::HAS_WORDS) {
            ObjectKind::Words
        } else {
            ObjectKind::Bytes
        }
    }

    #[inline]
    pub fn element_bytes(self) -> usize {
        match self {
            ObjectKind::Pointers | ObjectKind::Words => WORD_BYTES,
            ObjectKind::Bytes => 1,
        }
    }
}

#[inline]
pub(crate) fn align_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Bytes covered by an object with `count` elements of `kind`, padded.
#[inline]
pub(crate) fn extent(count: usize, kind: ObjectKind) -> usize {
    align_up(HEADER_BYTES + count * kind.element_bytes())
}

#[derive(Debug, Clone, Copy)]
pub struct MemorySettings {
    /// Bytes per semispace. The arena holds two of them.
    pub semispace_size: usize,
    /// When false, running out of space fails immediately instead of
    /// collecting. Bootstrap runs with collection off.
    pub gc_enabled: bool,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            semispace_size: 1 << 20, // 1 MB
            gc_enabled: true,
        }
    }
}

impl MemorySettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.semispace_size < MIN_SEMISPACE {
            return Err("semispace_size must be at least 1 KB");
        }
        if self.semispace_size % ALIGN != 0 {
            return Err("semispace_size must be a multiple of the word size");
        }
        if self.semispace_size > MAX_SEMISPACE {
            return Err("semispace_size exceeds the 31-bit address space");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Semispace {
    pub start: usize,
    pub end: usize,
}

impl Semispace {
    #[inline]
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset >= self.start && offset + len <= self.end
    }
}

/// The object arena: two equal semispaces in one byte buffer. Objects are
/// bump-allocated in `to`; `from` only holds data during a collection.
pub struct ObjectMemory {
    pub(crate) arena: Vec<u8>,
    pub(crate) to: Semispace,
    pub(crate) from: Semispace,
    pub(crate) free: usize,
    pub(crate) stats: GcStats,
    settings: MemorySettings,
    hash_counter: u32,
}

impl ObjectMemory {
    pub fn new(settings: MemorySettings) -> Result<Self, &'static str> {
        settings.validate()?;
        let semi = settings.semispace_size;
        Ok(Self {
            arena: vec![0; semi * 2],
            to: Semispace { start: 0, end: semi },
            from: Semispace {
                start: semi,
                end: semi * 2,
            },
            free: 0,
            stats: GcStats::default(),
            settings,
            hash_counter: HASH_SEED,
        })
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    pub fn set_gc_enabled(&mut self, enabled: bool) {
        self.settings.gc_enabled = enabled;
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Bytes occupied by objects in the active semispace.
    pub fn used_bytes(&self) -> usize {
        self.free - self.to.start
    }

    pub fn free_bytes(&self) -> usize {
        self.to.end - self.free
    }

    pub fn in_lower_semispace(&self) -> bool {
        self.to.start == 0
    }

    fn next_hash(&mut self) -> u32 {
        let hash = self.hash_counter & HASH_MASK;
        self.hash_counter = self.hash_counter.wrapping_add(HASH_STEP);
        hash
    }

    /// Allocates an object of `size` elements. Pointer bodies are filled
    /// with `fill` (nil), word and byte bodies with zero.
    ///
    /// When the active semispace is full this collects once; `class` and
    /// `fill` are re-resolved across the collection. A request that still
    /// does not fit is fatal.
    pub fn allocate(
        &mut self,
        class: Value,
        size: usize,
        kind: ObjectKind,
        fill: Value,
        roots: &mut dyn RootProvider,
    ) -> Result<Value, VmError> {
        let bytes = extent(size, kind);
        if size > COUNT_MASK as usize || bytes > self.settings.semispace_size {
            return Err(VmError::MemoryExhausted { requested: bytes });
        }

        let mut pinned = [class, fill];
        if self.free + bytes > self.to.end {
            if !self.settings.gc_enabled {
                return Err(VmError::MemoryExhausted { requested: bytes });
            }
            self.collect(&mut PinnedRoots::new(roots, &mut pinned))?;
            if self.free + bytes > self.to.end {
                return Err(VmError::MemoryExhausted { requested: bytes });
            }
        }
        let [class, fill] = pinned;

        let offset = self.free;
        let address =
            Address::from_offset(offset).ok_or(VmError::MemoryExhausted { requested: bytes })?;
        self.free += bytes;

        let hash = self.next_hash();
        self.write_word(offset + CLASS_OFFSET, class.encode());
        self.write_word(offset + HASH_OFFSET, hash);
        self.write_word(offset + SIZE_OFFSET, size as u32 | kind.flags().bits());

        let body = offset + HEADER_BYTES;
        match kind {
            ObjectKind::Pointers => {
                let word = fill.encode().to_le_bytes();
                for slot in self.arena[body..body + size * WORD_BYTES].chunks_exact_mut(WORD_BYTES) {
                    slot.copy_from_slice(&word);
                }
            }
            ObjectKind::Words | ObjectKind::Bytes => {
                self.arena[body..offset + bytes].fill(0);
            }
        }

        self.stats.record_allocation(bytes);
        Ok(Value::Ref(address))
    }

    #[inline]
    pub(crate) fn read_word(&self, offset: usize) -> u32 {
        let mut b = [0u8; WORD_BYTES];
        b.copy_from_slice(&self.arena[offset..offset + WORD_BYTES]);
        u32::from_le_bytes(b)
    }

    #[inline]
    pub(crate) fn write_word(&mut self, offset: usize, word: u32) {
        self.arena[offset..offset + WORD_BYTES].copy_from_slice(&word.to_le_bytes());
    }

    /// Header offset of a live object, checked against the active region.
    fn header(&self, operation: &'static str, object: Value) -> Result<usize, VmError> {
        match object {
            Value::SmallInt(_) => Err(VmError::NotAnObject {
                operation,
                value: object,
            }),
            Value::Ref(address) => {
                let offset = address.offset();
                if offset >= self.to.start && offset + HEADER_BYTES <= self.free {
                    Ok(offset)
                } else {
                    Err(VmError::DanglingReference {
                        operation,
                        value: object,
                    })
                }
            }
        }
    }

    fn size_word(&self, offset: usize) -> (usize, SizeFlags) {
        let word = self.read_word(offset + SIZE_OFFSET);
        (
            (word & COUNT_MASK) as usize,
            SizeFlags::from_bits_truncate(word),
        )
    }

    /// Body offset of element `index`, checked for kind and bounds.
    fn element(
        &self,
        operation: &'static str,
        object: Value,
        index: usize,
        expected: ObjectKind,
    ) -> Result<usize, VmError> {
        let offset = self.header(operation, object)?;
        let (count, flags) = self.size_word(offset);
        if ObjectKind::from_flags(flags) != expected {
            return Err(VmError::WrongKind {
                operation,
                expected,
            });
        }
        if index >= count {
            return Err(VmError::IndexOutOfRange {
                operation,
                index: index as i64,
                size: count,
            });
        }
        Ok(offset + HEADER_BYTES + index * expected.element_bytes())
    }

    /// The class word of a heap object. Small integers have no class word;
    /// the machine maps them to its ShortInteger class.
    pub fn class_of_object(&self, object: Value) -> Result<Value, VmError> {
        let offset = self.header("getClass", object)?;
        Ok(Value::decode(self.read_word(offset + CLASS_OFFSET)))
    }

    pub fn set_class(&mut self, object: Value, class: Value) -> Result<(), VmError> {
        let offset = self.header("setClass", object)?;
        self.write_word(offset + CLASS_OFFSET, class.encode());
        Ok(())
    }

    /// Small integers hash to zero.
    pub fn hash(&self, object: Value) -> Result<u32, VmError> {
        match object {
            Value::SmallInt(_) => Ok(0),
            Value::Ref(_) => {
                let offset = self.header("getHash", object)?;
                Ok(self.read_word(offset + HASH_OFFSET))
            }
        }
    }

    pub fn set_hash(&mut self, object: Value, hash: u32) -> Result<(), VmError> {
        let offset = self.header("setHash", object)?;
        self.write_word(offset + HASH_OFFSET, hash & HASH_MASK);
        Ok(())
    }

    /// Element count. Small integers have size zero.
    pub fn size(&self, object: Value) -> Result<usize, VmError> {
        match object {
            Value::SmallInt(_) => Ok(0),
            Value::Ref(_) => {
                let offset = self.header("getSize", object)?;
                Ok(self.size_word(offset).0)
            }
        }
    }

    pub fn kind(&self, object: Value) -> Result<ObjectKind, VmError> {
        let offset = self.header("kind", object)?;
        Ok(ObjectKind::from_flags(self.size_word(offset).1))
    }

    pub fn get_ptr(&self, object: Value, index: usize) -> Result<Value, VmError> {
        let at = self.element("getPtr", object, index, ObjectKind::Pointers)?;
        Ok(Value::decode(self.read_word(at)))
    }

    pub fn set_ptr(&mut self, object: Value, index: usize, value: Value) -> Result<(), VmError> {
        let at = self.element("setPtr", object, index, ObjectKind::Pointers)?;
        self.write_word(at, value.encode());
        Ok(())
    }

    pub fn get_word(&self, object: Value, index: usize) -> Result<u32, VmError> {
        let at = self.element("getWord", object, index, ObjectKind::Words)?;
        Ok(self.read_word(at))
    }

    pub fn set_word(&mut self, object: Value, index: usize, word: u32) -> Result<(), VmError> {
        let at = self.element("setWord", object, index, ObjectKind::Words)?;
        self.write_word(at, word);
        Ok(())
    }

    pub fn get_byte(&self, object: Value, index: usize) -> Result<u8, VmError> {
        let at = self.element("getByte", object, index, ObjectKind::Bytes)?;
        Ok(self.arena[at])
    }

    pub fn set_byte(&mut self, object: Value, index: usize, byte: u8) -> Result<(), VmError> {
        let at = self.element("setByte", object, index, ObjectKind::Bytes)?;
        self.arena[at] = byte;
        Ok(())
    }

    /// The whole body of a byte object.
    pub fn bytes(&self, object: Value) -> Result<&[u8], VmError> {
        let offset = self.header("bytes", object)?;
        let (count, flags) = self.size_word(offset);
        if ObjectKind::from_flags(flags) != ObjectKind::Bytes {
            return Err(VmError::WrongKind {
                operation: "bytes",
                expected: ObjectKind::Bytes,
            });
        }
        let body = offset + HEADER_BYTES;
        Ok(&self.arena[body..body + count])
    }

    pub fn bytes_mut(&mut self, object: Value) -> Result<&mut [u8], VmError> {
        let offset = self.header("bytes", object)?;
        let (count, flags) = self.size_word(offset);
        if ObjectKind::from_flags(flags) != ObjectKind::Bytes {
            return Err(VmError::WrongKind {
                operation: "bytes",
                expected: ObjectKind::Bytes,
            });
        }
        let body = offset + HEADER_BYTES;
        Ok(&mut self.arena[body..body + count])
    }

    /// Every object in the active semispace, in address order.
    pub fn objects(&self) -> ObjectIter<'_> {
        ObjectIter {
            memory: self,
            cursor: self.to.start,
        }
    }

    /// Bytes of extent for the object at `offset`, from its size word.
    pub(crate) fn extent_at(&self, offset: usize) -> usize {
        let (count, flags) = self.size_word(offset);
        extent(count, ObjectKind::from_flags(flags))
    }

    pub(crate) fn flags_at(&self, offset: usize) -> SizeFlags {
        self.size_word(offset).1
    }

    pub(crate) fn count_at(&self, offset: usize) -> usize {
        self.size_word(offset).0
    }

    /// Occupied part of the active semispace.
    pub(crate) fn live_region(&self) -> &[u8] {
        &self.arena[self.to.start..self.free]
    }

    /// Installs a saved arena image into the lower semispace.
    pub(crate) fn load_region(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        let semi = self.settings.semispace_size;
        if bytes.len() > semi {
            return Err(VmError::MemoryExhausted {
                requested: bytes.len(),
            });
        }
        self.to = Semispace { start: 0, end: semi };
        self.from = Semispace {
            start: semi,
            end: semi * 2,
        };
        self.arena[..bytes.len()].copy_from_slice(bytes);
        self.free = bytes.len();
        Ok(())
    }
}

pub struct ObjectIter<'a> {
    memory: &'a ObjectMemory,
    cursor: usize,
}

impl Iterator for ObjectIter<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        if self.cursor + HEADER_BYTES > self.memory.free {
            return None;
        }
        let offset = self.cursor;
        self.cursor += self.memory.extent_at(offset);
        Address::from_offset(offset).map(Value::Ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRoots;

    impl RootProvider for NoRoots {
        fn visit_roots(&mut self, _visitor: &mut dyn FnMut(&mut Value)) {}
    }

    fn test_memory() -> ObjectMemory {
        ObjectMemory::new(MemorySettings {
            semispace_size: 4096,
            gc_enabled: true,
        })
        .unwrap()
    }

    fn nil(memory: &mut ObjectMemory) -> Value {
        memory
            .allocate(Value::ZERO_REF, 0, ObjectKind::Pointers, Value::ZERO_REF, &mut NoRoots)
            .unwrap()
    }

    #[test]
    fn test_settings_validation() {
        assert!(MemorySettings::default().validate().is_ok());
        let mut s = MemorySettings::default();
        s.semispace_size = 1026;
        assert!(s.validate().is_err());
        s.semispace_size = 16;
        assert!(s.validate().is_err());
        s.semispace_size = MAX_SEMISPACE * 2;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_pointer_objects_start_nil() {
        let mut memory = test_memory();
        let nil = nil(&mut memory);
        let obj = memory
            .allocate(nil, 5, ObjectKind::Pointers, nil, &mut NoRoots)
            .unwrap();
        assert_eq!(memory.size(obj).unwrap(), 5);
        for i in 0..5 {
            assert_eq!(memory.get_ptr(obj, i).unwrap(), nil);
        }
    }

    #[test]
    fn test_word_and_byte_objects_start_zeroed() {
        let mut memory = test_memory();
        let nil = nil(&mut memory);
        // dirty the free region so zeroing is observable
        let free = memory.free;
        memory.arena[free..].fill(0xAB);
        let words = memory.allocate(nil, 3, ObjectKind::Words, nil, &mut NoRoots).unwrap();
        let bytes = memory.allocate(nil, 7, ObjectKind::Bytes, nil, &mut NoRoots).unwrap();
        for i in 0..3 {
            assert_eq!(memory.get_word(words, i).unwrap(), 0);
        }
        assert_eq!(memory.bytes(bytes).unwrap(), &[0u8; 7]);
        assert_eq!(memory.kind(words).unwrap(), ObjectKind::Words);
        assert_eq!(memory.kind(bytes).unwrap(), ObjectKind::Bytes);
    }

    #[test]
    fn test_allocation_is_aligned() {
        let mut memory = test_memory();
        let nil = nil(&mut memory);
        let a = memory.allocate(nil, 1, ObjectKind::Bytes, nil, &mut NoRoots).unwrap();
        let b = memory.allocate(nil, 1, ObjectKind::Bytes, nil, &mut NoRoots).unwrap();
        let (a, b) = (a.as_address().unwrap(), b.as_address().unwrap());
        assert_eq!(a.offset() % ALIGN, 0);
        assert_eq!(b.offset() - a.offset(), extent(1, ObjectKind::Bytes));
    }

    #[test]
    fn test_accessors_reject_wrong_kind_and_bounds() {
        let mut memory = test_memory();
        let nil = nil(&mut memory);
        let bytes = memory.allocate(nil, 2, ObjectKind::Bytes, nil, &mut NoRoots).unwrap();
        assert!(matches!(
            memory.get_ptr(bytes, 0),
            Err(VmError::WrongKind { .. })
        ));
        assert!(matches!(
            memory.get_word(bytes, 0),
            Err(VmError::WrongKind { .. })
        ));
        assert!(matches!(
            memory.set_byte(bytes, 2, 1),
            Err(VmError::IndexOutOfRange { index: 2, size: 2, .. })
        ));
        assert!(matches!(
            memory.get_ptr(Value::SmallInt(3), 0),
            Err(VmError::NotAnObject { .. })
        ));
    }

    #[test]
    fn test_small_integers_have_no_header() {
        let memory = test_memory();
        assert_eq!(memory.size(Value::SmallInt(42)).unwrap(), 0);
        assert_eq!(memory.hash(Value::SmallInt(42)).unwrap(), 0);
        assert!(memory.class_of_object(Value::SmallInt(42)).is_err());
    }

    #[test]
    fn test_hashes_are_distinct_and_masked() {
        let mut memory = test_memory();
        let nil = nil(&mut memory);
        let a = memory.allocate(nil, 0, ObjectKind::Bytes, nil, &mut NoRoots).unwrap();
        let b = memory.allocate(nil, 0, ObjectKind::Bytes, nil, &mut NoRoots).unwrap();
        let (ha, hb) = (memory.hash(a).unwrap(), memory.hash(b).unwrap());
        assert_ne!(ha, hb);
        assert!(ha <= HASH_MASK && hb <= HASH_MASK);
        memory.set_hash(a, 77).unwrap();
        assert_eq!(memory.hash(a).unwrap(), 77);
    }

    #[test]
    fn test_exhaustion_without_gc_is_fatal() {
        let mut memory = ObjectMemory::new(MemorySettings {
            semispace_size: 1024,
            gc_enabled: false,
        })
        .unwrap();
        let nil = nil(&mut memory);
        let mut result = Ok(nil);
        for _ in 0..100 {
            result = memory.allocate(nil, 64, ObjectKind::Bytes, nil, &mut NoRoots);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(VmError::MemoryExhausted { .. })));
        assert_eq!(memory.stats().collections, 0);
    }

    #[test]
    fn test_object_iteration_walks_all_objects() {
        let mut memory = test_memory();
        let nil = nil(&mut memory);
        let a = memory.allocate(nil, 3, ObjectKind::Bytes, nil, &mut NoRoots).unwrap();
        let b = memory.allocate(nil, 2, ObjectKind::Pointers, nil, &mut NoRoots).unwrap();
        let all: Vec<Value> = memory.objects().collect();
        assert_eq!(all, vec![nil, a, b]);
    }
}
