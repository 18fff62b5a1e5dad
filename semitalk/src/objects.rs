//! Strings, symbols, globals, dictionaries and the other objects the
//! machine builds or reads on its own behalf.

use crate::error::VmError;
use crate::interpreter::Machine;
use crate::layout::{behavior, dictionary, float, link, method};
use crate::memory::ObjectKind;
use crate::value::Value;

/// PJW hash of a symbol's characters, kept within 30 bits.
pub fn symbol_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &c in name {
        h = (h << 4).wrapping_add(c as u32);
        let g = h & 0xF000_0000;
        if g != 0 {
            h ^= g >> 24;
            h ^= g;
        }
    }
    h & ((1 << 30) - 1)
}

impl Machine {
    pub fn new_string(&mut self, text: &str) -> Result<Value, VmError> {
        self.new_bytes(self.registers.known.string, text.as_bytes())
    }

    pub(crate) fn new_bytes(&mut self, class: Value, bytes: &[u8]) -> Result<Value, VmError> {
        let object = self.create_object(class, bytes.len(), ObjectKind::Bytes)?;
        self.memory.bytes_mut(object)?.copy_from_slice(bytes);
        Ok(object)
    }

    /// Text of a string or symbol. Invalid UTF-8 is replaced.
    pub fn string_value(&self, object: Value) -> Result<String, VmError> {
        Ok(String::from_utf8_lossy(self.memory.bytes(object)?).into_owned())
    }

    pub fn new_float(&mut self, value: f64) -> Result<Value, VmError> {
        let class = self.registers.known.float;
        let object = self.create_object(class, float::SIZE, ObjectKind::Bytes)?;
        self.memory.bytes_mut(object)?.copy_from_slice(&value.to_le_bytes());
        Ok(object)
    }

    pub fn float_value(&self, object: Value) -> Result<f64, VmError> {
        let bytes = self.memory.bytes(object)?;
        let raw: [u8; float::SIZE] = bytes.try_into().map_err(|_| VmError::WrongKind {
            operation: "float",
            expected: ObjectKind::Bytes,
        })?;
        Ok(f64::from_le_bytes(raw))
    }

    #[inline]
    pub fn character(&self, byte: u8) -> Value {
        self.registers.known.characters[byte as usize]
    }

    pub fn character_value(&self, object: Value) -> Result<u8, VmError> {
        if object.is_small_int() || self.memory.class_of_object(object)? != self.registers.known.character {
            return Err(VmError::ExpectedCharacter {
                operation: "character",
            });
        }
        self.memory.get_byte(object, 0)
    }

    fn symbol_bucket(&self, hash: u32) -> Result<(Value, usize), VmError> {
        let table = self
            .memory
            .get_ptr(self.registers.known.smalltalk, dictionary::HASH_TABLE)?;
        let buckets = self.memory.size(table)?;
        if buckets == 0 {
            return Err(VmError::CorruptContext("empty system dictionary"));
        }
        Ok((table, hash as usize % buckets))
    }

    /// The Smalltalk association whose key is the symbol `name`.
    fn find_symbol_link(&self, name: &[u8]) -> Result<Option<Value>, VmError> {
        let hash = symbol_hash(name);
        let (table, bucket) = self.symbol_bucket(hash)?;
        let nil = self.nil();
        let mut current = self.memory.get_ptr(table, bucket)?;
        while current != nil {
            let key = self.memory.get_ptr(current, link::KEY)?;
            if key != nil
                && self.memory.hash(key)? == hash
                && self.memory.kind(key)? == ObjectKind::Bytes
                && self.memory.bytes(key)? == name
            {
                return Ok(Some(current));
            }
            current = self.memory.get_ptr(current, link::NEXT)?;
        }
        Ok(None)
    }

    /// Association for `name`, created (with value nil) if missing.
    fn intern(&mut self, name: &[u8]) -> Result<Value, VmError> {
        if let Some(found) = self.find_symbol_link(name)? {
            return Ok(found);
        }
        let hash = symbol_hash(name);
        let class = self.registers.known.link;
        let new_link = self.create_object(class, link::SIZE, ObjectKind::Pointers)?;
        let (table, bucket) = self.symbol_bucket(hash)?;
        let head = self.memory.get_ptr(table, bucket)?;
        self.memory.set_ptr(new_link, link::NEXT, head)?;
        self.memory.set_ptr(table, bucket, new_link)?;

        // the link is reachable from Smalltalk now; refetch it after allocating
        let class = self.registers.known.symbol;
        let symbol = self.new_bytes(class, name)?;
        self.memory.set_hash(symbol, hash)?;
        let (table, bucket) = self.symbol_bucket(hash)?;
        let new_link = self.memory.get_ptr(table, bucket)?;
        self.memory.set_ptr(new_link, link::KEY, symbol)?;
        Ok(new_link)
    }

    /// The unique symbol spelled `name`.
    pub fn new_symbol(&mut self, name: &str) -> Result<Value, VmError> {
        let found = self.intern(name.as_bytes())?;
        self.memory.get_ptr(found, link::KEY)
    }

    /// The global association named `name`, without creating one.
    pub fn lookup_global(&self, name: &str) -> Result<Option<Value>, VmError> {
        self.find_symbol_link(name.as_bytes())
    }

    /// The global association named `name`, bound to nil if it is new.
    pub fn global_link(&mut self, name: &str) -> Result<Value, VmError> {
        self.intern(name.as_bytes())
    }

    pub fn global_value(&self, name: &str) -> Result<Option<Value>, VmError> {
        match self.lookup_global(name)? {
            Some(found) => Ok(Some(self.memory.get_ptr(found, link::VALUE)?)),
            None => Ok(None),
        }
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), VmError> {
        let base = self.hold(&[value]);
        let found = self.intern(name.as_bytes())?;
        let [value] = self.release(base);
        self.memory.set_ptr(found, link::VALUE, value)
    }

    /// A dictionary of `buckets` empty chains.
    pub fn new_dictionary(&mut self, class: Value, buckets: usize) -> Result<Value, VmError> {
        let dict = self.create_object(class, dictionary::SIZE, ObjectKind::Pointers)?;
        let base = self.hold(&[dict]);
        let array = self.registers.known.array;
        let table = self.create_object(array, buckets, ObjectKind::Pointers)?;
        let [dict] = self.release(base);
        self.memory.set_ptr(dict, dictionary::HASH_TABLE, table)?;
        Ok(dict)
    }

    fn dictionary_bucket(&self, dict: Value, key: Value) -> Result<(Value, usize), VmError> {
        let table = self.memory.get_ptr(dict, dictionary::HASH_TABLE)?;
        let buckets = self.memory.size(table)?;
        if buckets == 0 {
            return Err(VmError::IndexOutOfRange {
                operation: "dictionary",
                index: 0,
                size: 0,
            });
        }
        Ok((table, self.memory.hash(key)? as usize % buckets))
    }

    fn dictionary_find_link(&self, dict: Value, key: Value) -> Result<Option<Value>, VmError> {
        let (table, bucket) = self.dictionary_bucket(dict, key)?;
        let nil = self.nil();
        let mut current = self.memory.get_ptr(table, bucket)?;
        while current != nil {
            if self.memory.get_ptr(current, link::KEY)? == key {
                return Ok(Some(current));
            }
            current = self.memory.get_ptr(current, link::NEXT)?;
        }
        Ok(None)
    }

    /// Value stored under the identical `key`.
    pub fn dictionary_lookup(&self, dict: Value, key: Value) -> Result<Option<Value>, VmError> {
        match self.dictionary_find_link(dict, key)? {
            Some(found) => Ok(Some(self.memory.get_ptr(found, link::VALUE)?)),
            None => Ok(None),
        }
    }

    pub fn dictionary_enter(&mut self, dict: Value, key: Value, value: Value) -> Result<(), VmError> {
        if let Some(found) = self.dictionary_find_link(dict, key)? {
            return self.memory.set_ptr(found, link::VALUE, value);
        }
        let base = self.hold(&[dict, key, value]);
        let class = self.registers.known.link;
        let new_link = self.create_object(class, link::SIZE, ObjectKind::Pointers)?;
        let [dict, key, value] = self.release(base);

        let (table, bucket) = self.dictionary_bucket(dict, key)?;
        let head = self.memory.get_ptr(table, bucket)?;
        self.memory.set_ptr(new_link, link::KEY, key)?;
        self.memory.set_ptr(new_link, link::VALUE, value)?;
        self.memory.set_ptr(new_link, link::NEXT, head)?;
        self.memory.set_ptr(table, bucket, new_link)
    }

    /// Adds `method` to the method dictionary of `class` under its selector.
    pub fn install_method(&mut self, class: Value, method: Value) -> Result<(), VmError> {
        let nil = self.nil();
        let mut methods = self.memory.get_ptr(class, behavior::METHODS)?;
        let base = self.hold(&[class, method]);
        if methods == nil {
            let dict_class = self.global_value("Dictionary")?.unwrap_or(nil);
            methods = self.new_dictionary(dict_class, dictionary::BUCKETS)?;
            let class = self.registers.scratch[base];
            self.memory.set_ptr(class, behavior::METHODS, methods)?;
        }
        let [_, method] = self.release(base);
        let selector = self.memory.get_ptr(method, method::SELECTOR)?;
        self.dictionary_enter(methods, selector, method)
    }

    /// Name of a class or metaclass, for messages.
    pub fn class_name(&self, class: Value) -> String {
        self.memory
            .get_ptr(class, behavior::NAME)
            .and_then(|name| self.string_value(name))
            .unwrap_or_else(|_| format!("{class:?}"))
    }
}
