use crate::gc::RootProvider;
use crate::layout::character;
use crate::value::Value;

/// Objects the machine must find without a lookup.
#[derive(Debug, Clone)]
pub struct KnownObjects {
    pub nil: Value,
    pub false_object: Value,
    pub true_object: Value,
    pub smalltalk: Value,
    pub characters: [Value; character::COUNT],
    pub short_integer: Value,
    pub float: Value,
    pub character: Value,
    pub string: Value,
    pub symbol: Value,
    pub link: Value,
    pub method: Value,
    pub array: Value,
    pub word_array: Value,
    pub method_context: Value,
    pub block_context: Value,
    pub metaclass: Value,
}

impl KnownObjects {
    fn placeholder() -> Self {
        let z = Value::ZERO_REF;
        Self {
            nil: z,
            false_object: z,
            true_object: z,
            smalltalk: z,
            characters: [z; character::COUNT],
            short_integer: z,
            float: z,
            character: z,
            string: z,
            symbol: z,
            link: z,
            method: z,
            array: z,
            word_array: z,
            method_context: z,
            block_context: z,
            metaclass: z,
        }
    }

    fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.nil);
        visitor(&mut self.false_object);
        visitor(&mut self.true_object);
        visitor(&mut self.smalltalk);
        for c in self.characters.iter_mut() {
            visitor(c);
        }
        visitor(&mut self.short_integer);
        visitor(&mut self.float);
        visitor(&mut self.character);
        visitor(&mut self.string);
        visitor(&mut self.symbol);
        visitor(&mut self.link);
        visitor(&mut self.method);
        visitor(&mut self.array);
        visitor(&mut self.word_array);
        visitor(&mut self.method_context);
        visitor(&mut self.block_context);
        visitor(&mut self.metaclass);
    }
}

/// The complete root set: known objects, the interpreter registers and a
/// scratch stack for values held across an allocation.
#[derive(Debug, Clone)]
pub struct Registers {
    pub known: KnownObjects,
    pub active_context: Value,
    /// The active context itself for methods, the enclosing method
    /// context for blocks.
    pub home_context: Value,
    pub method: Value,
    pub receiver: Value,
    pub args: Value,
    pub temps: Value,
    pub stack: Value,
    pub code: Value,
    pub literals: Value,
    pub new_method: Value,
    pub new_context: Value,
    pub compiler_method: Value,
    /// Sentinel context a host call returns into.
    pub entry_context: Value,
    pub scratch: Vec<Value>,
}

impl Registers {
    pub fn new() -> Self {
        let z = Value::ZERO_REF;
        Self {
            known: KnownObjects::placeholder(),
            active_context: z,
            home_context: z,
            method: z,
            receiver: z,
            args: z,
            temps: z,
            stack: z,
            code: z,
            literals: z,
            new_method: z,
            new_context: z,
            compiler_method: z,
            entry_context: z,
            scratch: Vec::new(),
        }
    }

    /// Visits every named slot in a fixed order. Images persist exactly
    /// these slots, in this order.
    pub fn visit_named(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.known.visit(visitor);
        visitor(&mut self.active_context);
        visitor(&mut self.home_context);
        visitor(&mut self.method);
        visitor(&mut self.receiver);
        visitor(&mut self.args);
        visitor(&mut self.temps);
        visitor(&mut self.stack);
        visitor(&mut self.code);
        visitor(&mut self.literals);
        visitor(&mut self.new_method);
        visitor(&mut self.new_context);
        visitor(&mut self.compiler_method);
        visitor(&mut self.entry_context);
    }

    pub fn named_count(&mut self) -> usize {
        let mut n = 0;
        self.visit_named(&mut |_| n += 1);
        n
    }

    /// Points every machine register (not the known objects) at nil.
    pub fn clear_machine(&mut self) {
        let nil = self.known.nil;
        self.active_context = nil;
        self.home_context = nil;
        self.method = nil;
        self.receiver = nil;
        self.args = nil;
        self.temps = nil;
        self.stack = nil;
        self.code = nil;
        self.literals = nil;
        self.new_method = nil;
        self.new_context = nil;
        self.compiler_method = nil;
        self.entry_context = nil;
        self.scratch.clear();
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl RootProvider for Registers {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.visit_named(visitor);
        for value in self.scratch.iter_mut() {
            visitor(value);
        }
    }
}
