use std::fmt;
use std::io::{self, BufRead, Write};

use crate::bytecode::Instruction;
use crate::compiler::{Compiler, SourceCompiler};
use crate::error::{CompileError, EvalError, VmError};
use crate::layout::{behavior, block_context, context, link, method, method_context};
use crate::memory::{MemorySettings, ObjectKind, ObjectMemory};
use crate::primitives;
use crate::registers::Registers;
use crate::value::Value;

/// How a host-initiated call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Returned(Value),
    /// The running code asked the machine to stop.
    ShutDown,
}

/// One-shot return state of a method context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Active = 0,
    Returned = 1,
}

impl FrameState {
    fn value(self) -> Value {
        Value::SmallInt(self as i32)
    }

    fn from_value(value: Value) -> Result<Self, VmError> {
        match value {
            Value::SmallInt(0) => Ok(FrameState::Active),
            Value::SmallInt(1) => Ok(FrameState::Returned),
            _ => Err(VmError::CorruptContext("bad method context state")),
        }
    }
}

/// The bytecode machine: object memory, the root registers, and the
/// cached instruction and stack pointers of the active context.
pub struct Machine {
    pub memory: ObjectMemory,
    pub registers: Registers,
    pub ip: usize,
    pub sp: usize,
    running: bool,
    pub tracing: bool,
    pub(crate) input: Box<dyn BufRead>,
    pub(crate) output: Box<dyn Write>,
    compiler: Option<Box<dyn Compiler>>,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("ip", &self.ip)
            .field("sp", &self.sp)
            .field("running", &self.running)
            .field("used_bytes", &self.memory.used_bytes())
            .field("collections", &self.memory.stats().collections)
            .finish_non_exhaustive()
    }
}

impl Machine {
    /// An empty machine. Use [`crate::bootstrap`] or [`crate::image`] to
    /// get one with a class library.
    pub fn new(settings: MemorySettings) -> Result<Self, &'static str> {
        Ok(Self {
            memory: ObjectMemory::new(settings)?,
            registers: Registers::new(),
            ip: 0,
            sp: 0,
            running: false,
            tracing: false,
            input: Box::new(io::BufReader::new(io::stdin())),
            output: Box::new(io::stdout()),
            compiler: Some(Box::new(SourceCompiler)),
        })
    }

    pub fn set_io(&mut self, input: Box<dyn BufRead>, output: Box<dyn Write>) {
        self.input = input;
        self.output = output;
    }

    /// Reads a line from the machine's input, so a host loop and primitive
    /// 130 share one buffer.
    pub fn read_line(&mut self, line: &mut String) -> io::Result<usize> {
        self.output.flush()?;
        self.input.read_line(line)
    }

    pub fn flush_output(&mut self) -> io::Result<()> {
        self.output.flush()
    }

    pub fn set_compiler(&mut self, compiler: Box<dyn Compiler>) {
        self.compiler = Some(compiler);
    }

    #[inline]
    pub fn nil(&self) -> Value {
        self.registers.known.nil
    }

    #[inline]
    pub fn boolean(&self, b: bool) -> Value {
        if b {
            self.registers.known.true_object
        } else {
            self.registers.known.false_object
        }
    }

    /// Allocates through the object memory with the registers as roots.
    /// Any `Value` not held in a register or the scratch stack is stale
    /// after this returns.
    pub fn create_object(&mut self, class: Value, size: usize, kind: ObjectKind) -> Result<Value, VmError> {
        let nil = self.registers.known.nil;
        self.memory.allocate(class, size, kind, nil, &mut self.registers)
    }

    pub fn collect_garbage(&mut self) -> Result<(), VmError> {
        self.memory.collect(&mut self.registers)
    }

    /// Class of any value; small integers answer ShortInteger.
    pub fn class_of(&self, value: Value) -> Result<Value, VmError> {
        match value {
            Value::SmallInt(_) => Ok(self.registers.known.short_integer),
            Value::Ref(_) => self.memory.class_of_object(value),
        }
    }

    /// Pushes values onto the scratch roots; returns the base to release.
    pub(crate) fn hold(&mut self, values: &[Value]) -> usize {
        let base = self.registers.scratch.len();
        self.registers.scratch.extend_from_slice(values);
        base
    }

    /// Pops `N` held values (updated by any collection since `hold`).
    pub(crate) fn release<const N: usize>(&mut self, base: usize) -> [Value; N] {
        let mut out = [Value::ZERO_REF; N];
        out.copy_from_slice(&self.registers.scratch[base..base + N]);
        self.registers.scratch.truncate(base);
        out
    }

    pub(crate) fn release_all(&mut self, base: usize) -> Vec<Value> {
        self.registers.scratch.split_off(base)
    }

    pub(crate) fn expect_small(&self, operation: &'static str, value: Value) -> Result<i32, VmError> {
        value
            .as_small_int()
            .ok_or(VmError::ExpectedSmallInt { operation, value })
    }

    pub(crate) fn expect_index(&self, operation: &'static str, value: Value) -> Result<usize, VmError> {
        let n = self.expect_small(operation, value)?;
        usize::try_from(n).map_err(|_| VmError::ValueOutOfRange {
            operation,
            value: n as i64,
        })
    }

    pub(crate) fn small_value(&self, operation: &'static str, n: usize) -> Result<Value, VmError> {
        Value::from_usize(n).ok_or(VmError::ValueOutOfRange {
            operation,
            value: n as i64,
        })
    }

    /// A small-integer field of an object, as an index or count.
    pub(crate) fn index_field(&self, object: Value, index: usize) -> Result<usize, VmError> {
        let value = self.memory.get_ptr(object, index)?;
        self.expect_index("field", value)
    }

    // stack

    pub fn push(&mut self, value: Value) -> Result<(), VmError> {
        self.memory.set_ptr(self.registers.stack, self.sp, value)?;
        self.sp += 1;
        let sp = self.small_value("push", self.sp)?;
        self.memory.set_ptr(self.registers.active_context, context::SP, sp)
    }

    pub fn pop(&mut self) -> Result<Value, VmError> {
        if self.sp == 0 {
            return Err(VmError::StackUnderflow);
        }
        self.sp -= 1;
        let value = self.memory.get_ptr(self.registers.stack, self.sp)?;
        let nil = self.nil();
        self.memory.set_ptr(self.registers.stack, self.sp, nil)?;
        let sp = self.small_value("pop", self.sp)?;
        self.memory.set_ptr(self.registers.active_context, context::SP, sp)?;
        Ok(value)
    }

    /// The value `depth` slots below the top of the stack.
    pub fn peek(&self, depth: usize) -> Result<Value, VmError> {
        if depth >= self.sp {
            return Err(VmError::StackUnderflow);
        }
        self.memory.get_ptr(self.registers.stack, self.sp - 1 - depth)
    }

    // contexts

    /// Makes `context` the active context and reloads every register
    /// derived from it.
    pub fn activate_context(&mut self, context: Value) -> Result<(), VmError> {
        let class = self.memory.class_of_object(context)?;
        let known = &self.registers.known;
        let home = if class == known.method_context {
            context
        } else if class == known.block_context {
            self.memory.get_ptr(context, block_context::HOME)?
        } else {
            return Err(VmError::CorruptContext("activating a non-context"));
        };
        if self.memory.class_of_object(home)? != self.registers.known.method_context {
            return Err(VmError::CorruptContext("block home is not a method context"));
        }

        let method = self.memory.get_ptr(home, method_context::METHOD)?;
        let r = &mut self.registers;
        r.active_context = context;
        r.home_context = home;
        r.method = method;
        r.receiver = self.memory.get_ptr(home, method_context::RECEIVER)?;
        r.args = self.memory.get_ptr(home, method_context::ARGS)?;
        r.temps = self.memory.get_ptr(home, method_context::TEMPS)?;
        r.stack = self.memory.get_ptr(context, context::STACK)?;
        r.code = self.memory.get_ptr(method, method::CODE)?;
        r.literals = self.memory.get_ptr(method, method::LITERALS)?;
        self.ip = self.index_field(context, context::IP)?;
        self.sp = self.index_field(context, context::SP)?;
        Ok(())
    }

    /// Executes one instruction of the active context.
    pub fn step(&mut self) -> Result<(), VmError> {
        let word = self.memory.get_word(self.registers.code, self.ip)?;
        self.ip += 1;
        let ip = self.small_value("fetch", self.ip)?;
        self.memory.set_ptr(self.registers.active_context, context::IP, ip)?;

        let instruction = Instruction::decode(word)?;
        if self.tracing {
            log::info!("{:>5} [{}] {instruction}", self.ip - 1, self.sp);
        } else {
            log::trace!("{:>5} [{}] {instruction}", self.ip - 1, self.sp);
        }

        match instruction {
            Instruction::Nop => {}
            Instruction::PushSelf => self.push(self.registers.receiver)?,
            Instruction::PushNil => self.push(self.registers.known.nil)?,
            Instruction::PushFalse => self.push(self.registers.known.false_object)?,
            Instruction::PushTrue => self.push(self.registers.known.true_object)?,
            Instruction::Dup => {
                let top = self.peek(0)?;
                self.push(top)?;
            }
            Instruction::Drop => {
                self.pop()?;
            }
            Instruction::ReturnMethod => self.return_from_method()?,
            Instruction::ReturnBlock => self.return_from_block()?,
            Instruction::PushConst { literal } => {
                let value = self.memory.get_ptr(self.registers.literals, literal as usize)?;
                self.push(value)?;
            }
            Instruction::PushGlobal { literal } => {
                let link = self.memory.get_ptr(self.registers.literals, literal as usize)?;
                let value = self.memory.get_ptr(link, crate::layout::link::VALUE)?;
                self.push(value)?;
            }
            Instruction::StoreGlobal { literal } => {
                let value = self.pop()?;
                let link = self.memory.get_ptr(self.registers.literals, literal as usize)?;
                self.memory.set_ptr(link, crate::layout::link::VALUE, value)?;
            }
            Instruction::PushInstance { index } => {
                let value = self.memory.get_ptr(self.registers.receiver, index as usize)?;
                self.push(value)?;
            }
            Instruction::StoreInstance { index } => {
                let value = self.pop()?;
                self.memory.set_ptr(self.registers.receiver, index as usize, value)?;
            }
            Instruction::PushArg { index } => {
                let value = self.memory.get_ptr(self.registers.args, index as usize)?;
                self.push(value)?;
            }
            Instruction::PushTemp { index } => {
                let value = self.memory.get_ptr(self.registers.temps, index as usize)?;
                self.push(value)?;
            }
            Instruction::StoreTemp { index } => {
                let value = self.pop()?;
                self.memory.set_ptr(self.registers.temps, index as usize, value)?;
            }
            Instruction::PushBlock { argc, stack_size } => {
                self.create_block_context(argc as usize, stack_size as usize)?;
            }
            Instruction::Send { argc, selector } => {
                let selector = self.memory.get_ptr(self.registers.literals, selector as usize)?;
                let receiver = self.peek(argc as usize)?;
                let class = self.class_of(receiver)?;
                self.send(class, selector, argc as usize)?;
            }
            Instruction::SendSuper { argc, selector } => {
                let selector = self.memory.get_ptr(self.registers.literals, selector as usize)?;
                let defining = self.memory.get_ptr(self.registers.method, method::CLASS)?;
                let class = self.memory.get_ptr(defining, behavior::SUPERCLASS)?;
                self.send(class, selector, argc as usize)?;
            }
            Instruction::Primitive { argc, number } => {
                primitives::invoke(self, number, argc as usize)?;
            }
            Instruction::Jump { target } => {
                self.ip = target as usize;
                let ip = self.small_value("jump", self.ip)?;
                self.memory.set_ptr(self.registers.active_context, context::IP, ip)?;
            }
        }
        Ok(())
    }

    /// Walks the superclass chain from `class` for `selector`.
    pub fn find_method(&self, class: Value, selector: Value) -> Result<Value, VmError> {
        let nil = self.nil();
        let mut current = class;
        while current != nil {
            let methods = self.memory.get_ptr(current, behavior::METHODS)?;
            if methods != nil {
                if let Some(found) = self.dictionary_lookup(methods, selector)? {
                    return Ok(found);
                }
            }
            current = self.memory.get_ptr(current, behavior::SUPERCLASS)?;
        }
        Err(VmError::MessageNotUnderstood {
            class: self.class_name(class),
            selector: self.string_value(selector).unwrap_or_default(),
        })
    }

    fn send(&mut self, class: Value, selector: Value, argc: usize) -> Result<(), VmError> {
        let found = self.find_method(class, selector)?;
        let expected = self.index_field(found, method::ARG_SIZE)?;
        if expected != argc {
            return Err(VmError::ArgumentCountMismatch {
                selector: self.string_value(selector).unwrap_or_default(),
                expected,
                got: argc,
            });
        }
        self.registers.new_method = found;
        self.execute_new_method()
    }

    /// Builds a method context for `registers.new_method`, moving the
    /// arguments and receiver off the caller's stack, and activates it.
    fn execute_new_method(&mut self) -> Result<(), VmError> {
        let class = self.registers.known.method_context;
        let context = self.create_object(class, method_context::SIZE, ObjectKind::Pointers)?;
        self.registers.new_context = context;

        let stack_size = self.index_field(self.registers.new_method, method::STACK_SIZE)?;
        if stack_size > 0 {
            let array = self.registers.known.array;
            let stack = self.create_object(array, stack_size, ObjectKind::Pointers)?;
            self.memory.set_ptr(self.registers.new_context, context::STACK, stack)?;
        }

        let r = &self.registers;
        let (context, caller, new_method) = (r.new_context, r.active_context, r.new_method);
        self.memory.set_ptr(context, context::CALLER, caller)?;
        self.memory.set_ptr(context, context::IP, Value::SmallInt(0))?;
        self.memory.set_ptr(context, context::SP, Value::SmallInt(0))?;
        self.memory.set_ptr(context, method_context::METHOD, new_method)?;
        self.memory
            .set_ptr(context, method_context::STATE, FrameState::Active.value())?;

        let argc = self.index_field(new_method, method::ARG_SIZE)?;
        if argc > 0 {
            let array = self.registers.known.array;
            let args = self.create_object(array, argc, ObjectKind::Pointers)?;
            self.memory.set_ptr(self.registers.new_context, method_context::ARGS, args)?;
            for i in (0..argc).rev() {
                let value = self.pop()?;
                self.memory.set_ptr(args, i, value)?;
            }
        }
        let receiver = self.pop()?;
        self.memory
            .set_ptr(self.registers.new_context, method_context::RECEIVER, receiver)?;

        let temp_size = self.index_field(self.registers.new_method, method::TEMP_SIZE)?;
        if temp_size > 0 {
            let array = self.registers.known.array;
            let temps = self.create_object(array, temp_size, ObjectKind::Pointers)?;
            self.memory.set_ptr(self.registers.new_context, method_context::TEMPS, temps)?;
        }

        let nil = self.nil();
        let context = self.registers.new_context;
        self.registers.new_method = nil;
        self.registers.new_context = nil;
        self.activate_context(context)
    }

    /// `^value`: return from the home method context to its caller. A
    /// method context can be returned from once.
    fn return_from_method(&mut self) -> Result<(), VmError> {
        let home = self.registers.home_context;
        let state = FrameState::from_value(self.memory.get_ptr(home, method_context::STATE)?)?;
        let caller = self.memory.get_ptr(home, context::CALLER)?;
        if state == FrameState::Returned || caller == self.nil() {
            return Err(VmError::DoubleReturn);
        }
        self.memory
            .set_ptr(home, method_context::STATE, FrameState::Returned.value())?;
        self.memory.set_ptr(home, context::CALLER, self.nil())?;

        let value = self.pop()?;
        self.activate_context(caller)?;
        self.push(value)
    }

    /// Return from the active block context to whoever activated it.
    fn return_from_block(&mut self) -> Result<(), VmError> {
        let block = self.registers.active_context;
        let caller = self.memory.get_ptr(block, context::CALLER)?;
        if caller == self.nil() {
            return Err(VmError::OrphanBlockReturn);
        }
        self.memory.set_ptr(block, context::CALLER, self.nil())?;

        let value = self.pop()?;
        self.activate_context(caller)?;
        self.push(value)
    }

    /// Pushes a new block context whose body starts right after the jump
    /// that follows the current instruction.
    fn create_block_context(&mut self, argc: usize, stack_size: usize) -> Result<(), VmError> {
        let class = self.registers.known.block_context;
        let block = self.create_object(class, block_context::SIZE, ObjectKind::Pointers)?;
        self.registers.new_context = block;
        if stack_size > 0 {
            let array = self.registers.known.array;
            let stack = self.create_object(array, stack_size, ObjectKind::Pointers)?;
            self.memory.set_ptr(self.registers.new_context, context::STACK, stack)?;
        }

        let block = self.registers.new_context;
        let ip_start = self.small_value("block", self.ip + 1)?;
        let argc = self.small_value("block", argc)?;
        self.memory.set_ptr(block, context::IP, Value::SmallInt(0))?;
        self.memory.set_ptr(block, context::SP, Value::SmallInt(0))?;
        self.memory.set_ptr(block, block_context::ARG_COUNT, argc)?;
        self.memory.set_ptr(block, block_context::IP_START, ip_start)?;
        self.memory
            .set_ptr(block, block_context::HOME, self.registers.home_context)?;

        self.registers.new_context = self.nil();
        self.push(block)
    }

    pub(crate) fn stop(&mut self) {
        self.running = false;
    }

    /// Runs `method` with `receiver` and `args` until it returns.
    ///
    /// The call goes through a sentinel entry context; when that context
    /// becomes active again the method has returned and its result is on
    /// the sentinel's stack.
    pub fn call(&mut self, method: Value, receiver: Value, args: &[Value]) -> Result<Completion, VmError> {
        let expected = self.index_field(method, method::ARG_SIZE)?;
        if expected != args.len() {
            let selector = self.memory.get_ptr(method, method::SELECTOR)?;
            return Err(VmError::ArgumentCountMismatch {
                selector: self.string_value(selector).unwrap_or_default(),
                expected,
                got: args.len(),
            });
        }

        let base = self.hold(&[method, receiver]);
        self.registers.scratch.extend_from_slice(args);

        let class = self.registers.known.method_context;
        let entry = self.create_object(class, method_context::SIZE, ObjectKind::Pointers)?;
        self.registers.entry_context = entry;
        let array = self.registers.known.array;
        let stack = self.create_object(array, args.len() + 2, ObjectKind::Pointers)?;

        let held = self.release_all(base);
        let (method, receiver) = (held[0], held[1]);
        let entry = self.registers.entry_context;
        let previous = self.registers.active_context;
        self.memory.set_ptr(entry, context::CALLER, previous)?;
        self.memory.set_ptr(entry, context::IP, Value::SmallInt(0))?;
        self.memory.set_ptr(entry, context::STACK, stack)?;
        self.memory.set_ptr(entry, context::SP, Value::SmallInt(0))?;
        self.memory.set_ptr(entry, method_context::METHOD, method)?;
        self.memory.set_ptr(entry, method_context::RECEIVER, receiver)?;
        self.memory
            .set_ptr(entry, method_context::STATE, FrameState::Active.value())?;

        self.activate_context(entry)?;
        self.push(receiver)?;
        for &arg in &held[2..] {
            self.push(arg)?;
        }
        self.registers.new_method = method;
        self.execute_new_method()?;

        let completion = self.run_to_entry()?;
        let entry = self.registers.entry_context;
        let previous = self.memory.get_ptr(entry, context::CALLER)?;
        if completion == Completion::ShutDown || previous == self.nil() {
            self.registers.clear_machine();
        } else {
            self.registers.entry_context = self.nil();
            self.activate_context(previous)?;
        }
        Ok(completion)
    }

    fn run_to_entry(&mut self) -> Result<Completion, VmError> {
        self.running = true;
        loop {
            if !self.running {
                return Ok(Completion::ShutDown);
            }
            if self.registers.active_context == self.registers.entry_context {
                self.running = false;
                return Ok(Completion::Returned(self.pop()?));
            }
            self.step()?;
        }
    }

    /// Sends `selector` to `receiver` from the host.
    pub fn send_message(&mut self, receiver: Value, selector: &str, args: &[Value]) -> Result<Completion, VmError> {
        let base = self.hold(&[receiver]);
        self.registers.scratch.extend_from_slice(args);
        let selector = self.new_symbol(selector)?;
        let held = self.release_all(base);
        let class = self.class_of(held[0])?;
        let method = self.find_method(class, selector)?;
        self.call(method, held[0], &held[1..])
    }

    pub fn compile(&mut self, source: &str, class: Value, value_needed: bool) -> Result<Value, CompileError> {
        let mut compiler = self.compiler.take().ok_or(VmError::NoCompiler)?;
        let result = compiler.compile(self, source, class, value_needed);
        self.compiler = Some(compiler);
        result
    }

    /// Compiles `source` as the body of a method of UndefinedObject and
    /// runs it with nil as receiver, answering the last expression.
    pub fn evaluate(&mut self, source: &str) -> Result<Completion, EvalError> {
        let class = self.class_of(self.nil())?;
        let method = self.compile(&format!("doIt\n{source}"), class, true)?;
        // compiling may have moved nil
        let nil = self.nil();
        Ok(self.call(method, nil, &[])?)
    }

    /// `receiver printString`, as host text.
    pub fn print_string(&mut self, value: Value) -> Result<String, VmError> {
        match self.send_message(value, "printString", &[])? {
            Completion::Returned(s) => self.string_value(s),
            Completion::ShutDown => Ok(String::new()),
        }
    }

    /// `Class>>selector` of the running method, for error reports.
    pub fn location(&self) -> Option<String> {
        let method = self.registers.method;
        let class = self.memory.get_ptr(method, method::CLASS).ok()?;
        let selector = self.memory.get_ptr(method, method::SELECTOR).ok()?;
        Some(format!(
            "{}>>{}",
            self.class_name(class),
            self.string_value(selector).ok()?
        ))
    }

    /// One line per instruction of `method`, literal operands resolved.
    pub fn disassemble(&self, method: Value) -> Result<String, VmError> {
        let code = self.memory.get_ptr(method, method::CODE)?;
        let literals = self.memory.get_ptr(method, method::LITERALS)?;
        let mut out = String::new();
        for ip in 0..self.memory.size(code)? {
            let instruction = Instruction::decode(self.memory.get_word(code, ip)?)?;
            let literal = match instruction {
                Instruction::PushConst { literal }
                | Instruction::PushGlobal { literal }
                | Instruction::StoreGlobal { literal } => Some(literal),
                Instruction::Send { selector, .. } | Instruction::SendSuper { selector, .. } => Some(selector),
                _ => None,
            };
            match literal {
                Some(index) => {
                    let value = self.memory.get_ptr(literals, index as usize)?;
                    out.push_str(&format!("{ip:>4}  {instruction}  ; {}\n", self.describe_literal(value)));
                }
                None => out.push_str(&format!("{ip:>4}  {instruction}\n")),
            }
        }
        Ok(out)
    }

    fn describe_literal(&self, value: Value) -> String {
        let Value::Ref(_) = value else {
            return format!("{value:?}");
        };
        let Ok(class) = self.class_of(value) else {
            return "?".to_string();
        };
        let known = &self.registers.known;
        if class == known.symbol {
            format!("#{}", self.string_value(value).unwrap_or_default())
        } else if class == known.string {
            format!("'{}'", self.string_value(value).unwrap_or_default())
        } else if class == known.link {
            let key = self.memory.get_ptr(value, link::KEY).unwrap_or(value);
            self.string_value(key).unwrap_or_default()
        } else {
            format!("a {}", self.class_name(class))
        }
    }
}

#[cfg(test)]
impl Machine {
    /// Fills the active semispace with a garbage string so that exactly
    /// `bytes` stay free and the next larger allocation collects.
    pub(crate) fn leave_free_bytes(&mut self, bytes: usize) {
        use crate::memory::HEADER_BYTES;
        if self.memory.free_bytes() < bytes + HEADER_BYTES {
            self.collect_garbage().unwrap();
        }
        let filler = self.memory.free_bytes() - bytes - HEADER_BYTES;
        let string = self.registers.known.string;
        self.create_object(string, filler, ObjectKind::Bytes).unwrap();
        assert_eq!(self.memory.free_bytes(), bytes);
    }
}
