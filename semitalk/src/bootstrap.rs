//! Builds a fresh image from a class file.
//!
//! Collection is off for the whole build, so the raw values held in
//! locals below stay valid. The order matters: nil must land at address
//! zero, classes exist before anything asks for its class, and the
//! system dictionary exists before the first symbol is interned.

use std::collections::HashMap;

use crate::error::{BootstrapError, FileInError};
use crate::filein::{init_class, parse_class_file};
use crate::interpreter::Machine;
use crate::layout::{behavior, character, dictionary};
use crate::memory::{MemorySettings, ObjectKind};
use crate::value::Value;

/// The class library compiled into every fresh image.
pub const KERNEL: &str = include_str!("../kernel/kernel.st");

pub fn bootstrap(settings: MemorySettings) -> Result<Machine, BootstrapError> {
    bootstrap_with(settings, KERNEL)
}

pub fn bootstrap_with(settings: MemorySettings, source: &str) -> Result<Machine, BootstrapError> {
    let file = parse_class_file(source)?;
    let gc_enabled = settings.gc_enabled;
    let mut machine = Machine::new(MemorySettings {
        gc_enabled: false,
        ..settings
    })
    .map_err(BootstrapError::Settings)?;

    // nil, false, true and the characters get their classes once those exist
    let unclassed = Value::ZERO_REF;
    let nil = machine.create_object(unclassed, 0, ObjectKind::Pointers)?;
    debug_assert_eq!(nil, Value::ZERO_REF);
    machine.registers.known.nil = nil;
    machine.registers.known.false_object = machine.create_object(unclassed, 0, ObjectKind::Pointers)?;
    machine.registers.known.true_object = machine.create_object(unclassed, 0, ObjectKind::Pointers)?;
    for code in 0..character::COUNT {
        let c = machine.create_object(unclassed, character::SIZE, ObjectKind::Bytes)?;
        machine.memory.set_byte(c, 0, code as u8)?;
        machine.registers.known.characters[code] = c;
    }

    let mut classes: HashMap<&str, Value> = HashMap::new();
    for def in &file.classes {
        let meta = machine.create_object(unclassed, behavior::SIZE, ObjectKind::Pointers)?;
        let class = machine.create_object(meta, behavior::SIZE, ObjectKind::Pointers)?;
        if classes.insert(def.name.as_str(), class).is_some() {
            return Err(FileInError::syntax(def.line, format!("class {} defined twice", def.name)).into());
        }
    }
    let find = |name: &'static str| classes.get(name).copied().ok_or(BootstrapError::MissingClass(name));

    let known = &mut machine.registers.known;
    known.short_integer = find("ShortInteger")?;
    known.float = find("Float")?;
    known.character = find("Character")?;
    known.string = find("String")?;
    known.symbol = find("Symbol")?;
    known.link = find("Link")?;
    known.method = find("Method")?;
    known.array = find("Array")?;
    known.word_array = find("WordArray")?;
    known.method_context = find("MethodContext")?;
    known.block_context = find("BlockContext")?;
    known.metaclass = find("Metaclass")?;
    let class_class = find("Class")?;

    let metaclass = machine.registers.known.metaclass;
    for &class in classes.values() {
        let meta = machine.class_of(class)?;
        machine.memory.set_class(meta, metaclass)?;
    }
    machine.memory.set_class(nil, find("UndefinedObject")?)?;
    machine
        .memory
        .set_class(machine.registers.known.false_object, find("False")?)?;
    machine
        .memory
        .set_class(machine.registers.known.true_object, find("True")?)?;
    let character_class = machine.registers.known.character;
    for code in 0..character::COUNT {
        machine
            .memory
            .set_class(machine.registers.known.characters[code], character_class)?;
    }

    let smalltalk = machine.create_object(find("SystemDictionary")?, dictionary::SIZE, ObjectKind::Pointers)?;
    let array = machine.registers.known.array;
    let table = machine.create_object(array, dictionary::SYSTEM_BUCKETS, ObjectKind::Pointers)?;
    machine.memory.set_ptr(smalltalk, dictionary::HASH_TABLE, table)?;
    machine.registers.known.smalltalk = smalltalk;

    machine.set_global("Smalltalk", smalltalk)?;
    for def in &file.classes {
        machine.set_global(&def.name, classes[def.name.as_str()])?;
    }

    for def in &file.classes {
        let class = classes[def.name.as_str()];
        let superclass = match &def.superclass {
            None => nil,
            Some(name) => classes
                .get(name.as_str())
                .copied()
                .ok_or_else(|| FileInError::UnknownClass {
                    line: def.line,
                    name: name.clone(),
                })?,
        };
        let super_meta = if superclass == nil {
            class_class
        } else {
            machine.class_of(superclass)?
        };
        init_class(&mut machine, class, superclass, super_meta, def)?;
    }

    let mut methods = 0;
    for section in &file.sections {
        let class = classes
            .get(section.class.as_str())
            .copied()
            .ok_or_else(|| FileInError::UnknownClass {
                line: section.line,
                name: section.class.clone(),
            })?;
        let target = if section.class_side {
            machine.class_of(class)?
        } else {
            class
        };
        for source in &section.methods {
            let method = machine
                .compile(&source.text, target, false)
                .map_err(|error| BootstrapError::Compile {
                    class: format!("{} (method at line {})", machine.class_name(target), source.line),
                    error,
                })?;
            machine.install_method(target, method)?;
            methods += 1;
        }
    }

    machine.memory.set_gc_enabled(gc_enabled);
    machine.registers.clear_machine();
    log::info!(
        "bootstrap: {} classes, {} methods, {} bytes in use",
        file.classes.len(),
        methods,
        machine.memory.used_bytes()
    );
    Ok(machine)
}
