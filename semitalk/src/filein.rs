//! Class files: class definitions and method sources in one text file.
//!
//! ```text
//! * a comment line
//! CLASS Point SUBCLASSOF Object VARS x y
//! METHODS Point
//! x
//!     ^x
//! |
//! x: aNumber
//!     x := aNumber
//! ]
//! CLASSMETHODS Point
//! x: ax
//!     ^self new x: ax
//! ]
//! ```
//!
//! Class kinds are `SUBCLASSOF` (fixed pointers), `VARSUBCLASSOF`,
//! `VARBYTESUBCLASSOF` and `VARWORDSUBCLASSOF`; the superclass of a root
//! class is `nil`.

use crate::error::{CompileError, FileInError, VmError};
use crate::interpreter::Machine;
use crate::layout::{behavior, dictionary};
use crate::memory::ObjectKind;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassShape {
    Fixed,
    Variable,
    VariableBytes,
    VariableWords,
}

impl ClassShape {
    fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "SUBCLASSOF" => Some(ClassShape::Fixed),
            "VARSUBCLASSOF" => Some(ClassShape::Variable),
            "VARBYTESUBCLASSOF" => Some(ClassShape::VariableBytes),
            "VARWORDSUBCLASSOF" => Some(ClassShape::VariableWords),
            _ => None,
        }
    }

    /// The `instType` flags stored in the class.
    pub fn inst_type(self) -> i32 {
        match self {
            ClassShape::Fixed => behavior::IS_POINTERS,
            ClassShape::Variable => behavior::IS_VARIABLE | behavior::IS_POINTERS,
            ClassShape::VariableBytes => behavior::IS_VARIABLE,
            ClassShape::VariableWords => behavior::IS_VARIABLE | behavior::IS_WORDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    pub name: String,
    pub shape: ClassShape,
    pub superclass: Option<String>,
    pub variables: Vec<String>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSource {
    pub text: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSection {
    pub class: String,
    /// `CLASSMETHODS`: the methods go to the metaclass.
    pub class_side: bool,
    pub methods: Vec<MethodSource>,
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassFile {
    pub classes: Vec<ClassDef>,
    pub sections: Vec<MethodSection>,
}

pub fn parse_class_file(source: &str) -> Result<ClassFile, FileInError> {
    let mut file = ClassFile::default();
    let mut lines = source.lines().enumerate().map(|(i, l)| (i + 1, l));

    while let Some((line, text)) = lines.next() {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let Some(&first) = tokens.first() else {
            continue;
        };
        if first.starts_with('*') {
            continue;
        }
        match first {
            "CLASS" => file.classes.push(parse_class_line(line, &tokens)?),
            "METHODS" | "CLASSMETHODS" => {
                let [_, class] = tokens.as_slice() else {
                    return Err(FileInError::syntax(line, format!("{first} takes exactly one class name")));
                };
                let mut section = MethodSection {
                    class: class.to_string(),
                    class_side: first == "CLASSMETHODS",
                    methods: Vec::new(),
                    line,
                };
                read_methods(&mut lines, &mut section)?;
                file.sections.push(section);
            }
            other => return Err(FileInError::syntax(line, format!("unrecognized line starting with {other}"))),
        }
    }
    Ok(file)
}

fn parse_class_line(line: usize, tokens: &[&str]) -> Result<ClassDef, FileInError> {
    if tokens.len() < 4 {
        return Err(FileInError::syntax(line, "expected CLASS <name> <kind> <superclass>"));
    }
    let shape = ClassShape::from_keyword(tokens[2])
        .ok_or_else(|| FileInError::syntax(line, format!("unknown class kind {}", tokens[2])))?;
    let variables = match tokens.get(4) {
        None => Vec::new(),
        Some(&"VARS") => tokens[5..].iter().map(|v| v.to_string()).collect(),
        Some(other) => return Err(FileInError::syntax(line, format!("expected VARS, found {other}"))),
    };
    Ok(ClassDef {
        name: tokens[1].to_string(),
        shape,
        superclass: (tokens[3] != "nil").then(|| tokens[3].to_string()),
        variables,
        line,
    })
}

/// Method texts up to the closing `]`; a line holding only `|` separates
/// two methods.
fn read_methods<'a>(
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
    section: &mut MethodSection,
) -> Result<(), FileInError> {
    let mut text = String::new();
    let mut start = section.line + 1;
    for (line, raw) in lines {
        let trimmed = raw.trim();
        if trimmed == "|" || trimmed == "]" {
            if !text.trim().is_empty() {
                section.methods.push(MethodSource {
                    text: std::mem::take(&mut text),
                    line: start,
                });
            }
            text.clear();
            start = line + 1;
            if trimmed == "]" {
                return Ok(());
            }
            continue;
        }
        if text.is_empty() && trimmed.is_empty() {
            start = line + 1;
            continue;
        }
        text.push_str(raw);
        text.push('\n');
    }
    Err(FileInError::syntax(section.line, format!("{} section is not closed by ]", section.class)))
}

/// What a runtime file-in did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInReport {
    pub classes_defined: usize,
    pub methods_installed: usize,
    /// One message per method that did not compile.
    pub failures: Vec<String>,
}

/// Compiles and installs every method of `source` into the running
/// image. New classes are created; classes that already exist keep their
/// shape. A method that does not compile is logged and skipped.
pub fn file_in(machine: &mut Machine, source: &str) -> Result<FileInReport, FileInError> {
    let file = parse_class_file(source)?;
    let mut report = FileInReport::default();

    for def in &file.classes {
        if lookup_class(machine, &def.name)?.is_some() {
            log::debug!("file-in: class {} already exists, keeping it", def.name);
            continue;
        }
        define_class(machine, def)?;
        report.classes_defined += 1;
    }

    for section in &file.sections {
        for method in &section.methods {
            let target = section_target(machine, section)?;
            match machine.compile(&method.text, target, false) {
                Ok(compiled) => {
                    // compiling may have moved the class
                    let target = section_target(machine, section)?;
                    machine.install_method(target, compiled)?;
                    report.methods_installed += 1;
                }
                Err(CompileError::Machine(e)) => return Err(e.into()),
                Err(e) => {
                    let message = format!("{} (method at line {}): {e}", section.class, method.line);
                    log::warn!("file-in: {message}");
                    report.failures.push(message);
                }
            }
        }
    }

    log::info!(
        "file-in: {} classes defined, {} methods installed, {} failed",
        report.classes_defined,
        report.methods_installed,
        report.failures.len()
    );
    Ok(report)
}

/// The class or metaclass a method section installs into.
fn section_target(machine: &Machine, section: &MethodSection) -> Result<Value, FileInError> {
    let class = lookup_class(machine, &section.class)?.ok_or_else(|| FileInError::UnknownClass {
        line: section.line,
        name: section.class.clone(),
    })?;
    if section.class_side {
        Ok(machine.class_of(class)?)
    } else {
        Ok(class)
    }
}

/// The global `name` if it is bound to a class.
pub fn lookup_class(machine: &Machine, name: &str) -> Result<Option<Value>, VmError> {
    let Some(value) = machine.global_value(name)? else {
        return Ok(None);
    };
    if value.is_small_int() || value == machine.nil() {
        return Ok(None);
    }
    let metaclass = machine.class_of(value)?;
    Ok((machine.class_of(metaclass)? == machine.registers.known.metaclass).then_some(value))
}

fn define_class(machine: &mut Machine, def: &ClassDef) -> Result<Value, FileInError> {
    let nil = machine.nil();
    let superclass = match &def.superclass {
        None => nil,
        Some(name) => lookup_class(machine, name)?.ok_or_else(|| FileInError::UnknownClass {
            line: def.line,
            name: name.clone(),
        })?,
    };
    let super_meta = if superclass == nil {
        lookup_class(machine, "Class")?.ok_or_else(|| FileInError::UnknownClass {
            line: def.line,
            name: "Class".into(),
        })?
    } else {
        machine.class_of(superclass)?
    };

    let base = machine.hold(&[superclass, super_meta]);
    let metaclass = machine.registers.known.metaclass;
    let meta = machine.create_object(metaclass, behavior::SIZE, ObjectKind::Pointers)?;
    let class = machine.create_object(meta, behavior::SIZE, ObjectKind::Pointers)?;
    let [superclass, super_meta] = machine.release(base);
    let class = init_class(machine, class, superclass, super_meta, def)?;
    machine.set_global(&def.name, class)?;
    log::debug!("file-in: defined class {}", def.name);
    Ok(class)
}

/// Fills in a class and its metaclass (the class's class) from `def`.
/// Answers the class, which may have moved.
pub(crate) fn init_class(
    machine: &mut Machine,
    class: Value,
    superclass: Value,
    super_meta: Value,
    def: &ClassDef,
) -> Result<Value, VmError> {
    let nil = machine.nil();
    let inherited = if superclass == nil {
        0
    } else {
        machine.index_field(superclass, behavior::INST_SIZE)?
    };
    let base = machine.hold(&[class, superclass, super_meta]);
    let class_field = |machine: &mut Machine, field: usize, value: Value| -> Result<(), VmError> {
        let class = machine.registers.scratch[base];
        machine.memory.set_ptr(class, field, value)
    };
    let meta_field = |machine: &mut Machine, field: usize, value: Value| -> Result<(), VmError> {
        let meta = machine.class_of(machine.registers.scratch[base])?;
        machine.memory.set_ptr(meta, field, value)
    };

    let name = machine.new_symbol(&def.name)?;
    class_field(machine, behavior::NAME, name)?;
    class_field(machine, behavior::INST_TYPE, Value::SmallInt(def.shape.inst_type()))?;
    let inst_size = machine.small_value("class", inherited + def.variables.len())?;
    class_field(machine, behavior::INST_SIZE, inst_size)?;
    let superclass = machine.registers.scratch[base + 1];
    class_field(machine, behavior::SUPERCLASS, superclass)?;
    let methods = new_method_dictionary(machine)?;
    class_field(machine, behavior::METHODS, methods)?;
    if !def.variables.is_empty() {
        let array = machine.registers.known.array;
        let variables = machine.create_object(array, def.variables.len(), ObjectKind::Pointers)?;
        class_field(machine, behavior::VARIABLES, variables)?;
        for (i, variable) in def.variables.iter().enumerate() {
            let symbol = machine.new_symbol(variable)?;
            let variables = machine.memory.get_ptr(machine.registers.scratch[base], behavior::VARIABLES)?;
            machine.memory.set_ptr(variables, i, symbol)?;
        }
    }

    let meta_name = machine.new_symbol(&format!("{} class", def.name))?;
    meta_field(machine, behavior::NAME, meta_name)?;
    meta_field(machine, behavior::INST_TYPE, Value::SmallInt(behavior::IS_POINTERS))?;
    meta_field(machine, behavior::INST_SIZE, Value::SmallInt(behavior::SIZE as i32))?;
    let super_meta = machine.registers.scratch[base + 2];
    meta_field(machine, behavior::SUPERCLASS, super_meta)?;
    let methods = new_method_dictionary(machine)?;
    meta_field(machine, behavior::METHODS, methods)?;

    let [class, _, _] = machine.release(base);
    Ok(class)
}

/// An empty method dictionary. The `Dictionary` class is looked up here,
/// after any earlier allocation may have moved it.
fn new_method_dictionary(machine: &mut Machine) -> Result<Value, VmError> {
    let class = match machine.global_value("Dictionary")? {
        Some(class) => class,
        None => machine.nil(),
    };
    machine.new_dictionary(class, dictionary::BUCKETS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::bootstrap;
    use crate::interpreter::Completion;
    use crate::memory::MemorySettings;

    #[test]
    fn test_parse_class_lines() {
        let file = parse_class_file(
            "* comment\n\nCLASS Point SUBCLASSOF Object VARS x y\nCLASS Bytes VARBYTESUBCLASSOF nil\n",
        )
        .unwrap();
        assert_eq!(
            file.classes,
            vec![
                ClassDef {
                    name: "Point".into(),
                    shape: ClassShape::Fixed,
                    superclass: Some("Object".into()),
                    variables: vec!["x".into(), "y".into()],
                    line: 3,
                },
                ClassDef {
                    name: "Bytes".into(),
                    shape: ClassShape::VariableBytes,
                    superclass: None,
                    variables: vec![],
                    line: 4,
                },
            ]
        );
    }

    #[test]
    fn test_parse_method_sections() {
        let file = parse_class_file("METHODS Point\nx\n    ^x\n|\ny\n    ^y\n]\nCLASSMETHODS Point\nnew\n  ^super new\n]\n").unwrap();
        assert_eq!(file.sections.len(), 2);
        let methods = &file.sections[0].methods;
        assert_eq!(methods[0], MethodSource {
            text: "x\n    ^x\n".into(),
            line: 2,
        });
        assert_eq!(methods[1].line, 5);
        assert!(file.sections[1].class_side);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_class_file("CLASS Foo KINDOF Object"),
            Err(FileInError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            parse_class_file("\nMETHODS Foo\nx ^1\n"),
            Err(FileInError::Syntax { line: 2, .. })
        ));
        assert!(matches!(parse_class_file("FROB"), Err(FileInError::Syntax { .. })));
    }

    #[test]
    fn test_file_in_defines_classes_and_methods() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let report = file_in(
            &mut m,
            "CLASS Point SUBCLASSOF Object VARS x y
METHODS Point
x
    ^x
|
x: ax y: ay
    x := ax.
    y := ay
|
sum
    ^x + y
]
CLASSMETHODS Point
x: ax y: ay
    ^self new x: ax y: ay
]
",
        )
        .unwrap();
        assert_eq!(report.classes_defined, 1);
        assert_eq!(report.methods_installed, 4);
        assert!(report.failures.is_empty());
        let v = m.evaluate("(Point x: 3 y: 4) sum").unwrap();
        assert_eq!(v, Completion::Returned(Value::SmallInt(7)));
        let v = m.evaluate("Point class name").unwrap();
        let Completion::Returned(name) = v else { panic!() };
        assert_eq!(m.string_value(name).unwrap(), "Point class");
    }

    #[test]
    fn test_file_in_skips_broken_methods() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let report = file_in(
            &mut m,
            "METHODS ShortInteger
broken
    ^(self
|
triple
    ^self * 3
]
",
        )
        .unwrap();
        assert_eq!(report.methods_installed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(m.evaluate("5 triple").unwrap(), Completion::Returned(Value::SmallInt(15)));
    }

    #[test]
    fn test_file_in_unknown_class() {
        let mut m = bootstrap(MemorySettings::default()).unwrap();
        let err = file_in(&mut m, "METHODS Nowhere\nx ^1\n]\n").unwrap_err();
        assert!(matches!(err, FileInError::UnknownClass { line: 1, .. }), "{err}");
    }

    #[test]
    fn test_file_in_under_collection_pressure() {
        let settings = MemorySettings {
            semispace_size: 256 * 1024,
            ..MemorySettings::default()
        };
        let mut m = bootstrap(settings).unwrap();
        for i in 0..40 {
            let source = format!("CLASS Pressure{i} SUBCLASSOF Object VARS a b c\nMETHODS Pressure{i}\nsum\n    ^#(1 2 3) size + {i}\n]\n");
            file_in(&mut m, &source).unwrap();
        }
        let v = m.evaluate("Pressure39 new sum").unwrap();
        assert_eq!(v, Completion::Returned(Value::SmallInt(42)));
    }

    #[test]
    fn test_defined_class_survives_collection_at_any_point() {
        let settings = MemorySettings {
            // room for every class defined below
            semispace_size: 512 * 1024,
            ..MemorySettings::default()
        };
        let mut m = bootstrap(settings).unwrap();
        for free in (0..1200).step_by(4) {
            let name = format!("Gadget{free}");
            let source = format!(
                "CLASS {name} SUBCLASSOF Object VARS tag\n\
                 METHODS {name}\ntag: n\n    tag := n\n|\ntag\n    ^tag\n]\n\
                 CLASSMETHODS {name}\ntagged: n\n    ^self new tag: n\n]\n"
            );
            m.leave_free_bytes(free);
            let report = file_in(&mut m, &source).unwrap();
            assert_eq!((report.classes_defined, report.methods_installed), (1, 3));

            let class = m.global_value(&name).unwrap().unwrap();
            let meta = m.class_of(class).unwrap();
            let dictionary = m.global_value("Dictionary").unwrap().unwrap();
            for owner in [class, meta] {
                let methods = m.memory.get_ptr(owner, behavior::METHODS).unwrap();
                assert_eq!(m.class_of(methods).unwrap(), dictionary, "{free} bytes free");
            }
            m.collect_garbage().unwrap();
            let v = m.evaluate(&format!("({name} tagged: {free}) tag")).unwrap();
            assert_eq!(v, Completion::Returned(Value::SmallInt(free as i32)));
        }
    }
}
