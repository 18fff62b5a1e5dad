//! Persisted images.
//!
//! An image is a little-endian header followed by the occupied part of the
//! active semispace. Saving compacts first, twice if the live data ended
//! up in the upper semispace, so the arena bytes always start at offset 0
//! and can be loaded without relocation.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::ImageError;
use crate::interpreter::Machine;
use crate::memory::{ALIGN, HEADER_BYTES, MemorySettings, ObjectKind};
use crate::value::Value;

pub const MAGIC1: u32 = 0x37A2_F90B;
pub const MAGIC2: u32 = 0x1E84_C56D;
pub const MAJOR_VERSION: u32 = 0;
pub const MINOR_VERSION: u32 = 2;

pub fn save_image(machine: &mut Machine, path: &Path) -> Result<(), ImageError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_image(machine, &mut writer)?;
    writer.flush()?;
    log::info!(
        "saved image {} ({} bytes of objects)",
        path.display(),
        machine.memory.used_bytes()
    );
    Ok(())
}

pub fn load_image(path: &Path, settings: MemorySettings) -> Result<Machine, ImageError> {
    let mut reader = BufReader::new(File::open(path)?);
    let machine = read_image(&mut reader, settings)?;
    log::info!(
        "loaded image {} ({} bytes of objects)",
        path.display(),
        machine.memory.used_bytes()
    );
    Ok(machine)
}

fn ensure_save_preconditions(machine: &Machine) -> Result<(), ImageError> {
    if !machine.registers.scratch.is_empty() {
        return Err(ImageError::Busy("values are held on the scratch stack"));
    }
    if machine.registers.compiler_method != machine.nil() {
        return Err(ImageError::Busy("a method is being compiled"));
    }
    Ok(())
}

pub fn write_image<W: Write>(machine: &mut Machine, writer: &mut W) -> Result<(), ImageError> {
    ensure_save_preconditions(machine)?;
    machine.collect_garbage()?;
    if !machine.memory.in_lower_semispace() {
        machine.collect_garbage()?;
    }
    if !machine.memory.in_lower_semispace() {
        return Err(ImageError::Corrupt("live data did not settle in the lower semispace"));
    }

    let size = machine.memory.used_bytes();
    write_u32(writer, MAGIC1)?;
    write_u32(writer, MAGIC2)?;
    write_u32(writer, MAJOR_VERSION)?;
    write_u32(writer, MINOR_VERSION)?;
    write_u32(writer, 0)?;
    write_u32(writer, to_u32(size)?)?;

    let mut roots = Vec::new();
    machine.registers.visit_named(&mut |value| roots.push(value.encode()));
    write_u32(writer, to_u32(roots.len())?)?;
    for word in roots {
        write_u32(writer, word)?;
    }
    write_u32(writer, to_u32(machine.ip)?)?;
    write_u32(writer, to_u32(machine.sp)?)?;

    writer.write_all(machine.memory.live_region())?;
    Ok(())
}

pub fn read_image<R: Read>(reader: &mut R, settings: MemorySettings) -> Result<Machine, ImageError> {
    if read_u32(reader)? != MAGIC1 || read_u32(reader)? != MAGIC2 {
        return Err(ImageError::BadMagic);
    }
    let major = read_u32(reader)?;
    if major != MAJOR_VERSION {
        return Err(ImageError::WrongVersion {
            found: major,
            expected: MAJOR_VERSION,
        });
    }
    let minor = read_u32(reader)?;
    if minor != MINOR_VERSION {
        log::debug!("image minor version {minor}, expected {MINOR_VERSION}");
    }

    let start = read_u32(reader)? as usize;
    let size = read_u32(reader)? as usize;
    if start != 0 {
        return Err(ImageError::Corrupt("arena does not start at offset 0"));
    }
    if size > settings.semispace_size {
        return Err(ImageError::TooLarge {
            size,
            capacity: settings.semispace_size,
        });
    }

    let mut machine = Machine::new(settings).map_err(ImageError::Settings)?;
    let count = read_u32(reader)? as usize;
    if count != machine.registers.named_count() {
        return Err(ImageError::Corrupt("register count does not match"));
    }
    let mut roots = Vec::with_capacity(count);
    for _ in 0..count {
        roots.push(Value::decode(read_u32(reader)?));
    }
    let ip = read_u32(reader)? as usize;
    let sp = read_u32(reader)? as usize;

    let mut arena = vec![0; size];
    reader.read_exact(&mut arena)?;
    machine.memory.load_region(&arena)?;

    let mut next = roots.into_iter();
    machine.registers.visit_named(&mut |slot| {
        if let Some(value) = next.next() {
            *slot = value;
        }
    });
    machine.ip = ip;
    machine.sp = sp;

    verify_heap(&mut machine)?;
    Ok(machine)
}

/// Checks that objects tile the arena and that every reference, from a
/// register or an object, lands on an object header.
fn verify_heap(machine: &mut Machine) -> Result<(), ImageError> {
    let size = machine.memory.used_bytes();
    if size % ALIGN != 0 {
        return Err(ImageError::Corrupt("arena size is not word aligned"));
    }
    let mut starts = HashSet::new();
    let mut offset = 0;
    while offset < size {
        if offset + HEADER_BYTES > size {
            return Err(ImageError::Corrupt("truncated object header"));
        }
        let extent = machine.memory.extent_at(offset);
        if extent < HEADER_BYTES || offset + extent > size {
            return Err(ImageError::Corrupt("object extends past the arena"));
        }
        starts.insert(offset);
        offset += extent;
    }

    let check = |value: Value| match value.as_address() {
        Some(address) if !starts.contains(&address.offset()) => {
            Err(ImageError::Corrupt("reference to a non-object"))
        }
        _ => Ok(()),
    };

    let mut registers = Vec::new();
    machine.registers.visit_named(&mut |value| registers.push(*value));
    registers.into_iter().try_for_each(check)?;

    for object in machine.memory.objects() {
        check(machine.memory.class_of_object(object)?)?;
        if machine.memory.kind(object)? == ObjectKind::Pointers {
            for i in 0..machine.memory.size(object)? {
                check(machine.memory.get_ptr(object, i)?)?;
            }
        }
    }
    Ok(())
}

fn to_u32(n: usize) -> Result<u32, ImageError> {
    u32::try_from(n).map_err(|_| ImageError::Corrupt("value does not fit the header"))
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::bootstrap;
    use crate::interpreter::Completion;

    fn machine() -> Machine {
        bootstrap(MemorySettings::default()).unwrap()
    }

    fn eval(m: &mut Machine, source: &str) -> Value {
        match m.evaluate(source).unwrap() {
            Completion::Returned(v) => v,
            Completion::ShutDown => panic!("shutdown"),
        }
    }

    #[test]
    fn test_round_trip_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.img");
        let mut m = machine();
        eval(&mut m, "Smalltalk at: #Answer put: 42");
        save_image(&mut m, &path).unwrap();
        assert!(m.memory.in_lower_semispace());

        let mut loaded = load_image(&path, MemorySettings::default()).unwrap();
        assert_eq!(loaded.memory.used_bytes(), m.memory.used_bytes());
        assert_eq!(eval(&mut loaded, "(Smalltalk at: #Answer) + 1"), Value::SmallInt(43));
        assert_eq!(eval(&mut loaded, "3 factorial"), Value::SmallInt(6));
    }

    #[test]
    fn test_save_from_upper_semispace() {
        let mut m = machine();
        m.collect_garbage().unwrap();
        assert!(!m.memory.in_lower_semispace());
        let mut bytes = Vec::new();
        write_image(&mut m, &mut bytes).unwrap();
        assert!(m.memory.in_lower_semispace());
        let mut loaded = read_image(&mut bytes.as_slice(), MemorySettings::default()).unwrap();
        assert_eq!(eval(&mut loaded, "#(1 2 3) size"), Value::SmallInt(3));
    }

    #[test]
    fn test_header_layout() {
        let mut m = machine();
        let mut bytes = Vec::new();
        write_image(&mut m, &mut bytes).unwrap();
        let word = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(word(0), MAGIC1);
        assert_eq!(word(1), MAGIC2);
        assert_eq!(word(2), MAJOR_VERSION);
        assert_eq!(word(3), MINOR_VERSION);
        assert_eq!(word(4), 0);
        assert_eq!(word(5) as usize, m.memory.used_bytes());
        let registers = word(6) as usize;
        assert_eq!(registers, m.registers.named_count());
        assert_eq!(bytes.len(), (7 + registers + 2) * 4 + m.memory.used_bytes());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut m = machine();
        let mut bytes = Vec::new();
        write_image(&mut m, &mut bytes).unwrap();
        bytes[0] ^= 0xFF;
        let err = read_image(&mut bytes.as_slice(), MemorySettings::default()).unwrap_err();
        assert!(matches!(err, ImageError::BadMagic), "{err}");
    }

    #[test]
    fn test_version_checks() {
        let mut m = machine();
        let mut bytes = Vec::new();
        write_image(&mut m, &mut bytes).unwrap();

        let mut minor = bytes.clone();
        minor[12..16].copy_from_slice(&99u32.to_le_bytes());
        assert!(read_image(&mut minor.as_slice(), MemorySettings::default()).is_ok());

        bytes[8..12].copy_from_slice(&7u32.to_le_bytes());
        let err = read_image(&mut bytes.as_slice(), MemorySettings::default()).unwrap_err();
        assert!(matches!(err, ImageError::WrongVersion { found: 7, .. }), "{err}");
    }

    #[test]
    fn test_rejects_image_larger_than_semispace() {
        let mut m = machine();
        let mut bytes = Vec::new();
        write_image(&mut m, &mut bytes).unwrap();
        let small = MemorySettings {
            semispace_size: 4096,
            ..MemorySettings::default()
        };
        let err = read_image(&mut bytes.as_slice(), small).unwrap_err();
        assert!(matches!(err, ImageError::TooLarge { .. }), "{err}");
    }

    #[test]
    fn test_truncated_image() {
        let mut m = machine();
        let mut bytes = Vec::new();
        write_image(&mut m, &mut bytes).unwrap();
        bytes.truncate(bytes.len() - 10);
        let err = read_image(&mut bytes.as_slice(), MemorySettings::default()).unwrap_err();
        assert!(matches!(err, ImageError::Io(_)), "{err}");
    }

    #[test]
    fn test_refuses_to_save_with_held_values() {
        let mut m = machine();
        let nil = m.nil();
        m.registers.scratch.push(nil);
        let mut bytes = Vec::new();
        assert!(matches!(write_image(&mut m, &mut bytes), Err(ImageError::Busy(_))));
    }
}
