//! A small Smalltalk: tagged 32-bit object memory with a semispace
//! collector, heap-allocated contexts and a bytecode interpreter.

pub mod bootstrap;
pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod filein;
pub mod gc;
pub mod image;
pub mod interpreter;
pub mod layout;
pub mod memory;
pub mod objects;
pub mod primitives;
pub mod registers;
pub mod value;

pub use bootstrap::{KERNEL, bootstrap};
pub use error::{BootstrapError, CompileError, EvalError, FileInError, ImageError, VmError};
pub use filein::file_in;
pub use image::{load_image, save_image};
pub use interpreter::{Completion, Machine};
pub use memory::MemorySettings;
pub use value::Value;
