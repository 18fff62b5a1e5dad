//! Field indices of objects the machine looks inside.

pub mod link {
    pub const KEY: usize = 0;
    pub const VALUE: usize = 1;
    pub const NEXT: usize = 2;
    pub const SIZE: usize = 3;
}

pub mod dictionary {
    pub const HASH_TABLE: usize = 0;
    pub const SIZE: usize = 1;
    /// Buckets of a freshly created method dictionary.
    pub const BUCKETS: usize = 7;
    /// Buckets of the Smalltalk system dictionary (globals and symbols).
    pub const SYSTEM_BUCKETS: usize = 97;
}

/// Shared by classes and metaclasses.
pub mod behavior {
    pub const NAME: usize = 0;
    pub const INST_TYPE: usize = 1;
    pub const INST_SIZE: usize = 2;
    pub const METHODS: usize = 3;
    pub const SUPERCLASS: usize = 4;
    pub const VARIABLES: usize = 5;
    pub const SIZE: usize = 6;

    pub const IS_VARIABLE: i32 = 0x04;
    pub const IS_POINTERS: i32 = 0x02;
    pub const IS_WORDS: i32 = 0x01;
}

pub mod context {
    pub const CALLER: usize = 0;
    pub const IP: usize = 1;
    pub const STACK: usize = 2;
    pub const SP: usize = 3;
}

pub mod method_context {
    pub const METHOD: usize = 4;
    pub const RECEIVER: usize = 5;
    pub const ARGS: usize = 6;
    pub const TEMPS: usize = 7;
    pub const STATE: usize = 8;
    pub const SIZE: usize = 9;
}

pub mod block_context {
    pub const ARG_COUNT: usize = 4;
    pub const IP_START: usize = 5;
    pub const HOME: usize = 6;
    pub const SIZE: usize = 7;
}

pub mod method {
    pub const TEXT: usize = 0;
    pub const SELECTOR: usize = 1;
    pub const CODE: usize = 2;
    pub const LITERALS: usize = 3;
    pub const ARG_SIZE: usize = 4;
    pub const TEMP_SIZE: usize = 5;
    pub const STACK_SIZE: usize = 6;
    pub const CLASS: usize = 7;
    pub const SIZE: usize = 8;
}

pub mod float {
    pub const SIZE: usize = 8;
}

pub mod character {
    pub const SIZE: usize = 1;
    pub const COUNT: usize = 256;
}
