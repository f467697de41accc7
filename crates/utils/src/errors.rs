use thiserror::Error;

/// Errors raised while parsing raw class bytes into the structural model.
///
/// Every variant is terminal for the current artifact; the decoder never
/// guesses past malformed input.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected end of class file at offset {0}")]
    UnexpectedEof(usize),

    #[error("bad magic 0x{0:08x}, expected 0xcafebabe")]
    BadMagic(u32),

    #[error("unsupported class file version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("unrecognized constant pool tag {tag} at entry {index}")]
    BadConstantTag { tag: u8, index: u16 },

    #[error("constant pool index {index} out of range in {context}")]
    IndexOutOfRange { index: u16, context: &'static str },

    #[error("constant pool entry {index} has the wrong tag for {context}")]
    TagMismatch { index: u16, context: &'static str },

    #[error("malformed modified UTF-8 in constant pool entry {0}")]
    BadUtf8(u16),

    #[error("unrecognized opcode 0x{opcode:02x} at code offset {offset}")]
    BadOpcode { opcode: u8, offset: usize },

    #[error("branch at code offset {offset} targets invalid offset {target}")]
    BadBranchTarget { offset: usize, target: i64 },

    #[error("{0} bytes of trailing garbage after class structure")]
    TrailingBytes(usize),
}

/// Errors raised by a mutator that cannot uphold its contract.
///
/// Mutators skip unsupported method shapes instead of raising; these
/// variants cover genuinely broken preconditions.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("method uses every local slot, no room for a synthetic slot")]
    NoFreeLocalSlot,

    #[error("could not allocate a collision-free synthetic member name")]
    NameCollision,

    #[error("helper injection failed: {0}")]
    HelperInjection(String),
}

/// Errors raised while serializing a model back to class bytes.
///
/// These indicate either a format limit overflow or an internal-consistency
/// failure introduced by a prior stage, and are always fatal.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("constant pool would need {0} slots, limit is 65535")]
    PoolOverflow(usize),

    #[error("method {method} code is {len} bytes, limit is 65535")]
    CodeOverflow { method: String, len: usize },

    #[error("{context} offset {value} does not fit in 16 bits")]
    OffsetOverflow { context: &'static str, value: usize },

    #[error("label {0} referenced but never defined")]
    UnresolvedLabel(u32),

    #[error("label {0} defined more than once")]
    DuplicateLabel(u32),

    #[error("constant pool index {index} dangles in {context}")]
    DanglingIndex { index: u16, context: &'static str },

    #[error("constant pool index {index} has the wrong tag for {context}")]
    TagMismatch { index: u16, context: &'static str },

    #[error("operand stack underflow at instruction {at} in method {method}")]
    StackUnderflow { method: String, at: usize },

    #[error("operand stack exceeds 65535 entries in method {0}")]
    StackOverflow(String),

    #[error("inconsistent frame merge at instruction {at} in method {method}: {msg}")]
    FrameMerge {
        method: String,
        at: usize,
        msg: String,
    },

    #[error("unreachable code at instruction {at} in method {method}")]
    UnreachableCode { method: String, at: usize },

    #[error("malformed descriptor `{0}`")]
    BadDescriptor(String),
}

/// Errors raised by registry lookups.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no mutator registered for kind `{0}`")]
    NotFound(String),
}

/// Umbrella error for the obfuscation facade.
#[derive(Debug, Error)]
pub enum ObfuscateError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("mutation error: {0}")]
    Mutation(#[from] MutationError),

    #[error("writer error: {0}")]
    Writer(#[from] WriterError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
