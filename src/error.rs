//! Error type shared by the class reader and both execution engines.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// `Error` represents every failure the runtime can report, from a
/// truncated class file up to a division by zero inside a running method.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed class file: bad magic 0x{magic:08x}")]
    MalformedClassFile { magic: u32 },

    #[error("unexpected end of input at offset {offset} (wanted {wanted} bytes)")]
    UnexpectedEndOfInput { offset: usize, wanted: usize },

    #[error("unknown constant pool tag {tag} at index {index}")]
    UnknownConstantTag { tag: u8, index: u16 },

    #[error("invalid constant pool index {index}")]
    InvalidConstantIndex { index: u16 },

    #[error("constant pool entry {index} is not a {expected}")]
    UnexpectedConstant { index: u16, expected: &'static str },

    #[error("constant pool entry {index} is not valid utf-8")]
    InvalidUtf8 { index: u16 },

    #[error("invalid descriptor `{descriptor}`: {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },

    #[error("unsupported type tag `{tag}`")]
    UnsupportedType { tag: char },

    #[error("method {class}.{name} not found")]
    MethodNotFound { class: String, name: String },

    #[error("method {method} has no Code attribute")]
    MissingCode { method: String },

    #[error("unsupported opcode 0x{opcode:02x} at offset {offset} in {method}")]
    UnsupportedOpcode {
        opcode: u8,
        offset: usize,
        method: String,
    },

    #[error("return at offset {offset} does not match the return type of {method}")]
    ReturnMismatch { offset: usize, method: String },

    #[error("arithmetic error: {reason} at offset {offset}")]
    ArithmeticError { reason: &'static str, offset: usize },

    #[error("operand stack overflow (max_stack = {max})")]
    StackOverflow { max: usize },

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("local variable {index} out of range (max_locals = {max})")]
    LocalOutOfRange { index: usize, max: usize },

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("array index {index} out of bounds for length {length}")]
    ArrayIndexOutOfBounds { index: i64, length: usize },

    #[error("negative array size {length}")]
    NegativeArraySize { length: i64 },

    #[error("unsupported array type tag {tag}")]
    UnsupportedArrayType { tag: u8 },

    #[error("constant pool entry {index} cannot be loaded")]
    UnsupportedConstant { index: u16 },

    #[error("cannot print a {kind} value")]
    Unprintable { kind: &'static str },

    #[error("block boundary at offset {offset} registered twice")]
    DuplicateBlockBoundary { offset: usize },

    #[error("stack depth at offset {offset} is {found}, block expects {expected}")]
    InconsistentStackDepth {
        offset: usize,
        expected: usize,
        found: usize,
    },

    #[error("basic block at offset {offset} already has a terminator")]
    BlockAlreadySealed { offset: usize },

    #[error("control falls off the end of {method}")]
    UnterminatedBlock { method: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
