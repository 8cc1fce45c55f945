//! JVM opcodes modeled by the runtime and the operand-shape table both
//! execution engines use to step over instructions.
use crate::error::{Error, Result};
use crate::reader::ByteReader;

macro_rules! opcodes {
    ($($name:ident = $code:literal,)*) => {
        /// Opcodes understood by the interpreter and the JIT builder.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum OPCode {
            $($name = $code,)*
        }

        impl TryFrom<u8> for OPCode {
            type Error = u8;

            fn try_from(byte: u8) -> std::result::Result<Self, u8> {
                match byte {
                    $($code => Ok(Self::$name),)*
                    other => Err(other),
                }
            }
        }
    };
}

opcodes! {
    NOP = 0x00,
    IconstM1 = 0x02,
    Iconst0 = 0x03,
    Iconst1 = 0x04,
    Iconst2 = 0x05,
    Iconst3 = 0x06,
    Iconst4 = 0x07,
    Iconst5 = 0x08,
    Lconst0 = 0x09,
    Lconst1 = 0x0a,
    BiPush = 0x10,
    SiPush = 0x11,
    Ldc = 0x12,
    LdcW = 0x13,
    Ldc2W = 0x14,
    ILoad = 0x15,
    LLoad = 0x16,
    ALoad = 0x19,
    ILoad0 = 0x1a,
    ILoad1 = 0x1b,
    ILoad2 = 0x1c,
    ILoad3 = 0x1d,
    LLoad0 = 0x1e,
    LLoad1 = 0x1f,
    LLoad2 = 0x20,
    LLoad3 = 0x21,
    ALoad0 = 0x2a,
    ALoad1 = 0x2b,
    ALoad2 = 0x2c,
    ALoad3 = 0x2d,
    IALoad = 0x2e,
    LALoad = 0x2f,
    BALoad = 0x33,
    CALoad = 0x34,
    SALoad = 0x35,
    IStore = 0x36,
    LStore = 0x37,
    AStore = 0x3a,
    IStore0 = 0x3b,
    IStore1 = 0x3c,
    IStore2 = 0x3d,
    IStore3 = 0x3e,
    LStore0 = 0x3f,
    LStore1 = 0x40,
    LStore2 = 0x41,
    LStore3 = 0x42,
    AStore0 = 0x4b,
    AStore1 = 0x4c,
    AStore2 = 0x4d,
    AStore3 = 0x4e,
    IAStore = 0x4f,
    LAStore = 0x50,
    BAStore = 0x54,
    CAStore = 0x55,
    SAStore = 0x56,
    Pop = 0x57,
    Dup = 0x59,
    Swap = 0x5f,
    IAdd = 0x60,
    LAdd = 0x61,
    ISub = 0x64,
    LSub = 0x65,
    IMul = 0x68,
    LMul = 0x69,
    IDiv = 0x6c,
    LDiv = 0x6d,
    IRem = 0x70,
    LRem = 0x71,
    INeg = 0x74,
    LNeg = 0x75,
    IShl = 0x78,
    LShl = 0x79,
    IShr = 0x7a,
    LShr = 0x7b,
    IUShr = 0x7c,
    LUShr = 0x7d,
    IAnd = 0x7e,
    LAnd = 0x7f,
    IOr = 0x80,
    LOr = 0x81,
    IXor = 0x82,
    LXor = 0x83,
    IInc = 0x84,
    I2L = 0x85,
    L2I = 0x88,
    I2B = 0x91,
    I2C = 0x92,
    I2S = 0x93,
    LCmp = 0x94,
    IfEq = 0x99,
    IfNe = 0x9a,
    IfLt = 0x9b,
    IfGe = 0x9c,
    IfGt = 0x9d,
    IfLe = 0x9e,
    IfICmpEq = 0x9f,
    IfICmpNe = 0xa0,
    IfICmpLt = 0xa1,
    IfICmpGe = 0xa2,
    IfICmpGt = 0xa3,
    IfICmpLe = 0xa4,
    Goto = 0xa7,
    IReturn = 0xac,
    LReturn = 0xad,
    AReturn = 0xb0,
    Return = 0xb1,
    GetStatic = 0xb2,
    InvokeVirtual = 0xb6,
    InvokeSpecial = 0xb7,
    InvokeStatic = 0xb8,
    New = 0xbb,
    NewArray = 0xbc,
    ArrayLength = 0xbe,
}

impl OPCode {
    /// Local index encoded in the opcode itself (`iload_2`, `astore_0`...).
    pub fn implicit_local(self) -> Option<u16> {
        let code = self as u8;
        let base = match self {
            Self::ILoad0 | Self::ILoad1 | Self::ILoad2 | Self::ILoad3 => Self::ILoad0,
            Self::LLoad0 | Self::LLoad1 | Self::LLoad2 | Self::LLoad3 => Self::LLoad0,
            Self::ALoad0 | Self::ALoad1 | Self::ALoad2 | Self::ALoad3 => Self::ALoad0,
            Self::IStore0 | Self::IStore1 | Self::IStore2 | Self::IStore3 => Self::IStore0,
            Self::LStore0 | Self::LStore1 | Self::LStore2 | Self::LStore3 => Self::LStore0,
            Self::AStore0 | Self::AStore1 | Self::AStore2 | Self::AStore3 => Self::AStore0,
            _ => return None,
        };
        Some((code - base as u8) as u16)
    }

    /// Constant pushed by the `iconst_<n>` and `lconst_<n>` family.
    pub fn implicit_constant(self) -> Option<i64> {
        match self {
            Self::IconstM1 => Some(-1),
            Self::Iconst0
            | Self::Iconst1
            | Self::Iconst2
            | Self::Iconst3
            | Self::Iconst4
            | Self::Iconst5 => Some((self as u8 - Self::Iconst0 as u8) as i64),
            Self::Lconst0 => Some(0),
            Self::Lconst1 => Some(1),
            _ => None,
        }
    }

    /// Binary integer operation performed by the arithmetic opcodes, `int`
    /// and `long` forms share one 64-bit implementation.
    pub fn binary_op(self) -> Option<BinaryOp> {
        let op = match self {
            Self::IAdd | Self::LAdd => BinaryOp::Add,
            Self::ISub | Self::LSub => BinaryOp::Sub,
            Self::IMul | Self::LMul => BinaryOp::Mul,
            Self::IDiv | Self::LDiv => BinaryOp::Div,
            Self::IRem | Self::LRem => BinaryOp::Rem,
            Self::IShl | Self::LShl => BinaryOp::Shl,
            Self::IShr | Self::LShr => BinaryOp::Shr,
            Self::IUShr | Self::LUShr => BinaryOp::UShr,
            Self::IAnd | Self::LAnd => BinaryOp::And,
            Self::IOr | Self::LOr => BinaryOp::Or,
            Self::IXor | Self::LXor => BinaryOp::Xor,
            _ => return None,
        };
        Some(op)
    }

    /// Comparison performed by the conditional branches. The boolean tells
    /// whether the opcode compares two stack values or one against zero.
    pub fn condition(self) -> Option<(Condition, bool)> {
        let cond = match self {
            Self::IfEq => (Condition::Eq, false),
            Self::IfNe => (Condition::Ne, false),
            Self::IfLt => (Condition::Lt, false),
            Self::IfGe => (Condition::Ge, false),
            Self::IfGt => (Condition::Gt, false),
            Self::IfLe => (Condition::Le, false),
            Self::IfICmpEq => (Condition::Eq, true),
            Self::IfICmpNe => (Condition::Ne, true),
            Self::IfICmpLt => (Condition::Lt, true),
            Self::IfICmpGe => (Condition::Ge, true),
            Self::IfICmpGt => (Condition::Gt, true),
            Self::IfICmpLe => (Condition::Le, true),
            _ => return None,
        };
        Some(cond)
    }
}

/// Integer operations shared by both engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    UShr,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    /// Apply the operation with 64-bit two's-complement semantics.
    /// Division and remainder by zero return `None`.
    pub fn apply(self, lhs: i64, rhs: i64) -> Option<i64> {
        let value = match self {
            Self::Add => lhs.wrapping_add(rhs),
            Self::Sub => lhs.wrapping_sub(rhs),
            Self::Mul => lhs.wrapping_mul(rhs),
            Self::Div => {
                return lhs
                    .checked_div(rhs)
                    .or_else(|| nonzero_wrap(lhs, rhs, i64::wrapping_div))
            }
            Self::Rem => {
                return lhs
                    .checked_rem(rhs)
                    .or_else(|| nonzero_wrap(lhs, rhs, i64::wrapping_rem))
            }
            Self::Shl => lhs.wrapping_shl(rhs as u32),
            Self::Shr => lhs.wrapping_shr(rhs as u32),
            Self::UShr => (lhs as u64).wrapping_shr(rhs as u32) as i64,
            Self::And => lhs & rhs,
            Self::Or => lhs | rhs,
            Self::Xor => lhs ^ rhs,
        };
        Some(value)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Rem => "rem",
            Self::Shl => "shl",
            Self::Shr => "shr",
            Self::UShr => "ushr",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
        }
    }
}

// `i64::MIN / -1` overflows rather than trapping; only a zero divisor fails.
fn nonzero_wrap(lhs: i64, rhs: i64, op: fn(i64, i64) -> i64) -> Option<i64> {
    (rhs != 0).then(|| op(lhs, rhs))
}

/// Signed comparison used by conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Condition {
    pub fn holds(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Lt => lhs < rhs,
            Self::Ge => lhs >= rhs,
            Self::Gt => lhs > rhs,
            Self::Le => lhs <= rhs,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Ge => "ge",
            Self::Gt => "gt",
            Self::Le => "le",
        }
    }
}

/// Shape of the operands that follow an opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    None,
    U8,
    /// `newarray` element type tag.
    TypeTag,
    U16,
    /// `iinc`: local index then signed increment.
    Increment,
    /// Signed 16-bit branch offset relative to the opcode.
    Branch,
    /// Signed 32-bit branch offset relative to the opcode.
    BranchWide,
    /// `multianewarray`: class index and dimension count.
    MultiArray,
    /// `invokeinterface` and `invokedynamic`.
    Invoke4,
    /// `tableswitch`, `lookupswitch` and `wide`, variable length.
    Variable,
    Invalid,
}

impl OperandShape {
    /// Number of operand bytes, `None` when it is not fixed.
    pub const fn width(self) -> Option<usize> {
        match self {
            Self::None => Some(0),
            Self::U8 | Self::TypeTag => Some(1),
            Self::U16 | Self::Increment | Self::Branch => Some(2),
            Self::MultiArray => Some(3),
            Self::BranchWide | Self::Invoke4 => Some(4),
            Self::Variable | Self::Invalid => None,
        }
    }

    /// Branch instructions produce labels: their targets start basic blocks.
    pub const fn is_label(self) -> bool {
        matches!(self, Self::Branch | Self::BranchWide)
    }
}

const fn build_shape_table() -> [OperandShape; 256] {
    let mut table = [OperandShape::None; 256];
    let mut op = 0xca;
    while op < 256 {
        table[op] = OperandShape::Invalid;
        op += 1;
    }

    table[0x10] = OperandShape::U8; // bipush
    table[0x11] = OperandShape::U16; // sipush
    table[0x12] = OperandShape::U8; // ldc
    table[0x13] = OperandShape::U16; // ldc_w
    table[0x14] = OperandShape::U16; // ldc2_w

    // loads and stores with an explicit local index
    let mut op = 0x15;
    while op <= 0x19 {
        table[op] = OperandShape::U8;
        table[op + 0x21] = OperandShape::U8;
        op += 1;
    }

    table[0x84] = OperandShape::Increment;

    let mut op = 0x99;
    while op <= 0xa8 {
        table[op] = OperandShape::Branch;
        op += 1;
    }
    table[0xa9] = OperandShape::U8; // ret
    table[0xaa] = OperandShape::Variable;
    table[0xab] = OperandShape::Variable;

    let mut op = 0xb2;
    while op <= 0xb8 {
        table[op] = OperandShape::U16;
        op += 1;
    }
    table[0xb9] = OperandShape::Invoke4;
    table[0xba] = OperandShape::Invoke4;
    table[0xbb] = OperandShape::U16; // new
    table[0xbc] = OperandShape::TypeTag;
    table[0xbd] = OperandShape::U16; // anewarray
    table[0xc0] = OperandShape::U16; // checkcast
    table[0xc1] = OperandShape::U16; // instanceof
    table[0xc4] = OperandShape::Variable; // wide
    table[0xc5] = OperandShape::MultiArray;
    table[0xc6] = OperandShape::Branch;
    table[0xc7] = OperandShape::Branch;
    table[0xc8] = OperandShape::BranchWide;
    table[0xc9] = OperandShape::BranchWide;
    table
}

/// Operand shape for every opcode value.
pub static OPERAND_SHAPES: [OperandShape; 256] = build_shape_table();

pub fn operand_shape(opcode: u8) -> OperandShape {
    OPERAND_SHAPES[opcode as usize]
}

/// A decoded instruction header as seen by a shape-only scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub offset: usize,
    pub opcode: u8,
    pub shape: OperandShape,
    /// Absolute branch target, for label-producing instructions.
    pub target: Option<usize>,
    /// Offset of the next instruction.
    pub next: usize,
}

/// Decode the instruction at the reader's position without interpreting it,
/// leaving the reader on the following instruction.
pub fn step(reader: &mut ByteReader, method: &str) -> Result<Step> {
    let offset = reader.position();
    let opcode = reader.read_u8()?;
    let shape = operand_shape(opcode);
    let unsupported = || Error::UnsupportedOpcode {
        opcode,
        offset,
        method: method.to_string(),
    };
    let target = match shape {
        OperandShape::Branch => {
            let delta = reader.read_i16()? as i64;
            Some(relative(offset, delta).ok_or_else(unsupported)?)
        }
        OperandShape::BranchWide => {
            let delta = reader.read_u32()? as i32 as i64;
            Some(relative(offset, delta).ok_or_else(unsupported)?)
        }
        _ => {
            let width = shape.width().ok_or_else(unsupported)?;
            reader.read_bytes(width)?;
            None
        }
    };
    Ok(Step {
        offset,
        opcode,
        shape,
        target,
        next: reader.position(),
    })
}

/// Resolve a relative branch offset. `None` when the target would be
/// before the start of the method.
pub fn relative(offset: usize, delta: i64) -> Option<usize> {
    usize::try_from(offset as i64 + delta).ok()
}
