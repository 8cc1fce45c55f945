//! JIT front end translating method bytecode into a graph of basic blocks.
//!
//! Translation is done per method in two passes over the bytecode:
//!
//! 1. Block discovery only looks at operand widths: every branch target,
//!    every conditional fallthrough and every instruction following a
//!    terminator starts a block.
//! 2. Emission re-walks the bytecode and translates each opcode into reads
//!    and writes of slot cells, switching the insertion block whenever the
//!    walk reaches a registered boundary.
//!
//! Values are not renamed into SSA registers. Each operand stack depth and
//! each local index owns one cell in each of two lanes, integer and
//! reference, and the lane is picked statically from the opcode. A value
//! flowing into a block from several predecessors is read from the same
//! cell whichever predecessor ran, so every edge into a block must carry
//! the same operand stack depth; the builder checks this and rejects
//! methods that break it.
//!
//! The resulting [`Function`] is handed to a
//! [`CodeGenerator`](crate::executor::CodeGenerator).
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

use log::{debug, trace};

use crate::backend::{Backend, Constant, Invoke};
use crate::bytecode::{self, BinaryOp, Condition, OPCode};
use crate::error::{Error, Result};
use crate::jvm::{ClassFile, Code, Method};
use crate::reader::ByteReader;
use crate::types::{ArrayType, TypeDescriptor};

/// Static partition of slot cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// bool, byte, char, short, int and long, as a 64-bit cell.
    Int,
    /// Strings and arrays.
    Ref,
}

impl Lane {
    fn of(descriptor: &TypeDescriptor) -> Self {
        if descriptor.is_reference() {
            Self::Ref
        } else {
            Self::Int
        }
    }
}

/// A storage cell of the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Operand stack cell at the given depth.
    Stack(u16),
    /// Local variable cell.
    Local(u16),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Stack(depth) => write!(f, "s{depth}"),
            Self::Local(index) => write!(f, "l{index}"),
        }
    }
}

/// A cell qualified by its lane, rendered as `i:s0` or `r:l1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cell {
    pub lane: Lane,
    pub slot: Slot,
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let lane = match self.lane {
            Lane::Int => 'i',
            Lane::Ref => 'r',
        };
        write!(f, "{lane}:{}", self.slot)
    }
}

/// Index of a block in its [`ControlFlowMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Right-hand side of a branch comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Slot(Slot),
    Imm(i64),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Slot(slot) => write!(f, "{slot}"),
            Self::Imm(value) => write!(f, "{value}"),
        }
    }
}

/// An argument moved from the caller's stack into a callee local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argument {
    pub lane: Lane,
    pub src: Slot,
    pub local: u16,
}

/// Low-level instruction over slot cells. Integer operands always live in
/// the integer lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Const {
        dst: Slot,
        value: i64,
    },
    /// Load a string constant into a reference cell.
    Str {
        dst: Slot,
        bytes: Vec<u8>,
    },
    Move {
        lane: Lane,
        dst: Slot,
        src: Slot,
    },
    /// Exchange two stack cells, each with its own lane.
    Swap {
        lower: Cell,
        upper: Cell,
    },
    /// `offset` is the originating bytecode offset, reported when a
    /// division faults.
    Binary {
        op: BinaryOp,
        dst: Slot,
        lhs: Slot,
        rhs: Slot,
        offset: usize,
    },
    Neg {
        dst: Slot,
        src: Slot,
    },
    /// Truncate to `width` and sign or zero extend back.
    Narrow {
        dst: Slot,
        src: Slot,
        width: ArrayType,
    },
    /// Three-way signed comparison producing -1, 0 or 1.
    Compare {
        dst: Slot,
        lhs: Slot,
        rhs: Slot,
    },
    Increment {
        local: u16,
        delta: i64,
    },
    /// Allocate `length × element size` bytes; `dst` is a reference cell.
    NewArray {
        dst: Slot,
        length: Slot,
        element: ArrayType,
    },
    ArrayLength {
        dst: Slot,
        array: Slot,
    },
    ArrayLoad {
        dst: Slot,
        array: Slot,
        index: Slot,
    },
    ArrayStore {
        array: Slot,
        index: Slot,
        value: Slot,
    },
    /// Call the method with the given id in the same class.
    Call {
        method: usize,
        arguments: Vec<Argument>,
        ret: Option<Cell>,
    },
    /// The `System.out.println` intrinsic.
    Print {
        value: Option<Cell>,
    },
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Const { dst, value } => write!(f, "{dst} = const {value}"),
            Self::Str { dst, bytes } => {
                write!(f, "{dst} = str {:?}", String::from_utf8_lossy(bytes))
            }
            Self::Move { lane, dst, src } => write!(
                f,
                "{} = move {}",
                Cell { lane: *lane, slot: *dst },
                Cell { lane: *lane, slot: *src }
            ),
            Self::Swap { lower, upper } => write!(f, "swap {lower}, {upper}"),
            Self::Binary {
                op, dst, lhs, rhs, ..
            } => write!(f, "{dst} = {} {lhs}, {rhs}", op.mnemonic()),
            Self::Neg { dst, src } => write!(f, "{dst} = neg {src}"),
            Self::Narrow { dst, src, width } => write!(f, "{dst} = narrow.{width} {src}"),
            Self::Compare { dst, lhs, rhs } => write!(f, "{dst} = cmp {lhs}, {rhs}"),
            Self::Increment { local, delta } => write!(f, "l{local} += {delta}"),
            Self::NewArray {
                dst,
                length,
                element,
            } => write!(f, "{dst} = newarray.{element} {length}"),
            Self::ArrayLength { dst, array } => write!(f, "{dst} = arraylength {array}"),
            Self::ArrayLoad { dst, array, index } => write!(f, "{dst} = {array}[{index}]"),
            Self::ArrayStore {
                array,
                index,
                value,
            } => write!(f, "{array}[{index}] = {value}"),
            Self::Call {
                method,
                arguments,
                ret,
            } => {
                if let Some(ret) = ret {
                    write!(f, "{ret} = ")?;
                }
                write!(f, "call #{method}(")?;
                for (i, argument) in arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    let src = Cell {
                        lane: argument.lane,
                        slot: argument.src,
                    };
                    write!(f, "l{} <- {src}", argument.local)?;
                }
                write!(f, ")")
            }
            Self::Print { value: Some(value) } => write!(f, "println {value}"),
            Self::Print { value: None } => write!(f, "println"),
        }
    }
}

/// Block terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Jump(BlockId),
    Branch {
        condition: Condition,
        lhs: Slot,
        rhs: Operand,
        taken: BlockId,
        fallthrough: BlockId,
    },
    Return(Option<Cell>),
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Jump(target) => write!(f, "jump {target}"),
            Self::Branch {
                condition,
                lhs,
                rhs,
                taken,
                fallthrough,
            } => write!(
                f,
                "br.{} {lhs}, {rhs} ? {taken} : {fallthrough}",
                condition.mnemonic()
            ),
            Self::Return(Some(value)) => write!(f, "return {value}"),
            Self::Return(None) => write!(f, "return"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Still receiving instructions.
    Unsealed,
    /// Terminator present, no further instructions accepted.
    Sealed,
}

/// What the builder knows about an operand stack entry. Placeholders
/// reserve a stack position but own no storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Int,
    Ref,
    /// `System.out`, consumed by the println intrinsic.
    SystemOut,
    /// Any other static field or a `new` object.
    Placeholder,
}

impl Kind {
    fn cell(self, slot: Slot) -> Option<Cell> {
        match self {
            Self::Int => Some(Cell {
                lane: Lane::Int,
                slot,
            }),
            Self::Ref => Some(Cell {
                lane: Lane::Ref,
                slot,
            }),
            Self::SystemOut | Self::Placeholder => None,
        }
    }
}

/// Straight-line code starting at a bytecode offset.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub offset: usize,
    pub instructions: Vec<Instruction>,
    pub terminator: Option<Terminator>,
    entry: Option<Vec<Kind>>,
}

impl BasicBlock {
    fn new(offset: usize) -> Self {
        Self {
            offset,
            instructions: Vec::new(),
            terminator: None,
            entry: None,
        }
    }

    pub fn state(&self) -> BlockState {
        if self.terminator.is_some() {
            BlockState::Sealed
        } else {
            BlockState::Unsealed
        }
    }

    /// Operand stack depth on entry, once some edge reached the block.
    pub fn entry_depth(&self) -> Option<usize> {
        self.entry.as_ref().map(Vec::len)
    }

    pub fn push(&mut self, instruction: Instruction) -> Result<()> {
        if self.state() == BlockState::Sealed {
            return Err(Error::BlockAlreadySealed {
                offset: self.offset,
            });
        }
        trace!("  @{} {instruction}", self.offset);
        self.instructions.push(instruction);
        Ok(())
    }

    /// Install the terminator. A block is sealed exactly once.
    pub fn seal(&mut self, terminator: Terminator) -> Result<()> {
        if self.state() == BlockState::Sealed {
            return Err(Error::BlockAlreadySealed {
                offset: self.offset,
            });
        }
        trace!("  @{} {terminator}", self.offset);
        self.terminator = Some(terminator);
        Ok(())
    }
}

/// Bytecode offset to block table. Each offset maps to at most one block.
#[derive(Debug, Clone, Default)]
pub struct ControlFlowMap {
    offsets: BTreeMap<usize, BlockId>,
    blocks: Vec<BasicBlock>,
}

impl ControlFlowMap {
    /// Return the block starting at `offset`, creating it if needed.
    pub fn get_or_create(&mut self, offset: usize) -> BlockId {
        if let Some(id) = self.offsets.get(&offset) {
            return *id;
        }
        let id = BlockId(self.blocks.len());
        self.blocks.push(BasicBlock::new(offset));
        self.offsets.insert(offset, id);
        id
    }

    /// Register a new block, failing if one already starts at `offset`.
    pub fn insert(&mut self, offset: usize) -> Result<BlockId> {
        if self.offsets.contains_key(&offset) {
            return Err(Error::DuplicateBlockBoundary { offset });
        }
        Ok(self.get_or_create(offset))
    }

    pub fn block_at(&self, offset: usize) -> Option<BlockId> {
        self.offsets.get(&offset).copied()
    }

    pub fn get(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks in bytecode order.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        self.offsets.values().map(|id| (*id, &self.blocks[id.0]))
    }
}

impl Index<BlockId> for ControlFlowMap {
    type Output = BasicBlock;

    fn index(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0]
    }
}

impl IndexMut<BlockId> for ControlFlowMap {
    fn index_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0]
    }
}

/// Block graph of one method.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// Id of the method this was built from.
    pub method: usize,
    pub max_stack: u16,
    pub max_locals: u16,
    /// Lane and local of every parameter, in declaration order.
    pub parameters: Vec<(Lane, u16)>,
    pub ret: Option<Lane>,
    pub blocks: ControlFlowMap,
}

impl Function {
    /// The block at offset 0.
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    /// Ids of the methods called from this function.
    pub fn callees(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks
            .iter()
            .flat_map(|(_, block)| &block.instructions)
            .filter_map(|instruction| match instruction {
                Instruction::Call { method, .. } => Some(*method),
                _ => None,
            })
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "function {} #{} (max_stack={}, max_locals={})",
            self.name, self.method, self.max_stack, self.max_locals
        )?;
        for (id, block) in self.blocks.iter() {
            match block.entry_depth() {
                Some(depth) => writeln!(f, "{id} @{} depth={depth}:", block.offset)?,
                None => writeln!(f, "{id} @{}:", block.offset)?,
            }
            for instruction in &block.instructions {
                writeln!(f, "    {instruction}")?;
            }
            if let Some(terminator) = &block.terminator {
                writeln!(f, "    {terminator}")?;
            }
        }
        Ok(())
    }
}

/// Per-method translation state for pass 2.
struct FunctionBuilder<'a> {
    method: &'a Method,
    code: &'a Code,
    blocks: ControlFlowMap,
    current: BlockId,
    stack: Vec<Kind>,
}

impl<'a> FunctionBuilder<'a> {
    fn push(&mut self, kind: Kind) -> Result<Slot> {
        let depth = self.stack.len();
        if depth >= self.code.max_stack as usize {
            return Err(Error::StackOverflow {
                max: self.code.max_stack as usize,
            });
        }
        self.stack.push(kind);
        Ok(Slot::Stack(depth as u16))
    }

    fn pop(&mut self) -> Result<(Kind, Slot)> {
        let kind = self.stack.pop().ok_or(Error::StackUnderflow)?;
        Ok((kind, Slot::Stack(self.stack.len() as u16)))
    }

    fn pop_slot(&mut self) -> Result<Slot> {
        Ok(self.pop()?.1)
    }

    fn local(&self, index: u16) -> Result<Slot> {
        if index >= self.code.max_locals {
            return Err(Error::LocalOutOfRange {
                index: index as usize,
                max: self.code.max_locals as usize,
            });
        }
        Ok(Slot::Local(index))
    }

    fn emit(&mut self, instruction: Instruction) -> Result<()> {
        let current = self.current;
        self.blocks[current].push(instruction)
    }

    fn seal(&mut self, terminator: Terminator) -> Result<()> {
        let current = self.current;
        self.blocks[current].seal(terminator)
    }

    fn block_at(&self, offset: usize) -> Result<BlockId> {
        self.blocks
            .block_at(offset)
            .ok_or_else(|| Error::UnterminatedBlock {
                method: self.method.to_string(),
            })
    }

    /// Record or verify the operand stack depth on an edge into `target`.
    fn enter(&mut self, target: BlockId) -> Result<()> {
        let found = self.stack.len();
        let block = &mut self.blocks[target];
        match block.entry_depth() {
            None => block.entry = Some(self.stack.clone()),
            Some(expected) if expected != found => {
                return Err(Error::InconsistentStackDepth {
                    offset: block.offset,
                    expected,
                    found,
                })
            }
            Some(_) => (),
        }
        Ok(())
    }

    /// Make `target` the insertion block, sealing the current one with a
    /// fallthrough jump if it has no terminator yet. A block no edge has
    /// reached so far starts with an empty operand stack.
    fn switch_to(&mut self, target: BlockId) -> Result<()> {
        if self.blocks[self.current].state() == BlockState::Unsealed {
            self.enter(target)?;
            self.seal(Terminator::Jump(target))?;
        }
        self.current = target;
        let block = &mut self.blocks[target];
        self.stack = block.entry.get_or_insert_with(Vec::new).clone();
        Ok(())
    }
}

/// `JitCache` builds block graphs for the methods of one class and caches
/// them on the methods themselves.
pub struct JitCache<'a> {
    class: &'a ClassFile,
    in_progress: HashSet<usize>,
    registered: HashSet<usize>,
    functions: Vec<Arc<Function>>,
}

impl<'a> Backend<'a> for JitCache<'a> {
    fn class(&self) -> &'a ClassFile {
        self.class
    }
}

impl<'a> JitCache<'a> {
    pub fn new(class: &'a ClassFile) -> Self {
        Self {
            class,
            in_progress: HashSet::new(),
            registered: HashSet::new(),
            functions: Vec::new(),
        }
    }

    /// Every function reached through this cache, callees before their
    /// callers. Includes graphs memoized on the methods by an earlier cache.
    pub fn functions(&self) -> &[Arc<Function>] {
        &self.functions
    }

    /// Block graph of `method`, building it and every callee it reaches
    /// on first use.
    pub fn compile(&mut self, method: &'a Method) -> Result<Arc<Function>> {
        if let Some(function) = method.jit_function() {
            self.register(function);
            return Ok(function.clone());
        }
        debug!("compiling {}.{}", self.class.name, method);
        self.in_progress.insert(method.id);
        let built = self.build(method);
        self.in_progress.remove(&method.id);
        let function = method.cache_jit_function(Arc::new(built?));
        self.register(function);
        Ok(function.clone())
    }

    /// Record `function` and every already built callee it reaches.
    /// Callees still being built register themselves when they finish.
    fn register(&mut self, function: &'a Arc<Function>) {
        if !self.registered.insert(function.method) {
            return;
        }
        let class = self.class;
        for callee in function.callees() {
            if let Some(callee) = class.methods.get(callee).and_then(Method::jit_function) {
                self.register(callee);
            }
        }
        self.functions.push(function.clone());
    }

    fn build(&mut self, method: &'a Method) -> Result<Function> {
        let code = self.find_code(method)?;
        let parameters = method
            .parameters()
            .iter()
            .zip(method.parameter_slots())
            .map(|(parameter, local)| {
                if local >= code.max_locals {
                    return Err(Error::LocalOutOfRange {
                        index: local as usize,
                        max: code.max_locals as usize,
                    });
                }
                Ok((Lane::of(parameter), local))
            })
            .collect::<Result<Vec<_>>>()?;
        let ret = match method.return_type() {
            TypeDescriptor::Void => None,
            ret => Some(Lane::of(ret)),
        };

        let blocks = discover_blocks(method, code)?;
        debug!("{}: {} blocks", method, blocks.len());
        let mut builder = FunctionBuilder {
            method,
            code,
            blocks,
            current: BlockId(0),
            stack: Vec::new(),
        };
        builder.blocks[BlockId(0)].entry = Some(Vec::new());

        let mut reader = ByteReader::new(&code.bytecode);
        while reader.has_remaining() {
            let offset = reader.position();
            if let Some(id) = builder.blocks.block_at(offset) {
                if id != builder.current {
                    builder.switch_to(id)?;
                }
            }
            self.translate(&mut builder, &mut reader, offset)?;
        }

        if let Some((_, block)) = builder
            .blocks
            .iter()
            .find(|(_, block)| block.state() == BlockState::Unsealed)
        {
            debug!("{}: block @{} has no terminator", method, block.offset);
            return Err(Error::UnterminatedBlock {
                method: method.to_string(),
            });
        }

        Ok(Function {
            name: format!("{}.{}", self.class.name, method),
            method: method.id,
            max_stack: code.max_stack,
            max_locals: code.max_locals,
            parameters,
            ret,
            blocks: builder.blocks,
        })
    }

    /// Translate the instruction at `offset` into the current block.
    fn translate(
        &mut self,
        b: &mut FunctionBuilder<'a>,
        reader: &mut ByteReader,
        offset: usize,
    ) -> Result<()> {
        let byte = reader.read_u8()?;
        let method = b.method;
        let unsupported = |opcode| Error::UnsupportedOpcode {
            opcode,
            offset,
            method: method.to_string(),
        };
        let opcode = OPCode::try_from(byte).map_err(unsupported)?;
        trace!("{}@{offset}: {opcode:?}", method.name);

        match opcode {
            OPCode::NOP => (),
            OPCode::IconstM1
            | OPCode::Iconst0
            | OPCode::Iconst1
            | OPCode::Iconst2
            | OPCode::Iconst3
            | OPCode::Iconst4
            | OPCode::Iconst5
            | OPCode::Lconst0
            | OPCode::Lconst1 => {
                let value = opcode.implicit_constant().unwrap_or_default();
                let dst = b.push(Kind::Int)?;
                b.emit(Instruction::Const { dst, value })?;
            }
            OPCode::BiPush => {
                let value = reader.read_i8()? as i64;
                let dst = b.push(Kind::Int)?;
                b.emit(Instruction::Const { dst, value })?;
            }
            OPCode::SiPush => {
                let value = reader.read_i16()? as i64;
                let dst = b.push(Kind::Int)?;
                b.emit(Instruction::Const { dst, value })?;
            }
            OPCode::Ldc | OPCode::LdcW | OPCode::Ldc2W => {
                let index = match opcode {
                    OPCode::Ldc => reader.read_u8()? as u16,
                    _ => reader.read_u16()?,
                };
                match self.loadable_constant(index)? {
                    Constant::Int(value) => {
                        let dst = b.push(Kind::Int)?;
                        b.emit(Instruction::Const { dst, value })?;
                    }
                    Constant::Str(bytes) => {
                        let dst = b.push(Kind::Ref)?;
                        b.emit(Instruction::Str {
                            dst,
                            bytes: bytes.to_vec(),
                        })?;
                    }
                }
            }
            OPCode::ILoad | OPCode::LLoad | OPCode::ALoad => {
                let index = reader.read_u8()? as u16;
                self.load(b, opcode, index)?;
            }
            OPCode::ILoad0
            | OPCode::ILoad1
            | OPCode::ILoad2
            | OPCode::ILoad3
            | OPCode::LLoad0
            | OPCode::LLoad1
            | OPCode::LLoad2
            | OPCode::LLoad3
            | OPCode::ALoad0
            | OPCode::ALoad1
            | OPCode::ALoad2
            | OPCode::ALoad3 => {
                self.load(b, opcode, opcode.implicit_local().unwrap_or_default())?;
            }
            OPCode::IStore | OPCode::LStore | OPCode::AStore => {
                let index = reader.read_u8()? as u16;
                self.store(b, opcode, index)?;
            }
            OPCode::IStore0
            | OPCode::IStore1
            | OPCode::IStore2
            | OPCode::IStore3
            | OPCode::LStore0
            | OPCode::LStore1
            | OPCode::LStore2
            | OPCode::LStore3
            | OPCode::AStore0
            | OPCode::AStore1
            | OPCode::AStore2
            | OPCode::AStore3 => {
                self.store(b, opcode, opcode.implicit_local().unwrap_or_default())?;
            }
            OPCode::IALoad | OPCode::LALoad | OPCode::BALoad | OPCode::CALoad | OPCode::SALoad => {
                let index = b.pop_slot()?;
                let array = b.pop_slot()?;
                let dst = b.push(Kind::Int)?;
                b.emit(Instruction::ArrayLoad { dst, array, index })?;
            }
            OPCode::IAStore
            | OPCode::LAStore
            | OPCode::BAStore
            | OPCode::CAStore
            | OPCode::SAStore => {
                let value = b.pop_slot()?;
                let index = b.pop_slot()?;
                let array = b.pop_slot()?;
                b.emit(Instruction::ArrayStore {
                    array,
                    index,
                    value,
                })?;
            }
            OPCode::Pop => {
                b.pop()?;
            }
            OPCode::Dup => {
                let (kind, src) = b.pop()?;
                b.push(kind)?;
                let dst = b.push(kind)?;
                if let Some(cell) = kind.cell(src) {
                    b.emit(Instruction::Move {
                        lane: cell.lane,
                        dst,
                        src,
                    })?;
                }
            }
            OPCode::Swap => {
                let (upper_kind, upper) = b.pop()?;
                let (lower_kind, lower) = b.pop()?;
                b.push(upper_kind)?;
                b.push(lower_kind)?;
                if let (Some(lower), Some(upper)) = (lower_kind.cell(lower), upper_kind.cell(upper))
                {
                    b.emit(Instruction::Swap { lower, upper })?;
                } else if let Some(cell) = lower_kind.cell(lower).or(upper_kind.cell(upper)) {
                    // Only one side owns storage: move it to the other cell.
                    let dst = if cell.slot == lower { upper } else { lower };
                    b.emit(Instruction::Move {
                        lane: cell.lane,
                        dst,
                        src: cell.slot,
                    })?;
                }
            }
            OPCode::IAdd
            | OPCode::LAdd
            | OPCode::ISub
            | OPCode::LSub
            | OPCode::IMul
            | OPCode::LMul
            | OPCode::IDiv
            | OPCode::LDiv
            | OPCode::IRem
            | OPCode::LRem
            | OPCode::IShl
            | OPCode::LShl
            | OPCode::IShr
            | OPCode::LShr
            | OPCode::IUShr
            | OPCode::LUShr
            | OPCode::IAnd
            | OPCode::LAnd
            | OPCode::IOr
            | OPCode::LOr
            | OPCode::IXor
            | OPCode::LXor => {
                let op = opcode.binary_op().ok_or_else(|| unsupported(byte))?;
                let rhs = b.pop_slot()?;
                let lhs = b.pop_slot()?;
                let dst = b.push(Kind::Int)?;
                b.emit(Instruction::Binary {
                    op,
                    dst,
                    lhs,
                    rhs,
                    offset,
                })?;
            }
            OPCode::INeg | OPCode::LNeg => {
                let src = b.pop_slot()?;
                let dst = b.push(Kind::Int)?;
                b.emit(Instruction::Neg { dst, src })?;
            }
            OPCode::IInc => {
                let index = reader.read_u8()? as u16;
                let delta = reader.read_i8()? as i64;
                b.local(index)?;
                b.emit(Instruction::Increment {
                    local: index,
                    delta,
                })?;
            }
            OPCode::I2L => {
                b.pop()?;
                b.push(Kind::Int)?;
            }
            OPCode::L2I | OPCode::I2B | OPCode::I2C | OPCode::I2S => {
                let width = match opcode {
                    OPCode::I2B => ArrayType::Byte,
                    OPCode::I2C => ArrayType::Char,
                    OPCode::I2S => ArrayType::Short,
                    _ => ArrayType::Int,
                };
                let src = b.pop_slot()?;
                let dst = b.push(Kind::Int)?;
                b.emit(Instruction::Narrow { dst, src, width })?;
            }
            OPCode::LCmp => {
                let rhs = b.pop_slot()?;
                let lhs = b.pop_slot()?;
                let dst = b.push(Kind::Int)?;
                b.emit(Instruction::Compare { dst, lhs, rhs })?;
            }
            OPCode::IfEq
            | OPCode::IfNe
            | OPCode::IfLt
            | OPCode::IfGe
            | OPCode::IfGt
            | OPCode::IfLe
            | OPCode::IfICmpEq
            | OPCode::IfICmpNe
            | OPCode::IfICmpLt
            | OPCode::IfICmpGe
            | OPCode::IfICmpGt
            | OPCode::IfICmpLe => {
                let delta = reader.read_i16()? as i64;
                let (condition, pairwise) = opcode.condition().ok_or_else(|| unsupported(byte))?;
                let rhs = if pairwise {
                    Operand::Slot(b.pop_slot()?)
                } else {
                    Operand::Imm(0)
                };
                let lhs = b.pop_slot()?;
                let target = bytecode::relative(offset, delta).ok_or_else(|| unsupported(byte))?;
                let taken = b.block_at(target)?;
                let fallthrough = b.block_at(reader.position())?;
                b.enter(taken)?;
                b.enter(fallthrough)?;
                b.seal(Terminator::Branch {
                    condition,
                    lhs,
                    rhs,
                    taken,
                    fallthrough,
                })?;
            }
            OPCode::Goto => {
                let delta = reader.read_i16()? as i64;
                let target = bytecode::relative(offset, delta).ok_or_else(|| unsupported(byte))?;
                let target = b.block_at(target)?;
                b.enter(target)?;
                b.seal(Terminator::Jump(target))?;
            }
            OPCode::IReturn | OPCode::LReturn | OPCode::AReturn | OPCode::Return => {
                if !method.accepts_return(opcode) {
                    return Err(Error::ReturnMismatch {
                        offset,
                        method: method.to_string(),
                    });
                }
                let value = match opcode {
                    OPCode::Return => None,
                    OPCode::AReturn => Some(Cell {
                        lane: Lane::Ref,
                        slot: b.pop_slot()?,
                    }),
                    _ => Some(Cell {
                        lane: Lane::Int,
                        slot: b.pop_slot()?,
                    }),
                };
                b.seal(Terminator::Return(value))?;
            }
            OPCode::GetStatic => {
                let field = self.member_ref(reader.read_u16()?)?;
                if field.is_system_out() {
                    b.push(Kind::SystemOut)?;
                } else {
                    b.push(Kind::Placeholder)?;
                }
            }
            OPCode::InvokeVirtual | OPCode::InvokeSpecial | OPCode::InvokeStatic => {
                let index = reader.read_u16()?;
                let on_object = opcode != OPCode::InvokeStatic;
                match self.resolve_invoke(index)? {
                    Invoke::Println { argument } => {
                        let value = match argument {
                            None => {
                                expect_system_out(b.pop()?.0)?;
                                None
                            }
                            Some(argument) => {
                                let (top_kind, top) = b.pop()?;
                                let (below_kind, below) = b.pop()?;
                                let slot = if top_kind == Kind::SystemOut {
                                    below
                                } else {
                                    expect_system_out(below_kind)?;
                                    top
                                };
                                Some(Cell {
                                    lane: Lane::of(&argument),
                                    slot,
                                })
                            }
                        };
                        b.emit(Instruction::Print { value })?;
                    }
                    Invoke::ObjectInit => {
                        b.pop()?;
                    }
                    Invoke::Method(callee) => self.call(b, callee, on_object)?,
                }
            }
            OPCode::New => {
                self.class_name_of(reader.read_u16()?)?;
                b.push(Kind::Placeholder)?;
            }
            OPCode::NewArray => {
                let element = ArrayType::from_tag(reader.read_u8()?)?;
                let length = b.pop_slot()?;
                let dst = b.push(Kind::Ref)?;
                b.emit(Instruction::NewArray {
                    dst,
                    length,
                    element,
                })?;
            }
            OPCode::ArrayLength => {
                let array = b.pop_slot()?;
                let dst = b.push(Kind::Int)?;
                b.emit(Instruction::ArrayLength { dst, array })?;
            }
        }
        Ok(())
    }

    fn load(&self, b: &mut FunctionBuilder<'a>, opcode: OPCode, index: u16) -> Result<()> {
        let src = b.local(index)?;
        let (kind, lane) = match opcode {
            OPCode::ALoad | OPCode::ALoad0 | OPCode::ALoad1 | OPCode::ALoad2 | OPCode::ALoad3 => {
                (Kind::Ref, Lane::Ref)
            }
            _ => (Kind::Int, Lane::Int),
        };
        let dst = b.push(kind)?;
        b.emit(Instruction::Move { lane, dst, src })
    }

    fn store(&self, b: &mut FunctionBuilder<'a>, opcode: OPCode, index: u16) -> Result<()> {
        let dst = b.local(index)?;
        let lane = match opcode {
            OPCode::AStore
            | OPCode::AStore0
            | OPCode::AStore1
            | OPCode::AStore2
            | OPCode::AStore3 => Lane::Ref,
            _ => Lane::Int,
        };
        let src = b.pop_slot()?;
        b.emit(Instruction::Move { lane, dst, src })
    }

    /// Emit a call, building the callee first unless it is already being
    /// built further up (recursion).
    fn call(&mut self, b: &mut FunctionBuilder<'a>, callee: &'a Method, on_object: bool) -> Result<()> {
        if !self.in_progress.contains(&callee.id) {
            self.compile(callee)?;
        }
        let mut arguments = Vec::with_capacity(callee.parameters().len());
        for (parameter, local) in callee
            .parameters()
            .iter()
            .zip(callee.parameter_slots())
            .rev()
        {
            arguments.push(Argument {
                lane: Lane::of(parameter),
                src: b.pop_slot()?,
                local,
            });
        }
        arguments.reverse();
        if on_object {
            b.pop()?;
        }
        let ret = match callee.return_type() {
            TypeDescriptor::Void => None,
            ret if ret.is_reference() => Some(Cell {
                lane: Lane::Ref,
                slot: b.push(Kind::Ref)?,
            }),
            _ => Some(Cell {
                lane: Lane::Int,
                slot: b.push(Kind::Int)?,
            }),
        };
        b.emit(Instruction::Call {
            method: callee.id,
            arguments,
            ret,
        })
    }
}

fn expect_system_out(kind: Kind) -> Result<()> {
    if kind == Kind::SystemOut {
        Ok(())
    } else {
        Err(Error::MethodNotFound {
            class: crate::backend::PRINT_STREAM.to_string(),
            name: crate::backend::PRINTLN.to_string(),
        })
    }
}

/// Pass 1: register a block at offset 0, at every branch target, after
/// every conditional branch and after every instruction that ends a block.
pub fn discover_blocks(method: &Method, code: &Code) -> Result<ControlFlowMap> {
    let mut blocks = ControlFlowMap::default();
    blocks.get_or_create(0);
    let length = code.bytecode.len();
    let name = method.to_string();
    let mut reader = ByteReader::new(&code.bytecode);
    while reader.has_remaining() {
        let step = bytecode::step(&mut reader, &name)?;
        let ends_block = matches!(step.opcode, 0xac..=0xb1);
        if let Some(target) = step.target {
            if target >= length {
                return Err(Error::UnsupportedOpcode {
                    opcode: step.opcode,
                    offset: step.offset,
                    method: name,
                });
            }
            blocks.get_or_create(target);
        }
        if (step.target.is_some() || ends_block) && step.next < length {
            blocks.get_or_create(step.next);
        }
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvm::JVMParser;
    use crate::testutil::{ClassAssembler, CodeBuilder};
    use proptest::prelude::*;

    fn single_method(code: &[u8], max_stack: u16, max_locals: u16) -> ClassFile {
        let mut asm = ClassAssembler::new("Blocks");
        asm.static_method("main", "([Ljava/lang/String;)V", max_stack, max_locals, code);
        JVMParser::parse(&asm.finish()).unwrap()
    }

    fn compile_main(class: &ClassFile) -> Result<Arc<Function>> {
        let mut cache = JitCache::new(class);
        let main = cache.find_method("main")?;
        cache.compile(main)
    }

    fn offsets(function: &Function) -> Vec<usize> {
        function.blocks.iter().map(|(_, block)| block.offset).collect()
    }

    #[test]
    fn straight_line_code_is_one_block() {
        let mut asm = ClassAssembler::new("Add");
        let (out, println) = asm.println("(I)V");
        let code = CodeBuilder::new()
            .op(0x05)
            .op(0x06)
            .op(0x60)
            .op(0x3c)
            .op(0x1b)
            .u16(0xb2, out)
            .u16(0xb6, println)
            .op(0xb1)
            .finish();
        asm.static_method("main", "([Ljava/lang/String;)V", 2, 2, &code);
        let class = JVMParser::parse(&asm.finish()).unwrap();
        let function = compile_main(&class).unwrap();

        assert_eq!(function.blocks.len(), 1);
        let entry = &function.blocks[function.entry()];
        assert_eq!(entry.state(), BlockState::Sealed);
        assert_eq!(entry.terminator, Some(Terminator::Return(None)));
        assert_eq!(
            entry.instructions.last(),
            Some(&Instruction::Print {
                value: Some(Cell {
                    lane: Lane::Int,
                    slot: Slot::Stack(0)
                })
            })
        );
        assert_eq!(
            entry.instructions[2],
            Instruction::Binary {
                op: BinaryOp::Add,
                dst: Slot::Stack(0),
                lhs: Slot::Stack(0),
                rhs: Slot::Stack(1),
                offset: 2,
            }
        );
    }

    #[test]
    fn forward_and_backward_targets_get_blocks() {
        let mut asm = ClassAssembler::new("Loop");
        let (out, println) = asm.println("(I)V");
        let code = CodeBuilder::new()
            .op(0x03) // 0
            .op(0x3c) // 1
            .jump(0xa7, "cond") // 2
            .label("body") // 5
            .print(out, println, |c| c.op(0x1b))
            .iinc(1, 1) // 12
            .label("cond") // 15
            .op(0x1b)
            .op(0x06)
            .jump(0xa1, "body") // 17
            .op(0xb1) // 20
            .finish();
        asm.static_method("main", "([Ljava/lang/String;)V", 2, 2, &code);
        let class = JVMParser::parse(&asm.finish()).unwrap();
        let function = compile_main(&class).unwrap();

        assert_eq!(offsets(&function), vec![0, 5, 15, 20]);
        let body = function.blocks.block_at(5).unwrap();
        let cond = function.blocks.block_at(15).unwrap();
        let exit = function.blocks.block_at(20).unwrap();
        assert_eq!(function.blocks[BlockId(0)].terminator, Some(Terminator::Jump(cond)));
        assert_eq!(function.blocks[body].terminator, Some(Terminator::Jump(cond)));
        assert_eq!(
            function.blocks[cond].terminator,
            Some(Terminator::Branch {
                condition: Condition::Lt,
                lhs: Slot::Stack(0),
                rhs: Operand::Slot(Slot::Stack(1)),
                taken: body,
                fallthrough: exit,
            })
        );
        for (_, block) in function.blocks.iter() {
            assert_eq!(block.entry_depth(), Some(0));
        }
    }

    #[test]
    fn mismatched_stack_depth_at_merge_is_rejected() {
        // iconst_1, iconst_0, ifeq L, iconst_2, L: pop, return
        let code = [0x04, 0x03, 0x99, 0x00, 0x04, 0x05, 0x57, 0xb1];
        let class = single_method(&code, 3, 1);
        assert!(matches!(
            compile_main(&class),
            Err(Error::InconsistentStackDepth {
                offset: 6,
                expected: 1,
                found: 2
            })
        ));
    }

    #[test]
    fn falling_off_the_end_is_rejected() {
        let class = single_method(&[0x03, 0x57], 1, 1);
        assert!(matches!(
            compile_main(&class),
            Err(Error::UnterminatedBlock { .. })
        ));
    }

    #[test]
    fn returns_must_match_the_descriptor() {
        // aload_0, areturn in a void method
        let class = single_method(&[0x2a, 0xb0], 1, 1);
        assert!(matches!(
            compile_main(&class),
            Err(Error::ReturnMismatch { offset: 1, .. })
        ));

        let mut asm = ClassAssembler::new("Shape");
        asm.static_method("main", "([Ljava/lang/String;)V", 0, 1, &[0xb1]);
        asm.static_method("name", "()Ljava/lang/String;", 1, 0, &[0x03, 0xac]);
        asm.static_method("count", "()J", 1, 0, &[0x0a, 0xad]);
        let class = JVMParser::parse(&asm.finish()).unwrap();
        let mut cache = JitCache::new(&class);
        let name = cache.find_method("name").unwrap();
        assert!(matches!(
            cache.compile(name),
            Err(Error::ReturnMismatch { offset: 1, .. })
        ));
        let count = cache.find_method("count").unwrap();
        let function = cache.compile(count).unwrap();
        assert_eq!(function.ret, Some(Lane::Int));
    }

    #[test]
    fn unknown_opcodes_fail_the_method() {
        let class = single_method(&[0x01, 0xb1], 1, 1);
        assert!(matches!(
            compile_main(&class),
            Err(Error::UnsupportedOpcode { opcode: 0x01, .. })
        ));
    }

    #[test]
    fn blocks_are_sealed_exactly_once() {
        let mut blocks = ControlFlowMap::default();
        let id = blocks.get_or_create(0);
        assert_eq!(blocks[id].state(), BlockState::Unsealed);
        blocks[id].seal(Terminator::Return(None)).unwrap();
        assert_eq!(blocks[id].state(), BlockState::Sealed);
        assert!(matches!(
            blocks[id].seal(Terminator::Jump(id)),
            Err(Error::BlockAlreadySealed { offset: 0 })
        ));
        assert!(matches!(
            blocks[id].push(Instruction::Print { value: None }),
            Err(Error::BlockAlreadySealed { offset: 0 })
        ));
    }

    #[test]
    fn control_flow_map_refuses_duplicate_boundaries() {
        let mut blocks = ControlFlowMap::default();
        let first = blocks.insert(4).unwrap();
        assert_eq!(blocks.get_or_create(4), first);
        assert!(matches!(
            blocks.insert(4),
            Err(Error::DuplicateBlockBoundary { offset: 4 })
        ));
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn functions_are_memoized_and_recursion_terminates() {
        let mut asm = ClassAssembler::new("Rec");
        let fact = asm.method_ref("Rec", "fact", "(I)I");
        let main = CodeBuilder::new()
            .push_int(5)
            .u16(0xb8, fact)
            .op(0x57)
            .op(0xb1)
            .finish();
        let body = CodeBuilder::new()
            .op(0x1a)
            .jump(0x9a, "recurse") // ifne
            .op(0x04)
            .op(0xac)
            .label("recurse")
            .op(0x1a)
            .op(0x1a)
            .op(0x04)
            .op(0x64)
            .u16(0xb8, fact)
            .op(0x68)
            .op(0xac)
            .finish();
        asm.static_method("main", "([Ljava/lang/String;)V", 1, 1, &main);
        asm.static_method("fact", "(I)I", 3, 1, &body);
        let class = JVMParser::parse(&asm.finish()).unwrap();

        let mut cache = JitCache::new(&class);
        let main = cache.find_method("main").unwrap();
        let first = cache.compile(main).unwrap();
        let second = cache.compile(main).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let names: Vec<_> = cache.functions().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Rec.fact(I)I", "Rec.main([Ljava/lang/String;)V"]
        );

        let fact = cache.find_method("fact").unwrap();
        let function = fact.jit_function().unwrap();
        assert_eq!(function.parameters, vec![(Lane::Int, 0)]);
        assert_eq!(function.ret, Some(Lane::Int));
        let dump = function.to_string();
        assert!(dump.contains("i:s1 = call #1(l0 <- i:s1)"), "{dump}");
        assert!(dump.contains("br.ne s0, 0 ? bb1 : bb2"), "{dump}");
    }

    #[test]
    fn println_argument_is_found_on_either_side_of_the_receiver() {
        let mut asm = ClassAssembler::new("Order");
        let (out, println) = asm.println("(Ljava/lang/String;)V");
        let hi = asm.string("hi");
        let code = CodeBuilder::new()
            .u8(0x12, hi as u8)
            .u16(0xb2, out)
            .u16(0xb6, println)
            .u16(0xb2, out)
            .u8(0x12, hi as u8)
            .u16(0xb6, println)
            .op(0xb1)
            .finish();
        asm.static_method("main", "([Ljava/lang/String;)V", 2, 1, &code);
        let class = JVMParser::parse(&asm.finish()).unwrap();
        let function = compile_main(&class).unwrap();
        let prints: Vec<_> = function.blocks[function.entry()]
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Print { .. }))
            .cloned()
            .collect();
        assert_eq!(
            prints,
            vec![
                Instruction::Print {
                    value: Some(Cell {
                        lane: Lane::Ref,
                        slot: Slot::Stack(0)
                    })
                },
                Instruction::Print {
                    value: Some(Cell {
                        lane: Lane::Ref,
                        slot: Slot::Stack(1)
                    })
                },
            ]
        );
    }

    #[derive(Debug, Clone)]
    enum Shape {
        Nop,
        Goto(usize),
        IfEq(usize),
    }

    fn shapes() -> impl Strategy<Value = Vec<Shape>> {
        (1usize..24).prop_flat_map(|len| {
            prop::collection::vec(
                prop_oneof![
                    Just(Shape::Nop),
                    (0..len).prop_map(Shape::Goto),
                    (0..len).prop_map(Shape::IfEq),
                ],
                len,
            )
        })
    }

    proptest! {
        /// Every branch target gets exactly one block, however many
        /// branches reach it.
        #[test]
        fn one_block_per_boundary(program in shapes()) {
            // Each entry is three bytes so targets are instruction starts:
            // `nop nop nop`, `goto`, or `ifeq`.
            let mut code = Vec::new();
            let mut expected = std::collections::BTreeSet::from([0usize]);
            for (i, shape) in program.iter().enumerate() {
                let at = i * 3;
                match shape {
                    Shape::Nop => code.extend([0x00, 0x00, 0x00]),
                    Shape::Goto(target) | Shape::IfEq(target) => {
                        let opcode = if matches!(shape, Shape::Goto(_)) { 0xa7 } else { 0x99 };
                        let delta = (*target as i64 * 3 - at as i64) as i16;
                        code.push(opcode);
                        code.extend(delta.to_be_bytes());
                        expected.insert(target * 3);
                        if at + 3 < program.len() * 3 {
                            expected.insert(at + 3);
                        }
                    }
                }
            }
            let class = single_method(&code, 1, 1);
            let method = (&class).find_method("main").unwrap();
            let blocks = discover_blocks(method, method.code().unwrap()).unwrap();

            let found: Vec<usize> = blocks.iter().map(|(_, block)| block.offset).collect();
            prop_assert_eq!(found, expected.into_iter().collect::<Vec<_>>());
            let ids: HashSet<BlockId> = blocks.iter().map(|(id, _)| id).collect();
            prop_assert_eq!(ids.len(), blocks.len());
        }
    }
}
