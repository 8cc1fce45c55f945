//! Reference code generator for JIT block graphs.
//!
//! [`Evaluator`] executes a [`Function`] directly over its two cell lanes.
//! Arrays are backed by raw byte storage of `length × element size` bytes
//! and accessed through scaled, little-endian addressing, the layout a
//! native backend would use.
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, info, trace};

use crate::bytecode::BinaryOp;
use crate::error::{Error, Result};
use crate::jit::{Cell, Function, Instruction, Lane, Operand, Slot, Terminator};
use crate::types::ArrayType;

/// Consumer of the block graphs produced by [`JitCache`](crate::jit::JitCache).
pub trait CodeGenerator {
    /// Make `function` available as a call target.
    fn declare(&mut self, function: Arc<Function>) -> Result<()>;

    /// Run `entry` with no arguments.
    fn execute(&mut self, entry: &Function) -> Result<()>;
}

/// Array storage returned by [`allocate`].
#[derive(Debug, Clone)]
pub struct ArrayRef {
    storage: Rc<RefCell<Vec<u8>>>,
    pub element: ArrayType,
    pub length: usize,
}

/// Allocation primitive backing `newarray`.
pub fn allocate(element: ArrayType, length: i64) -> Result<ArrayRef> {
    let length = usize::try_from(length).map_err(|_| Error::NegativeArraySize { length })?;
    Ok(ArrayRef {
        storage: Rc::new(RefCell::new(vec![0; length * element.size()])),
        element,
        length,
    })
}

impl ArrayRef {
    fn address(&self, index: i64) -> Result<usize> {
        usize::try_from(index)
            .ok()
            .filter(|i| *i < self.length)
            .map(|i| i * self.element.size())
            .ok_or(Error::ArrayIndexOutOfBounds {
                index,
                length: self.length,
            })
    }

    pub fn load(&self, index: i64) -> Result<i64> {
        let address = self.address(index)?;
        let size = self.element.size();
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(&self.storage.borrow()[address..address + size]);
        Ok(self.element.narrow(i64::from_le_bytes(raw)))
    }

    pub fn store(&self, index: i64, value: i64) -> Result<()> {
        let address = self.address(index)?;
        let size = self.element.size();
        self.storage.borrow_mut()[address..address + size]
            .copy_from_slice(&value.to_le_bytes()[..size]);
        Ok(())
    }
}

/// Contents of a reference lane cell.
#[derive(Debug, Clone, Default)]
pub enum Reference {
    #[default]
    Null,
    Str(Rc<[u8]>),
    Array(ArrayRef),
}

impl Reference {
    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Str(_) => "string",
            Self::Array(_) => "array",
        }
    }

    fn as_array(&self) -> Result<&ArrayRef> {
        match self {
            Self::Array(array) => Ok(array),
            other => Err(Error::TypeMismatch {
                expected: "array",
                found: other.kind(),
            }),
        }
    }
}

/// A value read out of a cell.
#[derive(Debug, Clone)]
enum Scalar {
    Int(i64),
    Ref(Reference),
}

/// Cells of one activation. Stack cells come first, locals follow.
struct Cells {
    ints: Vec<i64>,
    refs: Vec<Reference>,
    max_stack: usize,
}

impl Cells {
    fn new(function: &Function) -> Self {
        let size = function.max_stack as usize + function.max_locals as usize;
        Self {
            ints: vec![0; size],
            refs: vec![Reference::Null; size],
            max_stack: function.max_stack as usize,
        }
    }

    fn index(&self, slot: Slot) -> Result<usize> {
        let (index, bound) = match slot {
            Slot::Stack(depth) => (depth as usize, self.max_stack),
            Slot::Local(local) => (self.max_stack + local as usize, self.ints.len()),
        };
        if index < bound {
            return Ok(index);
        }
        Err(match slot {
            Slot::Stack(_) => Error::StackOverflow {
                max: self.max_stack,
            },
            Slot::Local(local) => Error::LocalOutOfRange {
                index: local as usize,
                max: self.ints.len() - self.max_stack,
            },
        })
    }

    fn int(&self, slot: Slot) -> Result<i64> {
        Ok(self.ints[self.index(slot)?])
    }

    fn set_int(&mut self, slot: Slot, value: i64) -> Result<()> {
        let index = self.index(slot)?;
        self.ints[index] = value;
        Ok(())
    }

    fn reference(&self, slot: Slot) -> Result<&Reference> {
        Ok(&self.refs[self.index(slot)?])
    }

    fn set_reference(&mut self, slot: Slot, value: Reference) -> Result<()> {
        let index = self.index(slot)?;
        self.refs[index] = value;
        Ok(())
    }

    fn read(&self, cell: Cell) -> Result<Scalar> {
        Ok(match cell.lane {
            Lane::Int => Scalar::Int(self.int(cell.slot)?),
            Lane::Ref => Scalar::Ref(self.reference(cell.slot)?.clone()),
        })
    }

    fn write(&mut self, slot: Slot, value: Scalar) -> Result<()> {
        match value {
            Scalar::Int(value) => self.set_int(slot, value),
            Scalar::Ref(value) => self.set_reference(slot, value),
        }
    }
}

/// Executes block graphs, printing to `out`.
pub struct Evaluator<W: Write> {
    functions: HashMap<usize, Arc<Function>>,
    out: W,
}

impl<W: Write> CodeGenerator for Evaluator<W> {
    fn declare(&mut self, function: Arc<Function>) -> Result<()> {
        debug!("declare {}", function.name);
        self.functions.insert(function.method, function);
        Ok(())
    }

    fn execute(&mut self, entry: &Function) -> Result<()> {
        info!("evaluating {}", entry.name);
        self.call(entry, Vec::new())?;
        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> Evaluator<W> {
    pub fn new(out: W) -> Self {
        Self {
            functions: HashMap::new(),
            out,
        }
    }

    pub fn into_output(self) -> W {
        self.out
    }

    fn call(&mut self, function: &Function, arguments: Vec<(u16, Scalar)>) -> Result<Option<Scalar>> {
        let mut cells = Cells::new(function);
        for (local, value) in arguments {
            cells.write(Slot::Local(local), value)?;
        }
        let mut current = function.entry();
        loop {
            let block = function
                .blocks
                .get(current)
                .ok_or_else(|| Error::UnterminatedBlock {
                    method: function.name.clone(),
                })?;
            trace!("{} {current} @{}", function.name, block.offset);
            for instruction in &block.instructions {
                self.evaluate(&mut cells, instruction)?;
            }
            let terminator = block
                .terminator
                .as_ref()
                .ok_or_else(|| Error::UnterminatedBlock {
                    method: function.name.clone(),
                })?;
            current = match terminator {
                Terminator::Jump(target) => *target,
                Terminator::Branch {
                    condition,
                    lhs,
                    rhs,
                    taken,
                    fallthrough,
                } => {
                    let lhs = cells.int(*lhs)?;
                    let rhs = match rhs {
                        Operand::Slot(slot) => cells.int(*slot)?,
                        Operand::Imm(value) => *value,
                    };
                    if condition.holds(lhs, rhs) {
                        *taken
                    } else {
                        *fallthrough
                    }
                }
                Terminator::Return(value) => {
                    return value.as_ref().map(|cell| cells.read(*cell)).transpose();
                }
            };
        }
    }

    fn evaluate(&mut self, cells: &mut Cells, instruction: &Instruction) -> Result<()> {
        match instruction {
            Instruction::Const { dst, value } => cells.set_int(*dst, *value)?,
            Instruction::Str { dst, bytes } => {
                cells.set_reference(*dst, Reference::Str(Rc::from(bytes.as_slice())))?
            }
            Instruction::Move { lane, dst, src } => {
                let value = cells.read(Cell {
                    lane: *lane,
                    slot: *src,
                })?;
                cells.write(*dst, value)?;
            }
            Instruction::Swap { lower, upper } => {
                let low = cells.read(*lower)?;
                let high = cells.read(*upper)?;
                cells.write(lower.slot, high)?;
                cells.write(upper.slot, low)?;
            }
            Instruction::Binary {
                op,
                dst,
                lhs,
                rhs,
                offset,
            } => {
                let value = binary(*op, cells.int(*lhs)?, cells.int(*rhs)?, *offset)?;
                cells.set_int(*dst, value)?;
            }
            Instruction::Neg { dst, src } => {
                let value = cells.int(*src)?.wrapping_neg();
                cells.set_int(*dst, value)?;
            }
            Instruction::Narrow { dst, src, width } => {
                let value = width.narrow(cells.int(*src)?);
                cells.set_int(*dst, value)?;
            }
            Instruction::Compare { dst, lhs, rhs } => {
                let ordering = cells.int(*lhs)?.cmp(&cells.int(*rhs)?);
                cells.set_int(*dst, ordering as i64)?;
            }
            Instruction::Increment { local, delta } => {
                let slot = Slot::Local(*local);
                let value = cells.int(slot)?.wrapping_add(*delta);
                cells.set_int(slot, value)?;
            }
            Instruction::NewArray {
                dst,
                length,
                element,
            } => {
                let array = allocate(*element, cells.int(*length)?)?;
                cells.set_reference(*dst, Reference::Array(array))?;
            }
            Instruction::ArrayLength { dst, array } => {
                let length = cells.reference(*array)?.as_array()?.length as i64;
                cells.set_int(*dst, length)?;
            }
            Instruction::ArrayLoad { dst, array, index } => {
                let value = cells
                    .reference(*array)?
                    .as_array()?
                    .load(cells.int(*index)?)?;
                cells.set_int(*dst, value)?;
            }
            Instruction::ArrayStore {
                array,
                index,
                value,
            } => {
                cells
                    .reference(*array)?
                    .as_array()?
                    .store(cells.int(*index)?, cells.int(*value)?)?;
            }
            Instruction::Call {
                method,
                arguments,
                ret,
            } => {
                let callee = self.functions.get(method).cloned().ok_or_else(|| {
                    Error::MethodNotFound {
                        class: String::new(),
                        name: format!("#{method}"),
                    }
                })?;
                let arguments = arguments
                    .iter()
                    .map(|argument| {
                        let value = cells.read(Cell {
                            lane: argument.lane,
                            slot: argument.src,
                        })?;
                        Ok((argument.local, value))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let value = self.call(&callee, arguments)?;
                if let Some(ret) = ret {
                    let value = value.ok_or(Error::StackUnderflow)?;
                    cells.write(ret.slot, value)?;
                }
            }
            Instruction::Print { value } => match value {
                None => writeln!(self.out)?,
                Some(cell) => match cells.read(*cell)? {
                    Scalar::Int(value) => writeln!(self.out, "{value}")?,
                    Scalar::Ref(Reference::Str(bytes)) => {
                        self.out.write_all(&bytes)?;
                        writeln!(self.out)?;
                    }
                    Scalar::Ref(other) => return Err(Error::Unprintable { kind: other.kind() }),
                },
            },
        }
        Ok(())
    }
}

fn binary(op: BinaryOp, lhs: i64, rhs: i64, offset: usize) -> Result<i64> {
    op.apply(lhs, rhs).ok_or(Error::ArithmeticError {
        reason: "division by zero",
        offset,
    })
}
