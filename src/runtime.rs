//! JVM runtime module responsible for interpreting the methods of a loaded
//! class.
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use log::{debug, info, trace};

use crate::backend::{Backend, Constant, Invoke, PRINTLN, PRINT_STREAM};
use crate::bytecode::{self, OPCode};
use crate::error::{Error, Result};
use crate::jvm::{ClassFile, Code, Method};
use crate::reader::ByteReader;
use crate::types::ArrayType;

/// JVM value types as seen by the interpreter.
#[derive(Debug, Clone)]
pub enum Value<'a> {
    /// Every integral type, with 64-bit two's-complement arithmetic.
    Int(i64),
    /// String constant, the raw bytes of its `Utf8` entry.
    Str(&'a [u8]),
    /// Unresolved static field pushed by `getstatic`.
    TypeRef { class: &'a str, member: &'a str },
    /// Placeholder produced by `new`; objects have no fields.
    ObjectRef(&'a str),
    Array(Rc<RefCell<ArrayValue>>),
}

impl<'a> Value<'a> {
    /// Returns the name of the value's variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Str(_) => "string",
            Self::TypeRef { .. } => "static field",
            Self::ObjectRef(_) => "object",
            Self::Array(_) => "array",
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Self::Int(value) => Ok(*value),
            other => Err(Error::TypeMismatch {
                expected: "int",
                found: other.kind(),
            }),
        }
    }

    pub fn as_array(&self) -> Result<Rc<RefCell<ArrayValue>>> {
        match self {
            Self::Array(array) => Ok(array.clone()),
            other => Err(Error::TypeMismatch {
                expected: "array",
                found: other.kind(),
            }),
        }
    }

    /// Whether this is the `System.out` receiver of the print intrinsic.
    pub fn is_system_out(&self) -> bool {
        matches!(
            self,
            Self::TypeRef {
                class: "java/lang/System",
                member: "out"
            }
        )
    }

    /// Write the value the way `println` renders it.
    pub fn println(&self, out: &mut impl Write) -> Result<()> {
        match self {
            Self::Int(value) => writeln!(out, "{value}")?,
            Self::Str(bytes) => {
                out.write_all(bytes)?;
                writeln!(out)?;
            }
            other => return Err(Error::Unprintable { kind: other.kind() }),
        }
        Ok(())
    }
}

/// Primitive array storage. Elements are kept widened to 64 bits and
/// narrowed to the element type on every store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayValue {
    pub element: ArrayType,
    pub elements: Vec<i64>,
}

impl ArrayValue {
    pub fn new(element: ArrayType, length: i64) -> Result<Self> {
        let length = usize::try_from(length).map_err(|_| Error::NegativeArraySize { length })?;
        Ok(Self {
            element,
            elements: vec![0; length],
        })
    }

    fn slot(&self, index: i64) -> Result<usize> {
        usize::try_from(index)
            .ok()
            .filter(|i| *i < self.elements.len())
            .ok_or(Error::ArrayIndexOutOfBounds {
                index,
                length: self.elements.len(),
            })
    }

    pub fn load(&self, index: i64) -> Result<i64> {
        Ok(self.elements[self.slot(index)?])
    }

    pub fn store(&mut self, index: i64, value: i64) -> Result<()> {
        let slot = self.slot(index)?;
        self.elements[slot] = self.element.narrow(value);
        Ok(())
    }
}

/// Execution environment for one method activation. The operand stack and
/// the locals are sized exactly from the method's `Code`; going past either
/// bound is an error.
#[derive(Debug)]
pub struct Frame<'a> {
    pub method: &'a Method,
    pub class: &'a ClassFile,
    reader: ByteReader<'a>,
    stack: Vec<Value<'a>>,
    max_stack: usize,
    locals: Vec<Value<'a>>,
}

impl<'a> Frame<'a> {
    pub fn new(class: &'a ClassFile, method: &'a Method, code: &'a Code) -> Self {
        Self {
            method,
            class,
            reader: ByteReader::new(&code.bytecode),
            stack: Vec::with_capacity(code.max_stack as usize),
            max_stack: code.max_stack as usize,
            locals: vec![Value::Int(0); code.max_locals as usize],
        }
    }

    pub fn instruction_pointer(&self) -> usize {
        self.reader.position()
    }

    pub fn stack_pointer(&self) -> usize {
        self.stack.len()
    }

    pub fn push(&mut self, value: Value<'a>) -> Result<()> {
        if self.stack.len() >= self.max_stack {
            return Err(Error::StackOverflow {
                max: self.max_stack,
            });
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value<'a>> {
        self.stack.pop().ok_or(Error::StackUnderflow)
    }

    fn pop_int(&mut self) -> Result<i64> {
        self.pop()?.as_int()
    }

    fn peek(&self) -> Result<&Value<'a>> {
        self.stack.last().ok_or(Error::StackUnderflow)
    }

    pub fn load(&self, index: u16) -> Result<Value<'a>> {
        self.locals
            .get(index as usize)
            .cloned()
            .ok_or(Error::LocalOutOfRange {
                index: index as usize,
                max: self.locals.len(),
            })
    }

    pub fn store(&mut self, index: u16, value: Value<'a>) -> Result<()> {
        let max = self.locals.len();
        let local = self
            .locals
            .get_mut(index as usize)
            .ok_or(Error::LocalOutOfRange {
                index: index as usize,
                max,
            })?;
        *local = value;
        Ok(())
    }

    fn jump(&mut self, offset: usize, delta: i64) -> Result<()> {
        let target = bytecode::relative(offset, delta).ok_or_else(|| self.unsupported(offset))?;
        self.reader.set_position(target);
        Ok(())
    }

    fn unsupported(&self, offset: usize) -> Error {
        let mut at = self.reader.clone();
        at.set_position(offset);
        Error::UnsupportedOpcode {
            opcode: at.read_u8().unwrap_or_default(),
            offset,
            method: self.method.to_string(),
        }
    }
}

/// Outcome of executing one instruction.
enum Flow<'a> {
    Continue,
    Return(Option<Value<'a>>),
}

/// `Runtime` represents an execution context for a loaded class and is
/// responsible for interpreting its bytecode. Calls push a new [`Frame`]
/// onto `frames` and returns pop it, so the caller always resumes with its
/// own stack and locals untouched.
pub struct Runtime<'a, W: Write> {
    class: &'a ClassFile,
    frames: Vec<Frame<'a>>,
    out: W,
}

impl<'a, W: Write> Backend<'a> for Runtime<'a, W> {
    fn class(&self) -> &'a ClassFile {
        self.class
    }
}

impl<'a, W: Write> Runtime<'a, W> {
    /// Create a runtime printing to `out`.
    pub fn new(class: &'a ClassFile, out: W) -> Self {
        Self {
            class,
            frames: Vec::new(),
            out,
        }
    }

    /// Run the class' `main` method to completion.
    pub fn run(&mut self) -> Result<()> {
        let main = self.find_method("main")?;
        info!("interpreting {}.{}", self.class.name, main);
        self.execute(main, Vec::new())?;
        self.out.flush()?;
        Ok(())
    }

    /// Run `method` as a root frame with the given arguments stored in its
    /// parameter slots. Returns the method's result, if it has one.
    pub fn execute(
        &mut self,
        method: &'a Method,
        arguments: Vec<Value<'a>>,
    ) -> Result<Option<Value<'a>>> {
        let code = self.find_code(method)?;
        let mut frame = Frame::new(self.class, method, code);
        for (slot, argument) in method.parameter_slots().into_iter().zip(arguments) {
            frame.store(slot, argument)?;
        }
        let depth = self.frames.len();
        self.frames.push(frame);
        let result = self.run_until(depth);
        if result.is_err() {
            self.frames.truncate(depth);
        }
        result
    }

    /// Consume the runtime, returning the output sink.
    pub fn into_output(self) -> W {
        self.out
    }

    fn run_until(&mut self, depth: usize) -> Result<Option<Value<'a>>> {
        loop {
            let Flow::Return(value) = self.step()? else {
                continue;
            };
            let frame = self.frames.pop().ok_or(Error::StackUnderflow)?;
            let value = if frame.method.return_type().is_void() {
                None
            } else {
                Some(value.ok_or(Error::StackUnderflow)?)
            };
            debug!("return from {}", frame.method);
            if self.frames.len() == depth {
                return Ok(value);
            }
            if let Some(value) = value {
                self.frame_mut()?.push(value)?;
            }
        }
    }

    fn frame_mut(&mut self) -> Result<&mut Frame<'a>> {
        self.frames.last_mut().ok_or(Error::StackUnderflow)
    }

    /// Evaluate the next instruction of the active frame.
    fn step(&mut self) -> Result<Flow<'a>> {
        let backend = self.class;
        let frame = self.frames.last_mut().ok_or(Error::StackUnderflow)?;
        let offset = frame.instruction_pointer();
        let byte = frame.reader.read_u8()?;
        let opcode = OPCode::try_from(byte).map_err(|opcode| Error::UnsupportedOpcode {
            opcode,
            offset,
            method: frame.method.to_string(),
        })?;
        trace!(
            "{}@{offset}: {opcode:?} sp={}",
            frame.method.name,
            frame.stack_pointer()
        );

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
                frame.push(Value::Int(value))?;
            }
            OPCode::BiPush => {
                let value = frame.reader.read_i8()?;
                frame.push(Value::Int(value as i64))?;
            }
            OPCode::SiPush => {
                let value = frame.reader.read_i16()?;
                frame.push(Value::Int(value as i64))?;
            }
            OPCode::Ldc | OPCode::LdcW | OPCode::Ldc2W => {
                let index = match opcode {
                    OPCode::Ldc => frame.reader.read_u8()? as u16,
                    _ => frame.reader.read_u16()?,
                };
                let value = match backend.loadable_constant(index)? {
                    Constant::Int(value) => Value::Int(value),
                    Constant::Str(bytes) => Value::Str(bytes),
                };
                frame.push(value)?;
            }
            OPCode::ILoad | OPCode::LLoad | OPCode::ALoad => {
                let index = frame.reader.read_u8()? as u16;
                let value = frame.load(index)?;
                frame.push(value)?;
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
                let value = frame.load(opcode.implicit_local().unwrap_or_default())?;
                frame.push(value)?;
            }
            OPCode::IStore | OPCode::LStore | OPCode::AStore => {
                let index = frame.reader.read_u8()? as u16;
                let value = frame.pop()?;
                frame.store(index, value)?;
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
                let value = frame.pop()?;
                frame.store(opcode.implicit_local().unwrap_or_default(), value)?;
            }
            OPCode::IALoad | OPCode::LALoad | OPCode::BALoad | OPCode::CALoad | OPCode::SALoad => {
                let index = frame.pop_int()?;
                let array = frame.pop()?.as_array()?;
                let value = array.borrow().load(index)?;
                frame.push(Value::Int(value))?;
            }
            OPCode::IAStore
            | OPCode::LAStore
            | OPCode::BAStore
            | OPCode::CAStore
            | OPCode::SAStore => {
                let value = frame.pop_int()?;
                let index = frame.pop_int()?;
                let array = frame.pop()?.as_array()?;
                array.borrow_mut().store(index, value)?;
            }
            OPCode::Pop => {
                frame.pop()?;
            }
            OPCode::Dup => {
                let value = frame.peek()?.clone();
                frame.push(value)?;
            }
            OPCode::Swap => {
                let top = frame.pop()?;
                let below = frame.pop()?;
                frame.push(top)?;
                frame.push(below)?;
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
                let rhs = frame.pop_int()?;
                let lhs = frame.pop_int()?;
                let op = opcode.binary_op().ok_or_else(|| frame.unsupported(offset))?;
                let value = op.apply(lhs, rhs).ok_or(Error::ArithmeticError {
                    reason: "division by zero",
                    offset,
                })?;
                frame.push(Value::Int(value))?;
            }
            OPCode::INeg | OPCode::LNeg => {
                let value = frame.pop_int()?;
                frame.push(Value::Int(value.wrapping_neg()))?;
            }
            OPCode::IInc => {
                let index = frame.reader.read_u8()? as u16;
                let delta = frame.reader.read_i8()? as i64;
                let value = frame.load(index)?.as_int()?;
                frame.store(index, Value::Int(value.wrapping_add(delta)))?;
            }
            OPCode::I2L => {
                let value = frame.pop_int()?;
                frame.push(Value::Int(value))?;
            }
            OPCode::L2I | OPCode::I2B | OPCode::I2C | OPCode::I2S => {
                let value = frame.pop_int()?;
                let width = match opcode {
                    OPCode::I2B => ArrayType::Byte,
                    OPCode::I2C => ArrayType::Char,
                    OPCode::I2S => ArrayType::Short,
                    _ => ArrayType::Int,
                };
                frame.push(Value::Int(width.narrow(value)))?;
            }
            OPCode::LCmp => {
                let rhs = frame.pop_int()?;
                let lhs = frame.pop_int()?;
                frame.push(Value::Int(lhs.cmp(&rhs) as i64))?;
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
                let delta = frame.reader.read_i16()? as i64;
                let (condition, pairwise) =
                    opcode.condition().ok_or_else(|| frame.unsupported(offset))?;
                let (lhs, rhs) = if pairwise {
                    let rhs = frame.pop_int()?;
                    (frame.pop_int()?, rhs)
                } else {
                    (frame.pop_int()?, 0)
                };
                if condition.holds(lhs, rhs) {
                    frame.jump(offset, delta)?;
                }
            }
            OPCode::Goto => {
                let delta = frame.reader.read_i16()? as i64;
                frame.jump(offset, delta)?;
            }
            OPCode::IReturn | OPCode::LReturn | OPCode::AReturn | OPCode::Return => {
                if !frame.method.accepts_return(opcode) {
                    return Err(Error::ReturnMismatch {
                        offset,
                        method: frame.method.to_string(),
                    });
                }
                if opcode == OPCode::Return {
                    return Ok(Flow::Return(None));
                }
                return Ok(Flow::Return(Some(frame.pop()?)));
            }
            OPCode::GetStatic => {
                let index = frame.reader.read_u16()?;
                let field = backend.member_ref(index)?;
                frame.push(Value::TypeRef {
                    class: field.class,
                    member: field.name,
                })?;
            }
            OPCode::InvokeVirtual | OPCode::InvokeSpecial | OPCode::InvokeStatic => {
                let index = frame.reader.read_u16()?;
                let on_object = opcode != OPCode::InvokeStatic;
                match backend.resolve_invoke(index)? {
                    Invoke::Println { argument } => self.println(argument.is_some())?,
                    Invoke::ObjectInit => {
                        frame.pop()?;
                    }
                    Invoke::Method(method) => self.call(method, on_object)?,
                }
            }
            OPCode::New => {
                let index = frame.reader.read_u16()?;
                frame.push(Value::ObjectRef(backend.class_name_of(index)?))?;
            }
            OPCode::NewArray => {
                let element = ArrayType::from_tag(frame.reader.read_u8()?)?;
                let length = frame.pop_int()?;
                let array = ArrayValue::new(element, length)?;
                frame.push(Value::Array(Rc::new(RefCell::new(array))))?;
            }
            OPCode::ArrayLength => {
                let array = frame.pop()?.as_array()?;
                let length = array.borrow().elements.len() as i64;
                frame.push(Value::Int(length))?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Push a frame for `method`, moving its arguments off the caller's
    /// stack. Arguments were pushed left to right, so they are popped in
    /// reverse into ascending parameter slots; the receiver of an instance
    /// call sits below them and is discarded.
    fn call(&mut self, method: &'a Method, on_object: bool) -> Result<()> {
        let code = self.find_code(method)?;
        let mut callee = Frame::new(self.class, method, code);
        let caller = self.frame_mut()?;
        for slot in method.parameter_slots().into_iter().rev() {
            let argument = caller.pop()?;
            callee.store(slot, argument)?;
        }
        if on_object {
            caller.pop()?;
        }
        debug!("call {} (depth {})", method, self.frames.len() + 1);
        self.frames.push(callee);
        Ok(())
    }

    /// The `PrintStream.println` intrinsic. Accepts the `System.out`
    /// receiver either below or above the printed value.
    fn println(&mut self, has_argument: bool) -> Result<()> {
        let frame = self.frame_mut()?;
        let (receiver, value) = if has_argument {
            let top = frame.pop()?;
            let below = frame.pop()?;
            if top.is_system_out() {
                (top, Some(below))
            } else {
                (below, Some(top))
            }
        } else {
            (frame.pop()?, None)
        };
        if !receiver.is_system_out() {
            return Err(Error::MethodNotFound {
                class: PRINT_STREAM.to_string(),
                name: PRINTLN.to_string(),
            });
        }
        match value {
            Some(value) => value.println(&mut self.out),
            None => Ok(writeln!(self.out)?),
        }
    }
}
