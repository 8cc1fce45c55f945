//! Resolution services shared by the interpreter and the JIT builder:
//! method lookup in the loaded class, lazy `Code` decoding and constant
//! pool navigation.
use std::sync::Arc;

use crate::bytecode::{self, OperandShape};
use crate::error::{Error, Result};
use crate::jvm::{unexpected, ClassFile, Code, ConstantPoolEntry, MemberKind, Method};
use crate::types::{TypeDescriptor, TypeRegistry};

pub const PRINT_STREAM: &str = "java/io/PrintStream";
pub const PRINTLN: &str = "println";
pub const SYSTEM: &str = "java/lang/System";
pub const OUT: &str = "out";
pub const OBJECT: &str = "java/lang/Object";
pub const CONSTRUCTOR: &str = "<init>";

/// A `Fieldref`/`Methodref` entry with its names resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef<'a> {
    pub kind: MemberKind,
    pub class: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
}

impl MemberRef<'_> {
    /// `System.out`, the receiver the println intrinsic accepts.
    pub fn is_system_out(&self) -> bool {
        self.class == SYSTEM && self.name == OUT
    }
}

/// Loadable constant, the operand of `ldc` and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constant<'a> {
    Int(i64),
    Str(&'a [u8]),
}

/// What an invoke instruction resolves to.
#[derive(Debug, Clone)]
pub enum Invoke<'a> {
    /// `PrintStream.println`, with its single parameter type if any.
    Println {
        argument: Option<Arc<TypeDescriptor>>,
    },
    /// `Object.<init>`, which does nothing.
    ObjectInit,
    /// A method of the loaded class.
    Method(&'a Method),
}

/// Capability interface consumed by both execution engines. Implementors
/// only provide the class; every lookup is a provided method.
pub trait Backend<'a> {
    fn class(&self) -> &'a ClassFile;

    /// Find a method of the current class by name. Superclasses and other
    /// classes are never searched.
    fn find_method(&self, name: &str) -> Result<&'a Method> {
        let class = self.class();
        class
            .methods
            .iter()
            .find(|method| method.name == name)
            .ok_or_else(|| Error::MethodNotFound {
                class: class.name.clone(),
                name: name.to_string(),
            })
    }

    /// Find a method of `class_name` by name and descriptor. Only the
    /// loaded class can satisfy the lookup.
    fn find_method_typed(&self, class_name: &str, name: &str, descriptor: &str) -> Result<&'a Method> {
        let class = self.class();
        class
            .methods
            .iter()
            .filter(|_| class.name == class_name)
            .find(|method| method.name == name && method.descriptor == descriptor)
            .ok_or_else(|| Error::MethodNotFound {
                class: class_name.to_string(),
                name: name.to_string(),
            })
    }

    /// Decoded `Code` of a method, memoized on the method.
    /// Decoded code of `method`. Methods whose signature uses floating point
    /// are refused here, when they are first run, not when the class loads.
    fn find_code(&self, method: &'a Method) -> Result<&'a Code> {
        method.method_type.ensure_supported()?;
        method.code()
    }

    fn constant_pool_entry(&self, index: u16) -> Result<&'a ConstantPoolEntry> {
        self.class().constant_pool.get(index)
    }

    /// Name of the class a `Class` entry refers to.
    fn class_name_of(&self, class_index: u16) -> Result<&'a str> {
        self.class().constant_pool.class_name(class_index)
    }

    /// Member name of a `NameAndType` entry.
    fn member_name_of(&self, name_and_type_index: u16) -> Result<&'a str> {
        Ok(self
            .class()
            .constant_pool
            .name_and_type(name_and_type_index)?
            .0)
    }

    fn member_ref(&self, index: u16) -> Result<MemberRef<'a>> {
        let pool = &self.class().constant_pool;
        match self.constant_pool_entry(index)? {
            ConstantPoolEntry::MemberRef {
                kind,
                class_index,
                name_and_type_index,
            } => {
                let (name, descriptor) = pool.name_and_type(*name_and_type_index)?;
                Ok(MemberRef {
                    kind: *kind,
                    class: self.class_name_of(*class_index)?,
                    name,
                    descriptor,
                })
            }
            _ => Err(unexpected(index, "member reference")),
        }
    }

    /// Resolve the target of an invoke instruction, recognizing the
    /// intrinsics before looking in the loaded class.
    fn resolve_invoke(&self, index: u16) -> Result<Invoke<'a>> {
        let member = self.member_ref(index)?;
        if member.class == PRINT_STREAM && member.name == PRINTLN {
            let signature = TypeRegistry::global().parse_method(member.descriptor)?;
            signature.ensure_supported()?;
            let argument = match signature.parameters() {
                [] => None,
                [parameter] => Some(parameter.clone()),
                _ => {
                    return Err(Error::MethodNotFound {
                        class: member.class.to_string(),
                        name: format!("{}{}", member.name, member.descriptor),
                    })
                }
            };
            return Ok(Invoke::Println { argument });
        }
        if member.class == OBJECT && member.name == CONSTRUCTOR {
            return Ok(Invoke::ObjectInit);
        }
        self.find_method_typed(member.class, member.name, member.descriptor)
            .map(Invoke::Method)
    }

    /// Resolve an `ldc` operand.
    fn loadable_constant(&self, index: u16) -> Result<Constant<'a>> {
        match self.constant_pool_entry(index)? {
            ConstantPoolEntry::IntegerOrLong(value) => Ok(Constant::Int(*value)),
            ConstantPoolEntry::StringRef { utf8_index } => {
                Ok(Constant::Str(self.class().constant_pool.utf8(*utf8_index)?))
            }
            _ => Err(Error::UnsupportedConstant { index }),
        }
    }

    /// Operand shape of an opcode, used to step over instructions.
    fn operand_shape(&self, opcode: u8) -> OperandShape {
        bytecode::operand_shape(opcode)
    }
}

impl<'a> Backend<'a> for &'a ClassFile {
    fn class(&self) -> &'a ClassFile {
        *self
    }
}
