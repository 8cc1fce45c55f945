//! Lightweight implementation of a parser and decoder for JVM bytecode
//! class files.
//!
//! The parsed [`ClassFile`] owns every byte buffer read from the input;
//! method bodies are decoded from their `Code` attribute lazily and at most
//! once.
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use log::{debug, warn};

use crate::bytecode::OPCode;
use crate::error::{Error, Result};
use crate::jit::Function;
use crate::reader::ByteReader;
use crate::types::{TypeDescriptor, TypeRegistry};

/// Leading magic value of every class file.
pub const MAGIC: u32 = 0xcafe_babe;

/// Access flag marking static methods.
pub const ACC_STATIC: u16 = 0x0008;

const CONSTANT_UTF8: u8 = 1;
const CONSTANT_INTEGER: u8 = 3;
const CONSTANT_FLOAT: u8 = 4;
const CONSTANT_LONG: u8 = 5;
const CONSTANT_DOUBLE: u8 = 6;
const CONSTANT_CLASS: u8 = 7;
const CONSTANT_STRING: u8 = 8;
const CONSTANT_FIELDREF: u8 = 9;
const CONSTANT_METHODREF: u8 = 10;
const CONSTANT_INTERFACE_METHODREF: u8 = 11;
const CONSTANT_NAME_AND_TYPE: u8 = 12;
const CONSTANT_METHOD_HANDLE: u8 = 15;
const CONSTANT_METHOD_TYPE: u8 = 16;
const CONSTANT_DYNAMIC: u8 = 17;
const CONSTANT_INVOKE_DYNAMIC: u8 = 18;
const CONSTANT_MODULE: u8 = 19;
const CONSTANT_PACKAGE: u8 = 20;

/// Which kind of member a `MemberRef` entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Field,
    Method,
    InterfaceMethod,
}

/// Constant pool entries, indexed from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstantPoolEntry {
    Utf8(Vec<u8>),
    ClassRef {
        name_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MemberRef {
        kind: MemberKind,
        class_index: u16,
        name_and_type_index: u16,
    },
    StringRef {
        utf8_index: u16,
    },
    IntegerOrLong(i64),
    /// Raw bits, floating point is not executed.
    Float(u32),
    /// Raw bits, floating point is not executed.
    Double(u64),
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    /// `Dynamic` and `InvokeDynamic` entries.
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    /// `Module` and `Package` entries.
    Named {
        name_index: u16,
    },
    /// Second slot taken by a `Long` or `Double` entry.
    Reserved,
}

impl ConstantPoolEntry {
    fn kind(&self) -> &'static str {
        match self {
            Self::Utf8(_) => "Utf8",
            Self::ClassRef { .. } => "Class",
            Self::NameAndType { .. } => "NameAndType",
            Self::MemberRef { .. } => "MemberRef",
            Self::StringRef { .. } => "String",
            Self::IntegerOrLong(_) => "Integer",
            Self::Float(_) => "Float",
            Self::Double(_) => "Double",
            Self::MethodHandle { .. } => "MethodHandle",
            Self::MethodType { .. } => "MethodType",
            Self::Dynamic { .. } => "Dynamic",
            Self::Named { .. } => "Module",
            Self::Reserved => "Reserved",
        }
    }
}

/// The constant pool of a class. Lookups take the 1-based indices used in
/// the class file and fail on index 0 or past the end.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    entries: Vec<ConstantPoolEntry>,
}

impl ConstantPool {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: u16) -> Result<&ConstantPoolEntry> {
        (index as usize)
            .checked_sub(1)
            .and_then(|i| self.entries.get(i))
            .ok_or(Error::InvalidConstantIndex { index })
    }

    /// Raw bytes of a `Utf8` entry.
    pub fn utf8(&self, index: u16) -> Result<&[u8]> {
        match self.get(index)? {
            ConstantPoolEntry::Utf8(bytes) => Ok(bytes),
            _ => Err(unexpected(index, "Utf8")),
        }
    }

    /// `Utf8` entry decoded as a string.
    pub fn utf8_str(&self, index: u16) -> Result<&str> {
        std::str::from_utf8(self.utf8(index)?).map_err(|_| Error::InvalidUtf8 { index })
    }

    /// Name of the class a `Class` entry refers to.
    pub fn class_name(&self, class_index: u16) -> Result<&str> {
        match self.get(class_index)? {
            ConstantPoolEntry::ClassRef { name_index } => self.utf8_str(*name_index),
            _ => Err(unexpected(class_index, "Class")),
        }
    }

    /// Name and descriptor of a `NameAndType` entry.
    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.get(index)? {
            ConstantPoolEntry::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((
                self.utf8_str(*name_index)?,
                self.utf8_str(*descriptor_index)?,
            )),
            _ => Err(unexpected(index, "NameAndType")),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConstantPoolEntry> {
        self.entries.iter()
    }
}

pub(crate) fn unexpected(index: u16, expected: &'static str) -> Error {
    Error::UnexpectedConstant { index, expected }
}

/// Generic attribute, the payload is kept undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub info: Vec<u8>,
}

/// Decoded `Code` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytecode: Vec<u8>,
}

impl Code {
    /// Decode the leading part of a `Code` attribute payload. Exception
    /// tables and nested attributes that follow the bytecode are ignored.
    pub fn decode(info: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(info);
        let max_stack = reader.read_u16()?;
        let max_locals = reader.read_u16()?;
        let code_length = reader.read_u32()? as usize;
        let bytecode = reader.read_bytes(code_length)?.to_vec();
        Ok(Self {
            max_stack,
            max_locals,
            bytecode,
        })
    }
}

#[derive(Debug)]
pub struct Field {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub field_type: Arc<TypeDescriptor>,
    pub attributes: Vec<Attribute>,
}

/// Java class method. `code` and `jit` are filled in on first use.
#[derive(Debug)]
pub struct Method {
    /// Position in the owning class' method table.
    pub id: usize,
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub method_type: Arc<TypeDescriptor>,
    pub attributes: Vec<Attribute>,
    code: OnceLock<Code>,
    jit: OnceLock<Arc<Function>>,
}

impl Method {
    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn parameters(&self) -> &[Arc<TypeDescriptor>] {
        self.method_type.parameters()
    }

    pub fn return_type(&self) -> &TypeDescriptor {
        self.method_type
            .return_type()
            .unwrap_or(&TypeDescriptor::Void)
    }

    /// Whether the return instruction `opcode` fits the declared return
    /// type: `return` for void, `areturn` for references, the integral
    /// returns otherwise.
    pub fn accepts_return(&self, opcode: OPCode) -> bool {
        let ret = self.return_type();
        match opcode {
            OPCode::Return => ret.is_void(),
            OPCode::AReturn => ret.is_reference(),
            _ => ret.is_integral(),
        }
    }

    /// Local slot of every parameter, in declaration order. Instance
    /// methods start at slot 1, slot 0 belongs to the receiver.
    pub fn parameter_slots(&self) -> Vec<u16> {
        let mut slot = if self.is_static() { 0 } else { 1 };
        self.parameters()
            .iter()
            .map(|parameter| {
                let current = slot;
                slot += parameter.slot_size() as u16;
                current
            })
            .collect()
    }

    /// Decoded `Code` attribute. Decoding happens at most once; a racing
    /// second decode is dropped in favor of the stored one.
    pub fn code(&self) -> Result<&Code> {
        if let Some(code) = self.code.get() {
            return Ok(code);
        }
        let attribute = self
            .attributes
            .iter()
            .find(|attribute| attribute.name == "Code")
            .ok_or_else(|| Error::MissingCode {
                method: self.name.clone(),
            })?;
        let code = Code::decode(&attribute.info)?;
        debug!(
            "decoded Code for {}: max_stack={} max_locals={} length={}",
            self.name,
            code.max_stack,
            code.max_locals,
            code.bytecode.len()
        );
        Ok(self.code.get_or_init(|| code))
    }

    /// Whether the `Code` attribute has already been decoded.
    pub fn has_decoded_code(&self) -> bool {
        self.code.get().is_some()
    }

    /// Cached block graph, if this method was compiled already.
    pub fn jit_function(&self) -> Option<&Arc<Function>> {
        self.jit.get()
    }

    /// Store the compiled block graph, keeping an existing one if present.
    pub fn cache_jit_function(&self, function: Arc<Function>) -> &Arc<Function> {
        self.jit.get_or_init(|| function)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.name, self.descriptor)
    }
}

/// In-memory representation of a parsed class file.
#[derive(Debug)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub access_flags: u16,
    pub name: String,
    /// `None` only for `java/lang/Object`.
    pub super_name: Option<String>,
    pub constant_pool: ConstantPool,
    pub interfaces: Vec<u16>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
}

/// Class file parser.
pub struct JVMParser<'r> {
    types: &'r TypeRegistry,
}

impl JVMParser<'static> {
    /// Parse a class file, resolving descriptors against the global
    /// type registry.
    pub fn parse(bytes: &[u8]) -> Result<ClassFile> {
        JVMParser::with_registry(TypeRegistry::global()).parse_class(bytes)
    }
}

impl<'r> JVMParser<'r> {
    pub fn with_registry(types: &'r TypeRegistry) -> Self {
        Self { types }
    }

    pub fn parse_class(&self, bytes: &[u8]) -> Result<ClassFile> {
        let mut reader = ByteReader::new(bytes);

        let magic = reader.read_u32()?;
        if magic != MAGIC {
            return Err(Error::MalformedClassFile { magic });
        }
        let minor_version = reader.read_u16()?;
        let major_version = reader.read_u16()?;

        let constant_pool = Self::parse_constant_pool(&mut reader)?;

        let access_flags = reader.read_u16()?;
        let this_class = reader.read_u16()?;
        let super_class = reader.read_u16()?;
        let name = constant_pool.class_name(this_class)?.to_string();
        let super_name = match super_class {
            0 => None,
            index => Some(constant_pool.class_name(index)?.to_string()),
        };

        let interfaces_count = reader.read_u16()?;
        let interfaces = (0..interfaces_count)
            .map(|_| reader.read_u16())
            .collect::<Result<Vec<_>>>()?;

        let fields_count = reader.read_u16()?;
        let mut fields = Vec::with_capacity(fields_count as usize);
        for _ in 0..fields_count {
            let (access_flags, name, descriptor, attributes) =
                Self::parse_member(&mut reader, &constant_pool)?;
            let field_type = self.types.parse_field(&descriptor)?;
            fields.push(Field {
                access_flags,
                name,
                descriptor,
                field_type,
                attributes,
            });
        }

        let methods_count = reader.read_u16()?;
        let mut methods = Vec::with_capacity(methods_count as usize);
        for id in 0..methods_count as usize {
            let (access_flags, name, descriptor, attributes) =
                Self::parse_member(&mut reader, &constant_pool)?;
            let method_type = self.types.parse_method(&descriptor)?;
            methods.push(Method {
                id,
                access_flags,
                name,
                descriptor,
                method_type,
                attributes,
                code: OnceLock::new(),
                jit: OnceLock::new(),
            });
        }

        let attributes = Self::parse_attributes(&mut reader, &constant_pool)?;

        if reader.has_remaining() {
            warn!(
                "{} trailing bytes after class {}",
                reader.len() - reader.position(),
                name
            );
        }
        debug!(
            "parsed class {} (version {}.{}): {} constants, {} fields, {} methods",
            name,
            major_version,
            minor_version,
            constant_pool.len(),
            fields.len(),
            methods.len()
        );

        Ok(ClassFile {
            minor_version,
            major_version,
            access_flags,
            name,
            super_name,
            constant_pool,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    fn parse_constant_pool(reader: &mut ByteReader) -> Result<ConstantPool> {
        let count = reader.read_u16()?;
        let mut entries = Vec::with_capacity(count.saturating_sub(1) as usize);
        let mut index = 1u16;
        while index < count {
            let tag = reader.read_u8()?;
            let entry = match tag {
                CONSTANT_UTF8 => {
                    let length = reader.read_u16()? as usize;
                    ConstantPoolEntry::Utf8(reader.read_bytes(length)?.to_vec())
                }
                CONSTANT_INTEGER => ConstantPoolEntry::IntegerOrLong(reader.read_u32()? as i32 as i64),
                CONSTANT_FLOAT => ConstantPoolEntry::Float(reader.read_u32()?),
                CONSTANT_LONG => ConstantPoolEntry::IntegerOrLong(reader.read_u64()? as i64),
                CONSTANT_DOUBLE => ConstantPoolEntry::Double(reader.read_u64()?),
                CONSTANT_CLASS => ConstantPoolEntry::ClassRef {
                    name_index: reader.read_u16()?,
                },
                CONSTANT_STRING => ConstantPoolEntry::StringRef {
                    utf8_index: reader.read_u16()?,
                },
                CONSTANT_FIELDREF | CONSTANT_METHODREF | CONSTANT_INTERFACE_METHODREF => {
                    let kind = match tag {
                        CONSTANT_FIELDREF => MemberKind::Field,
                        CONSTANT_METHODREF => MemberKind::Method,
                        _ => MemberKind::InterfaceMethod,
                    };
                    ConstantPoolEntry::MemberRef {
                        kind,
                        class_index: reader.read_u16()?,
                        name_and_type_index: reader.read_u16()?,
                    }
                }
                CONSTANT_NAME_AND_TYPE => ConstantPoolEntry::NameAndType {
                    name_index: reader.read_u16()?,
                    descriptor_index: reader.read_u16()?,
                },
                CONSTANT_METHOD_HANDLE => ConstantPoolEntry::MethodHandle {
                    reference_kind: reader.read_u8()?,
                    reference_index: reader.read_u16()?,
                },
                CONSTANT_METHOD_TYPE => ConstantPoolEntry::MethodType {
                    descriptor_index: reader.read_u16()?,
                },
                CONSTANT_DYNAMIC | CONSTANT_INVOKE_DYNAMIC => ConstantPoolEntry::Dynamic {
                    bootstrap_method_attr_index: reader.read_u16()?,
                    name_and_type_index: reader.read_u16()?,
                },
                CONSTANT_MODULE | CONSTANT_PACKAGE => ConstantPoolEntry::Named {
                    name_index: reader.read_u16()?,
                },
                _ => return Err(Error::UnknownConstantTag { tag, index }),
            };
            entries.push(entry);
            index += 1;

            // Eight-byte constants take up two entries in the pool.
            if matches!(tag, CONSTANT_LONG | CONSTANT_DOUBLE) {
                entries.push(ConstantPoolEntry::Reserved);
                index += 1;
            }
        }
        Ok(ConstantPool { entries })
    }

    fn parse_member(
        reader: &mut ByteReader,
        constant_pool: &ConstantPool,
    ) -> Result<(u16, String, String, Vec<Attribute>)> {
        let access_flags = reader.read_u16()?;
        let name = constant_pool.utf8_str(reader.read_u16()?)?.to_string();
        let descriptor = constant_pool.utf8_str(reader.read_u16()?)?.to_string();
        let attributes = Self::parse_attributes(reader, constant_pool)?;
        Ok((access_flags, name, descriptor, attributes))
    }

    fn parse_attributes(
        reader: &mut ByteReader,
        constant_pool: &ConstantPool,
    ) -> Result<Vec<Attribute>> {
        let count = reader.read_u16()?;
        let mut attributes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = constant_pool.utf8_str(reader.read_u16()?)?.to_string();
            let length = reader.read_u32()? as usize;
            let info = reader.read_bytes(length)?.to_vec();
            attributes.push(Attribute { name, info });
        }
        Ok(attributes)
    }
}

/// Reads a class file from disk.
pub fn read_class_file(path: &Path) -> Result<Vec<u8>> {
    Ok(std::fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ClassAssembler;

    use proptest::prelude::*;
    use std::io::Write;

    fn hello_class() -> Vec<u8> {
        let mut asm = ClassAssembler::new("Hello");
        let println = asm.method_ref("java/io/PrintStream", "println", "(Ljava/lang/String;)V");
        let out = asm.field_ref("java/lang/System", "out", "Ljava/io/PrintStream;");
        let hi = asm.string("hi");
        let mut code = vec![0x12, hi as u8, 0xb2];
        code.extend(out.to_be_bytes());
        code.push(0xb6);
        code.extend(println.to_be_bytes());
        code.push(0xb1);
        asm.field("count", "I");
        asm.static_method("main", "([Ljava/lang/String;)V", 2, 1, &code);
        asm.finish()
    }

    #[test]
    fn can_you_read_class_file() {
        let bytes = hello_class();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        let buffer = read_class_file(file.path()).unwrap();
        assert_eq!(0xcafebabe, u32::from_be_bytes(buffer[..4].try_into().unwrap()));

        let class = JVMParser::parse(&buffer).unwrap();
        assert_eq!(class.name, "Hello");
        assert_eq!(class.super_name.as_deref(), Some("java/lang/Object"));
        assert_eq!(class.fields.len(), 1);
        assert_eq!(class.fields[0].name, "count");
        assert_eq!(*class.fields[0].field_type, TypeDescriptor::Int);
        assert_eq!(class.methods.len(), 1);
        assert_eq!(class.methods[0].name, "main");
        assert!(class.methods[0].is_static());
        assert_eq!(class.methods[0].parameters().len(), 1);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_class_file(&dir.path().join("Missing.class"));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn truncated_class_is_rejected() {
        let bytes = hello_class();
        for cut in [2, 9, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                matches!(
                    JVMParser::parse(&bytes[..cut]),
                    Err(Error::UnexpectedEndOfInput { .. })
                ),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn unknown_constant_tag_is_fatal() {
        let mut bytes = hello_class();
        // first entry tag sits right after magic, versions and count
        bytes[10] = 2;
        assert!(matches!(
            JVMParser::parse(&bytes),
            Err(Error::UnknownConstantTag { tag: 2, index: 1 })
        ));
    }

    #[test]
    fn long_constants_take_two_slots() {
        let mut asm = ClassAssembler::new("Longs");
        let long = asm.long(1 << 40);
        let after = asm.utf8("after");
        asm.static_method("main", "()V", 0, 0, &[0xb1]);
        let class = JVMParser::parse(&asm.finish()).unwrap();
        let pool = &class.constant_pool;
        assert_eq!(
            pool.get(long).unwrap(),
            &ConstantPoolEntry::IntegerOrLong(1 << 40)
        );
        assert_eq!(pool.get(long + 1).unwrap(), &ConstantPoolEntry::Reserved);
        assert_eq!(after, long + 2);
        assert_eq!(pool.utf8(after).unwrap(), b"after");
    }

    #[test]
    fn constant_pool_index_checks() {
        let class = JVMParser::parse(&hello_class()).unwrap();
        let pool = &class.constant_pool;
        assert!(matches!(pool.get(0), Err(Error::InvalidConstantIndex { index: 0 })));
        let past = pool.len() as u16 + 1;
        assert!(pool.get(past).is_err());
        assert!(pool.get(pool.len() as u16).is_ok());
    }

    #[test]
    fn code_is_decoded_once() {
        let class = JVMParser::parse(&hello_class()).unwrap();
        let main = &class.methods[0];
        assert!(!main.has_decoded_code());
        let first = main.code().unwrap() as *const Code;
        let second = main.code().unwrap() as *const Code;
        assert_eq!(first, second);
        assert!(main.has_decoded_code());
        let code = main.code().unwrap();
        assert_eq!((code.max_stack, code.max_locals), (2, 1));
        assert_eq!(code.bytecode.last(), Some(&0xb1));
    }

    #[test]
    fn parameter_slots_account_for_receiver_and_longs() {
        let mut asm = ClassAssembler::new("Slots");
        asm.static_method("s", "(IJI)V", 0, 4, &[0xb1]);
        asm.method("v", "(JI)V", 0, 4, &[0xb1]);
        let class = JVMParser::parse(&asm.finish()).unwrap();
        assert_eq!(class.methods[0].parameter_slots(), vec![0, 1, 3]);
        assert_eq!(class.methods[1].parameter_slots(), vec![1, 3]);
    }

    proptest! {
        #[test]
        fn bad_magic_is_malformed(magic in any::<u32>()) {
            prop_assume!(magic != MAGIC);
            let mut bytes = hello_class();
            bytes[..4].copy_from_slice(&magic.to_be_bytes());
            let rejected = matches!(
                JVMParser::parse(&bytes),
                Err(Error::MalformedClassFile { magic: m }) if m == magic
            );
            prop_assert!(rejected);
        }

        #[test]
        fn utf8_entries_round_trip(text in "[a-zA-Z0-9_/ ]{0,40}") {
            let mut asm = ClassAssembler::new("Text");
            let index = asm.utf8(&text);
            let bytes = asm.finish();
            let class = JVMParser::parse(&bytes).unwrap();
            let parsed = class.constant_pool.utf8(index).unwrap();
            prop_assert_eq!(parsed, text.as_bytes());
            // the same bytes occur verbatim in the file
            let found = bytes
                .windows(parsed.len() + 2)
                .any(|w| w[..2] == (parsed.len() as u16).to_be_bytes() && &w[2..] == parsed);
            prop_assert!(found);
        }
    }
}
