//! Type descriptors for fields and methods.
//!
//! Descriptors are decoded into trees of [`TypeDescriptor`]. Composite nodes
//! (arrays, functions) own their children while primitive leaves are shared
//! with the [`TypeRegistry`], so two `int` descriptors anywhere in a class
//! point at the same allocation.
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::error::{Error, Result};

/// JVM value type as written in a descriptor string.
#[derive(Debug, PartialEq, Eq)]
pub enum TypeDescriptor {
    Void,
    Bool,
    Byte,
    Char,
    Short,
    Int,
    Long,
    /// Parsed so that classes mentioning it still load; never executed.
    Float,
    Double,
    Array(Arc<TypeDescriptor>),
    Class(String),
    Function {
        parameters: Vec<Arc<TypeDescriptor>>,
        ret: Arc<TypeDescriptor>,
    },
}

impl TypeDescriptor {
    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Returns true for every type carried by the integer lane.
    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            Self::Bool | Self::Byte | Self::Char | Self::Short | Self::Int | Self::Long
        )
    }

    /// Returns true for array and class types.
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Array(_) | Self::Class(_))
    }

    /// Returns the number of local variable slots a value of this type
    /// occupies.
    pub fn slot_size(&self) -> usize {
        match self {
            Self::Void | Self::Function { .. } => 0,
            Self::Long | Self::Double => 2,
            _ => 1,
        }
    }

    /// Fails with `UnsupportedType` if a floating-point type appears
    /// anywhere in this type.
    pub fn ensure_supported(&self) -> Result<()> {
        match self {
            Self::Float => Err(Error::UnsupportedType { tag: 'F' }),
            Self::Double => Err(Error::UnsupportedType { tag: 'D' }),
            Self::Array(element) => element.ensure_supported(),
            Self::Function { parameters, ret } => {
                for parameter in parameters {
                    parameter.ensure_supported()?;
                }
                ret.ensure_supported()
            }
            _ => Ok(()),
        }
    }

    /// Parameter types of a function type, empty for anything else.
    pub fn parameters(&self) -> &[Arc<TypeDescriptor>] {
        match self {
            Self::Function { parameters, .. } => parameters,
            _ => &[],
        }
    }

    /// Return type of a function type.
    pub fn return_type(&self) -> Option<&TypeDescriptor> {
        match self {
            Self::Function { ret, .. } => Some(ret.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Void => write!(f, "V"),
            Self::Bool => write!(f, "Z"),
            Self::Byte => write!(f, "B"),
            Self::Char => write!(f, "C"),
            Self::Short => write!(f, "S"),
            Self::Int => write!(f, "I"),
            Self::Long => write!(f, "J"),
            Self::Float => write!(f, "F"),
            Self::Double => write!(f, "D"),
            Self::Array(element) => write!(f, "[{element}"),
            Self::Class(name) => write!(f, "L{name};"),
            Self::Function { parameters, ret } => {
                write!(f, "(")?;
                for parameter in parameters {
                    write!(f, "{parameter}")?;
                }
                write!(f, "){ret}")
            }
        }
    }
}

/// Immutable table of the primitive type singletons. Built once and shared
/// by reference; parsing never allocates a primitive leaf.
#[derive(Debug)]
pub struct TypeRegistry {
    void: Arc<TypeDescriptor>,
    bool_: Arc<TypeDescriptor>,
    byte: Arc<TypeDescriptor>,
    char_: Arc<TypeDescriptor>,
    short: Arc<TypeDescriptor>,
    int: Arc<TypeDescriptor>,
    long: Arc<TypeDescriptor>,
    float: Arc<TypeDescriptor>,
    double: Arc<TypeDescriptor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            void: Arc::new(TypeDescriptor::Void),
            bool_: Arc::new(TypeDescriptor::Bool),
            byte: Arc::new(TypeDescriptor::Byte),
            char_: Arc::new(TypeDescriptor::Char),
            short: Arc::new(TypeDescriptor::Short),
            int: Arc::new(TypeDescriptor::Int),
            long: Arc::new(TypeDescriptor::Long),
            float: Arc::new(TypeDescriptor::Float),
            double: Arc::new(TypeDescriptor::Double),
        }
    }

    /// Process-wide registry used by [`crate::jvm::JVMParser::parse`].
    pub fn global() -> &'static TypeRegistry {
        static REGISTRY: OnceLock<TypeRegistry> = OnceLock::new();
        REGISTRY.get_or_init(TypeRegistry::new)
    }

    pub fn void(&self) -> &Arc<TypeDescriptor> {
        &self.void
    }

    pub fn int(&self) -> &Arc<TypeDescriptor> {
        &self.int
    }

    pub fn long(&self) -> &Arc<TypeDescriptor> {
        &self.long
    }

    /// Returns the shared instance for a primitive tag.
    pub fn primitive(&self, tag: u8) -> Option<&Arc<TypeDescriptor>> {
        match tag {
            b'V' => Some(&self.void),
            b'Z' => Some(&self.bool_),
            b'B' => Some(&self.byte),
            b'C' => Some(&self.char_),
            b'S' => Some(&self.short),
            b'I' => Some(&self.int),
            b'J' => Some(&self.long),
            b'F' => Some(&self.float),
            b'D' => Some(&self.double),
            _ => None,
        }
    }

    /// Parse a field or method descriptor.
    pub fn parse(&self, descriptor: &str) -> Result<Arc<TypeDescriptor>> {
        if descriptor.starts_with('(') {
            self.parse_method(descriptor)
        } else {
            self.parse_field(descriptor)
        }
    }

    /// Parse a field descriptor, the whole string must be consumed.
    pub fn parse_field(&self, descriptor: &str) -> Result<Arc<TypeDescriptor>> {
        let mut cursor = DescriptorCursor::new(self, descriptor);
        let t = cursor.field()?;
        cursor.finish()?;
        Ok(t)
    }

    /// Parse a method descriptor into a `Function` type.
    pub fn parse_method(&self, descriptor: &str) -> Result<Arc<TypeDescriptor>> {
        let caps = method_pattern()
            .captures(descriptor)
            .ok_or_else(|| invalid(descriptor, "expected `(params)return`"))?;
        let params = caps.get(1).map_or("", |m| m.as_str());
        let ret = caps.get(2).map_or("", |m| m.as_str());

        let mut parameters = Vec::new();
        let mut cursor = DescriptorCursor::new(self, params);
        while !cursor.at_end() {
            parameters.push(cursor.field()?);
        }

        let ret = if ret == "V" {
            self.void.clone()
        } else {
            self.parse_field(ret).map_err(|err| rebase(err, descriptor))?
        };

        Ok(Arc::new(TypeDescriptor::Function { parameters, ret }))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn method_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\(([^)]*)\)(.+)$").expect("method descriptor pattern is valid")
    })
}

fn invalid(descriptor: &str, reason: &str) -> Error {
    Error::InvalidDescriptor {
        descriptor: descriptor.to_string(),
        reason: reason.to_string(),
    }
}

// Report errors from a sub-descriptor against the full descriptor.
fn rebase(err: Error, descriptor: &str) -> Error {
    match err {
        Error::InvalidDescriptor { reason, .. } => invalid(descriptor, &reason),
        other => other,
    }
}

/// Left-to-right cursor implementing the field descriptor grammar.
struct DescriptorCursor<'r, 's> {
    registry: &'r TypeRegistry,
    descriptor: &'s str,
    pos: usize,
}

impl<'r, 's> DescriptorCursor<'r, 's> {
    fn new(registry: &'r TypeRegistry, descriptor: &'s str) -> Self {
        Self {
            registry,
            descriptor,
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.descriptor.len()
    }

    fn finish(&self) -> Result<()> {
        if self.at_end() {
            Ok(())
        } else {
            Err(invalid(self.descriptor, "trailing characters"))
        }
    }

    fn field(&mut self) -> Result<Arc<TypeDescriptor>> {
        let tag = *self
            .descriptor
            .as_bytes()
            .get(self.pos)
            .ok_or_else(|| invalid(self.descriptor, "unexpected end"))?;
        self.pos += 1;

        match tag {
            b'V' => Err(invalid(self.descriptor, "void is only valid as a return type")),
            b'[' => {
                let element = self.field()?;
                Ok(Arc::new(TypeDescriptor::Array(element)))
            }
            b'L' => {
                let rest = &self.descriptor[self.pos..];
                let end = rest
                    .find(';')
                    .ok_or_else(|| invalid(self.descriptor, "unterminated class name"))?;
                if end == 0 {
                    return Err(invalid(self.descriptor, "empty class name"));
                }
                let name = rest[..end].to_string();
                self.pos += end + 1;
                Ok(Arc::new(TypeDescriptor::Class(name)))
            }
            _ => self
                .registry
                .primitive(tag)
                .cloned()
                .ok_or_else(|| invalid(self.descriptor, "unknown type tag")),
        }
    }
}

/// Element kinds for primitive arrays created by `newarray`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayType {
    Bool,
    Char,
    Byte,
    Short,
    Int,
    Long,
}

impl ArrayType {
    /// Decode the `atype` operand of `newarray`.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            4 => Ok(Self::Bool),
            5 => Ok(Self::Char),
            8 => Ok(Self::Byte),
            9 => Ok(Self::Short),
            10 => Ok(Self::Int),
            11 => Ok(Self::Long),
            _ => Err(Error::UnsupportedArrayType { tag }),
        }
    }

    /// Element size in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Bool | Self::Byte => 1,
            Self::Char | Self::Short => 2,
            Self::Int => 4,
            Self::Long => 8,
        }
    }

    /// Narrow a 64-bit integer to the element's natural width and widen it
    /// back, which is what a store followed by a load observes.
    pub fn narrow(self, value: i64) -> i64 {
        match self {
            Self::Bool | Self::Byte => value as i8 as i64,
            Self::Char => value as u16 as i64,
            Self::Short => value as i16 as i64,
            Self::Int => value as i32 as i64,
            Self::Long => value,
        }
    }
}

impl fmt::Display for ArrayType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Char => "char",
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_main_descriptor() {
        let types = TypeRegistry::new();
        let t = types.parse("([Ljava/lang/String;)V").unwrap();
        let expected = TypeDescriptor::Function {
            parameters: vec![Arc::new(TypeDescriptor::Array(Arc::new(
                TypeDescriptor::Class("java/lang/String".to_string()),
            )))],
            ret: Arc::new(TypeDescriptor::Void),
        };
        assert_eq!(*t, expected);
        assert_eq!(t.to_string(), "([Ljava/lang/String;)V");
    }

    #[test]
    fn primitive_leaves_are_shared() {
        let types = TypeRegistry::new();
        let t = types.parse("(IJ[I)I").unwrap();
        let params = t.parameters();
        assert_eq!(params.len(), 3);
        assert!(Arc::ptr_eq(&params[0], types.int()));
        assert!(Arc::ptr_eq(&params[1], types.long()));
        match &*params[2] {
            TypeDescriptor::Array(element) => assert!(Arc::ptr_eq(element, types.int())),
            other => panic!("expected array, got {other:?}"),
        }
        let field = types.parse("I").unwrap();
        assert!(Arc::ptr_eq(&field, types.int()));
    }

    #[test]
    fn nested_arrays_and_classes() {
        let types = TypeRegistry::new();
        let t = types.parse("[[Ljava/lang/Object;").unwrap();
        assert_eq!(t.to_string(), "[[Ljava/lang/Object;");
        let f = types.parse("(Ljava/lang/String;ZBSC)J").unwrap();
        assert_eq!(f.parameters().len(), 5);
        assert_eq!(f.return_type(), Some(&TypeDescriptor::Long));
    }

    #[test]
    fn floating_point_parses_but_is_flagged() {
        let types = TypeRegistry::new();
        let method = types.parse("(IF)V").unwrap();
        assert_eq!(method.to_string(), "(IF)V");
        assert!(matches!(
            method.ensure_supported(),
            Err(Error::UnsupportedType { tag: 'F' })
        ));
        let array = types.parse("[D").unwrap();
        assert!(matches!(
            array.ensure_supported(),
            Err(Error::UnsupportedType { tag: 'D' })
        ));
        assert_eq!(types.parse("D").unwrap().slot_size(), 2);
        assert!(types.parse("(J[ILjava/lang/String;)I").unwrap().ensure_supported().is_ok());
    }

    #[test]
    fn malformed_descriptors() {
        let types = TypeRegistry::new();
        for bad in ["", "Ljava/lang/String", "(I", "(I)", "II", "L;", "(V)V", "Q", "()VV"] {
            assert!(types.parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn slot_sizes() {
        let types = TypeRegistry::new();
        assert_eq!(types.parse("J").unwrap().slot_size(), 2);
        assert_eq!(types.parse("[J").unwrap().slot_size(), 1);
        assert_eq!(types.void().slot_size(), 0);
    }

    #[test]
    fn array_narrowing() {
        assert_eq!(ArrayType::Byte.narrow(0x1ff), -1);
        assert_eq!(ArrayType::Char.narrow(-1), 0xffff);
        assert_eq!(ArrayType::Short.narrow(0x18000), -0x8000);
        assert_eq!(ArrayType::Int.narrow(1 << 32 | 7), 7);
        assert_eq!(ArrayType::Long.narrow(i64::MIN), i64::MIN);
        assert!(ArrayType::from_tag(6).is_err());
        assert_eq!(ArrayType::from_tag(10).unwrap().size(), 4);
    }
}
