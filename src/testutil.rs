//! In-memory class file assembler for tests.
use std::collections::HashMap;

use crate::jvm::{ACC_STATIC, MAGIC};

const ACC_PUBLIC: u16 = 0x0001;

/// Builds the bytes of a class file: a constant pool with interning,
/// fields, and methods carrying a `Code` attribute.
pub struct ClassAssembler {
    pool: Vec<u8>,
    next_index: u16,
    interned: HashMap<(u8, Vec<u8>), u16>,
    this_class: u16,
    super_class: u16,
    fields: Vec<u8>,
    field_count: u16,
    methods: Vec<u8>,
    method_count: u16,
}

impl ClassAssembler {
    pub fn new(name: &str) -> Self {
        let mut asm = Self {
            pool: Vec::new(),
            next_index: 1,
            interned: HashMap::new(),
            this_class: 0,
            super_class: 0,
            fields: Vec::new(),
            field_count: 0,
            methods: Vec::new(),
            method_count: 0,
        };
        asm.this_class = asm.class(name);
        asm.super_class = asm.class("java/lang/Object");
        asm
    }

    fn entry(&mut self, tag: u8, payload: Vec<u8>, width: u16) -> u16 {
        let key = (tag, payload);
        if let Some(index) = self.interned.get(&key) {
            return *index;
        }
        let index = self.next_index;
        self.pool.push(tag);
        self.pool.extend(&key.1);
        self.next_index += width;
        self.interned.insert(key, index);
        index
    }

    pub fn utf8(&mut self, text: &str) -> u16 {
        let mut payload = (text.len() as u16).to_be_bytes().to_vec();
        payload.extend(text.as_bytes());
        self.entry(1, payload, 1)
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        self.entry(3, value.to_be_bytes().to_vec(), 1)
    }

    pub fn long(&mut self, value: i64) -> u16 {
        self.entry(5, value.to_be_bytes().to_vec(), 2)
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name = self.utf8(name);
        self.entry(7, name.to_be_bytes().to_vec(), 1)
    }

    pub fn string(&mut self, text: &str) -> u16 {
        let utf8 = self.utf8(text);
        self.entry(8, utf8.to_be_bytes().to_vec(), 1)
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        let mut payload = name.to_be_bytes().to_vec();
        payload.extend(descriptor.to_be_bytes());
        self.entry(12, payload, 1)
    }

    fn member_ref(&mut self, tag: u8, class: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.class(class);
        let nat = self.name_and_type(name, descriptor);
        let mut payload = class.to_be_bytes().to_vec();
        payload.extend(nat.to_be_bytes());
        self.entry(tag, payload, 1)
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.member_ref(9, class, name, descriptor)
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.member_ref(10, class, name, descriptor)
    }

    /// `System.out` and `PrintStream.println` for the given descriptor.
    pub fn println(&mut self, descriptor: &str) -> (u16, u16) {
        let out = self.field_ref("java/lang/System", "out", "Ljava/io/PrintStream;");
        let println = self.method_ref("java/io/PrintStream", "println", descriptor);
        (out, println)
    }

    pub fn field(&mut self, name: &str, descriptor: &str) {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        self.fields.extend(ACC_PUBLIC.to_be_bytes());
        self.fields.extend(name.to_be_bytes());
        self.fields.extend(descriptor.to_be_bytes());
        self.fields.extend(0u16.to_be_bytes());
        self.field_count += 1;
    }

    pub fn static_method(
        &mut self,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: &[u8],
    ) {
        self.method_with_flags(
            ACC_PUBLIC | ACC_STATIC,
            name,
            descriptor,
            max_stack,
            max_locals,
            code,
        );
    }

    pub fn method(
        &mut self,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: &[u8],
    ) {
        self.method_with_flags(ACC_PUBLIC, name, descriptor, max_stack, max_locals, code);
    }

    pub fn method_with_flags(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: &[u8],
    ) {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        let code_name = self.utf8("Code");

        let mut info = Vec::new();
        info.extend(max_stack.to_be_bytes());
        info.extend(max_locals.to_be_bytes());
        info.extend((code.len() as u32).to_be_bytes());
        info.extend(code);
        info.extend(0u16.to_be_bytes()); // exception table
        info.extend(0u16.to_be_bytes()); // attributes

        self.methods.extend(access_flags.to_be_bytes());
        self.methods.extend(name.to_be_bytes());
        self.methods.extend(descriptor.to_be_bytes());
        self.methods.extend(1u16.to_be_bytes());
        self.methods.extend(code_name.to_be_bytes());
        self.methods.extend((info.len() as u32).to_be_bytes());
        self.methods.extend(info);
        self.method_count += 1;
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(MAGIC.to_be_bytes());
        out.extend(0u16.to_be_bytes());
        out.extend(52u16.to_be_bytes());
        out.extend(self.next_index.to_be_bytes());
        out.extend(&self.pool);
        out.extend((ACC_PUBLIC | 0x0020).to_be_bytes());
        out.extend(self.this_class.to_be_bytes());
        out.extend(self.super_class.to_be_bytes());
        out.extend(0u16.to_be_bytes()); // interfaces
        out.extend(self.field_count.to_be_bytes());
        out.extend(&self.fields);
        out.extend(self.method_count.to_be_bytes());
        out.extend(&self.methods);
        out.extend(0u16.to_be_bytes()); // attributes
        out
    }
}

/// Bytecode builder with named labels for branch offsets.
#[derive(Default)]
pub struct CodeBuilder {
    bytes: Vec<u8>,
    labels: HashMap<&'static str, usize>,
    fixups: Vec<(usize, usize, &'static str)>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(mut self, opcode: u8) -> Self {
        self.bytes.push(opcode);
        self
    }

    pub fn u8(mut self, opcode: u8, operand: u8) -> Self {
        self.bytes.push(opcode);
        self.bytes.push(operand);
        self
    }

    pub fn u16(mut self, opcode: u8, operand: u16) -> Self {
        self.bytes.push(opcode);
        self.bytes.extend(operand.to_be_bytes());
        self
    }

    pub fn iinc(mut self, index: u8, delta: i8) -> Self {
        self.bytes.extend([0x84, index, delta as u8]);
        self
    }

    /// `bipush` for small constants, `sipush` otherwise.
    pub fn push_int(self, value: i16) -> Self {
        if let Ok(byte) = i8::try_from(value) {
            self.u8(0x10, byte as u8)
        } else {
            self.u16(0x11, value as u16)
        }
    }

    pub fn label(mut self, name: &'static str) -> Self {
        self.labels.insert(name, self.bytes.len());
        self
    }

    pub fn jump(mut self, opcode: u8, label: &'static str) -> Self {
        let at = self.bytes.len();
        self.bytes.extend([opcode, 0, 0]);
        self.fixups.push((at, at + 1, label));
        self
    }

    /// Emits `getstatic System.out`, then `body`, then `invokevirtual
    /// println`, the order javac uses.
    pub fn print(self, out: u16, println: u16, body: impl FnOnce(Self) -> Self) -> Self {
        body(self.u16(0xb2, out)).u16(0xb6, println)
    }

    pub fn finish(mut self) -> Vec<u8> {
        for (at, operand, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label] as i64;
            let delta = (target - at as i64) as i16;
            self.bytes[operand..operand + 2].copy_from_slice(&delta.to_be_bytes());
        }
        self.bytes
    }
}
