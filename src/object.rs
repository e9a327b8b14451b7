// File: src/object.rs
//
// Heap object variants for the Lox runtime.
// Every value that lives on the managed heap is one of these variants; the
// collector in memory.rs owns their storage and traces the references they
// carry.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// Handle to a heap object.
///
/// Handles are stable for the lifetime of the object: the arena never moves a
/// live object, and a slot is only reused after a sweep has freed it. Two
/// handles are equal exactly when they name the same object, which is also
/// Lox string equality thanks to interning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Host function callable from Lox code.
///
/// Receives the argument slots currently on the VM stack; the VM has already
/// checked the arity against the declared one.
pub type NativeFn = fn(&[Value]) -> Value;

/// A heap-allocated Lox object.
#[derive(Debug)]
pub enum Obj {
    String(LoxString),
    Function(Function),
    Native(Native),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

/// An interned string. The hash is cached at creation so table probes and
/// re-interning never rescan the bytes.
#[derive(Debug)]
pub struct LoxString {
    pub chars: String,
    pub hash: u32,
}

/// A compiled function: its bytecode plus the metadata the VM needs to build
/// call frames and closures over it.
#[derive(Debug)]
pub struct Function {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// Interned name, or `None` for the top-level script.
    pub name: Option<ObjRef>,
}

impl Function {
    pub fn new(name: Option<ObjRef>) -> Self {
        Function { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name }
    }
}

/// A host function registered through `Vm::define_native`.
#[derive(Debug)]
pub struct Native {
    pub function: NativeFn,
    pub arity: usize,
}

/// A function together with the upvalues it captured.
///
/// The upvalue list is filled in by the CLOSURE instruction after the closure
/// itself is allocated, so a partially built closure is always reachable from
/// the stack while its captures are being resolved.
#[derive(Debug)]
pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable.
///
/// Open upvalues point at a live stack slot; when that slot is discarded the
/// VM closes the upvalue by moving the value inline.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

/// A class: its name and the method table populated by METHOD instructions.
#[derive(Debug)]
pub struct Class {
    pub name: ObjRef,
    pub methods: Table,
}

/// An instance of a class with its own field table.
#[derive(Debug)]
pub struct Instance {
    pub class: ObjRef,
    pub fields: Table,
}

/// A method closure paired with the receiver it was accessed on.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

impl Obj {
    /// Approximate heap footprint, used to pace collections. Recorded at
    /// allocation time; later growth of embedded tables is not tracked.
    pub fn size(&self) -> usize {
        let payload = match self {
            Obj::String(s) => s.chars.len(),
            Obj::Function(f) => {
                f.chunk.code.len()
                    + f.chunk.lines.len() * std::mem::size_of::<usize>()
                    + f.chunk.constants.len() * std::mem::size_of::<Value>()
            }
            Obj::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjRef>(),
            Obj::Native(_) | Obj::Upvalue(_) | Obj::Class(_) | Obj::Instance(_)
            | Obj::BoundMethod(_) => 0,
        };
        std::mem::size_of::<Obj>() + payload
    }
}

/// FNV-1a over the string bytes; 32-bit offset basis and prime.
pub fn hash_str(text: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in text.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}
