// File: src/memory.rs
//
// Managed heap and mark-sweep collector for the Lox VM.
// Objects live in an arena of stable slots; handles index into it and a free
// list recycles swept slots. Collection is precise: callers mark their roots
// through the marking API, then collect() traces the grey worklist, drops
// dead intern-pool keys, and sweeps.

use crate::object::{hash_str, BoundMethod, Class, Closure, Function, Instance, LoxString, Native, Obj, ObjRef, Upvalue};
use crate::table::Table;
use crate::value::Value;

/// First collection threshold.
const FIRST_GC: usize = 1024 * 1024;
/// The next threshold is the surviving heap size times this factor.
const HEAP_GROW_FACTOR: usize = 2;

struct Slot {
    marked: bool,
    /// Footprint recorded at allocation; subtracted again on free.
    size: usize,
    obj: Obj,
}

/// The managed heap: object storage, allocation accounting, the string
/// intern pool, and the collector's worklist.
pub struct Heap {
    objects: Vec<Option<Slot>>,
    free_slots: Vec<u32>,
    /// Intern pool. Keys are the canonical strings and are weak: an entry is
    /// removed when its key is unmarked at collection time.
    strings: Table,
    /// Handles marked at the start of every collection regardless of other
    /// roots (canonical strings such as "init").
    pinned: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    grey_stack: Vec<ObjRef>,
    /// Reusable buffer for an object's outgoing references, so tracing
    /// itself performs no per-object allocation in the steady state.
    mark_scratch: Vec<Value>,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: Vec::new(),
            free_slots: Vec::new(),
            strings: Table::new(),
            pinned: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC,
            grey_stack: Vec::new(),
            mark_scratch: Vec::new(),
        }
    }

    /// Whether the caller should mark roots and collect before the next
    /// allocation.
    pub fn should_collect(&self) -> bool {
        cfg!(feature = "stress_gc") || self.bytes_allocated > self.next_gc
    }

    /// Place an object in the arena. Never collects; callers that may be
    /// over the threshold collect first, while the object's own references
    /// are still rooted.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let size = obj.size();
        self.bytes_allocated += size;
        let slot = Slot { marked: false, size, obj };
        let r = match self.free_slots.pop() {
            Some(index) => {
                self.objects[index as usize] = Some(slot);
                ObjRef(index)
            }
            None => {
                self.objects.push(Some(slot));
                ObjRef((self.objects.len() - 1) as u32)
            }
        };
        #[cfg(feature = "log_gc")]
        eprintln!("{:>8} allocate {} bytes", r.0, size);
        r
    }

    /// Intern a string: return the canonical handle for these bytes,
    /// allocating and pooling a new string only when none exists.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        let hash = hash_str(text);
        if let Some(existing) = self.find_interned(text, hash) {
            return existing;
        }
        let r = self.alloc(Obj::String(LoxString { chars: text.to_string(), hash }));
        self.strings.set(r, hash, Value::Nil);
        r
    }

    /// Keep a handle alive across every future collection.
    pub fn pin(&mut self, r: ObjRef) {
        self.pinned.push(r);
    }

    /// Number of live objects; collection pacing and tests use this.
    pub fn object_count(&self) -> usize {
        self.objects.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Probe the intern pool by length, hash, then bytes. This is the one
    /// lookup that compares string contents; every later lookup of the same
    /// bytes hits handle identity instead.
    fn find_interned(&self, text: &str, hash: u32) -> Option<ObjRef> {
        if self.strings.is_empty() {
            return None;
        }
        let entries = &self.strings.entries;
        let capacity = entries.len();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return None;
                    }
                }
                Some(key) => {
                    let s = self.string(key);
                    if s.hash == hash && s.chars.len() == text.len() && s.chars == text {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    // --- Typed accessors -------------------------------------------------
    //
    // The compiler only emits instructions whose operand types it has
    // established, so a tag mismatch here is a corrupted chunk, not a user
    // error.

    pub fn obj(&self, r: ObjRef) -> &Obj {
        match &self.objects[r.index()] {
            Some(slot) => &slot.obj,
            None => panic!("use of freed object {}", r.0),
        }
    }

    fn obj_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.objects[r.index()] {
            Some(slot) => &mut slot.obj,
            None => panic!("use of freed object {}", r.0),
        }
    }

    pub fn string(&self, r: ObjRef) -> &LoxString {
        match self.obj(r) {
            Obj::String(s) => s,
            other => panic!("expected string, found {:?}", other),
        }
    }

    pub fn str(&self, r: ObjRef) -> &str {
        &self.string(r).chars
    }

    pub fn string_hash(&self, r: ObjRef) -> u32 {
        self.string(r).hash
    }

    pub fn function(&self, r: ObjRef) -> &Function {
        match self.obj(r) {
            Obj::Function(f) => f,
            other => panic!("expected function, found {:?}", other),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &Closure {
        match self.obj(r) {
            Obj::Closure(c) => c,
            other => panic!("expected closure, found {:?}", other),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut Closure {
        match self.obj_mut(r) {
            Obj::Closure(c) => c,
            other => panic!("expected closure, found {:?}", other),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &Upvalue {
        match self.obj(r) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, found {:?}", other),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut Upvalue {
        match self.obj_mut(r) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, found {:?}", other),
        }
    }

    pub fn class(&self, r: ObjRef) -> &Class {
        match self.obj(r) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {:?}", other),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut Class {
        match self.obj_mut(r) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {:?}", other),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &Instance {
        match self.obj(r) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {:?}", other),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut Instance {
        match self.obj_mut(r) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {:?}", other),
        }
    }

    pub fn bound_method(&self, r: ObjRef) -> &BoundMethod {
        match self.obj(r) {
            Obj::BoundMethod(b) => b,
            other => panic!("expected bound method, found {:?}", other),
        }
    }

    pub fn native(&self, r: ObjRef) -> &Native {
        match self.obj(r) {
            Obj::Native(n) => n,
            other => panic!("expected native, found {:?}", other),
        }
    }

    /// Copy the superclass method table into the subclass; the INHERIT
    /// instruction runs this before the subclass declares its own methods,
    /// so subclass definitions override.
    pub fn copy_class_methods(&mut self, superclass: ObjRef, subclass: ObjRef) {
        let methods = self.class(superclass).methods.clone();
        self.class_mut(subclass).methods.add_all(&methods);
    }

    // --- Marking ---------------------------------------------------------

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    /// Grey an object: set its mark bit and queue it for tracing. Already
    /// marked objects are skipped, which terminates cycles.
    pub fn mark_object(&mut self, r: ObjRef) {
        if let Some(slot) = &mut self.objects[r.index()] {
            if slot.marked {
                return;
            }
            slot.marked = true;
            #[cfg(feature = "log_gc")]
            eprintln!("{:>8} mark", r.0);
            self.grey_stack.push(r);
        }
    }

    /// Mark every key and value of a table.
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    // --- Collection ------------------------------------------------------

    /// Trace everything reachable from the already-marked roots, drop dead
    /// intern-pool entries, sweep, and reset the growth threshold. Callers
    /// mark their roots first; pinned handles are marked here.
    pub fn collect(&mut self) {
        #[cfg(feature = "log_gc")]
        let before = self.bytes_allocated;
        #[cfg(feature = "log_gc")]
        eprintln!("-- gc begin");

        for i in 0..self.pinned.len() {
            let r = self.pinned[i];
            self.mark_object(r);
        }
        self.trace_references();
        self.remove_unmarked_strings();
        self.sweep();
        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;

        #[cfg(feature = "log_gc")]
        eprintln!(
            "-- gc end: collected {} bytes (from {} to {}), next at {}",
            before - self.bytes_allocated,
            before,
            self.bytes_allocated,
            self.next_gc
        );
    }

    fn trace_references(&mut self) {
        while let Some(r) = self.grey_stack.pop() {
            self.blacken(r);
        }
    }

    /// Blacken one grey object: mark everything it references. The
    /// per-variant reference sets are the whole of the object graph.
    fn blacken(&mut self, r: ObjRef) {
        #[cfg(feature = "log_gc")]
        eprintln!("{:>8} blacken", r.0);

        let mut pending = std::mem::take(&mut self.mark_scratch);
        if let Some(slot) = &self.objects[r.index()] {
            match &slot.obj {
                // Strings and natives hold no further references.
                Obj::String(_) | Obj::Native(_) => {}
                Obj::Function(f) => {
                    if let Some(name) = f.name {
                        pending.push(Value::Obj(name));
                    }
                    pending.extend(f.chunk.constants.iter().copied());
                }
                Obj::Closure(c) => {
                    pending.push(Value::Obj(c.function));
                    pending.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
                }
                // An open upvalue's slot is itself a stack root, so only the
                // closed value needs tracing.
                Obj::Upvalue(Upvalue::Open(_)) => {}
                Obj::Upvalue(Upvalue::Closed(value)) => pending.push(*value),
                Obj::Class(k) => {
                    pending.push(Value::Obj(k.name));
                    for (key, value) in k.methods.iter() {
                        pending.push(Value::Obj(key));
                        pending.push(value);
                    }
                }
                Obj::Instance(i) => {
                    pending.push(Value::Obj(i.class));
                    for (key, value) in i.fields.iter() {
                        pending.push(Value::Obj(key));
                        pending.push(value);
                    }
                }
                Obj::BoundMethod(b) => {
                    pending.push(b.receiver);
                    pending.push(Value::Obj(b.method));
                }
            }
        }
        for value in pending.drain(..) {
            self.mark_value(value);
        }
        self.mark_scratch = pending;
    }

    /// The intern pool must not outlive its strings: tombstone every entry
    /// whose key is about to be swept.
    fn remove_unmarked_strings(&mut self) {
        for entry in &mut self.strings.entries {
            if let Some(key) = entry.key {
                let dead = match &self.objects[key.index()] {
                    Some(slot) => !slot.marked,
                    None => true,
                };
                if dead {
                    entry.key = None;
                    entry.hash = 0;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }

    /// Free every unmarked object and clear the mark bit on survivors.
    fn sweep(&mut self) {
        for (index, slot) in self.objects.iter_mut().enumerate() {
            match slot {
                Some(entry) if entry.marked => entry.marked = false,
                Some(entry) => {
                    #[cfg(feature = "log_gc")]
                    eprintln!("{:>8} free {} bytes", index, entry.size);
                    self.bytes_allocated -= entry.size;
                    *slot = None;
                    self.free_slots.push(index as u32);
                }
                None => {}
            }
        }
    }

    // --- Display ---------------------------------------------------------

    /// Render a value the way `print` and the disassembler show it.
    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Obj(r) => match self.obj(r) {
                Obj::String(s) => s.chars.clone(),
                Obj::Function(f) => self.format_function_name(f),
                Obj::Native(_) => "<native fn>".to_string(),
                Obj::Closure(c) => self.format_function_name(self.function(c.function)),
                Obj::Upvalue(_) => "upvalue".to_string(),
                Obj::Class(k) => self.str(k.name).to_string(),
                Obj::Instance(i) => {
                    format!("{} instance", self.str(self.class(i.class).name))
                }
                Obj::BoundMethod(b) => {
                    let closure = self.closure(b.method);
                    self.format_function_name(self.function(closure.function))
                }
            },
        }
    }

    fn format_function_name(&self, function: &Function) -> String {
        match function.name {
            Some(name) => format!("<fn {}>", self.str(name)),
            None => "<script>".to_string(),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}
