use std::{
    fmt,
    hash::{Hash, Hasher},
};

use parking_lot::Mutex;

use crate::{
    Arity, Code, ErrorKind, Future, Gc, NativeFunction, NativeMethod,
    NativeResult, RuntimeError, ScriptMutex, Value, Visitable, Visitor, Vm,
};

/// Result of an attribute lookup. Built-in types expose their methods as
/// static native tables, the Vm binds them to the receiver on access.
#[derive(Debug, Copy, Clone)]
pub enum Attribute {
    Value(Value),
    Method(&'static NativeMethod),
}

/// Capabilities every heap object has. `this` is the handle of the cell the
/// object lives in, identity based defaults use it.
pub trait Object: Visitable {
    fn type_name(&self) -> &'static str;

    fn get_attribute(&self, this: Gc, name: &str) -> Option<Attribute> {
        let _ = (this, name);
        None
    }

    fn set_attribute(
        &self,
        this: Gc,
        name: &str,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let _ = (this, value);
        Err(RuntimeError::attribute(self.type_name(), name))
    }

    fn equal(&self, this: Gc, other: &Value) -> bool {
        other.as_gc().is_some_and(|other| other.ptr_eq(this))
    }

    fn hash(&self, this: Gc) -> u64 {
        this.identity_hash()
    }

    fn str(&self, this: Gc) -> String {
        format!("<{} at {:p}>", self.type_name(), this.as_ptr())
    }
}

/// Every kind of object the collector manages. Native modules add their own
/// types through `Instance`.
pub enum HeapObject {
    Str(Str),
    List(List),
    Function(Code),
    Native(NativeFunction),
    BoundMethod(BoundMethod),
    Future(Future),
    Mutex(ScriptMutex),
    Result(BondResult),
    Error(ErrorObject),
    Instance(Box<dyn Object + Send + Sync>),
}

impl HeapObject {
    pub fn as_object(&self) -> &dyn Object {
        match self {
            HeapObject::Str(s) => s,
            HeapObject::List(l) => l,
            HeapObject::Function(c) => c,
            HeapObject::Native(n) => n,
            HeapObject::BoundMethod(b) => b,
            HeapObject::Future(f) => f,
            HeapObject::Mutex(m) => m,
            HeapObject::Result(r) => r,
            HeapObject::Error(e) => e,
            HeapObject::Instance(i) => i.as_ref(),
        }
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.as_object().type_name()
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeapObject::Str(s) => Some(&s.value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            HeapObject::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_future(&self) -> Option<&Future> {
        match self {
            HeapObject::Future(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_mutex(&self) -> Option<&ScriptMutex> {
        match self {
            HeapObject::Mutex(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_result(&self) -> Option<&BondResult> {
        match self {
            HeapObject::Result(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorObject> {
        match self {
            HeapObject::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapObject::Str(s) => write!(f, "Str({:?})", s.value),
            HeapObject::Error(e) => write!(f, "Error({}: {})", e.kind, e.message),
            other => f.write_str(other.type_name()),
        }
    }
}

// ── Str ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Str {
    pub value: String,
}

impl Str {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl Visitable for Str {}

impl Object for Str {
    fn type_name(&self) -> &'static str {
        "Str"
    }

    fn get_attribute(&self, _this: Gc, name: &str) -> Option<Attribute> {
        match name {
            "len" => Some(Attribute::Value(Value::Int(
                self.value.chars().count() as i64,
            ))),
            _ => None,
        }
    }

    fn equal(&self, _this: Gc, other: &Value) -> bool {
        other
            .as_gc()
            .and_then(|other| other.as_str().map(|s| s == self.value))
            .unwrap_or(false)
    }

    fn hash(&self, _this: Gc) -> u64 {
        let mut hasher = ahash::AHasher::default();
        self.value.hash(&mut hasher);
        hasher.finish()
    }

    fn str(&self, _this: Gc) -> String {
        self.value.clone()
    }
}

// ── List ─────────────────────────────────────────────────────────────

/// Growable list, shared between isolates like any other object. The lock
/// makes single operations atomic, compound updates need a script Mutex.
#[derive(Debug, Default)]
pub struct List {
    items: Mutex<Vec<Value>>,
}

impl List {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn push(&self, value: Value) {
        self.items.lock().push(value);
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.lock().get(index).copied()
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.items.lock().clone()
    }
}

impl Visitable for List {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        self.items.lock().visit_edges(visitor);
    }
}

fn list_len(_vm: &mut Vm, this: Gc, _args: &[Value]) -> NativeResult {
    let list = this.as_list().ok_or_else(|| expected_self("List", this))?;
    Ok(Value::Int(list.len() as i64))
}

fn list_push(_vm: &mut Vm, this: Gc, args: &[Value]) -> NativeResult {
    let list = this.as_list().ok_or_else(|| expected_self("List", this))?;
    list.push(args[0]);
    Ok(Value::Nil)
}

fn list_get(_vm: &mut Vm, this: Gc, args: &[Value]) -> NativeResult {
    let list = this.as_list().ok_or_else(|| expected_self("List", this))?;
    let index = crate::expect_int(args, 0)?;
    usize::try_from(index)
        .ok()
        .and_then(|index| list.get(index))
        .ok_or_else(|| {
            RuntimeError::argument(format!(
                "index {index} out of range for list of length {}",
                list.len()
            ))
        })
}

pub static LIST_METHODS: &[NativeMethod] = &[
    NativeMethod::new("len", Arity::Exact(0), list_len),
    NativeMethod::new("push", Arity::Exact(1), list_push),
    NativeMethod::new("get", Arity::Exact(1), list_get),
];

impl Object for List {
    fn type_name(&self) -> &'static str {
        "List"
    }

    fn get_attribute(&self, _this: Gc, name: &str) -> Option<Attribute> {
        crate::find_method(LIST_METHODS, name)
    }

    fn str(&self, _this: Gc) -> String {
        let items = self.to_vec();
        let parts: Vec<String> = items.iter().map(Value::to_string).collect();
        format!("[{}]", parts.join(", "))
    }
}

// ── BoundMethod ──────────────────────────────────────────────────────

/// A native method paired with its receiver, produced by attribute access.
#[derive(Debug, Copy, Clone)]
pub struct BoundMethod {
    pub receiver: Gc,
    pub method: &'static NativeMethod,
}

impl Visitable for BoundMethod {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        visitor.visit(Value::Ref(self.receiver));
    }
}

impl Object for BoundMethod {
    fn type_name(&self) -> &'static str {
        "BoundMethod"
    }

    fn str(&self, _this: Gc) -> String {
        format!(
            "<bound method {}.{}>",
            self.receiver.type_name(),
            self.method.name
        )
    }
}

// ── BondResult ───────────────────────────────────────────────────────

/// Tagged outcome of an isolate. `payload` is the returned value, or an
/// `Error` object when `is_error` is set.
#[derive(Debug, Copy, Clone)]
pub struct BondResult {
    pub is_error: bool,
    pub payload: Value,
}

impl BondResult {
    pub fn ok(payload: Value) -> Self {
        Self {
            is_error: false,
            payload,
        }
    }

    pub fn error(payload: Value) -> Self {
        Self {
            is_error: true,
            payload,
        }
    }
}

impl Visitable for BondResult {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        visitor.visit(self.payload);
    }
}

impl Object for BondResult {
    fn type_name(&self) -> &'static str {
        "Result"
    }

    fn get_attribute(&self, _this: Gc, name: &str) -> Option<Attribute> {
        match name {
            "is_error" => Some(Attribute::Value(Value::Bool(self.is_error))),
            "payload" => Some(Attribute::Value(self.payload)),
            _ => None,
        }
    }

    fn str(&self, _this: Gc) -> String {
        match self.is_error {
            true => format!("Err({})", self.payload),
            false => format!("Ok({})", self.payload),
        }
    }
}

// ── Error ────────────────────────────────────────────────────────────

/// A runtime error as a script value.
#[derive(Debug, Clone)]
pub struct ErrorObject {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<RuntimeError> for ErrorObject {
    fn from(err: RuntimeError) -> Self {
        Self {
            kind: err.kind,
            message: err.message,
        }
    }
}

impl ErrorObject {
    pub fn to_runtime_error(&self) -> RuntimeError {
        RuntimeError::new(self.kind, self.message.clone())
    }
}

impl Visitable for ErrorObject {}

fn error_kind(vm: &mut Vm, this: Gc, _args: &[Value]) -> NativeResult {
    let error = this.as_error().ok_or_else(|| expected_self("Error", this))?;
    Ok(vm.make_str(error.kind.as_str()))
}

fn error_message(vm: &mut Vm, this: Gc, _args: &[Value]) -> NativeResult {
    let error = this.as_error().ok_or_else(|| expected_self("Error", this))?;
    let message = error.message.clone();
    Ok(vm.make_str(message))
}

pub static ERROR_METHODS: &[NativeMethod] = &[
    NativeMethod::new("kind", Arity::Exact(0), error_kind),
    NativeMethod::new("message", Arity::Exact(0), error_message),
];

impl Object for ErrorObject {
    fn type_name(&self) -> &'static str {
        "Error"
    }

    fn get_attribute(&self, _this: Gc, name: &str) -> Option<Attribute> {
        crate::find_method(ERROR_METHODS, name)
    }

    fn str(&self, _this: Gc) -> String {
        format!("{}: {}", self.kind, self.message)
    }
}

pub(crate) fn expected_self(expected: &str, this: Gc) -> RuntimeError {
    RuntimeError::type_error(format!(
        "method of {expected} called on {}",
        this.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HeaderFlags, RuntimeCreateInfo, Runtime};

    #[test]
    fn list_operations() {
        let list = List::default();
        assert!(list.is_empty());
        list.push(Value::Int(1));
        list.push(Value::Nil);
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0), Some(Value::Int(1)));
        assert_eq!(list.get(2), None);
    }

    #[test]
    fn list_visits_every_item() {
        let list = List::new(vec![Value::Int(1), Value::Int(2), Value::Nil]);
        let mut count = 0;
        list.visit_edges(&mut |_: Value| count += 1);
        assert_eq!(count, 3);
    }

    #[test]
    fn result_attributes() {
        let cell = Gc::allocate(
            HeapObject::Result(BondResult::error(Value::Int(7))),
            HeaderFlags::empty(),
        );
        let value = Value::Ref(cell);
        assert!(matches!(
            value.get_attribute("is_error"),
            Some(Attribute::Value(Value::Bool(true)))
        ));
        assert!(matches!(
            value.get_attribute("payload"),
            Some(Attribute::Value(Value::Int(7)))
        ));
        assert!(value.get_attribute("other").is_none());
        assert_eq!(value.to_string(), "Err(7)");
        // SAFETY: not shared
        unsafe { cell.free() };
    }

    #[test]
    fn builtin_attributes_are_read_only() {
        let cell = Gc::allocate(
            HeapObject::Str(Str::new("abc")),
            HeaderFlags::empty(),
        );
        let err = Value::Ref(cell)
            .set_attribute("len", Value::Int(1))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Attribute);
        // SAFETY: not shared
        unsafe { cell.free() };
    }

    #[test]
    fn error_methods_allocate_strings() {
        let runtime = Runtime::new(RuntimeCreateInfo::default()).unwrap();
        let mut vm = runtime.new_vm();
        let error = vm.make(HeapObject::Error(ErrorObject::from(
            RuntimeError::state("pending"),
        )));
        let Some(gc) = error.as_gc() else {
            panic!("error object is a reference")
        };

        let kind = (ERROR_METHODS[0].func)(&mut vm, gc, &[]).unwrap();
        let message = (ERROR_METHODS[1].func)(&mut vm, gc, &[]).unwrap();
        assert_eq!(kind.to_string(), "StateError");
        assert_eq!(message.to_string(), "pending");
    }
}
