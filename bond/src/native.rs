use crate::{
    Attribute, Gc, Object, Runtime, RuntimeError, Value, Visitable, Vm,
    error::NativeResult,
};

pub type NativeFn = fn(&mut Vm, &[Value]) -> NativeResult;
pub type MethodFn = fn(&mut Vm, Gc, &[Value]) -> NativeResult;

/// Entry point of a native module.
pub type ModuleInit =
    fn(&Runtime, &mut ModuleBuilder) -> Result<(), RuntimeError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn check(self, name: &str, got: usize) -> Result<(), RuntimeError> {
        match self {
            Arity::Exact(n) if got != n => Err(RuntimeError::argument(
                format!("{name}() takes {n} arguments but {got} were given"),
            )),
            Arity::AtLeast(n) if got < n => Err(RuntimeError::argument(
                format!(
                    "{name}() takes at least {n} arguments but {got} were given"
                ),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct NativeFunction {
    pub name: &'static str,
    pub arity: Arity,
    pub func: NativeFn,
}

impl NativeFunction {
    pub const fn new(name: &'static str, arity: Arity, func: NativeFn) -> Self {
        Self { name, arity, func }
    }

    pub fn invoke(&self, vm: &mut Vm, args: &[Value]) -> NativeResult {
        self.arity.check(self.name, args.len())?;
        (self.func)(vm, args)
    }
}

impl Visitable for NativeFunction {}

impl Object for NativeFunction {
    fn type_name(&self) -> &'static str {
        "NativeFunction"
    }

    fn str(&self, _this: Gc) -> String {
        format!("<native function {}>", self.name)
    }
}

/// A method of a built-in or native struct type. Lives in a static table,
/// attribute lookup hands out `&'static` references to it.
#[derive(Debug)]
pub struct NativeMethod {
    pub name: &'static str,
    pub arity: Arity,
    pub func: MethodFn,
}

impl NativeMethod {
    pub const fn new(name: &'static str, arity: Arity, func: MethodFn) -> Self {
        Self { name, arity, func }
    }

    pub fn invoke(
        &self,
        vm: &mut Vm,
        receiver: Gc,
        args: &[Value],
    ) -> NativeResult {
        self.arity.check(self.name, args.len())?;
        (self.func)(vm, receiver, args)
    }
}

pub fn find_method(
    table: &'static [NativeMethod],
    name: &str,
) -> Option<Attribute> {
    table
        .iter()
        .find(|method| method.name == name)
        .map(Attribute::Method)
}

// ── argument helpers ─────────────────────────────────────────────────

pub fn check_arity(
    name: &str,
    args: &[Value],
    expected: usize,
) -> Result<(), RuntimeError> {
    Arity::Exact(expected).check(name, args.len())
}

fn arg(args: &[Value], index: usize) -> Result<Value, RuntimeError> {
    args.get(index).copied().ok_or_else(|| {
        RuntimeError::argument(format!("missing argument {index}"))
    })
}

fn mismatch(index: usize, expected: &str, got: Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "argument {index}: expected {expected}, got {}",
        got.type_name()
    ))
}

pub fn expect_int(args: &[Value], index: usize) -> Result<i64, RuntimeError> {
    let value = arg(args, index)?;
    value.as_int().ok_or_else(|| mismatch(index, "Int", value))
}

/// Accepts Int or Float.
pub fn expect_number(
    args: &[Value],
    index: usize,
) -> Result<f64, RuntimeError> {
    let value = arg(args, index)?;
    value.as_float().ok_or_else(|| mismatch(index, "number", value))
}

pub fn expect_ref(args: &[Value], index: usize) -> Result<Gc, RuntimeError> {
    let value = arg(args, index)?;
    value.as_gc().ok_or_else(|| mismatch(index, "object", value))
}

pub fn expect_list(
    args: &[Value],
    index: usize,
) -> Result<Vec<Value>, RuntimeError> {
    let value = arg(args, index)?;
    value
        .as_gc()
        .and_then(|gc| gc.as_list().map(|list| list.to_vec()))
        .ok_or_else(|| mismatch(index, "List", value))
}

pub fn expect_callable(
    args: &[Value],
    index: usize,
) -> Result<Gc, RuntimeError> {
    let value = arg(args, index)?;
    value
        .as_gc()
        .filter(|gc| {
            matches!(
                **gc,
                crate::HeapObject::Function(_)
                    | crate::HeapObject::Native(_)
                    | crate::HeapObject::BoundMethod(_)
            )
        })
        .ok_or_else(|| mismatch(index, "callable", value))
}

// ── module registration ──────────────────────────────────────────────

/// Collects the functions and struct constructors of one module. Entries
/// become immortal globals once the module initialises successfully.
#[derive(Debug)]
pub struct ModuleBuilder {
    name: String,
    entries: Vec<NativeFunction>,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_function(&mut self, function: NativeFunction) -> &mut Self {
        self.entries.push(function);
        self
    }

    pub fn add_functions(&mut self, functions: &[NativeFunction]) -> &mut Self {
        self.entries.extend_from_slice(functions);
        self
    }

    /// Registers a native struct type. The constructor returns an
    /// `Instance` whose methods come from its own `get_attribute`.
    pub fn add_struct(
        &mut self,
        name: &'static str,
        arity: Arity,
        constructor: NativeFn,
    ) -> &mut Self {
        self.add_function(NativeFunction::new(name, arity, constructor))
    }

    pub(crate) fn finish(self) -> Vec<NativeFunction> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn arity_messages() {
        let err = Arity::Exact(2).check("f", 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Argument);
        assert_eq!(err.message, "f() takes 2 arguments but 1 were given");

        assert!(Arity::AtLeast(1).check("g", 3).is_ok());
        assert!(Arity::AtLeast(1).check("g", 0).is_err());
    }

    #[test]
    fn expect_helpers_fail_fast() {
        let args = [Value::Int(3), Value::Bool(true)];
        assert_eq!(expect_int(&args, 0), Ok(3));
        assert_eq!(expect_number(&args, 0), Ok(3.0));

        let err = expect_int(&args, 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
        assert_eq!(err.message, "argument 1: expected Int, got Bool");

        let err = expect_ref(&args, 5).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Argument);
    }

    #[test]
    fn builder_collects_entries() {
        fn nil(_vm: &mut Vm, _args: &[Value]) -> NativeResult {
            Ok(Value::Nil)
        }
        let mut builder = ModuleBuilder::new("test");
        builder
            .add_function(NativeFunction::new("a", Arity::Exact(0), nil))
            .add_struct("B", Arity::Exact(0), nil);
        assert_eq!(builder.name(), "test");
        let names: Vec<_> =
            builder.finish().iter().map(|entry| entry.name).collect();
        assert_eq!(names, ["a", "B"]);
    }
}
