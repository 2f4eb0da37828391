use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    BoundMethod, ErrorKind, ErrorObject, Gc, HeapObject, Mutator, Object,
    RootGuard, RootProvider, Runtime, RuntimeError, Str, Value, Visitable,
    Visitor, error::NativeResult,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Op {
    /// push `constants[i]`
    Const(usize),
    /// push argument `i` of the current frame
    Arg(usize),
    /// push the global named by the Str `constants[i]`
    Global(usize),
    Add,
    Sub,
    Mul,
    Div,
    /// callee below `argc` arguments
    Call(usize),
    /// replace the receiver with its attribute named by `constants[i]`
    GetAttr(usize),
    /// pops value and receiver
    SetAttr(usize),
    Pop,
    Return,
    /// pops a message (or an Error object) and fails with it
    Raise,
}

/// A bytecode function.
#[derive(Debug, Clone)]
pub struct Code {
    pub name: String,
    pub arity: usize,
    pub constants: Vec<Value>,
    pub ops: Vec<Op>,
}

impl Code {
    pub fn new(
        name: impl Into<String>,
        arity: usize,
        constants: Vec<Value>,
        ops: Vec<Op>,
    ) -> Self {
        Self {
            name: name.into(),
            arity,
            constants,
            ops,
        }
    }

    fn constant(&self, index: usize) -> Result<Value, RuntimeError> {
        self.constants.get(index).copied().ok_or_else(|| {
            RuntimeError::new(
                ErrorKind::State,
                format!("{}: no constant {index}", self.name),
            )
        })
    }

    fn name_constant(&self, index: usize) -> Result<String, RuntimeError> {
        let value = self.constant(index)?;
        value
            .as_gc()
            .and_then(|gc| gc.as_str().map(str::to_owned))
            .ok_or_else(|| {
                RuntimeError::type_error(format!(
                    "{}: constant {index} is not a name",
                    self.name
                ))
            })
    }
}

impl Visitable for Code {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        self.constants.visit_edges(visitor);
    }
}

impl Object for Code {
    fn type_name(&self) -> &'static str {
        "Function"
    }

    fn str(&self, _this: Gc) -> String {
        format!("<function {}>", self.name)
    }
}

/// Operand stack of a Vm. Registered as a root for the Vm's lifetime.
#[derive(Debug, Default)]
pub struct ValueStack(Mutex<Vec<Value>>);

impl RootProvider for ValueStack {
    fn visit_roots(&self, visitor: &mut dyn Visitor) {
        self.0.lock().visit_edges(visitor);
    }
}

#[derive(Debug, Copy, Clone)]
struct Frame {
    code: Gc,
    ip: usize,
    /// stack index of the first argument, the callee sits right below
    base: usize,
}

/// One interpreter instance, bound to the thread that created it.
pub struct Vm {
    runtime: Runtime,
    mutator: Mutator,
    stack: Arc<ValueStack>,
    frames: Vec<Frame>,
    /// stack depth at the last `call_function`, failures unwind to it
    entry: usize,
    error: bool,
    _root: RootGuard,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("mutator", &self.mutator)
            .field("depth", &self.depth())
            .field("frames", &self.frames.len())
            .field("error", &self.error)
            .finish()
    }
}

impl Vm {
    /// Creates a Vm for the calling thread, with its own thread storage.
    ///
    /// # Panics
    /// if the calling thread already has a storage, use
    /// [`Vm::with_mutator`] then
    pub fn new(runtime: Runtime) -> Self {
        let mutator = runtime.gc().make_thread_storage();
        Self::with_mutator(runtime, mutator)
    }

    /// Creates a Vm on an existing thread storage of `runtime`.
    ///
    /// # Panics
    /// if `mutator` belongs to another runtime's collector
    pub fn with_mutator(runtime: Runtime, mutator: Mutator) -> Self {
        assert!(
            Arc::ptr_eq(runtime.gc(), mutator.gc()),
            "mutator belongs to another collector"
        );
        let stack = Arc::new(ValueStack::default());
        let root = runtime.gc().add_root(stack.clone());
        Self {
            runtime,
            mutator,
            stack,
            frames: Vec::new(),
            entry: 0,
            error: false,
            _root: root,
        }
    }

    #[inline]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    #[inline]
    pub fn mutator(&self) -> &Mutator {
        &self.mutator
    }

    pub fn make(&self, object: HeapObject) -> Value {
        Value::Ref(self.mutator.make(object))
    }

    pub fn make_str(&self, value: impl Into<String>) -> Value {
        self.make(HeapObject::Str(Str::new(value)))
    }

    // ── stack ────────────────────────────────────────────────────────

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.0.lock().push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<Value> {
        self.stack.0.lock().pop()
    }

    pub fn peek(&self) -> Option<Value> {
        self.stack.0.lock().last().copied()
    }

    pub fn depth(&self) -> usize {
        self.stack.0.lock().len()
    }

    fn pop_operand(&mut self) -> Result<Value, RuntimeError> {
        self.pop()
            .ok_or_else(|| RuntimeError::state("operand stack underflow"))
    }

    fn get(&self, index: usize) -> Result<Value, RuntimeError> {
        self.stack
            .0
            .lock()
            .get(index)
            .copied()
            .ok_or_else(|| RuntimeError::state("operand stack underflow"))
    }

    fn truncate(&mut self, depth: usize) {
        self.stack.0.lock().truncate(depth);
    }

    // ── calling ──────────────────────────────────────────────────────

    /// Sets up a call of `function`. Natives run right away, bytecode
    /// functions run on the next [`Vm::exec`]. On failure the error object
    /// is left on the stack.
    pub fn call_function(&mut self, function: Value, args: &[Value]) {
        self.error = false;
        self.entry = self.depth();
        self.push(function);
        for arg in args {
            self.push(*arg);
        }
        if let Err(err) = self.invoke(args.len()) {
            self.fail(err);
        }
    }

    /// Runs until every frame returned or an error occurred.
    pub fn exec(&mut self) {
        while !self.frames.is_empty() {
            self.mutator.safepoint();
            if let Err(err) = self.step() {
                self.fail(err);
                return;
            }
        }
    }

    pub fn had_error(&self) -> bool {
        self.error
    }

    fn fail(&mut self, err: RuntimeError) {
        log::trace!("vm failed: {err}");
        self.frames.clear();
        self.truncate(self.entry);
        let error = self.make(HeapObject::Error(ErrorObject::from(err)));
        self.push(error);
        self.error = true;
    }

    fn invoke(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let depth = self.depth();
        let Some(callee_index) = depth.checked_sub(argc + 1) else {
            return Err(RuntimeError::state("operand stack underflow"));
        };
        let callee = self.get(callee_index)?;
        let not_callable = || {
            RuntimeError::type_error(format!(
                "'{}' object is not callable",
                callee.type_name()
            ))
        };
        let gc = callee.as_gc().ok_or_else(not_callable)?;

        let result = match &*gc {
            HeapObject::Function(code) => {
                if code.arity != argc {
                    return Err(RuntimeError::argument(format!(
                        "{}() takes {} arguments but {argc} were given",
                        code.name, code.arity
                    )));
                }
                self.frames.push(Frame {
                    code: gc,
                    ip: 0,
                    base: callee_index + 1,
                });
                return Ok(());
            }
            // arguments stay on the stack while the native runs
            HeapObject::Native(native) => {
                let args = self.stack.0.lock()[callee_index + 1..].to_vec();
                native.invoke(self, &args)?
            }
            HeapObject::BoundMethod(bound) => {
                let args = self.stack.0.lock()[callee_index + 1..].to_vec();
                bound.method.invoke(self, bound.receiver, &args)?
            }
            _ => return Err(not_callable()),
        };
        self.truncate(callee_index);
        self.push(result);
        Ok(())
    }

    fn ret(&mut self) -> Result<(), RuntimeError> {
        let result = self.pop_operand()?;
        if let Some(frame) = self.frames.pop() {
            self.truncate(frame.base - 1);
        }
        self.push(result);
        Ok(())
    }

    fn step(&mut self) -> Result<(), RuntimeError> {
        let Some(frame) = self.frames.last_mut() else {
            return Ok(());
        };
        let gc = frame.code;
        let HeapObject::Function(code) = &*gc else {
            return Err(RuntimeError::type_error("frame without bytecode"));
        };
        let op = code.ops.get(frame.ip).copied();
        frame.ip += 1;
        let base = frame.base;

        let Some(op) = op else {
            // falling off the end returns nil
            self.push(Value::Nil);
            return self.ret();
        };

        match op {
            Op::Const(index) => {
                let value = code.constant(index)?;
                self.push(value);
            }
            Op::Arg(index) => {
                if index >= code.arity {
                    return Err(RuntimeError::argument(format!(
                        "{}: no argument {index}",
                        code.name
                    )));
                }
                let value = self.get(base + index)?;
                self.push(value);
            }
            Op::Global(index) => {
                let name = code.name_constant(index)?;
                let value = self.runtime.global(&name).ok_or_else(|| {
                    RuntimeError::new(
                        ErrorKind::Name,
                        format!("name '{name}' is not defined"),
                    )
                })?;
                self.push(value);
            }
            Op::Add | Op::Sub | Op::Mul | Op::Div => {
                let rhs = self.pop_operand()?;
                let lhs = self.pop_operand()?;
                let result = self.arith(op, lhs, rhs)?;
                self.push(result);
            }
            Op::Call(argc) => self.invoke(argc)?,
            Op::GetAttr(index) => {
                let name = code.name_constant(index)?;
                let receiver = self.pop_operand()?;
                let value = match receiver.get_attribute(&name) {
                    Some(crate::Attribute::Value(value)) => value,
                    Some(crate::Attribute::Method(method)) => {
                        let Some(receiver) = receiver.as_gc() else {
                            return Err(RuntimeError::attribute(
                                receiver.type_name(),
                                &name,
                            ));
                        };
                        self.make(HeapObject::BoundMethod(BoundMethod {
                            receiver,
                            method,
                        }))
                    }
                    None => {
                        return Err(RuntimeError::attribute(
                            receiver.type_name(),
                            &name,
                        ));
                    }
                };
                self.push(value);
            }
            Op::SetAttr(index) => {
                let name = code.name_constant(index)?;
                let value = self.pop_operand()?;
                let receiver = self.pop_operand()?;
                receiver.set_attribute(&name, value)?;
            }
            Op::Pop => {
                self.pop_operand()?;
            }
            Op::Return => self.ret()?,
            Op::Raise => {
                let raised = self.pop_operand()?;
                return Err(match raised.as_gc().and_then(|gc| {
                    gc.as_error().map(ErrorObject::to_runtime_error)
                }) {
                    Some(err) => err,
                    None => RuntimeError::new(
                        ErrorKind::Raised,
                        raised.to_string(),
                    ),
                });
            }
        }
        Ok(())
    }

    fn arith(&self, op: Op, lhs: Value, rhs: Value) -> NativeResult {
        let symbol = match op {
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
            _ => "/",
        };
        let overflow = || {
            RuntimeError::new(
                ErrorKind::Arithmetic,
                format!("integer overflow in {symbol}"),
            )
        };
        let by_zero =
            || RuntimeError::new(ErrorKind::Arithmetic, "division by zero");

        match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                let result = match op {
                    Op::Add => a.checked_add(b),
                    Op::Sub => a.checked_sub(b),
                    Op::Mul => a.checked_mul(b),
                    _ if b == 0 => return Err(by_zero()),
                    _ => a.checked_div(b),
                };
                result.map(Value::Int).ok_or_else(overflow)
            }
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let (a, b) = (lhs.as_float(), rhs.as_float());
                let (Some(a), Some(b)) = (a, b) else {
                    unreachable!("both operands are numbers")
                };
                Ok(Value::Float(match op {
                    Op::Add => a + b,
                    Op::Sub => a - b,
                    Op::Mul => a * b,
                    _ if b == 0.0 => return Err(by_zero()),
                    _ => a / b,
                }))
            }
            (Value::Ref(a), Value::Ref(b)) if op == Op::Add => {
                match (a.as_str(), b.as_str()) {
                    (Some(a), Some(b)) => Ok(self.make_str(format!("{a}{b}"))),
                    _ => Err(unsupported(symbol, lhs, rhs)),
                }
            }
            _ => Err(unsupported(symbol, lhs, rhs)),
        }
    }
}

fn unsupported(symbol: &str, lhs: Value, rhs: Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "unsupported operand types for {symbol}: '{}' and '{}'",
        lhs.type_name(),
        rhs.type_name()
    ))
}
