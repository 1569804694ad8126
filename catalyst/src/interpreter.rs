// interpreter.rs - Host VM
//
// A small stack interpreter over the bytecode set in `bytecode`. Activations
// are `Context`s kept on an explicit context stack; each links to its sender
// by position. The standard run path dispatches to a compiled routine
// whenever the method's `compiled_slot` is bound, both for top-level runs and
// for sends.
//
// The VM is also the Reference Oracle: `Host::evaluate` interprets a method
// with compiled dispatch disabled, inside an object-memory snapshot that is
// restored afterwards.

use crate::bytecode::Opcode;
use crate::engine::Frame;
use crate::error::VmError;
use crate::object::{MethodId, MethodRef, ObjectMemory, Value};
use crate::table::MethodTable;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Interpreter knobs
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Invocations before an uncompiled method is queued for translation
    /// (0 disables the trigger)
    pub hot_threshold: u64,
    /// Maximum number of live contexts
    pub max_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            hot_threshold: 10,
            max_depth: 256,
        }
    }
}

/// Dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvocationStats {
    pub interpreted: u64,
    pub compiled: u64,
}

/// One method activation
#[derive(Debug)]
pub struct Context {
    pub receiver: Value,
    pub method: MethodRef,
    pub stack: Vec<Value>,
    /// Arguments followed by temporaries
    pub temps: Vec<Value>,
    pub pc: usize,
    /// Position of the sending context on the context stack
    pub sender: Option<usize>,
}

impl Context {
    fn new(receiver: Value, method: MethodRef, mut args: Vec<Value>, sender: Option<usize>) -> Self {
        let header = method.header();
        args.resize(header.num_args as usize, Value::Nil);
        args.extend(std::iter::repeat(Value::Nil).take(header.num_temps as usize));
        Context {
            receiver,
            method,
            stack: Vec::new(),
            temps: args,
            pc: 0,
            sender,
        }
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or_else(|| VmError::StackUnderflow {
            selector: self.method.selector().to_string(),
            pc: self.pc.saturating_sub(1),
        })
    }
}

/// Interpreter-facing collaborator of the translation pipeline
pub trait Host {
    /// Interpret `method` on `receiver` without compiled dispatch, leaving
    /// VM state as it was. `None` when interpretation fails.
    fn evaluate(&self, method: &MethodRef, receiver: &Value) -> Option<Value>;

    /// Run `method` on `receiver` through the standard run path, leaving VM
    /// state as it was
    fn run_isolated(&self, method: &MethodRef, receiver: &Value) -> Result<Value, VmError>;
}

impl<H: Host> Host for Arc<H> {
    fn evaluate(&self, method: &MethodRef, receiver: &Value) -> Option<Value> {
        (**self).evaluate(method, receiver)
    }

    fn run_isolated(&self, method: &MethodRef, receiver: &Value) -> Result<Value, VmError> {
        (**self).run_isolated(method, receiver)
    }
}

#[derive(Debug, Clone, Copy)]
struct Mode {
    /// Dispatch to bound compiled routines
    compiled: bool,
    /// Count invocations and feed the hotness trigger
    record: bool,
}

const PRODUCTION: Mode = Mode {
    compiled: true,
    record: true,
};

#[derive(Default)]
struct Hotness {
    counts: HashMap<MethodId, u64>,
    queued: HashSet<MethodId>,
    requests: Vec<MethodRef>,
    stats: InvocationStats,
}

enum Step {
    Continue,
    Return(Value),
    Send {
        receiver: Value,
        selector: String,
        args: Vec<Value>,
    },
}

/// The virtual machine
pub struct Vm {
    memory: Mutex<ObjectMemory>,
    table: Arc<MethodTable>,
    hotness: Mutex<Hotness>,
    config: VmConfig,
}

impl Vm {
    pub fn new(memory: ObjectMemory, table: Arc<MethodTable>, config: VmConfig) -> Self {
        Vm {
            memory: Mutex::new(memory),
            table,
            hotness: Mutex::new(Hotness::default()),
            config,
        }
    }

    pub fn table(&self) -> &Arc<MethodTable> {
        &self.table
    }

    /// Run `f` with the object memory locked
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut ObjectMemory) -> R) -> R {
        f(&mut self.memory.lock())
    }

    /// Find a method by class name and selector
    pub fn method(&self, class_name: &str, selector: &str) -> Option<MethodRef> {
        self.memory.lock().method(class_name, selector)
    }

    /// Standard run path
    pub fn run(&self, method: &MethodRef, receiver: Value, args: Vec<Value>) -> Result<Value, VmError> {
        self.execute(method, receiver, args, PRODUCTION)
    }

    /// Look `selector` up on `receiver` and run it
    pub fn send(&self, receiver: Value, selector: &str, args: Vec<Value>) -> Result<Value, VmError> {
        let method = self.lookup(&receiver, selector)?;
        self.run(&method, receiver, args)
    }

    /// Interpret without compiled dispatch or bookkeeping
    pub fn interpret(&self, method: &MethodRef, receiver: Value, args: Vec<Value>) -> Result<Value, VmError> {
        let mode = Mode {
            compiled: false,
            record: false,
        };
        self.execute(method, receiver, args, mode)
    }

    /// Drain methods that crossed the hotness threshold
    pub fn take_translation_requests(&self) -> Vec<MethodRef> {
        std::mem::take(&mut self.hotness.lock().requests)
    }

    pub fn invocation_stats(&self) -> InvocationStats {
        self.hotness.lock().stats
    }

    pub fn reset_invocation_stats(&self) {
        self.hotness.lock().stats = InvocationStats::default();
    }

    fn lookup(&self, receiver: &Value, selector: &str) -> Result<MethodRef, VmError> {
        self.memory
            .lock()
            .lookup(receiver, selector)
            .ok_or_else(|| VmError::DoesNotUnderstand {
                receiver: receiver.to_string(),
                selector: selector.to_string(),
            })
    }

    /// Run `f` against a snapshot of the object memory and restore it after
    fn isolated<R>(&self, f: impl FnOnce() -> R) -> R {
        let snapshot = self.memory.lock().clone();
        let result = f();
        *self.memory.lock() = snapshot;
        result
    }

    fn execute(&self, method: &MethodRef, receiver: Value, args: Vec<Value>, mode: Mode) -> Result<Value, VmError> {
        let compiled = self.note_invocation(method, mode);
        if compiled {
            return self.call_compiled(method, receiver, args);
        }

        let mut contexts = vec![Context::new(receiver, method.clone(), args, None)];
        loop {
            let depth = contexts.len();
            let step = match contexts.last_mut() {
                Some(context) => self.step(context)?,
                None => return Ok(Value::Nil),
            };

            match step {
                Step::Continue => {}
                Step::Return(value) => {
                    contexts.pop();
                    match contexts.last_mut() {
                        Some(sender) => sender.stack.push(value),
                        None => return Ok(value),
                    }
                }
                Step::Send {
                    receiver,
                    selector,
                    args,
                } => {
                    let callee = self.lookup(&receiver, &selector)?;
                    if self.note_invocation(&callee, mode) {
                        let result = self.call_compiled(&callee, receiver, args)?;
                        if let Some(context) = contexts.last_mut() {
                            context.stack.push(result);
                        }
                    } else {
                        if depth >= self.config.max_depth {
                            return Err(VmError::DepthExceeded {
                                limit: self.config.max_depth,
                            });
                        }
                        contexts.push(Context::new(receiver, callee, args, Some(depth - 1)));
                    }
                }
            }
        }
    }

    /// Count an invocation; returns whether it dispatches to compiled code
    fn note_invocation(&self, method: &MethodRef, mode: Mode) -> bool {
        let compiled = mode.compiled && method.compiled_slot() != 0;
        if !mode.record {
            return compiled;
        }

        let mut hotness = self.hotness.lock();
        if compiled {
            hotness.stats.compiled += 1;
            return true;
        }
        hotness.stats.interpreted += 1;

        if self.config.hot_threshold == 0 {
            return false;
        }
        let count = hotness.counts.entry(method.id()).or_insert(0);
        *count += 1;
        if *count >= self.config.hot_threshold && hotness.queued.insert(method.id()) {
            tracing::debug!(selector = method.selector(), "method is hot, queued for translation");
            hotness.requests.push(method.clone());
        }
        false
    }

    fn call_compiled(&self, method: &MethodRef, receiver: Value, args: Vec<Value>) -> Result<Value, VmError> {
        let slot = method.compiled_slot();
        let routine = self.table.routine(slot).ok_or(VmError::EmptySlot { slot })?;

        let header = method.header();
        let mut temps = args;
        temps.resize(header.num_args as usize, Value::Nil);
        temps.extend(std::iter::repeat(Value::Nil).take(header.num_temps as usize));

        let frame = Frame {
            fields: self.memory.lock().fields_of(&receiver),
            receiver,
            temps,
            literals: method.literals().to_vec(),
        };
        Ok(routine.invoke(frame)?)
    }

    fn step(&self, context: &mut Context) -> Result<Step, VmError> {
        let Some(&byte) = context.method.bytecodes().get(context.pc) else {
            // Implicit ^self
            return Ok(Step::Return(context.receiver.clone()));
        };
        let pc = context.pc;
        context.pc += 1;

        match Opcode::decode(byte) {
            Opcode::PushField(n) => {
                let value = self
                    .memory
                    .lock()
                    .fields_of(&context.receiver)
                    .get(n as usize)
                    .cloned()
                    .ok_or(VmError::IndexOutOfRange {
                        kind: "field",
                        index: n as usize,
                    })?;
                context.stack.push(value);
            }
            Opcode::PushTemp(n) => {
                let value = context.temps.get(n as usize).cloned().ok_or(VmError::IndexOutOfRange {
                    kind: "temp",
                    index: n as usize,
                })?;
                context.stack.push(value);
            }
            Opcode::PushLiteral(n) => {
                let value = literal(context, n)?;
                context.stack.push(value);
            }
            Opcode::PushReceiver => context.stack.push(context.receiver.clone()),
            Opcode::PushTrue => context.stack.push(Value::True),
            Opcode::PushFalse => context.stack.push(Value::False),
            Opcode::PushNil => context.stack.push(Value::Nil),
            Opcode::ReturnTop => return Ok(Step::Return(context.pop()?)),
            Opcode::ReturnReceiver => return Ok(Step::Return(context.receiver.clone())),
            Opcode::Send { selector, args } => {
                let selector = match literal(context, selector)? {
                    Value::Symbol(name) => name.to_string(),
                    _ => {
                        return Err(VmError::BadSelector {
                            index: selector as usize,
                        })
                    }
                };
                let mut arguments = Vec::with_capacity(args as usize);
                for _ in 0..args {
                    arguments.push(context.pop()?);
                }
                arguments.reverse();
                let receiver = context.pop()?;
                return Ok(Step::Send {
                    receiver,
                    selector,
                    args: arguments,
                });
            }
            Opcode::Unknown => return Err(VmError::UnknownBytecode { byte, pc }),
            op => {
                let right = context.pop()?;
                let left = context.pop()?;
                context.stack.push(arithmetic(op, &left, &right)?);
            }
        }
        Ok(Step::Continue)
    }
}

fn literal(context: &Context, index: u8) -> Result<Value, VmError> {
    context
        .method
        .literals()
        .get(index as usize)
        .cloned()
        .ok_or(VmError::IndexOutOfRange {
            kind: "literal",
            index: index as usize,
        })
}

/// Arithmetic and comparison primitives
pub fn arithmetic(op: Opcode, left: &Value, right: &Value) -> Result<Value, VmError> {
    if op == Opcode::Equals {
        return Ok(Value::boolean(left == right));
    }

    let name = match op {
        Opcode::Add => "add",
        Opcode::Subtract => "subtract",
        Opcode::LessThan => "less_than",
        Opcode::GreaterThan => "greater_than",
        Opcode::Multiply => "multiply",
        Opcode::Divide => "divide",
        _ => "modulo",
    };
    let failed = || VmError::PrimitiveFailed {
        operation: name,
        left: left.to_string(),
        right: right.to_string(),
    };
    let (Some(a), Some(b)) = (left.as_small_integer(), right.as_small_integer()) else {
        return Err(failed());
    };

    let result = match op {
        Opcode::Add => a.checked_add(b),
        Opcode::Subtract => a.checked_sub(b),
        Opcode::Multiply => a.checked_mul(b),
        Opcode::LessThan => return Ok(Value::boolean(a < b)),
        Opcode::GreaterThan => return Ok(Value::boolean(a > b)),
        Opcode::Divide => {
            if b == 0 {
                return Err(VmError::ZeroDivide);
            }
            if a.wrapping_rem(b) != 0 {
                return Err(failed());
            }
            a.checked_div(b)
        }
        _ => {
            if b == 0 {
                return Err(VmError::ZeroDivide);
            }
            let r = a.wrapping_rem(b);
            Some(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
        }
    };
    result.map(Value::SmallInteger).ok_or_else(failed)
}

impl Host for Vm {
    fn evaluate(&self, method: &MethodRef, receiver: &Value) -> Option<Value> {
        let result = self.isolated(|| self.interpret(method, receiver.clone(), Vec::new()));
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(selector = method.selector(), error = %e, "reference evaluation failed");
                None
            }
        }
    }

    fn run_isolated(&self, method: &MethodRef, receiver: &Value) -> Result<Value, VmError> {
        let mode = Mode {
            compiled: true,
            record: false,
        };
        self.isolated(|| self.execute(method, receiver.clone(), Vec::new(), mode))
    }
}
