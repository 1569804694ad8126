// engine.rs - Execution engine for compiled routines
//
// Compiled routines are Wasm functions `(param $context i32)` that talk to
// the VM only through the fixed import surface below. Smalltalk values
// cross the boundary as i32 handles that live for a single invocation;
// handle 0 is the active context. A routine leaves its result on the
// context stack, exactly one value.
//
// Host-side errors (bad handles, popping an empty stack, unboxing a
// non-integer) do not trap: the host records the first fault, hands back a
// placeholder, and the invocation fails once the routine returns.

use crate::error::EngineError;
use crate::object::Value;
use wasmi::{Caller, Linker, Module, Store};

/// Export name of a routine's entry function
pub const ENTRY_EXPORT: &str = "run";

/// Handle of the active context
pub const CONTEXT_HANDLE: i32 = 0;

/// Module name of the import surface
pub const IMPORT_MODULE: &str = "env";

/// A host function in the import surface (all operands are i32)
#[derive(Debug, Clone, Copy)]
pub struct HostImport {
    pub name: &'static str,
    pub params: &'static [&'static str],
    pub results: usize,
}

/// The fixed import surface, in import index order
pub const IMPORTS: &[HostImport] = &[
    HostImport { name: "onContextPush", params: &["context", "object"], results: 0 },
    HostImport { name: "popFromContext", params: &["context"], results: 1 },
    HostImport { name: "valueOfSmallInteger", params: &["object"], results: 1 },
    HostImport { name: "smallIntegerForValue", params: &["value"], results: 1 },
    HostImport { name: "contextReceiver", params: &["context"], results: 1 },
    HostImport { name: "contextLiteralAt", params: &["context", "index"], results: 1 },
    HostImport { name: "contextTempAt", params: &["context", "index"], results: 1 },
    HostImport { name: "contextReceiverFieldAt", params: &["context", "index"], results: 1 },
    HostImport { name: "specialObject", params: &["which"], results: 1 },
    HostImport { name: "booleanForValue", params: &["value"], results: 1 },
    HostImport { name: "debugLog", params: &["value"], results: 0 },
];

/// Function indices of the imports (imports come first in the index space)
pub mod import {
    pub const ON_CONTEXT_PUSH: u32 = 0;
    pub const POP_FROM_CONTEXT: u32 = 1;
    pub const VALUE_OF_SMALL_INTEGER: u32 = 2;
    pub const SMALL_INTEGER_FOR_VALUE: u32 = 3;
    pub const CONTEXT_RECEIVER: u32 = 4;
    pub const CONTEXT_LITERAL_AT: u32 = 5;
    pub const CONTEXT_TEMP_AT: u32 = 6;
    pub const CONTEXT_RECEIVER_FIELD_AT: u32 = 7;
    pub const SPECIAL_OBJECT: u32 = 8;
    pub const BOOLEAN_FOR_VALUE: u32 = 9;
    pub const DEBUG_LOG: u32 = 10;
}

/// Argument to `specialObject`
pub mod special {
    pub const NIL: i32 = 0;
    pub const TRUE: i32 = 1;
    pub const FALSE: i32 = 2;
}

/// What a routine can see of the activation that called it
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub receiver: Value,
    /// Arguments followed by temporaries
    pub temps: Vec<Value>,
    pub literals: Vec<Value>,
    /// Receiver fields, empty for immediates
    pub fields: Vec<Value>,
}

/// Per-invocation host state
struct HostState {
    frame: Frame,
    handles: Vec<Value>,
    stack: Vec<Value>,
    fault: Option<String>,
}

impl HostState {
    fn new(frame: Frame) -> Self {
        HostState {
            frame,
            handles: Vec::new(),
            stack: Vec::new(),
            fault: None,
        }
    }

    fn fault(&mut self, message: String) {
        if self.fault.is_none() {
            self.fault = Some(message);
        }
    }

    fn intern(&mut self, value: Value) -> i32 {
        self.handles.push(value);
        self.handles.len() as i32
    }

    fn resolve(&mut self, handle: i32) -> Option<Value> {
        if handle < 1 {
            self.fault(format!("invalid object handle {handle}"));
            return None;
        }
        match self.handles.get(handle as usize - 1) {
            Some(v) => Some(v.clone()),
            None => {
                self.fault(format!("invalid object handle {handle}"));
                None
            }
        }
    }

    fn check_context(&mut self, context: i32) -> bool {
        if context != CONTEXT_HANDLE {
            self.fault(format!("invalid context handle {context}"));
            return false;
        }
        true
    }

    fn indexed(&mut self, context: i32, kind: &str, index: i32) -> i32 {
        if !self.check_context(context) {
            return -1;
        }
        let values = match kind {
            "literal" => &self.frame.literals,
            "temp" => &self.frame.temps,
            _ => &self.frame.fields,
        };
        match usize::try_from(index).ok().and_then(|i| values.get(i)).cloned() {
            Some(value) => self.intern(value),
            None => {
                self.fault(format!("{kind} index {index} out of range"));
                -1
            }
        }
    }
}

/// Compiles routine binaries; shared by the VM and the validator
#[derive(Clone)]
pub struct Engine {
    engine: wasmi::Engine,
    fuel: u64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("fuel", &self.fuel).finish()
    }
}

impl Engine {
    /// Create an engine that grants each invocation `fuel` units of work
    pub fn new(fuel: u64) -> Self {
        let mut config = wasmi::Config::default();
        config.consume_fuel(true);
        Engine {
            engine: wasmi::Engine::new(&config),
            fuel,
        }
    }

    /// Compile a binary module into a callable routine
    pub fn compile(&self, binary: &[u8]) -> Result<Routine, EngineError> {
        let module =
            Module::new(&self.engine, binary).map_err(|e| EngineError::Compile(e.to_string()))?;
        Ok(Routine {
            engine: self.engine.clone(),
            module,
            fuel: self.fuel,
            size: binary.len(),
        })
    }
}

/// A compiled, callable routine
pub struct Routine {
    engine: wasmi::Engine,
    module: Module,
    fuel: u64,
    size: usize,
}

impl std::fmt::Debug for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routine").field("size", &self.size).finish()
    }
}

impl Routine {
    /// Size of the binary this routine was compiled from
    pub fn size(&self) -> usize {
        self.size
    }

    /// Call the routine on a fresh context and return its result
    pub fn invoke(&self, frame: Frame) -> Result<Value, EngineError> {
        let mut store = Store::new(&self.engine, HostState::new(frame));
        store
            .add_fuel(self.fuel)
            .map_err(|e| EngineError::Instantiate(e.to_string()))?;

        let mut linker = <Linker<HostState>>::new(&self.engine);
        define_imports(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, &self.module)
            .and_then(|pre| pre.start(&mut store))
            .map_err(|e| EngineError::Instantiate(e.to_string()))?;

        let entry = instance
            .get_typed_func::<i32, ()>(&store, ENTRY_EXPORT)
            .map_err(|_| EngineError::MissingEntry(ENTRY_EXPORT.to_string()))?;

        let outcome = entry.call(&mut store, CONTEXT_HANDLE);

        let state = store.data_mut();
        if let Some(fault) = state.fault.take() {
            return Err(EngineError::Fault(fault));
        }
        outcome.map_err(|e| EngineError::Trap(e.to_string()))?;

        match state.stack.len() {
            1 => Ok(state.stack.pop().unwrap_or_default()),
            depth => Err(EngineError::StackImbalance { depth }),
        }
    }
}

fn link_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Instantiate(e.to_string())
}

/// Register the import surface with a linker
fn define_imports(linker: &mut Linker<HostState>) -> Result<(), EngineError> {
    linker
        .func_wrap(
            IMPORT_MODULE,
            "onContextPush",
            |mut caller: Caller<'_, HostState>, context: i32, object: i32| {
                let state = caller.data_mut();
                if state.check_context(context) {
                    if let Some(value) = state.resolve(object) {
                        state.stack.push(value);
                    }
                }
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "popFromContext",
            |mut caller: Caller<'_, HostState>, context: i32| -> i32 {
                let state = caller.data_mut();
                if !state.check_context(context) {
                    return -1;
                }
                match state.stack.pop() {
                    Some(value) => state.intern(value),
                    None => {
                        state.fault("pop from empty context stack".to_string());
                        -1
                    }
                }
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "valueOfSmallInteger",
            |mut caller: Caller<'_, HostState>, object: i32| -> i32 {
                let state = caller.data_mut();
                match state.resolve(object) {
                    Some(Value::SmallInteger(v)) => v,
                    Some(other) => {
                        state.fault(format!("{other} is not a SmallInteger"));
                        0
                    }
                    None => 0,
                }
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "smallIntegerForValue",
            |mut caller: Caller<'_, HostState>, value: i32| -> i32 {
                caller.data_mut().intern(Value::SmallInteger(value))
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "contextReceiver",
            |mut caller: Caller<'_, HostState>, context: i32| -> i32 {
                let state = caller.data_mut();
                if !state.check_context(context) {
                    return -1;
                }
                let receiver = state.frame.receiver.clone();
                state.intern(receiver)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "contextLiteralAt",
            |mut caller: Caller<'_, HostState>, context: i32, index: i32| -> i32 {
                caller.data_mut().indexed(context, "literal", index)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "contextTempAt",
            |mut caller: Caller<'_, HostState>, context: i32, index: i32| -> i32 {
                caller.data_mut().indexed(context, "temp", index)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "contextReceiverFieldAt",
            |mut caller: Caller<'_, HostState>, context: i32, index: i32| -> i32 {
                caller.data_mut().indexed(context, "field", index)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "specialObject",
            |mut caller: Caller<'_, HostState>, which: i32| -> i32 {
                let state = caller.data_mut();
                let value = match which {
                    special::NIL => Value::Nil,
                    special::TRUE => Value::True,
                    special::FALSE => Value::False,
                    other => {
                        state.fault(format!("unknown special object {other}"));
                        return -1;
                    }
                };
                state.intern(value)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "booleanForValue",
            |mut caller: Caller<'_, HostState>, value: i32| -> i32 {
                caller.data_mut().intern(Value::boolean(value != 0))
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "debugLog",
            |_caller: Caller<'_, HostState>, value: i32| {
                tracing::debug!(value, "routine debugLog");
            },
        )
        .map_err(link_error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(wat_text: &str) -> Routine {
        let binary = wat::parse_str(wat_text).unwrap();
        Engine::new(100_000).compile(&binary).unwrap()
    }

    fn receiver_frame(value: i32) -> Frame {
        Frame {
            receiver: Value::SmallInteger(value),
            ..Frame::default()
        }
    }

    const SQUARE: &str = r#"(module
  (import "env" "onContextPush" (func $push (param i32 i32)))
  (import "env" "valueOfSmallInteger" (func $unbox (param i32) (result i32)))
  (import "env" "smallIntegerForValue" (func $box (param i32) (result i32)))
  (import "env" "contextReceiver" (func $receiver (param i32) (result i32)))
  (func $square (param $context i32)
    (local $r i32)
    (local.set $r (call $unbox (call $receiver (local.get $context))))
    (call $push (local.get $context)
      (call $box (i32.mul (local.get $r) (local.get $r)))))
  (export "run" (func $square)))"#;

    #[test]
    fn test_invoke_square() {
        let routine = compile(SQUARE);
        assert_eq!(routine.invoke(receiver_frame(100)).unwrap(), Value::SmallInteger(10000));
        assert_eq!(routine.invoke(receiver_frame(-3)).unwrap(), Value::SmallInteger(9));
    }

    #[test]
    fn test_fault_on_non_integer() {
        let routine = compile(SQUARE);
        let frame = Frame {
            receiver: Value::Nil,
            ..Frame::default()
        };
        assert!(matches!(routine.invoke(frame), Err(EngineError::Fault(_))));
    }

    #[test]
    fn test_empty_stack_is_imbalance() {
        let routine = compile(
            r#"(module
  (func $noop (param $context i32))
  (export "run" (func $noop)))"#,
        );
        assert_eq!(
            routine.invoke(receiver_frame(1)),
            Err(EngineError::StackImbalance { depth: 0 })
        );
    }

    #[test]
    fn test_pop_from_empty_stack_faults() {
        let routine = compile(
            r#"(module
  (import "env" "popFromContext" (func $pop (param i32) (result i32)))
  (import "env" "onContextPush" (func $push (param i32 i32)))
  (func $f (param $context i32)
    (call $push (local.get $context) (call $pop (local.get $context))))
  (export "run" (func $f)))"#,
        );
        let err = routine.invoke(receiver_frame(1)).unwrap_err();
        assert!(matches!(err, EngineError::Fault(ref m) if m.contains("empty")));
    }

    #[test]
    fn test_trap_is_reported() {
        let routine = compile(
            r#"(module
  (func $f (param $context i32) unreachable)
  (export "run" (func $f)))"#,
        );
        assert!(matches!(routine.invoke(receiver_frame(1)), Err(EngineError::Trap(_))));
    }

    #[test]
    fn test_fuel_bounds_infinite_loop() {
        let routine = compile(
            r#"(module
  (func $f (param $context i32) (loop $l (br $l)))
  (export "run" (func $f)))"#,
        );
        assert!(matches!(routine.invoke(receiver_frame(1)), Err(EngineError::Trap(_))));
    }

    #[test]
    fn test_missing_entry() {
        let routine = compile(
            r#"(module
  (func $f (param $context i32))
  (export "main" (func $f)))"#,
        );
        assert_eq!(
            routine.invoke(receiver_frame(1)),
            Err(EngineError::MissingEntry("run".into()))
        );
    }

    #[test]
    fn test_literals_and_specials() {
        let routine = compile(
            r#"(module
  (import "env" "onContextPush" (func $push (param i32 i32)))
  (import "env" "contextLiteralAt" (func $lit (param i32 i32) (result i32)))
  (import "env" "valueOfSmallInteger" (func $unbox (param i32) (result i32)))
  (import "env" "booleanForValue" (func $bool (param i32) (result i32)))
  (func $f (param $context i32)
    (call $push (local.get $context)
      (call $bool (i32.gt_s (call $unbox (call $lit (local.get $context) (i32.const 1)))
                            (i32.const 5)))))
  (export "run" (func $f)))"#,
        );
        let frame = Frame {
            receiver: Value::Nil,
            literals: vec![Value::SmallInteger(1), Value::SmallInteger(7)],
            ..Frame::default()
        };
        assert_eq!(routine.invoke(frame).unwrap(), Value::True);
    }
}
