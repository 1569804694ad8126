// catalyst - Validated JIT translation of Smalltalk methods to WebAssembly
//
// Hot methods of a small Smalltalk bytecode VM are handed to a synthesis
// backend, which proposes a WebAssembly routine. A candidate is only
// installed once it has been shown to compute the same result as the
// interpreter.
//
// # Architecture
//
// 1. **Classification** (`classify.rs`): structural profile of a method's
//    bytecode and an eligibility verdict (leaf, does arithmetic or field
//    access, bounded size)
// 2. **Reference result** (`interpreter.rs`): the VM interprets the method
//    once on the canonical receiver; the controller caches the result
// 3. **Request building** (`prompt.rs`): full method description on the
//    first attempt, previous candidate plus diagnostic on retries
// 4. **Synthesis** (`synth/`): OpenAI, Anthropic, or the offline baseline
//    (`translate.rs` + `wasm_builder.rs`)
// 5. **Validation** (`validate.rs`): syntax, binary validity, then execution
//    through the standard run path with the candidate bound to a probe slot
// 6. **Installation** (`table.rs`): the routine is appended to the method
//    table and the method's `compiled_slot` points at it
//
// # Routine ABI
//
// A compiled routine is `(func (param $context i32))` exported as `run`.
// It reaches the VM only through the `env` imports listed in `engine.rs`,
// sees objects as i32 handles, and leaves exactly one value (its result) on
// the context stack.

pub mod bytecode;
pub mod classify;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod image;
pub mod interpreter;
pub mod object;
pub mod prompt;
pub mod stats;
pub mod synth;
pub mod table;
pub mod translate;
pub mod validate;
pub mod wasm;
pub mod wasm_builder;

pub use classify::{classify, Classification, Limits, Profile};
pub use config::{CatalystConfig, ProviderConfig, ProviderKind};
pub use controller::{Catalyst, SkipReason, TranslationOutcome};
pub use engine::{Engine, Routine};
pub use error::{TranslationError, VmError};
pub use interpreter::{Host, Vm, VmConfig};
pub use object::{Method, MethodHeader, MethodRef, ObjectMemory, Value};
pub use stats::Statistics;
pub use synth::{Backend, Synthesizer};
pub use table::MethodTable;

/// Lower an eligible method straight to a routine binary, bypassing
/// synthesis and validation
pub fn compile_baseline(bytecodes: &[u8], name: &str) -> anyhow::Result<Vec<u8>> {
    let module = translate::translate(bytecodes, name, false)?;
    wasm_builder::build(&module)
}
