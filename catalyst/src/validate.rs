// validate.rs - Candidate validator
//
// Runs a candidate through three gates:
//
//   Received -> SyntaxChecked -> BinaryValidated -> ExecutionCompared -> Accepted
//                                                                     \-> Rejected
//
// 1. syntax: the assembled module text must encode to a binary
// 2. binary validity: the binary must validate; a known class of validator
//    false positives is downgraded and the candidate carries on
// 3. execution: the candidate is bound to a fresh probe slot, the method is
//    run through the standard run path, and the result must equal the
//    reference result. The table is restored before the gate returns.
//
// The validator never installs anything permanently.

use crate::engine::{Engine, Routine};
use crate::error::TranslationError;
use crate::interpreter::Host;
use crate::object::{MethodRef, Value};
use crate::table::MethodTable;
use crate::wasm::{self, BinaryCheck};
use std::sync::Arc;

/// Validator states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    SyntaxChecked,
    BinaryValidated,
    ExecutionCompared,
    Accepted,
    Rejected,
}

/// Final verdict on a candidate
#[derive(Debug)]
pub enum Verdict {
    /// Proven equivalent on the canonical input; ready to install
    Accepted(Arc<Routine>),
    Rejected(TranslationError),
}

/// Verdict plus what the validator saw on the way
#[derive(Debug)]
pub struct Validation {
    pub verdict: Verdict,
    /// States visited, in order
    pub stages: Vec<Stage>,
    /// Validator message downgraded at the binary gate
    pub downgraded: Option<String>,
    pub dump: Option<String>,
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self.verdict, Verdict::Accepted(_))
    }

    pub fn reached(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }
}

/// Collaborators the gates need
pub struct Validator<'a, H: Host> {
    pub host: &'a H,
    pub table: &'a MethodTable,
    pub engine: &'a Engine,
    pub benign_patterns: &'a [String],
}

impl<H: Host> Validator<'_, H> {
    /// Judge `candidate` as a translation of `method`, expecting `expected`
    /// when run on `receiver`
    pub fn validate(&self, candidate: &str, method: &MethodRef, receiver: &Value, expected: &Value) -> Validation {
        let mut run = Run {
            stages: vec![Stage::Received],
            downgraded: None,
            dump: None,
        };

        // Gate 1: syntax
        let text = wasm::assemble(candidate);
        let binary = match wasm::parse(&text) {
            Ok(binary) => binary,
            Err(message) => {
                tracing::debug!(selector = method.selector(), %message, "candidate failed to parse");
                run.dump = Some(wasm::parse_failure_dump(&message, &text));
                return run.reject(TranslationError::ParseError { message });
            }
        };
        run.stages.push(Stage::SyntaxChecked);
        run.dump = Some(wasm::dump(&binary));

        // Gate 2: binary validity
        match wasm::check_binary(&binary, self.benign_patterns) {
            BinaryCheck::Ok => {}
            BinaryCheck::BenignMismatch(message) => {
                tracing::warn!(selector = method.selector(), %message, "validator finding downgraded, execution gate decides");
                run.downgraded = Some(message);
            }
            BinaryCheck::Err(message) => {
                tracing::debug!(selector = method.selector(), %message, "candidate failed binary validation");
                return run.reject(TranslationError::ValidationError { message });
            }
        }
        run.stages.push(Stage::BinaryValidated);

        // Gate 3: execution equivalence
        let actual = self.execute(&binary, method, receiver);
        run.stages.push(Stage::ExecutionCompared);
        match actual {
            Ok((routine, value)) if value == *expected => {
                tracing::debug!(selector = method.selector(), result = %value, "candidate matches reference");
                run.stages.push(Stage::Accepted);
                Validation {
                    verdict: Verdict::Accepted(routine),
                    stages: run.stages,
                    downgraded: run.downgraded,
                    dump: run.dump,
                }
            }
            Ok((_, value)) => run.reject(TranslationError::ExecutionMismatch {
                expected: expected.clone(),
                actual: value.to_string(),
            }),
            Err(reason) => run.reject(TranslationError::ExecutionMismatch {
                expected: expected.clone(),
                actual: reason,
            }),
        }
    }

    /// Compile, bind to a probe slot, run through the standard path, restore
    fn execute(&self, binary: &[u8], method: &MethodRef, receiver: &Value) -> Result<(Arc<Routine>, Value), String> {
        let routine = Arc::new(self.engine.compile(binary).map_err(|e| e.to_string())?);
        let result = self
            .table
            .temporarily_rebind_and_restore(method, routine.clone(), || {
                self.host.run_isolated(method, receiver)
            })
            .map_err(|e| e.to_string())?;
        match result {
            Ok(value) => Ok((routine, value)),
            Err(e) => {
                tracing::debug!(selector = method.selector(), error = %e, "candidate failed during execution");
                Err(e.to_string())
            }
        }
    }
}

struct Run {
    stages: Vec<Stage>,
    downgraded: Option<String>,
    dump: Option<String>,
}

impl Run {
    fn reject(mut self, error: TranslationError) -> Validation {
        self.stages.push(Stage::Rejected);
        Validation {
            verdict: Verdict::Rejected(error),
            stages: self.stages,
            downgraded: self.downgraded,
            dump: self.dump,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalystConfig;
    use crate::image;
    use crate::interpreter::{Vm, VmConfig};

    const SQUARE: &str = r#"(func $translated_method_0 (param $context i32)
  (local $r i32)
  (local.set $r (call $valueOfSmallInteger (call $contextReceiver (local.get $context))))
  (call $onContextPush (local.get $context)
    (call $smallIntegerForValue (i32.mul (local.get $r) (local.get $r)))))"#;

    const DOUBLE: &str = r#"(func $translated_method_0 (param $context i32)
  (local $r i32)
  (local.set $r (call $valueOfSmallInteger (call $contextReceiver (local.get $context))))
  (call $onContextPush (local.get $context)
    (call $smallIntegerForValue (i32.add (local.get $r) (local.get $r)))))"#;

    struct Fixture {
        vm: Vm,
        engine: Engine,
        patterns: Vec<String>,
        method: MethodRef,
    }

    impl Fixture {
        fn new() -> Self {
            let table = Arc::new(MethodTable::new());
            let vm = Vm::new(image::boot(), table, VmConfig::default());
            let method = vm.method("SmallInteger", "squared").unwrap();
            Fixture {
                vm,
                engine: Engine::new(100_000),
                patterns: CatalystConfig::default().benign_validation_patterns,
                method,
            }
        }

        fn validate(&self, candidate: &str) -> Validation {
            let validator = Validator {
                host: &self.vm,
                table: self.vm.table(),
                engine: &self.engine,
                benign_patterns: &self.patterns,
            };
            validator.validate(candidate, &self.method, &Value::SmallInteger(100), &Value::SmallInteger(10000))
        }
    }

    #[test]
    fn test_accepts_equivalent_candidate() {
        let f = Fixture::new();
        let v = f.validate(SQUARE);
        assert!(v.is_accepted());
        assert_eq!(
            v.stages,
            vec![
                Stage::Received,
                Stage::SyntaxChecked,
                Stage::BinaryValidated,
                Stage::ExecutionCompared,
                Stage::Accepted
            ]
        );
        assert_eq!(f.method.compiled_slot(), 0);
        assert_eq!(f.vm.table().len(), 1);
    }

    #[test]
    fn test_rejects_mismatch() {
        let f = Fixture::new();
        let v = f.validate(DOUBLE);
        match v.verdict {
            Verdict::Rejected(TranslationError::ExecutionMismatch { expected, actual }) => {
                assert_eq!(expected, Value::SmallInteger(10000));
                assert_eq!(actual, "200");
            }
            other => panic!("unexpected verdict {other:?}"),
        }
        assert!(v.dump.unwrap().contains("section walk"));
        assert_eq!(f.method.compiled_slot(), 0);
        assert_eq!(f.vm.table().len(), 1);
    }

    #[test]
    fn test_parse_failure_stops_at_first_gate() {
        let f = Fixture::new();
        let v = f.validate("(func $broken (param $context i32) (i32.bogus))");
        assert!(matches!(v.verdict, Verdict::Rejected(TranslationError::ParseError { .. })));
        assert_eq!(v.stages, vec![Stage::Received, Stage::Rejected]);
        assert!(v.dump.unwrap().starts_with(";; parse error"));
    }

    #[test]
    fn test_invalid_binary_is_rejected() {
        let f = Fixture::new();
        let v = f.validate("(func $f (param $context i32) i32.add drop)");
        assert!(matches!(v.verdict, Verdict::Rejected(TranslationError::ValidationError { .. })));
        assert!(!v.reached(Stage::BinaryValidated));
    }

    #[test]
    fn test_trap_is_a_mismatch_and_restores_table() {
        let f = Fixture::new();
        let v = f.validate("(func $f (param $context i32) unreachable)");
        match v.verdict {
            Verdict::Rejected(TranslationError::ExecutionMismatch { actual, .. }) => {
                assert!(actual.contains("trapped"), "{actual}");
            }
            other => panic!("unexpected verdict {other:?}"),
        }
        assert_eq!(f.method.compiled_slot(), 0);
        assert_eq!(f.vm.table().len(), 1);
    }

    #[test]
    fn test_empty_result_is_a_mismatch() {
        let f = Fixture::new();
        let v = f.validate("(func $f (param $context i32))");
        match v.verdict {
            Verdict::Rejected(TranslationError::ExecutionMismatch { actual, .. }) => {
                assert!(actual.contains("expected exactly one"), "{actual}");
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn test_downgraded_finding_still_faces_execution_gate() {
        let f = Fixture::new();
        let patterns = vec!["type mismatch".to_string()];
        let validator = Validator {
            host: &f.vm,
            table: f.vm.table(),
            engine: &f.engine,
            benign_patterns: &patterns,
        };
        let v = validator.validate(
            "(func $f (param $context i32) i32.add drop)",
            &f.method,
            &Value::SmallInteger(100),
            &Value::SmallInteger(10000),
        );

        let downgraded = v.downgraded.clone().unwrap();
        assert!(downgraded.to_lowercase().contains("type mismatch"), "{downgraded}");
        assert!(v.reached(Stage::BinaryValidated));
        assert!(v.reached(Stage::ExecutionCompared));
        match v.verdict {
            Verdict::Rejected(TranslationError::ExecutionMismatch { actual, .. }) => {
                assert!(actual.contains("failed to compile"), "{actual}");
            }
            other => panic!("unexpected verdict {other:?}"),
        }
        assert_eq!(f.method.compiled_slot(), 0);
        assert_eq!(f.vm.table().len(), 1);
        assert!(!f.vm.table().is_writing(f.method.id()));
    }

    #[test]
    fn test_live_binding_survives_validation() {
        let f = Fixture::new();
        let accepted = f.validate(SQUARE);
        let Verdict::Accepted(routine) = accepted.verdict else {
            panic!("expected acceptance");
        };
        let live = f.vm.table().install(&f.method, routine).unwrap();

        let v = f.validate(DOUBLE);
        assert!(!v.is_accepted());
        assert_eq!(f.method.compiled_slot(), live);
        assert_eq!(f.vm.table().len(), 2);
    }
}
