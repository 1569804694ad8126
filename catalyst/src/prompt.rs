// prompt.rs - Candidate source builder
//
// Turns a method and its profile into the request handed to a synthesis
// backend. The first attempt describes the whole method; later attempts
// carry only the previous candidate and what went wrong with it.

use crate::bytecode;
use crate::classify::{self, Profile};
use crate::engine::IMPORTS;
use crate::error::TranslationError;
use crate::object::{Method, Value};
use std::fmt::Write as _;

/// One rejected candidate within a translation run
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub attempt: usize,
    pub candidate: String,
    pub error: TranslationError,
    /// Diagnostic dump, if the candidate got far enough to have one
    pub dump: Option<String>,
    pub expected: Value,
}

impl FailureRecord {
    /// Actual result or failure reason, for execution mismatches
    pub fn actual(&self) -> Option<&str> {
        match &self.error {
            TranslationError::ExecutionMismatch { actual, .. } => Some(actual),
            _ => None,
        }
    }
}

/// Payload handed to a synthesis backend
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub selector: String,
    pub bytecodes: Vec<u8>,
    pub literals: Vec<Value>,
    /// Function name the candidate must use (without `$`)
    pub function_name: String,
    pub attempt: usize,
    pub max_attempts: usize,
    pub prompt: String,
}

impl SynthesisRequest {
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}

/// Build the request for `attempt` (1-based)
pub fn build(
    method: &Method,
    profile: &Profile,
    attempt: usize,
    max_attempts: usize,
    function_name: &str,
    history: &[FailureRecord],
) -> SynthesisRequest {
    let prompt = match history.last() {
        Some(previous) if attempt > 1 => {
            retry_prompt(method, function_name, previous, attempt, max_attempts)
        }
        _ => initial_prompt(method, profile, function_name),
    };

    SynthesisRequest {
        selector: method.selector().to_string(),
        bytecodes: method.bytecodes().to_vec(),
        literals: method.literals().to_vec(),
        function_name: function_name.to_string(),
        attempt,
        max_attempts,
        prompt,
    }
}

/// WAT signatures of the import surface with parameter names
pub fn import_signatures() -> String {
    let mut out = String::new();
    for import in IMPORTS {
        let _ = write!(out, "  (func ${}", import.name);
        for param in import.params {
            let _ = write!(out, " (param ${param} i32)");
        }
        if import.results > 0 {
            out.push_str(" (result i32)");
        }
        out.push_str(")\n");
    }
    out
}

fn initial_prompt(method: &Method, profile: &Profile, function_name: &str) -> String {
    let mut out = String::new();
    let bytes = method.bytecodes();

    let _ = writeln!(
        out,
        "Translate the following Smalltalk method into a single WebAssembly text format function."
    );
    out.push('\n');
    out.push_str("Contract:\n");
    let _ = writeln!(
        out,
        "- Write exactly one function: (func ${function_name} (param $context i32) ...). No result type."
    );
    out.push_str("- Objects are i32 handles. Unbox SmallIntegers with $valueOfSmallInteger and box results with $smallIntegerForValue.\n");
    out.push_str("- The context stack starts empty. Leave exactly one value on it with $onContextPush: that value is the method's result.\n");
    out.push_str("- Use only the imported functions below. Do not declare imports, memories or exports.\n");
    out.push_str("- SmallIntegers are 32-bit signed; division is exact and modulo is floored.\n");
    out.push('\n');
    out.push_str("Imported functions (module \"env\"):\n");
    out.push_str(&import_signatures());
    out.push('\n');

    let _ = writeln!(out, "Method: #{}", method.selector());
    let _ = writeln!(out, "Bytecodes: {}", bytecode::format_bytes(bytes));
    if method.literals().is_empty() {
        out.push_str("Literals: none\n");
    } else {
        out.push_str("Literals:\n");
        for (i, literal) in method.literals().iter().enumerate() {
            let _ = writeln!(out, "  lit[{i}] = {literal}");
        }
    }
    let _ = writeln!(
        out,
        "Shape: {} instructions, {} pushes, operations: {}",
        profile.instruction_count,
        profile.stack_operations,
        profile.operations.join(" ")
    );
    out.push('\n');

    out.push_str("Instruction by instruction:\n");
    out.push_str(&bytecode::interpret_in_english(bytes));
    out.push_str("\n\n");

    out.push_str("Stack trace (R is the receiver):\n");
    out.push_str(&classify::stack_trace(bytes));
    out.push_str("\n\n");

    out.push_str("Respond with only the function.\n");
    out
}

fn retry_prompt(
    method: &Method,
    function_name: &str,
    previous: &FailureRecord,
    attempt: usize,
    max_attempts: usize,
) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Your previous translation of #{} was rejected. Fix it.",
        method.selector()
    );
    out.push('\n');
    let _ = writeln!(out, "Failure: {}", previous.error.label());
    let _ = writeln!(out, "Diagnostic: {}", previous.error);
    if let Some(actual) = previous.actual() {
        let _ = writeln!(out, "Expected result: {}", previous.expected);
        let _ = writeln!(out, "Actual result: {actual}");
    }
    out.push('\n');

    out.push_str("Previous candidate:\n");
    out.push_str(previous.candidate.trim());
    out.push_str("\n\n");

    if let Some(dump) = &previous.dump {
        out.push_str("Dump:\n");
        out.push_str(dump.trim_end());
        out.push_str("\n\n");
    }

    let _ = writeln!(out, "Current attempt: {attempt}/{max_attempts}");
    let _ = writeln!(
        out,
        "Respond with only the corrected function, still named ${function_name}."
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::profile;
    use crate::object::{Method, MethodHeader};

    fn squared() -> std::sync::Arc<Method> {
        Method::new("squared", MethodHeader::default(), vec![0x70, 0x70, 0xb8, 0x7c], vec![])
    }

    #[test]
    fn test_initial_prompt() {
        let m = squared();
        let req = build(&m, &profile(m.bytecodes()), 1, 2, "translated_method_0", &[]);
        assert!(!req.is_retry());
        assert!(req.prompt.contains("(func $translated_method_0 (param $context i32)"));
        assert!(req.prompt.contains("[0x70, 0x70, 0xb8, 0x7c]"));
        assert!(req.prompt.contains("(func $onContextPush (param $context i32) (param $object i32))"));
        assert!(req.prompt.contains("FINAL RESULT: (R * R)"));
        assert!(req.prompt.contains("Literals: none"));
    }

    #[test]
    fn test_retry_prompt_is_focused() {
        let m = squared();
        let failure = FailureRecord {
            attempt: 1,
            candidate: "(func $translated_method_0 (param $context i32))".into(),
            error: TranslationError::ExecutionMismatch {
                expected: Value::SmallInteger(10000),
                actual: "200".into(),
            },
            dump: Some("(module)".into()),
            expected: Value::SmallInteger(10000),
        };
        let req = build(&m, &profile(m.bytecodes()), 2, 2, "translated_method_0", &[failure]);
        assert!(req.is_retry());
        assert!(req.prompt.contains("EXECUTION VALIDATION ERROR"));
        assert!(req.prompt.contains("Expected result: 10000"));
        assert!(req.prompt.contains("Actual result: 200"));
        assert!(req.prompt.contains("Current attempt: 2/2"));
        assert!(!req.prompt.contains("Instruction by instruction"));
    }

    #[test]
    fn test_literals_are_listed() {
        let m = Method::new(
            "plusFortyTwo",
            MethodHeader::default(),
            vec![0x70, 0x20, 0xb0, 0x7c],
            vec![Value::SmallInteger(42)],
        );
        let req = build(&m, &profile(m.bytecodes()), 1, 2, "f", &[]);
        assert!(req.prompt.contains("lit[0] = 42"));
        assert_eq!(req.literals, vec![Value::SmallInteger(42)]);
    }
}
