// error.rs - Error types
//
// `TranslationError` is the taxonomy of reasons a translation run can end
// without an installed routine. None of these reach the interpreter: the
// controller folds them into a `TranslationOutcome`. The remaining enums
// belong to the collaborators the pipeline drives.

use crate::object::Value;
use thiserror::Error;

/// Why a translation run did not install a routine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslationError {
    #[error("method is not eligible for translation: {reason}")]
    AnalysisIneligible { reason: String },

    #[error("no reference result available for method")]
    OracleUnavailable,

    #[error("synthesis backend returned no candidate")]
    SynthesisUnavailable,

    #[error("candidate failed to parse: {message}")]
    ParseError { message: String },

    #[error("candidate failed binary validation: {message}")]
    ValidationError { message: String },

    #[error("candidate result mismatch: expected {expected}, got {actual}")]
    ExecutionMismatch { expected: Value, actual: String },

    #[error("candidate identical to previous failed attempt")]
    NoProgress,
}

impl TranslationError {
    /// Short classification label used in prompts and logs
    pub fn label(&self) -> &'static str {
        match self {
            TranslationError::AnalysisIneligible { .. } => "ANALYSIS INELIGIBLE",
            TranslationError::OracleUnavailable => "ORACLE UNAVAILABLE",
            TranslationError::SynthesisUnavailable => "SYNTHESIS UNAVAILABLE",
            TranslationError::ParseError { .. } => "WAT PARSING ERROR",
            TranslationError::ValidationError { .. } => "WASM VALIDATION ERROR",
            TranslationError::ExecutionMismatch { .. } => "EXECUTION VALIDATION ERROR",
            TranslationError::NoProgress => "NO PROGRESS",
        }
    }
}

/// Interpreter failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("stack underflow at pc {pc} in #{selector}")]
    StackUnderflow { selector: String, pc: usize },

    #[error("{receiver} does not understand #{selector}")]
    DoesNotUnderstand { receiver: String, selector: String },

    #[error("primitive failed: {operation} on {left} and {right}")]
    PrimitiveFailed {
        operation: &'static str,
        left: String,
        right: String,
    },

    #[error("division by zero")]
    ZeroDivide,

    #[error("unknown bytecode 0x{byte:02x} at pc {pc}")]
    UnknownBytecode { byte: u8, pc: usize },

    #[error("{kind} index {index} out of range")]
    IndexOutOfRange { kind: &'static str, index: usize },

    #[error("literal {index} is not a selector")]
    BadSelector { index: usize },

    #[error("recursion depth limit of {limit} exceeded")]
    DepthExceeded { limit: usize },

    #[error("compiled slot {slot} is empty")]
    EmptySlot { slot: u32 },

    #[error("compiled routine failed: {0}")]
    Routine(#[from] EngineError),
}

/// Execution engine failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("failed to compile routine: {0}")]
    Compile(String),

    #[error("failed to instantiate routine: {0}")]
    Instantiate(String),

    #[error("routine does not export `{0}`")]
    MissingEntry(String),

    #[error("routine trapped: {0}")]
    Trap(String),

    #[error("host fault: {0}")]
    Fault(String),

    #[error("routine left {depth} values on the context stack, expected exactly one")]
    StackImbalance { depth: usize },
}

/// Method table failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("another write to method #{selector} is in flight")]
    BindConflict { selector: String },

    #[error("slot {0} does not hold a routine")]
    UnknownSlot(u32),
}

/// Configuration failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),

    #[error("no API key configured for {0}")]
    MissingKey(&'static str),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}
