// classify.rs - Bytecode classifier
//
// Builds a structural profile of a method's instruction stream and decides
// whether the method is worth handing to the translation pipeline. Pure
// function of the bytecode: same input, same profile.

use crate::bytecode::{self, Opcode};

/// Ceilings applied by the eligibility verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of stack-effecting pushes
    pub max_stack_operations: usize,
    /// Maximum number of instructions
    pub max_instructions: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_stack_operations: 50,
            max_instructions: 100,
        }
    }
}

/// How a method produces its result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    TopOfStack,
    Receiver,
    /// Falls off the end (implicit `^self`)
    Implicit,
}

/// Structural profile of a method's bytecode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub has_arithmetic: bool,
    pub has_field_access: bool,
    pub has_temps: bool,
    pub has_literals: bool,
    pub has_method_calls: bool,
    pub has_unknown: bool,
    pub is_leaf: bool,
    pub is_pure: bool,
    /// Pushes onto the context stack
    pub stack_operations: usize,
    pub instruction_count: usize,
    /// Literal indices referenced, in instruction order
    pub literal_indices: Vec<u8>,
    pub return_kind: ReturnKind,
    /// Mnemonics in instruction order
    pub operations: Vec<String>,
}

/// Profile plus verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub profile: Profile,
    pub eligible: bool,
    /// Why the method is not eligible (empty when eligible)
    pub reasons: Vec<String>,
}

impl Classification {
    pub fn reason(&self) -> String {
        self.reasons.join("; ")
    }
}

/// Profile a method's bytecode
pub fn profile(bytes: &[u8]) -> Profile {
    let mut profile = Profile {
        has_arithmetic: false,
        has_field_access: false,
        has_temps: false,
        has_literals: false,
        has_method_calls: false,
        has_unknown: false,
        is_leaf: true,
        is_pure: true,
        stack_operations: 0,
        instruction_count: bytes.len(),
        literal_indices: Vec::new(),
        return_kind: ReturnKind::Implicit,
        operations: Vec::with_capacity(bytes.len()),
    };

    for inst in bytecode::decode(bytes) {
        let op = inst.opcode;
        profile.operations.push(op.name());

        if op.is_arithmetic() {
            profile.has_arithmetic = true;
        }
        if op.is_push() {
            profile.stack_operations += 1;
        }

        match op {
            Opcode::PushField(_) => profile.has_field_access = true,
            Opcode::PushTemp(_) => profile.has_temps = true,
            Opcode::PushLiteral(n) => {
                profile.has_literals = true;
                profile.literal_indices.push(n);
            }
            Opcode::Send { selector, .. } => {
                profile.has_method_calls = true;
                profile.is_leaf = false;
                profile.is_pure = false;
                profile.literal_indices.push(selector);
            }
            Opcode::Unknown => profile.has_unknown = true,
            _ => {}
        }

        // First return ends the method; trailing bytes are dead
        if profile.return_kind == ReturnKind::Implicit {
            match op {
                Opcode::ReturnTop => profile.return_kind = ReturnKind::TopOfStack,
                Opcode::ReturnReceiver => profile.return_kind = ReturnKind::Receiver,
                _ => {}
            }
        }
    }

    profile
}

/// Profile a method and judge whether it may be translated
pub fn classify(bytes: &[u8], limits: &Limits) -> Classification {
    let profile = profile(bytes);
    let mut reasons = Vec::new();

    if !profile.is_leaf {
        reasons.push("method sends messages".to_string());
    }
    if !(profile.has_arithmetic || profile.has_field_access) {
        reasons.push("no arithmetic or field access to optimize".to_string());
    }
    if profile.stack_operations > limits.max_stack_operations {
        reasons.push(format!(
            "{} stack operations exceed limit of {}",
            profile.stack_operations, limits.max_stack_operations
        ));
    }
    if profile.instruction_count > limits.max_instructions {
        reasons.push(format!(
            "{} instructions exceed limit of {}",
            profile.instruction_count, limits.max_instructions
        ));
    }
    if profile.has_unknown {
        reasons.push("method contains unknown bytecodes".to_string());
    }

    Classification {
        eligible: reasons.is_empty(),
        profile,
        reasons,
    }
}

/// Symbolic trace of the context stack, one line per instruction
///
/// The receiver is `R`; fields, temps and literals are `field[n]`,
/// `temp[n]` and `lit[n]`.
pub fn stack_trace(bytes: &[u8]) -> String {
    let mut stack: Vec<String> = Vec::new();
    let mut lines = Vec::new();
    let mut result = None;

    for inst in bytecode::decode(bytes) {
        let op = inst.opcode;
        match op {
            Opcode::PushField(n) => stack.push(format!("field[{n}]")),
            Opcode::PushTemp(n) => stack.push(format!("temp[{n}]")),
            Opcode::PushLiteral(n) => stack.push(format!("lit[{n}]")),
            Opcode::PushReceiver => stack.push("R".into()),
            Opcode::PushTrue => stack.push("true".into()),
            Opcode::PushFalse => stack.push("false".into()),
            Opcode::PushNil => stack.push("nil".into()),
            Opcode::ReturnTop => result = stack.last().cloned(),
            Opcode::ReturnReceiver => result = Some("R".into()),
            Opcode::Send { selector, args } => {
                let mut operands = Vec::new();
                for _ in 0..=args {
                    operands.push(stack.pop().unwrap_or_else(|| "?".into()));
                }
                operands.reverse();
                stack.push(format!("send(lit[{selector}], {})", operands.join(", ")));
            }
            Opcode::Unknown => {}
            _ => {
                let symbol = match op {
                    Opcode::Add => "+",
                    Opcode::Subtract => "-",
                    Opcode::LessThan => "<",
                    Opcode::GreaterThan => ">",
                    Opcode::Multiply => "*",
                    Opcode::Divide => "/",
                    Opcode::Modulo => "\\\\",
                    _ => "=",
                };
                let b = stack.pop().unwrap_or_else(|| "?".into());
                let a = stack.pop().unwrap_or_else(|| "?".into());
                stack.push(format!("({a} {symbol} {b})"));
            }
        }

        lines.push(format!(
            "Step {}: {} -> stack: [{}]",
            inst.pc + 1,
            op.name(),
            stack.join(", ")
        ));

        if op.is_return() {
            break;
        }
    }

    let result = result.unwrap_or_else(|| "R".into());
    lines.push(format!("FINAL RESULT: {result}"));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARED: &[u8] = &[0x70, 0x70, 0xb8, 0x7c];

    #[test]
    fn test_squared_is_eligible() {
        let c = classify(SQUARED, &Limits::default());
        assert!(c.eligible, "{}", c.reason());
        assert!(c.profile.has_arithmetic);
        assert!(c.profile.is_leaf);
        assert_eq!(c.profile.stack_operations, 2);
        assert_eq!(c.profile.return_kind, ReturnKind::TopOfStack);
    }

    #[test]
    fn test_classification_is_idempotent() {
        let bytes = [0x00, 0x21, 0xb0, 0x10, 0xba, 0x7c];
        let first = classify(&bytes, &Limits::default());
        let second = classify(&bytes, &Limits::default());
        assert_eq!(first, second);
    }

    #[test]
    fn test_send_makes_method_ineligible() {
        let c = classify(&[0x70, 0xd0, 0x7c], &Limits::default());
        assert!(!c.eligible);
        assert!(c.profile.has_method_calls);
        assert!(!c.profile.is_leaf);
        assert!(!c.profile.is_pure);
        assert!(c.reason().contains("sends"));
    }

    #[test]
    fn test_trivial_method_is_ineligible() {
        let c = classify(&[0x70, 0x7c], &Limits::default());
        assert!(!c.eligible);
        assert!(c.reason().contains("no arithmetic"));
    }

    #[test]
    fn test_field_access_alone_is_eligible() {
        let c = classify(&[0x01, 0x7c], &Limits::default());
        assert!(c.eligible);
        assert!(c.profile.has_field_access);
    }

    #[test]
    fn test_limits() {
        let mut bytes = vec![0x70; 6];
        bytes.extend([0xb0; 5]);
        bytes.push(0x7c);

        let tight = Limits {
            max_stack_operations: 5,
            max_instructions: 100,
        };
        assert!(!classify(&bytes, &tight).eligible);

        let short = Limits {
            max_stack_operations: 50,
            max_instructions: 10,
        };
        assert!(!classify(&bytes, &short).eligible);

        assert!(classify(&bytes, &Limits::default()).eligible);
    }

    #[test]
    fn test_unknown_bytecode_is_ineligible() {
        let c = classify(&[0x70, 0x70, 0xb4, 0x7c], &Limits::default());
        assert!(c.profile.has_unknown);
        assert!(!c.eligible);
    }

    #[test]
    fn test_literal_indices() {
        let p = profile(&[0x70, 0x23, 0xb0, 0x21, 0xb8, 0x7c]);
        assert_eq!(p.literal_indices, vec![3, 1]);
        assert!(p.has_literals);
    }

    #[test]
    fn test_stack_trace() {
        let trace = stack_trace(&[0x70, 0x20, 0xb0, 0x70, 0xb8, 0x7c]);
        assert!(trace.contains("Step 3: add -> stack: [(R + lit[0])]"));
        assert!(trace.ends_with("FINAL RESULT: ((R + lit[0]) * R)"));
    }
}
