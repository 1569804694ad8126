// bytecode.rs - Method bytecode decoding
//
// Decodes the raw instruction stream of a method into structured form.
// Every instruction is a single byte; field, temp, literal and selector
// indices live in the low nibble.

/// A decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Offset within the method's bytecode
    pub pc: usize,
    /// Raw byte
    pub byte: u8,
    /// Decoded opcode
    pub opcode: Opcode,
}

/// Bytecode opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    PushField(u8),
    PushTemp(u8),
    PushLiteral(u8),
    PushReceiver,
    PushTrue,
    PushFalse,
    PushNil,
    ReturnTop,
    ReturnReceiver,

    // Arithmetic / comparison
    Add,
    Subtract,
    LessThan,
    GreaterThan,
    Multiply,
    Divide,
    Modulo,
    Equals,

    // Sends: literal selector index, argument count
    Send { selector: u8, args: u8 },

    Unknown,
}

impl Opcode {
    /// Decode a single byte
    pub fn decode(byte: u8) -> Opcode {
        let low = byte & 0x0f;
        match byte {
            0x00..=0x0f => Opcode::PushField(low),
            0x10..=0x1f => Opcode::PushTemp(low),
            0x20..=0x2f => Opcode::PushLiteral(low),
            0x70 => Opcode::PushReceiver,
            0x71 => Opcode::PushTrue,
            0x72 => Opcode::PushFalse,
            0x73 => Opcode::PushNil,
            0x7c => Opcode::ReturnTop,
            0x7d => Opcode::ReturnReceiver,
            0xb0 => Opcode::Add,
            0xb1 => Opcode::Subtract,
            0xb2 => Opcode::LessThan,
            0xb3 => Opcode::GreaterThan,
            0xb8 => Opcode::Multiply,
            0xb9 => Opcode::Divide,
            0xba => Opcode::Modulo,
            0xbb => Opcode::Equals,
            0xd0..=0xdf => Opcode::Send {
                selector: low,
                args: 0,
            },
            0xe0..=0xef => Opcode::Send {
                selector: low,
                args: 1,
            },
            _ => Opcode::Unknown,
        }
    }

    /// Is this an arithmetic or comparison operation?
    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Subtract
                | Opcode::LessThan
                | Opcode::GreaterThan
                | Opcode::Multiply
                | Opcode::Divide
                | Opcode::Modulo
                | Opcode::Equals
        )
    }

    /// Is this a message send?
    pub fn is_send(&self) -> bool {
        matches!(self, Opcode::Send { .. })
    }

    /// Does this push a value onto the context stack without consuming any?
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            Opcode::PushField(_)
                | Opcode::PushTemp(_)
                | Opcode::PushLiteral(_)
                | Opcode::PushReceiver
                | Opcode::PushTrue
                | Opcode::PushFalse
                | Opcode::PushNil
        )
    }

    /// Does this end the activation?
    pub fn is_return(&self) -> bool {
        matches!(self, Opcode::ReturnTop | Opcode::ReturnReceiver)
    }

    /// Mnemonic, e.g. `push_literal_3`
    pub fn name(&self) -> String {
        match self {
            Opcode::PushField(n) => format!("push_field_{n}"),
            Opcode::PushTemp(n) => format!("push_temp_{n}"),
            Opcode::PushLiteral(n) => format!("push_literal_{n}"),
            Opcode::PushReceiver => "push_receiver".into(),
            Opcode::PushTrue => "push_true".into(),
            Opcode::PushFalse => "push_false".into(),
            Opcode::PushNil => "push_nil".into(),
            Opcode::ReturnTop => "return_top".into(),
            Opcode::ReturnReceiver => "return_receiver".into(),
            Opcode::Add => "add".into(),
            Opcode::Subtract => "subtract".into(),
            Opcode::LessThan => "less_than".into(),
            Opcode::GreaterThan => "greater_than".into(),
            Opcode::Multiply => "multiply".into(),
            Opcode::Divide => "divide".into(),
            Opcode::Modulo => "modulo".into(),
            Opcode::Equals => "equals".into(),
            Opcode::Send { selector, args } => format!("send_literal_{selector}_args_{args}"),
            Opcode::Unknown => "unknown".into(),
        }
    }

    /// One-line English description of what the instruction does
    pub fn describe(&self) -> String {
        match self {
            Opcode::PushField(n) => {
                format!("Push field {n} of the receiver onto the context stack")
            }
            Opcode::PushTemp(n) => {
                format!("Push temporary variable {n} onto the context stack")
            }
            Opcode::PushLiteral(n) => {
                format!("Push method literal {n} onto the context stack")
            }
            Opcode::PushReceiver => "Push the receiver (self) onto the context stack".into(),
            Opcode::PushTrue => "Push true onto the context stack".into(),
            Opcode::PushFalse => "Push false onto the context stack".into(),
            Opcode::PushNil => "Push nil onto the context stack".into(),
            Opcode::ReturnTop => "Return the top of the context stack as the result".into(),
            Opcode::ReturnReceiver => "Return the receiver (self) as the result".into(),
            Opcode::Add => binary("add them"),
            Opcode::Subtract => binary("subtract the second from the first"),
            Opcode::LessThan => binary("push true if the first is less than the second"),
            Opcode::GreaterThan => {
                binary("push true if the first is greater than the second")
            }
            Opcode::Multiply => binary("multiply them"),
            Opcode::Divide => binary("divide the first by the second (quotient must be exact)"),
            Opcode::Modulo => {
                binary("take the first modulo the second (result has the sign of the second)")
            }
            Opcode::Equals => binary("push true if they are equal"),
            Opcode::Send { selector, args } => format!(
                "Send the selector in literal {selector} with {args} argument(s) (method call)"
            ),
            Opcode::Unknown => "Unknown instruction".into(),
        }
    }
}

fn binary(action: &str) -> String {
    format!("Pop two integers from the context stack, {action}, push the result")
}

/// Decode a method's bytecode into instructions
pub fn decode(bytes: &[u8]) -> Vec<Instruction> {
    bytes
        .iter()
        .enumerate()
        .map(|(pc, &byte)| Instruction {
            pc,
            byte,
            opcode: Opcode::decode(byte),
        })
        .collect()
}

/// Numbered, hex-annotated English interpretation of a whole method
pub fn interpret_in_english(bytes: &[u8]) -> String {
    decode(bytes)
        .iter()
        .map(|inst| {
            format!(
                "{}. 0x{:02x}: {}",
                inst.pc + 1,
                inst.byte,
                inst.opcode.describe()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `[0x70, 0x70, 0xb8, 0x7c]`
pub fn format_bytes(bytes: &[u8]) -> String {
    let items: Vec<String> = bytes.iter().map(|b| format!("0x{b:02x}")).collect();
    format!("[{}]", items.join(", "))
}
