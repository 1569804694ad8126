// translate.rs - Bytecode to WebAssembly lowering
//
// Lowers an eligible method into a single routine in a simplified Wasm IR.
// The context stack is resolved at compile time: every pushed value lives in
// its own local holding an object handle, so the routine only touches the
// real context stack once, to hand back its result.
//
// Local layout of the routine:
//   0      $context (param)
//   1      i64 scratch for overflow-checked arithmetic
//   2, 3   i32 scratch operands
//   4..    one i32 per pushed value

use crate::bytecode::{self, Opcode};
use crate::engine::{import, special};
use anyhow::{bail, Result};

const CONTEXT: u32 = 0;
const WIDE: u32 = 1;
const LEFT: u32 = 2;
const RIGHT: u32 = 3;
const FIRST_VALUE: u32 = 4;

/// A generated Wasm module (intermediate representation)
#[derive(Debug)]
pub struct WasmModule {
    /// The routine
    pub function: WasmFunction,
}

/// A generated Wasm function
#[derive(Debug)]
pub struct WasmFunction {
    /// Function name
    pub name: String,
    /// Wasm instructions
    pub body: Vec<WasmInst>,
    /// Number of i32 locals (beyond the parameter and the i64 scratch)
    pub num_locals: u32,
}

/// Wasm instruction (simplified IR)
#[derive(Debug, Clone, PartialEq)]
pub enum WasmInst {
    // Control flow
    If,
    End,
    Return,
    Unreachable,
    Call { func_idx: u32 },

    // Locals
    LocalGet { idx: u32 },
    LocalSet { idx: u32 },

    // Constants
    I32Const { value: i32 },

    // Arithmetic (i32)
    I32Add,
    I32And,
    I32Xor,
    I32DivS,
    I32RemS,
    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32GtS,

    // Arithmetic (i64)
    I64Add,
    I64Sub,
    I64Mul,
    I64Ne,

    // Conversions
    I32WrapI64,
    I64ExtendI32S,

    // Stack manipulation
    Select,

    // Debug/comments
    Comment { text: String },
}

impl WasmFunction {
    pub fn instruction_count(&self) -> usize {
        self.body
            .iter()
            .filter(|inst| !matches!(inst, WasmInst::Comment { .. }))
            .count()
    }
}

/// Compile-time state of the lowering
struct Lowering {
    body: Vec<WasmInst>,
    /// Locals holding the values on the context stack
    stack: Vec<u32>,
    next_local: u32,
}

impl Lowering {
    fn fresh(&mut self) -> u32 {
        let idx = self.next_local;
        self.next_local += 1;
        idx
    }

    fn pop(&mut self, pc: usize) -> Result<u32> {
        match self.stack.pop() {
            Some(idx) => Ok(idx),
            None => bail!("stack underflow at pc {pc}"),
        }
    }

    /// Call an accessor `(context, index) -> object` and push its result
    fn push_indexed(&mut self, func_idx: u32, index: u8) {
        let idx = self.fresh();
        self.body.push(WasmInst::LocalGet { idx: CONTEXT });
        self.body.push(WasmInst::I32Const {
            value: index as i32,
        });
        self.body.push(WasmInst::Call { func_idx });
        self.body.push(WasmInst::LocalSet { idx });
        self.stack.push(idx);
    }

    fn push_receiver(&mut self) {
        let idx = self.fresh();
        self.body.push(WasmInst::LocalGet { idx: CONTEXT });
        self.body.push(WasmInst::Call {
            func_idx: import::CONTEXT_RECEIVER,
        });
        self.body.push(WasmInst::LocalSet { idx });
        self.stack.push(idx);
    }

    fn push_special(&mut self, which: i32) {
        let idx = self.fresh();
        self.body.push(WasmInst::I32Const { value: which });
        self.body.push(WasmInst::Call {
            func_idx: import::SPECIAL_OBJECT,
        });
        self.body.push(WasmInst::LocalSet { idx });
        self.stack.push(idx);
    }

    /// Unbox the two topmost values into the scratch operands
    fn unbox_operands(&mut self, pc: usize) -> Result<()> {
        let right = self.pop(pc)?;
        let left = self.pop(pc)?;
        for (value, scratch) in [(left, LEFT), (right, RIGHT)] {
            self.body.push(WasmInst::LocalGet { idx: value });
            self.body.push(WasmInst::Call {
                func_idx: import::VALUE_OF_SMALL_INTEGER,
            });
            self.body.push(WasmInst::LocalSet { idx: scratch });
        }
        Ok(())
    }

    /// Box the i32 on the Wasm stack into a fresh value
    fn box_result(&mut self, func_idx: u32) {
        let idx = self.fresh();
        self.body.push(WasmInst::Call { func_idx });
        self.body.push(WasmInst::LocalSet { idx });
        self.stack.push(idx);
    }

    /// Push `cond`; trap if it is non-zero
    fn trap_if(&mut self, cond: Vec<WasmInst>) {
        self.body.extend(cond);
        self.body.push(WasmInst::If);
        self.body.push(WasmInst::Unreachable);
        self.body.push(WasmInst::End);
    }

    /// add, subtract, multiply: computed in i64, trapping when the result
    /// leaves the SmallInteger range
    fn checked(&mut self, op: WasmInst) {
        self.body.extend([
            WasmInst::LocalGet { idx: LEFT },
            WasmInst::I64ExtendI32S,
            WasmInst::LocalGet { idx: RIGHT },
            WasmInst::I64ExtendI32S,
            op,
            WasmInst::LocalSet { idx: WIDE },
        ]);
        self.trap_if(vec![
            WasmInst::LocalGet { idx: WIDE },
            WasmInst::LocalGet { idx: WIDE },
            WasmInst::I32WrapI64,
            WasmInst::I64ExtendI32S,
            WasmInst::I64Ne,
        ]);
        self.body.push(WasmInst::LocalGet { idx: WIDE });
        self.body.push(WasmInst::I32WrapI64);
        self.box_result(import::SMALL_INTEGER_FOR_VALUE);
    }

    fn divide(&mut self) {
        self.trap_if(vec![WasmInst::LocalGet { idx: RIGHT }, WasmInst::I32Eqz]);
        self.trap_if(vec![
            WasmInst::LocalGet { idx: LEFT },
            WasmInst::LocalGet { idx: RIGHT },
            WasmInst::I32RemS,
        ]);
        self.body.extend([
            WasmInst::LocalGet { idx: LEFT },
            WasmInst::LocalGet { idx: RIGHT },
            WasmInst::I32DivS,
        ]);
        self.box_result(import::SMALL_INTEGER_FOR_VALUE);
    }

    /// Floored modulo: the remainder takes the sign of the divisor
    fn modulo(&mut self) {
        self.body.extend([
            WasmInst::LocalGet { idx: LEFT },
            WasmInst::LocalGet { idx: RIGHT },
            WasmInst::I32RemS,
            WasmInst::LocalSet { idx: LEFT },
            // adjusted
            WasmInst::LocalGet { idx: LEFT },
            WasmInst::LocalGet { idx: RIGHT },
            WasmInst::I32Add,
            // plain
            WasmInst::LocalGet { idx: LEFT },
            // r != 0 && sign(r) != sign(divisor)
            WasmInst::LocalGet { idx: LEFT },
            WasmInst::I32Const { value: 0 },
            WasmInst::I32Ne,
            WasmInst::LocalGet { idx: LEFT },
            WasmInst::LocalGet { idx: RIGHT },
            WasmInst::I32Xor,
            WasmInst::I32Const { value: 0 },
            WasmInst::I32LtS,
            WasmInst::I32And,
            WasmInst::Select,
        ]);
        self.box_result(import::SMALL_INTEGER_FOR_VALUE);
    }

    fn compare(&mut self, op: WasmInst) {
        self.body.extend([
            WasmInst::LocalGet { idx: LEFT },
            WasmInst::LocalGet { idx: RIGHT },
            op,
        ]);
        self.box_result(import::BOOLEAN_FOR_VALUE);
    }

    /// Hand `value` back through the context stack and return
    fn return_local(&mut self, value: u32) {
        self.body.extend([
            WasmInst::LocalGet { idx: CONTEXT },
            WasmInst::LocalGet { idx: value },
            WasmInst::Call {
                func_idx: import::ON_CONTEXT_PUSH,
            },
            WasmInst::Return,
        ]);
    }
}

/// Lower a method's bytecode into a single routine named `name`
pub fn translate(bytes: &[u8], name: &str, debug: bool) -> Result<WasmModule> {
    let mut lowering = Lowering {
        body: Vec::new(),
        stack: Vec::new(),
        next_local: FIRST_VALUE,
    };
    let mut returned = false;

    for inst in bytecode::decode(bytes) {
        if debug {
            lowering.body.push(WasmInst::Comment {
                text: format!("{:04}: 0x{:02x} {}", inst.pc, inst.byte, inst.opcode.name()),
            });
        }

        match inst.opcode {
            Opcode::PushField(n) => lowering.push_indexed(import::CONTEXT_RECEIVER_FIELD_AT, n),
            Opcode::PushTemp(n) => lowering.push_indexed(import::CONTEXT_TEMP_AT, n),
            Opcode::PushLiteral(n) => lowering.push_indexed(import::CONTEXT_LITERAL_AT, n),
            Opcode::PushReceiver => lowering.push_receiver(),
            Opcode::PushTrue => lowering.push_special(special::TRUE),
            Opcode::PushFalse => lowering.push_special(special::FALSE),
            Opcode::PushNil => lowering.push_special(special::NIL),

            Opcode::ReturnTop => {
                let top = lowering.pop(inst.pc)?;
                lowering.return_local(top);
                returned = true;
            }
            Opcode::ReturnReceiver => {
                lowering.push_receiver();
                let receiver = lowering.pop(inst.pc)?;
                lowering.return_local(receiver);
                returned = true;
            }

            Opcode::Add | Opcode::Subtract | Opcode::Multiply => {
                lowering.unbox_operands(inst.pc)?;
                lowering.checked(match inst.opcode {
                    Opcode::Add => WasmInst::I64Add,
                    Opcode::Subtract => WasmInst::I64Sub,
                    _ => WasmInst::I64Mul,
                });
            }
            Opcode::Divide => {
                lowering.unbox_operands(inst.pc)?;
                lowering.divide();
            }
            Opcode::Modulo => {
                lowering.unbox_operands(inst.pc)?;
                lowering.modulo();
            }
            Opcode::LessThan | Opcode::GreaterThan | Opcode::Equals => {
                lowering.unbox_operands(inst.pc)?;
                lowering.compare(match inst.opcode {
                    Opcode::LessThan => WasmInst::I32LtS,
                    Opcode::GreaterThan => WasmInst::I32GtS,
                    _ => WasmInst::I32Eq,
                });
            }

            Opcode::Send { .. } => bail!("cannot lower message send at pc {}", inst.pc),
            Opcode::Unknown => bail!("unknown bytecode 0x{:02x} at pc {}", inst.byte, inst.pc),
        }

        if returned {
            break;
        }
    }

    if !returned {
        // Implicit ^self
        lowering.push_receiver();
        let receiver = lowering.pop(bytes.len())?;
        lowering.return_local(receiver);
    }

    Ok(WasmModule {
        function: WasmFunction {
            name: name.to_string(),
            num_locals: lowering.next_local - LEFT,
            body: lowering.body,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_squared_lowering() {
        let module = translate(&[0x70, 0x70, 0xb8, 0x7c], "translated_method_0", false).unwrap();
        let body = &module.function.body;
        assert_eq!(module.function.name, "translated_method_0");
        assert!(body.contains(&WasmInst::I64Mul));
        assert_eq!(body.last(), Some(&WasmInst::Return));
        // two scratch operands plus receiver, receiver, product
        assert_eq!(module.function.num_locals, 5);
    }

    #[test]
    fn test_send_is_not_lowered() {
        assert!(translate(&[0x70, 0xd0, 0x7c], "f", false).is_err());
    }

    #[test]
    fn test_underflow_is_rejected() {
        let err = translate(&[0x70, 0xb0, 0x7c], "f", false).unwrap_err();
        assert!(err.to_string().contains("underflow"));
    }

    #[test]
    fn test_implicit_return_of_receiver() {
        let module = translate(&[0x70, 0x70, 0xb0], "f", false).unwrap();
        let body = &module.function.body;
        let returns = body.iter().filter(|i| **i == WasmInst::Return).count();
        assert_eq!(returns, 1);
        assert_eq!(
            body[body.len() - 2],
            WasmInst::Call {
                func_idx: import::ON_CONTEXT_PUSH
            }
        );
    }

    #[test]
    fn test_dead_code_after_return_is_dropped() {
        let with_tail = translate(&[0x70, 0x7c, 0x70, 0x70, 0xb0], "f", false).unwrap();
        let without = translate(&[0x70, 0x7c], "f", false).unwrap();
        assert_eq!(with_tail.function.body, without.function.body);
    }

    #[test]
    fn test_debug_comments() {
        let module = translate(&[0x70, 0x7c], "f", true).unwrap();
        assert!(matches!(module.function.body[0], WasmInst::Comment { .. }));
        assert_eq!(
            module.function.instruction_count(),
            module.function.body.len() - 2
        );
    }
}
