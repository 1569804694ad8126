// wasm_builder.rs - Wasm binary generation
//
// Converts the intermediate WasmModule to a routine module using
// wasm-encoder: the import surface, one defined function exported as the
// entry point, and a name section so the printed text reads like a
// hand-written candidate.

use crate::engine::{ENTRY_EXPORT, IMPORTS, IMPORT_MODULE};
use crate::translate::{WasmFunction, WasmInst, WasmModule};
use anyhow::Result;
use wasm_encoder::{
    BlockType, CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection,
    ImportSection, Instruction, Module, NameMap, NameSection, TypeSection, ValType,
};

/// Distinct (params, results) shapes, in first-use order; every operand is i32
fn signatures() -> Vec<(usize, usize)> {
    let mut shapes = Vec::new();
    let entry = (1, 0);
    for shape in IMPORTS
        .iter()
        .map(|i| (i.params.len(), i.results))
        .chain(std::iter::once(entry))
    {
        if !shapes.contains(&shape) {
            shapes.push(shape);
        }
    }
    shapes
}

fn type_index(shapes: &[(usize, usize)], shape: (usize, usize)) -> u32 {
    shapes.iter().position(|s| *s == shape).unwrap_or(0) as u32
}

/// Build the final Wasm binary
pub fn build(module: &WasmModule) -> Result<Vec<u8>> {
    let mut wasm = Module::new();
    let shapes = signatures();

    // ==========================================================================
    // Type section
    // ==========================================================================
    let mut types = TypeSection::new();
    for (params, results) in &shapes {
        types
            .ty()
            .function(vec![ValType::I32; *params], vec![ValType::I32; *results]);
    }
    wasm.section(&types);

    // ==========================================================================
    // Import section
    // ==========================================================================
    let mut imports = ImportSection::new();
    for import in IMPORTS {
        let ty = type_index(&shapes, (import.params.len(), import.results));
        imports.import(IMPORT_MODULE, import.name, EntityType::Function(ty));
    }
    wasm.section(&imports);

    // ==========================================================================
    // Function section
    // ==========================================================================
    let mut functions = FunctionSection::new();
    functions.function(type_index(&shapes, (1, 0)));
    wasm.section(&functions);

    // ==========================================================================
    // Export section
    // ==========================================================================
    let routine_idx = IMPORTS.len() as u32;
    let mut exports = ExportSection::new();
    exports.export(ENTRY_EXPORT, ExportKind::Func, routine_idx);
    wasm.section(&exports);

    // ==========================================================================
    // Code section
    // ==========================================================================
    let mut code = CodeSection::new();
    code.function(&build_function(&module.function)?);
    wasm.section(&code);

    // ==========================================================================
    // Name section
    // ==========================================================================
    let mut func_names = NameMap::new();
    for (idx, import) in IMPORTS.iter().enumerate() {
        func_names.append(idx as u32, import.name);
    }
    func_names.append(routine_idx, &module.function.name);
    let mut names = NameSection::new();
    names.functions(&func_names);
    wasm.section(&names);

    Ok(wasm.finish())
}

fn build_function(func: &WasmFunction) -> Result<Function> {
    let mut wasm_func = Function::new(vec![(1, ValType::I64), (func.num_locals, ValType::I32)]);
    for inst in &func.body {
        emit_instruction(&mut wasm_func, inst)?;
    }
    wasm_func.instruction(&Instruction::End);
    Ok(wasm_func)
}

fn emit_instruction(func: &mut Function, inst: &WasmInst) -> Result<()> {
    match inst {
        // Control flow
        WasmInst::If => {
            func.instruction(&Instruction::If(BlockType::Empty));
        }
        WasmInst::End => {
            func.instruction(&Instruction::End);
        }
        WasmInst::Return => {
            func.instruction(&Instruction::Return);
        }
        WasmInst::Unreachable => {
            func.instruction(&Instruction::Unreachable);
        }
        WasmInst::Call { func_idx } => {
            func.instruction(&Instruction::Call(*func_idx));
        }

        // Locals
        WasmInst::LocalGet { idx } => {
            func.instruction(&Instruction::LocalGet(*idx));
        }
        WasmInst::LocalSet { idx } => {
            func.instruction(&Instruction::LocalSet(*idx));
        }

        WasmInst::I32Const { value } => {
            func.instruction(&Instruction::I32Const(*value));
        }

        // i32
        WasmInst::I32Add => {
            func.instruction(&Instruction::I32Add);
        }
        WasmInst::I32And => {
            func.instruction(&Instruction::I32And);
        }
        WasmInst::I32Xor => {
            func.instruction(&Instruction::I32Xor);
        }
        WasmInst::I32DivS => {
            func.instruction(&Instruction::I32DivS);
        }
        WasmInst::I32RemS => {
            func.instruction(&Instruction::I32RemS);
        }
        WasmInst::I32Eqz => {
            func.instruction(&Instruction::I32Eqz);
        }
        WasmInst::I32Eq => {
            func.instruction(&Instruction::I32Eq);
        }
        WasmInst::I32Ne => {
            func.instruction(&Instruction::I32Ne);
        }
        WasmInst::I32LtS => {
            func.instruction(&Instruction::I32LtS);
        }
        WasmInst::I32GtS => {
            func.instruction(&Instruction::I32GtS);
        }

        // i64
        WasmInst::I64Add => {
            func.instruction(&Instruction::I64Add);
        }
        WasmInst::I64Sub => {
            func.instruction(&Instruction::I64Sub);
        }
        WasmInst::I64Mul => {
            func.instruction(&Instruction::I64Mul);
        }
        WasmInst::I64Ne => {
            func.instruction(&Instruction::I64Ne);
        }

        // Conversions
        WasmInst::I32WrapI64 => {
            func.instruction(&Instruction::I32WrapI64);
        }
        WasmInst::I64ExtendI32S => {
            func.instruction(&Instruction::I64ExtendI32S);
        }

        WasmInst::Select => {
            func.instruction(&Instruction::Select);
        }

        WasmInst::Comment { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, Frame};
    use crate::object::Value;
    use crate::translate::translate;

    fn run(bytes: &[u8], receiver: i32, literals: Vec<Value>) -> Result<Value, crate::error::EngineError> {
        let module = translate(bytes, "translated_method_0", true).unwrap();
        let binary = build(&module).unwrap();
        wasmparser::validate(&binary).unwrap();
        let routine = Engine::new(100_000).compile(&binary).unwrap();
        routine.invoke(Frame {
            receiver: Value::SmallInteger(receiver),
            literals,
            ..Frame::default()
        })
    }

    #[test]
    fn test_signatures_are_shared() {
        let shapes = signatures();
        assert_eq!(shapes.len(), 4);
        assert!(shapes.contains(&(1, 0)));
    }

    #[test]
    fn test_built_routines_match_interpreter() {
        let int = Value::SmallInteger;
        assert_eq!(run(&[0x70, 0x70, 0xb8, 0x7c], 100, vec![]).unwrap(), int(10000));
        assert_eq!(run(&[0x70, 0x20, 0xb1, 0x7c], 5, vec![int(8)]).unwrap(), int(-3));
        assert_eq!(run(&[0x70, 0x20, 0xba, 0x7c], -7, vec![int(2)]).unwrap(), int(1));
        assert_eq!(run(&[0x70, 0x20, 0xba, 0x7c], 7, vec![int(-2)]).unwrap(), int(-1));
        assert_eq!(run(&[0x70, 0x20, 0xb9, 0x7c], 12, vec![int(4)]).unwrap(), int(3));
        assert_eq!(run(&[0x70, 0x20, 0xb3, 0x7c], 100, vec![int(1000)]).unwrap(), Value::False);
        assert_eq!(run(&[0x70, 0x70, 0xbb, 0x7c], 3, vec![]).unwrap(), Value::True);
        assert_eq!(run(&[0x71, 0x7c], 3, vec![]).unwrap(), Value::True);
        assert_eq!(run(&[0x70, 0x70, 0xb0], 3, vec![]).unwrap(), int(3));
        assert_eq!(run(&[0x7d], 9, vec![]).unwrap(), int(9));
    }

    #[test]
    fn test_primitive_failures_trap() {
        let int = Value::SmallInteger;
        assert!(run(&[0x70, 0x70, 0xb8, 0x7c], 100_000, vec![]).is_err());
        assert!(run(&[0x70, 0x20, 0xb9, 0x7c], 7, vec![int(2)]).is_err());
        assert!(run(&[0x70, 0x20, 0xb9, 0x7c], 7, vec![int(0)]).is_err());
    }

    #[test]
    fn test_printed_text_reparses() {
        let module = translate(&[0x70, 0x70, 0xb8, 0x7c], "translated_method_3", false).unwrap();
        let text = wasmprinter::print_bytes(build(&module).unwrap()).unwrap();
        assert!(text.contains("$translated_method_3"));
        assert!(text.contains("(export \"run\""));
        assert!(wat::parse_str(&text).is_ok());
    }
}
