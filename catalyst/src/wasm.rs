// wasm.rs - Candidate assembly, encoding, binary validation and dumps
//
// A candidate is WAT text: either a bare `(func ...)` or a complete
// `(module ...)`. Bare functions are wrapped in a module that declares the
// import surface and exports the function as the routine entry point.

use crate::engine::{ENTRY_EXPORT, IMPORTS, IMPORT_MODULE};
use anyhow::{Context as _, Result};
use std::fmt::Write as _;
use wasmparser::{Parser, Payload, Validator};

/// Outcome of the binary-validity gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryCheck {
    /// Structurally valid
    Ok,
    /// Rejected by the validator for a feature the execution engine
    /// handles on its own; the pipeline carries on
    BenignMismatch(String),
    /// Malformed
    Err(String),
}

/// WAT declarations for the import surface, one per line
pub fn import_prelude() -> String {
    let mut out = String::new();
    for import in IMPORTS {
        let params = vec!["i32"; import.params.len()].join(" ");
        let results = if import.results > 0 { " (result i32)" } else { "" };
        let _ = writeln!(
            out,
            "  (import \"{IMPORT_MODULE}\" \"{name}\" (func ${name} (param {params}){results}))",
            name = import.name,
        );
    }
    out
}

/// Name of a bare function candidate, e.g. `$translated_method_0`
fn function_name(func: &str) -> Option<&str> {
    let rest = func.strip_prefix("(func")?.trim_start();
    if !rest.starts_with('$') {
        return None;
    }
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Wrap a candidate into a complete module text
pub fn assemble(candidate: &str) -> String {
    let candidate = candidate.trim();
    if candidate.starts_with("(module") {
        return candidate.to_string();
    }

    let mut module = String::from("(module\n");
    module.push_str(&import_prelude());
    module.push_str("  ");
    module.push_str(candidate);
    module.push('\n');

    if !candidate.contains(&format!("(export \"{ENTRY_EXPORT}\"")) {
        let target = match function_name(candidate) {
            Some(name) => name.to_string(),
            // Defined functions are numbered after the imports
            None => IMPORTS.len().to_string(),
        };
        let _ = writeln!(module, "  (export \"{ENTRY_EXPORT}\" (func {target}))");
    }
    module.push(')');
    module
}

/// Text-to-binary encoder
pub fn parse(text: &str) -> std::result::Result<Vec<u8>, String> {
    wat::parse_str(text).map_err(|e| e.to_string())
}

/// Binary-validity gate
pub fn check_binary(binary: &[u8], benign_patterns: &[String]) -> BinaryCheck {
    let mut validator = Validator::new();
    match validator.validate_all(binary) {
        Ok(_) => BinaryCheck::Ok,
        Err(e) => {
            let message = e.to_string();
            let lower = message.to_lowercase();
            if benign_patterns
                .iter()
                .any(|pattern| lower.contains(&pattern.to_lowercase()))
            {
                BinaryCheck::BenignMismatch(message)
            } else {
                BinaryCheck::Err(message)
            }
        }
    }
}

/// Diagnostic dump of a binary: printed text followed by a section walk
pub fn dump(binary: &[u8]) -> String {
    let mut out = String::new();
    match wasmprinter::print_bytes(binary) {
        Ok(text) => out.push_str(&text),
        Err(e) => {
            let _ = writeln!(out, ";; could not print module: {e}");
        }
    }
    out.push_str("\n\n;; ---- section walk ----\n");
    if let Err(e) = walk_sections(binary, &mut out) {
        let _ = writeln!(out, ";; section walk stopped: {e:#}");
    }
    out
}

/// Dump of a candidate that never produced a binary
pub fn parse_failure_dump(message: &str, text: &str) -> String {
    format!(";; parse error: {message}\n\n{text}")
}

fn walk_sections(binary: &[u8], out: &mut String) -> Result<()> {
    let mut function = 0usize;
    for payload in Parser::new(0).parse_all(binary) {
        let payload = payload.context("malformed section")?;
        match payload {
            Payload::Version { .. } | Payload::End(_) => {}
            Payload::TypeSection(reader) => {
                section(out, "type", reader.range(), Some(reader.count()))?;
            }
            Payload::ImportSection(reader) => {
                section(out, "import", reader.range(), Some(reader.count()))?;
                for import in reader {
                    let import = import.context("malformed import")?;
                    writeln!(out, ";;   {}.{}", import.module, import.name)?;
                }
            }
            Payload::FunctionSection(reader) => {
                section(out, "function", reader.range(), Some(reader.count()))?;
            }
            Payload::ExportSection(reader) => {
                section(out, "export", reader.range(), Some(reader.count()))?;
                for export in reader {
                    let export = export.context("malformed export")?;
                    writeln!(out, ";;   {} -> {:?} {}", export.name, export.kind, export.index)?;
                }
            }
            Payload::CodeSectionStart { count, range, .. } => {
                section(out, "code", range, Some(count))?;
            }
            Payload::CodeSectionEntry(body) => {
                let range = body.range();
                writeln!(
                    out,
                    ";;   body {function}: 0x{:04x}..0x{:04x}",
                    range.start, range.end
                )?;
                for local in body.get_locals_reader().context("malformed locals")? {
                    let (count, ty) = local.context("malformed local")?;
                    writeln!(out, ";;     local {count} x {ty:?}")?;
                }
                let mut ops = body.get_operators_reader().context("malformed body")?;
                while !ops.eof() {
                    let offset = ops.original_position();
                    let op = ops.read().context("malformed operator")?;
                    writeln!(out, ";;     0x{offset:04x}: {op:?}")?;
                }
                function += 1;
            }
            Payload::CustomSection(reader) => {
                writeln!(out, ";; custom section \"{}\" ({} bytes)", reader.name(), reader.data().len())?;
            }
            other => {
                if let Some((id, range)) = other.as_section() {
                    writeln!(out, ";; section {id}: {} bytes", range.end - range.start)?;
                }
            }
        }
    }
    Ok(())
}

fn section(out: &mut String, name: &str, range: std::ops::Range<usize>, count: Option<u32>) -> Result<()> {
    write!(out, ";; {name} section: {} bytes", range.end - range.start)?;
    if let Some(count) = count {
        write!(out, ", {count} entries")?;
    }
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE_FUNC: &str = r#"(func $translated_method_0 (param $context i32)
    (local $r i32)
    (local.set $r (call $valueOfSmallInteger (call $contextReceiver (local.get $context))))
    (call $onContextPush (local.get $context)
      (call $smallIntegerForValue (i32.mul (local.get $r) (local.get $r)))))"#;

    fn patterns() -> Vec<String> {
        vec!["gc feature".into(), "reference type".into()]
    }

    #[test]
    fn test_prelude_declares_every_import() {
        let prelude = import_prelude();
        assert_eq!(prelude.lines().count(), IMPORTS.len());
        assert!(prelude.contains(
            "(import \"env\" \"popFromContext\" (func $popFromContext (param i32) (result i32)))"
        ));
        assert!(prelude.contains("(import \"env\" \"onContextPush\" (func $onContextPush (param i32 i32)))"));
    }

    #[test]
    fn test_assemble_named_function() {
        let module = assemble(SQUARE_FUNC);
        assert!(module.starts_with("(module"));
        assert!(module.contains("(export \"run\" (func $translated_method_0))"));
        let binary = parse(&module).unwrap();
        assert_eq!(check_binary(&binary, &patterns()), BinaryCheck::Ok);
    }

    #[test]
    fn test_assemble_anonymous_function_exports_by_index() {
        let module = assemble("(func (param i32))");
        assert!(module.contains(&format!("(export \"run\" (func {}))", IMPORTS.len())));
        assert!(parse(&module).is_ok());
    }

    #[test]
    fn test_assemble_keeps_inline_export() {
        let module = assemble("(func $f (export \"run\") (param i32))");
        assert_eq!(module.matches("(export \"run\"").count(), 1);
        assert!(parse(&module).is_ok());
    }

    #[test]
    fn test_complete_module_is_untouched() {
        let text = "(module (func (param i32)) (export \"run\" (func 0)))";
        assert_eq!(assemble(text), text);
    }

    #[test]
    fn test_parse_error_message() {
        let err = parse("(func $broken (param i32) (i32.frobnicate))").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn test_invalid_binary_is_rejected() {
        // Type mismatch: i32.add on an empty stack
        let binary = wat::parse_str("(module (func (param i32) i32.add drop))").unwrap();
        match check_binary(&binary, &patterns()) {
            BinaryCheck::Err(message) => assert!(!message.is_empty()),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_benign_patterns_downgrade() {
        let binary = wat::parse_str("(module (func (param i32) i32.add drop))").unwrap();
        let everything = vec!["".to_string()];
        assert!(matches!(check_binary(&binary, &everything), BinaryCheck::BenignMismatch(_)));
    }

    #[test]
    fn test_dump_walks_sections() {
        let binary = parse(&assemble(SQUARE_FUNC)).unwrap();
        let text = dump(&binary);
        assert!(text.contains("(module"));
        assert!(text.contains(";; import section"));
        assert!(text.contains(";;   env.onContextPush"));
        assert!(text.contains(";;   body 0"));
        assert!(text.contains("I32Mul"));
    }
}
