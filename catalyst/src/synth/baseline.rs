// synth/baseline.rs - Offline backend
//
// Lowers the bytecode directly (translate -> wasm_builder) and hands back
// the printed module. It has one answer per method, so retries get nothing.

use super::Synthesizer;
use crate::prompt::SynthesisRequest;
use crate::{translate, wasm_builder};
use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineProvider;

impl BaselineProvider {
    fn lower(request: &SynthesisRequest) -> Result<String> {
        let module = translate::translate(&request.bytecodes, &request.function_name, false)
            .with_context(|| format!("Failed to lower #{}", request.selector))?;
        let binary = wasm_builder::build(&module).context("Failed to build routine")?;
        wasmprinter::print_bytes(binary).context("Failed to print routine")
    }
}

impl Synthesizer for BaselineProvider {
    async fn generate(&self, request: &SynthesisRequest) -> Option<String> {
        if request.is_retry() {
            return None;
        }
        match Self::lower(request) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::debug!(error = %format!("{e:#}"), "baseline lowering declined");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(bytecodes: Vec<u8>, attempt: usize) -> SynthesisRequest {
        SynthesisRequest {
            selector: "m".into(),
            bytecodes,
            literals: vec![],
            function_name: "translated_method_0".into(),
            attempt,
            max_attempts: 2,
            prompt: String::new(),
        }
    }

    #[tokio::test]
    async fn test_lowers_leaf_method() {
        let text = BaselineProvider
            .generate(&request(vec![0x70, 0x70, 0xb8, 0x7c], 1))
            .await
            .unwrap();
        assert!(text.starts_with("(module"));
        assert!(text.contains("$translated_method_0"));
    }

    #[tokio::test]
    async fn test_declines_sends_and_retries() {
        assert!(BaselineProvider.generate(&request(vec![0x70, 0xd0, 0x7c], 1)).await.is_none());
        assert!(BaselineProvider.generate(&request(vec![0x70, 0x70, 0xb8, 0x7c], 2)).await.is_none());
    }
}
