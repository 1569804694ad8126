// catalyst - Smalltalk bytecode to WebAssembly JIT demo
//
// Boots the demo image, runs its methods until they turn hot, and hands the
// hot ones to the translation pipeline. Translated methods keep running
// through their compiled routines.
//
// Usage:
//   catalyst                                    # offline baseline backend
//   catalyst --keys keys.txt --provider anthropic
//   catalyst --method SmallInteger>>polynomial --stats-json

use anyhow::{bail, Context, Result};
use catalyst::config::{self, Keys};
use catalyst::stats::Report;
use catalyst::{
    image, Backend, Catalyst, CatalystConfig, MethodRef, MethodTable, ProviderConfig,
    ProviderKind, Value, Vm, VmConfig,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "catalyst")]
#[command(about = "Validated JIT translation of Smalltalk methods to WebAssembly")]
#[command(version)]
struct Args {
    /// API keys file (`provider=key` or `Provider API key: key` lines)
    #[arg(long)]
    keys: Option<PathBuf>,

    /// Synthesis provider: openai, anthropic or baseline
    #[arg(long)]
    provider: Option<String>,

    /// Override the provider endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Override the provider model
    #[arg(long)]
    model: Option<String>,

    /// Attempts per translation
    #[arg(long, default_value = "2")]
    attempts: usize,

    /// Canonical receiver for equivalence checks
    #[arg(long, default_value = "100", allow_hyphen_values = true)]
    receiver: i32,

    /// Invocations before a method is translated
    #[arg(long, default_value = "10")]
    hot_threshold: u64,

    /// Invocations of each method
    #[arg(long, default_value = "20")]
    invocations: u32,

    /// Only run this method (Class>>selector)
    #[arg(long)]
    method: Option<String>,

    /// Print statistics as JSON on stdout
    #[arg(long)]
    stats_json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn provider_config(args: &Args) -> Result<ProviderConfig> {
    let keys = match &args.keys {
        Some(path) => config::load_keys(path)?,
        None => Keys::default(),
    };

    let kind = match &args.provider {
        Some(name) => name.parse::<ProviderKind>()?,
        None => keys.primary().unwrap_or(ProviderKind::Baseline),
    };

    let mut provider = ProviderConfig::new(kind);
    provider.api_key = keys.get(kind).map(str::to_string);
    if let Some(endpoint) = &args.endpoint {
        provider.endpoint = endpoint.clone();
    }
    if let Some(model) = &args.model {
        provider.model = model.clone();
    }
    Ok(provider.with_env_key())
}

/// Methods to exercise, as (class name, method)
fn select_methods(vm: &Vm, filter: Option<&str>) -> Result<Vec<(String, MethodRef)>> {
    let all = vm.with_memory(|memory| memory.methods());
    let Some(filter) = filter else {
        return Ok(all);
    };
    let Some((class, selector)) = filter.split_once(">>") else {
        bail!("Method must be given as Class>>selector, got `{filter}`");
    };
    let method = vm
        .method(class, selector)
        .with_context(|| format!("No method {class}>>{selector} in the image"))?;
    Ok(vec![(class.to_string(), method)])
}

fn receiver_for(vm: &Vm, class: &str, i: i32) -> Option<Value> {
    match class {
        "SmallInteger" => Some(Value::SmallInteger(i)),
        "Point" => vm.with_memory(|memory| image::point(memory, i, i + 1)),
        _ => None,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.verbose {
        eprintln!("catalyst - Smalltalk to WebAssembly JIT");
        eprintln!("=======================================");
    }

    let provider = provider_config(&args)?;
    let backend = Backend::from_config(&provider).context("Failed to configure synthesis backend")?;
    if args.verbose {
        eprintln!("Provider: {} ({})", provider.kind, provider.model);
    }

    let table = Arc::new(MethodTable::new());
    let vm_config = VmConfig {
        hot_threshold: args.hot_threshold,
        ..VmConfig::default()
    };
    let vm = Arc::new(Vm::new(image::boot(), table.clone(), vm_config));

    let config = CatalystConfig {
        max_attempts: args.attempts.max(1),
        canonical_receiver: args.receiver,
        ..CatalystConfig::default()
    };
    let pipeline = Catalyst::new(config, vm.clone(), backend, table.clone());

    let methods = select_methods(&vm, args.method.as_deref())?;
    if args.verbose {
        eprintln!("Methods: {}", methods.len());
    }

    for i in 1..=args.invocations as i32 {
        for (class, method) in &methods {
            let Some(receiver) = receiver_for(&vm, class, i) else {
                continue;
            };
            if let Err(e) = vm.run(method, receiver, Vec::new()) {
                tracing::warn!(selector = method.selector(), error = %e, "invocation failed");
            }
        }

        let hot = vm.take_translation_requests();
        for (method, outcome) in hot.iter().zip(pipeline.translate_all(&hot).await) {
            if args.verbose {
                eprintln!("  #{}: {}", method.selector(), outcome);
            }
        }
    }

    if args.verbose {
        eprintln!();
        for (class, method) in &methods {
            let slot = method.compiled_slot();
            let how = if slot == 0 {
                "interpreted".to_string()
            } else {
                format!("compiled (slot {slot})")
            };
            eprintln!("  {class}>>{}: {how}", method.selector());
        }
        eprintln!("  Table slots: {}", table.len());
    }

    let stats = pipeline.statistics();
    let invocations = vm.invocation_stats();
    if args.stats_json {
        let json = serde_json::json!({
            "catalyst": Report::from(stats),
            "invocations": invocations,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        println!("{stats}");
        println!(
            "Invocations:            {} interpreted, {} compiled",
            invocations.interpreted, invocations.compiled
        );
    }

    Ok(())
}
