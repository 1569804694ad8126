// controller.rs - Translation controller
//
// Drives one translation run per method:
//
//   classify -> reference result (cached) -> loop {
//       build request -> synthesize (await) -> validate -> install | record failure
//   }
//
// Runs are bounded by the attempt budget and cut short when the backend
// repeats the candidate that just failed. Every failure is recovered here;
// callers only learn whether a routine was installed.

use crate::classify;
use crate::config::CatalystConfig;
use crate::engine::Engine;
use crate::error::TranslationError;
use crate::interpreter::Host;
use crate::object::{MethodId, MethodRef, Value};
use crate::prompt::{self, FailureRecord};
use crate::stats::Statistics;
use crate::synth::Synthesizer;
use crate::table::MethodTable;
use crate::validate::{Stage, Validation, Validator, Verdict};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Why a request did not start a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A run for the method is already active
    InFlight,
    /// The method already has a compiled routine
    AlreadyCompiled,
    /// Translation is switched off
    Disabled,
}

/// Result of a translation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationOutcome {
    Installed { slot: u32, attempts: usize },
    NotInstalled { reason: TranslationError, attempts: usize },
    Skipped(SkipReason),
}

impl TranslationOutcome {
    pub fn is_installed(&self) -> bool {
        matches!(self, TranslationOutcome::Installed { .. })
    }
}

impl std::fmt::Display for TranslationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslationOutcome::Installed { slot, attempts } => {
                write!(f, "installed in slot {slot} after {attempts} attempt(s)")
            }
            TranslationOutcome::NotInstalled { reason, attempts } => {
                write!(f, "not installed after {attempts} attempt(s): {reason}")
            }
            TranslationOutcome::Skipped(reason) => write!(f, "skipped ({reason:?})"),
        }
    }
}

struct State {
    /// Reference results, including failed evaluations
    oracle_cache: HashMap<MethodId, Option<Value>>,
    in_flight: HashSet<MethodId>,
    stats: Statistics,
    enabled: bool,
    /// Routines installed so far; numbers the requested function names
    installed: usize,
}

/// Clears a method's in-flight marker when the run ends
struct InFlight<'a> {
    state: &'a Mutex<State>,
    method: MethodId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state.lock().in_flight.remove(&self.method);
    }
}

/// The translation pipeline
pub struct Catalyst<H: Host, S: Synthesizer> {
    config: CatalystConfig,
    host: H,
    synth: S,
    table: Arc<MethodTable>,
    engine: Engine,
    state: Mutex<State>,
}

impl<H: Host, S: Synthesizer> Catalyst<H, S> {
    /// `table` must be the table `host` dispatches through
    pub fn new(config: CatalystConfig, host: H, synth: S, table: Arc<MethodTable>) -> Self {
        Catalyst {
            engine: Engine::new(config.fuel),
            config,
            host,
            synth,
            table,
            state: Mutex::new(State {
                oracle_cache: HashMap::new(),
                in_flight: HashSet::new(),
                stats: Statistics::default(),
                enabled: true,
                installed: 0,
            }),
        }
    }

    pub fn config(&self) -> &CatalystConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn synthesizer(&self) -> &S {
        &self.synth
    }

    pub fn table(&self) -> &Arc<MethodTable> {
        &self.table
    }

    pub fn statistics(&self) -> Statistics {
        self.state.lock().stats
    }

    pub fn reset_statistics(&self) {
        self.state.lock().stats.reset();
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Forget cached reference results. For tools and tests only.
    pub fn clear_oracle_cache(&self) {
        self.state.lock().oracle_cache.clear();
    }

    /// Translate each method in turn
    pub async fn translate_all(&self, methods: &[MethodRef]) -> Vec<TranslationOutcome> {
        let mut outcomes = Vec::with_capacity(methods.len());
        for method in methods {
            outcomes.push(self.translate(method).await);
        }
        outcomes
    }

    /// Try to install a validated compiled routine for `method`
    pub async fn translate(&self, method: &MethodRef) -> TranslationOutcome {
        {
            let mut state = self.state.lock();
            state.stats.translation_requests += 1;
            if !state.enabled {
                return TranslationOutcome::Skipped(SkipReason::Disabled);
            }
            if method.compiled_slot() != 0 {
                state.stats.already_compiled += 1;
                return TranslationOutcome::Skipped(SkipReason::AlreadyCompiled);
            }
            if !state.in_flight.insert(method.id()) {
                state.stats.skipped_in_flight += 1;
                tracing::debug!(selector = method.selector(), "translation already in flight");
                return TranslationOutcome::Skipped(SkipReason::InFlight);
            }
        }
        let _in_flight = InFlight {
            state: &self.state,
            method: method.id(),
        };

        let outcome = self.run(method).await;
        match &outcome {
            TranslationOutcome::Installed { .. } => {
                tracing::info!(selector = method.selector(), %outcome, "translation finished");
            }
            _ => {
                tracing::info!(selector = method.selector(), %outcome, "translation abandoned, method stays interpreted");
            }
        }
        outcome
    }

    async fn run(&self, method: &MethodRef) -> TranslationOutcome {
        let classification = classify::classify(method.bytecodes(), &self.config.limits());
        if !classification.eligible {
            self.state.lock().stats.ineligible += 1;
            return TranslationOutcome::NotInstalled {
                reason: TranslationError::AnalysisIneligible {
                    reason: classification.reason(),
                },
                attempts: 0,
            };
        }

        let receiver = Value::SmallInteger(self.config.canonical_receiver);
        let Some(expected) = self.reference(method, &receiver) else {
            return TranslationOutcome::NotInstalled {
                reason: TranslationError::OracleUnavailable,
                attempts: 0,
            };
        };

        let budget = self.config.max_attempts;
        let mut history: Vec<FailureRecord> = Vec::new();
        let mut last_error = TranslationError::SynthesisUnavailable;

        for attempt in 1..=budget {
            let function_name = {
                let mut state = self.state.lock();
                state.stats.synthesis_attempts += 1;
                if attempt > 1 {
                    state.stats.retry_attempts += 1;
                }
                format!("{}_{}", self.config.function_prefix, state.installed)
            };
            let request = prompt::build(
                method,
                &classification.profile,
                attempt,
                budget,
                &function_name,
                &history,
            );
            tracing::debug!(selector = method.selector(), attempt, prompt = %request.prompt, "requesting candidate");

            let Some(candidate) = self.synth.generate(&request).await else {
                self.state.lock().stats.synthesis_unavailable += 1;
                tracing::warn!(selector = method.selector(), attempt, "no candidate from synthesis backend");
                last_error = TranslationError::SynthesisUnavailable;
                continue;
            };
            self.state.lock().stats.candidates_received += 1;

            if history
                .last()
                .is_some_and(|previous| previous.candidate.trim() == candidate.trim())
            {
                self.state.lock().stats.no_progress_aborts += 1;
                tracing::info!(selector = method.selector(), attempt, "candidate repeats the previous failure");
                return TranslationOutcome::NotInstalled {
                    reason: TranslationError::NoProgress,
                    attempts: attempt,
                };
            }

            let validator = Validator {
                host: &self.host,
                table: &self.table,
                engine: &self.engine,
                benign_patterns: &self.config.benign_validation_patterns,
            };
            let validation = validator.validate(&candidate, method, &receiver, &expected);
            self.record(&validation);

            match validation.verdict {
                Verdict::Accepted(routine) => {
                    return match self.table.install(method, routine) {
                        Ok(slot) => {
                            let mut state = self.state.lock();
                            state.stats.installs += 1;
                            state.installed += 1;
                            if attempt > 1 {
                                state.stats.retry_successes += 1;
                            }
                            TranslationOutcome::Installed {
                                slot,
                                attempts: attempt,
                            }
                        }
                        Err(e) => {
                            tracing::error!(selector = method.selector(), error = %e, "validated routine could not be installed");
                            TranslationOutcome::NotInstalled {
                                reason: TranslationError::ValidationError {
                                    message: format!("install failed: {e}"),
                                },
                                attempts: attempt,
                            }
                        }
                    };
                }
                Verdict::Rejected(error) => {
                    tracing::info!(
                        selector = method.selector(),
                        attempt,
                        classification = error.label(),
                        %error,
                        "candidate rejected"
                    );
                    history.push(FailureRecord {
                        attempt,
                        candidate,
                        error: error.clone(),
                        dump: validation.dump,
                        expected: expected.clone(),
                    });
                    last_error = error;
                }
            }
        }

        TranslationOutcome::NotInstalled {
            reason: last_error,
            attempts: budget,
        }
    }

    /// Reference result for `method`, evaluated at most once
    fn reference(&self, method: &MethodRef, receiver: &Value) -> Option<Value> {
        if let Some(cached) = self.state.lock().oracle_cache.get(&method.id()) {
            return cached.clone();
        }

        let result = self.host.evaluate(method, receiver);
        let mut state = self.state.lock();
        state.stats.oracle_evaluations += 1;
        if result.is_none() {
            state.stats.oracle_unavailable += 1;
            tracing::info!(selector = method.selector(), "no reference result, translation abandoned");
        }
        state.oracle_cache.insert(method.id(), result.clone());
        result
    }

    fn record(&self, validation: &Validation) {
        let mut state = self.state.lock();
        let stats = &mut state.stats;
        if !validation.reached(Stage::SyntaxChecked) {
            stats.parse_failures += 1;
            return;
        }
        if !validation.reached(Stage::BinaryValidated) {
            stats.binary_validations_failed += 1;
            return;
        }
        if validation.downgraded.is_some() {
            stats.binary_validations_downgraded += 1;
        } else {
            stats.binary_validations_passed += 1;
        }
        if validation.is_accepted() {
            stats.execution_comparisons_passed += 1;
        } else {
            stats.execution_comparisons_failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image;
    use crate::interpreter::{Vm, VmConfig};
    use crate::prompt::SynthesisRequest;
    use crate::synth::BaselineProvider;

    struct Silent;

    impl Synthesizer for Silent {
        async fn generate(&self, _request: &SynthesisRequest) -> Option<String> {
            None
        }
    }

    /// Always answers with the same candidate
    struct Fixed(&'static str);

    impl Synthesizer for Fixed {
        async fn generate(&self, _request: &SynthesisRequest) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn vm() -> Arc<Vm> {
        Arc::new(Vm::new(image::boot(), Arc::new(MethodTable::new()), VmConfig::default()))
    }

    fn catalyst<S: Synthesizer>(vm: &Arc<Vm>, synth: S) -> Catalyst<Arc<Vm>, S> {
        Catalyst::new(CatalystConfig::default(), vm.clone(), synth, vm.table().clone())
    }

    #[tokio::test]
    async fn test_baseline_installs() {
        let vm = vm();
        let c = catalyst(&vm, BaselineProvider);
        let method = vm.method("SmallInteger", "polynomial").unwrap();

        let outcome = c.translate(&method).await;
        assert_eq!(outcome, TranslationOutcome::Installed { slot: 1, attempts: 1 });
        assert_eq!(method.compiled_slot(), 1);
        assert_eq!(vm.run(&method, Value::SmallInteger(100), vec![]).unwrap(), Value::SmallInteger(10307));
        assert_eq!(vm.invocation_stats().compiled, 1);

        let again = c.translate(&method).await;
        assert_eq!(again, TranslationOutcome::Skipped(SkipReason::AlreadyCompiled));
        assert_eq!(c.statistics().installs, 1);
    }

    #[tokio::test]
    async fn test_silent_backend_exhausts_budget() {
        let vm = vm();
        let c = catalyst(&vm, Silent);
        let method = vm.method("SmallInteger", "squared").unwrap();

        let outcome = c.translate(&method).await;
        assert_eq!(
            outcome,
            TranslationOutcome::NotInstalled {
                reason: TranslationError::SynthesisUnavailable,
                attempts: 2
            }
        );
        let stats = c.statistics();
        assert_eq!(stats.synthesis_attempts, 2);
        assert_eq!(stats.synthesis_unavailable, 2);
        assert_eq!(stats.oracle_evaluations, 1);
        assert_eq!(stats.candidates_received, 0);
    }

    #[tokio::test]
    async fn test_downgraded_candidate_is_counted_and_compared() {
        let vm = vm();
        let config = CatalystConfig {
            max_attempts: 1,
            benign_validation_patterns: vec!["type mismatch".into()],
            ..CatalystConfig::default()
        };
        let c = Catalyst::new(
            config,
            vm.clone(),
            Fixed("(func $f (param $context i32) i32.add drop)"),
            vm.table().clone(),
        );
        let method = vm.method("SmallInteger", "squared").unwrap();

        let outcome = c.translate(&method).await;
        assert!(matches!(
            outcome,
            TranslationOutcome::NotInstalled {
                reason: TranslationError::ExecutionMismatch { .. },
                attempts: 1
            }
        ));
        let stats = c.statistics();
        assert_eq!(stats.binary_validations_downgraded, 1);
        assert_eq!(stats.binary_validations_passed, 0);
        assert_eq!(stats.binary_validations_failed, 0);
        assert_eq!(stats.execution_comparisons_failed, 1);
        assert_eq!(stats.validations(), 1);
        assert_eq!(method.compiled_slot(), 0);
    }

    #[tokio::test]
    async fn test_disabled() {
        let vm = vm();
        let c = catalyst(&vm, BaselineProvider);
        c.set_enabled(false);
        let method = vm.method("SmallInteger", "squared").unwrap();
        assert_eq!(c.translate(&method).await, TranslationOutcome::Skipped(SkipReason::Disabled));
        assert_eq!(method.compiled_slot(), 0);
    }

    #[tokio::test]
    async fn test_oracle_failure_is_cached() {
        let vm = vm();
        let c = catalyst(&vm, Silent);
        // Point>>x on a SmallInteger receiver has no field to read
        let method = vm.method("Point", "x").unwrap();

        for _ in 0..3 {
            let outcome = c.translate(&method).await;
            assert_eq!(
                outcome,
                TranslationOutcome::NotInstalled {
                    reason: TranslationError::OracleUnavailable,
                    attempts: 0
                }
            );
        }
        let stats = c.statistics();
        assert_eq!(stats.oracle_evaluations, 1);
        assert_eq!(stats.oracle_unavailable, 1);
        assert_eq!(stats.synthesis_attempts, 0);

        c.clear_oracle_cache();
        c.translate(&method).await;
        assert_eq!(c.statistics().oracle_evaluations, 2);
    }

    #[tokio::test]
    async fn test_hot_methods_drain_into_translations() {
        let table = Arc::new(MethodTable::new());
        let config = VmConfig {
            hot_threshold: 2,
            ..VmConfig::default()
        };
        let vm = Arc::new(Vm::new(image::boot(), table.clone(), config));
        let c = Catalyst::new(CatalystConfig::default(), vm.clone(), BaselineProvider, table);

        for _ in 0..2 {
            vm.send(Value::SmallInteger(9), "squared", vec![]).unwrap();
            vm.send(Value::SmallInteger(9), "fourth", vec![]).unwrap();
        }
        let requests = vm.take_translation_requests();
        let selectors: Vec<&str> = requests.iter().map(|m| m.selector()).collect();
        assert_eq!(selectors, vec!["squared", "fourth"]);

        let outcomes = c.translate_all(&requests).await;
        assert!(outcomes[0].is_installed());
        assert!(matches!(
            outcomes[1],
            TranslationOutcome::NotInstalled {
                reason: TranslationError::AnalysisIneligible { .. },
                ..
            }
        ));
        assert_eq!(vm.send(Value::SmallInteger(9), "fourth", vec![]).unwrap(), Value::SmallInteger(6561));
    }
}
