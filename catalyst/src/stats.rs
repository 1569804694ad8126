// stats.rs - Statistics register
//
// Counters for the translation pipeline. Purely observational.

use serde::Serialize;

/// Pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub translation_requests: u64,
    pub skipped_in_flight: u64,
    pub already_compiled: u64,
    pub ineligible: u64,
    pub oracle_evaluations: u64,
    pub oracle_unavailable: u64,
    pub synthesis_attempts: u64,
    pub candidates_received: u64,
    pub synthesis_unavailable: u64,
    pub parse_failures: u64,
    pub binary_validations_passed: u64,
    pub binary_validations_failed: u64,
    pub binary_validations_downgraded: u64,
    pub execution_comparisons_passed: u64,
    pub execution_comparisons_failed: u64,
    pub retry_attempts: u64,
    pub retry_successes: u64,
    pub no_progress_aborts: u64,
    pub installs: u64,
}

/// Derived percentages, 0-100
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Rates {
    pub validation_success: u64,
    pub binary_validation_success: u64,
    pub retry_success: u64,
    pub synthesis_success: u64,
}

fn percent(part: u64, whole: u64) -> u64 {
    if whole == 0 {
        0
    } else {
        ((part as f64 / whole as f64) * 100.0).round() as u64
    }
}

impl Statistics {
    /// Candidates the validator judged, whichever gate ended the run.
    /// Repeats stopped by the no-progress guard never reach it.
    pub fn validations(&self) -> u64 {
        self.parse_failures
            + self.binary_validations_failed
            + self.execution_comparisons_passed
            + self.execution_comparisons_failed
    }

    pub fn rates(&self) -> Rates {
        let binary_checked = self.binary_validations_passed
            + self.binary_validations_failed
            + self.binary_validations_downgraded;
        Rates {
            validation_success: percent(self.execution_comparisons_passed, self.validations()),
            binary_validation_success: percent(
                self.binary_validations_passed + self.binary_validations_downgraded,
                binary_checked,
            ),
            retry_success: percent(self.retry_successes, self.retry_attempts),
            synthesis_success: percent(self.candidates_received, self.synthesis_attempts),
        }
    }

    pub fn reset(&mut self) {
        *self = Statistics::default();
    }
}

/// Statistics plus rates, for reporting
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Report {
    #[serde(flatten)]
    pub counters: Statistics,
    pub rates: Rates,
}

impl From<Statistics> for Report {
    fn from(counters: Statistics) -> Self {
        Report {
            rates: counters.rates(),
            counters,
        }
    }
}

impl std::fmt::Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rates = self.rates();
        writeln!(f, "Translation requests:   {}", self.translation_requests)?;
        writeln!(
            f,
            "  skipped:              {} in flight, {} already compiled, {} ineligible",
            self.skipped_in_flight, self.already_compiled, self.ineligible
        )?;
        writeln!(
            f,
            "Oracle evaluations:     {} ({} unavailable)",
            self.oracle_evaluations, self.oracle_unavailable
        )?;
        writeln!(
            f,
            "Synthesis attempts:     {} ({} candidates, {} unavailable, {}%)",
            self.synthesis_attempts,
            self.candidates_received,
            self.synthesis_unavailable,
            rates.synthesis_success
        )?;
        writeln!(f, "Parse failures:         {}", self.parse_failures)?;
        writeln!(
            f,
            "Binary validation:      {} passed, {} failed, {} downgraded ({}%)",
            self.binary_validations_passed,
            self.binary_validations_failed,
            self.binary_validations_downgraded,
            rates.binary_validation_success
        )?;
        writeln!(
            f,
            "Execution comparison:   {} passed, {} failed ({}%)",
            self.execution_comparisons_passed,
            self.execution_comparisons_failed,
            rates.validation_success
        )?;
        writeln!(
            f,
            "Retries:                {} attempts, {} successes ({}%), {} no-progress aborts",
            self.retry_attempts, self.retry_successes, rates.retry_success, self.no_progress_aborts
        )?;
        write!(f, "Installs:               {}", self.installs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates() {
        let stats = Statistics {
            synthesis_attempts: 3,
            candidates_received: 2,
            execution_comparisons_passed: 1,
            binary_validations_passed: 1,
            binary_validations_failed: 1,
            retry_attempts: 1,
            ..Statistics::default()
        };
        let rates = stats.rates();
        assert_eq!(stats.validations(), 2);
        assert_eq!(rates.synthesis_success, 67);
        assert_eq!(rates.validation_success, 50);
        assert_eq!(rates.binary_validation_success, 50);
        assert_eq!(rates.retry_success, 0);
    }

    #[test]
    fn test_repeated_candidate_is_not_a_validation() {
        // One wrong candidate, then the same text again
        let stats = Statistics {
            synthesis_attempts: 2,
            candidates_received: 2,
            binary_validations_passed: 1,
            execution_comparisons_failed: 1,
            no_progress_aborts: 1,
            ..Statistics::default()
        };
        assert_eq!(stats.validations(), 1);
        assert_eq!(stats.rates().validation_success, 0);

        let accepted_after_repeat = Statistics {
            execution_comparisons_passed: 1,
            ..stats
        };
        assert_eq!(accepted_after_repeat.validations(), 2);
        assert_eq!(accepted_after_repeat.rates().validation_success, 50);
    }

    #[test]
    fn test_empty_rates_are_zero() {
        assert_eq!(Statistics::default().rates(), Rates::default());
    }

    #[test]
    fn test_reset() {
        let mut stats = Statistics {
            installs: 4,
            ..Statistics::default()
        };
        stats.reset();
        assert_eq!(stats, Statistics::default());
    }

    #[test]
    fn test_report_serializes_flat() {
        let report = Report::from(Statistics {
            installs: 1,
            ..Statistics::default()
        });
        let json = serde_json::to_value(report).unwrap();
        assert_eq!(json["installs"], 1);
        assert_eq!(json["rates"]["retry_success"], 0);
    }
}
