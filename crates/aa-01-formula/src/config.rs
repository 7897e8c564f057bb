//! Engine limits and activation heights, loaded from the environment.

use shared_types::{Amount, Mci};
use std::env;
use std::str::FromStr;

/// MCIs at which protocol upgrades take effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationHeights {
    /// Second AA upgrade: iteration, freeze/delete, remote getters, object concatenation.
    pub aa2_mci: Mci,
    /// Storage-size accounting against the byte balance.
    pub storage_size_mci: Mci,
    /// Below this MCI, an AA's own balance excludes what the current trigger sent.
    pub bug_compatible_balance_mci: Mci,
}

impl Default for ActivationHeights {
    fn default() -> Self {
        Self { aa2_mci: 0, storage_size_mci: 0, bug_compatible_balance_mci: 0 }
    }
}

/// Limits applied by the validator, the evaluator and the trigger handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AaConfig {
    /// Complexity budget of a definition.
    pub max_complexity: u32,
    /// Operation budget of a definition.
    pub max_ops: u32,
    /// Response units per primary trigger, cascade included.
    pub max_responses_per_primary_trigger: usize,
    /// Smallest allowed base-asset bounce fee.
    pub min_bytes_bounce_fee: Amount,
    /// Longest state variable name.
    pub max_state_var_name_length: usize,
    /// Longest stored state variable text.
    pub max_state_var_value_length: usize,
    /// Longest string a formula may build.
    pub max_aa_string_length: usize,
    /// Largest element count of `map`/`filter`/`reduce`/`foreach`.
    pub max_iterations: u32,
    /// Entries kept in the parsed formula cache.
    pub formula_cache_capacity: usize,
    /// Upgrade heights.
    pub activation: ActivationHeights,
}

impl Default for AaConfig {
    fn default() -> Self {
        Self {
            max_complexity: 100,
            max_ops: 2000,
            max_responses_per_primary_trigger: 10,
            min_bytes_bounce_fee: 10_000,
            max_state_var_name_length: 128,
            max_state_var_value_length: 1024,
            max_aa_string_length: 4096,
            max_iterations: 100,
            formula_cache_capacity: 1000,
            activation: ActivationHeights::default(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl AaConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `AA_MAX_COMPLEXITY` (default: 100)
    /// - `AA_MAX_OPS` (default: 2000)
    /// - `AA_MAX_RESPONSES_PER_PRIMARY_TRIGGER` (default: 10)
    /// - `AA_MIN_BYTES_BOUNCE_FEE` (default: 10000)
    /// - `AA_MAX_STATE_VAR_NAME_LENGTH` (default: 128)
    /// - `AA_MAX_STATE_VAR_VALUE_LENGTH` (default: 1024)
    /// - `AA_MAX_STRING_LENGTH` (default: 4096)
    /// - `AA_MAX_ITERATIONS` (default: 100)
    /// - `AA_FORMULA_CACHE_CAPACITY` (default: 1000)
    /// - `AA_AA2_MCI`, `AA_STORAGE_SIZE_MCI`, `AA_BUG_COMPATIBLE_BALANCE_MCI` (default: 0)
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_complexity: env_or("AA_MAX_COMPLEXITY", d.max_complexity),
            max_ops: env_or("AA_MAX_OPS", d.max_ops),
            max_responses_per_primary_trigger: env_or(
                "AA_MAX_RESPONSES_PER_PRIMARY_TRIGGER",
                d.max_responses_per_primary_trigger,
            ),
            min_bytes_bounce_fee: env_or("AA_MIN_BYTES_BOUNCE_FEE", d.min_bytes_bounce_fee),
            max_state_var_name_length: env_or("AA_MAX_STATE_VAR_NAME_LENGTH", d.max_state_var_name_length),
            max_state_var_value_length: env_or("AA_MAX_STATE_VAR_VALUE_LENGTH", d.max_state_var_value_length),
            max_aa_string_length: env_or("AA_MAX_STRING_LENGTH", d.max_aa_string_length),
            max_iterations: env_or("AA_MAX_ITERATIONS", d.max_iterations),
            formula_cache_capacity: env_or("AA_FORMULA_CACHE_CAPACITY", d.formula_cache_capacity),
            activation: ActivationHeights {
                aa2_mci: env_or("AA_AA2_MCI", d.activation.aa2_mci),
                storage_size_mci: env_or("AA_STORAGE_SIZE_MCI", d.activation.storage_size_mci),
                bug_compatible_balance_mci: env_or(
                    "AA_BUG_COMPATIBLE_BALANCE_MCI",
                    d.activation.bug_compatible_balance_mci,
                ),
            },
        }
    }

    /// Rejects limits that cannot work.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending limit.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_complexity == 0 || self.max_ops == 0 {
            return Err("complexity and op budgets must be positive".into());
        }
        if self.max_responses_per_primary_trigger == 0 {
            return Err("max_responses_per_primary_trigger must be positive".into());
        }
        if self.min_bytes_bounce_fee <= 0 {
            return Err("min_bytes_bounce_fee must be positive".into());
        }
        if self.formula_cache_capacity == 0 {
            return Err("formula_cache_capacity must be positive".into());
        }
        Ok(())
    }

    /// Whether the second AA upgrade is active at `mci`.
    #[must_use]
    pub fn aa2_active(&self, mci: Mci) -> bool {
        mci >= self.activation.aa2_mci
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_complexity, 100);
        assert_eq!(config.min_bytes_bounce_fee, 10_000);
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let config = AaConfig { max_ops: 0, ..AaConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_activation_gate() {
        let mut config = AaConfig::default();
        config.activation.aa2_mci = 100;
        assert!(!config.aa2_active(99));
        assert!(config.aa2_active(100));
    }
}
