use serde::{Deserialize, Serialize};

/// Cardinality below which a region is cheap enough to drive a dependent join.
pub const DEFAULT_STRONG_COST: f64 = 1000.0;

/// Knobs of one planning session and of plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Max number of successful rule applications before planning fails.
    pub max_rule_applications: usize,
    pub strong_cost_threshold: f64,
    /// IN-list size used for sources which support IN but declare no maximum.
    pub default_max_in_size: u32,
    /// Rows per batch emitted by in-process nodes.
    pub batch_size: usize,
    /// Selectivity of a criteria conjunct nothing better is known about.
    pub default_selectivity: f64,
    /// Selectivity of an equality predicate whose column has no distinct-value count.
    pub unknown_ndv_selectivity: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_rule_applications: 1000,
            strong_cost_threshold: DEFAULT_STRONG_COST,
            default_max_in_size: 1000,
            batch_size: 256,
            default_selectivity: 0.5,
            unknown_ndv_selectivity: 0.1,
        }
    }
}

impl OptimizerConfig {
    pub fn with_max_rule_applications(mut self, max: usize) -> Self {
        self.max_rule_applications = max;
        self
    }

    pub fn with_strong_cost_threshold(mut self, threshold: f64) -> Self {
        self.strong_cost_threshold = threshold;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: OptimizerConfig =
            serde_json::from_str(r#"{"strong_cost_threshold": 50.0}"#).unwrap();
        assert_eq!(config.strong_cost_threshold, 50.0);
        assert_eq!(config.max_rule_applications, 1000);
        assert_eq!(config.batch_size, 256);
    }
}
