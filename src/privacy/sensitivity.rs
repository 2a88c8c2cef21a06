//! L1-sensitivity scoring for aggregate queries.
//!
//! COUNT has sensitivity 1. SUM needs the column's value bounds (one record
//! can shift the sum by at most upper - lower); without configured bounds we
//! fall back to 1, a deliberately conservative default. AVG/MIN/MAX default
//! to 1 unless overridden through bounds configuration.

use std::collections::HashMap;

use crate::models::Aggregation;

#[derive(Debug, Clone, Default)]
pub struct SensitivityAnalyzer {
    bounds: HashMap<String, (f64, f64)>,
}

impl SensitivityAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bounds(bounds: HashMap<String, (f64, f64)>) -> Self {
        Self { bounds }
    }

    pub fn set_bounds(&mut self, column: impl Into<String>, lower: f64, upper: f64) {
        self.bounds.insert(column.into(), (lower, upper));
    }

    pub fn analyze(&self, aggregation: Aggregation, column: Option<&str>) -> f64 {
        match aggregation {
            Aggregation::Count => 1.0,
            Aggregation::Sum => column
                .and_then(|c| self.bounds.get(c))
                .map(|(lower, upper)| upper - lower)
                .unwrap_or(1.0),
            Aggregation::Avg | Aggregation::Min | Aggregation::Max => column
                .and_then(|c| self.bounds.get(c))
                .map(|(lower, upper)| upper - lower)
                .unwrap_or(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_sensitivity_is_one() {
        let analyzer = SensitivityAnalyzer::new();
        assert_eq!(analyzer.analyze(Aggregation::Count, None), 1.0);
        assert_eq!(analyzer.analyze(Aggregation::Count, Some("salary")), 1.0);
    }

    #[test]
    fn test_sum_uses_bounds() {
        let mut analyzer = SensitivityAnalyzer::new();
        analyzer.set_bounds("salary", 0.0, 100_000.0);
        assert_eq!(
            analyzer.analyze(Aggregation::Sum, Some("salary")),
            100_000.0
        );
    }

    #[test]
    fn test_sum_without_bounds_falls_back_to_one() {
        let analyzer = SensitivityAnalyzer::new();
        assert_eq!(analyzer.analyze(Aggregation::Sum, Some("salary")), 1.0);
    }

    #[test]
    fn test_avg_default() {
        let analyzer = SensitivityAnalyzer::new();
        assert_eq!(analyzer.analyze(Aggregation::Avg, Some("age")), 1.0);
    }
}
