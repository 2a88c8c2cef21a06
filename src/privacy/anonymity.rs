//! k-anonymity and l-diversity group operators.
//!
//! Rows are JSON objects; equivalence classes are computed over the
//! quasi-identifier columns. Classes smaller than k (or with fewer than l
//! distinct sensitive values) are suppressed with the shared sentinel.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use super::deid::SUPPRESSED;

type Row = Map<String, Value>;

fn equivalence_key(row: &Row, quasi_identifiers: &[String]) -> String {
    let values: Vec<String> = quasi_identifiers
        .iter()
        .map(|qi| row.get(qi).map(Value::to_string).unwrap_or_default())
        .collect();
    values.join("\u{1f}")
}

fn compute_equivalence_classes(
    rows: &[Row],
    quasi_identifiers: &[String],
) -> HashMap<String, Vec<usize>> {
    let mut classes: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, row) in rows.iter().enumerate() {
        classes
            .entry(equivalence_key(row, quasi_identifiers))
            .or_default()
            .push(index);
    }
    classes
}

/// Ensures every record is indistinguishable from at least k-1 others on the
/// quasi-identifiers, suppressing the QI values of undersized classes.
pub struct KAnonymizer {
    k: usize,
}

impl KAnonymizer {
    pub fn new(k: usize) -> Self {
        Self { k: k.max(1) }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Generalize (optional per-column rules), group, and suppress classes
    /// smaller than k.
    pub fn anonymize(
        &self,
        rows: &[Row],
        quasi_identifiers: &[String],
        generalization_rules: &HashMap<String, Box<dyn Fn(&Value) -> Value>>,
    ) -> Vec<Row> {
        if rows.is_empty() {
            return Vec::new();
        }

        let mut result: Vec<Row> = rows.to_vec();

        for qi in quasi_identifiers {
            if let Some(rule) = generalization_rules.get(qi) {
                for row in &mut result {
                    if let Some(value) = row.get(qi) {
                        let generalized = rule(value);
                        row.insert(qi.clone(), generalized);
                    }
                }
            }
        }

        let classes = compute_equivalence_classes(&result, quasi_identifiers);
        let small_keys: HashSet<&String> = classes
            .iter()
            .filter(|(_, members)| members.len() < self.k)
            .map(|(key, _)| key)
            .collect();

        for row in &mut result {
            if small_keys.contains(&equivalence_key(row, quasi_identifiers)) {
                for qi in quasi_identifiers {
                    if row.contains_key(qi) {
                        row.insert(qi.clone(), Value::String(SUPPRESSED.to_string()));
                    }
                }
            }
        }

        result
    }

    /// True iff every equivalence class has at least k members.
    pub fn check_k_anonymity(&self, rows: &[Row], quasi_identifiers: &[String]) -> bool {
        compute_equivalence_classes(rows, quasi_identifiers)
            .values()
            .all(|members| members.len() >= self.k)
    }
}

/// Ensures every equivalence class carries at least l distinct sensitive
/// values, suppressing the sensitive attribute otherwise.
pub struct LDiversifier {
    l: usize,
}

impl LDiversifier {
    pub fn new(l: usize) -> Self {
        Self { l: l.max(1) }
    }

    pub fn l(&self) -> usize {
        self.l
    }

    fn distinct_sensitive_values(
        rows: &[Row],
        members: &[usize],
        sensitive_attribute: &str,
    ) -> usize {
        let values: HashSet<String> = members
            .iter()
            .filter_map(|&i| rows[i].get(sensitive_attribute))
            .map(Value::to_string)
            .collect();
        values.len()
    }

    pub fn check_l_diversity(
        &self,
        rows: &[Row],
        quasi_identifiers: &[String],
        sensitive_attribute: &str,
    ) -> bool {
        compute_equivalence_classes(rows, quasi_identifiers)
            .values()
            .all(|members| {
                Self::distinct_sensitive_values(rows, members, sensitive_attribute) >= self.l
            })
    }

    pub fn diversify(
        &self,
        rows: &[Row],
        quasi_identifiers: &[String],
        sensitive_attribute: &str,
    ) -> Vec<Row> {
        if rows.is_empty() {
            return Vec::new();
        }

        let mut result: Vec<Row> = rows.to_vec();
        let classes = compute_equivalence_classes(&result, quasi_identifiers);

        let non_diverse: HashSet<&String> = classes
            .iter()
            .filter(|(_, members)| {
                Self::distinct_sensitive_values(&result, members, sensitive_attribute) < self.l
            })
            .map(|(key, _)| key)
            .collect();

        for row in &mut result {
            if non_diverse.contains(&equivalence_key(row, quasi_identifiers))
                && row.contains_key(sensitive_attribute)
            {
                row.insert(
                    sensitive_attribute.to_string(),
                    Value::String(SUPPRESSED.to_string()),
                );
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(age: i64, zip: &str, disease: &str) -> Row {
        let mut map = Map::new();
        map.insert("age".to_string(), json!(age));
        map.insert("zip".to_string(), json!(zip));
        map.insert("disease".to_string(), json!(disease));
        map
    }

    fn qis() -> Vec<String> {
        vec!["age".to_string(), "zip".to_string()]
    }

    fn sample_rows() -> Vec<Row> {
        vec![
            row(25, "10001", "flu"),
            row(25, "10001", "cold"),
            row(26, "10001", "flu"),
            row(40, "20002", "asthma"),
            row(40, "20002", "flu"),
            row(40, "20002", "cold"),
        ]
    }

    #[test]
    fn test_k3_keeps_large_classes() {
        let anonymizer = KAnonymizer::new(3);
        // Bucket ages so rows 0-2 and 3-5 form classes of size 3
        let mut rules: HashMap<String, Box<dyn Fn(&Value) -> Value>> = HashMap::new();
        rules.insert(
            "age".to_string(),
            Box::new(|v: &Value| match v.as_i64() {
                Some(age) => json!((age / 10) * 10),
                None => v.clone(),
            }),
        );

        let result = anonymizer.anonymize(&sample_rows(), &qis(), &rules);
        assert_eq!(result[0]["age"], json!(20));
        assert_eq!(result[3]["age"], json!(40));
        assert!(result.iter().all(|r| r["zip"] != json!(SUPPRESSED)));
        assert!(anonymizer.check_k_anonymity(&result, &qis()));
    }

    #[test]
    fn test_small_classes_suppressed() {
        let anonymizer = KAnonymizer::new(4);
        let rules = HashMap::new();
        let result = anonymizer.anonymize(&sample_rows(), &qis(), &rules);

        // No class reaches 4 members without generalization, so every QI is
        // suppressed while the sensitive column survives.
        for r in &result {
            assert_eq!(r["age"], json!(SUPPRESSED));
            assert_eq!(r["zip"], json!(SUPPRESSED));
            assert_ne!(r["disease"], json!(SUPPRESSED));
        }
    }

    #[test]
    fn test_check_k_anonymity() {
        let anonymizer = KAnonymizer::new(3);
        assert!(!anonymizer.check_k_anonymity(&sample_rows(), &qis()));

        let uniform = vec![
            row(30, "11111", "flu"),
            row(30, "11111", "cold"),
            row(30, "11111", "asthma"),
        ];
        assert!(anonymizer.check_k_anonymity(&uniform, &qis()));
    }

    #[test]
    fn test_l_diversity_suppresses_homogeneous_class() {
        let diversifier = LDiversifier::new(2);
        let rows = vec![
            row(25, "10001", "flu"),
            row(25, "10001", "flu"),
            row(40, "20002", "flu"),
            row(40, "20002", "cold"),
        ];

        assert!(!diversifier.check_l_diversity(&rows, &qis(), "disease"));

        let result = diversifier.diversify(&rows, &qis(), "disease");
        // First class has one distinct disease -> suppressed
        assert_eq!(result[0]["disease"], json!(SUPPRESSED));
        assert_eq!(result[1]["disease"], json!(SUPPRESSED));
        // Second class has two -> untouched
        assert_eq!(result[2]["disease"], json!("flu"));
        assert_eq!(result[3]["disease"], json!("cold"));
    }
}
