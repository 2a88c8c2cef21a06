//! Per-value de-identification transforms and the row-set rewriter.
//!
//! Each transform is deterministic so the same input always masks to the
//! same output; date shifting and format-preserving encryption derive their
//! randomness from SHA-256 seeds, never from ambient entropy.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// Replacement marker for suppressed values
pub const SUPPRESSED: &str = "*SUPPRESSED*";

/// SHA-256 hash truncated to 16 hex characters.
pub fn hash_value(value: &Value) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Value::String(crate::utils::sha256_hex_truncated(raw.as_bytes(), 16))
}

/// "john.doe@example.com" -> "j***@example.com"
pub fn mask_email(email: &str) -> String {
    let Some((local, domain)) = email.split_once('@') else {
        return email.to_string();
    };
    let masked_local = match local.chars().next() {
        Some(first) => format!("{}***", first),
        None => "***".to_string(),
    };
    format!("{}@{}", masked_local, domain)
}

/// "13812345678" -> "138****5678"; fewer than 7 digits collapses to "***"
pub fn mask_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 {
        return "***".to_string();
    }
    format!("{}****{}", &digits[..3], &digits[digits.len() - 4..])
}

/// "张三" -> "张*"; "John Doe" -> "J*** D**"
pub fn mask_name(name: &str) -> String {
    if name.is_empty() {
        return name.to_string();
    }

    let is_cjk = name
        .chars()
        .any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c));
    if is_cjk {
        let chars: Vec<char> = name.chars().collect();
        if chars.len() >= 2 {
            let mut masked = chars[0].to_string();
            masked.extend(std::iter::repeat('*').take(chars.len() - 1));
            return masked;
        }
        return "*".to_string();
    }

    name.split_whitespace()
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    let rest = chars.count();
                    format!("{}{}", first, "*".repeat(rest))
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// 25 with bucket 10 -> "20-29"
pub fn generalize_age(age: i64, bucket_size: i64) -> String {
    let lower = (age / bucket_size) * bucket_size;
    let upper = lower + bucket_size - 1;
    format!("{}-{}", lower, upper)
}

/// Deterministic digit permutation keeping length and non-digit positions.
///
/// The replacement digits are drawn from a ChaCha20 stream seeded by
/// SHA-256(key || value), so the mapping is stable under a fixed key.
pub fn format_preserving_encrypt(value: &str, key: &[u8]) -> String {
    if value.is_empty() || !value.chars().any(|c| c.is_ascii_digit()) {
        return value.to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    let seed = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    let mut rng = ChaCha20Rng::seed_from_u64(seed);

    value
        .chars()
        .map(|c| {
            if c.is_ascii_digit() {
                char::from(b'0' + rng.gen_range(0..10u8))
            } else {
                c
            }
        })
        .collect()
}

/// Shift a date by a per-individual deterministic offset in [-max_shift_days, +max_shift_days].
///
/// Every date belonging to the same individual shifts by the same amount, so
/// intervals between a person's events are preserved.
pub fn date_shift(date_value: &str, individual_id: &str, max_shift_days: i64) -> String {
    let digest = Sha256::digest(individual_id.as_bytes());
    let seed = i64::from(i32::from_be_bytes(
        digest[..4].try_into().expect("digest is 32 bytes"),
    ));
    let span = 2 * max_shift_days + 1;
    let offset_days = seed.rem_euclid(span) - max_shift_days;

    if let Ok(dt) = DateTime::parse_from_rfc3339(date_value) {
        let shifted = dt.with_timezone(&Utc) + Duration::days(offset_days);
        return shifted.to_rfc3339();
    }
    if let Ok(date) = NaiveDate::parse_from_str(date_value, "%Y-%m-%d") {
        let shifted = date + Duration::days(offset_days);
        return shifted.format("%Y-%m-%d").to_string();
    }
    date_value.to_string()
}

/// Geographic generalization levels for [`geographic_generalize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoLevel {
    Zip3,
    Zip5,
    City,
    State,
    Country,
}

impl GeoLevel {
    pub fn parse(level: &str) -> Option<Self> {
        match level.to_ascii_lowercase().as_str() {
            "zip3" => Some(GeoLevel::Zip3),
            "zip5" => Some(GeoLevel::Zip5),
            "city" => Some(GeoLevel::City),
            "state" => Some(GeoLevel::State),
            "country" => Some(GeoLevel::Country),
            _ => None,
        }
    }
}

/// "123 Main St, New York, NY 10001" at City level -> "New York, NY 10001"
pub fn geographic_generalize(address: &str, level: GeoLevel) -> String {
    if address.is_empty() {
        return address.to_string();
    }
    let parts: Vec<&str> = address.split(',').map(str::trim).collect();

    match level {
        GeoLevel::Zip3 => {
            static ZIP: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
                regex::Regex::new(r"\b(\d{5})(?:-\d{4})?\b").expect("valid regex")
            });
            parts
                .iter()
                .map(|part| {
                    ZIP.replace_all(part, |caps: &regex::Captures| {
                        format!("{}XX", &caps[1][..3])
                    })
                    .into_owned()
                })
                .collect::<Vec<_>>()
                .join(", ")
        }
        GeoLevel::Zip5 => {
            static ZIP_PLUS4: once_cell::sync::Lazy<regex::Regex> =
                once_cell::sync::Lazy::new(|| {
                    regex::Regex::new(r"(\d{5})-\d{4}").expect("valid regex")
                });
            parts
                .iter()
                .map(|part| ZIP_PLUS4.replace_all(part, "$1").into_owned())
                .collect::<Vec<_>>()
                .join(", ")
        }
        GeoLevel::City => {
            if parts.len() >= 2 {
                parts[parts.len() - 2..].join(", ")
            } else {
                address.to_string()
            }
        }
        GeoLevel::State => parts
            .last()
            .map(|s| s.to_string())
            .unwrap_or_else(|| address.to_string()),
        GeoLevel::Country => "USA".to_string(),
    }
}

/// Replace values occurring fewer than `threshold` times with the sentinel.
pub fn suppress_rare_values(
    value: &Value,
    value_counts: &HashMap<String, usize>,
    threshold: usize,
) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    let key = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if value_counts.get(&key).copied().unwrap_or(0) < threshold {
        return Value::String(SUPPRESSED.to_string());
    }
    value.clone()
}

/// Applies a named de-identification method per column across a row set.
pub struct DeIdRewriter {
    sensitive_columns: HashMap<String, String>,
}

impl Default for DeIdRewriter {
    fn default() -> Self {
        let mut sensitive_columns = HashMap::new();
        for (column, method) in [
            ("name", "mask_name"),
            ("email", "mask_email"),
            ("phone", "mask_phone"),
            ("mobile", "mask_phone"),
            ("age", "generalize_age"),
            ("id_card", "hash"),
            ("ssn", "hash"),
            ("password", "hash"),
        ] {
            sensitive_columns.insert(column.to_string(), method.to_string());
        }
        Self { sensitive_columns }
    }
}

impl DeIdRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sensitive_column(&mut self, column: impl Into<String>, method: impl Into<String>) {
        self.sensitive_columns
            .insert(column.into().to_lowercase(), method.into());
    }

    fn apply_method(&self, method: &str, value: &Value) -> Value {
        match method {
            "mask_email" => match value.as_str() {
                Some(s) => Value::String(mask_email(s)),
                None => hash_value(value),
            },
            "mask_phone" => match value.as_str() {
                Some(s) => Value::String(mask_phone(s)),
                None => hash_value(value),
            },
            "mask_name" => match value.as_str() {
                Some(s) => Value::String(mask_name(s)),
                None => hash_value(value),
            },
            "generalize_age" => match value.as_i64() {
                Some(age) => Value::String(generalize_age(age, 10)),
                None => hash_value(value),
            },
            _ => hash_value(value),
        }
    }

    /// Rewrite the listed columns on every row. Columns without a configured
    /// method fall back to hashing.
    pub fn apply_deid(
        &self,
        rows: &[Map<String, Value>],
        columns: &[String],
    ) -> Vec<Map<String, Value>> {
        rows.iter()
            .map(|row| {
                let mut new_row = row.clone();
                for column in columns {
                    if let Some(value) = row.get(column) {
                        let method = self
                            .sensitive_columns
                            .get(&column.to_lowercase())
                            .map(String::as_str)
                            .unwrap_or("hash");
                        new_row.insert(column.clone(), self.apply_method(method, value));
                    }
                }
                new_row
            })
            .collect()
    }

    /// Privacy-info metadata describing which method handled each column.
    pub fn methods_used(&self, columns: &[String]) -> Map<String, Value> {
        let mut methods = Map::new();
        for column in columns {
            let method = self
                .sensitive_columns
                .get(&column.to_lowercase())
                .map(String::as_str)
                .unwrap_or("hash");
            methods.insert(column.clone(), json!(method));
        }
        methods
    }
}
