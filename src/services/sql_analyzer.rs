//! Regex-level SQL feature extraction.
//!
//! This is deliberately not a parser: tokenization plus a handful of
//! anchored regexes recognize exactly the constructs the policy engine and
//! sensitivity scoring consume. The `AnalysisResult` contract isolates the
//! extraction so a real parser could be swapped in behind it later.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{
    Aggregation, AnalysisResult, CteInfo, JoinInfo, JoinType, SubqueryInfo, SubqueryKind,
    SubqueryLocation, WindowFunctionInfo,
};

static FROM_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bFROM\s+(\w+)(?:\s+(?:AS\s+)?(\w+))?").expect("valid regex"));

static JOIN_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:INNER\s+JOIN|LEFT\s+(?:OUTER\s+)?JOIN|RIGHT\s+(?:OUTER\s+)?JOIN|FULL\s+(?:OUTER\s+)?JOIN|JOIN)\s+(\w+)(?:\s+(?:AS\s+)?(\w+))?",
    )
    .expect("valid regex")
});

static SELECT_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\bSELECT\s+(.*?)\s+FROM\b").expect("valid regex"));

static WHERE_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\bWHERE\s+(.*?)(?:\bGROUP BY\b|\bORDER BY\b|\bLIMIT\b|$)")
        .expect("valid regex")
});

static GROUP_BY_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\bGROUP BY\s+(.*?)(?:\bHAVING\b|\bORDER BY\b|\bLIMIT\b|$)")
        .expect("valid regex")
});

static JOIN_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(INNER\s+JOIN|LEFT\s+(?:OUTER\s+)?JOIN|RIGHT\s+(?:OUTER\s+)?JOIN|FULL\s+(?:OUTER\s+)?JOIN|JOIN)\s+(\w+)(?:\s+(?:AS\s+)?(\w+))?\s+ON\s+",
    )
    .expect("valid regex")
});

// Ends an ON clause: the next JOIN phrase or a top-level clause keyword.
static JOIN_TERMINATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\s+(?:INNER\s+JOIN|LEFT\s+(?:OUTER\s+)?JOIN|RIGHT\s+(?:OUTER\s+)?JOIN|FULL\s+(?:OUTER\s+)?JOIN|JOIN\b|WHERE\b|GROUP\s+BY\b|ORDER\s+BY\b|LIMIT\b)",
    )
    .expect("valid regex")
});

static AND_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s+AND\s+").expect("valid regex"));

static COMPARISON_TAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[=<>!]+\s*$").expect("valid regex"));

static WITH_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*WITH\s+(RECURSIVE\s+)?").expect("valid regex"));

static CTE_DEFINITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^(\w+)\s*(?:\(([^)]+)\))?\s*AS\s*\((.*)\)\s*$").expect("valid regex")
});

static WINDOW_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)(\w+)\s*\(([^)]*)\)\s+OVER\s*\(([^)]*)\)(?:\s+(?:AS\s+)?(\w+))?")
        .expect("valid regex")
});

static PARTITION_BY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)PARTITION\s+BY\s+(.*?)(?:ORDER\s+BY|ROWS|RANGE|GROUPS|$)")
        .expect("valid regex")
});

static ORDER_BY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)ORDER\s+BY\s+(.*?)(?:ROWS|RANGE|GROUPS|$)").expect("valid regex")
});

static FRAME_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)((?:ROWS|RANGE|GROUPS)\s+.*)$").expect("valid regex"));

const WINDOW_FUNCTIONS: &[&str] = &[
    "ROW_NUMBER",
    "RANK",
    "DENSE_RANK",
    "NTILE",
    "LAG",
    "LEAD",
    "FIRST_VALUE",
    "LAST_VALUE",
    "NTH_VALUE",
    "SUM",
    "AVG",
    "COUNT",
    "MIN",
    "MAX",
    "PERCENT_RANK",
    "CUME_DIST",
];

const ALIAS_STOPWORDS: &[&str] = &[
    "WHERE", "JOIN", "LEFT", "RIGHT", "INNER", "FULL", "ON", "GROUP", "ORDER", "HAVING", "LIMIT",
];

#[derive(Debug, Clone, Default)]
pub struct SqlAnalyzer;

impl SqlAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Extract semantic features from a statement. Never panics: any
    /// extraction failure yields `is_valid = false` and the error message.
    pub fn analyze(&self, sql: &str) -> AnalysisResult {
        match self.try_analyze(sql) {
            Ok(result) => result,
            Err(err) => AnalysisResult::invalid(sql, err.to_string()),
        }
    }

    fn try_analyze(&self, sql: &str) -> anyhow::Result<AnalysisResult> {
        let normalized = normalize(sql);
        if normalized.is_empty() {
            anyhow::bail!("empty SQL statement");
        }

        let mut result = AnalysisResult::new(sql);
        result.tables = extract_tables(&normalized);
        result.select_columns = extract_select_columns(&normalized);
        result.aggregations = extract_aggregations(&normalized);
        result.is_aggregate_query = !result.aggregations.is_empty();
        result.has_where = has_where_clause(&normalized);
        result.where_conditions = extract_where_conditions(&normalized);
        result.group_by_columns = extract_group_by(&normalized);
        result.joins = extract_joins(&normalized);
        result.subqueries = extract_subqueries(&normalized);
        result.ctes = extract_ctes(sql)?;
        result.window_functions = extract_window_functions(&normalized);
        Ok(result)
    }

    /// Public helper mirroring `analyze` for JOIN inspection alone.
    pub fn analyze_joins(&self, sql: &str) -> Vec<JoinInfo> {
        extract_joins(&normalize(sql))
    }

    pub fn extract_subqueries(&self, sql: &str) -> Vec<SubqueryInfo> {
        extract_subqueries(&normalize(sql))
    }

    pub fn extract_ctes(&self, sql: &str) -> Vec<CteInfo> {
        extract_ctes(sql).unwrap_or_default()
    }
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// FROM-clause table plus every table following a JOIN, first-seen order.
fn extract_tables(sql: &str) -> Vec<String> {
    let mut tables = Vec::new();
    for caps in FROM_TABLE.captures_iter(sql) {
        let table = caps[1].to_string();
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    for caps in JOIN_TABLE.captures_iter(sql) {
        let table = caps[1].to_string();
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    tables
}

fn extract_select_columns(sql: &str) -> Vec<String> {
    let Some(caps) = SELECT_CLAUSE.captures(sql) else {
        return Vec::new();
    };

    split_top_level(&caps[1], ',')
        .into_iter()
        .map(|item| {
            let item = item.trim();
            if item.to_uppercase().contains(" AS ") {
                item.split_whitespace()
                    .next_back()
                    .unwrap_or(item)
                    .to_string()
            } else {
                item.to_string()
            }
        })
        .filter(|item| !item.is_empty())
        .collect()
}

fn extract_aggregations(sql: &str) -> Vec<Aggregation> {
    let upper = sql.to_uppercase();
    Aggregation::ALL
        .into_iter()
        .filter(|agg| {
            let pattern = format!(r"\b{}\s*\(", agg.keyword());
            Regex::new(&pattern)
                .map(|re| re.is_match(&upper))
                .unwrap_or(false)
        })
        .collect()
}

fn has_where_clause(sql: &str) -> bool {
    static WHERE_KEYWORD: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\bWHERE\b").expect("valid regex"));
    WHERE_KEYWORD.is_match(sql)
}

fn extract_where_conditions(sql: &str) -> Vec<String> {
    WHERE_CLAUSE
        .captures(sql)
        .map(|caps| caps[1].trim().to_string())
        .filter(|conditions| !conditions.is_empty())
        .map(|conditions| vec![conditions])
        .unwrap_or_default()
}

fn extract_group_by(sql: &str) -> Vec<String> {
    GROUP_BY_CLAUSE
        .captures(sql)
        .map(|caps| {
            caps[1]
                .split(',')
                .map(|col| col.trim().to_string())
                .filter(|col| !col.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn classify_join_type(raw: &str) -> JoinType {
    let upper = raw.to_uppercase();
    if upper.contains("LEFT") {
        JoinType::Left
    } else if upper.contains("RIGHT") {
        JoinType::Right
    } else if upper.contains("FULL") {
        JoinType::Full
    } else {
        JoinType::Inner
    }
}

fn extract_joins(sql: &str) -> Vec<JoinInfo> {
    let main_tables = extract_tables(sql);
    let mut joins = Vec::new();

    for caps in JOIN_HEAD.captures_iter(sql) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let join_type = classify_join_type(&caps[1]);
        let table = caps[2].to_string();

        // The ON clause runs from the head match to the next JOIN or
        // clause keyword.
        let rest = &sql[whole.end()..];
        let condition_end = JOIN_TERMINATOR
            .find(rest)
            .map(|m| m.start())
            .unwrap_or(rest.len());
        let condition = rest[..condition_end].trim();

        let mut tables = main_tables.clone();
        if !tables.contains(&table) {
            tables.push(table);
        }

        let conditions = AND_SPLIT
            .split(&normalize(condition))
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect();

        joins.push(JoinInfo {
            join_type,
            tables,
            conditions,
        });
    }

    joins
}

/// Split a string on a separator, ignoring separators inside parentheses.
fn split_top_level(input: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in input.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c == separator && depth == 0 => {
                parts.push(current.clone());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

/// ASCII case-insensitive prefix test that is safe at any byte offset.
fn starts_with_keyword(bytes: &[u8], keyword: &str) -> bool {
    let mut offset = 0;
    while offset < bytes.len() && bytes[offset].is_ascii_whitespace() {
        offset += 1;
    }
    let keyword = keyword.as_bytes();
    bytes.len() >= offset + keyword.len()
        && bytes[offset..offset + keyword.len()].eq_ignore_ascii_case(keyword)
}

/// Locate every balanced `(SELECT ...)` group, outer ones first.
fn find_balanced_subqueries(sql: &str) -> Vec<(usize, String)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'(' {
            if starts_with_keyword(&bytes[i + 1..], "SELECT") {
                let mut depth = 1;
                let mut j = i + 1;
                while j < bytes.len() && depth > 0 {
                    match bytes[j] {
                        b'(' => depth += 1,
                        b')' => depth -= 1,
                        _ => {}
                    }
                    j += 1;
                }
                if depth == 0 {
                    let inner = sql[i + 1..j - 1].trim().to_string();
                    found.push((i, inner));
                }
            }
        }
        i += 1;
    }
    found
}

/// Classify a subquery by the text to its left.
fn determine_subquery_context(sql: &str, start: usize) -> (SubqueryLocation, SubqueryKind) {
    let prefix = sql[..start].to_uppercase();
    let prefix = prefix.trim_end();

    if prefix.ends_with("EXISTS") {
        return (SubqueryLocation::Where, SubqueryKind::Exists);
    }
    if prefix.ends_with("IN") {
        return (SubqueryLocation::Where, SubqueryKind::In);
    }
    if COMPARISON_TAIL.is_match(prefix) {
        return (SubqueryLocation::Where, SubqueryKind::Scalar);
    }

    let from_pos = prefix.rfind("FROM");
    let where_pos = prefix.rfind("WHERE");
    if from_pos.is_some() && where_pos.is_none() && prefix.ends_with("FROM") {
        return (SubqueryLocation::From, SubqueryKind::From);
    }

    let select_pos = prefix.rfind("SELECT");
    match (select_pos, from_pos) {
        (Some(select), Some(from)) if select > from => {
            return (SubqueryLocation::Select, SubqueryKind::Scalar);
        }
        (Some(_), None) => {
            return (SubqueryLocation::Select, SubqueryKind::Scalar);
        }
        _ => {}
    }

    if let Some(having) = prefix.rfind("HAVING") {
        if having > where_pos.unwrap_or(0) {
            return (SubqueryLocation::Having, SubqueryKind::Scalar);
        }
    }

    (SubqueryLocation::Where, SubqueryKind::Scalar)
}

fn extract_table_aliases(sql: &str) -> Vec<String> {
    let mut aliases = Vec::new();
    for re in [&*FROM_TABLE, &*JOIN_TABLE] {
        for caps in re.captures_iter(sql) {
            if let Some(alias) = caps.get(2) {
                let alias = alias.as_str();
                if !ALIAS_STOPWORDS.contains(&alias.to_uppercase().as_str()) {
                    aliases.push(alias.to_string());
                }
            }
        }
    }
    aliases
}

/// A subquery is correlated iff it references an outer table alias as
/// `alias.col`.
fn check_correlation(outer_sql: &str, subquery_sql: &str) -> (bool, Vec<String>) {
    let mut correlation_columns = Vec::new();
    for alias in extract_table_aliases(outer_sql) {
        let pattern = format!(r"(?i)\b{}\.\w+", regex::escape(&alias));
        if let Ok(re) = Regex::new(&pattern) {
            for m in re.find_iter(subquery_sql) {
                let token = m.as_str().to_string();
                if !correlation_columns.contains(&token) {
                    correlation_columns.push(token);
                }
            }
        }
    }
    (!correlation_columns.is_empty(), correlation_columns)
}

fn extract_subqueries(sql: &str) -> Vec<SubqueryInfo> {
    find_balanced_subqueries(sql)
        .into_iter()
        .map(|(start, subquery_sql)| {
            let (location, kind) = determine_subquery_context(sql, start);
            let (is_correlated, correlation_columns) = check_correlation(sql, &subquery_sql);
            let tables = extract_tables(&subquery_sql);
            SubqueryInfo {
                kind,
                location,
                sql: subquery_sql,
                tables,
                is_correlated,
                correlation_columns,
            }
        })
        .collect()
}

fn extract_ctes(sql: &str) -> anyhow::Result<Vec<CteInfo>> {
    let normalized = normalize(sql);
    let Some(with_match) = WITH_PREFIX.find(&normalized) else {
        return Ok(Vec::new());
    };
    let is_recursive_global = WITH_PREFIX
        .captures(&normalized)
        .and_then(|caps| caps.get(1))
        .is_some();
    let start = with_match.end();

    // The CTE section runs until the main SELECT at parenthesis depth 0.
    let bytes = normalized.as_bytes();
    let mut depth = 0i32;
    let mut cte_section = None;
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if depth == 0
                && bytes[i..].len() >= 6
                && bytes[i..i + 6].eq_ignore_ascii_case(b"SELECT") =>
            {
                cte_section = Some(normalized[start..i].trim().to_string());
                break;
            }
            _ => {}
        }
        i += 1;
    }
    if depth < 0 {
        anyhow::bail!("unbalanced parentheses in CTE section");
    }
    let Some(cte_section) = cte_section else {
        return Ok(Vec::new());
    };

    let mut ctes = Vec::new();
    for part in split_cte_definitions(&cte_section) {
        if let Some(cte) = parse_single_cte(part.trim(), is_recursive_global) {
            ctes.push(cte);
        }
    }
    Ok(ctes)
}

/// Split `a AS (...), b AS (...)` on the commas between definitions.
fn split_cte_definitions(section: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut chars = section.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                current.push(c);
                if depth == 0 {
                    // A closing paren at depth 0 ends a definition when a
                    // comma follows.
                    while matches!(chars.peek(), Some(&' ')) {
                        chars.next();
                    }
                    if matches!(chars.peek(), Some(&',')) {
                        chars.next();
                        parts.push(current.trim().to_string());
                        current.clear();
                    }
                }
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    if parts.is_empty() {
        vec![section.to_string()]
    } else {
        parts
    }
}

fn parse_single_cte(definition: &str, is_recursive_global: bool) -> Option<CteInfo> {
    let caps = CTE_DEFINITION.captures(definition)?;
    let name = caps[1].to_string();
    let columns = caps
        .get(2)
        .map(|m| {
            m.as_str()
                .split(',')
                .map(|c| c.trim().to_string())
                .collect()
        })
        .unwrap_or_default();
    let body = caps[3].trim().to_string();

    let is_recursive = is_recursive_global && references_name(&name, &body);
    let references = extract_tables(&body);

    Some(CteInfo {
        name,
        sql: body,
        columns,
        is_recursive,
        references,
    })
}

fn references_name(name: &str, body: &str) -> bool {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(name));
    Regex::new(&pattern)
        .map(|re| re.is_match(body))
        .unwrap_or(false)
}

fn extract_window_functions(sql: &str) -> Vec<WindowFunctionInfo> {
    WINDOW_FUNCTION
        .captures_iter(sql)
        .filter_map(|caps| {
            let function = caps[1].to_uppercase();
            if !WINDOW_FUNCTIONS.contains(&function.as_str()) {
                return None;
            }

            let arguments = caps
                .get(2)
                .map(|m| {
                    m.as_str()
                        .split(',')
                        .map(|a| a.trim().to_string())
                        .filter(|a| !a.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            let over_clause = caps.get(3).map(|m| m.as_str().trim()).unwrap_or("");
            let (partition_by, order_by, frame) = parse_over_clause(over_clause);

            Some(WindowFunctionInfo {
                function,
                arguments,
                partition_by,
                order_by,
                frame,
                alias: caps.get(4).map(|m| m.as_str().to_string()),
            })
        })
        .collect()
}

fn parse_over_clause(over_clause: &str) -> (Vec<String>, Vec<String>, Option<String>) {
    if over_clause.is_empty() {
        return (Vec::new(), Vec::new(), None);
    }

    let partition_by = PARTITION_BY
        .captures(over_clause)
        .map(|caps| {
            caps[1]
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let order_by = ORDER_BY
        .captures(over_clause)
        .map(|caps| {
            caps[1]
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let frame = FRAME_CLAUSE
        .captures(over_clause)
        .map(|caps| caps[1].trim().to_string());

    (partition_by, order_by, frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_select() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze("SELECT name, email FROM users");

        assert!(result.is_valid);
        assert_eq!(result.tables, vec!["users"]);
        assert_eq!(result.select_columns, vec!["name", "email"]);
        assert!(!result.is_aggregate_query);
        assert!(!result.has_where);
    }

    #[test]
    fn test_aggregate_detection() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze("SELECT COUNT(*), AVG(salary) FROM employees");

        assert!(result.is_aggregate_query);
        assert!(result.aggregations.contains(&Aggregation::Count));
        assert!(result.aggregations.contains(&Aggregation::Avg));
        assert!(!result.aggregations.contains(&Aggregation::Sum));
    }

    #[test]
    fn test_alias_kept_for_select_items() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze("SELECT salary * 12 AS annual, name FROM employees");
        assert_eq!(result.select_columns, vec!["annual", "name"]);
    }

    #[test]
    fn test_where_and_group_by() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze(
            "SELECT dept, COUNT(*) FROM employees WHERE age > 30 GROUP BY dept, region ORDER BY dept",
        );

        assert!(result.has_where);
        assert_eq!(result.where_conditions, vec!["age > 30"]);
        assert_eq!(result.group_by_columns, vec!["dept", "region"]);
    }

    #[test]
    fn test_join_extraction() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze(
            "SELECT * FROM orders o LEFT JOIN customers c ON o.customer_id = c.id AND c.active = 1 WHERE o.total > 10",
        );

        assert_eq!(result.tables, vec!["orders", "customers"]);
        assert_eq!(result.joins.len(), 1);
        let join = &result.joins[0];
        assert_eq!(join.join_type, JoinType::Left);
        assert_eq!(
            join.conditions,
            vec!["o.customer_id = c.id", "c.active = 1"]
        );
    }

    #[test]
    fn test_multiple_joins_all_extracted() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze(
            "SELECT * FROM a JOIN b ON a.id = b.a_id LEFT JOIN c ON b.id = c.b_id WHERE a.x > 1",
        );

        assert_eq!(result.joins.len(), 2);
        assert_eq!(result.joins[0].join_type, JoinType::Inner);
        assert_eq!(result.joins[0].conditions, vec!["a.id = b.a_id"]);
        assert_eq!(result.joins[1].join_type, JoinType::Left);
        assert_eq!(result.joins[1].conditions, vec!["b.id = c.b_id"]);
        assert_eq!(result.tables, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_bare_join_defaults_to_inner() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze("SELECT * FROM a JOIN b ON a.id = b.id");
        assert_eq!(result.joins[0].join_type, JoinType::Inner);
    }

    #[test]
    fn test_duplicate_tables_appear_once() {
        let analyzer = SqlAnalyzer::new();
        let result =
            analyzer.analyze("SELECT * FROM users u JOIN users m ON u.manager_id = m.id");
        assert_eq!(result.tables, vec!["users"]);
    }

    #[test]
    fn test_in_subquery() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer
            .analyze("SELECT name FROM users WHERE id IN (SELECT user_id FROM orders)");

        assert_eq!(result.subqueries.len(), 1);
        let sub = &result.subqueries[0];
        assert_eq!(sub.kind, SubqueryKind::In);
        assert_eq!(sub.location, SubqueryLocation::Where);
        assert_eq!(sub.tables, vec!["orders"]);
        assert!(!sub.is_correlated);
    }

    #[test]
    fn test_correlated_exists_subquery() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze(
            "SELECT name FROM users u WHERE EXISTS (SELECT 1 FROM orders o WHERE o.user_id = u.id)",
        );

        let sub = &result.subqueries[0];
        assert_eq!(sub.kind, SubqueryKind::Exists);
        assert!(sub.is_correlated);
        assert!(sub.correlation_columns.iter().any(|c| c == "u.id"));
    }

    #[test]
    fn test_scalar_subquery_after_comparison() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer
            .analyze("SELECT name FROM employees WHERE salary > (SELECT AVG(salary) FROM employees)");
        assert_eq!(result.subqueries[0].kind, SubqueryKind::Scalar);
    }

    #[test]
    fn test_from_subquery() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze("SELECT t.c FROM (SELECT c FROM base) t");
        assert_eq!(result.subqueries[0].kind, SubqueryKind::From);
        assert_eq!(result.subqueries[0].location, SubqueryLocation::From);
    }

    #[test]
    fn test_nested_subqueries_outer_first() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze(
            "SELECT name FROM users WHERE id IN (SELECT user_id FROM orders WHERE total > (SELECT AVG(total) FROM orders))",
        );
        assert_eq!(result.subqueries.len(), 2);
        assert_eq!(result.subqueries[0].kind, SubqueryKind::In);
        assert!(result.subqueries[0].sql.len() > result.subqueries[1].sql.len());
    }

    #[test]
    fn test_cte_extraction() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze(
            "WITH totals AS (SELECT user_id, SUM(amount) AS total FROM orders GROUP BY user_id) SELECT * FROM totals WHERE total > 100",
        );

        assert_eq!(result.ctes.len(), 1);
        let cte = &result.ctes[0];
        assert_eq!(cte.name, "totals");
        assert!(!cte.is_recursive);
        assert_eq!(cte.references, vec!["orders"]);
    }

    #[test]
    fn test_multiple_ctes() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze(
            "WITH a AS (SELECT id FROM t1), b AS (SELECT id FROM t2) SELECT * FROM a JOIN b ON a.id = b.id",
        );
        assert_eq!(result.ctes.len(), 2);
        assert_eq!(result.ctes[0].name, "a");
        assert_eq!(result.ctes[1].name, "b");
    }

    #[test]
    fn test_recursive_cte() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze(
            "WITH RECURSIVE tree AS (SELECT id, parent_id FROM nodes WHERE parent_id IS NULL UNION ALL SELECT n.id, n.parent_id FROM nodes n JOIN tree t ON n.parent_id = t.id) SELECT * FROM tree",
        );
        assert_eq!(result.ctes.len(), 1);
        assert!(result.ctes[0].is_recursive);
    }

    #[test]
    fn test_non_recursive_cte_with_recursive_keyword() {
        // RECURSIVE is set globally but this body never references itself.
        let analyzer = SqlAnalyzer::new();
        let result = analyzer
            .analyze("WITH RECURSIVE plain AS (SELECT id FROM t1) SELECT * FROM plain");
        assert!(!result.ctes[0].is_recursive);
    }

    #[test]
    fn test_window_function() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze(
            "SELECT name, RANK() OVER (PARTITION BY dept ORDER BY salary DESC) AS rnk FROM employees",
        );

        assert_eq!(result.window_functions.len(), 1);
        let wf = &result.window_functions[0];
        assert_eq!(wf.function, "RANK");
        assert_eq!(wf.partition_by, vec!["dept"]);
        assert_eq!(wf.order_by, vec!["salary DESC"]);
        assert_eq!(wf.alias.as_deref(), Some("rnk"));
    }

    #[test]
    fn test_unknown_function_over_is_ignored() {
        let analyzer = SqlAnalyzer::new();
        let result =
            analyzer.analyze("SELECT MYSTERY(x) OVER (PARTITION BY y) FROM t");
        assert!(result.window_functions.is_empty());
    }

    #[test]
    fn test_empty_sql_is_invalid() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze("   ");
        assert!(!result.is_valid);
        assert!(result.error.is_some());
    }
}
