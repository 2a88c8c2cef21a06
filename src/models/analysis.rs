use serde::{Deserialize, Serialize};

/// Aggregate functions the analyzer recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Aggregation {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl Aggregation {
    pub const ALL: [Aggregation; 5] = [
        Aggregation::Count,
        Aggregation::Sum,
        Aggregation::Avg,
        Aggregation::Min,
        Aggregation::Max,
    ];

    pub fn keyword(&self) -> &'static str {
        match self {
            Aggregation::Count => "COUNT",
            Aggregation::Sum => "SUM",
            Aggregation::Avg => "AVG",
            Aggregation::Min => "MIN",
            Aggregation::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

/// One JOIN phrase: type, tables involved, ON conditions split on top-level AND
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinInfo {
    pub join_type: JoinType,
    pub tables: Vec<String>,
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubqueryKind {
    Scalar,
    Exists,
    In,
    From,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubqueryLocation {
    Select,
    Where,
    Having,
    From,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubqueryInfo {
    pub kind: SubqueryKind,
    pub location: SubqueryLocation,
    pub sql: String,
    pub tables: Vec<String>,
    pub is_correlated: bool,
    pub correlation_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CteInfo {
    pub name: String,
    pub sql: String,
    pub columns: Vec<String>,
    pub is_recursive: bool,
    pub references: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowFunctionInfo {
    pub function: String,
    pub arguments: Vec<String>,
    pub partition_by: Vec<String>,
    pub order_by: Vec<String>,
    pub frame: Option<String>,
    pub alias: Option<String>,
}

/// Everything the policy engine and sensitivity scoring need to know about a
/// statement. Produced once per request by the analyzer; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub original_sql: String,
    pub tables: Vec<String>,
    pub select_columns: Vec<String>,
    pub aggregations: Vec<Aggregation>,
    pub is_aggregate_query: bool,
    pub has_where: bool,
    pub where_conditions: Vec<String>,
    pub group_by_columns: Vec<String>,
    pub joins: Vec<JoinInfo>,
    pub subqueries: Vec<SubqueryInfo>,
    pub ctes: Vec<CteInfo>,
    pub window_functions: Vec<WindowFunctionInfo>,
    pub is_valid: bool,
    pub error: Option<String>,
}

impl AnalysisResult {
    pub fn new(original_sql: impl Into<String>) -> Self {
        Self {
            original_sql: original_sql.into(),
            tables: Vec::new(),
            select_columns: Vec::new(),
            aggregations: Vec::new(),
            is_aggregate_query: false,
            has_where: false,
            where_conditions: Vec::new(),
            group_by_columns: Vec::new(),
            joins: Vec::new(),
            subqueries: Vec::new(),
            ctes: Vec::new(),
            window_functions: Vec::new(),
            is_valid: true,
            error: None,
        }
    }

    /// Mark the result invalid; the rest of the pipeline treats it as REJECT input.
    pub fn invalid(original_sql: impl Into<String>, error: impl Into<String>) -> Self {
        let mut result = Self::new(original_sql);
        result.is_valid = false;
        result.error = Some(error.into());
        result
    }

    pub fn outer_join_count(&self) -> usize {
        self.joins
            .iter()
            .filter(|j| j.join_type != JoinType::Inner)
            .count()
    }
}
