use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    /// Column is null; the value is ignored
    IsNull,
    /// Case-insensitive pattern with `%` wildcards
    ILike,
}

impl FilterOp {
    fn postgrest(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::IsNull => "is",
            FilterOp::ILike => "ilike",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Collection read/write target: table plus column filters, order and limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub table: Table,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn table(table: Table) -> Self {
        Self { table, filters: vec![], order: None, limit: None }
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Eq, value)
    }

    pub fn is_null(self, column: impl Into<String>) -> Self {
        self.filter(column, FilterOp::IsNull, Value::Null)
    }

    pub fn ilike(self, column: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.filter(column, FilterOp::ILike, Value::String(pattern.into()))
    }

    fn filter(mut self, column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter { column: column.into(), op, value: value.into() });
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order { column: column.into(), ascending });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// PostgREST query parameters (`id=eq.abc`, `order=created_at.desc`, `limit=1`)
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .filters
            .iter()
            .map(|f| (f.column.clone(), format!("{}.{}", f.op.postgrest(), render_value(&f.value))))
            .collect();
        if let Some(order) = &self.order {
            let direction = if order.ascending { "asc" } else { "desc" };
            pairs.push(("order".to_string(), format!("{}.{}", order.column, direction)));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|filter| {
            let actual = row.get(&filter.column).unwrap_or(&Value::Null);
            match filter.op {
                FilterOp::Eq => values_equal(actual, &filter.value),
                FilterOp::IsNull => actual.is_null(),
                FilterOp::ILike => match (actual, &filter.value) {
                    (Value::String(text), Value::String(pattern)) => ilike(text, pattern),
                    _ => false,
                },
            }
        })
    }

    /// Filter, order and limit rows the way the hosted store would
    pub fn apply(&self, rows: &[Value]) -> Vec<Value> {
        let mut selected: Vec<Value> = rows.iter().filter(|row| self.matches(row)).cloned().collect();
        if let Some(order) = &self.order {
            selected.sort_by(|a, b| {
                let ordering = compare_values(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                );
                if order.ascending { ordering } else { ordering.reverse() }
            });
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        // Filters coming from URLs are strings; compare by rendering
        (Value::Number(_) | Value::Bool(_), Value::String(s)) => render_value(actual) == *s,
        _ => actual == expected,
    }
}

// Nulls sort last in ascending order
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn ilike(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    wildcard_match(&text, &pattern)
}

fn wildcard_match(text: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((&'%', rest)) => (0..=text.len()).any(|skip| wildcard_match(&text[skip..], rest)),
        Some((&'_', rest)) => !text.is_empty() && wildcard_match(&text[1..], rest),
        // Backslash makes the next pattern character literal
        Some((&'\\', [escaped, rest @ ..])) => text.first() == Some(escaped) && wildcard_match(&text[1..], rest),
        Some((c, rest)) => text.first() == Some(c) && wildcard_match(&text[1..], rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_postgrest_pairs() {
        let query = Query::table(Table::Apps)
            .eq("id", "abc-123")
            .order("created_at", false)
            .limit(1);
        assert_eq!(
            query.to_query_pairs(),
            vec![
                ("id".to_string(), "eq.abc-123".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
                ("limit".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn applies_filters_order_and_limit() {
        let rows = vec![
            json!({ "id": "a", "category": "games", "created_at": "2024-01-01T00:00:00Z" }),
            json!({ "id": "b", "category": "games", "created_at": "2024-03-01T00:00:00Z" }),
            json!({ "id": "c", "category": "music", "created_at": "2024-02-01T00:00:00Z" }),
        ];
        let query = Query::table(Table::Apps)
            .eq("category", "games")
            .order("created_at", false);
        let ids: Vec<_> = query.apply(&rows).iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("b"), json!("a")]);

        let limited = Query::table(Table::Apps).order("created_at", true).limit(1);
        assert_eq!(limited.apply(&rows)[0]["id"], "a");
    }

    #[test]
    fn ilike_is_case_insensitive_with_wildcards() {
        let row = json!({ "name": "PhotoMagic Pro" });
        assert!(Query::table(Table::Apps).ilike("name", "%magic%").matches(&row));
        assert!(!Query::table(Table::Apps).ilike("name", "magic%").matches(&row));
        let literal = Query::table(Table::Apps).ilike("name", "%100\\%%");
        assert!(literal.matches(&json!({ "name": "Juice 100% Pure" })));
        assert!(!literal.matches(&json!({ "name": "Juice 1000 Pure" })));
    }

    #[test]
    fn numeric_columns_match_string_filters() {
        let row = json!({ "rating": 5 });
        assert!(Query::table(Table::AppReviews).eq("rating", "5").matches(&row));
        assert!(!Query::table(Table::AppReviews).eq("rating", 4).matches(&row));
    }

    #[test]
    fn null_filter_matches_missing_columns() {
        let query = Query::table(Table::Apps).eq("id", "a1").is_null("downloads");
        assert_eq!(
            query.to_query_pairs(),
            vec![
                ("id".to_string(), "eq.a1".to_string()),
                ("downloads".to_string(), "is.null".to_string()),
            ]
        );
        assert!(query.matches(&json!({ "id": "a1" })));
        assert!(!query.matches(&json!({ "id": "a1", "downloads": 3 })));
    }
}
