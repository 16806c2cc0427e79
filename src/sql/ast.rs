//! Statements understood by the store.
//!
//! The transaction layer only ever issues a handful of shapes: existence
//! probes, whole-entity scans, keyed deletes and the read-only directive.
//! Filters are conjunctions of equality tests, nothing else.

use std::collections::BTreeMap;

use serde_json::Value;

use super::error::{ParseError, ParseResult};

/// A parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Select),
    Delete(Delete),
    /// `SET TRANSACTION READ ONLY`
    SetReadOnly,
}

/// `SELECT <projection> FROM <entity> [alias] [WHERE ...] [LIMIT n]`
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub entity: String,
    pub projection: Projection,
    pub filter: Vec<Predicate>,
    pub limit: Option<usize>,
}

/// What a matching row yields.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// `SELECT 1 ...`: one constant per match
    Constant(Value),
    /// `SELECT e FROM E e` or `SELECT *`: the entity itself
    Entity,
}

/// `DELETE FROM <entity> [WHERE ...]`
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub entity: String,
    pub filter: Vec<Predicate>,
}

/// `column = operand`
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub operand: Operand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// `:name`
    Param(String),
    Literal(Value),
}

impl Predicate {
    /// Evaluate against a column value; a missing column never matches.
    pub fn matches(&self, column_value: Option<&Value>, bindings: &Bindings) -> ParseResult<bool> {
        let expected = bindings.resolve(&self.operand)?;
        Ok(column_value == Some(expected))
    }
}

/// Named parameter values for a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings(BTreeMap<String, Value>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// builder-style bind
    pub fn bind(mut self, name: impl Into<String>, value: Value) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn resolve<'a>(&'a self, operand: &'a Operand) -> ParseResult<&'a Value> {
        match operand {
            Operand::Literal(v) => Ok(v),
            Operand::Param(name) => self
                .0
                .get(name)
                .ok_or_else(|| ParseError::UnboundParameter(name.clone())),
        }
    }
}

/// Double-quote an identifier for generated statements.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"a" = :a AND "b" = :b`
pub fn and_clause<'a>(columns: impl IntoIterator<Item = &'a str>) -> String {
    columns
        .into_iter()
        .map(|c| format!("{} = :{}", quote_ident(c), c))
        .collect::<Vec<_>>()
        .join(" AND ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_and_clause() {
        assert_eq!(and_clause(["a"]), "\"a\" = :a");
        assert_eq!(and_clause(["a", "b"]), "\"a\" = :a AND \"b\" = :b");
    }

    #[test]
    fn test_predicate_matching() {
        let pred = Predicate {
            column: "name".into(),
            operand: Operand::Param("name".into()),
        };
        let bindings = Bindings::new().bind("name", json!("x.tld"));

        assert!(pred.matches(Some(&json!("x.tld")), &bindings).unwrap());
        assert!(!pred.matches(Some(&json!("y.tld")), &bindings).unwrap());
        assert!(!pred.matches(None, &bindings).unwrap());
    }

    #[test]
    fn test_unbound_parameter() {
        let pred = Predicate {
            column: "name".into(),
            operand: Operand::Param("name".into()),
        };
        let err = pred.matches(Some(&json!(1)), &Bindings::new()).unwrap_err();
        assert!(matches!(err, ParseError::UnboundParameter(p) if p == "name"));
    }
}
