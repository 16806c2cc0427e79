//! Statement parser.
//!
//! Parses with `sqlparser`, then narrows the result to the shapes in `ast`.

use serde_json::{Number, Value};
use sqlparser::ast as sp;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser as SqlParser;

use super::ast::*;
use super::error::{ParseError, ParseResult};

pub struct Parser;

impl Parser {
    /// Parse a single statement.
    pub fn parse(sql: &str) -> ParseResult<Statement> {
        let sql = sql.trim().trim_end_matches(';').trim();
        if sql.is_empty() {
            return Err(ParseError::EmptyQuery);
        }

        // directives sqlparser has no use for in this dialect
        let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
        if normalized == "SET TRANSACTION READ ONLY" {
            return Ok(Statement::SetReadOnly);
        }

        let dialect = GenericDialect {};
        let statements = SqlParser::parse_sql(&dialect, sql)?;

        match statements.as_slice() {
            [] => Err(ParseError::EmptyQuery),
            [stmt] => Self::convert_statement(stmt),
            _ => Err(ParseError::MultipleStatements),
        }
    }

    fn convert_statement(stmt: &sp::Statement) -> ParseResult<Statement> {
        match stmt {
            sp::Statement::Query(query) => Self::convert_query(query),
            sp::Statement::Delete(delete) => Self::convert_delete(delete),
            other => Err(ParseError::UnsupportedStatement(other.to_string())),
        }
    }

    fn convert_query(query: &sp::Query) -> ParseResult<Statement> {
        let select = match query.body.as_ref() {
            sp::SetExpr::Select(s) => s,
            other => return Err(ParseError::UnsupportedStatement(other.to_string())),
        };

        let (entity, alias) = match select.from.as_slice() {
            [from] => Self::extract_from_table(from)?,
            _ => {
                return Err(ParseError::UnsupportedStatement(
                    "exactly one entity in FROM required".into(),
                ))
            }
        };

        let projection = match select.projection.as_slice() {
            [item] => Self::convert_projection(item, alias.as_deref())?,
            _ => {
                return Err(ParseError::UnsupportedExpression(
                    "exactly one projection required".into(),
                ))
            }
        };

        let filter = Self::convert_filter(select.selection.as_ref())?;

        let limit = match query.limit.as_ref() {
            Some(expr) => Some(Self::expr_to_usize(expr)?),
            None => None,
        };

        Ok(Statement::Select(Select {
            entity,
            projection,
            filter,
            limit,
        }))
    }

    fn convert_projection(item: &sp::SelectItem, alias: Option<&str>) -> ParseResult<Projection> {
        match item {
            sp::SelectItem::Wildcard(_) => Ok(Projection::Entity),
            sp::SelectItem::UnnamedExpr(sp::Expr::Identifier(ident))
                if Some(ident.value.as_str()) == alias =>
            {
                Ok(Projection::Entity)
            }
            sp::SelectItem::UnnamedExpr(sp::Expr::Value(v)) => {
                Ok(Projection::Constant(Self::convert_value(&v.value)?))
            }
            other => Err(ParseError::UnsupportedExpression(other.to_string())),
        }
    }

    fn convert_delete(delete: &sp::Delete) -> ParseResult<Statement> {
        let tables = match &delete.from {
            sp::FromTable::WithFromKeyword(tables) => tables,
            sp::FromTable::WithoutKeyword(tables) => tables,
        };

        let (entity, _) = match tables.as_slice() {
            [table] => Self::extract_from_table(table)?,
            _ => {
                return Err(ParseError::UnsupportedStatement(
                    "DELETE from multiple entities not supported".into(),
                ))
            }
        };

        let filter = Self::convert_filter(delete.selection.as_ref())?;
        Ok(Statement::Delete(Delete { entity, filter }))
    }

    fn convert_filter(selection: Option<&sp::Expr>) -> ParseResult<Vec<Predicate>> {
        let mut predicates = Vec::new();
        if let Some(expr) = selection {
            Self::collect_conjuncts(expr, &mut predicates)?;
        }
        Ok(predicates)
    }

    /// Flatten `a = x AND (b = y AND c = z)` into equality predicates.
    fn collect_conjuncts(expr: &sp::Expr, out: &mut Vec<Predicate>) -> ParseResult<()> {
        match expr {
            sp::Expr::Nested(inner) => Self::collect_conjuncts(inner, out),
            sp::Expr::BinaryOp {
                left,
                op: sp::BinaryOperator::And,
                right,
            } => {
                Self::collect_conjuncts(left, out)?;
                Self::collect_conjuncts(right, out)
            }
            sp::Expr::BinaryOp {
                left,
                op: sp::BinaryOperator::Eq,
                right,
            } => {
                let predicate = match (Self::column_name(left), Self::column_name(right)) {
                    (Some(column), None) => Predicate {
                        column,
                        operand: Self::convert_operand(right)?,
                    },
                    (None, Some(column)) => Predicate {
                        column,
                        operand: Self::convert_operand(left)?,
                    },
                    _ => return Err(ParseError::UnsupportedExpression(expr.to_string())),
                };
                out.push(predicate);
                Ok(())
            }
            other => Err(ParseError::UnsupportedExpression(other.to_string())),
        }
    }

    fn column_name(expr: &sp::Expr) -> Option<String> {
        match expr {
            sp::Expr::Identifier(id) => Some(id.value.clone()),
            // alias.column
            sp::Expr::CompoundIdentifier(parts) => parts.last().map(|p| p.value.clone()),
            _ => None,
        }
    }

    fn convert_operand(expr: &sp::Expr) -> ParseResult<Operand> {
        match expr {
            sp::Expr::Value(v) => match &v.value {
                sp::Value::Placeholder(p) => {
                    let name = p.trim_start_matches([':', '$', '?', '@']);
                    if name.is_empty() {
                        return Err(ParseError::UnsupportedExpression(format!(
                            "positional parameter {} not supported",
                            p
                        )));
                    }
                    Ok(Operand::Param(name.to_string()))
                }
                other => Ok(Operand::Literal(Self::convert_value(other)?)),
            },
            sp::Expr::UnaryOp {
                op: sp::UnaryOperator::Minus,
                expr,
            } => match Self::convert_operand(expr)? {
                Operand::Literal(Value::Number(n)) => Ok(Operand::Literal(Self::negate(&n)?)),
                _ => Err(ParseError::UnsupportedExpression(expr.to_string())),
            },
            other => Err(ParseError::UnsupportedExpression(other.to_string())),
        }
    }

    fn convert_value(v: &sp::Value) -> ParseResult<Value> {
        match v {
            sp::Value::Null => Ok(Value::Null),
            sp::Value::Boolean(b) => Ok(Value::Bool(*b)),
            sp::Value::Number(s, _) => {
                if let Ok(i) = s.parse::<i64>() {
                    Ok(Value::from(i))
                } else {
                    s.parse::<f64>()
                        .ok()
                        .and_then(Number::from_f64)
                        .map(Value::Number)
                        .ok_or_else(|| ParseError::UnsupportedExpression(format!("invalid number: {}", s)))
                }
            }
            sp::Value::SingleQuotedString(s) => Ok(Value::String(s.clone())),
            other => Err(ParseError::UnsupportedExpression(format!("unsupported value: {}", other))),
        }
    }

    fn negate(n: &Number) -> ParseResult<Value> {
        if let Some(i) = n.as_i64() {
            return Ok(Value::from(-i));
        }
        n.as_f64()
            .and_then(|f| Number::from_f64(-f))
            .map(Value::Number)
            .ok_or_else(|| ParseError::UnsupportedExpression(format!("cannot negate {}", n)))
    }

    fn extract_entity_name(name: &sp::ObjectName) -> ParseResult<String> {
        // ignore any schema qualifier
        name.0
            .last()
            .map(|p| p.as_ident().map(|id| id.value.clone()).unwrap_or_else(|| p.to_string()))
            .ok_or_else(|| ParseError::InvalidIdentifier("empty entity name".into()))
    }

    /// entity name and optional alias
    fn extract_from_table(from: &sp::TableWithJoins) -> ParseResult<(String, Option<String>)> {
        if !from.joins.is_empty() {
            return Err(ParseError::UnsupportedStatement("joins not supported".into()));
        }
        match &from.relation {
            sp::TableFactor::Table { name, alias, .. } => Ok((
                Self::extract_entity_name(name)?,
                alias.as_ref().map(|a| a.name.value.clone()),
            )),
            other => Err(ParseError::UnsupportedStatement(format!(
                "unsupported FROM clause: {}",
                other
            ))),
        }
    }

    fn expr_to_usize(expr: &sp::Expr) -> ParseResult<usize> {
        match expr {
            sp::Expr::Value(v) => match &v.value {
                sp::Value::Number(s, _) => s
                    .parse()
                    .map_err(|_| ParseError::UnsupportedExpression(format!("invalid LIMIT: {}", s))),
                other => Err(ParseError::UnsupportedExpression(format!("invalid LIMIT: {}", other))),
            },
            other => Err(ParseError::UnsupportedExpression(format!("invalid LIMIT: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn param(column: &str) -> Predicate {
        Predicate {
            column: column.into(),
            operand: Operand::Param(column.into()),
        }
    }

    #[test]
    fn test_parse_existence_probe() {
        let sql = format!("SELECT 1 FROM \"Domain\" WHERE {}", and_clause(["name", "tld"]));
        match Parser::parse(&sql).unwrap() {
            Statement::Select(s) => {
                assert_eq!(s.entity, "Domain");
                assert_eq!(s.projection, Projection::Constant(json!(1)));
                assert_eq!(s.filter, vec![param("name"), param("tld")]);
                assert_eq!(s.limit, None);
            }
            other => panic!("Expected Select, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_entity_scan() {
        match Parser::parse("SELECT e FROM \"Domain\" e").unwrap() {
            Statement::Select(s) => {
                assert_eq!(s.entity, "Domain");
                assert_eq!(s.projection, Projection::Entity);
                assert!(s.filter.is_empty());
            }
            other => panic!("Expected Select, got {:?}", other),
        }

        match Parser::parse("SELECT * FROM Domain LIMIT 5").unwrap() {
            Statement::Select(s) => {
                assert_eq!(s.projection, Projection::Entity);
                assert_eq!(s.limit, Some(5));
            }
            other => panic!("Expected Select, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_literals() {
        let sql = "SELECT * FROM Host WHERE name = 'a' AND (port = 42 AND weight = -1.5)";
        match Parser::parse(sql).unwrap() {
            Statement::Select(s) => {
                let operands: Vec<_> = s.filter.into_iter().map(|p| p.operand).collect();
                assert_eq!(
                    operands,
                    vec![
                        Operand::Literal(json!("a")),
                        Operand::Literal(json!(42)),
                        Operand::Literal(json!(-1.5)),
                    ]
                );
            }
            other => panic!("Expected Select, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_delete() {
        match Parser::parse("DELETE FROM \"Domain\" WHERE \"name\" = :name").unwrap() {
            Statement::Delete(d) => {
                assert_eq!(d.entity, "Domain");
                assert_eq!(d.filter, vec![param("name")]);
            }
            other => panic!("Expected Delete, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_read_only_directive() {
        assert_eq!(Parser::parse("SET TRANSACTION READ ONLY").unwrap(), Statement::SetReadOnly);
        assert_eq!(Parser::parse("set  transaction\nread only;").unwrap(), Statement::SetReadOnly);
    }

    #[test]
    fn test_rejects_unsupported() {
        assert!(matches!(Parser::parse(""), Err(ParseError::EmptyQuery)));
        assert!(matches!(
            Parser::parse("SELECT 1 FROM a; SELECT 1 FROM b"),
            Err(ParseError::MultipleStatements)
        ));
        assert!(matches!(
            Parser::parse("SELECT * FROM a WHERE x > 1"),
            Err(ParseError::UnsupportedExpression(_))
        ));
        assert!(matches!(
            Parser::parse("SELECT * FROM a WHERE x = 1 OR y = 2"),
            Err(ParseError::UnsupportedExpression(_))
        ));
        assert!(matches!(
            Parser::parse("UPDATE a SET x = 1"),
            Err(ParseError::UnsupportedStatement(_))
        ));
        assert!(matches!(Parser::parse("SELEC oops"), Err(ParseError::Syntax(_))));
    }
}
