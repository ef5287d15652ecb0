//! Shape `WHERE` predicates and their conservative evaluation.
//!
//! Predicates are evaluated against text-format rows with three-valued
//! logic: a comparison whose column is missing, NULL, or unparsable is
//! *unknown*, and unknown collapses to "matches" at the top level. A
//! false positive only costs a consumer a no-op delivery; a false
//! negative would lose a change, so the evaluator never produces one.

use std::fmt;

use crate::change::Row;
use crate::shape::{ShapeDependency, ShapeHandle};

// ---------------------------------------------------------------------------
// Literals and operators
// ---------------------------------------------------------------------------

/// A literal value in a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// 64-bit signed integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Text.
    Text(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v}"),
            Literal::Bool(v) => write!(f, "{v}"),
            Literal::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// A shape `WHERE` predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `column op literal`.
    Compare {
        /// Column name.
        column: String,
        /// Comparison operator.
        op: CompareOp,
        /// Literal operand.
        value: Literal,
    },
    /// Conjunction.
    And(Box<Predicate>, Box<Predicate>),
    /// Disjunction.
    Or(Box<Predicate>, Box<Predicate>),
    /// `column IN (SELECT inner_column FROM <inner shape>)`.
    InShape {
        /// Column of the outer relation.
        column: String,
        /// Handle of the inner shape.
        shape: ShapeHandle,
        /// Column of the inner shape.
        inner_column: String,
    },
}

impl Predicate {
    /// Builds a comparison predicate.
    #[must_use]
    pub fn compare(column: impl Into<String>, op: CompareOp, value: Literal) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value,
        }
    }

    /// Builds a subquery membership predicate.
    #[must_use]
    pub fn in_shape(
        column: impl Into<String>,
        shape: ShapeHandle,
        inner_column: impl Into<String>,
    ) -> Self {
        Predicate::InShape {
            column: column.into(),
            shape,
            inner_column: inner_column.into(),
        }
    }

    /// Conjoins two predicates.
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        Predicate::And(Box::new(self), Box::new(other))
    }

    /// Disjoins two predicates.
    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    /// Conservative match: `true` unless the row definitely fails the
    /// predicate. Subquery terms are unknown here and so match.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        self.eval(row, &|_, _, _| None).unwrap_or(true)
    }

    /// Match with subquery membership resolved through `membership`, which
    /// answers whether `value` is currently in the named inner shape's
    /// `inner_column` set. Unknown terms still collapse to `true`.
    #[must_use]
    pub fn matches_with_membership(
        &self,
        row: &Row,
        membership: &dyn Fn(&ShapeHandle, &str, &str) -> bool,
    ) -> bool {
        self.eval(row, &|shape, inner_column, value| {
            Some(membership(shape, inner_column, value))
        })
        .unwrap_or(true)
    }

    /// Three-valued evaluation; `None` is unknown. The membership callback
    /// receives `(shape, inner_column, value)`.
    fn eval(
        &self,
        row: &Row,
        membership: &dyn Fn(&ShapeHandle, &str, &str) -> Option<bool>,
    ) -> Option<bool> {
        match self {
            Predicate::Compare { column, op, value } => {
                let text = row.get(column)??;
                compare_text(text, *op, value)
            }
            Predicate::And(a, b) => match (a.eval(row, membership), b.eval(row, membership)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            Predicate::Or(a, b) => match (a.eval(row, membership), b.eval(row, membership)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
            Predicate::InShape {
                column,
                shape,
                inner_column,
            } => {
                let text = row.get(column)??;
                membership(shape, inner_column, text)
            }
        }
    }

    /// Returns the inner-shape references appearing in the predicate.
    #[must_use]
    pub fn shape_references(&self) -> Vec<ShapeDependency> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references(&self, out: &mut Vec<ShapeDependency>) {
        match self {
            Predicate::Compare { .. } => {}
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.collect_references(out);
                b.collect_references(out);
            }
            Predicate::InShape {
                column,
                shape,
                inner_column,
            } => out.push(ShapeDependency {
                inner: shape.clone(),
                outer_column: column.clone(),
                inner_column: inner_column.clone(),
            }),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare { column, op, value } => write!(f, "{column} {op} {value}"),
            Predicate::And(a, b) => write!(f, "({a} AND {b})"),
            Predicate::Or(a, b) => write!(f, "({a} OR {b})"),
            Predicate::InShape {
                column,
                shape,
                inner_column,
            } => write!(f, "{column} IN (SELECT {inner_column} FROM shape:{shape})"),
        }
    }
}

/// Compares a text-format value against a literal. `None` when the text
/// cannot be parsed as the literal's type.
fn compare_text(text: &str, op: CompareOp, value: &Literal) -> Option<bool> {
    let ordering = match value {
        Literal::Int(rhs) => text.parse::<i64>().ok()?.cmp(rhs),
        Literal::Float(rhs) => text.parse::<f64>().ok()?.partial_cmp(rhs)?,
        Literal::Bool(rhs) => {
            let lhs = match text {
                "t" | "true" => true,
                "f" | "false" => false,
                _ => return None,
            };
            lhs.cmp(rhs)
        }
        Literal::Text(rhs) => text.cmp(rhs.as_str()),
    };
    let result = match op {
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::NotEq => ordering.is_ne(),
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::LtEq => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::GtEq => ordering.is_ge(),
    };
    Some(result)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Option<&str>)]) -> Row {
        Row::from_pairs(pairs.iter().map(|(k, v)| (*k, *v)))
    }

    // --- Comparison tests ---

    #[test]
    fn test_int_comparison() {
        let pred = Predicate::compare("age", CompareOp::Gt, Literal::Int(21));
        assert!(pred.matches(&row(&[("age", Some("42"))])));
        assert!(!pred.matches(&row(&[("age", Some("7"))])));
        assert!(!pred.matches(&row(&[("age", Some("21"))])));
    }

    #[test]
    fn test_text_comparison() {
        let pred = Predicate::compare("name", CompareOp::Eq, Literal::Text("ada".into()));
        assert!(pred.matches(&row(&[("name", Some("ada"))])));
        assert!(!pred.matches(&row(&[("name", Some("bob"))])));
    }

    #[test]
    fn test_bool_comparison() {
        let pred = Predicate::compare("active", CompareOp::Eq, Literal::Bool(true));
        assert!(pred.matches(&row(&[("active", Some("t"))])));
        assert!(!pred.matches(&row(&[("active", Some("f"))])));
    }

    // --- Conservative behavior ---

    #[test]
    fn test_missing_column_matches() {
        let pred = Predicate::compare("age", CompareOp::Lt, Literal::Int(10));
        assert!(pred.matches(&row(&[("other", Some("1"))])));
    }

    #[test]
    fn test_null_matches() {
        let pred = Predicate::compare("age", CompareOp::Lt, Literal::Int(10));
        assert!(pred.matches(&row(&[("age", None)])));
    }

    #[test]
    fn test_unparsable_matches() {
        let pred = Predicate::compare("age", CompareOp::Lt, Literal::Int(10));
        assert!(pred.matches(&row(&[("age", Some("not-a-number"))])));
    }

    #[test]
    fn test_subquery_term_matches_without_membership() {
        let pred = Predicate::in_shape("team_id", ShapeHandle::new("abc"), "id");
        assert!(pred.matches(&row(&[("team_id", Some("3"))])));
    }

    // --- Boolean connectives ---

    #[test]
    fn test_and_definite_false_wins_over_unknown() {
        let pred = Predicate::compare("age", CompareOp::Gt, Literal::Int(21))
            .and(Predicate::compare("missing", CompareOp::Eq, Literal::Int(1)));
        // age fails, so the conjunction is definitely false.
        assert!(!pred.matches(&row(&[("age", Some("7"))])));
        // age passes, other side unknown: conservative match.
        assert!(pred.matches(&row(&[("age", Some("42"))])));
    }

    #[test]
    fn test_or_short_circuit() {
        let pred = Predicate::compare("age", CompareOp::Gt, Literal::Int(21))
            .or(Predicate::compare("vip", CompareOp::Eq, Literal::Bool(true)));
        assert!(pred.matches(&row(&[("age", Some("7")), ("vip", Some("t"))])));
        assert!(!pred.matches(&row(&[("age", Some("7")), ("vip", Some("f"))])));
    }

    // --- Membership evaluation ---

    #[test]
    fn test_membership_resolution() {
        let handle = ShapeHandle::new("inner");
        let pred = Predicate::in_shape("team_id", handle.clone(), "id");
        let members = |_: &ShapeHandle, _: &str, value: &str| value == "3";
        assert!(pred.matches_with_membership(&row(&[("team_id", Some("3"))]), &members));
        assert!(!pred.matches_with_membership(&row(&[("team_id", Some("4"))]), &members));
    }

    #[test]
    fn test_membership_with_local_conjunct() {
        let handle = ShapeHandle::new("inner");
        let pred = Predicate::compare("age", CompareOp::GtEq, Literal::Int(18))
            .and(Predicate::in_shape("team_id", handle, "id"));
        let members = |_: &ShapeHandle, _: &str, value: &str| value == "3";
        assert!(pred.matches_with_membership(
            &row(&[("age", Some("30")), ("team_id", Some("3"))]),
            &members
        ));
        assert!(!pred.matches_with_membership(
            &row(&[("age", Some("30")), ("team_id", Some("9"))]),
            &members
        ));
        assert!(!pred.matches_with_membership(
            &row(&[("age", Some("12")), ("team_id", Some("3"))]),
            &members
        ));
    }

    // --- Display ---

    #[test]
    fn test_display_canonical_form() {
        let pred = Predicate::compare("age", CompareOp::Gt, Literal::Int(21)).and(
            Predicate::in_shape("team_id", ShapeHandle::new("ff00"), "id"),
        );
        assert_eq!(
            pred.to_string(),
            "(age > 21 AND team_id IN (SELECT id FROM shape:ff00))"
        );
    }

    #[test]
    fn test_display_escapes_text_literal() {
        let pred = Predicate::compare("name", CompareOp::Eq, Literal::Text("o'hara".into()));
        assert_eq!(pred.to_string(), "name = 'o''hara'");
    }

    #[test]
    fn test_shape_references_collects_nested() {
        let a = ShapeHandle::new("a");
        let b = ShapeHandle::new("b");
        let pred = Predicate::in_shape("x", a.clone(), "id")
            .and(Predicate::in_shape("y", b.clone(), "id"));
        let refs = pred.shape_references();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].inner, a);
        assert_eq!(refs[1].inner, b);
    }
}
