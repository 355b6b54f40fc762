//! Canonical (conjunctive normal form) view of boolean SQL predicates.
//!
//! Canonicalisation is purely structural:
//!
//! ```text
//!   NOT (a OR b) AND (c OR (d AND e))
//!        │
//!        ▼  push NOT inwards, distribute OR over AND
//!   NOT a AND NOT b AND (c OR d) AND (c OR e)
//!        │
//!        ▼  lowercase identifiers, strip parentheses, order `=` operands,
//!           drop duplicates, subsumed clauses and tautologies
//!   CanonicalExpr { clauses: [[¬a], [¬b], [c, d], [c, e]] }
//! ```
//!
//! Two predicates that differ only in parenthesisation, identifier case or
//! the operand order of an equality canonicalise to the same clauses.
//!
//! Every rewrite holds under SQL's three-valued logic. In particular
//! `x OR NOT x` is only dropped when `x` can never be NULL (an `IS ...`
//! test); `a = b OR NOT a = b` is NULL when either side is NULL and stays.

use sqlparser::ast::{visit_expressions_mut, BinaryOperator, Expr, UnaryOperator, Value};
use std::fmt;
use std::ops::ControlFlow;

use crate::DialectError;

/// Upper bound on the number of clauses produced by OR-distribution.
pub const MAX_CNF_CLAUSES: usize = 4096;

// ============================================================================
// Column references
// ============================================================================

/// Which side of the candidate-pair self-join a column belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    Left,
    Right,
}

/// A column reference in either of the two pair notations:
/// `first_name_l` / `first_name_r` or `l.first_name` / `r.first_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    /// Base column name, without side suffix or table alias.
    pub name: String,
    pub side: Side,
}

impl ColumnRef {
    pub fn from_expr(expr: &Expr) -> Option<Self> {
        match expr {
            Expr::Identifier(ident) => Self::from_suffixed(&ident.value),
            Expr::CompoundIdentifier(parts) if parts.len() == 2 => {
                let side = match parts[0].value.to_ascii_lowercase().as_str() {
                    "l" => Side::Left,
                    "r" => Side::Right,
                    _ => return None,
                };
                Some(ColumnRef {
                    name: parts[1].value.clone(),
                    side,
                })
            }
            _ => None,
        }
    }

    fn from_suffixed(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        let side = if lower.ends_with("_l") {
            Side::Left
        } else if lower.ends_with("_r") {
            Side::Right
        } else {
            return None;
        };
        let base = &name[..name.len() - 2];
        if base.is_empty() {
            return None;
        }
        Some(ColumnRef {
            name: base.to_string(),
            side,
        })
    }
}

// ============================================================================
// Canonical form
// ============================================================================

/// A possibly negated atomic predicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Literal {
    pub negated: bool,
    pub atom: Expr,
}

impl Literal {
    /// Base column name if this literal is `col_l = col_r` on a single column.
    pub fn column_equality(&self) -> Option<String> {
        if self.negated {
            return None;
        }
        let Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } = &self.atom
        else {
            return None;
        };
        let (a, b) = (ColumnRef::from_expr(left)?, ColumnRef::from_expr(right)?);
        (a.side != b.side && a.name.eq_ignore_ascii_case(&b.name))
            .then(|| a.name.to_ascii_lowercase())
    }

    fn complements(&self, other: &Literal) -> bool {
        self.negated != other.negated && self.atom == other.atom
    }

    /// Whether the atom evaluates to TRUE or FALSE, never NULL.
    fn is_two_valued(&self) -> bool {
        matches!(
            self.atom,
            Expr::IsNull(_)
                | Expr::IsNotNull(_)
                | Expr::IsTrue(_)
                | Expr::IsNotTrue(_)
                | Expr::IsFalse(_)
                | Expr::IsNotFalse(_)
                | Expr::IsUnknown(_)
                | Expr::IsNotUnknown(_)
        )
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "NOT ({})", self.atom)
        } else {
            write!(f, "{}", self.atom)
        }
    }
}

/// A disjunction of literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    literals: Vec<Literal>,
}

impl Clause {
    pub fn literals(&self) -> &[Literal] {
        &self.literals
    }

    /// The single literal of a unit clause.
    pub fn as_unit(&self) -> Option<&Literal> {
        match self.literals.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    fn is_subset_of(&self, other: &Clause) -> bool {
        self.literals.iter().all(|lit| other.literals.contains(lit))
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.literals.is_empty() {
            return f.write_str("FALSE");
        }
        let rendered: Vec<String> = self.literals.iter().map(ToString::to_string).collect();
        write!(f, "{}", rendered.join(" OR "))
    }
}

/// A conjunction of clauses. No clauses means the predicate is always
/// true; an empty clause means it is always false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalExpr {
    clauses: Vec<Clause>,
}

impl CanonicalExpr {
    pub fn from_expr(expr: Expr) -> Result<Self, DialectError> {
        let clauses = to_cnf(BoolTree::build(expr), false)?;
        Ok(Self {
            clauses: simplify(clauses),
        })
    }

    /// Top-level conjuncts.
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Base columns of the predicate if every conjunct is `col_l = col_r`.
    pub fn exact_match_columns(&self) -> Option<Vec<String>> {
        if self.clauses.is_empty() {
            return None;
        }
        let mut columns = Vec::new();
        for clause in &self.clauses {
            let column = clause.as_unit()?.column_equality()?;
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        Some(columns)
    }

    pub fn is_exact_match(&self) -> bool {
        self.exact_match_columns().is_some()
    }

    /// Columns the predicate forces to be equal on both sides, ignoring
    /// conjuncts of any other shape.
    pub fn equality_columns(&self) -> Vec<String> {
        let mut columns = Vec::new();
        for column in self
            .clauses
            .iter()
            .filter_map(|clause| clause.as_unit()?.column_equality())
        {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        columns
    }

    /// Evaluate the predicate given a truth value for every atom.
    pub fn evaluate(&self, truth: impl Fn(&Expr) -> bool) -> bool {
        self.clauses.iter().all(|clause| {
            clause
                .literals
                .iter()
                .any(|lit| truth(&lit.atom) != lit.negated)
        })
    }
}

impl fmt::Display for CanonicalExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return f.write_str("TRUE");
        }
        let multi = self.clauses.len() > 1;
        let rendered: Vec<String> = self
            .clauses
            .iter()
            .map(|clause| {
                if multi && clause.literals.len() > 1 {
                    format!("({clause})")
                } else {
                    clause.to_string()
                }
            })
            .collect();
        f.write_str(&rendered.join(" AND "))
    }
}

// ============================================================================
// Conversion
// ============================================================================

enum BoolTree {
    And(Vec<BoolTree>),
    Or(Vec<BoolTree>),
    Not(Box<BoolTree>),
    Const(bool),
    Atom(Expr),
}

impl BoolTree {
    fn build(expr: Expr) -> Self {
        match expr {
            Expr::Nested(inner) => Self::build(*inner),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => BoolTree::And(vec![Self::build(*left), Self::build(*right)]),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Or,
                right,
            } => BoolTree::Or(vec![Self::build(*left), Self::build(*right)]),
            Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr,
            } => BoolTree::Not(Box::new(Self::build(*expr))),
            Expr::Value(Value::Boolean(value)) => BoolTree::Const(value),
            other => BoolTree::Atom(normalize_atom(other)),
        }
    }
}

type Clauses = Vec<Vec<Literal>>;

fn to_cnf(tree: BoolTree, negated: bool) -> Result<Clauses, DialectError> {
    match (tree, negated) {
        (BoolTree::Atom(atom), negated) => Ok(vec![vec![Literal { negated, atom }]]),
        (BoolTree::Const(value), negated) if value != negated => Ok(Vec::new()),
        (BoolTree::Const(_), _) => Ok(vec![Vec::new()]),
        (BoolTree::Not(inner), negated) => to_cnf(*inner, !negated),
        (BoolTree::And(children), false) | (BoolTree::Or(children), true) => {
            let mut clauses = Vec::new();
            for child in children {
                clauses.extend(to_cnf(child, negated)?);
            }
            Ok(clauses)
        }
        (BoolTree::Or(children), false) | (BoolTree::And(children), true) => {
            // A single empty clause is FALSE, the identity for disjunction.
            let mut acc: Clauses = vec![Vec::new()];
            for child in children {
                let child = to_cnf(child, negated)?;
                if acc.len().saturating_mul(child.len()) > MAX_CNF_CLAUSES {
                    return Err(DialectError::TooComplex {
                        limit: MAX_CNF_CLAUSES,
                    });
                }
                let mut next = Vec::with_capacity(acc.len() * child.len());
                for left in &acc {
                    for right in &child {
                        let mut merged = left.clone();
                        merged.extend(right.iter().cloned());
                        next.push(merged);
                    }
                }
                acc = next;
            }
            Ok(acc)
        }
    }
}

fn simplify(clauses: Clauses) -> Vec<Clause> {
    let mut reduced: Vec<Clause> = Vec::new();
    for literals in clauses {
        let mut unique: Vec<Literal> = Vec::with_capacity(literals.len());
        for lit in literals {
            if !unique.contains(&lit) {
                unique.push(lit);
            }
        }
        let tautology = unique
            .iter()
            .any(|a| a.is_two_valued() && unique.iter().any(|b| a.complements(b)));
        if !tautology {
            reduced.push(Clause { literals: unique });
        }
    }

    let mut kept = Vec::with_capacity(reduced.len());
    for (i, clause) in reduced.iter().enumerate() {
        let subsumed = reduced.iter().enumerate().any(|(j, other)| {
            j != i
                && other.is_subset_of(clause)
                && (other.literals.len() < clause.literals.len() || j < i)
        });
        if !subsumed {
            kept.push(clause.clone());
        }
    }
    kept
}

fn normalize_atom(mut expr: Expr) -> Expr {
    let _ = visit_expressions_mut(&mut expr, |e| {
        match e {
            Expr::Identifier(ident) => {
                ident.value = ident.value.to_lowercase();
                ident.quote_style = None;
            }
            Expr::CompoundIdentifier(idents) => {
                for ident in idents.iter_mut() {
                    ident.value = ident.value.to_lowercase();
                    ident.quote_style = None;
                }
            }
            Expr::Nested(inner) => {
                let unwrapped = std::mem::replace(inner.as_mut(), Expr::Value(Value::Null));
                *e = unwrapped;
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    order_operands(expr)
}

fn order_operands(expr: Expr) -> Expr {
    match expr {
        Expr::BinaryOp { left, op, right }
            if matches!(op, BinaryOperator::Eq | BinaryOperator::NotEq)
                && left.to_string() > right.to_string() =>
        {
            Expr::BinaryOp {
                left: right,
                op,
                right: left,
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DialectAdapter, SqlDialect};

    fn canonical(sql: &str) -> CanonicalExpr {
        DialectAdapter::new(SqlDialect::Generic)
            .canonicalize(sql)
            .unwrap()
    }

    #[test]
    fn single_equality_is_exact_match() {
        let expr = canonical("first_name_l = first_name_r");
        assert_eq!(expr.exact_match_columns(), Some(vec!["first_name".to_string()]));
    }

    #[test]
    fn conjunction_of_equalities_is_exact_match_on_all_columns() {
        let expr = canonical("(FIRST_NAME_L = first_name_r) AND (surname_r = surname_l)");
        assert_eq!(
            expr.exact_match_columns(),
            Some(vec!["first_name".to_string(), "surname".to_string()])
        );
    }

    #[test]
    fn disjunction_or_function_is_not_exact_match() {
        assert!(!canonical("first_name_l = first_name_r OR surname_l = surname_r").is_exact_match());
        assert!(!canonical("levenshtein(first_name_l, first_name_r) <= 2").is_exact_match());
        assert!(!canonical("first_name_l = surname_r").is_exact_match());
        assert!(!canonical("NOT (first_name_l = first_name_r)").is_exact_match());
    }

    #[test]
    fn dotted_notation_is_recognised() {
        let expr = canonical("l.surname = r.surname and substr(l.dob, 1, 4) = substr(r.dob, 1, 4)");
        assert_eq!(expr.equality_columns(), vec!["surname".to_string()]);
        assert!(!expr.is_exact_match());
    }

    #[test]
    fn not_is_pushed_through_or() {
        let expr = canonical("NOT (a_l = a_r OR b_l = b_r)");
        assert_eq!(expr.clauses().len(), 2);
        assert!(expr
            .clauses()
            .iter()
            .all(|c| c.as_unit().map(|lit| lit.negated).unwrap_or(false)));
    }

    #[test]
    fn or_distributes_over_and() {
        let expr = canonical("a_l = a_r OR (b_l = b_r AND c_l = c_r)");
        assert_eq!(expr.clauses().len(), 2);
        assert!(expr.clauses().iter().all(|c| c.literals().len() == 2));
    }

    #[test]
    fn duplicates_tautologies_and_subsumed_clauses_are_dropped() {
        let expr = canonical(
            "a_l = a_r AND (a_r = a_l OR b_l = b_r) AND (c_l IS NULL OR NOT c_l IS NULL)",
        );
        assert_eq!(expr.to_string(), "a_l = a_r");
    }

    #[test]
    fn excluded_middle_over_nullable_atoms_is_kept() {
        // NULL when c_l or c_r is NULL, so not always true.
        let expr = canonical("a_l = a_r AND (c_l = c_r OR NOT c_l = c_r)");
        assert_eq!(expr.clauses().len(), 2);
        assert_eq!(expr.clauses()[1].literals().len(), 2);
        assert_eq!(expr.exact_match_columns(), None);
    }

    #[test]
    fn double_negation_cancels() {
        assert_eq!(
            canonical("NOT NOT (x_l = x_r)"),
            canonical("x_l = x_r")
        );
    }
}
