//! Expression AST.
//!
//! A closed sum type: every consumer matches exhaustively, so a new variant
//! is a compile error everywhere it is not handled.
use std::fmt;

/// Largest integer an f64 holds exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

#[derive(Debug, Clone, PartialEq)]
pub enum ExprNode {
    /// String literal: `'abc'` or `"abc"`.
    String(String),
    /// Number literal.
    Number(f64),
    /// `true`, `false` or `null`.
    Value(Value),
    /// Field or relation name: `title`, `` `created at` ``.
    Name(String),
    /// Variable reference. `$x` has name `x`, `$$pubs` has name `$pubs`,
    /// bare `$` has the empty name.
    Variable(String),
    Binary {
        op: BinaryOp,
        lhs: Box<ExprNode>,
        rhs: Box<ExprNode>,
    },
    Unary(UnaryNode),
    /// Dotted path; always at least one step.
    Path(Vec<Step>),
    /// Function call `$name(args)`; `name` excludes the `$`.
    Function { name: String, args: Vec<ExprNode> },
    /// `condition ? then : otherwise`
    Condition {
        condition: Box<ExprNode>,
        then: Box<ExprNode>,
        otherwise: Option<Box<ExprNode>>,
    },
    /// `(a; b; c)`
    Block(Vec<ExprNode>),
    /// `$name := value`
    Bind { name: String, value: Box<ExprNode> },
    /// `^(<a, >b)`. Bracket stages trailing a sort live on its path step.
    Sort(Vec<SortTerm>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Null,
}

/// Unary forms; the payload differs per operator.
#[derive(Debug, Clone, PartialEq)]
pub enum UnaryNode {
    Negate(Box<ExprNode>),
    /// `{ key: value, ... }`
    Object(Vec<(ExprNode, ExprNode)>),
    /// `[a, b, c]`; elements may be `..` ranges.
    Array(Vec<ExprNode>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    And,
    Or,
    /// `&`: string concatenation.
    Concat,
    In,
    /// `..`: only meaningful inside brackets.
    Range,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Concat => "&",
            BinaryOp::In => "in",
            BinaryOp::Range => "..",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
                | BinaryOp::In
        )
    }
}

/// One step of a path, with the bracket expressions attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub node: ExprNode,
    pub stages: Vec<ExprNode>,
}

impl Step {
    pub fn new(node: ExprNode) -> Self {
        Step {
            node,
            stages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortTerm {
    pub descending: bool,
    pub expr: ExprNode,
}

impl ExprNode {
    /// The table name when this node is a `$$table` root reference.
    pub fn table_root(&self) -> Option<&str> {
        match self {
            ExprNode::Variable(name) => name.strip_prefix('$').filter(|t| !t.is_empty()),
            _ => None,
        }
    }

    /// First step of a path rooted at `$$table`, if any.
    pub fn path_table_root(&self) -> Option<&str> {
        match self {
            ExprNode::Path(steps) => steps.first().and_then(|s| s.node.table_root()),
            other => other.table_root(),
        }
    }

    /// Integer value of a number literal, when it is exactly representable
    /// (|n| <= 2^53 - 1).
    pub fn as_index(&self) -> Option<i64> {
        match self {
            ExprNode::Number(n) if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER => {
                Some(*n as i64)
            }
            ExprNode::Unary(UnaryNode::Negate(inner)) => inner.as_index().map(|n| -n),
            _ => None,
        }
    }

    /// `(start, end)` when this node is a bracketed range `[a..b]`.
    pub fn as_bracketed_range(&self) -> Option<(&ExprNode, &ExprNode)> {
        match self {
            ExprNode::Unary(UnaryNode::Array(items)) if items.len() == 1 => match &items[0] {
                ExprNode::Binary {
                    op: BinaryOp::Range,
                    lhs,
                    rhs,
                } => Some((lhs, rhs)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            ExprNode::String(_) | ExprNode::Number(_) | ExprNode::Value(_)
        )
    }
}

fn write_stages(f: &mut fmt::Formatter<'_>, stages: &[ExprNode]) -> fmt::Result {
    for stage in stages {
        write!(f, "[{}]", stage)?;
    }
    Ok(())
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[ExprNode]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for ExprNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprNode::String(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
            ExprNode::Number(n) => write!(f, "{}", n),
            ExprNode::Value(Value::Bool(b)) => write!(f, "{}", b),
            ExprNode::Value(Value::Null) => write!(f, "null"),
            ExprNode::Name(name) => {
                if name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    write!(f, "{}", name)
                } else {
                    write!(f, "`{}`", name)
                }
            }
            ExprNode::Variable(name) => write!(f, "${}", name),
            ExprNode::Binary { op, lhs, rhs } => match op {
                BinaryOp::Range => write!(f, "{}..{}", lhs, rhs),
                _ => write!(f, "{} {} {}", lhs, op.symbol(), rhs),
            },
            ExprNode::Unary(UnaryNode::Negate(inner)) => write!(f, "-{}", inner),
            ExprNode::Unary(UnaryNode::Object(pairs)) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            ExprNode::Unary(UnaryNode::Array(items)) => {
                write!(f, "[")?;
                write_list(f, items)?;
                write!(f, "]")
            }
            ExprNode::Path(steps) => {
                for (i, step) in steps.iter().enumerate() {
                    if i > 0 && !matches!(step.node, ExprNode::Sort(_)) {
                        write!(f, ".")?;
                    }
                    write!(f, "{}", step.node)?;
                    write_stages(f, &step.stages)?;
                }
                Ok(())
            }
            ExprNode::Function { name, args } => {
                write!(f, "${}(", name)?;
                write_list(f, args)?;
                write!(f, ")")
            }
            ExprNode::Condition {
                condition,
                then,
                otherwise,
            } => {
                write!(f, "{} ? {}", condition, then)?;
                if let Some(other) = otherwise {
                    write!(f, " : {}", other)?;
                }
                Ok(())
            }
            ExprNode::Block(exprs) => {
                write!(f, "(")?;
                for (i, e) in exprs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
            ExprNode::Bind { name, value } => write!(f, "${} := {}", name, value),
            ExprNode::Sort(terms) => {
                write!(f, "^(")?;
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if term.descending {
                        write!(f, ">")?;
                    }
                    write!(f, "{}", term.expr)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_root() {
        assert_eq!(ExprNode::Variable("$pubs".into()).table_root(), Some("pubs"));
        assert_eq!(ExprNode::Variable("x".into()).table_root(), None);
        assert_eq!(ExprNode::Variable("$".into()).table_root(), None);
    }

    #[test]
    fn test_bracketed_range() {
        let node = ExprNode::Unary(UnaryNode::Array(vec![ExprNode::Binary {
            op: BinaryOp::Range,
            lhs: Box::new(ExprNode::Number(2.0)),
            rhs: Box::new(ExprNode::Number(5.0)),
        }]));
        let (start, end) = node.as_bracketed_range().unwrap();
        assert_eq!(start.as_index(), Some(2));
        assert_eq!(end.as_index(), Some(5));
        assert!(ExprNode::Number(1.5).as_index().is_none());
    }

    #[test]
    fn test_index_outside_exact_range() {
        assert!(ExprNode::Number(1e20).as_index().is_none());
        assert!(ExprNode::Number(-9_223_372_036_854_775_807.0).as_index().is_none());
        assert_eq!(
            ExprNode::Number(9_007_199_254_740_991.0).as_index(),
            Some(9_007_199_254_740_991)
        );
        let negated = ExprNode::Unary(UnaryNode::Negate(Box::new(ExprNode::Number(3.0))));
        assert_eq!(negated.as_index(), Some(-3));
    }

    #[test]
    fn test_display_path() {
        let node = ExprNode::Path(vec![
            Step {
                node: ExprNode::Variable("$pubs".into()),
                stages: vec![ExprNode::Number(0.0)],
            },
            Step::new(ExprNode::Name("title".into())),
        ]);
        assert_eq!(node.to_string(), "$$pubs[0].title");
    }
}
