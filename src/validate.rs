//! Schema-free check that an expression stays inside the translatable subset.
//!
//! Unlike `compile`, which stops at the first error, validation walks the
//! whole tree and reports every problem it finds. Schema lookups (unknown
//! tables, relations and fields) need a schema and are left to `compile`.
use serde::Serialize;

use crate::error::TranslateError;
use crate::expr::{parse, BinaryOp, ExprNode, Step, UnaryNode};
use crate::translate::functions::check_supported;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    /// Error category, e.g. `UnsupportedConstructError`.
    pub kind: &'static str,
    pub message: String,
}

impl From<TranslateError> for ValidationError {
    fn from(err: TranslateError) -> Self {
        ValidationError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

pub fn validate(expression: &str) -> ValidationReport {
    let errors = match parse(expression) {
        Ok(ast) => {
            let mut validator = Validator::default();
            validator.visit(&ast);
            validator.errors
        }
        Err(err) => vec![err.into()],
    };
    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

#[derive(Default)]
struct Validator {
    errors: Vec<ValidationError>,
}

impl Validator {
    fn push(&mut self, err: TranslateError) {
        self.errors.push(err.into());
    }

    fn visit(&mut self, node: &ExprNode) {
        match node {
            ExprNode::String(_)
            | ExprNode::Number(_)
            | ExprNode::Value(_)
            | ExprNode::Name(_)
            | ExprNode::Variable(_) => {}
            ExprNode::Binary {
                op: BinaryOp::Range,
                ..
            } => self.push(TranslateError::malformed(
                "range is only valid inside [ ]",
                node,
            )),
            ExprNode::Binary { lhs, rhs, .. } => {
                self.visit(lhs);
                self.visit(rhs);
            }
            ExprNode::Unary(UnaryNode::Negate(inner)) => self.visit(inner),
            ExprNode::Unary(UnaryNode::Object(pairs)) => {
                for (key, value) in pairs {
                    if !matches!(key, ExprNode::String(_)) {
                        self.push(TranslateError::malformed(
                            "object keys must be string literals",
                            key,
                        ));
                    }
                    self.visit(value);
                }
            }
            ExprNode::Unary(UnaryNode::Array(items)) => {
                for item in items {
                    self.visit_element(item);
                }
            }
            ExprNode::Path(steps) => {
                for step in steps {
                    self.visit_step(step);
                }
            }
            ExprNode::Function { name, args } => {
                if let Err(err) = check_supported(name, node) {
                    self.push(err);
                }
                for arg in args {
                    self.visit(arg);
                }
            }
            ExprNode::Condition {
                condition,
                then,
                otherwise,
            } => {
                self.visit(condition);
                self.visit(then);
                if let Some(otherwise) = otherwise {
                    self.visit(otherwise);
                }
            }
            ExprNode::Block(exprs) => {
                for expr in exprs {
                    self.visit(expr);
                }
            }
            ExprNode::Bind { value, .. } => self.visit(value),
            ExprNode::Sort(_) => self.push(TranslateError::malformed(
                "sort must follow a table or relation step",
                node,
            )),
        }
    }

    /// Array constructor element; ranges are allowed here.
    fn visit_element(&mut self, item: &ExprNode) {
        match item {
            ExprNode::Binary {
                op: BinaryOp::Range,
                lhs,
                rhs,
            } => {
                self.visit(lhs);
                self.visit(rhs);
            }
            other => self.visit(other),
        }
    }

    fn visit_step(&mut self, step: &Step) {
        match &step.node {
            ExprNode::Sort(terms) => {
                for term in terms {
                    self.visit(&term.expr);
                }
            }
            other => self.visit(other),
        }
        for stage in &step.stages {
            self.visit_stage(stage);
        }
    }

    fn visit_stage(&mut self, stage: &ExprNode) {
        if let Some(n) = stage.as_index() {
            if n < 0 {
                self.push(TranslateError::unsupported("negative index", stage));
            }
            return;
        }
        if let ExprNode::Number(_) = stage {
            self.push(TranslateError::malformed("index must be a safe integer", stage));
            return;
        }
        if let Some((start, end)) = stage.as_bracketed_range() {
            match (start.as_index(), end.as_index()) {
                (Some(s), Some(e)) if s < 0 || e < 0 => {
                    self.push(TranslateError::unsupported("negative index", stage))
                }
                (Some(_), Some(_)) => {}
                _ => self.push(TranslateError::unsupported(
                    "range bounds must be integer literals",
                    stage,
                )),
            }
            return;
        }
        if let ExprNode::Unary(UnaryNode::Array(_)) = stage {
            self.push(TranslateError::unsupported("array predicate", stage));
            return;
        }
        self.visit(stage);
    }
}
