/// Expression text → AST parser.
///
/// Precedence-climbing parser over the query subset of the language. Binding
/// powers follow the reference grammar so that `a.b[0]` attaches the predicate
/// to `b` and `x = y and z` groups the comparison first.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use super::ast::*;
use super::lexer::{Lexer, Spanned, Token};
use crate::error::{Result, TranslateError};

/// Parse expression text, memoized by source text.
///
/// The cache is never invalidated: the text is the whole key and parsing is
/// pure. Failed parses are not cached.
pub fn parse(input: &str) -> Result<Arc<ExprNode>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<ExprNode>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));

    if let Some(hit) = cache
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(input)
    {
        return Ok(Arc::clone(hit));
    }

    let node = Arc::new(parse_uncached(input)?);
    cache
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(input.to_string(), Arc::clone(&node));
    Ok(node)
}

/// Parse without touching the cache.
pub fn parse_uncached(input: &str) -> Result<ExprNode> {
    let tokens = Lexer::new(input).tokenize()?;
    let mut parser = Parser {
        tokens,
        index: 0,
        depth: 0,
    };
    let expr = parser.parse_expression(0)?;
    if parser.current() != &Token::Eof {
        return Err(parser.error(format!("Unexpected token {:?}", parser.current())));
    }
    Ok(expr)
}

/// Deepest expression nesting accepted. Translation and validation recurse
/// over the tree, so the bound keeps them off the end of the stack too.
const MAX_DEPTH: usize = 100;

struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
    depth: usize,
}

/// Left binding power of a token in infix position.
fn binding_power(token: &Token) -> u8 {
    match token {
        Token::Assign => 10,
        Token::Question | Token::DotDot => 20,
        Token::Or => 25,
        Token::And => 30,
        Token::Eq
        | Token::NotEq
        | Token::Lt
        | Token::LtEq
        | Token::Gt
        | Token::GtEq
        | Token::In
        | Token::Caret => 40,
        Token::Plus | Token::Minus | Token::Ampersand => 50,
        Token::Star | Token::Slash | Token::Percent => 60,
        Token::LBrace => 70,
        Token::Dot => 75,
        Token::LBracket | Token::LParen => 80,
        Token::Unsupported(_) => 40,
        _ => 0,
    }
}

fn binary_op(token: &Token) -> Option<BinaryOp> {
    Some(match token {
        Token::Eq => BinaryOp::Eq,
        Token::NotEq => BinaryOp::NotEq,
        Token::Lt => BinaryOp::Lt,
        Token::LtEq => BinaryOp::LtEq,
        Token::Gt => BinaryOp::Gt,
        Token::GtEq => BinaryOp::GtEq,
        Token::Plus => BinaryOp::Plus,
        Token::Minus => BinaryOp::Minus,
        Token::Star => BinaryOp::Multiply,
        Token::Slash => BinaryOp::Divide,
        Token::Percent => BinaryOp::Modulo,
        Token::And => BinaryOp::And,
        Token::Or => BinaryOp::Or,
        Token::Ampersand => BinaryOp::Concat,
        Token::In => BinaryOp::In,
        Token::DotDot => BinaryOp::Range,
        _ => return None,
    })
}

/// Append `next` to a path, flattening nested paths.
fn extend_path(lhs: ExprNode, next: ExprNode) -> ExprNode {
    let mut steps = match lhs {
        ExprNode::Path(steps) => steps,
        other => vec![Step::new(other)],
    };
    match next {
        ExprNode::Path(more) => steps.extend(more),
        other => steps.push(Step::new(other)),
    }
    ExprNode::Path(steps)
}

impl Parser {
    fn current(&self) -> &Token {
        &self.tokens[self.index.min(self.tokens.len() - 1)].token
    }

    fn position(&self) -> usize {
        self.tokens[self.index.min(self.tokens.len() - 1)].position
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> TranslateError {
        TranslateError::Parse {
            message: message.into(),
            position: self.position(),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if self.current() != &expected {
            return Err(self.error(format!(
                "Expected {:?}, got {:?}",
                expected,
                self.current()
            )));
        }
        self.advance();
        Ok(())
    }

    fn parse_expression(&mut self, rbp: u8) -> Result<ExprNode> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error(format!(
                "Expression nested deeper than {} levels",
                MAX_DEPTH
            )));
        }
        self.depth += 1;
        let result = self.parse_operators(rbp);
        self.depth -= 1;
        result
    }

    fn parse_operators(&mut self, rbp: u8) -> Result<ExprNode> {
        let mut left = self.parse_prefix()?;
        while rbp < binding_power(self.current()) {
            left = self.parse_infix(left)?;
        }
        Ok(left)
    }

    /// Comma-separated expressions up to `close`.
    fn parse_list(&mut self, close: Token) -> Result<Vec<ExprNode>> {
        let mut items = Vec::new();
        if self.current() == &close {
            self.advance();
            return Ok(items);
        }
        loop {
            items.push(self.parse_expression(0)?);
            match self.current() {
                Token::Comma => {
                    self.advance();
                }
                t if t == &close => {
                    self.advance();
                    return Ok(items);
                }
                other => {
                    return Err(self.error(format!("Expected ',' or {:?}, got {:?}", close, other)))
                }
            }
        }
    }

    fn parse_prefix(&mut self) -> Result<ExprNode> {
        let position = self.position();
        match self.advance() {
            Token::String(s) => Ok(ExprNode::String(s)),
            Token::Number(n) => Ok(ExprNode::Number(n)),
            Token::True => Ok(ExprNode::Value(Value::Bool(true))),
            Token::False => Ok(ExprNode::Value(Value::Bool(false))),
            Token::Null => Ok(ExprNode::Value(Value::Null)),
            Token::Variable(name) => Ok(ExprNode::Variable(name)),
            Token::QuotedName(name) => Ok(ExprNode::Name(name)),
            Token::Name(name) => {
                if (name == "function" || name == "λ") && self.current() == &Token::LParen {
                    return Err(TranslateError::Parse {
                        message: "Lambda functions are not supported in queries".into(),
                        position,
                    });
                }
                Ok(ExprNode::Name(name))
            }
            // Keywords used as field names, e.g. `in` or `and` columns, must be back-quoted.
            Token::Minus => {
                let operand = self.parse_expression(70)?;
                Ok(match operand {
                    ExprNode::Number(n) => ExprNode::Number(-n),
                    other => ExprNode::Unary(UnaryNode::Negate(Box::new(other))),
                })
            }
            Token::LParen => {
                let mut exprs = Vec::new();
                let mut separated = false;
                while self.current() != &Token::RParen {
                    exprs.push(self.parse_expression(0)?);
                    if self.current() == &Token::Semicolon {
                        self.advance();
                        separated = true;
                    } else {
                        break;
                    }
                }
                self.expect(Token::RParen)?;
                if exprs.len() == 1 && !separated {
                    Ok(exprs.remove(0))
                } else {
                    Ok(ExprNode::Block(exprs))
                }
            }
            Token::LBracket => {
                let items = self.parse_list(Token::RBracket)?;
                Ok(ExprNode::Unary(UnaryNode::Array(items)))
            }
            Token::LBrace => {
                let mut pairs = Vec::new();
                if self.current() == &Token::RBrace {
                    self.advance();
                    return Ok(ExprNode::Unary(UnaryNode::Object(pairs)));
                }
                loop {
                    let key = self.parse_expression(0)?;
                    self.expect(Token::Colon)?;
                    let value = self.parse_expression(0)?;
                    pairs.push((key, value));
                    match self.advance() {
                        Token::Comma => continue,
                        Token::RBrace => break,
                        other => {
                            return Err(self.error(format!("Expected ',' or '}}', got {:?}", other)))
                        }
                    }
                }
                Ok(ExprNode::Unary(UnaryNode::Object(pairs)))
            }
            Token::Percent => Err(TranslateError::Parse {
                message: "Parent operator '%' is not supported".into(),
                position,
            }),
            Token::Slash => Err(TranslateError::Parse {
                message: "Regular expression literals are not supported".into(),
                position,
            }),
            Token::Unsupported(op) => Err(TranslateError::Parse {
                message: format!("Operator '{}' is not supported", op),
                position,
            }),
            Token::Eof => Err(TranslateError::Parse {
                message: "Unexpected end of expression".into(),
                position,
            }),
            other => Err(TranslateError::Parse {
                message: format!("Unexpected token {:?}", other),
                position,
            }),
        }
    }

    fn parse_infix(&mut self, left: ExprNode) -> Result<ExprNode> {
        let position = self.position();
        let token = self.advance();
        if let Some(op) = binary_op(&token) {
            let rhs = self.parse_expression(binding_power(&token))?;
            return Ok(ExprNode::Binary {
                op,
                lhs: Box::new(left),
                rhs: Box::new(rhs),
            });
        }
        match token {
            Token::Dot => {
                let rhs = self.parse_expression(binding_power(&Token::Dot))?;
                Ok(extend_path(left, rhs))
            }
            Token::LBracket => {
                if self.current() == &Token::RBracket {
                    return Err(self.error("Empty predicate '[]' is not supported"));
                }
                let stage = self.parse_expression(0)?;
                self.expect(Token::RBracket)?;
                let mut steps = match left {
                    ExprNode::Path(steps) => steps,
                    other => vec![Step::new(other)],
                };
                if let Some(last) = steps.last_mut() {
                    last.stages.push(stage);
                }
                Ok(ExprNode::Path(steps))
            }
            Token::LParen => match left {
                ExprNode::Variable(name) if !name.is_empty() && !name.starts_with('$') => {
                    let args = self.parse_list(Token::RParen)?;
                    Ok(ExprNode::Function { name, args })
                }
                other => Err(TranslateError::Parse {
                    message: format!("Cannot call '{}' as a function", other),
                    position,
                }),
            },
            Token::Caret => {
                self.expect(Token::LParen)?;
                let mut terms = Vec::new();
                loop {
                    let descending = match self.current() {
                        Token::Gt => {
                            self.advance();
                            true
                        }
                        Token::Lt => {
                            self.advance();
                            false
                        }
                        _ => false,
                    };
                    let expr = self.parse_expression(0)?;
                    terms.push(SortTerm { descending, expr });
                    match self.advance() {
                        Token::Comma => continue,
                        Token::RParen => break,
                        other => {
                            return Err(self.error(format!("Expected ',' or ')', got {:?}", other)))
                        }
                    }
                }
                let mut steps = match left {
                    ExprNode::Path(steps) => steps,
                    other => vec![Step::new(other)],
                };
                steps.push(Step::new(ExprNode::Sort(terms)));
                Ok(ExprNode::Path(steps))
            }
            Token::Question => {
                let then = self.parse_expression(0)?;
                let otherwise = if self.current() == &Token::Colon {
                    self.advance();
                    Some(Box::new(self.parse_expression(0)?))
                } else {
                    None
                };
                Ok(ExprNode::Condition {
                    condition: Box::new(left),
                    then: Box::new(then),
                    otherwise,
                })
            }
            Token::Assign => match left {
                ExprNode::Variable(name) if !name.starts_with('$') => {
                    let value = self.parse_expression(binding_power(&Token::Assign) - 1)?;
                    Ok(ExprNode::Bind {
                        name,
                        value: Box::new(value),
                    })
                }
                other => Err(TranslateError::Parse {
                    message: format!("Cannot assign to '{}'", other),
                    position,
                }),
            },
            Token::LBrace => Err(TranslateError::Parse {
                message: "Grouping object constructors are not supported".into(),
                position,
            }),
            Token::Unsupported(op) => Err(TranslateError::Parse {
                message: format!("Operator '{}' is not supported", op),
                position,
            }),
            other => Err(TranslateError::Parse {
                message: format!("Unexpected token {:?}", other),
                position,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(input: &str) -> ExprNode {
        parse_uncached(input).expect("Failed to parse")
    }

    #[test]
    fn test_parse_table_filter() {
        let node = p("$$pubs[title = 'Some title']");
        match node {
            ExprNode::Path(steps) => {
                assert_eq!(steps.len(), 1);
                assert_eq!(steps[0].node, ExprNode::Variable("$pubs".into()));
                assert_eq!(steps[0].stages.len(), 1);
                assert!(matches!(
                    steps[0].stages[0],
                    ExprNode::Binary {
                        op: BinaryOp::Eq,
                        ..
                    }
                ));
            }
            other => panic!("Expected path, got {:?}", other),
        }
    }

    #[test]
    fn test_predicate_binds_to_last_step() {
        let node = p("a.b[0].c");
        match node {
            ExprNode::Path(steps) => {
                assert_eq!(steps.len(), 3);
                assert!(steps[0].stages.is_empty());
                assert_eq!(steps[1].stages, vec![ExprNode::Number(0.0)]);
                assert!(steps[2].stages.is_empty());
            }
            other => panic!("Expected path, got {:?}", other),
        }
    }

    #[test]
    fn test_sort_then_range() {
        let node = p("$$pubs^(>createdAt)[[0..4]]");
        match node {
            ExprNode::Path(steps) => {
                assert_eq!(steps.len(), 2);
                match &steps[1].node {
                    ExprNode::Sort(terms) => {
                        assert!(terms[0].descending);
                        assert_eq!(terms[0].expr, ExprNode::Name("createdAt".into()));
                    }
                    other => panic!("Expected sort, got {:?}", other),
                }
                assert!(steps[1].stages[0].as_bracketed_range().is_some());
            }
            other => panic!("Expected path, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        let node = p("a = 1 and b > 2 or c");
        match node {
            ExprNode::Binary {
                op: BinaryOp::Or,
                lhs,
                ..
            } => assert!(matches!(
                *lhs,
                ExprNode::Binary {
                    op: BinaryOp::And,
                    ..
                }
            )),
            other => panic!("Expected or, got {:?}", other),
        }
        match p("1 + 2 * 3") {
            ExprNode::Binary {
                op: BinaryOp::Plus,
                rhs,
                ..
            } => assert!(matches!(
                *rhs,
                ExprNode::Binary {
                    op: BinaryOp::Multiply,
                    ..
                }
            )),
            other => panic!("Expected plus, got {:?}", other),
        }
    }

    #[test]
    fn test_projection_step() {
        let node = p(r#"$$pubs.{"a": stage.name, "b": title}"#);
        match node {
            ExprNode::Path(steps) => {
                assert_eq!(steps.len(), 2);
                match &steps[1].node {
                    ExprNode::Unary(UnaryNode::Object(pairs)) => assert_eq!(pairs.len(), 2),
                    other => panic!("Expected object, got {:?}", other),
                }
            }
            other => panic!("Expected path, got {:?}", other),
        }
    }

    #[test]
    fn test_function_condition_block_bind() {
        assert!(matches!(p("$count(a)"), ExprNode::Function { ref name, ref args } if name == "count" && args.len() == 1));
        assert!(matches!(p("a ? 1 : 2"), ExprNode::Condition { otherwise: Some(_), .. }));
        match p("($x := 5; $x + 1)") {
            ExprNode::Block(exprs) => {
                assert_eq!(exprs.len(), 2);
                assert!(matches!(exprs[0], ExprNode::Bind { ref name, .. } if name == "x"));
            }
            other => panic!("Expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_number() {
        assert_eq!(p("-3"), ExprNode::Number(-3.0));
        assert!(matches!(p("-a"), ExprNode::Unary(UnaryNode::Negate(_))));
    }

    #[test]
    fn test_unsupported_syntax_rejected() {
        for input in [
            "function($x) { $x }",
            "a ~> $uppercase()",
            "a[]",
            "%.title",
            "a{b: c}",
            "/ab+c/",
            "a |b| {}|",
        ] {
            assert!(
                matches!(parse_uncached(input), Err(TranslateError::Parse { .. })),
                "expected parse error for {}",
                input
            );
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(parse_uncached("a b").is_err());
        assert!(parse_uncached("(a").is_err());
    }

    #[test]
    fn test_nesting_depth_is_bounded() {
        let nested = |depth: usize| format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(p(&nested(40)), ExprNode::Number(1.0));
        match parse_uncached(&nested(100_000)) {
            Err(TranslateError::Parse { message, .. }) => {
                assert!(message.contains("nested deeper"), "{}", message)
            }
            other => panic!("Expected parse error, got {:?}", other),
        }
        assert!(parse_uncached(&format!("{}1", "- ".repeat(10_000))).is_err());
    }

    #[test]
    fn test_parse_is_memoized() {
        let first = parse("$$pubs[title = 'memo']").unwrap();
        let second = parse("$$pubs[title = 'memo']").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
