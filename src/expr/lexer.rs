use crate::error::{Result, TranslateError};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    String(String),
    Number(f64),
    Name(String),
    /// Back-quoted name.
    QuotedName(String),
    Variable(String),
    True,
    False,
    Null,
    And,
    Or,
    In,
    Dot,
    DotDot,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Colon,
    Semicolon,
    Question,
    Caret,
    Assign,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Ampersand,
    /// Syntax outside the query subset (`|`, `#`, `@`, `~>`, `**`, regex).
    Unsupported(String),
    Eof,
}

/// A token with the character offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            position: 0,
        }
    }

    fn current_char(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek_char(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn error(&self, message: impl Into<String>) -> TranslateError {
        TranslateError::Parse {
            message: message.into(),
            position: self.position,
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<()> {
        loop {
            match self.current_char() {
                Some(ch) if ch.is_whitespace() => self.advance(),
                Some('/') if self.peek_char(1) == Some('*') => {
                    self.position += 2;
                    loop {
                        match (self.current_char(), self.peek_char(1)) {
                            (Some('*'), Some('/')) => {
                                self.position += 2;
                                break;
                            }
                            (Some(_), _) => self.advance(),
                            (None, _) => return Err(self.error("Unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_identifier(&mut self) -> String {
        let mut result = String::new();
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        result
    }

    fn read_string(&mut self, quote: char) -> Result<String> {
        let mut result = String::new();
        self.advance(); // opening quote

        while let Some(ch) = self.current_char() {
            match ch {
                c if c == quote => {
                    self.advance();
                    return Ok(result);
                }
                '\\' => {
                    self.advance();
                    match self.current_char() {
                        Some('n') => result.push('\n'),
                        Some('t') => result.push('\t'),
                        Some('r') => result.push('\r'),
                        Some('b') => result.push('\u{8}'),
                        Some('f') => result.push('\u{c}'),
                        Some('"') => result.push('"'),
                        Some('\'') => result.push('\''),
                        Some('\\') => result.push('\\'),
                        Some('/') => result.push('/'),
                        Some('u') => {
                            let hex: String = (1..=4).filter_map(|i| self.peek_char(i)).collect();
                            let code = u32::from_str_radix(&hex, 16)
                                .ok()
                                .filter(|_| hex.len() == 4)
                                .and_then(char::from_u32)
                                .ok_or_else(|| self.error("Invalid unicode escape"))?;
                            result.push(code);
                            self.position += 4;
                        }
                        Some(other) => {
                            return Err(self.error(format!("Invalid escape sequence: \\{}", other)))
                        }
                        None => return Err(self.error("Unterminated string")),
                    }
                    self.advance();
                }
                _ => {
                    result.push(ch);
                    self.advance();
                }
            }
        }

        Err(self.error("Unterminated string: missing closing quote"))
    }

    fn read_number(&mut self) -> Result<f64> {
        let start = self.position;
        let mut text = String::new();
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        // `0..9` must lex as 0, `..`, 9
        if self.current_char() == Some('.') && self.peek_char(1).is_some_and(|c| c.is_ascii_digit())
        {
            text.push('.');
            self.advance();
            while let Some(ch) = self.current_char().filter(|c| c.is_ascii_digit()) {
                text.push(ch);
                self.advance();
            }
        }
        if matches!(self.current_char(), Some('e') | Some('E')) {
            let sign = self.peek_char(1);
            let digit_at = if matches!(sign, Some('+') | Some('-')) { 2 } else { 1 };
            if self.peek_char(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                for _ in 0..digit_at {
                    if let Some(c) = self.current_char() {
                        text.push(c);
                    }
                    self.advance();
                }
                while let Some(ch) = self.current_char().filter(|c| c.is_ascii_digit()) {
                    text.push(ch);
                    self.advance();
                }
            }
        }
        text.parse::<f64>().map_err(|_| TranslateError::Parse {
            message: format!("Invalid number literal '{}'", text),
            position: start,
        })
    }

    fn next_token(&mut self) -> Result<Spanned> {
        self.skip_whitespace_and_comments()?;
        let position = self.position;
        let spanned = |token| Ok(Spanned { token, position });

        let ch = match self.current_char() {
            Some(ch) => ch,
            None => return spanned(Token::Eof),
        };

        if ch == '"' || ch == '\'' {
            return spanned(Token::String(self.read_string(ch)?));
        }
        if ch.is_ascii_digit() {
            return spanned(Token::Number(self.read_number()?));
        }
        if ch == '`' {
            self.advance();
            let mut name = String::new();
            loop {
                match self.current_char() {
                    Some('`') => {
                        self.advance();
                        break;
                    }
                    Some(c) => {
                        name.push(c);
                        self.advance();
                    }
                    None => return Err(self.error("Unterminated back-quoted name")),
                }
            }
            return spanned(Token::QuotedName(name));
        }
        if ch == '$' {
            self.advance();
            let mut name = String::new();
            if self.current_char() == Some('$') {
                self.advance();
                name.push('$');
            }
            name.push_str(&self.read_identifier());
            return spanned(Token::Variable(name));
        }
        if ch.is_alphabetic() || ch == '_' {
            let ident = self.read_identifier();
            let token = match ident.as_str() {
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                "and" => Token::And,
                "or" => Token::Or,
                "in" => Token::In,
                _ => Token::Name(ident),
            };
            return spanned(token);
        }

        let two: String = [Some(ch), self.peek_char(1)].iter().flatten().collect();
        let double = match two.as_str() {
            ".." => Some(Token::DotDot),
            ":=" => Some(Token::Assign),
            "!=" => Some(Token::NotEq),
            "<=" => Some(Token::LtEq),
            ">=" => Some(Token::GtEq),
            "~>" | "**" => Some(Token::Unsupported(two.clone())),
            _ => None,
        };
        if let Some(token) = double {
            self.position += 2;
            return spanned(token);
        }

        let token = match ch {
            '.' => Token::Dot,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            ':' => Token::Colon,
            ';' => Token::Semicolon,
            '?' => Token::Question,
            '^' => Token::Caret,
            '=' => Token::Eq,
            '<' => Token::Lt,
            '>' => Token::Gt,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '&' => Token::Ampersand,
            '|' | '#' | '@' | '~' | '!' => Token::Unsupported(ch.to_string()),
            other => return Err(self.error(format!("Unexpected character '{}'", other))),
        };
        self.advance();
        spanned(token)
    }

    /// Tokenize the whole input; the last token is always `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Spanned>> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                return Ok(tokens);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_table_variable() {
        assert_eq!(
            tokens("$$pubs"),
            vec![Token::Variable("$pubs".into()), Token::Eof]
        );
        assert_eq!(tokens("$x"), vec![Token::Variable("x".into()), Token::Eof]);
        assert_eq!(tokens("$"), vec![Token::Variable(String::new()), Token::Eof]);
    }

    #[test]
    fn test_range_is_not_a_decimal() {
        assert_eq!(
            tokens("[0..9]"),
            vec![
                Token::LBracket,
                Token::Number(0.0),
                Token::DotDot,
                Token::Number(9.0),
                Token::RBracket,
                Token::Eof
            ]
        );
        assert_eq!(tokens("1.5"), vec![Token::Number(1.5), Token::Eof]);
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(
            tokens(r#"'it\'s' "a\"b""#),
            vec![
                Token::String("it's".into()),
                Token::String("a\"b".into()),
                Token::Eof
            ]
        );
        assert!(Lexer::new("'open").tokenize().is_err());
    }

    #[test]
    fn test_keywords_and_operators() {
        assert_eq!(
            tokens("a != b and c <= 1 or x in y & z"),
            vec![
                Token::Name("a".into()),
                Token::NotEq,
                Token::Name("b".into()),
                Token::And,
                Token::Name("c".into()),
                Token::LtEq,
                Token::Number(1.0),
                Token::Or,
                Token::Name("x".into()),
                Token::In,
                Token::Name("y".into()),
                Token::Ampersand,
                Token::Name("z".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_unsupported_tokens() {
        assert_eq!(
            tokens("a ~> b"),
            vec![
                Token::Name("a".into()),
                Token::Unsupported("~>".into()),
                Token::Name("b".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            tokens("/* hi */ title"),
            vec![Token::Name("title".into()), Token::Eof]
        );
    }
}
