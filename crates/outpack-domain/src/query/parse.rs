use crate::error::OutpackError;

use super::{BooleanOperator, Literal, Lookup, Operand, QueryNode, TestOperator};

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    Colon,
    LParen,
    RParen,
    Not,
    And,
    Or,
    Cmp(TestOperator),
}

/// Parse query text into its expression tree.
pub fn parse_query(text: &str) -> Result<QueryNode, OutpackError> {
    let fail = |reason: String| OutpackError::InvalidQuery {
        query: text.to_string(),
        reason,
    };
    let tokens = tokenize(text).map_err(fail)?;
    if tokens.is_empty() {
        return Err(fail("query is empty".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let node = parser.parse_or().map_err(fail)?;
    if let Some(token) = parser.peek() {
        return Err(fail(format!("unexpected trailing {}", describe(token))));
    }
    Ok(node)
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        match ch {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(TestOperator::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(TestOperator::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let (op, width) = match (ch, next) {
                    ('<', Some('=')) => (TestOperator::Le, 2),
                    ('<', _) => (TestOperator::Lt, 1),
                    (_, Some('=')) => (TestOperator::Ge, 2),
                    _ => (TestOperator::Gt, 1),
                };
                tokens.push(Token::Cmp(op));
                i += width;
            }
            '"' | '\'' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|c| *c == ch)
                    .map(|offset| start + offset)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.is_some_and(|n| n.is_ascii_digit() || n == '.'))
                || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() {
                    let c = chars[i];
                    let exponent_sign =
                        matches!(c, '+' | '-') && matches!(chars[i - 1], 'e' | 'E');
                    if c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E') || exponent_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let raw: String = chars[start..i].iter().collect();
                let value = raw
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{raw}'"))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphanumeric() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

fn describe(token: &Token) -> String {
    match token {
        Token::Ident(name) => format!("'{name}'"),
        Token::Str(value) => format!("string \"{value}\""),
        Token::Number(value) => format!("number {value}"),
        Token::Colon => "':'".to_string(),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
        Token::Not => "'!'".to_string(),
        Token::And => "'&&'".to_string(),
        Token::Or => "'||'".to_string(),
        Token::Cmp(op) => format!("'{}'", op.as_str()),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(format!(
                "expected {} but found {}",
                describe(expected),
                describe(&token)
            )),
            None => Err(format!("expected {} but query ended", describe(expected))),
        }
    }

    fn parse_or(&mut self) -> Result<QueryNode, String> {
        let mut node = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            node = QueryNode::Boolean {
                op: BooleanOperator::Or,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            };
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<QueryNode, String> {
        let mut node = self.parse_unary()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_unary()?;
            node = QueryNode::Boolean {
                op: BooleanOperator::And,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            };
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<QueryNode, String> {
        if self.eat(&Token::Not) {
            return Ok(QueryNode::Negation(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<QueryNode, String> {
        let keyword = match self.peek() {
            Some(Token::Ident(name)) if name == "latest" || name == "single" => {
                Some(name.clone())
            }
            _ => None,
        };
        let at_paren = self.peek() == Some(&Token::LParen);
        let at_end = self.peek().is_none();
        match (at_end, at_paren, keyword.as_deref()) {
            (true, _, _) => Err("expected an expression but query ended".to_string()),
            (_, true, _) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(QueryNode::Brackets(Box::new(inner)))
            }
            (_, _, Some("latest")) => {
                self.pos += 1;
                if !self.eat(&Token::LParen) {
                    return Ok(QueryNode::Latest(None));
                }
                if self.eat(&Token::RParen) {
                    return Ok(QueryNode::Latest(None));
                }
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(QueryNode::Latest(Some(Box::new(inner))))
            }
            (_, _, Some(_)) => {
                self.pos += 1;
                self.expect(&Token::LParen)?;
                if self.peek() == Some(&Token::RParen) {
                    return Err("single() requires an argument".to_string());
                }
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(QueryNode::Single(Box::new(inner)))
            }
            (false, false, None) => self.parse_test(),
        }
    }

    fn parse_test(&mut self) -> Result<QueryNode, String> {
        let lhs = self.parse_operand()?;
        let op = match self.next() {
            Some(Token::Cmp(op)) => op,
            Some(token) => {
                return Err(format!(
                    "expected a comparison operator but found {}",
                    describe(&token)
                ))
            }
            None => return Err("expected a comparison operator but query ended".to_string()),
        };
        let rhs = self.parse_operand()?;
        Ok(QueryNode::Test { op, lhs, rhs })
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Str(value)) => Ok(Operand::Literal(Literal::String(value))),
            Some(Token::Number(value)) => Ok(Operand::Literal(Literal::Number(value))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" | "TRUE" => Ok(Operand::Literal(Literal::Bool(true))),
                "false" | "FALSE" => Ok(Operand::Literal(Literal::Bool(false))),
                "id" => Ok(Operand::Lookup(Lookup::Id)),
                "name" => Ok(Operand::Lookup(Lookup::Name)),
                "parameter" | "this" | "environment" => {
                    self.expect(&Token::Colon)?;
                    let key = match self.next() {
                        Some(Token::Ident(key)) => key,
                        Some(token) => {
                            return Err(format!(
                                "expected a name after '{name}:' but found {}",
                                describe(&token)
                            ))
                        }
                        None => return Err(format!("expected a name after '{name}:'")),
                    };
                    Ok(Operand::Lookup(match name.as_str() {
                        "parameter" => Lookup::Parameter(key),
                        "this" => Lookup::This(key),
                        _ => Lookup::Environment(key),
                    }))
                }
                other => Err(format!(
                    "unknown lookup '{other}'; expected id, name, parameter:<name>, this:<name> or environment:<name>"
                )),
            },
            Some(token) => Err(format!("expected a value but found {}", describe(&token))),
            None => Err("expected a value but query ended".to_string()),
        }
    }
}
