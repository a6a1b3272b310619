//! Boolean expression evaluators for selection and activation
//!
//! Two small hand-rolled recursive-descent grammars:
//!
//! - word expressions over keywords / options / platforms, e.g.
//!   `"3d and not mhd"`, `"linux or darwin"`;
//! - parameter expressions with comparisons, e.g.
//!   `"cpus>2 and a!='baz'"`, where `!name` tests that a parameter is
//!   unbound.
//!
//! Comparison is numeric when both sides parse as numbers and textual
//! otherwise.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::case::Scalar;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    LParen,
    RParen,
    Bang,
    Op(CmpOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn lex(input: &str) -> EngineResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                }
                tokens.push(Token::Op(CmpOp::Eq));
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Ne));
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Le));
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Ge));
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut word = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => word.push(ch),
                        None => {
                            return Err(EngineError::InvalidExpression {
                                expr: input.to_string(),
                                reason: "unterminated quote".to_string(),
                            })
                        }
                    }
                }
                tokens.push(Token::Word(word));
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || "()!=<>'\"".contains(ch) {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                if word.is_empty() {
                    return Err(EngineError::InvalidExpression {
                        expr: input.to_string(),
                        reason: format!("unexpected character {:?}", c),
                    });
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Ast {
    Or(Box<Ast>, Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Not(Box<Ast>),
    Word(String),
    Unbound(String),
    Compare(String, CmpOp, String),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    source: String,
}

impl Parser {
    fn new(input: &str) -> EngineResult<Self> {
        Ok(Self {
            tokens: lex(input)?,
            pos: 0,
            source: input.to_string(),
        })
    }

    fn error(&self, reason: impl Into<String>) -> EngineError {
        EngineError::InvalidExpression {
            expr: self.source.clone(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn at_word(&self, text: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == text)
    }

    fn parse(&mut self) -> EngineResult<Ast> {
        let ast = self.or_expr()?;
        if self.pos != self.tokens.len() {
            return Err(self.error("trailing tokens"));
        }
        Ok(ast)
    }

    fn or_expr(&mut self) -> EngineResult<Ast> {
        let mut left = self.and_expr()?;
        while self.at_word("or") {
            self.next();
            let right = self.and_expr()?;
            left = Ast::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> EngineResult<Ast> {
        let mut left = self.not_expr()?;
        while self.at_word("and") {
            self.next();
            let right = self.not_expr()?;
            left = Ast::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> EngineResult<Ast> {
        if self.at_word("not") {
            self.next();
            let inner = self.not_expr()?;
            return Ok(Ast::Not(Box::new(inner)));
        }
        self.atom()
    }

    fn atom(&mut self) -> EngineResult<Ast> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(Token::Bang) => match self.next() {
                Some(Token::Word(name)) => Ok(Ast::Unbound(name)),
                _ => Err(self.error("expected a parameter name after '!'")),
            },
            Some(Token::Word(name)) => {
                if let Some(Token::Op(op)) = self.peek().cloned() {
                    self.next();
                    match self.next() {
                        Some(Token::Word(value)) => Ok(Ast::Compare(name, op, value)),
                        _ => Err(self.error("expected a value after comparison operator")),
                    }
                } else {
                    Ok(Ast::Word(name))
                }
            }
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }
}

/// Boolean expression over a set of words (keywords, options, or the
/// platform name)
#[derive(Debug, Clone)]
pub struct WordExpr {
    ast: Ast,
}

impl WordExpr {
    pub fn parse(input: &str) -> EngineResult<Self> {
        let mut parser = Parser::new(input)?;
        Ok(Self {
            ast: parser.parse()?,
        })
    }

    pub fn evaluate(&self, words: &BTreeSet<String>) -> bool {
        eval_words(&self.ast, words)
    }
}

fn eval_words(ast: &Ast, words: &BTreeSet<String>) -> bool {
    match ast {
        Ast::Or(a, b) => eval_words(a, words) || eval_words(b, words),
        Ast::And(a, b) => eval_words(a, words) && eval_words(b, words),
        Ast::Not(a) => !eval_words(a, words),
        Ast::Word(w) => words.contains(w),
        // word expressions have no parameter bindings; treat either
        // form as membership tests so mixed input fails closed
        Ast::Unbound(w) => !words.contains(w),
        Ast::Compare(..) => false,
    }
}

/// Boolean expression over parameter bindings
#[derive(Debug, Clone)]
pub struct ParamExpr {
    ast: Ast,
}

impl ParamExpr {
    pub fn parse(input: &str) -> EngineResult<Self> {
        let mut parser = Parser::new(input)?;
        Ok(Self {
            ast: parser.parse()?,
        })
    }

    pub fn evaluate(&self, parameters: &BTreeMap<String, Scalar>) -> bool {
        eval_params(&self.ast, parameters)
    }
}

fn eval_params(ast: &Ast, parameters: &BTreeMap<String, Scalar>) -> bool {
    match ast {
        Ast::Or(a, b) => eval_params(a, parameters) || eval_params(b, parameters),
        Ast::And(a, b) => eval_params(a, parameters) && eval_params(b, parameters),
        Ast::Not(a) => !eval_params(a, parameters),
        Ast::Word(name) => parameters.contains_key(name),
        Ast::Unbound(name) => !parameters.contains_key(name),
        Ast::Compare(name, op, literal) => match parameters.get(name) {
            Some(value) => compare(value, *op, literal),
            None => false,
        },
    }
}

fn compare(value: &Scalar, op: CmpOp, literal: &str) -> bool {
    // textual comparison for string params, numeric otherwise
    if !matches!(value, Scalar::Str(_)) {
        if let (Some(lhs), Ok(rhs)) = (value.as_f64(), literal.parse::<f64>()) {
            return match op {
                CmpOp::Eq => lhs == rhs,
                CmpOp::Ne => lhs != rhs,
                CmpOp::Lt => lhs < rhs,
                CmpOp::Le => lhs <= rhs,
                CmpOp::Gt => lhs > rhs,
                CmpOp::Ge => lhs >= rhs,
            };
        }
    }
    let lhs = value.to_string();
    match op {
        CmpOp::Eq => lhs == literal,
        CmpOp::Ne => lhs != literal,
        CmpOp::Lt => lhs.as_str() < literal,
        CmpOp::Le => lhs.as_str() <= literal,
        CmpOp::Gt => lhs.as_str() > literal,
        CmpOp::Ge => lhs.as_str() >= literal,
    }
}

/// Shell-style glob match (`*`, `?`, `[seq]`), anchored at both ends
pub fn fnmatch(pattern: &str, text: &str) -> bool {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            '[' => {
                translated.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    translated.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if "\\^$".contains(inner) {
                        translated.push('\\');
                    }
                    translated.push(inner);
                }
                translated.push(']');
            }
            _ => {
                if "\\.+()|[]{}^$".contains(c) {
                    translated.push('\\');
                }
                translated.push(c);
            }
        }
    }
    translated.push('$');
    regex::Regex::new(&translated)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnmatch_globs() {
        assert!(fnmatch("a.n=*", "a.n=3"));
        assert!(fnmatch("flow?", "flow1"));
        assert!(!fnmatch("flow", "flow1"));
        assert!(fnmatch("b[12]", "b1"));
        assert!(!fnmatch("b[12]", "b3"));
    }

    fn words(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn params(list: &[(&str, Scalar)]) -> BTreeMap<String, Scalar> {
        list.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_word_expression_and_or_not() {
        let expr = WordExpr::parse("spam and baz").unwrap();
        assert!(expr.evaluate(&words(&["spam", "baz"])));
        assert!(!expr.evaluate(&words(&["spam"])));

        let expr = WordExpr::parse("spam or baz").unwrap();
        assert!(expr.evaluate(&words(&["baz"])));
        assert!(!expr.evaluate(&words(&[])));

        let expr = WordExpr::parse("not (spam or baz)").unwrap();
        assert!(expr.evaluate(&words(&["wubble"])));
        assert!(!expr.evaluate(&words(&["spam"])));
    }

    #[test]
    fn test_word_expression_rejects_bad_syntax() {
        assert!(WordExpr::parse("spam and").is_err());
        assert!(WordExpr::parse("(spam").is_err());
        assert!(WordExpr::parse("platform='linux").is_err());
    }

    #[test]
    fn test_parameter_comparisons_numeric() {
        let expr = ParamExpr::parse("np<4").unwrap();
        assert!(expr.evaluate(&params(&[("np", Scalar::Int(1))])));
        assert!(!expr.evaluate(&params(&[("np", Scalar::Int(5))])));
        assert!(!expr.evaluate(&params(&[])));

        let expr = ParamExpr::parse("np> 2 and np<6").unwrap();
        assert!(expr.evaluate(&params(&[("np", Scalar::Int(3))])));
        assert!(!expr.evaluate(&params(&[("np", Scalar::Int(7))])));
    }

    #[test]
    fn test_parameter_comparisons_textual() {
        let expr = ParamExpr::parse("np>2 and baz=spam").unwrap();
        assert!(!expr.evaluate(&params(&[("np", Scalar::Int(3))])));
        assert!(!expr.evaluate(&params(&[
            ("np", Scalar::Int(3)),
            ("baz", Scalar::Str("wubble".into()))
        ])));
        assert!(expr.evaluate(&params(&[
            ("np", Scalar::Int(3)),
            ("baz", Scalar::Str("spam".into()))
        ])));
    }

    #[test]
    fn test_double_equals_is_equality() {
        let expr = ParamExpr::parse("baz==spam").unwrap();
        assert!(expr.evaluate(&params(&[("baz", Scalar::Str("spam".into()))])));
    }

    #[test]
    fn test_unbound_parameter() {
        let expr = ParamExpr::parse("!np").unwrap();
        assert!(!expr.evaluate(&params(&[("np", Scalar::Int(1))])));
        assert!(expr.evaluate(&params(&[("spam", Scalar::Str("baz".into()))])));
    }

    #[test]
    fn test_quoted_values() {
        let expr = ParamExpr::parse("a!='baz qux'").unwrap();
        assert!(expr.evaluate(&params(&[("a", Scalar::Str("other".into()))])));
        assert!(!expr.evaluate(&params(&[("a", Scalar::Str("baz qux".into()))])));
    }
}
