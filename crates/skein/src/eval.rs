//! Expression evaluator.
//!
//! Evaluates one expression fragment against a [`Scope`] — the scope's
//! bindings are the only visible identifiers, there is no ambient global
//! lookup. The grammar covers literals, lists, member access, indexing,
//! calls, arithmetic, comparison, logic and the ternary operator.
//!
//! Observables unwrap to their current value wherever an operator needs a
//! concrete operand; a *bare* expression that resolves to an observable
//! yields the observable itself, which is how directives learn what to
//! depend on.
//!
//! [`find_observables`] re-parses the fragment and resolves its free root
//! identifiers without executing anything, so dependency wiring never runs
//! side-effecting calls a second time.
//!
//! Errors are reported, not caught, here — the directive layer owns the
//! catch-and-render-empty policy.

use std::rc::Rc;

use crate::error::EvalError;
use crate::observable::Observable;
use crate::scope::Scope;
use crate::value::Value;

/// Evaluates `text` against `scope`.
pub fn evaluate(text: &str, scope: &Rc<Scope>) -> Result<Value, EvalError> {
    let expr = parse(text)?;
    eval_expr(&expr, scope)
}

/// Statically resolves the observables `text` would touch.
///
/// Free root identifiers (the base of every member/index/call chain) are
/// looked up in `scope`; bindings that are observables are returned,
/// deduplicated by identity, in first-appearance order. Nothing is
/// executed.
pub fn find_observables(text: &str, scope: &Rc<Scope>) -> Vec<Rc<Observable>> {
    let Ok(expr) = parse(text) else {
        return Vec::new();
    };
    let mut names = Vec::new();
    collect_roots(&expr, &mut names);
    let mut found: Vec<Rc<Observable>> = Vec::new();
    for name in names {
        if let Some(Value::Observable(o)) = scope.get(&name) {
            if !found.iter().any(|f| Rc::ptr_eq(f, &o)) {
                found.push(o);
            }
        }
    }
    found
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

struct Lexer<'a> {
    text: &'a str,
    pos: usize,
}

const PUNCTS2: &[&str] = &["==", "!=", "<=", ">=", "&&", "||"];
const PUNCTS1: &[&str] = &[
    "+", "-", "*", "/", "%", "!", "<", ">", "(", ")", "[", "]", "{", "}", ",", ".", "?", ":",
];

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn error(&self, message: impl Into<String>) -> EvalError {
        EvalError::Parse {
            pos: self.pos,
            message: message.into(),
            snippet: self.text.to_string(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<(usize, Token)>, EvalError> {
        let mut tokens = Vec::new();
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() {
            let start = self.pos;
            let c = self.text[self.pos..].chars().next().unwrap_or('\0');
            if c.is_whitespace() {
                self.pos += c.len_utf8();
                continue;
            }
            if c.is_ascii_digit() {
                tokens.push((start, self.number()?));
                continue;
            }
            if c == '\'' || c == '"' {
                tokens.push((start, self.string(c)?));
                continue;
            }
            if c.is_alphabetic() || c == '_' {
                tokens.push((start, self.ident()));
                continue;
            }
            if let Some(p) = PUNCTS2
                .iter()
                .copied()
                .find(|p| self.text[self.pos..].starts_with(p))
            {
                self.pos += p.len();
                tokens.push((start, Token::Punct(p)));
                continue;
            }
            if let Some(p) = PUNCTS1
                .iter()
                .copied()
                .find(|p| self.text[self.pos..].starts_with(p))
            {
                self.pos += p.len();
                tokens.push((start, Token::Punct(p)));
                continue;
            }
            return Err(self.error(format!("unexpected character `{c}`")));
        }
        Ok(tokens)
    }

    fn number(&mut self) -> Result<Token, EvalError> {
        let start = self.pos;
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos < bytes.len()
            && bytes[self.pos] == b'.'
            && bytes.get(self.pos + 1).is_some_and(u8::is_ascii_digit)
        {
            self.pos += 1;
            while self.pos < bytes.len() && bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        self.text[start..self.pos]
            .parse::<f64>()
            .map(Token::Num)
            .map_err(|_| self.error("bad number literal"))
    }

    fn string(&mut self, quote: char) -> Result<Token, EvalError> {
        self.pos += 1;
        let mut out = String::new();
        let mut chars = self.text[self.pos..].char_indices();
        while let Some((off, c)) = chars.next() {
            if c == quote {
                self.pos += off + 1;
                return Ok(Token::Str(out));
            }
            if c == '\\' {
                match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, e)) => out.push(e),
                    None => break,
                }
                continue;
            }
            out.push(c);
        }
        Err(self.error("unterminated string literal"))
    }

    fn ident(&mut self) -> Token {
        let start = self.pos;
        for (off, c) in self.text[self.pos..].char_indices() {
            if c.is_alphanumeric() || c == '_' {
                continue;
            }
            self.pos = start + off;
            return Token::Ident(self.text[start..self.pos].to_string());
        }
        self.pos = self.text.len();
        Token::Ident(self.text[start..].to_string())
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Expr>),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

fn parse(text: &str) -> Result<Expr, EvalError> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = Parser {
        text,
        tokens,
        pos: 0,
    };
    let expr = parser.ternary()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("trailing input after expression"));
    }
    Ok(expr)
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> EvalError {
        EvalError::Parse {
            pos: self
                .tokens
                .get(self.pos)
                .map_or(self.text.len(), |(p, _)| *p),
            message: message.into(),
            snippet: self.text.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn eat_punct(&mut self, p: &'static str) -> bool {
        if self.peek() == Some(&Token::Punct(p)) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect_punct(&mut self, p: &'static str) -> Result<(), EvalError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{p}`")))
        }
    }

    fn ternary(&mut self) -> Result<Expr, EvalError> {
        let cond = self.binary(0)?;
        if self.eat_punct("?") {
            let then = self.ternary()?;
            self.expect_punct(":")?;
            let alt = self.ternary()?;
            return Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(alt)));
        }
        Ok(cond)
    }

    /// Precedence-climbing over the binary operator table.
    fn binary(&mut self, min_level: usize) -> Result<Expr, EvalError> {
        const LEVELS: &[&[&str]] = &[
            &["||"],
            &["&&"],
            &["==", "!="],
            &["<", "<=", ">", ">="],
            &["+", "-"],
            &["*", "/", "%"],
        ];
        if min_level >= LEVELS.len() {
            return self.unary();
        }
        let mut left = self.binary(min_level + 1)?;
        loop {
            let next = LEVELS[min_level]
                .iter()
                .copied()
                .find(|&op| self.peek() == Some(&Token::Punct(op)));
            let Some(op) = next else {
                break;
            };
            self.pos += 1;
            let right = self.binary(min_level + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        if self.eat_punct("!") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat_punct("-") {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_punct(".") {
                let Some(Token::Ident(name)) = self.peek().cloned() else {
                    return Err(self.error("expected member name after `.`"));
                };
                self.pos += 1;
                expr = Expr::Member(Box::new(expr), name);
            } else if self.eat_punct("[") {
                let index = self.ternary()?;
                self.expect_punct("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat_punct("(") {
                let mut args = Vec::new();
                if !self.eat_punct(")") {
                    loop {
                        args.push(self.ternary()?);
                        if self.eat_punct(")") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                expr = Expr::Call(Box::new(expr), args);
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        match self.peek().cloned() {
            Some(Token::Num(n)) => {
                self.pos += 1;
                Ok(Expr::Num(n))
            }
            Some(Token::Str(s)) => {
                self.pos += 1;
                Ok(Expr::Str(s))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                match name.as_str() {
                    "true" => Ok(Expr::Bool(true)),
                    "false" => Ok(Expr::Bool(false)),
                    "null" => Ok(Expr::Null),
                    _ => Ok(Expr::Ident(name)),
                }
            }
            Some(Token::Punct("(")) => {
                self.pos += 1;
                let inner = self.ternary()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Some(Token::Punct("[")) => {
                self.pos += 1;
                let mut items = Vec::new();
                if !self.eat_punct("]") {
                    loop {
                        items.push(self.ternary()?);
                        if self.eat_punct("]") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                Ok(Expr::List(items))
            }
            Some(other) => Err(self.error(format!("unexpected token {other:?}"))),
            None => Err(self.error("expression ended unexpectedly")),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval_expr(expr: &Expr, scope: &Rc<Scope>) -> Result<Value, EvalError> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Num(n) => Ok(Value::Num(*n)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::List(items) => items
            .iter()
            .map(|e| Ok(eval_expr(e, scope)?.concrete()))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Expr::Ident(name) => scope
            .get(name)
            .ok_or_else(|| EvalError::Undefined(name.clone())),
        Expr::Member(base, name) => member(&eval_expr(base, scope)?.concrete(), name),
        Expr::Index(base, index) => index_value(
            &eval_expr(base, scope)?.concrete(),
            &eval_expr(index, scope)?.concrete(),
        ),
        Expr::Call(callee, args) => {
            let callee = eval_expr(callee, scope)?.concrete();
            let Value::Func(f) = callee else {
                return Err(EvalError::Type("call target is not callable".into()));
            };
            let args = args
                .iter()
                .map(|a| Ok(eval_expr(a, scope)?.concrete()))
                .collect::<Result<Vec<_>, EvalError>>()?;
            f(&args)
        }
        Expr::Not(inner) => Ok(Value::Bool(!eval_expr(inner, scope)?.is_truthy())),
        Expr::Neg(inner) => match eval_expr(inner, scope)?.concrete() {
            Value::Num(n) => Ok(Value::Num(-n)),
            other => Err(EvalError::Type(format!(
                "cannot negate {}",
                kind_name(&other)
            ))),
        },
        Expr::Binary(op, left, right) => binary(op, left, right, scope),
        Expr::Ternary(cond, then, alt) => {
            if eval_expr(cond, scope)?.is_truthy() {
                eval_expr(then, scope)
            } else {
                eval_expr(alt, scope)
            }
        }
    }
}

fn binary(op: &str, left: &Expr, right: &Expr, scope: &Rc<Scope>) -> Result<Value, EvalError> {
    // Short-circuit forms first.
    if op == "&&" {
        let l = eval_expr(left, scope)?;
        return if l.is_truthy() {
            Ok(Value::Bool(eval_expr(right, scope)?.is_truthy()))
        } else {
            Ok(Value::Bool(false))
        };
    }
    if op == "||" {
        let l = eval_expr(left, scope)?;
        return if l.is_truthy() {
            Ok(Value::Bool(true))
        } else {
            Ok(Value::Bool(eval_expr(right, scope)?.is_truthy()))
        };
    }

    let l = eval_expr(left, scope)?.concrete();
    let r = eval_expr(right, scope)?.concrete();
    match op {
        "==" => Ok(Value::Bool(l == r)),
        "!=" => Ok(Value::Bool(l != r)),
        "+" => match (&l, &r) {
            (Value::Num(a), Value::Num(b)) => Ok(Value::Num(a + b)),
            (Value::Str(_), _) | (_, Value::Str(_)) => {
                Ok(Value::Str(format!("{}{}", l.render(), r.render())))
            }
            _ => Err(type_mismatch("+", &l, &r)),
        },
        "-" | "*" | "/" | "%" => {
            let (Value::Num(a), Value::Num(b)) = (&l, &r) else {
                return Err(type_mismatch(op, &l, &r));
            };
            Ok(Value::Num(match op {
                "-" => a - b,
                "*" => a * b,
                "/" => a / b,
                _ => a % b,
            }))
        }
        "<" | "<=" | ">" | ">=" => {
            let ordering = match (&l, &r) {
                (Value::Num(a), Value::Num(b)) => a.partial_cmp(b),
                (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                _ => return Err(type_mismatch(op, &l, &r)),
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                "<" => ordering.is_lt(),
                "<=" => ordering.is_le(),
                ">" => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        _ => Err(EvalError::Type(format!("unknown operator `{op}`"))),
    }
}

fn member(base: &Value, name: &str) -> Result<Value, EvalError> {
    match base {
        Value::Map(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        Value::Str(s) if name == "length" => Ok(Value::Num(s.chars().count() as f64)),
        Value::List(items) if name == "length" => Ok(Value::Num(items.len() as f64)),
        Value::Null => Err(EvalError::Type(format!(
            "cannot read member `{name}` of null"
        ))),
        other => Err(EvalError::Type(format!(
            "cannot read member `{name}` of {}",
            kind_name(other)
        ))),
    }
}

fn index_value(base: &Value, index: &Value) -> Result<Value, EvalError> {
    match (base, index) {
        (Value::List(items), Value::Num(n)) => {
            if n.fract() != 0.0 || *n < 0.0 {
                return Ok(Value::Null);
            }
            Ok(items.get(*n as usize).cloned().unwrap_or(Value::Null))
        }
        (Value::Map(map), Value::Str(key)) => Ok(map.get(key).cloned().unwrap_or(Value::Null)),
        _ => Err(EvalError::Type(format!(
            "cannot index {} with {}",
            kind_name(base),
            kind_name(index)
        ))),
    }
}

fn type_mismatch(op: &str, l: &Value, r: &Value) -> EvalError {
    EvalError::Type(format!(
        "`{op}` cannot combine {} and {}",
        kind_name(l),
        kind_name(r)
    ))
}

pub(crate) fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Num(_) => "a number",
        Value::Str(_) => "a string",
        Value::List(_) => "a list",
        Value::Map(_) => "a map",
        Value::Observable(_) => "an observable",
        Value::Func(_) => "a function",
        Value::Node(_) => "a node",
    }
}

/// Collects the free root identifiers of an expression: the base names of
/// member/index/call chains, plus every bare identifier.
fn collect_roots(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Ident(name) => {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        Expr::Member(base, _) => collect_roots(base, out),
        Expr::Index(base, index) => {
            collect_roots(base, out);
            collect_roots(index, out);
        }
        Expr::Call(callee, args) => {
            collect_roots(callee, out);
            for a in args {
                collect_roots(a, out);
            }
        }
        Expr::List(items) => {
            for e in items {
                collect_roots(e, out);
            }
        }
        Expr::Not(inner) | Expr::Neg(inner) => collect_roots(inner, out),
        Expr::Binary(_, l, r) => {
            collect_roots(l, out);
            collect_roots(r, out);
        }
        Expr::Ternary(c, t, a) => {
            collect_roots(c, out);
            collect_roots(t, out);
            collect_roots(a, out);
        }
        Expr::Null | Expr::Bool(_) | Expr::Num(_) | Expr::Str(_) => {}
    }
}
