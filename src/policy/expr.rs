//! A small expression language for policy predicates.
//!
//! Supports boolean, numeric and string literals, `undefined`, attribute
//! references (`Cpus`, `MY.State`, `TARGET.Owner`), the usual arithmetic,
//! comparison and logical operators, and the strict identity operators
//! `=?=` / `=!=`. Logic is three-valued: `false && undefined` is false,
//! `true || undefined` is true, everything else touching undefined stays
//! undefined. Attribute names are matched case-insensitively.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use crate::config::PolicyConfig;
use crate::error::{Result, StartdError};
use crate::policy::{Attributes, EvalContext, PolicyEvaluator, PolicyExpr, TriState};

#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Bool(bool),
    Number(f64),
    Str(String),
    Undefined,
}

impl EvalValue {
    pub fn as_tristate(&self) -> TriState {
        match self {
            EvalValue::Bool(b) => TriState::from(*b),
            _ => TriState::Undefined,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            EvalValue::Number(n) => Some(*n),
            EvalValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn from_json(value: &Value) -> Self {
        match value {
            Value::Bool(b) => EvalValue::Bool(*b),
            Value::Number(n) => n.as_f64().map(EvalValue::Number).unwrap_or(EvalValue::Undefined),
            Value::String(s) => EvalValue::Str(s.clone()),
            _ => EvalValue::Undefined,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Any,
    My,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Is,
    IsNot,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(EvalValue),
    Attr(ScopedAttr),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOpNode),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScopedAttr {
    scope: Scope,
    name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinOpNode {
    op: BinOp,
    lhs: Box<Expr>,
    rhs: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    const OPS: [&str; 18] = [
        "=?=", "=!=", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/", ".",
        "(", ")",
    ];
    let mut tokens = Vec::new();
    let bytes = src.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            let text = &src[start..i];
            let n = text
                .parse::<f64>()
                .map_err(|_| StartdError::Policy(format!("bad number '{}'", text)))?;
            tokens.push(Token::Number(n));
            continue;
        }
        if c == '"' {
            let start = i + 1;
            i += 1;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            if i >= bytes.len() {
                return Err(StartdError::Policy("unterminated string".into()));
            }
            tokens.push(Token::Str(src[start..i].to_string()));
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push(Token::Ident(src[start..i].to_string()));
            continue;
        }
        let rest = &src[i..];
        match OPS.iter().find(|op| rest.starts_with(**op)) {
            Some(&"(") => tokens.push(Token::LParen),
            Some(&")") => tokens.push(Token::RParen),
            Some(op) => tokens.push(Token::Op(op)),
            None => {
                return Err(StartdError::Policy(format!(
                    "unexpected character '{}' at {}",
                    c, i
                )))
            }
        }
        i += tokens
            .last()
            .map(|t| match t {
                Token::Op(op) => op.len(),
                _ => 1,
            })
            .unwrap_or(1);
    }
    Ok(tokens)
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
        self.pos += 1;
        token
    }

    fn peek_op(&self) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) => Some(op),
            _ => None,
        }
    }

    fn binary_op(op: &str) -> Option<(BinOp, u8)> {
        let entry = match op {
            "||" => (BinOp::Or, 1),
            "&&" => (BinOp::And, 2),
            "==" => (BinOp::Eq, 3),
            "!=" => (BinOp::Ne, 3),
            "=?=" => (BinOp::Is, 3),
            "=!=" => (BinOp::IsNot, 3),
            "<" => (BinOp::Lt, 4),
            "<=" => (BinOp::Le, 4),
            ">" => (BinOp::Gt, 4),
            ">=" => (BinOp::Ge, 4),
            "+" => (BinOp::Add, 5),
            "-" => (BinOp::Sub, 5),
            "*" => (BinOp::Mul, 6),
            "/" => (BinOp::Div, 6),
            _ => return None,
        };
        Some(entry)
    }

    fn expression(&mut self, min_prec: u8) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some((op, prec)) = self.peek_op().and_then(Self::binary_op) {
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.expression(prec + 1)?;
            lhs = Expr::Binary(BinOpNode {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek_op() {
            Some("!") => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some("-") => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(EvalValue::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(EvalValue::Str(s))),
            Some(Token::LParen) => {
                let inner = self.expression(0)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(StartdError::Policy("expected ')'".into())),
                }
            }
            Some(Token::Ident(ident)) => self.identifier(ident),
            other => Err(StartdError::Policy(format!("unexpected token {:?}", other))),
        }
    }

    fn identifier(&mut self, ident: String) -> Result<Expr> {
        let lower = ident.to_ascii_lowercase();
        match lower.as_str() {
            "true" => return Ok(Expr::Literal(EvalValue::Bool(true))),
            "false" => return Ok(Expr::Literal(EvalValue::Bool(false))),
            "undefined" => return Ok(Expr::Literal(EvalValue::Undefined)),
            _ => {}
        }
        let scope = match lower.as_str() {
            "my" => Some(Scope::My),
            "target" => Some(Scope::Target),
            _ => None,
        };
        if let (Some(scope), Some(".")) = (scope, self.peek_op()) {
            self.pos += 1;
            return match self.next() {
                Some(Token::Ident(name)) => Ok(Expr::Attr(ScopedAttr { scope, name })),
                _ => Err(StartdError::Policy(format!(
                    "expected attribute after {}.",
                    ident
                ))),
            };
        }
        Ok(Expr::Attr(ScopedAttr {
            scope: Scope::Any,
            name: ident,
        }))
    }
}

fn lookup(record: &Attributes, name: &str) -> Option<EvalValue> {
    if let Some(v) = record.get(name) {
        return Some(EvalValue::from_json(v));
    }
    record
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| EvalValue::from_json(v))
}

impl Expr {
    pub fn parse(src: &str) -> Result<Expr> {
        if src.trim().is_empty() {
            return Ok(Expr::Literal(EvalValue::Undefined));
        }
        let mut parser = Parser {
            tokens: tokenize(src)?,
            pos: 0,
        };
        let expr = parser.expression(0)?;
        if parser.pos != parser.tokens.len() {
            return Err(StartdError::Policy(format!(
                "trailing input in '{}'",
                src
            )));
        }
        Ok(expr)
    }

    pub fn eval(&self, ctx: &EvalContext<'_>) -> EvalValue {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Attr(attr) => {
                let found = match attr.scope {
                    Scope::My => lookup(ctx.slot, &attr.name),
                    Scope::Target => ctx.job.and_then(|job| lookup(job, &attr.name)),
                    Scope::Any => lookup(ctx.slot, &attr.name)
                        .or_else(|| ctx.job.and_then(|job| lookup(job, &attr.name))),
                };
                found.unwrap_or(EvalValue::Undefined)
            }
            Expr::Not(inner) => match inner.eval(ctx) {
                EvalValue::Bool(b) => EvalValue::Bool(!b),
                _ => EvalValue::Undefined,
            },
            Expr::Neg(inner) => match inner.eval(ctx) {
                EvalValue::Number(n) => EvalValue::Number(-n),
                _ => EvalValue::Undefined,
            },
            Expr::Binary(node) => node.eval(ctx),
        }
    }
}

impl BinOpNode {
    fn eval(&self, ctx: &EvalContext<'_>) -> EvalValue {
        let lhs = self.lhs.eval(ctx);
        match self.op {
            BinOp::And => {
                if lhs == EvalValue::Bool(false) {
                    return lhs;
                }
                let rhs = self.rhs.eval(ctx);
                match (lhs.as_tristate(), rhs.as_tristate()) {
                    (_, TriState::False) => EvalValue::Bool(false),
                    (TriState::True, TriState::True) => EvalValue::Bool(true),
                    _ => EvalValue::Undefined,
                }
            }
            BinOp::Or => {
                if lhs == EvalValue::Bool(true) {
                    return lhs;
                }
                let rhs = self.rhs.eval(ctx);
                match (lhs.as_tristate(), rhs.as_tristate()) {
                    (_, TriState::True) => EvalValue::Bool(true),
                    (TriState::False, TriState::False) => EvalValue::Bool(false),
                    _ => EvalValue::Undefined,
                }
            }
            BinOp::Is => EvalValue::Bool(identical(&lhs, &self.rhs.eval(ctx))),
            BinOp::IsNot => EvalValue::Bool(!identical(&lhs, &self.rhs.eval(ctx))),
            op => compare_or_compute(op, lhs, self.rhs.eval(ctx)),
        }
    }
}

fn identical(a: &EvalValue, b: &EvalValue) -> bool {
    match (a, b) {
        (EvalValue::Str(x), EvalValue::Str(y)) => x == y,
        _ => a == b,
    }
}

fn compare_or_compute(op: BinOp, lhs: EvalValue, rhs: EvalValue) -> EvalValue {
    use EvalValue::*;
    match (op, &lhs, &rhs) {
        (_, Undefined, _) | (_, _, Undefined) => Undefined,
        (BinOp::Eq, Str(a), Str(b)) => Bool(a.eq_ignore_ascii_case(b)),
        (BinOp::Ne, Str(a), Str(b)) => Bool(!a.eq_ignore_ascii_case(b)),
        (BinOp::Eq, Bool(a), Bool(b)) => Bool(a == b),
        (BinOp::Ne, Bool(a), Bool(b)) => Bool(a != b),
        (_, Number(a), Number(b)) => {
            let (a, b) = (*a, *b);
            match op {
                BinOp::Eq => Bool(a == b),
                BinOp::Ne => Bool(a != b),
                BinOp::Lt => Bool(a < b),
                BinOp::Le => Bool(a <= b),
                BinOp::Gt => Bool(a > b),
                BinOp::Ge => Bool(a >= b),
                BinOp::Add => Number(a + b),
                BinOp::Sub => Number(a - b),
                BinOp::Mul => Number(a * b),
                BinOp::Div if b != 0.0 => Number(a / b),
                _ => Undefined,
            }
        }
        _ => Undefined,
    }
}

struct Compiled {
    source: String,
    expr: Expr,
}

/// [`PolicyEvaluator`] backed by [`Expr`], compiled from [`PolicyConfig`].
///
/// Expressions can be replaced at runtime with [`ExprPolicy::reconfigure`].
pub struct ExprPolicy {
    compiled: RwLock<HashMap<PolicyExpr, Compiled>>,
}

impl ExprPolicy {
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let sources = [
            (PolicyExpr::Start, &config.start),
            (PolicyExpr::IsOwner, &config.is_owner),
            (PolicyExpr::Preempt, &config.preempt),
            (PolicyExpr::Suspend, &config.suspend),
            (PolicyExpr::Continue, &config.continue_),
            (PolicyExpr::Kill, &config.kill),
            (PolicyExpr::WantSuspend, &config.want_suspend),
            (PolicyExpr::WantVacate, &config.want_vacate),
            (PolicyExpr::WantHold, &config.want_hold),
            (PolicyExpr::Rank, &config.rank),
            (PolicyExpr::StartBackfill, &config.start_backfill),
            (PolicyExpr::EvictBackfill, &config.evict_backfill),
            (PolicyExpr::PeriodicCheckpoint, &config.periodic_checkpoint),
            (PolicyExpr::MaxJobRetirementTime, &config.max_job_retirement_time),
            (PolicyExpr::MachineMaxVacateTime, &config.machine_max_vacate_time),
            (PolicyExpr::DrainingStart, &config.draining_start),
        ];
        let mut compiled = HashMap::new();
        for (which, source) in sources {
            let expr = Expr::parse(source)
                .map_err(|e| StartdError::Policy(format!("{}: {}", which, e)))?;
            compiled.insert(
                which,
                Compiled {
                    source: source.clone(),
                    expr,
                },
            );
        }
        Ok(Self {
            compiled: RwLock::new(compiled),
        })
    }

    /// Replace one expression. The old expression stays in force on a parse error.
    pub fn reconfigure(&self, which: PolicyExpr, source: &str) -> Result<()> {
        let expr = Expr::parse(source)?;
        let mut compiled = self.compiled.write().unwrap_or_else(|e| e.into_inner());
        compiled.insert(
            which,
            Compiled {
                source: source.to_string(),
                expr,
            },
        );
        tracing::info!(expr = %which, source, "Policy expression reconfigured");
        Ok(())
    }
}

impl PolicyEvaluator for ExprPolicy {
    fn eval(&self, expr: PolicyExpr, ctx: &EvalContext<'_>) -> EvalValue {
        let compiled = self.compiled.read().unwrap_or_else(|e| e.into_inner());
        compiled
            .get(&expr)
            .map(|c| c.expr.eval(ctx))
            .unwrap_or(EvalValue::Undefined)
    }

    fn eval_source(&self, source: &str, ctx: &EvalContext<'_>) -> EvalValue {
        match Expr::parse(source) {
            Ok(expr) => expr.eval(ctx),
            Err(e) => {
                tracing::debug!(source, error = %e, "Unparseable record expression");
                EvalValue::Undefined
            }
        }
    }

    fn source(&self, expr: PolicyExpr) -> String {
        let compiled = self.compiled.read().unwrap_or_else(|e| e.into_inner());
        compiled
            .get(&expr)
            .map(|c| c.source.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Attributes {
        match v {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn eval(src: &str, slot: &Attributes, job: Option<&Attributes>) -> EvalValue {
        Expr::parse(src).unwrap().eval(&EvalContext::new(slot, job))
    }

    #[test]
    fn literals_and_logic() {
        let empty = Attributes::new();
        assert_eq!(eval("true && !false", &empty, None), EvalValue::Bool(true));
        assert_eq!(eval("false && undefined", &empty, None), EvalValue::Bool(false));
        assert_eq!(eval("undefined && false", &empty, None), EvalValue::Bool(false));
        assert_eq!(eval("true || undefined", &empty, None), EvalValue::Bool(true));
        assert_eq!(eval("true && undefined", &empty, None), EvalValue::Undefined);
        assert_eq!(eval("", &empty, None), EvalValue::Undefined);
    }

    #[test]
    fn arithmetic_precedence() {
        let empty = Attributes::new();
        assert_eq!(eval("1 + 2 * 3", &empty, None), EvalValue::Number(7.0));
        assert_eq!(eval("(1 + 2) * 3", &empty, None), EvalValue::Number(9.0));
        assert_eq!(eval("-4 / 2", &empty, None), EvalValue::Number(-2.0));
        assert_eq!(eval("1 / 0", &empty, None), EvalValue::Undefined);
        assert_eq!(eval("2 * 3 >= 6 && 1 < 2", &empty, None), EvalValue::Bool(true));
    }

    #[test]
    fn scoped_attribute_lookup() {
        let slot = record(json!({"State": "Unclaimed", "Cpus": 4}));
        let job = record(json!({"Owner": "alice", "RequestCpus": 2, "Cpus": 99}));
        assert_eq!(
            eval("MY.cpus >= TARGET.RequestCpus", &slot, Some(&job)),
            EvalValue::Bool(true)
        );
        assert_eq!(eval("Cpus", &slot, Some(&job)), EvalValue::Number(4.0));
        assert_eq!(eval("TARGET.Cpus", &slot, Some(&job)), EvalValue::Number(99.0));
        assert_eq!(
            eval("Owner == \"ALICE\"", &slot, Some(&job)),
            EvalValue::Bool(true)
        );
        assert_eq!(eval("TARGET.Owner", &slot, None), EvalValue::Undefined);
    }

    #[test]
    fn identity_operators_see_undefined() {
        let slot = record(json!({"Draining": true}));
        assert_eq!(eval("Missing =?= undefined", &slot, None), EvalValue::Bool(true));
        assert_eq!(eval("Missing == undefined", &slot, None), EvalValue::Undefined);
        assert_eq!(eval("Draining =!= true", &slot, None), EvalValue::Bool(false));
    }

    #[test]
    fn parse_errors() {
        assert!(Expr::parse("1 +").is_err());
        assert!(Expr::parse("(true").is_err());
        assert!(Expr::parse("\"open").is_err());
        assert!(Expr::parse("true false").is_err());
        assert!(Expr::parse("a # b").is_err());
    }

    #[test]
    fn expr_policy_reconfigure() {
        let policy = ExprPolicy::from_config(&PolicyConfig::default()).unwrap();
        let slot = Attributes::new();
        let ctx = EvalContext::new(&slot, None);
        assert_eq!(policy.eval_bool(PolicyExpr::Preempt, &ctx), TriState::False);

        policy.reconfigure(PolicyExpr::Preempt, "true").unwrap();
        assert_eq!(policy.eval_bool(PolicyExpr::Preempt, &ctx), TriState::True);
        assert_eq!(policy.source(PolicyExpr::Preempt), "true");

        assert!(policy.reconfigure(PolicyExpr::Preempt, "((").is_err());
        assert_eq!(policy.eval_bool(PolicyExpr::Preempt, &ctx), TriState::True);
    }

    #[test]
    fn expr_policy_rejects_bad_config() {
        let config = PolicyConfig {
            kill: "&& true".to_string(),
            ..PolicyConfig::default()
        };
        let err = ExprPolicy::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("KILL"));
    }
}
