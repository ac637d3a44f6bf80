//! Small arithmetic expression language used as the input of the aggregators and by the
//! expression filter
//!
//! ```text
//! expr    := or
//! or      := and ('||' and)*
//! and     := cmp ('&&' cmp)*
//! cmp     := add (('==' | '!=' | '<' | '<=' | '>' | '>=') add)?
//! add     := mul (('+' | '-') mul)*
//! mul     := unary (('*' | '/' | '%') unary)*
//! unary   := ('-' | '!') unary | primary
//! primary := number | 'string' | identifier | "quoted identifier"
//!          | function '(' (expr (',' expr)*)? ')' | '(' expr ')'
//! ```
//!
//! Null propagates through arithmetic. Comparisons and logical operators produce `1`
//! or `0`, null is falsy.

use std::fmt::Display;

use snafu::{Snafu, ensure};

use crate::value::Value;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum ExprError {
    #[snafu(display("Failed to parse expression `{expr}` at {position}: {message}"))]
    Parse {
        expr: String,
        position: usize,
        message: String,
    },
    #[snafu(display("Unknown function `{name}`"))]
    UnknownFunction { name: String },
    #[snafu(display("Function `{name}` expects {expect} arguments, found {found}"))]
    Arity {
        name: &'static str,
        expect: usize,
        found: usize,
    },
}

type Result<T> = std::result::Result<T, ExprError>;

/// Binary operators
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

/// Builtin functions
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Abs,
    Floor,
    Ceil,
    Sqrt,
    Min,
    Max,
    If,
}

impl Function {
    fn resolve(name: &str) -> Result<Self> {
        Ok(match name {
            "abs" => Self::Abs,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "sqrt" => Self::Sqrt,
            "min" => Self::Min,
            "max" => Self::Max,
            "if" => Self::If,
            _ => return UnknownFunctionSnafu { name }.fail(),
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Abs => "abs",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Sqrt => "sqrt",
            Self::Min => "min",
            Self::Max => "max",
            Self::If => "if",
        }
    }

    fn arity(self) -> usize {
        match self {
            Self::Abs | Self::Floor | Self::Ceil | Self::Sqrt => 1,
            Self::Min | Self::Max => 2,
            Self::If => 3,
        }
    }
}

/// Parsed expression
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Long(i64),
    Double(f64),
    String(String),
    Identifier(String),
    Negate(Box<Expr>),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call { func: Function, args: Vec<Expr> },
}

/// Resolves the identifiers of the expression
pub trait Bindings {
    /// Value of the identifier, null if it does not exist
    fn get(&self, name: &str) -> Value;
}

impl<F: Fn(&str) -> Value> Bindings for F {
    fn get(&self, name: &str) -> Value {
        self(name)
    }
}

impl Expr {
    /// Parse the expression
    pub fn parse(source: &str) -> Result<Self> {
        let mut parser = Parser {
            source,
            tokens: tokenize(source)?,
            cursor: 0,
        };
        let expr = parser.parse_or()?;
        if let Some((position, token)) = parser.tokens.get(parser.cursor) {
            return ParseSnafu {
                expr: source,
                position: *position,
                message: format!("unexpected token `{:?}`", token),
            }
            .fail();
        }
        Ok(expr)
    }

    /// Identifiers referenced by the expression, sorted and deduplicated
    pub fn required_columns(&self) -> Vec<String> {
        let mut columns = Vec::new();
        self.collect_columns(&mut columns);
        columns.sort_unstable();
        columns.dedup();
        columns
    }

    fn collect_columns(&self, columns: &mut Vec<String>) {
        match self {
            Self::Identifier(name) => columns.push(name.clone()),
            Self::Negate(e) | Self::Not(e) => e.collect_columns(columns),
            Self::Binary { left, right, .. } => {
                left.collect_columns(columns);
                right.collect_columns(columns);
            }
            Self::Call { args, .. } => args.iter().for_each(|e| e.collect_columns(columns)),
            Self::Long(_) | Self::Double(_) | Self::String(_) => (),
        }
    }

    /// Evaluate the expression
    pub fn eval(&self, bindings: &dyn Bindings) -> Value {
        match self {
            Self::Long(v) => Value::Long(*v),
            Self::Double(v) => Value::Double(*v),
            Self::String(v) => Value::String(v.clone()),
            Self::Identifier(name) => bindings.get(name),
            Self::Negate(e) => match numeric(e.eval(bindings)) {
                Numeric::Long(v) => Value::Long(v.wrapping_neg()),
                Numeric::Double(v) => Value::Double(-v),
                Numeric::Null => Value::Null,
            },
            Self::Not(e) => Value::Long(!truthy(&e.eval(bindings)) as i64),
            Self::Binary { op, left, right } => match op {
                BinaryOp::And => Value::Long(
                    (truthy(&left.eval(bindings)) && truthy(&right.eval(bindings))) as i64,
                ),
                BinaryOp::Or => Value::Long(
                    (truthy(&left.eval(bindings)) || truthy(&right.eval(bindings))) as i64,
                ),
                _ => eval_binary(*op, left.eval(bindings), right.eval(bindings)),
            },
            Self::Call { func, args } => eval_call(*func, args, bindings),
        }
    }
}

/// Numeric view of the operand
#[derive(Debug, Clone, Copy)]
enum Numeric {
    Null,
    Long(i64),
    Double(f64),
}

fn numeric(value: Value) -> Numeric {
    match value {
        Value::Long(v) => Numeric::Long(v),
        Value::Float(v) => Numeric::Double(v as f64),
        Value::Double(v) => Numeric::Double(v),
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(v) => Numeric::Long(v),
            Err(_) => s
                .trim()
                .parse::<f64>()
                .map_or(Numeric::Null, Numeric::Double),
        },
        other => other
            .to_double()
            .ok()
            .flatten()
            .map_or(Numeric::Null, Numeric::Double),
    }
}

fn truthy(value: &Value) -> bool {
    match numeric(value.clone()) {
        Numeric::Null => false,
        Numeric::Long(v) => v != 0,
        Numeric::Double(v) => v != 0.0 && !v.is_nan(),
    }
}

fn eval_binary(op: BinaryOp, left: Value, right: Value) -> Value {
    // String equality does not go through numbers
    if let (Value::String(l), Value::String(r)) = (&left, &right) {
        if matches!(op, BinaryOp::Eq | BinaryOp::NotEq) {
            return Value::Long(((l == r) == (op == BinaryOp::Eq)) as i64);
        }
    }

    let (l, r) = match (numeric(left), numeric(right)) {
        (Numeric::Null, _) | (_, Numeric::Null) => {
            return match op {
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                    Value::Null
                }
                _ => Value::Long(0),
            };
        }
        (Numeric::Long(l), Numeric::Long(r)) => {
            return match op {
                BinaryOp::Add => Value::Long(l.wrapping_add(r)),
                BinaryOp::Sub => Value::Long(l.wrapping_sub(r)),
                BinaryOp::Mul => Value::Long(l.wrapping_mul(r)),
                BinaryOp::Div => l.checked_div(r).map_or(Value::Null, Value::Long),
                BinaryOp::Mod => l.checked_rem(r).map_or(Value::Null, Value::Long),
                _ => Value::Long(compare(op, l.cmp(&r)) as i64),
            };
        }
        (l, r) => (as_double(l), as_double(r)),
    };

    match op {
        BinaryOp::Add => Value::Double(l + r),
        BinaryOp::Sub => Value::Double(l - r),
        BinaryOp::Mul => Value::Double(l * r),
        BinaryOp::Div => Value::Double(l / r),
        BinaryOp::Mod => Value::Double(l % r),
        _ => Value::Long(
            l.partial_cmp(&r)
                .is_some_and(|ordering| compare(op, ordering)) as i64,
        ),
    }
}

#[inline]
fn as_double(v: Numeric) -> f64 {
    match v {
        Numeric::Long(v) => v as f64,
        Numeric::Double(v) => v,
        Numeric::Null => f64::NAN,
    }
}

#[inline]
fn compare(op: BinaryOp, ordering: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        BinaryOp::Eq => ordering == Equal,
        BinaryOp::NotEq => ordering != Equal,
        BinaryOp::Lt => ordering == Less,
        BinaryOp::LtEq => ordering != Greater,
        BinaryOp::Gt => ordering == Greater,
        BinaryOp::GtEq => ordering != Less,
        _ => false,
    }
}

fn eval_call(func: Function, args: &[Expr], bindings: &dyn Bindings) -> Value {
    let unary = |f: fn(f64) -> f64| match numeric(args[0].eval(bindings)) {
        Numeric::Null => Value::Null,
        Numeric::Long(v) if func == Function::Abs => Value::Long(v.wrapping_abs()),
        Numeric::Long(v) if matches!(func, Function::Floor | Function::Ceil) => Value::Long(v),
        v => Value::Double(f(as_double(v))),
    };
    match func {
        Function::Abs => unary(f64::abs),
        Function::Floor => unary(f64::floor),
        Function::Ceil => unary(f64::ceil),
        Function::Sqrt => unary(f64::sqrt),
        Function::Min | Function::Max => {
            let l = numeric(args[0].eval(bindings));
            let r = numeric(args[1].eval(bindings));
            match (l, r) {
                (Numeric::Null, v) | (v, Numeric::Null) => match v {
                    Numeric::Null => Value::Null,
                    Numeric::Long(v) => Value::Long(v),
                    Numeric::Double(v) => Value::Double(v),
                },
                (Numeric::Long(l), Numeric::Long(r)) => Value::Long(match func {
                    Function::Min => l.min(r),
                    _ => l.max(r),
                }),
                (l, r) => Value::Double(match func {
                    Function::Min => as_double(l).min(as_double(r)),
                    _ => as_double(l).max(as_double(r)),
                }),
            }
        }
        Function::If => match truthy(&args[0].eval(bindings)) {
            true => args[1].eval(bindings),
            false => args[2].eval(bindings),
        },
    }
}

/// Canonical form of the expression, used by the cache keys
impl Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{:?}", v),
            Self::String(v) => write!(f, "'{}'", v.replace('\'', "\\'")),
            Self::Identifier(name) => write!(f, "\"{}\"", name.replace('"', "\\\"")),
            Self::Negate(e) => write!(f, "-{}", e),
            Self::Not(e) => write!(f, "!{}", e),
            Self::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Self::Call { func, args } => {
                write!(f, "{}(", func.name())?;
                args.iter().enumerate().try_for_each(|(i, arg)| {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)
                })?;
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Long(i64),
    Double(f64),
    String(String),
    Identifier(String),
    QuotedIdentifier(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

const OPERATORS: [&str; 17] = [
    "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "!", "(", ")", ",",
];

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;
    let fail = |position: usize, message: &str| {
        ParseSnafu {
            expr: source,
            position,
            message,
        }
        .fail()
    };

    while pos < bytes.len() {
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
        } else if c.is_ascii_digit()
            || (c == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit))
        {
            let start = pos;
            while pos < bytes.len()
                && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'.'
                    || ((bytes[pos] == b'+' || bytes[pos] == b'-')
                        && matches!(bytes[pos - 1], b'e' | b'E')))
            {
                pos += 1;
            }
            let text = &source[start..pos];
            let token = match text.parse::<i64>() {
                Ok(v) => Token::Long(v),
                Err(_) => match text.parse::<f64>() {
                    Ok(v) => Token::Double(v),
                    Err(_) => return fail(start, "invalid number"),
                },
            };
            tokens.push((start, token));
        } else if c.is_ascii_alphabetic() || c == b'_' || c == b'$' {
            let start = pos;
            while pos < bytes.len()
                && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_' || bytes[pos] == b'$')
            {
                pos += 1;
            }
            tokens.push((start, Token::Identifier(source[start..pos].to_string())));
        } else if c == b'\'' || c == b'"' {
            let start = pos;
            pos += 1;
            let mut text = String::new();
            loop {
                let Some(ch) = source[pos..].chars().next() else {
                    return fail(start, "unterminated literal");
                };
                pos += ch.len_utf8();
                if ch == '\\' {
                    let Some(escaped) = source[pos..].chars().next() else {
                        return fail(start, "unterminated literal");
                    };
                    pos += escaped.len_utf8();
                    text.push(escaped);
                } else if ch as u32 == c as u32 {
                    break;
                } else {
                    text.push(ch);
                }
            }
            tokens.push((
                start,
                match c {
                    b'\'' => Token::String(text),
                    _ => Token::QuotedIdentifier(text),
                },
            ));
        } else {
            let Some(op) = OPERATORS
                .iter()
                .find(|op| source[pos..].starts_with(**op))
            else {
                return fail(pos, "unexpected character");
            };
            let token = match *op {
                "(" => Token::LParen,
                ")" => Token::RParen,
                "," => Token::Comma,
                op => Token::Op(op),
            };
            tokens.push((pos, token));
            pos += op.len();
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(usize, Token)>,
    cursor: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(_, token)| token)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .map_or(self.source.len(), |(position, _)| *position)
    }

    fn fail<T>(&self, message: impl Into<String>) -> Result<T> {
        ParseSnafu {
            expr: self.source,
            position: self.position(),
            message: message.into(),
        }
        .fail()
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.cursor += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn parse_binary(
        &mut self,
        ops: &[&'static str],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut left = next(self)?;
        while let Some(op) = self.eat_op(ops) {
            let right = next(self)?;
            left = Expr::Binary {
                op: binary_op(op),
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        self.parse_binary(&["||"], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        self.parse_binary(&["&&"], Self::parse_cmp)
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let left = self.parse_add()?;
        match self.eat_op(&["==", "!=", "<", "<=", ">", ">="]) {
            Some(op) => Ok(Expr::Binary {
                op: binary_op(op),
                left: Box::new(left),
                right: Box::new(self.parse_add()?),
            }),
            None => Ok(left),
        }
    }

    fn parse_add(&mut self) -> Result<Expr> {
        self.parse_binary(&["+", "-"], Self::parse_mul)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        self.parse_binary(&["*", "/", "%"], Self::parse_unary)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.eat_op(&["-", "!"]) {
            Some("-") => Ok(match self.parse_unary()? {
                Expr::Long(v) => Expr::Long(v.wrapping_neg()),
                Expr::Double(v) => Expr::Double(-v),
                e => Expr::Negate(Box::new(e)),
            }),
            Some(_) => Ok(Expr::Not(Box::new(self.parse_unary()?))),
            None => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let Some(token) = self.peek().cloned() else {
            return self.fail("unexpected end of expression");
        };
        self.cursor += 1;
        match token {
            Token::Long(v) => Ok(Expr::Long(v)),
            Token::Double(v) => Ok(Expr::Double(v)),
            Token::String(v) => Ok(Expr::String(v)),
            Token::QuotedIdentifier(name) => Ok(Expr::Identifier(name)),
            Token::Identifier(name) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Identifier(name));
                }
                self.cursor += 1;
                let func = Function::resolve(&name)?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.parse_or()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.cursor += 1;
                        } else {
                            break;
                        }
                    }
                }
                if self.peek() != Some(&Token::RParen) {
                    return self.fail("expect `)`");
                }
                self.cursor += 1;
                ensure!(
                    args.len() == func.arity(),
                    AritySnafu {
                        name: func.name(),
                        expect: func.arity(),
                        found: args.len()
                    }
                );
                Ok(Expr::Call { func, args })
            }
            Token::LParen => {
                let expr = self.parse_or()?;
                if self.peek() != Some(&Token::RParen) {
                    return self.fail("expect `)`");
                }
                self.cursor += 1;
                Ok(expr)
            }
            token => {
                self.cursor -= 1;
                self.fail(format!("unexpected token `{:?}`", token))
            }
        }
    }
}

fn binary_op(op: &str) -> BinaryOp {
    match op {
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Mod,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::NotEq,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::LtEq,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::GtEq,
        "&&" => BinaryOp::And,
        _ => BinaryOp::Or,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str) -> Value {
        let bindings = |name: &str| match name {
            "x" => Value::Long(10),
            "y" => Value::Double(2.5),
            "s" => Value::from("3"),
            _ => Value::Null,
        };
        Expr::parse(source).unwrap().eval(&bindings)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 2 * 3"), Value::Long(7));
        assert_eq!(eval("(1 + 2) * 3"), Value::Long(9));
        assert_eq!(eval("x / 4"), Value::Long(2));
        assert_eq!(eval("x * y"), Value::Double(25.0));
        assert_eq!(eval("-x + s"), Value::Long(-7));
        assert_eq!(eval("x / 0"), Value::Null);
        assert_eq!(eval("missing + 1"), Value::Null);
        assert_eq!(eval("max(x, y) - abs(-3)"), Value::Double(7.0));
        assert_eq!(eval("min(x, 4) - abs(-3)"), Value::Long(1));
        assert_eq!(eval("1.5e1"), Value::Double(15.0));
    }

    #[test]
    fn test_predicates() {
        assert_eq!(eval("x > 5 && y < 3"), Value::Long(1));
        assert_eq!(eval("x == 10 || missing"), Value::Long(1));
        assert_eq!(eval("!(x >= 11)"), Value::Long(1));
        assert_eq!(eval("missing > 1"), Value::Long(0));
        assert_eq!(eval("'a' == 'a'"), Value::Long(1));
        assert_eq!(eval("if(x > 1, 'big', 'small')"), Value::from("big"));
    }

    #[test]
    fn test_required_columns_and_canonical_form() {
        let expr = Expr::parse("b + a * \"weird col\" - b").unwrap();
        assert_eq!(expr.required_columns(), vec!["a", "b", "weird col"]);
        expect_test::expect![[r#"(("b" + ("a" * "weird col")) - "b")"#]]
            .assert_eq(&expr.to_string());
        assert_eq!(Expr::parse(&expr.to_string()).unwrap(), expr);
    }

    #[test]
    fn test_parse_errors() {
        expect_test::expect!["Failed to parse expression `1 +` at 3: unexpected end of expression"]
            .assert_eq(&Expr::parse("1 +").unwrap_err().to_string());
        expect_test::expect!["Unknown function `foo`"]
            .assert_eq(&Expr::parse("foo(1)").unwrap_err().to_string());
        expect_test::expect!["Function `abs` expects 1 arguments, found 2"]
            .assert_eq(&Expr::parse("abs(1, 2)").unwrap_err().to_string());
        assert!(Expr::parse("1 2").is_err());
        assert!(Expr::parse("'abc").is_err());
    }
}
