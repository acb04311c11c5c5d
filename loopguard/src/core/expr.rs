//! State-inspection expressions for `eval` criteria.
//!
//! A deliberately small language: integer, boolean and string literals,
//! arithmetic, comparison, boolean connectives, and a fixed set of read-only
//! filesystem functions. Evaluation never mutates the tree; every failure is
//! an [`ExprError`] that the evaluator turns into a failing result.
//!
//! ```text
//! exists("src/lib.rs") && line_count("src/lib.rs") < 500
//! file_count("tests/**/*.py") >= 3 and not contains("setup.py", "TODO")
//! ```
//!
//! Functions: `exists`, `is_file`, `is_dir`, `file_count(glob)`,
//! `line_count(path)`, `size(path)`, `contains(path, regex)`, `len(string)`.

use std::fmt;
use std::io;

use regex::Regex;
use thiserror::Error;

/// Error raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("type error: {0}")]
    Type(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("`{name}` expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    Overflow,
    #[error("invalid pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
    #[error("{function}(\"{path}\"): {message}")]
    Io {
        function: String,
        path: String,
        message: String,
    },
}

/// Runtime value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Read-only view of the working tree used by expression functions.
///
/// Paths are relative to the tree root.
pub trait Inspector {
    fn exists(&self, path: &str) -> io::Result<bool>;
    fn is_file(&self, path: &str) -> io::Result<bool>;
    fn is_dir(&self, path: &str) -> io::Result<bool>;
    fn file_count(&self, pattern: &str) -> io::Result<usize>;
    fn read_to_string(&self, path: &str) -> io::Result<String>;
    fn size(&self, path: &str) -> io::Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Int(i64),
    Bool(bool),
    Str(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

/// Parse an expression without evaluating it.
pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    match parser.peek() {
        Token::End => Ok(expr),
        _ => Err(parser.error("unexpected trailing input")),
    }
}

/// Parse and evaluate `source`, requiring a boolean result.
pub fn evaluate(source: &str, inspector: &dyn Inspector) -> Result<bool, ExprError> {
    let expr = parse(source)?;
    match eval(&expr, inspector)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::Type(format!(
            "expression must evaluate to bool, got {} {other}",
            other.type_name()
        ))),
    }
}

pub fn eval(expr: &Expr, inspector: &dyn Inspector) -> Result<Value, ExprError> {
    match expr {
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Not(inner) => Ok(Value::Bool(!expect_bool(eval(inner, inspector)?, "!")?)),
        Expr::Neg(inner) => {
            let n = expect_int(eval(inner, inspector)?, "-")?;
            n.checked_neg().map(Value::Int).ok_or(ExprError::Overflow)
        }
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, inspector),
        Expr::Call { name, args } => {
            let values = args
                .iter()
                .map(|arg| eval(arg, inspector))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &values, inspector)
        }
    }
}

fn eval_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    inspector: &dyn Inspector,
) -> Result<Value, ExprError> {
    // Connectives short-circuit so guards like `exists(p) && size(p) > 0` work.
    match op {
        BinaryOp::Or => {
            if expect_bool(eval(lhs, inspector)?, "||")? {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(expect_bool(eval(rhs, inspector)?, "||")?));
        }
        BinaryOp::And => {
            if !expect_bool(eval(lhs, inspector)?, "&&")? {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(expect_bool(eval(rhs, inspector)?, "&&")?));
        }
        _ => {}
    }

    let left = eval(lhs, inspector)?;
    let right = eval(rhs, inspector)?;
    match op {
        BinaryOp::Eq | BinaryOp::Ne => {
            if left.type_name() != right.type_name() {
                return Err(ExprError::Type(format!(
                    "cannot compare {} with {}",
                    left.type_name(),
                    right.type_name()
                )));
            }
            let equal = left == right;
            Ok(Value::Bool(if op == BinaryOp::Eq { equal } else { !equal }))
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&left, &right) {
                (Value::Int(a), Value::Int(b)) => a.cmp(b),
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                _ => {
                    return Err(ExprError::Type(format!(
                        "cannot order {} and {}",
                        left.type_name(),
                        right.type_name()
                    )));
                }
            };
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add => match (left, right) {
            (Value::Int(a), Value::Int(b)) => {
                a.checked_add(b).map(Value::Int).ok_or(ExprError::Overflow)
            }
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
            (a, b) => Err(ExprError::Type(format!(
                "cannot add {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        },
        _ => {
            let a = expect_int(left, "arithmetic")?;
            let b = expect_int(right, "arithmetic")?;
            let result = match op {
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                _ => {
                    if b == 0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    a.checked_div(b)
                }
            };
            result.map(Value::Int).ok_or(ExprError::Overflow)
        }
    }
}

fn call(name: &str, args: &[Value], inspector: &dyn Inspector) -> Result<Value, ExprError> {
    let io_err = |path: &str, err: io::Error| ExprError::Io {
        function: name.to_string(),
        path: path.to_string(),
        message: err.to_string(),
    };
    match name {
        "exists" | "is_file" | "is_dir" => {
            let path = single_str(name, args)?;
            let result = match name {
                "exists" => inspector.exists(path),
                "is_file" => inspector.is_file(path),
                _ => inspector.is_dir(path),
            };
            result.map(Value::Bool).map_err(|err| io_err(path, err))
        }
        "file_count" => {
            let pattern = single_str(name, args)?;
            let count = inspector
                .file_count(pattern)
                .map_err(|err| io_err(pattern, err))?;
            Ok(Value::Int(to_int(count as u64)?))
        }
        "line_count" => {
            let path = single_str(name, args)?;
            let text = inspector
                .read_to_string(path)
                .map_err(|err| io_err(path, err))?;
            Ok(Value::Int(to_int(text.lines().count() as u64)?))
        }
        "size" => {
            let path = single_str(name, args)?;
            let bytes = inspector.size(path).map_err(|err| io_err(path, err))?;
            Ok(Value::Int(to_int(bytes)?))
        }
        "contains" => {
            check_arity(name, args, 2)?;
            let path = str_arg(name, &args[0])?;
            let pattern = str_arg(name, &args[1])?;
            let regex = Regex::new(pattern).map_err(|err| ExprError::Pattern {
                pattern: pattern.to_string(),
                message: err.to_string(),
            })?;
            let text = inspector
                .read_to_string(path)
                .map_err(|err| io_err(path, err))?;
            Ok(Value::Bool(regex.is_match(&text)))
        }
        "len" => {
            let text = single_str(name, args)?;
            Ok(Value::Int(to_int(text.chars().count() as u64)?))
        }
        _ => Err(ExprError::UnknownFunction(name.to_string())),
    }
}

fn check_arity(name: &str, args: &[Value], expected: usize) -> Result<(), ExprError> {
    if args.len() != expected {
        return Err(ExprError::Arity {
            name: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn single_str<'a>(name: &str, args: &'a [Value]) -> Result<&'a str, ExprError> {
    check_arity(name, args, 1)?;
    str_arg(name, &args[0])
}

fn str_arg<'a>(name: &str, value: &'a Value) -> Result<&'a str, ExprError> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(ExprError::Type(format!(
            "`{name}` expects string arguments, got {}",
            other.type_name()
        ))),
    }
}

fn to_int(n: u64) -> Result<i64, ExprError> {
    i64::try_from(n).map_err(|_| ExprError::Overflow)
}

fn expect_bool(value: Value, op: &str) -> Result<bool, ExprError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::Type(format!(
            "`{op}` expects bool, got {}",
            other.type_name()
        ))),
    }
}

fn expect_int(value: Value, op: &str) -> Result<i64, ExprError> {
    match value {
        Value::Int(n) => Ok(n),
        other => Err(ExprError::Type(format!(
            "`{op}` expects int, got {}",
            other.type_name()
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Int(i64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Op(BinaryOp),
    Bang,
    Minus,
    End,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Spanned>, ExprError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let err = |offset: usize, message: &str| ExprError::Parse {
        offset,
        message: message.to_string(),
    };

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let mut push = |token: Token, width: usize| {
            tokens.push(Spanned { token, offset });
            width
        };
        i += match (c, next) {
            (c, _) if c.is_whitespace() => 1,
            ('(', _) => push(Token::LParen, 1),
            (')', _) => push(Token::RParen, 1),
            (',', _) => push(Token::Comma, 1),
            ('|', Some('|')) => push(Token::Op(BinaryOp::Or), 2),
            ('&', Some('&')) => push(Token::Op(BinaryOp::And), 2),
            ('=', Some('=')) => push(Token::Op(BinaryOp::Eq), 2),
            ('!', Some('=')) => push(Token::Op(BinaryOp::Ne), 2),
            ('<', Some('=')) => push(Token::Op(BinaryOp::Le), 2),
            ('>', Some('=')) => push(Token::Op(BinaryOp::Ge), 2),
            ('<', _) => push(Token::Op(BinaryOp::Lt), 1),
            ('>', _) => push(Token::Op(BinaryOp::Gt), 1),
            ('!', _) => push(Token::Bang, 1),
            ('+', _) => push(Token::Op(BinaryOp::Add), 1),
            ('-', _) => push(Token::Minus, 1),
            ('*', _) => push(Token::Op(BinaryOp::Mul), 1),
            ('/', _) => push(Token::Op(BinaryOp::Div), 1),
            ('"' | '\'', _) => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                loop {
                    let Some(&(_, ch)) = chars.get(j) else {
                        return Err(err(offset, "unterminated string"));
                    };
                    match ch {
                        '\\' => {
                            let Some(&(_, escaped)) = chars.get(j + 1) else {
                                return Err(err(offset, "unterminated string"));
                            };
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            j += 2;
                        }
                        ch if ch == quote => break,
                        ch => {
                            value.push(ch);
                            j += 1;
                        }
                    }
                }
                push(Token::Str(value), j + 1 - i)
            }
            (c, _) if c.is_ascii_digit() => {
                let mut j = i;
                while chars.get(j).is_some_and(|(_, ch)| ch.is_ascii_digit()) {
                    j += 1;
                }
                let digits: String = chars[i..j].iter().map(|(_, ch)| ch).collect();
                let n = digits
                    .parse::<i64>()
                    .map_err(|_| err(offset, "integer literal out of range"))?;
                push(Token::Int(n), j - i)
            }
            (c, _) if c.is_alphabetic() || c == '_' => {
                let mut j = i;
                while chars
                    .get(j)
                    .is_some_and(|(_, ch)| ch.is_alphanumeric() || *ch == '_')
                {
                    j += 1;
                }
                let word: String = chars[i..j].iter().map(|(_, ch)| ch).collect();
                let token = match word.as_str() {
                    "and" => Token::Op(BinaryOp::And),
                    "or" => Token::Op(BinaryOp::Or),
                    "not" => Token::Bang,
                    _ => Token::Ident(word),
                };
                push(token, j - i)
            }
            _ => return Err(err(offset, &format!("unexpected character '{c}'"))),
        };
    }
    tokens.push(Spanned {
        token: Token::End,
        offset: source.len(),
    });
    Ok(tokens)
}

/// Deepest syntax tree the parser builds. Parsing and evaluation recurse
/// once per level.
pub const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Tree depth above the node being parsed.
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map_or(&Token::End, |spanned| &spanned.token)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: &str) -> ExprError {
        let offset = self.tokens.get(self.pos).map_or(0, |spanned| spanned.offset);
        ExprError::Parse {
            offset,
            message: message.to_string(),
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ExprError> {
        if self.peek() == token {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected {what}")))
        }
    }

    fn descend(&mut self, levels: usize) -> Result<(), ExprError> {
        self.depth += levels;
        if self.depth > MAX_DEPTH {
            return Err(self.error(&format!("expression nested deeper than {MAX_DEPTH}")));
        }
        Ok(())
    }

    fn binary_level(
        &mut self,
        ops: &[BinaryOp],
        next: fn(&mut Parser) -> Result<Expr, ExprError>,
    ) -> Result<Expr, ExprError> {
        let mut lhs = next(self)?;
        // Each fold pushes the left operand one level down.
        let mut folds = 0;
        loop {
            let op = match self.peek() {
                Token::Op(op) if ops.contains(op) => *op,
                Token::Minus if ops.contains(&BinaryOp::Sub) => BinaryOp::Sub,
                _ => {
                    self.depth -= folds;
                    return Ok(lhs);
                }
            };
            self.advance();
            self.descend(1)?;
            folds += 1;
            let rhs = next(self)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[BinaryOp::Or], Parser::and)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[BinaryOp::And], Parser::equality)
    }

    fn equality(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[BinaryOp::Eq, BinaryOp::Ne], Parser::comparison)
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(
            &[BinaryOp::Lt, BinaryOp::Le, BinaryOp::Gt, BinaryOp::Ge],
            Parser::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[BinaryOp::Add, BinaryOp::Sub], Parser::term)
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[BinaryOp::Mul, BinaryOp::Div], Parser::unary)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        self.descend(1)?;
        let expr = self.unary_inner();
        self.depth -= 1;
        expr
    }

    fn unary_inner(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Token::Bang => {
                self.advance();
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Token::Minus => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.peek().clone() {
            Token::Int(n) => {
                self.advance();
                Ok(Expr::Int(n))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            Token::Ident(name) => {
                self.advance();
                match name.as_str() {
                    "true" => return Ok(Expr::Bool(true)),
                    "false" => return Ok(Expr::Bool(false)),
                    _ => {}
                }
                self.expect(&Token::LParen, &format!("'(' after `{name}`"))?;
                let mut args = Vec::new();
                if self.peek() != &Token::RParen {
                    loop {
                        args.push(self.or()?);
                        if self.peek() == &Token::Comma {
                            self.advance();
                            continue;
                        }
                        break;
                    }
                }
                self.expect(&Token::RParen, "')'")?;
                Ok(Expr::Call { name, args })
            }
            Token::LParen => {
                self.advance();
                let inner = self.or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            _ => Err(self.error("expected a value")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[derive(Default)]
    struct FakeTree {
        files: BTreeMap<String, String>,
    }

    impl FakeTree {
        fn with(mut self, path: &str, contents: &str) -> Self {
            self.files.insert(path.to_string(), contents.to_string());
            self
        }
    }

    impl Inspector for FakeTree {
        fn exists(&self, path: &str) -> io::Result<bool> {
            Ok(self.is_file(path)? || self.is_dir(path)?)
        }

        fn is_file(&self, path: &str) -> io::Result<bool> {
            Ok(self.files.contains_key(path))
        }

        fn is_dir(&self, path: &str) -> io::Result<bool> {
            let prefix = format!("{path}/");
            Ok(self.files.keys().any(|key| key.starts_with(&prefix)))
        }

        fn file_count(&self, pattern: &str) -> io::Result<usize> {
            let pattern = glob::Pattern::new(pattern)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
            Ok(self.files.keys().filter(|key| pattern.matches(key)).count())
        }

        fn read_to_string(&self, path: &str) -> io::Result<String> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "not found"))
        }

        fn size(&self, path: &str) -> io::Result<u64> {
            Ok(self.read_to_string(path)?.len() as u64)
        }
    }

    fn tree() -> FakeTree {
        FakeTree::default()
            .with("src/lib.rs", "fn a() {}\nfn b() {}\n")
            .with("tests/test_a.py", "def test(): pass\n")
            .with("tests/test_b.py", "")
    }

    #[test]
    fn evaluates_filesystem_predicates() {
        let tree = tree();
        assert_eq!(evaluate(r#"exists("src/lib.rs")"#, &tree), Ok(true));
        assert_eq!(evaluate(r#"is_dir("tests") && !is_file("tests")"#, &tree), Ok(true));
        assert_eq!(evaluate(r#"file_count("tests/*.py") == 2"#, &tree), Ok(true));
        assert_eq!(evaluate(r#"line_count("src/lib.rs") < 2"#, &tree), Ok(false));
        assert_eq!(
            evaluate(r#"contains('src/lib.rs', "fn b") and not exists("setup.py")"#, &tree),
            Ok(true)
        );
    }

    #[test]
    fn respects_precedence() {
        let tree = tree();
        assert_eq!(evaluate("1 + 2 * 3 == 7", &tree), Ok(true));
        assert_eq!(evaluate("(1 + 2) * 3 == 9", &tree), Ok(true));
        assert_eq!(evaluate("10 - 4 - 3 == 3", &tree), Ok(true));
        assert_eq!(evaluate("true || false && false", &tree), Ok(true));
        assert_eq!(evaluate("-2 < 0", &tree), Ok(true));
    }

    #[test]
    fn deep_nesting_is_a_parse_error() {
        let tree = tree();
        let nested = format!("{}true{}", "(".repeat(200_000), ")".repeat(200_000));
        assert!(matches!(evaluate(&nested, &tree), Err(ExprError::Parse { .. })));
        let negations = format!("{}true", "!".repeat(200_000));
        assert!(matches!(parse(&negations), Err(ExprError::Parse { .. })));
        let chain = vec!["1"; 100_000].join(" + ");
        assert!(matches!(parse(&chain), Err(ExprError::Parse { .. })));

        let modest = format!("{}true{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(evaluate(&modest, &tree), Ok(true));
    }

    #[test]
    fn short_circuit_skips_failing_rhs() {
        let tree = tree();
        assert_eq!(
            evaluate(r#"exists("missing") && size("missing") > 0"#, &tree),
            Ok(false)
        );
    }

    #[test]
    fn runtime_errors_are_reported() {
        let tree = tree();
        assert_eq!(evaluate("1 / 0 == 0", &tree), Err(ExprError::DivisionByZero));
        assert!(matches!(
            evaluate(r#"size("missing") > 0"#, &tree),
            Err(ExprError::Io { .. })
        ));
        assert!(matches!(
            evaluate(r#"explode("x")"#, &tree),
            Err(ExprError::UnknownFunction(name)) if name == "explode"
        ));
        assert!(matches!(evaluate("1 + 1", &tree), Err(ExprError::Type(_))));
        assert!(matches!(evaluate(r#"1 == "1""#, &tree), Err(ExprError::Type(_))));
    }

    #[test]
    fn parse_errors_carry_offsets() {
        assert!(matches!(parse("exists(\"a\""), Err(ExprError::Parse { .. })));
        assert!(matches!(parse("1 +"), Err(ExprError::Parse { .. })));
        assert!(matches!(parse("'open"), Err(ExprError::Parse { offset: 0, .. })));
        assert!(matches!(parse("1 2"), Err(ExprError::Parse { offset: 2, .. })));
    }
}
