use crate::hasher::FormulaHasher;
use crate::tokenizer::{Associativity, Token, TokenSubType, TokenType, Tokenizer, TokenizerError};
use once_cell::sync::Lazy;
use std::error::Error;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

use synsor_common::{EngineError, Scalar};

/// A custom error type for the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub position: Option<usize>,
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(pos) = self.position {
            write!(f, "ParseError at position {}: {}", pos, self.message)
        } else {
            write!(f, "ParseError: {}", self.message)
        }
    }
}

impl Error for ParseError {}

impl From<TokenizerError> for ParseError {
    fn from(e: TokenizerError) -> Self {
        ParseError {
            message: e.message,
            position: Some(e.pos),
        }
    }
}

impl From<ParseError> for EngineError {
    fn from(e: ParseError) -> Self {
        EngineError::parse_at(e.position.unwrap_or(0), e.message)
    }
}

/// Binary operators, in the closed set the grammar accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    fn from_token(value: &str) -> Option<Self> {
        Some(match value {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Mod,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "and" => BinaryOp::And,
            "or" => BinaryOp::Or,
            _ => return None,
        })
    }

    /// Binding power used by the pretty-printer; mirrors the tokenizer's
    /// precedence table.
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt
            | BinaryOp::Ge => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 5,
        }
    }
}

impl Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

impl UnaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
            UnaryOp::Not => "not",
        }
    }
}

impl Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The different kinds of AST nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Scalar),
    /// A free name (`state`, `base_power`). Dotted identifiers become
    /// `MemberAccess` chains over a root `Name`.
    Name(String),
    MemberAccess {
        receiver: Box<Expr>,
        attr: String,
    },
    Call {
        function: String,
        args: Vec<Expr>,
    },
    BinaryOp {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Conditional {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    /// Raw collection-query string; parsed later by the query engine.
    CollectionQuery(String),
}

/// An AST node. Trees are immutable and shareable across cycles.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub source_token: Option<Token>,
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        // Source spans are provenance, not identity.
        self.kind == other.kind
    }
}

impl Eq for Expr {}

impl Expr {
    pub fn new(kind: ExprKind, source_token: Option<Token>) -> Self {
        Expr { kind, source_token }
    }

    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FormulaHasher::new();
        self.hash_node(&mut hasher);
        hasher.finish()
    }

    fn hash_node(&self, hasher: &mut FormulaHasher) {
        match &self.kind {
            ExprKind::Literal(value) => {
                hasher.write(&[1]);
                value.hash(hasher);
            }
            ExprKind::Name(name) => {
                hasher.write(&[2]);
                hasher.write(name.as_bytes());
            }
            ExprKind::MemberAccess { receiver, attr } => {
                hasher.write(&[3]);
                receiver.hash_node(hasher);
                hasher.write(attr.as_bytes());
            }
            ExprKind::Call { function, args } => {
                hasher.write(&[4]);
                hasher.write(function.to_ascii_lowercase().as_bytes());
                hasher.write_usize(args.len());
                for arg in args {
                    arg.hash_node(hasher);
                }
            }
            ExprKind::BinaryOp { op, lhs, rhs } => {
                hasher.write(&[5]);
                hasher.write(op.as_str().as_bytes());
                lhs.hash_node(hasher);
                rhs.hash_node(hasher);
            }
            ExprKind::UnaryOp { op, operand } => {
                hasher.write(&[6]);
                hasher.write(op.as_str().as_bytes());
                operand.hash_node(hasher);
            }
            ExprKind::Conditional {
                cond,
                then_branch,
                else_branch,
            } => {
                hasher.write(&[7]);
                cond.hash_node(hasher);
                then_branch.hash_node(hasher);
                else_branch.hash_node(hasher);
            }
            ExprKind::CollectionQuery(q) => {
                hasher.write(&[8]);
                hasher.write(q.as_bytes());
            }
        }
    }

    /// Visit every node pre-order without allocating intermediates.
    pub fn walk<'a, V: FnMut(&'a Expr)>(&'a self, mut visitor: V) {
        let mut stack: smallvec::SmallVec<[&Expr; 8]> = smallvec::smallvec![self];
        while let Some(node) = stack.pop() {
            visitor(node);
            match &node.kind {
                ExprKind::MemberAccess { receiver, .. } => stack.push(receiver),
                ExprKind::Call { args, .. } => {
                    for a in args.iter().rev() {
                        stack.push(a);
                    }
                }
                ExprKind::BinaryOp { lhs, rhs, .. } => {
                    stack.push(rhs);
                    stack.push(lhs);
                }
                ExprKind::UnaryOp { operand, .. } => stack.push(operand),
                ExprKind::Conditional {
                    cond,
                    then_branch,
                    else_branch,
                } => {
                    stack.push(else_branch);
                    stack.push(then_branch);
                    stack.push(cond);
                }
                ExprKind::Literal(_) | ExprKind::Name(_) | ExprKind::CollectionQuery(_) => {}
            }
        }
    }

    /// A member-access chain flattened to its dotted text, when the chain
    /// roots in a plain name (`a.b.c` → `Some("a.b.c")`).
    pub fn dotted_name(&self) -> Option<String> {
        match &self.kind {
            ExprKind::Name(n) => Some(n.clone()),
            ExprKind::MemberAccess { receiver, attr } => {
                receiver.dotted_name().map(|base| format!("{base}.{attr}"))
            }
            _ => None,
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::pretty::pretty_print(self))
    }
}

impl std::hash::Hash for Expr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.fingerprint());
    }
}

/// Aggregate call names whose string argument may be a collection query.
pub const AGGREGATE_FUNCTIONS: &[&str] = &["sum", "avg", "mean", "count", "min", "max", "std", "var"];

static AGGREGATE_SET: Lazy<std::collections::HashSet<&'static str>> =
    Lazy::new(|| AGGREGATE_FUNCTIONS.iter().copied().collect());

/// Whether a call name dispatches to the collection aggregate path.
pub fn is_aggregate_function(name: &str) -> bool {
    AGGREGATE_SET.contains(name.to_ascii_lowercase().as_str())
}

/// Whether a string literal has the `pattern:tokens` or `state OP value`
/// shape of a collection query.
pub fn looks_like_collection_query(s: &str) -> bool {
    let mut words = s.split_whitespace();
    let Some(first) = words.next() else {
        return false;
    };
    if let Some((pattern, rest)) = first.split_once(':') {
        !pattern.is_empty()
            && !rest.is_empty()
            && pattern
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b == b'_')
    } else {
        // `state == on`, `state < 20`
        first == "state" && words.next().is_some()
    }
}

/// A parser converting tokens into an AST.
pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        let filtered_tokens = tokens
            .into_iter()
            .filter(|t| t.token_type != TokenType::Whitespace)
            .collect();
        Parser {
            tokens: filtered_tokens,
            position: 0,
        }
    }

    /// Parse the tokens into an AST.
    pub fn parse(&mut self) -> Result<Expr, ParseError> {
        if self.tokens.is_empty() {
            return Err(ParseError {
                message: "No tokens to parse".to_string(),
                position: None,
            });
        }

        let ast = self.parse_expression()?;
        if self.position < self.tokens.len() {
            return Err(ParseError {
                message: format!(
                    "Unexpected token '{}'",
                    self.tokens[self.position].value
                ),
                position: Some(self.tokens[self.position].start),
            });
        }
        Ok(ast)
    }

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_conditional()
    }

    /// Both conditional spellings are accepted and produce the same node:
    /// `cond ? a : b` and `a if cond else b`.
    fn parse_conditional(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_binary_op(1)?;

        match self.peek_cond() {
            Some("?") => {
                let tok = self.advance();
                let then_branch = self.parse_conditional()?;
                self.expect_cond(":")?;
                let else_branch = self.parse_conditional()?;
                Ok(Expr::new(
                    ExprKind::Conditional {
                        cond: Box::new(first),
                        then_branch: Box::new(then_branch),
                        else_branch: Box::new(else_branch),
                    },
                    Some(tok),
                ))
            }
            Some("if") => {
                let tok = self.advance();
                let cond = self.parse_binary_op(1)?;
                self.expect_cond("else")?;
                let else_branch = self.parse_conditional()?;
                Ok(Expr::new(
                    ExprKind::Conditional {
                        cond: Box::new(cond),
                        then_branch: Box::new(first),
                        else_branch: Box::new(else_branch),
                    },
                    Some(tok),
                ))
            }
            _ => Ok(first),
        }
    }

    fn parse_binary_op(&mut self, min_precedence: u8) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary_op()?;

        while self.position < self.tokens.len() {
            let token = &self.tokens[self.position];
            if token.token_type != TokenType::OpInfix {
                break;
            }

            let (precedence, associativity) =
                token.get_precedence().unwrap_or((0, Associativity::Left));
            if precedence < min_precedence {
                break;
            }

            let op_token = self.advance();
            let op = BinaryOp::from_token(&op_token.value).ok_or_else(|| ParseError {
                message: format!("Unknown operator '{}'", op_token.value),
                position: Some(op_token.start),
            })?;

            let next_min_precedence = if associativity == Associativity::Left {
                precedence + 1
            } else {
                precedence
            };

            let right = self.parse_binary_op(next_min_precedence)?;
            left = Expr::new(
                ExprKind::BinaryOp {
                    op,
                    lhs: Box::new(left),
                    rhs: Box::new(right),
                },
                Some(op_token),
            );
        }

        Ok(left)
    }

    fn parse_unary_op(&mut self) -> Result<Expr, ParseError> {
        if self.position < self.tokens.len()
            && self.tokens[self.position].token_type == TokenType::OpPrefix
        {
            let op_token = self.advance();
            let op = match op_token.value.as_str() {
                "-" => UnaryOp::Neg,
                "+" => UnaryOp::Pos,
                "not" => UnaryOp::Not,
                other => {
                    return Err(ParseError {
                        message: format!("Unknown prefix operator '{other}'"),
                        position: Some(op_token.start),
                    });
                }
            };
            let operand = self.parse_unary_op()?;
            return Ok(Expr::new(
                ExprKind::UnaryOp {
                    op,
                    operand: Box::new(operand),
                },
                Some(op_token),
            ));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        if self.position >= self.tokens.len() {
            return Err(ParseError {
                message: "Unexpected end of formula".to_string(),
                position: self.tokens.last().map(|t| t.end),
            });
        }

        let token = &self.tokens[self.position];
        match token.token_type {
            TokenType::Operand => {
                let operand_token = self.advance();
                self.parse_operand(operand_token)
            }
            TokenType::Func if token.subtype == TokenSubType::Open => {
                let func_token = self.advance();
                self.parse_call(func_token)
            }
            TokenType::Paren if token.subtype == TokenSubType::Open => {
                self.position += 1;
                let expr = self.parse_expression()?;
                if self.position >= self.tokens.len()
                    || self.tokens[self.position].token_type != TokenType::Paren
                    || self.tokens[self.position].subtype != TokenSubType::Close
                {
                    return Err(ParseError {
                        message: "Expected closing parenthesis".to_string(),
                        position: self.tokens.get(self.position).map(|t| t.start),
                    });
                }
                self.position += 1;
                Ok(expr)
            }
            _ => Err(ParseError {
                message: format!("Unexpected token '{}'", token.value),
                position: Some(token.start),
            }),
        }
    }

    fn parse_operand(&mut self, token: Token) -> Result<Expr, ParseError> {
        match token.subtype {
            TokenSubType::Number => {
                // Decimal-free integer literals stay integral; everything
                // else is IEEE 754 f64.
                let kind = if !token.value.contains(['.', 'e', 'E']) {
                    match token.value.parse::<i64>() {
                        Ok(i) => ExprKind::Literal(Scalar::Int(i)),
                        Err(_) => {
                            let n = token.value.parse::<f64>().map_err(|_| ParseError {
                                message: format!("Invalid number: {}", token.value),
                                position: Some(token.start),
                            })?;
                            ExprKind::Literal(Scalar::Number(n))
                        }
                    }
                } else {
                    let n = token.value.parse::<f64>().map_err(|_| ParseError {
                        message: format!("Invalid number: {}", token.value),
                        position: Some(token.start),
                    })?;
                    ExprKind::Literal(Scalar::Number(n))
                };
                Ok(Expr::new(kind, Some(token)))
            }
            TokenSubType::Text => {
                let raw = &token.value;
                let delim = raw.as_bytes()[0] as char;
                let inner = &raw[1..raw.len() - 1];
                let text = inner.replace(&format!("{delim}{delim}"), &delim.to_string());
                Ok(Expr::new(
                    ExprKind::Literal(Scalar::Text(text)),
                    Some(token),
                ))
            }
            TokenSubType::Logical => {
                let value = token.value == "true";
                Ok(Expr::new(
                    ExprKind::Literal(Scalar::Boolean(value)),
                    Some(token),
                ))
            }
            TokenSubType::Ident => {
                let expr = Self::name_to_expr(&token.value, &token)?;
                Ok(expr)
            }
            _ => Err(ParseError {
                message: format!("Unexpected operand subtype: {:?}", token.subtype),
                position: Some(token.start),
            }),
        }
    }

    /// Split a dotted identifier into a `Name` root wrapped in
    /// `MemberAccess` nodes: `a.b.c` → `MemberAccess(MemberAccess(a, b), c)`.
    fn name_to_expr(value: &str, token: &Token) -> Result<Expr, ParseError> {
        let mut segments = value.split('.');
        let root = segments.next().unwrap();
        if root.is_empty() {
            return Err(ParseError {
                message: format!("Invalid identifier '{value}'"),
                position: Some(token.start),
            });
        }
        let mut expr = Expr::new(ExprKind::Name(root.to_string()), Some(token.clone()));
        for seg in segments {
            if seg.is_empty() {
                return Err(ParseError {
                    message: format!("Invalid identifier '{value}'"),
                    position: Some(token.start),
                });
            }
            expr = Expr::new(
                ExprKind::MemberAccess {
                    receiver: Box::new(expr),
                    attr: seg.to_string(),
                },
                Some(token.clone()),
            );
        }
        Ok(expr)
    }

    fn parse_call(&mut self, func_token: Token) -> Result<Expr, ParseError> {
        let name = func_token.value[..func_token.value.len() - 1].to_string();
        let mut args = self.parse_call_arguments()?;

        // Aggregate calls over a query-shaped string literal take the
        // collection path; the raw query is kept verbatim for the engine.
        if is_aggregate_function(&name) {
            for arg in &mut args {
                if let ExprKind::Literal(Scalar::Text(s)) = &arg.kind {
                    if looks_like_collection_query(s) {
                        arg.kind = ExprKind::CollectionQuery(s.clone());
                    }
                }
            }
        }

        Ok(Expr::new(
            ExprKind::Call {
                function: name,
                args,
            },
            Some(func_token),
        ))
    }

    fn parse_call_arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();

        if self.at_call_close() {
            self.position += 1;
            return Ok(args);
        }

        args.push(self.parse_expression()?);

        while self.position < self.tokens.len() {
            let token = &self.tokens[self.position];
            if token.token_type == TokenType::Sep && token.subtype == TokenSubType::Arg {
                self.position += 1;
                args.push(self.parse_expression()?);
            } else if self.at_call_close() {
                self.position += 1;
                return Ok(args);
            } else {
                return Err(ParseError {
                    message: format!("Expected ',' or ')' but found '{}'", token.value),
                    position: Some(token.start),
                });
            }
        }

        Err(ParseError {
            message: "Unterminated argument list".to_string(),
            position: self.tokens.last().map(|t| t.end),
        })
    }

    fn at_call_close(&self) -> bool {
        self.tokens
            .get(self.position)
            .map(|t| t.token_type == TokenType::Func && t.subtype == TokenSubType::Close)
            .unwrap_or(false)
    }

    fn peek_cond(&self) -> Option<&str> {
        self.tokens.get(self.position).and_then(|t| {
            (t.token_type == TokenType::Cond).then_some(t.value.as_str())
        })
    }

    fn expect_cond(&mut self, value: &str) -> Result<(), ParseError> {
        if self.peek_cond() == Some(value) {
            self.position += 1;
            Ok(())
        } else {
            Err(ParseError {
                message: format!("Expected '{value}'"),
                position: self.tokens.get(self.position).map(|t| t.start),
            })
        }
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.position].clone();
        self.position += 1;
        token
    }
}

/// Parse a formula string to an AST.
pub fn parse(formula: &str) -> Result<Expr, ParseError> {
    let tokenizer = Tokenizer::new(formula)?;
    Parser::new(tokenizer.items).parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_mul_before_add() {
        let ast = parse("1 + 2 * 3").unwrap();
        match &ast.kind {
            ExprKind::BinaryOp { op, rhs, .. } => {
                assert_eq!(*op, BinaryOp::Add);
                assert!(matches!(
                    rhs.kind,
                    ExprKind::BinaryOp {
                        op: BinaryOp::Mul,
                        ..
                    }
                ));
            }
            other => panic!("expected BinaryOp, got {other:?}"),
        }
    }

    #[test]
    fn comparisons_bind_looser_than_arithmetic() {
        let ast = parse("state + 1 > limit * 2").unwrap();
        assert!(matches!(
            ast.kind,
            ExprKind::BinaryOp {
                op: BinaryOp::Gt,
                ..
            }
        ));
    }

    #[test]
    fn both_conditional_forms_agree() {
        let a = parse("state > 0 ? state : 0").unwrap();
        let b = parse("state if state > 0 else 0").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn dotted_name_builds_member_access() {
        let ast = parse("sensor.kitchen_power * 2").unwrap();
        let ExprKind::BinaryOp { lhs, .. } = &ast.kind else {
            panic!("expected BinaryOp");
        };
        assert_eq!(lhs.dotted_name().as_deref(), Some("sensor.kitchen_power"));
        assert!(matches!(lhs.kind, ExprKind::MemberAccess { .. }));
    }

    #[test]
    fn aggregate_string_argument_becomes_collection_query() {
        let ast = parse("count(\"device_class:door|window\")").unwrap();
        let ExprKind::Call { function, args } = &ast.kind else {
            panic!("expected Call");
        };
        assert_eq!(function, "count");
        assert_eq!(
            args[0].kind,
            ExprKind::CollectionQuery("device_class:door|window".to_string())
        );
    }

    #[test]
    fn plain_string_argument_stays_literal() {
        let ast = parse("min(\"abc\", \"abd\")").unwrap();
        let ExprKind::Call { args, .. } = &ast.kind else {
            panic!("expected Call");
        };
        assert_eq!(args[0].kind, ExprKind::Literal(Scalar::Text("abc".into())));
    }

    #[test]
    fn integer_literals_stay_integral() {
        assert_eq!(
            parse("24").unwrap().kind,
            ExprKind::Literal(Scalar::Int(24))
        );
        assert_eq!(
            parse("2.5").unwrap().kind,
            ExprKind::Literal(Scalar::Number(2.5))
        );
        assert_eq!(
            parse("1e3").unwrap().kind,
            ExprKind::Literal(Scalar::Number(1000.0))
        );
    }

    #[test]
    fn logical_keywords_parse() {
        let ast = parse("a and not b or c").unwrap();
        assert!(matches!(
            ast.kind,
            ExprKind::BinaryOp {
                op: BinaryOp::Or,
                ..
            }
        ));
    }

    #[test]
    fn parse_is_deterministic() {
        let a = parse("min(state, 10) + avg(a, b)").unwrap();
        let b = parse("min(state, 10) + avg(a, b)").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn errors_carry_position() {
        let err = parse("1 + + ").unwrap_err();
        assert!(err.position.is_some());
        let err = parse("min(1, 2").unwrap_err();
        assert!(err.position.is_some());
    }

    #[test]
    fn trailing_garbage_rejected() {
        assert!(parse("1 2").is_err());
    }
}
