use std::convert::TryFrom;
use std::error::Error;
use std::fmt::{self, Display};

const TOKEN_ENDERS: &str = ",) +-*/%=<>!?:\n\t";

const fn build_token_enders() -> [bool; 256] {
    let mut tbl = [false; 256];
    let bytes = TOKEN_ENDERS.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        tbl[bytes[i] as usize] = true;
        i += 1;
    }
    tbl
}
static TOKEN_ENDERS_TABLE: [bool; 256] = build_token_enders();

#[inline(always)]
fn is_token_ender(c: u8) -> bool {
    TOKEN_ENDERS_TABLE[c as usize]
}

/// Represents operator associativity.
#[derive(Debug, PartialEq, Eq)]
pub enum Associativity {
    Left,
    Right,
}

/// A custom error type for the tokenizer.
#[derive(Debug)]
pub struct TokenizerError {
    pub message: String,
    pub pos: usize,
}

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenizerError: {}", self.message)
    }
}

impl Error for TokenizerError {}

/// The type of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Operand,
    Func,
    Paren,
    Sep,
    OpPrefix,
    OpInfix,
    /// Conditional punctuation and keywords: `?`, `:`, `if`, `else`.
    Cond,
    Whitespace,
}

impl Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The subtype of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenSubType {
    None,
    Text,
    Number,
    Logical,
    /// A bare or dotted identifier (`power`, `sensor.kitchen_power`).
    Ident,
    Open,
    Close,
    Arg,
}

impl Display for TokenSubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A token in a sensor formula.
#[derive(Debug, Clone, PartialEq, Hash)]
pub struct Token {
    pub value: String,
    pub token_type: TokenType,
    pub subtype: TokenSubType,
    pub start: usize,
    pub end: usize,
}

impl Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{} subtype: {:?} value: {}>",
            self.token_type, self.subtype, self.value
        )
    }
}

impl Token {
    pub fn new(value: String, token_type: TokenType, subtype: TokenSubType) -> Self {
        Token {
            value,
            token_type,
            subtype,
            start: 0,
            end: 0,
        }
    }

    fn from_slice(
        source: &str,
        token_type: TokenType,
        subtype: TokenSubType,
        start: usize,
        end: usize,
    ) -> Self {
        Token {
            value: source[start..end].to_string(),
            token_type,
            subtype,
            start,
            end,
        }
    }

    pub fn is_operator(&self) -> bool {
        matches!(self.token_type, TokenType::OpPrefix | TokenType::OpInfix)
    }

    /// Infix binding power. Higher binds tighter.
    pub fn get_precedence(&self) -> Option<(u8, Associativity)> {
        if self.token_type != TokenType::OpInfix {
            return None;
        }
        match self.value.as_str() {
            "or" => Some((1, Associativity::Left)),
            "and" => Some((2, Associativity::Left)),
            "==" | "!=" | "<" | "<=" | ">" | ">=" => Some((3, Associativity::Left)),
            "+" | "-" => Some((4, Associativity::Left)),
            "*" | "/" | "%" => Some((5, Associativity::Left)),
            _ => None,
        }
    }

    /// Classify an accumulated word: number, logical, keyword operator, or
    /// identifier (possibly dotted).
    fn make_word_from_slice(source: &str, start: usize, end: usize) -> Self {
        let value_str = &source[start..end];
        let (token_type, subtype) = match value_str {
            "true" | "false" => (TokenType::Operand, TokenSubType::Logical),
            "and" | "or" => (TokenType::OpInfix, TokenSubType::None),
            "not" => (TokenType::OpPrefix, TokenSubType::None),
            "if" | "else" => (TokenType::Cond, TokenSubType::None),
            _ if value_str.parse::<f64>().is_ok() => (TokenType::Operand, TokenSubType::Number),
            _ => (TokenType::Operand, TokenSubType::Ident),
        };
        Token::from_slice(source, token_type, subtype, start, end)
    }
}

/// A tokenizer for sensor formulas.
pub struct Tokenizer {
    formula: String,
    pub items: Vec<Token>,
    paren_stack: Vec<usize>, // byte offsets of unmatched openers
    offset: usize,
    token_start: usize,
    token_end: usize,
}

impl Tokenizer {
    /// Create a new tokenizer and immediately scan the formula.
    pub fn new(formula: &str) -> Result<Self, TokenizerError> {
        let mut tokenizer = Tokenizer {
            formula: formula.to_string(),
            items: Vec::with_capacity(formula.len() / 2),
            paren_stack: Vec::with_capacity(8),
            offset: 0,
            token_start: 0,
            token_end: 0,
        };
        tokenizer.scan()?;
        Ok(tokenizer)
    }

    #[inline]
    fn current_byte(&self) -> Option<u8> {
        self.formula.as_bytes().get(self.offset).copied()
    }

    #[inline]
    fn has_token(&self) -> bool {
        self.token_end > self.token_start
    }

    #[inline]
    fn start_token(&mut self) {
        self.token_start = self.offset;
        self.token_end = self.offset;
    }

    #[inline]
    fn extend_token(&mut self) {
        self.token_end = self.offset;
    }

    fn scan(&mut self) -> Result<(), TokenizerError> {
        if self.formula.is_empty() {
            return Err(TokenizerError {
                message: "Empty formula".to_string(),
                pos: 0,
            });
        }

        self.start_token();

        while self.offset < self.formula.len() {
            if self.check_scientific_notation() {
                continue;
            }

            let curr_byte = self.formula.as_bytes()[self.offset];

            if is_token_ender(curr_byte) && self.has_token() {
                self.save_token();
                self.start_token();
            }

            match curr_byte {
                b'"' | b'\'' => self.parse_string()?,
                b' ' | b'\n' | b'\t' => self.parse_whitespace(),
                b'+' | b'-' | b'*' | b'/' | b'%' | b'=' | b'>' | b'<' | b'!' => {
                    self.parse_operator()?
                }
                b'?' | b':' => self.parse_cond_punct(),
                b'(' => self.parse_opener(),
                b')' => self.parse_closer()?,
                b',' => self.parse_separator()?,
                _ => {
                    if !self.has_token() {
                        self.start_token();
                    }
                    self.offset += 1;
                    self.extend_token();
                }
            }
        }

        if self.has_token() {
            self.save_token();
        }

        if let Some(pos) = self.paren_stack.pop() {
            return Err(TokenizerError {
                message: "Unmatched opening parenthesis".to_string(),
                pos,
            });
        }

        Ok(())
    }

    /// If the current token looks like a number in scientific notation,
    /// consume the '+' or '-' as part of the number.
    fn check_scientific_notation(&mut self) -> bool {
        if let Some(curr_byte) = self.current_byte() {
            if (curr_byte == b'+' || curr_byte == b'-')
                && self.has_token()
                && self.is_scientific_notation_base()
            {
                self.offset += 1;
                self.extend_token();
                return true;
            }
        }
        false
    }

    /// Whether the accumulated token is the base of a scientific-notation
    /// number (e.g. "1.23E" or "9e").
    fn is_scientific_notation_base(&self) -> bool {
        let token_slice = &self.formula.as_bytes()[self.token_start..self.token_end];
        if token_slice.len() < 2 {
            return false;
        }

        let last = token_slice[token_slice.len() - 1];
        if !(last == b'E' || last == b'e') {
            return false;
        }

        let first = token_slice[0];
        if !first.is_ascii_digit() {
            return false;
        }

        let mut dot_seen = false;
        for &ch in &token_slice[1..token_slice.len() - 1] {
            match ch {
                b'0'..=b'9' => {}
                b'.' if !dot_seen => dot_seen = true,
                _ => return false,
            }
        }
        true
    }

    /// Convert the accumulated word into a token and add it to the list.
    fn save_token(&mut self) {
        if self.has_token() {
            let token =
                Token::make_word_from_slice(&self.formula, self.token_start, self.token_end);
            self.items.push(token);
        }
    }

    /// Parse a quoted string literal. Doubled quotes escape the delimiter.
    fn parse_string(&mut self) -> Result<(), TokenizerError> {
        let delim = self.formula.as_bytes()[self.offset];

        if self.has_token() {
            self.save_token();
        }

        let string_start = self.offset;
        self.offset += 1;

        while self.offset < self.formula.len() {
            if self.formula.as_bytes()[self.offset] == delim {
                self.offset += 1;
                if self.offset < self.formula.len() && self.formula.as_bytes()[self.offset] == delim
                {
                    self.offset += 1; // escaped quote
                } else {
                    self.items.push(Token::from_slice(
                        &self.formula,
                        TokenType::Operand,
                        TokenSubType::Text,
                        string_start,
                        self.offset,
                    ));
                    self.start_token();
                    return Ok(());
                }
            } else {
                self.offset += 1;
            }
        }

        Err(TokenizerError {
            message: "Reached end of formula while parsing string".to_string(),
            pos: self.offset,
        })
    }

    fn parse_whitespace(&mut self) {
        self.save_token();

        let ws_start = self.offset;
        while self.offset < self.formula.len() {
            match self.formula.as_bytes()[self.offset] {
                b' ' | b'\n' | b'\t' => self.offset += 1,
                _ => break,
            }
        }

        self.items.push(Token::from_slice(
            &self.formula,
            TokenType::Whitespace,
            TokenSubType::None,
            ws_start,
            self.offset,
        ));
        self.start_token();
    }

    fn parse_operator(&mut self) -> Result<(), TokenizerError> {
        self.save_token();

        // Two-character operators first.
        if self.offset + 1 < self.formula.len() {
            let two_char = &self.formula.as_bytes()[self.offset..self.offset + 2];
            if two_char == b">=" || two_char == b"<=" || two_char == b"==" || two_char == b"!=" {
                self.items.push(Token::from_slice(
                    &self.formula,
                    TokenType::OpInfix,
                    TokenSubType::None,
                    self.offset,
                    self.offset + 2,
                ));
                self.offset += 2;
                self.start_token();
                return Ok(());
            }
        }

        let curr_byte = self.formula.as_bytes()[self.offset];
        let token_type = match curr_byte {
            b'=' | b'!' => {
                return Err(TokenizerError {
                    message: format!("Unexpected '{}' (did you mean a comparison?)", curr_byte as char),
                    pos: self.offset,
                });
            }
            b'+' | b'-' => {
                // Prefix when there is no preceding operand to bind to.
                let prev = self
                    .items
                    .iter()
                    .rev()
                    .find(|t| t.token_type != TokenType::Whitespace);
                match prev {
                    Some(p)
                        if p.token_type == TokenType::Operand
                            || p.subtype == TokenSubType::Close =>
                    {
                        TokenType::OpInfix
                    }
                    _ => TokenType::OpPrefix,
                }
            }
            _ => TokenType::OpInfix,
        };

        self.items.push(Token::from_slice(
            &self.formula,
            token_type,
            TokenSubType::None,
            self.offset,
            self.offset + 1,
        ));
        self.offset += 1;
        self.start_token();
        Ok(())
    }

    fn parse_cond_punct(&mut self) {
        self.save_token();
        self.items.push(Token::from_slice(
            &self.formula,
            TokenType::Cond,
            TokenSubType::None,
            self.offset,
            self.offset + 1,
        ));
        self.offset += 1;
        self.start_token();
    }

    fn parse_opener(&mut self) {
        let token = if self.has_token() {
            // Accumulated word directly before '(' makes this a call.
            let token = Token::from_slice(
                &self.formula,
                TokenType::Func,
                TokenSubType::Open,
                self.token_start,
                self.offset + 1,
            );
            self.token_start = self.offset + 1;
            self.token_end = self.offset + 1;
            token
        } else {
            Token::from_slice(
                &self.formula,
                TokenType::Paren,
                TokenSubType::Open,
                self.offset,
                self.offset + 1,
            )
        };

        self.items.push(token);
        self.paren_stack.push(self.offset);
        self.offset += 1;
        self.start_token();
    }

    fn parse_closer(&mut self) -> Result<(), TokenizerError> {
        self.save_token();

        if self.paren_stack.pop().is_none() {
            return Err(TokenizerError {
                message: format!("No matching opener for closer at position {}", self.offset),
                pos: self.offset,
            });
        }

        // Close with the same token type the opener used so the parser can
        // tell call ends from group ends.
        let mut depth = 0i32;
        let mut opener_type = TokenType::Paren;
        for t in self.items.iter().rev() {
            match t.subtype {
                TokenSubType::Close => depth += 1,
                TokenSubType::Open => {
                    if depth == 0 {
                        opener_type = t.token_type;
                        break;
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }

        self.items.push(Token::from_slice(
            &self.formula,
            opener_type,
            TokenSubType::Close,
            self.offset,
            self.offset + 1,
        ));

        self.offset += 1;
        self.start_token();
        Ok(())
    }

    fn parse_separator(&mut self) -> Result<(), TokenizerError> {
        self.save_token();

        if self.paren_stack.is_empty() {
            return Err(TokenizerError {
                message: "Argument separator outside a call".to_string(),
                pos: self.offset,
            });
        }

        self.items.push(Token::from_slice(
            &self.formula,
            TokenType::Sep,
            TokenSubType::Arg,
            self.offset,
            self.offset + 1,
        ));

        self.offset += 1;
        self.start_token();
        Ok(())
    }

    /// Reconstruct the formula from the scanned tokens.
    pub fn render(&self) -> String {
        self.items.iter().map(|t| t.value.clone()).collect()
    }
}

impl TryFrom<&str> for Tokenizer {
    type Error = TokenizerError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Tokenizer::new(value)
    }
}
