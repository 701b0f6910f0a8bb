mod hasher;
pub mod parser;
pub mod pretty;
pub mod tokenizer;

pub use hasher::{FormulaHasher, text_hash};
pub use parser::{
    AGGREGATE_FUNCTIONS, BinaryOp, Expr, ExprKind, ParseError, Parser, UnaryOp,
    is_aggregate_function, looks_like_collection_query, parse,
};
pub use pretty::pretty_print;
pub use tokenizer::{Token, TokenSubType, TokenType, Tokenizer, TokenizerError};

// Re-export common types
pub use synsor_common::{EngineError, EngineErrorKind, Scalar};
