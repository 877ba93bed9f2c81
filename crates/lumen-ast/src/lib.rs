//! Source locations, lexer, syntax tree arena and the error-recovering parser.

pub mod ast;
pub mod lexer;
pub mod location;
pub mod parse_result;
pub mod parser;
pub mod token;

pub use parse_result::{ParseError, ParseErrors, ParseExprResult, ParseOptions, ParseResult};
pub use parser::Parser;
