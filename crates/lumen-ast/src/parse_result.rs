//! Parse results: accumulated errors, comments, hot comments and the CST side map.

use crate::ast::{ExprId, NodeId, StatId};
use crate::location::{Location, Position};
use indexmap::IndexMap;
use std::fmt;

/// Placeholder name given to identifiers synthesized during error recovery.
pub const K_PARSE_NAME_ERROR: &str = "%error-id%";

/// A located parse diagnostic.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ParseError {
    location: Location,
    message: String,
}

impl ParseError {
    pub fn new(location: Location, message: impl Into<String>) -> Self {
        ParseError {
            location,
            message: message.into(),
        }
    }

    /// Abort the current parse with a formatted error.
    pub fn raise<T>(location: Location, args: fmt::Arguments<'_>) -> Result<T, ParseError> {
        Err(ParseError::new(location, fmt::format(args)))
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A non-empty list of parse errors, reported as one failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ParseErrors {
    errors: Vec<ParseError>,
    message: String,
}

impl ParseErrors {
    /// None for an empty list.
    pub fn new(errors: Vec<ParseError>) -> Option<Self> {
        let message = match errors.as_slice() {
            [] => return None,
            [single] => single.message.clone(),
            many => format!("{} parse errors", many.len()),
        };
        Some(ParseErrors { errors, message })
    }

    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }
}

/// A `--!` comment directive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HotComment {
    /// Appeared before the first non-comment token.
    pub header: bool,
    pub location: Location,
    pub content: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommentKind {
    Comment,
    BlockComment,
    BrokenComment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Comment {
    pub kind: CommentKind,
    pub location: Location,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuoteStyle {
    Quoted,
    /// Long brackets.
    Raw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Separator {
    Comma,
    Semicolon,
}

/// Concrete-syntax details a plain tree drops.
#[derive(Clone, Debug, PartialEq)]
pub enum CstNode {
    /// Number exactly as written.
    ConstantNumber { text: String },
    ConstantString { quote: QuoteStyle },
    Call {
        open_parens: Option<Position>,
        close_parens: Option<Position>,
    },
    Table { separators: Vec<Option<(Separator, Position)>> },
    Local {
        var_commas: Vec<Position>,
        equals: Option<Position>,
        value_commas: Vec<Position>,
    },
}

pub type CstNodeMap = IndexMap<NodeId, CstNode>;

/// Result of parsing a chunk. Never a hard failure: errors accumulate here.
#[derive(Debug)]
pub struct ParseResult {
    pub root: StatId,
    pub lines: usize,
    pub hotcomments: Vec<HotComment>,
    pub errors: Vec<ParseError>,
    pub comment_locations: Vec<Comment>,
    pub cst_node_map: CstNodeMap,
}

impl ParseResult {
    /// All-or-nothing view: the result when error-free.
    pub fn into_strict(self) -> Result<ParseResult, ParseErrors> {
        match ParseErrors::new(self.errors.clone()) {
            Some(errors) => Err(errors),
            None => Ok(self),
        }
    }
}

/// Result of parsing a single expression.
#[derive(Debug)]
pub struct ParseExprResult {
    pub expr: ExprId,
    pub lines: usize,
    pub hotcomments: Vec<HotComment>,
    pub errors: Vec<ParseError>,
    pub comment_locations: Vec<Comment>,
    pub cst_node_map: CstNodeMap,
}

impl ParseExprResult {
    pub fn into_strict(self) -> Result<ParseExprResult, ParseErrors> {
        match ParseErrors::new(self.errors.clone()) {
            Some(errors) => Err(errors),
            None => Ok(self),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParseOptions {
    /// Record every comment's location in `comment_locations`.
    pub capture_comments: bool,
    /// Populate `cst_node_map`.
    pub store_cst_data: bool,
    pub recursion_limit: u32,
    pub error_limit: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            capture_comments: false,
            store_cst_data: false,
            recursion_limit: 1000,
            error_limit: 100,
        }
    }
}
