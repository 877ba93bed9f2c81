use crate::location::Location;
use std::fmt;

/// A lexeme with its source location.
#[derive(Clone, Debug, PartialEq)]
pub struct Lexeme {
    pub token: Token,
    pub location: Location,
}

/// All tokens of the supported Luau subset, trivia included.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Eof,

    // --- Keywords ---
    And,
    Break,
    Do,
    Else,
    ElseIf,
    End,
    False,
    For,
    Function,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,

    // --- Literals ---
    /// Raw number text; converted (and validated) by the parser.
    Number(String),
    /// Quoted string with escapes already processed.
    QuotedString(String),
    /// Long-bracket string.
    RawString(String),
    Name(String),

    // --- Punctuation ---
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Hash,
    Less,
    Greater,
    Assign,
    Equal,
    NotEqual,
    LessEq,
    GreaterEq,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Colon,
    Comma,
    Dot,
    DotDot,
    DotDotDot,

    // --- Trivia and malformed input ---
    /// `--` comment; holds the text after the dashes.
    Comment(String),
    BlockComment,
    /// Unterminated block comment.
    BrokenComment,
    /// Unterminated string.
    BrokenString,
    /// A byte that starts no token.
    Unknown(char),
}

impl Token {
    pub fn keyword_from_str(s: &str) -> Option<Token> {
        Some(match s {
            "and" => Token::And,
            "break" => Token::Break,
            "do" => Token::Do,
            "else" => Token::Else,
            "elseif" => Token::ElseIf,
            "end" => Token::End,
            "false" => Token::False,
            "for" => Token::For,
            "function" => Token::Function,
            "if" => Token::If,
            "in" => Token::In,
            "local" => Token::Local,
            "nil" => Token::Nil,
            "not" => Token::Not,
            "or" => Token::Or,
            "repeat" => Token::Repeat,
            "return" => Token::Return,
            "then" => Token::Then,
            "true" => Token::True,
            "until" => Token::Until,
            "while" => Token::While,
            _ => return None,
        })
    }

    pub fn is_comment(&self) -> bool {
        matches!(
            self,
            Token::Comment(_) | Token::BlockComment | Token::BrokenComment
        )
    }

    fn keyword_text(&self) -> Option<&'static str> {
        Some(match self {
            Token::And => "and",
            Token::Break => "break",
            Token::Do => "do",
            Token::Else => "else",
            Token::ElseIf => "elseif",
            Token::End => "end",
            Token::False => "false",
            Token::For => "for",
            Token::Function => "function",
            Token::If => "if",
            Token::In => "in",
            Token::Local => "local",
            Token::Nil => "nil",
            Token::Not => "not",
            Token::Or => "or",
            Token::Repeat => "repeat",
            Token::Return => "return",
            Token::Then => "then",
            Token::True => "true",
            Token::Until => "until",
            Token::While => "while",
            _ => return None,
        })
    }

    fn punct_text(&self) -> Option<&'static str> {
        Some(match self {
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Caret => "^",
            Token::Hash => "#",
            Token::Less => "<",
            Token::Greater => ">",
            Token::Assign => "=",
            Token::Equal => "==",
            Token::NotEqual => "~=",
            Token::LessEq => "<=",
            Token::GreaterEq => ">=",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Semi => ";",
            Token::Colon => ":",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::DotDot => "..",
            Token::DotDotDot => "...",
            _ => return None,
        })
    }
}

/// Diagnostic rendering: quoted source text where there is one.
impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(kw) = self.keyword_text() {
            return write!(f, "'{kw}'");
        }
        if let Some(p) = self.punct_text() {
            return write!(f, "'{p}'");
        }
        match self {
            Token::Eof => write!(f, "<eof>"),
            Token::Number(text) => write!(f, "'{text}'"),
            Token::QuotedString(s) | Token::RawString(s) => write!(f, "\"{s}\""),
            Token::Name(name) => write!(f, "'{name}'"),
            Token::Comment(_) | Token::BlockComment => write!(f, "comment"),
            Token::BrokenComment => write!(f, "unfinished comment"),
            Token::BrokenString => write!(f, "malformed string"),
            Token::Unknown(c) => write!(f, "'{c}'"),
            _ => write!(f, "<unknown>"),
        }
    }
}
