use crate::location::{Location, Position};
use crate::token::{Lexeme, Token};

/// Byte lexer. Never fails: malformed input becomes `BrokenString`,
/// `BrokenComment` or `Unknown` lexemes for the parser to report.
pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a [u8]) -> Self {
        Lexer {
            source,
            pos: 0,
            line: 0,
            column: 0,
        }
    }

    /// Lex the whole buffer. The last lexeme is always `Eof`.
    pub fn tokenize(source: &'a [u8]) -> Vec<Lexeme> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let lexeme = lexer.next_lexeme();
            let done = lexeme.token == Token::Eof;
            out.push(lexeme);
            if done {
                return out;
            }
        }
    }

    pub fn next_lexeme(&mut self) -> Lexeme {
        self.skip_whitespace();
        let begin = self.position();
        let token = self.scan();
        Lexeme {
            token,
            location: Location::new(begin, self.position()),
        }
    }

    fn position(&self) -> Position {
        Position::new(self.line, self.column)
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == b'\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if matches!(ch, b' ' | b'\t' | b'\n' | b'\r' | b'\x0B' | b'\x0C') {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn scan(&mut self) -> Token {
        let Some(ch) = self.peek() else {
            return Token::Eof;
        };
        match ch {
            b'-' if self.peek_at(1) == Some(b'-') => self.scan_comment(),
            b'"' | b'\'' => self.scan_quoted(ch),
            b'[' if self.long_bracket_level().is_some() => {
                match self.scan_long_bracket() {
                    Some(text) => Token::RawString(text),
                    None => Token::BrokenString,
                }
            }
            b'0'..=b'9' => self.scan_number(),
            b'.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.scan_number(),
            c if c.is_ascii_alphabetic() || c == b'_' => self.scan_name(),
            _ => self.scan_punct(),
        }
    }

    fn scan_punct(&mut self) -> Token {
        let ch = self.bump().unwrap_or(0);
        let next = self.peek();
        let two = |lexer: &mut Self, tok: Token| {
            lexer.bump();
            tok
        };
        match (ch, next) {
            (b'=', Some(b'=')) => two(self, Token::Equal),
            (b'~', Some(b'=')) => two(self, Token::NotEqual),
            (b'<', Some(b'=')) => two(self, Token::LessEq),
            (b'>', Some(b'=')) => two(self, Token::GreaterEq),
            (b'.', Some(b'.')) => {
                self.bump();
                if self.peek() == Some(b'.') {
                    self.bump();
                    Token::DotDotDot
                } else {
                    Token::DotDot
                }
            }
            (b'+', _) => Token::Plus,
            (b'-', _) => Token::Minus,
            (b'*', _) => Token::Star,
            (b'/', _) => Token::Slash,
            (b'%', _) => Token::Percent,
            (b'^', _) => Token::Caret,
            (b'#', _) => Token::Hash,
            (b'<', _) => Token::Less,
            (b'>', _) => Token::Greater,
            (b'=', _) => Token::Assign,
            (b'(', _) => Token::LParen,
            (b')', _) => Token::RParen,
            (b'{', _) => Token::LBrace,
            (b'}', _) => Token::RBrace,
            (b'[', _) => Token::LBracket,
            (b']', _) => Token::RBracket,
            (b';', _) => Token::Semi,
            (b':', _) => Token::Colon,
            (b',', _) => Token::Comma,
            (b'.', _) => Token::Dot,
            (c, _) => Token::Unknown(c as char),
        }
    }

    fn scan_comment(&mut self) -> Token {
        self.bump();
        self.bump();
        if self.long_bracket_level().is_some() {
            return match self.scan_long_bracket() {
                Some(_) => Token::BlockComment,
                None => Token::BrokenComment,
            };
        }
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch == b'\n' || ch == b'\r' {
                break;
            }
            self.bump();
        }
        Token::Comment(String::from_utf8_lossy(&self.source[start..self.pos]).into_owned())
    }

    /// `[=*[` at the cursor: its level.
    fn long_bracket_level(&self) -> Option<usize> {
        if self.peek() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        while self.peek_at(1 + level) == Some(b'=') {
            level += 1;
        }
        (self.peek_at(1 + level) == Some(b'[')).then_some(level)
    }

    /// Consume a long bracket. None when it is never closed.
    fn scan_long_bracket(&mut self) -> Option<String> {
        let level = self.long_bracket_level()?;
        for _ in 0..level + 2 {
            self.bump();
        }
        // a newline right after the opening bracket is skipped
        if self.peek() == Some(b'\n') {
            self.bump();
        }
        let start = self.pos;
        loop {
            match self.peek() {
                None => return None,
                Some(b']') => {
                    let mut n = 0;
                    while self.peek_at(1 + n) == Some(b'=') {
                        n += 1;
                    }
                    if n == level && self.peek_at(1 + n) == Some(b']') {
                        let text = String::from_utf8_lossy(&self.source[start..self.pos]).into_owned();
                        for _ in 0..level + 2 {
                            self.bump();
                        }
                        return Some(text);
                    }
                    self.bump();
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    fn scan_quoted(&mut self, quote: u8) -> Token {
        self.bump();
        let mut buf = Vec::new();
        loop {
            let Some(ch) = self.peek() else {
                return Token::BrokenString;
            };
            match ch {
                b'\n' | b'\r' => return Token::BrokenString,
                b'\\' => {
                    self.bump();
                    match self.bump() {
                        None => return Token::BrokenString,
                        Some(b'n') => buf.push(b'\n'),
                        Some(b't') => buf.push(b'\t'),
                        Some(b'r') => buf.push(b'\r'),
                        Some(b'a') => buf.push(0x07),
                        Some(b'b') => buf.push(0x08),
                        Some(b'f') => buf.push(0x0C),
                        Some(b'v') => buf.push(0x0B),
                        Some(b'\n') => buf.push(b'\n'),
                        Some(b'z') => self.skip_whitespace(),
                        Some(d) if d.is_ascii_digit() => {
                            let mut value = (d - b'0') as u32;
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(c) if c.is_ascii_digit() => {
                                        value = value * 10 + (c - b'0') as u32;
                                        self.bump();
                                    }
                                    _ => break,
                                }
                            }
                            buf.push(value.min(255) as u8);
                        }
                        Some(other) => buf.push(other),
                    }
                }
                c if c == quote => {
                    self.bump();
                    return Token::QuotedString(String::from_utf8_lossy(&buf).into_owned());
                }
                c => {
                    self.bump();
                    buf.push(c);
                }
            }
        }
    }

    /// Greedy number scan; validity is decided by the parser.
    fn scan_number(&mut self) -> Token {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() || ch == b'.' || ch == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            self.bump();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.bump();
            }
        }
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        Token::Number(String::from_utf8_lossy(&self.source[start..self.pos]).into_owned())
    }

    fn scan_name(&mut self) -> Token {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        let text = String::from_utf8_lossy(&self.source[start..self.pos]);
        Token::keyword_from_str(&text).unwrap_or_else(|| Token::Name(text.into_owned()))
    }
}

/// Convert number text to a value: decimal, `0x` hex and `0b` binary, with
/// `_` separators.
pub fn parse_number(text: &str) -> Option<f64> {
    let clean: String = text.chars().filter(|&c| c != '_').collect();
    if let Some(hex) = clean.strip_prefix("0x").or_else(|| clean.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    if let Some(bin) = clean.strip_prefix("0b").or_else(|| clean.strip_prefix("0B")) {
        return u64::from_str_radix(bin, 2).ok().map(|v| v as f64);
    }
    if !clean.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
        return None;
    }
    clean.parse::<f64>().ok()
}
