//! Error-recovering recursive-descent parser.
//!
//! Errors accumulate in the result; only the recursion and error limits abort a
//! parse early. Recovery nodes (`ExprKind::Error`, `StatKind::Error`) keep the
//! tree well-formed around every reported error.

use crate::ast::*;
use crate::lexer::{parse_number, Lexer};
use crate::location::{Location, Position};
use crate::parse_result::*;
use crate::token::{Lexeme, Token};
use tracing::debug;

type PResult<T> = Result<T, ParseError>;

/// An opening token remembered for "to close" diagnostics.
#[derive(Clone, Debug)]
struct MatchLexeme {
    token: Token,
    position: Position,
}

impl MatchLexeme {
    fn of(lexeme: &Lexeme) -> Self {
        MatchLexeme {
            token: lexeme.token.clone(),
            position: lexeme.location.begin,
        }
    }
}

#[derive(Clone, Copy)]
struct FunctionState {
    vararg: bool,
    loop_depth: u32,
}

/// Closing tokens that stop a search for a missing delimiter.
const STOP_TOKENS: [Token; 4] = [Token::RParen, Token::RBracket, Token::RBrace, Token::End];

static EOF_TOKEN: Token = Token::Eof;

pub struct Parser<'a> {
    lexemes: Vec<Lexeme>,
    pos: usize,
    prev_location: Location,
    source_len: usize,
    ends_with_newline: bool,
    arena: &'a mut AstArena,
    options: &'a ParseOptions,
    errors: Vec<ParseError>,
    hotcomments: Vec<HotComment>,
    hotcomment_header: bool,
    comment_locations: Vec<Comment>,
    cst: CstNodeMap,
    recursion: u32,
    stop_counts: [u32; 4],
    functions: Vec<FunctionState>,
}

impl<'a> Parser<'a> {
    fn new(source: &str, arena: &'a mut AstArena, options: &'a ParseOptions) -> Self {
        let mut parser = Parser {
            lexemes: Lexer::tokenize(source.as_bytes()),
            pos: 0,
            prev_location: Location::default(),
            source_len: source.len(),
            ends_with_newline: source.ends_with('\n'),
            arena,
            options,
            errors: Vec::new(),
            hotcomments: Vec::new(),
            hotcomment_header: true,
            comment_locations: Vec::new(),
            cst: CstNodeMap::new(),
            recursion: 0,
            stop_counts: [0; 4],
            functions: vec![FunctionState {
                vararg: true,
                loop_depth: 0,
            }],
        };
        parser.skip_comments();
        // hot comments after the first real token are not header directives
        parser.hotcomment_header = false;
        parser
    }

    /// Parse a chunk. Never fails; see `ParseResult::errors`.
    pub fn parse(source: &str, arena: &'a mut AstArena, options: &'a ParseOptions) -> ParseResult {
        let mut p = Parser::new(source, arena, options);
        let result = match p.parse_chunk() {
            Ok(root) => ParseResult {
                root,
                lines: p.line_count(),
                hotcomments: std::mem::take(&mut p.hotcomments),
                errors: std::mem::take(&mut p.errors),
                comment_locations: std::mem::take(&mut p.comment_locations),
                cst_node_map: std::mem::take(&mut p.cst),
            },
            Err(fatal) => {
                p.errors.push(fatal);
                let root = p.arena.alloc_stat(StatKind::Block(Vec::new()), Location::default());
                ParseResult {
                    root,
                    lines: 0,
                    hotcomments: Vec::new(),
                    errors: std::mem::take(&mut p.errors),
                    comment_locations: Vec::new(),
                    cst_node_map: CstNodeMap::new(),
                }
            }
        };
        debug!(
            target: "lumen::ast::parser",
            lines = result.lines,
            errors = result.errors.len(),
            comments = result.comment_locations.len(),
            "parsed chunk"
        );
        result
    }

    /// Parse a single expression.
    pub fn parse_expr(
        source: &str,
        arena: &'a mut AstArena,
        options: &'a ParseOptions,
    ) -> ParseExprResult {
        let mut p = Parser::new(source, arena, options);
        let parsed = p.parse_expression().and_then(|expr| {
            if p.current().token != Token::Eof {
                p.expect_and_consume_fail(&Token::Eof, None)?;
            }
            Ok(expr)
        });
        match parsed {
            Ok(expr) => ParseExprResult {
                expr,
                lines: p.line_count(),
                hotcomments: std::mem::take(&mut p.hotcomments),
                errors: std::mem::take(&mut p.errors),
                comment_locations: std::mem::take(&mut p.comment_locations),
                cst_node_map: std::mem::take(&mut p.cst),
            },
            Err(fatal) => {
                p.errors.push(fatal);
                let message_index = p.errors.len() - 1;
                let expr = p.arena.alloc_expr(
                    ExprKind::Error {
                        exprs: Vec::new(),
                        message_index,
                    },
                    Location::default(),
                );
                ParseExprResult {
                    expr,
                    lines: 0,
                    hotcomments: Vec::new(),
                    errors: std::mem::take(&mut p.errors),
                    comment_locations: Vec::new(),
                    cst_node_map: CstNodeMap::new(),
                }
            }
        }
    }

    fn line_count(&self) -> usize {
        let eof_line = self.current().location.end.line as usize;
        eof_line + usize::from(self.source_len > 0 && !self.ends_with_newline)
    }

    // ---- Lexeme stream ----

    fn current(&self) -> &Lexeme {
        &self.lexemes[self.pos]
    }

    fn next_lexeme(&mut self) {
        self.prev_location = self.current().location;
        if self.pos + 1 < self.lexemes.len() {
            self.pos += 1;
        }
        self.skip_comments();
    }

    /// Step over comment lexemes, recording them. A broken comment is left in
    /// place so the parser reports it.
    fn skip_comments(&mut self) {
        loop {
            let lexeme = &self.lexemes[self.pos];
            let kind = match &lexeme.token {
                Token::Comment(_) => CommentKind::Comment,
                Token::BlockComment => CommentKind::BlockComment,
                Token::BrokenComment => CommentKind::BrokenComment,
                _ => return,
            };
            if self.options.capture_comments {
                self.comment_locations.push(Comment {
                    kind,
                    location: lexeme.location,
                });
            }
            if kind == CommentKind::BrokenComment {
                return;
            }
            if let Token::Comment(text) = &lexeme.token {
                if let Some(content) = text.strip_prefix('!') {
                    self.hotcomments.push(HotComment {
                        header: self.hotcomment_header,
                        location: lexeme.location,
                        content: content.trim_end().to_string(),
                    });
                }
            }
            if self.pos + 1 >= self.lexemes.len() {
                return;
            }
            self.pos += 1;
        }
    }

    /// The lexeme after `current`, skipping complete comments.
    fn lookahead(&self) -> &Token {
        self.lexemes[self.pos + 1..]
            .iter()
            .map(|l| &l.token)
            .find(|t| !matches!(t, Token::Comment(_) | Token::BlockComment))
            .unwrap_or(&EOF_TOKEN)
    }

    fn block_follow(&self) -> bool {
        matches!(
            self.current().token,
            Token::Eof | Token::Else | Token::ElseIf | Token::End | Token::Until
        )
    }

    fn stop_slot(token: &Token) -> Option<usize> {
        STOP_TOKENS.iter().position(|t| t == token)
    }

    fn push_stop(&mut self, token: &Token) {
        if let Some(i) = Self::stop_slot(token) {
            self.stop_counts[i] += 1;
        }
    }

    fn pop_stop(&mut self, token: &Token) {
        if let Some(i) = Self::stop_slot(token) {
            self.stop_counts[i] -= 1;
        }
    }

    fn stops_recovery(&self, token: &Token) -> bool {
        *token == Token::Eof || Self::stop_slot(token).is_some_and(|i| self.stop_counts[i] > 0)
    }

    fn increment_recursion(&mut self, context: &str) -> PResult<()> {
        self.recursion += 1;
        if self.recursion > self.options.recursion_limit {
            return ParseError::raise(
                self.current().location,
                format_args!(
                    "Exceeded allowed recursion depth; simplify your {context} to make the code compile"
                ),
            );
        }
        Ok(())
    }

    fn since(&self, begin: Position) -> Location {
        Location::new(begin, self.prev_location.end.max(begin))
    }

    // ---- Error reporting ----

    fn report(&mut self, location: Location, message: String) -> PResult<()> {
        // one error per location: an unfinished construct tends to fail the
        // same way at every level
        if self.errors.last().is_some_and(|e| e.location() == location) {
            return Ok(());
        }
        if self.options.error_limit == 1 {
            return Err(ParseError::new(location, message));
        }
        self.errors.push(ParseError::new(location, message));
        if self.errors.len() >= self.options.error_limit {
            return ParseError::raise(
                location,
                format_args!("Reached error limit ({})", self.options.error_limit),
            );
        }
        Ok(())
    }

    fn last_error_index(&self) -> usize {
        self.errors.len().saturating_sub(1)
    }

    fn report_expr_error(
        &mut self,
        location: Location,
        exprs: Vec<ExprId>,
        message: String,
    ) -> PResult<ExprId> {
        self.report(location, message)?;
        let message_index = self.last_error_index();
        Ok(self.arena.alloc_expr(
            ExprKind::Error {
                exprs,
                message_index,
            },
            location,
        ))
    }

    fn report_stat_error(
        &mut self,
        location: Location,
        exprs: Vec<ExprId>,
        stats: Vec<StatId>,
        message: String,
    ) -> PResult<StatId> {
        self.report(location, message)?;
        let message_index = self.last_error_index();
        Ok(self.arena.alloc_stat(
            StatKind::Error {
                exprs,
                stats,
                message_index,
            },
            location,
        ))
    }

    fn expect_and_consume_fail(&mut self, expected: &Token, context: Option<&str>) -> PResult<()> {
        let got = self.current().token.to_string();
        let message = match context {
            Some(ctx) => format!("Expected {expected} when parsing {ctx}, got {got}"),
            None => format!("Expected {expected}, got {got}"),
        };
        self.report(self.current().location, message)
    }

    fn expect_and_consume(&mut self, expected: Token, context: &str) -> PResult<bool> {
        if self.current().token == expected {
            self.next_lexeme();
            return Ok(true);
        }
        self.expect_and_consume_fail(&expected, Some(context))?;
        // an extra token in front of the expected one is skipped
        if *self.lookahead() == expected {
            self.next_lexeme();
            self.next_lexeme();
        }
        Ok(false)
    }

    fn expect_match_and_consume_fail(
        &mut self,
        expected: &Token,
        begin: &MatchLexeme,
        extra: &str,
    ) -> PResult<()> {
        let current = self.current().clone();
        let message = if current.location.begin.line == begin.position.line {
            format!(
                "Expected {expected} (to close {} at column {}), got {}{extra}",
                begin.token,
                begin.position.column + 1,
                current.token
            )
        } else {
            format!(
                "Expected {expected} (to close {} at line {}), got {}{extra}",
                begin.token,
                begin.position.line + 1,
                current.token
            )
        };
        self.report(current.location, message)
    }

    fn expect_match_and_consume(
        &mut self,
        expected: Token,
        begin: &MatchLexeme,
        search_for_missing: bool,
    ) -> PResult<bool> {
        if self.current().token == expected {
            self.next_lexeme();
            return Ok(true);
        }
        self.expect_match_and_consume_fail(&expected, begin, "")?;
        if search_for_missing {
            // scan the rest of the line for the delimiter, stopping at
            // anything an enclosing construct can close
            let line = self.prev_location.end.line;
            while self.current().location.begin.line == line
                && self.current().token != expected
                && !self.stops_recovery(&self.current().token)
            {
                self.next_lexeme();
            }
            if self.current().token == expected {
                self.next_lexeme();
                return Ok(true);
            }
        } else if *self.lookahead() == expected {
            self.next_lexeme();
            self.next_lexeme();
            return Ok(true);
        }
        Ok(false)
    }

    fn expect_match_end_and_consume(&mut self, expected: Token, begin: &MatchLexeme) -> PResult<bool> {
        if self.current().token == expected {
            self.next_lexeme();
            return Ok(true);
        }
        self.expect_match_and_consume_fail(&expected, begin, "")?;
        Ok(false)
    }

    fn cst(&mut self, node: NodeId, data: CstNode) {
        if self.options.store_cst_data {
            self.cst.insert(node, data);
        }
    }

    // ---- Statements ----

    fn parse_chunk(&mut self) -> PResult<StatId> {
        let block = self.parse_block()?;
        if self.current().token != Token::Eof {
            self.expect_and_consume_fail(&Token::Eof, None)?;
        }
        Ok(block)
    }

    fn parse_block(&mut self) -> PResult<StatId> {
        let begin = self.current().location.begin;
        let mut body = Vec::new();
        while !self.block_follow() {
            let old = self.recursion;
            self.increment_recursion("block")?;
            let stat = self.parse_stat()?;
            self.recursion = old;
            if self.current().token == Token::Semi {
                self.next_lexeme();
                self.arena.stat_mut(stat).has_semicolon = true;
            }
            let last = matches!(
                self.arena.stat(stat).kind,
                StatKind::Return(_) | StatKind::Break | StatKind::Continue
            );
            body.push(stat);
            if last {
                break;
            }
        }
        let location = self.since(begin);
        Ok(self.arena.alloc_stat(StatKind::Block(body), location))
    }

    fn parse_stat(&mut self) -> PResult<StatId> {
        match self.current().token {
            Token::If => return self.parse_if(),
            Token::While => return self.parse_while(),
            Token::Do => return self.parse_do(),
            Token::For => return self.parse_for(),
            Token::Repeat => return self.parse_repeat(),
            Token::Function => return self.parse_function_stat(),
            Token::Local => return self.parse_local(),
            Token::Return => return self.parse_return(),
            Token::Break => return self.parse_break(),
            _ => {}
        }

        let start = self.current().location;
        let expr = self.parse_primary_expr(true)?;
        let expr_location = self.arena.expr(expr).location;

        if matches!(self.arena.expr(expr).kind, ExprKind::Call { .. }) {
            return Ok(self.arena.alloc_stat(StatKind::Expr(expr), expr_location));
        }
        if matches!(self.current().token, Token::Comma | Token::Assign) {
            return self.parse_assignment(expr);
        }
        if matches!(&self.arena.expr(expr).kind, ExprKind::Name(n) if n == "continue") {
            return self.parse_continue(expr_location);
        }

        // a statement that consumed nothing would stall the block loop
        if start == self.current().location {
            self.next_lexeme();
        }
        self.report_stat_error(
            expr_location,
            vec![expr],
            Vec::new(),
            "Incomplete statement: expected assignment or a function call".to_string(),
        )
    }

    fn loop_depth(&mut self) -> &mut u32 {
        let last = self.functions.len() - 1;
        &mut self.functions[last].loop_depth
    }

    fn parse_loop_body(&mut self) -> PResult<StatId> {
        *self.loop_depth() += 1;
        let body = self.parse_block();
        *self.loop_depth() -= 1;
        body
    }

    fn parse_if(&mut self) -> PResult<StatId> {
        let begin = self.current().location.begin;
        // `if` or `elseif`
        self.next_lexeme();
        let condition = self.parse_expression()?;
        let match_then = MatchLexeme::of(self.current());
        self.expect_and_consume(Token::Then, "if statement")?;
        let then_body = self.parse_block()?;

        let else_body = match self.current().token {
            Token::ElseIf => {
                let old = self.recursion;
                self.increment_recursion("elseif")?;
                let nested = self.parse_if()?;
                self.recursion = old;
                Some(nested)
            }
            Token::Else => {
                let match_else = MatchLexeme::of(self.current());
                self.next_lexeme();
                let body = self.parse_block()?;
                self.expect_match_end_and_consume(Token::End, &match_else)?;
                Some(body)
            }
            _ => {
                self.expect_match_end_and_consume(Token::End, &match_then)?;
                None
            }
        };

        let location = self.since(begin);
        Ok(self.arena.alloc_stat(
            StatKind::If {
                condition,
                then_body,
                else_body,
            },
            location,
        ))
    }

    fn parse_while(&mut self) -> PResult<StatId> {
        let begin = self.current().location.begin;
        self.next_lexeme();
        let condition = self.parse_expression()?;
        let match_do = MatchLexeme::of(self.current());
        self.expect_and_consume(Token::Do, "while loop")?;
        let body = self.parse_loop_body()?;
        self.expect_match_end_and_consume(Token::End, &match_do)?;
        let location = self.since(begin);
        Ok(self
            .arena
            .alloc_stat(StatKind::While { condition, body }, location))
    }

    fn parse_repeat(&mut self) -> PResult<StatId> {
        let begin = self.current().location.begin;
        let match_repeat = MatchLexeme::of(self.current());
        self.next_lexeme();
        let body = self.parse_loop_body()?;
        self.expect_match_end_and_consume(Token::Until, &match_repeat)?;
        let condition = self.parse_expression()?;
        let location = self.since(begin);
        Ok(self
            .arena
            .alloc_stat(StatKind::Repeat { body, condition }, location))
    }

    fn parse_do(&mut self) -> PResult<StatId> {
        let match_do = MatchLexeme::of(self.current());
        self.next_lexeme();
        let body = self.parse_block()?;
        self.expect_match_end_and_consume(Token::End, &match_do)?;
        Ok(body)
    }

    fn parse_for(&mut self) -> PResult<StatId> {
        let begin = self.current().location.begin;
        self.next_lexeme();
        let (var, _) = self.parse_name("for loop")?;

        if self.current().token == Token::Assign {
            self.next_lexeme();
            let from = self.parse_expression()?;
            self.expect_and_consume(Token::Comma, "index range")?;
            let to = self.parse_expression()?;
            let step = if self.current().token == Token::Comma {
                self.next_lexeme();
                Some(self.parse_expression()?)
            } else {
                None
            };
            let match_do = MatchLexeme::of(self.current());
            self.expect_and_consume(Token::Do, "for loop")?;
            let body = self.parse_loop_body()?;
            self.expect_match_end_and_consume(Token::End, &match_do)?;
            let location = self.since(begin);
            return Ok(self.arena.alloc_stat(
                StatKind::For {
                    var,
                    from,
                    to,
                    step,
                    body,
                },
                location,
            ));
        }

        let mut vars = vec![var];
        while self.current().token == Token::Comma {
            self.next_lexeme();
            vars.push(self.parse_name("for loop")?.0);
        }
        self.expect_and_consume(Token::In, "for loop")?;
        let values = self.parse_expr_list(None)?;
        let match_do = MatchLexeme::of(self.current());
        self.expect_and_consume(Token::Do, "for loop")?;
        let body = self.parse_loop_body()?;
        self.expect_match_end_and_consume(Token::End, &match_do)?;
        let location = self.since(begin);
        Ok(self
            .arena
            .alloc_stat(StatKind::ForIn { vars, values, body }, location))
    }

    fn parse_function_stat(&mut self) -> PResult<StatId> {
        let begin = self.current().location.begin;
        let match_function = MatchLexeme::of(self.current());
        self.next_lexeme();

        let mut name = self.parse_name_expr("function name")?;
        while self.current().token == Token::Dot {
            self.next_lexeme();
            let (field, _) = self.parse_name("field name")?;
            let location = self.since(begin);
            name = self.arena.alloc_expr(
                ExprKind::IndexName {
                    expr: name,
                    index: field,
                    op: '.',
                },
                location,
            );
        }
        let mut has_self = false;
        if self.current().token == Token::Colon {
            self.next_lexeme();
            let (method, _) = self.parse_name("method name")?;
            let location = self.since(begin);
            name = self.arena.alloc_expr(
                ExprKind::IndexName {
                    expr: name,
                    index: method,
                    op: ':',
                },
                location,
            );
            has_self = true;
        }

        let func = self.parse_function_body(has_self, &match_function, begin)?;
        let location = self.since(begin);
        Ok(self
            .arena
            .alloc_stat(StatKind::Function { name, func }, location))
    }

    fn parse_local(&mut self) -> PResult<StatId> {
        let begin = self.current().location.begin;
        self.next_lexeme();

        if self.current().token == Token::Function {
            let match_function = MatchLexeme::of(self.current());
            self.next_lexeme();
            let (name, _) = self.parse_name("variable name")?;
            let func = self.parse_function_body(false, &match_function, begin)?;
            let location = self.since(begin);
            return Ok(self
                .arena
                .alloc_stat(StatKind::LocalFunction { name, func }, location));
        }

        let mut names = vec![self.parse_name("variable name")?.0];
        let mut var_commas = Vec::new();
        while self.current().token == Token::Comma {
            var_commas.push(self.current().location.begin);
            self.next_lexeme();
            names.push(self.parse_name("variable name")?.0);
        }

        let mut equals = None;
        let mut value_commas = Vec::new();
        let values = if self.current().token == Token::Assign {
            equals = Some(self.current().location.begin);
            self.next_lexeme();
            self.parse_expr_list(Some(&mut value_commas))?
        } else {
            Vec::new()
        };

        let location = self.since(begin);
        let stat = self
            .arena
            .alloc_stat(StatKind::Local { names, values }, location);
        self.cst(
            NodeId::Stat(stat),
            CstNode::Local {
                var_commas,
                equals,
                value_commas,
            },
        );
        Ok(stat)
    }

    fn parse_return(&mut self) -> PResult<StatId> {
        let begin = self.current().location.begin;
        self.next_lexeme();
        let values = if !self.block_follow() && self.current().token != Token::Semi {
            self.parse_expr_list(None)?
        } else {
            Vec::new()
        };
        let location = self.since(begin);
        Ok(self.arena.alloc_stat(StatKind::Return(values), location))
    }

    fn parse_break(&mut self) -> PResult<StatId> {
        let location = self.current().location;
        self.next_lexeme();
        let stat = self.arena.alloc_stat(StatKind::Break, location);
        if *self.loop_depth() == 0 {
            return self.report_stat_error(
                location,
                Vec::new(),
                vec![stat],
                "break statement must be inside a loop".to_string(),
            );
        }
        Ok(stat)
    }

    fn parse_continue(&mut self, location: Location) -> PResult<StatId> {
        let stat = self.arena.alloc_stat(StatKind::Continue, location);
        if *self.loop_depth() == 0 {
            return self.report_stat_error(
                location,
                Vec::new(),
                vec![stat],
                "continue statement must be inside a loop".to_string(),
            );
        }
        Ok(stat)
    }

    fn is_lvalue(&self, expr: ExprId) -> bool {
        matches!(
            self.arena.expr(expr).kind,
            ExprKind::Name(_) | ExprKind::IndexName { .. } | ExprKind::IndexExpr { .. }
        )
    }

    fn checked_lvalue(&mut self, expr: ExprId) -> PResult<ExprId> {
        if self.is_lvalue(expr) {
            return Ok(expr);
        }
        let location = self.arena.expr(expr).location;
        self.report_expr_error(
            location,
            vec![expr],
            "Assigned expression must be a variable or a field".to_string(),
        )
    }

    fn parse_assignment(&mut self, first: ExprId) -> PResult<StatId> {
        let begin = self.arena.expr(first).location.begin;
        let mut targets = vec![self.checked_lvalue(first)?];
        while self.current().token == Token::Comma {
            self.next_lexeme();
            let target = self.parse_primary_expr(true)?;
            targets.push(self.checked_lvalue(target)?);
        }
        self.expect_and_consume(Token::Assign, "assignment")?;
        let values = self.parse_expr_list(None)?;
        let location = self.since(begin);
        Ok(self
            .arena
            .alloc_stat(StatKind::Assign { targets, values }, location))
    }

    // ---- Functions ----

    fn parse_function_body(
        &mut self,
        has_self: bool,
        match_function: &MatchLexeme,
        begin: Position,
    ) -> PResult<ExprId> {
        let mut params = Vec::new();
        if has_self {
            params.push("self".to_string());
        }
        let mut vararg = false;

        let match_paren = MatchLexeme::of(self.current());
        self.expect_and_consume(Token::LParen, "function")?;
        if self.current().token != Token::RParen {
            loop {
                if self.current().token == Token::DotDotDot {
                    self.next_lexeme();
                    vararg = true;
                    break;
                }
                params.push(self.parse_name("argument name")?.0);
                if self.current().token != Token::Comma {
                    break;
                }
                self.next_lexeme();
            }
        }
        self.expect_match_and_consume(Token::RParen, &match_paren, true)?;

        self.functions.push(FunctionState {
            vararg,
            loop_depth: 0,
        });
        self.push_stop(&Token::End);
        let body = self.parse_block();
        self.pop_stop(&Token::End);
        self.functions.pop();
        let body = body?;

        self.expect_match_end_and_consume(Token::End, match_function)?;
        let location = self.since(begin);
        Ok(self.arena.alloc_expr(
            ExprKind::Function {
                params,
                vararg,
                body,
            },
            location,
        ))
    }

    // ---- Expressions ----

    fn parse_expr_list(&mut self, mut commas: Option<&mut Vec<Position>>) -> PResult<Vec<ExprId>> {
        let mut list = vec![self.parse_expression()?];
        while self.current().token == Token::Comma {
            if let Some(c) = commas.as_deref_mut() {
                c.push(self.current().location.begin);
            }
            self.next_lexeme();
            list.push(self.parse_expression()?);
        }
        Ok(list)
    }

    fn parse_expression(&mut self) -> PResult<ExprId> {
        self.parse_subexpr(0)
    }

    fn unary_op(token: &Token) -> Option<UnaryOp> {
        match token {
            Token::Not => Some(UnaryOp::Not),
            Token::Minus => Some(UnaryOp::Minus),
            Token::Hash => Some(UnaryOp::Len),
            _ => None,
        }
    }

    fn binary_op(token: &Token) -> Option<BinaryOp> {
        Some(match token {
            Token::Plus => BinaryOp::Add,
            Token::Minus => BinaryOp::Sub,
            Token::Star => BinaryOp::Mul,
            Token::Slash => BinaryOp::Div,
            Token::Percent => BinaryOp::Mod,
            Token::Caret => BinaryOp::Pow,
            Token::DotDot => BinaryOp::Concat,
            Token::NotEqual => BinaryOp::CompareNe,
            Token::Equal => BinaryOp::CompareEq,
            Token::Less => BinaryOp::CompareLt,
            Token::LessEq => BinaryOp::CompareLe,
            Token::Greater => BinaryOp::CompareGt,
            Token::GreaterEq => BinaryOp::CompareGe,
            Token::And => BinaryOp::And,
            Token::Or => BinaryOp::Or,
            _ => return None,
        })
    }

    fn parse_subexpr(&mut self, limit: u8) -> PResult<ExprId> {
        let old = self.recursion;
        self.increment_recursion("expression")?;
        let begin = self.current().location.begin;

        let mut expr = if let Some(op) = Self::unary_op(&self.current().token) {
            self.next_lexeme();
            let operand = self.parse_subexpr(UNARY_PRIORITY)?;
            let location = self.since(begin);
            self.arena
                .alloc_expr(ExprKind::Unary { op, expr: operand }, location)
        } else {
            self.parse_simple_expr()?
        };

        while let Some(op) = Self::binary_op(&self.current().token) {
            let (left_priority, right_priority) = op.priority();
            if left_priority <= limit {
                break;
            }
            self.next_lexeme();
            let right = self.parse_subexpr(right_priority)?;
            let location = self.since(begin);
            expr = self.arena.alloc_expr(
                ExprKind::Binary {
                    op,
                    left: expr,
                    right,
                },
                location,
            );
            self.increment_recursion("expression")?;
        }

        self.recursion = old;
        Ok(expr)
    }

    fn parse_simple_expr(&mut self) -> PResult<ExprId> {
        let start = self.current().location;
        let kind = match self.current().token.clone() {
            Token::Nil => ExprKind::Nil,
            Token::True => ExprKind::Bool(true),
            Token::False => ExprKind::Bool(false),
            Token::DotDotDot => {
                let vararg = self.functions.last().is_some_and(|f| f.vararg);
                self.next_lexeme();
                if !vararg {
                    return self.report_expr_error(
                        start,
                        Vec::new(),
                        "Cannot use '...' outside of a vararg function".to_string(),
                    );
                }
                return Ok(self.arena.alloc_expr(ExprKind::Varargs, start));
            }
            Token::Function => {
                let match_function = MatchLexeme::of(self.current());
                self.next_lexeme();
                return self.parse_function_body(false, &match_function, start.begin);
            }
            Token::Number(text) => {
                self.next_lexeme();
                let Some(value) = parse_number(&text) else {
                    return self.report_expr_error(start, Vec::new(), "Malformed number".to_string());
                };
                let expr = self.arena.alloc_expr(ExprKind::Number(value), start);
                self.cst(NodeId::Expr(expr), CstNode::ConstantNumber { text });
                return Ok(expr);
            }
            Token::QuotedString(s) | Token::RawString(s) => {
                let quote = if matches!(self.current().token, Token::RawString(_)) {
                    QuoteStyle::Raw
                } else {
                    QuoteStyle::Quoted
                };
                self.next_lexeme();
                let expr = self.arena.alloc_expr(ExprKind::String(s), start);
                self.cst(NodeId::Expr(expr), CstNode::ConstantString { quote });
                return Ok(expr);
            }
            Token::BrokenString => {
                self.next_lexeme();
                return self.report_expr_error(
                    start,
                    Vec::new(),
                    "Malformed string; did you forget to finish it?".to_string(),
                );
            }
            Token::LBrace => return self.parse_table_constructor(),
            _ => return self.parse_primary_expr(false),
        };
        self.next_lexeme();
        Ok(self.arena.alloc_expr(kind, start))
    }

    fn parse_primary_expr(&mut self, as_statement: bool) -> PResult<ExprId> {
        let begin = self.current().location.begin;
        let mut expr = self.parse_prefix_expr()?;

        let old = self.recursion;
        loop {
            match self.current().token {
                Token::Dot => {
                    self.next_lexeme();
                    let (index, _) = self.parse_name("field name")?;
                    let location = self.since(begin);
                    expr = self.arena.alloc_expr(
                        ExprKind::IndexName {
                            expr,
                            index,
                            op: '.',
                        },
                        location,
                    );
                }
                Token::LBracket => {
                    let match_bracket = MatchLexeme::of(self.current());
                    self.next_lexeme();
                    let index = self.parse_expression()?;
                    self.expect_match_and_consume(Token::RBracket, &match_bracket, false)?;
                    let location = self.since(begin);
                    expr = self
                        .arena
                        .alloc_expr(ExprKind::IndexExpr { expr, index }, location);
                }
                Token::Colon => {
                    self.next_lexeme();
                    let (index, _) = self.parse_name("method name")?;
                    let location = self.since(begin);
                    let method = self.arena.alloc_expr(
                        ExprKind::IndexName {
                            expr,
                            index,
                            op: ':',
                        },
                        location,
                    );
                    expr = self.parse_function_args(method, true)?;
                }
                Token::LParen => {
                    // a call on the next line would be ambiguous; let the
                    // statement loop start a new statement instead
                    let func_end_line = self.arena.expr(expr).location.end.line;
                    if !as_statement && func_end_line != self.current().location.begin.line {
                        self.report_ambiguous_call()?;
                        break;
                    }
                    expr = self.parse_function_args(expr, false)?;
                }
                Token::LBrace | Token::QuotedString(_) | Token::RawString(_) => {
                    expr = self.parse_function_args(expr, false)?;
                }
                _ => break,
            }
            self.increment_recursion("expression")?;
        }
        self.recursion = old;
        Ok(expr)
    }

    fn report_ambiguous_call(&mut self) -> PResult<()> {
        self.report(
            self.current().location,
            "Ambiguous syntax: this looks like an argument list for a function call, but could also be a start of new statement; use ';' to separate statements".to_string(),
        )
    }

    fn parse_prefix_expr(&mut self) -> PResult<ExprId> {
        if self.current().token != Token::LParen {
            return self.parse_name_expr("expression");
        }
        let begin = self.current().location.begin;
        let match_paren = MatchLexeme::of(self.current());
        self.next_lexeme();
        let inner = self.parse_expression()?;
        if self.current().token == Token::RParen {
            self.next_lexeme();
        } else {
            let extra = if self.current().token == Token::Assign {
                "; did you mean to use '{' when defining a table?"
            } else {
                ""
            };
            self.expect_match_and_consume_fail(&Token::RParen, &match_paren, extra)?;
        }
        let location = self.since(begin);
        Ok(self.arena.alloc_expr(ExprKind::Group(inner), location))
    }

    fn parse_function_args(&mut self, func: ExprId, self_call: bool) -> PResult<ExprId> {
        let begin = self.arena.expr(func).location.begin;
        match self.current().token.clone() {
            Token::LParen => {
                if self.arena.expr(func).location.end.line != self.current().location.begin.line {
                    self.report_ambiguous_call()?;
                }
                let match_paren = MatchLexeme::of(self.current());
                let open = self.current().location.begin;
                self.next_lexeme();

                self.push_stop(&Token::RParen);
                let args = if self.current().token != Token::RParen {
                    self.parse_expr_list(None)
                } else {
                    Ok(Vec::new())
                };
                self.pop_stop(&Token::RParen);
                let args = args?;

                let close = (self.current().token == Token::RParen).then(|| self.current().location.begin);
                self.expect_match_and_consume(Token::RParen, &match_paren, true)?;
                let location = self.since(begin);
                let call = self.arena.alloc_expr(
                    ExprKind::Call {
                        func,
                        args,
                        self_call,
                    },
                    location,
                );
                self.cst(
                    NodeId::Expr(call),
                    CstNode::Call {
                        open_parens: Some(open),
                        close_parens: close,
                    },
                );
                Ok(call)
            }
            Token::LBrace => {
                let table = self.parse_table_constructor()?;
                let location = self.since(begin);
                Ok(self.arena.alloc_expr(
                    ExprKind::Call {
                        func,
                        args: vec![table],
                        self_call,
                    },
                    location,
                ))
            }
            Token::QuotedString(s) | Token::RawString(s) => {
                let arg_location = self.current().location;
                self.next_lexeme();
                let arg = self.arena.alloc_expr(ExprKind::String(s), arg_location);
                let location = self.since(begin);
                Ok(self.arena.alloc_expr(
                    ExprKind::Call {
                        func,
                        args: vec![arg],
                        self_call,
                    },
                    location,
                ))
            }
            other => {
                let location = Location::new(begin, self.current().location.begin);
                self.report_expr_error(
                    location,
                    vec![func],
                    format!("Expected '(', '{{' or <string> when parsing function call, got {other}"),
                )
            }
        }
    }

    fn parse_table_constructor(&mut self) -> PResult<ExprId> {
        let begin = self.current().location.begin;
        let match_brace = MatchLexeme::of(self.current());
        self.expect_and_consume(Token::LBrace, "table literal")?;

        self.push_stop(&Token::RBrace);
        let items = self.parse_table_items();
        self.pop_stop(&Token::RBrace);
        let (items, separators) = items?;

        self.expect_match_and_consume(Token::RBrace, &match_brace, false)?;
        let location = self.since(begin);
        let table = self.arena.alloc_expr(ExprKind::Table(items), location);
        self.cst(NodeId::Expr(table), CstNode::Table { separators });
        Ok(table)
    }

    #[allow(clippy::type_complexity)]
    fn parse_table_items(&mut self) -> PResult<(Vec<TableItem>, Vec<Option<(Separator, Position)>>)> {
        let mut items = Vec::new();
        let mut separators = Vec::new();
        while self.current().token != Token::RBrace {
            let item = if self.current().token == Token::LBracket {
                let match_bracket = MatchLexeme::of(self.current());
                self.next_lexeme();
                let key = self.parse_expression()?;
                self.expect_match_and_consume(Token::RBracket, &match_bracket, false)?;
                self.expect_and_consume(Token::Assign, "table field")?;
                let value = self.parse_expression()?;
                TableItem::General { key, value }
            } else if let (Token::Name(key), Token::Assign) = (&self.current().token, self.lookahead()) {
                let key = key.clone();
                self.next_lexeme();
                self.next_lexeme();
                let value = self.parse_expression()?;
                TableItem::Record { key, value }
            } else {
                TableItem::List(self.parse_expression()?)
            };
            items.push(item);

            let separator = match self.current().token {
                Token::Comma => Some(Separator::Comma),
                Token::Semi => Some(Separator::Semicolon),
                _ => None,
            };
            match separator {
                Some(sep) => {
                    separators.push(Some((sep, self.current().location.begin)));
                    self.next_lexeme();
                }
                None => {
                    separators.push(None);
                    break;
                }
            }
        }
        Ok((items, separators))
    }

    fn parse_name_opt(&mut self, context: &str) -> PResult<Option<(String, Location)>> {
        if let Token::Name(name) = &self.current().token {
            let result = (name.clone(), self.current().location);
            self.next_lexeme();
            return Ok(Some(result));
        }
        let got = self.current().token.to_string();
        self.report(
            self.current().location,
            format!("Expected identifier when parsing {context}, got {got}"),
        )?;
        Ok(None)
    }

    /// A name, or the recovery placeholder after reporting an error.
    fn parse_name(&mut self, context: &str) -> PResult<(String, Location)> {
        match self.parse_name_opt(context)? {
            Some(name) => Ok(name),
            None => Ok((
                K_PARSE_NAME_ERROR.to_string(),
                self.current().location.collapsed(),
            )),
        }
    }

    fn parse_name_expr(&mut self, context: &str) -> PResult<ExprId> {
        match self.parse_name_opt(context)? {
            Some((name, location)) => Ok(self.arena.alloc_expr(ExprKind::Name(name), location)),
            None => {
                let message_index = self.last_error_index();
                let location = self.current().location;
                Ok(self.arena.alloc_expr(
                    ExprKind::Error {
                        exprs: Vec::new(),
                        message_index,
                    },
                    location,
                ))
            }
        }
    }
}
