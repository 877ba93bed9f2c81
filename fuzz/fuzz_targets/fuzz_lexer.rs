#![no_main]

use libfuzzer_sys::fuzz_target;
use lumen_ast::lexer::Lexer;
use lumen_ast::token::Token;

fuzz_target!(|data: &[u8]| {
    // Every input lexes; malformed lexemes become error tokens, not panics.
    let lexemes = Lexer::tokenize(data);
    assert_eq!(lexemes.last().map(|l| &l.token), Some(&Token::Eof));
});
