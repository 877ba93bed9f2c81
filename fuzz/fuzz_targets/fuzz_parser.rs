#![no_main]

use libfuzzer_sys::fuzz_target;
use lumen_ast::ast::AstArena;
use lumen_ast::{ParseOptions, Parser};

fuzz_target!(|data: &[u8]| {
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    let options = ParseOptions::default();

    let mut arena = AstArena::new();
    let result = Parser::parse(source, &mut arena, &options);
    assert!(result.errors.len() <= options.error_limit + 1);

    let mut arena = AstArena::new();
    let _ = Parser::parse_expr(source, &mut arena, &options);
});
