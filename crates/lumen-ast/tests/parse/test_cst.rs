use super::helpers::*;
use lumen_ast::ast::{ExprKind, NodeId, StatKind};
use lumen_ast::location::Position;
use lumen_ast::parse_result::{CstNode, QuoteStyle, Separator};
use lumen_ast::ParseOptions;

fn with_cst() -> ParseOptions {
    ParseOptions {
        store_cst_data: true,
        ..ParseOptions::default()
    }
}

#[test]
fn test_cst_off_by_default() {
    let (result, _) = parse_ok("local a = 0x10");
    assert!(result.cst_node_map.is_empty());
}

#[test]
fn test_local_commas_and_number_text() {
    let (result, arena) = parse_with("local a, b = 0x10, 'x'", with_cst());
    assert!(result.errors.is_empty());
    let stat = arena.block_body(result.root)[0];
    assert_eq!(
        result.cst_node_map.get(&NodeId::Stat(stat)),
        Some(&CstNode::Local {
            var_commas: vec![Position::new(0, 7)],
            equals: Some(Position::new(0, 11)),
            value_commas: vec![Position::new(0, 17)],
        })
    );
    let StatKind::Local { values, .. } = &arena.stat(stat).kind else {
        panic!("expected local");
    };
    assert_eq!(arena.expr(values[0]).kind, ExprKind::Number(16.0));
    assert_eq!(
        result.cst_node_map.get(&NodeId::Expr(values[0])),
        Some(&CstNode::ConstantNumber {
            text: "0x10".to_string()
        })
    );
    assert_eq!(
        result.cst_node_map.get(&NodeId::Expr(values[1])),
        Some(&CstNode::ConstantString {
            quote: QuoteStyle::Quoted
        })
    );
}

#[test]
fn test_table_separators() {
    let (result, arena) = parse_with("t = {1, 2; 3}", with_cst());
    let stat = arena.block_body(result.root)[0];
    let StatKind::Assign { values, .. } = &arena.stat(stat).kind else {
        panic!("expected assignment");
    };
    let Some(CstNode::Table { separators }) = result.cst_node_map.get(&NodeId::Expr(values[0])) else {
        panic!("missing table cst");
    };
    let kinds: Vec<Option<Separator>> = separators.iter().map(|s| s.map(|(k, _)| k)).collect();
    assert_eq!(
        kinds,
        vec![Some(Separator::Comma), Some(Separator::Semicolon), None]
    );
}

#[test]
fn test_call_parens() {
    let (result, arena) = parse_with("print(1)", with_cst());
    let stat = arena.block_body(result.root)[0];
    let StatKind::Expr(call) = arena.stat(stat).kind else {
        panic!("expected call");
    };
    assert_eq!(
        result.cst_node_map.get(&NodeId::Expr(call)),
        Some(&CstNode::Call {
            open_parens: Some(Position::new(0, 5)),
            close_parens: Some(Position::new(0, 7)),
        })
    );
}
