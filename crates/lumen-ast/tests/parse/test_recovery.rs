use super::helpers::*;
use lumen_ast::ast::StatKind;
use proptest::prelude::*;

#[test]
fn test_three_independent_errors() {
    let src = "local a = 1\nx\nlocal b = 2\ny\nlocal c = 3\nz\n";
    let (result, arena) = parse(src);
    let errors = located_errors(&result);
    let incomplete = "Incomplete statement: expected assignment or a function call".to_string();
    assert_eq!(
        errors,
        vec![(2, incomplete.clone()), (4, incomplete.clone()), (6, incomplete)]
    );
    let body = arena.block_body(result.root);
    assert_eq!(body.len(), 6);
    let error_stats = body
        .iter()
        .filter(|s| matches!(arena.stat(**s).kind, StatKind::Error { .. }))
        .count();
    assert_eq!(error_stats, 3);
}

#[test]
fn test_error_nodes_point_at_their_message() {
    let (result, arena) = parse("a\nlocal ok = 1\nb\n");
    let body = arena.block_body(result.root);
    let indices: Vec<usize> = body
        .iter()
        .filter_map(|s| match arena.stat(*s).kind {
            StatKind::Error { message_index, .. } => Some(message_index),
            _ => None,
        })
        .collect();
    assert_eq!(indices, vec![0, 1]);
}

#[test]
fn test_into_strict() {
    let (result, _) = parse("a\nb\n");
    let err = result.into_strict().unwrap_err();
    assert_eq!(err.to_string(), "2 parse errors");
    assert_eq!(err.errors().len(), 2);

    let (result, _) = parse("local x = 1");
    assert!(result.into_strict().is_ok());
}

#[test]
fn test_unclosed_if_reports_then() {
    let (result, _) = parse("if x then\n  y = 1\n");
    assert_eq!(
        located_errors(&result),
        vec![(3, "Expected 'end' (to close 'then' at line 1), got <eof>".to_string())]
    );
}

#[test]
fn test_unclosed_call_searches_the_line() {
    // the stray `2` is skipped while looking for ')'
    let (result, arena) = parse("f(1 2)\ng()\n");
    assert_eq!(result.errors.len(), 1);
    assert_eq!(arena.block_body(result.root).len(), 2);
}

#[test]
fn test_table_paren_hint() {
    let (result, _) = parse("local t = (a = 1)");
    assert!(result.errors[0]
        .message()
        .ends_with("; did you mean to use '{' when defining a table?"));
}

#[test]
fn test_bad_call_arguments() {
    let (result, _) = parse("obj:method + 1");
    assert_eq!(
        result.errors[0].message(),
        "Expected '(', '{' or <string> when parsing function call, got '+'"
    );
}

#[test]
fn test_assignment_to_call_result() {
    let (result, _) = parse("f() = 1");
    // `f()` is a complete call statement, so `=` starts a bad statement
    assert!(!result.errors.is_empty());
    let (result, _) = parse("a, f() = 1, 2");
    assert_eq!(
        result.errors[0].message(),
        "Assigned expression must be a variable or a field"
    );
}

#[test]
fn test_nested_functions_and_loops() {
    let src = r#"
local function outer(a, b, ...)
  for i = 1, #a do
    local t = { x = 1, [i] = "v"; 3 }
    while t.x < 10 do
      t.x = t.x + 1
    end
  end
  repeat
    b = b - 1
  until b == 0
  for k, v in pairs(a) do
    if v then print(k) elseif not v then print("no") else return end
  end
  return function(...) return ... end
end
"#;
    parse_ok(src);
}

proptest! {
    #[test]
    fn prop_parse_never_panics(src in "[a-z0-9 =(){}\\[\\].,:;\"'+\\-*/<>~#\n]{0,120}") {
        let (result, arena) = parse(&src);
        // root always exists
        let _ = arena.stat(result.root);
        for e in &result.errors {
            prop_assert!(!e.message().is_empty());
        }
    }
}
