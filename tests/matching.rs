mod common;

use common::*;
use flow::ast::{BinaryOp, MatchClass, Unit};
use flow::config::CompileOptions;
use flow::vm::Program;

fn on_path(path: &str) -> Trace {
    Trace { path: path.into(), ..Trace::default() }
}

/// `match req.path() <class> { on label_i { emit(i) } ... } else { emit(-1) }; emit(100)`
fn path_dispatch(class: MatchClass, labels: &[&[&str]], with_else: bool) -> Unit {
    let (mut unit, n) = unit();
    let label = |s: &str| if class == MatchClass::RegExp { regex(s) } else { string(s) };
    let cases = labels
        .iter()
        .enumerate()
        .map(|(i, group)| (group.iter().map(|l| label(*l)).collect(), stmt(n.emit, vec![num(i as i64)])))
        .collect();
    let else_stmt = with_else.then(|| stmt(n.emit, vec![num(-1)]));
    handler(&mut unit, "main", vec![], vec![
        matching(call(n.path, vec![]), class, cases, else_stmt),
        stmt(n.emit, vec![num(100)]),
    ]);
    unit
}

fn dispatch(program: &Program, path: &str) -> Vec<i64> {
    run_main(program, on_path(path)).1.ints
}

// --- Exact ---

#[test]
fn exact_match_dispatches_by_label() {
    let unit = path_dispatch(MatchClass::Same, &[&["/"], &["/login", "/signin"], &["/logout"]], true);
    let program = compile(&unit, &CompileOptions::default());
    assert_eq!(dispatch(&program, "/"), vec![0, 100]);
    assert_eq!(dispatch(&program, "/signin"), vec![1, 100]);
    assert_eq!(dispatch(&program, "/logout"), vec![2, 100]);
    assert_eq!(dispatch(&program, "/LOGOUT"), vec![-1, 100]);
}

#[test]
fn missing_else_falls_through() {
    let unit = path_dispatch(MatchClass::Same, &[&["/a"]], false);
    let program = compile(&unit, &CompileOptions::default());
    assert_eq!(dispatch(&program, "/a"), vec![0, 100]);
    assert_eq!(dispatch(&program, "/b"), vec![100]);
}

// --- Prefix / suffix ---

#[test]
fn prefix_match_prefers_the_longest_label() {
    let unit = path_dispatch(MatchClass::Head, &[&["/api"], &["/api/v2"], &["/static"]], true);
    let program = compile(&unit, &CompileOptions::default());
    assert_eq!(dispatch(&program, "/api/v1/users"), vec![0, 100]);
    assert_eq!(dispatch(&program, "/api/v2/users"), vec![1, 100]);
    assert_eq!(dispatch(&program, "/static/app.js"), vec![2, 100]);
    assert_eq!(dispatch(&program, "/ap"), vec![-1, 100]);
}

#[test]
fn suffix_match() {
    let unit = path_dispatch(MatchClass::Tail, &[&[".js", ".css"], &[".min.js"]], true);
    let program = compile(&unit, &CompileOptions::default());
    assert_eq!(dispatch(&program, "/app.js"), vec![0, 100]);
    assert_eq!(dispatch(&program, "/style.css"), vec![0, 100]);
    assert_eq!(dispatch(&program, "/app.min.js"), vec![1, 100]);
    assert_eq!(dispatch(&program, "/index.html"), vec![-1, 100]);
}

// --- Regex ---

#[test]
fn regex_match_takes_the_first_matching_case() {
    let unit = path_dispatch(MatchClass::RegExp, &[&[r"^/user/\d+$"], &[r"^/user/"]], true);
    let program = compile(&unit, &CompileOptions::default());
    assert_eq!(dispatch(&program, "/user/42"), vec![0, 100]);
    assert_eq!(dispatch(&program, "/user/me"), vec![1, 100]);
    assert_eq!(dispatch(&program, "/group/1"), vec![-1, 100]);
}

#[test]
fn regex_case_sees_its_capture_groups() {
    let (mut unit, n) = unit();
    let case = (vec![regex(r"^/user/(\w+)$")], stmt(n.emit_str, vec![group(1)]));
    handler(&mut unit, "main", vec![], vec![matching(call(n.path, vec![]), MatchClass::RegExp, vec![case], None)]);
    let program = compile(&unit, &CompileOptions::default());

    let (_, trace) = run_main(&program, on_path("/user/alice"));
    assert_eq!(trace.strings, vec!["alice"]);
    let (_, trace) = run_main(&program, on_path("/team/alice"));
    assert!(trace.strings.is_empty());
}

#[test]
fn regex_operator_in_a_condition() {
    let (mut unit, n) = unit();
    let cond = binary(BinaryOp::RegexMatch, call(n.path, vec![]), regex(r"^/(\w+)/(\d+)"));
    handler(&mut unit, "main", vec![], vec![if_else(
        cond,
        block(vec![stmt(n.emit_str, vec![group(1)]), stmt(n.emit_str, vec![group(2)])]),
        Some(stmt(n.emit_str, vec![string("miss")])),
    )]);
    let program = compile(&unit, &CompileOptions::default());

    assert_eq!(run_main(&program, on_path("/orders/17/items")).1.strings, vec!["orders", "17"]);
    assert_eq!(run_main(&program, on_path("/")).1.strings, vec!["miss"]);
}

#[test]
fn unmatched_group_is_empty() {
    let (mut unit, n) = unit();
    let cond = binary(BinaryOp::RegexMatch, call(n.path, vec![]), regex(r"^/a(b)?"));
    handler(&mut unit, "main", vec![], vec![if_else(cond, stmt(n.emit_str, vec![group(1)]), None)]);
    let program = compile(&unit, &CompileOptions::default());
    assert_eq!(run_main(&program, on_path("/ac")).1.strings, vec![""]);
}

// --- Compile errors ---

fn error_codes(unit: &Unit) -> Vec<&'static str> {
    match flow::compile(unit, &[], &CompileOptions::default()) {
        Ok(_) => vec![],
        Err(e) => e.diagnostics().iter().filter_map(|d| d.code).collect(),
    }
}

#[test]
fn label_shared_between_cases_is_an_error() {
    let unit = path_dispatch(MatchClass::Same, &[&["/a"], &["/b", "/a"]], false);
    assert_eq!(error_codes(&unit), vec!["FLOW-G005"]);
}

#[test]
fn label_repeated_within_a_case_only_warns() {
    let unit = path_dispatch(MatchClass::Same, &[&["/a", "/a"]], false);
    let program = compile(&unit, &CompileOptions::default());
    assert_eq!(dispatch(&program, "/a"), vec![0, 100]);
}

#[test]
fn non_constant_label_is_rejected() {
    let (mut unit, n) = unit();
    let case = (vec![call(n.path, vec![])], stmt(n.emit, vec![num(0)]));
    handler(&mut unit, "main", vec![], vec![matching(call(n.path, vec![]), MatchClass::Same, vec![case], None)]);
    assert_eq!(error_codes(&unit), vec!["FLOW-G006"]);
}

#[test]
fn string_label_in_a_regex_match_is_rejected() {
    let (mut unit, n) = unit();
    let case = (vec![string("/a")], stmt(n.emit, vec![num(0)]));
    handler(&mut unit, "main", vec![], vec![matching(call(n.path, vec![]), MatchClass::RegExp, vec![case], None)]);
    assert_eq!(error_codes(&unit), vec!["FLOW-G006"]);
}

#[test]
fn invalid_regex_is_reported() {
    let unit = path_dispatch(MatchClass::RegExp, &[&["(unclosed"]], false);
    let codes = error_codes(&unit);
    assert!(codes.contains(&"FLOW-G008"), "got {codes:?}");
}

#[test]
fn subject_must_be_a_string() {
    let (mut unit, n) = unit();
    let case = (vec![string("/a")], stmt(n.emit, vec![num(0)]));
    handler(&mut unit, "main", vec![], vec![matching(call(n.num, vec![]), MatchClass::Same, vec![case], None)]);
    assert_eq!(error_codes(&unit), vec!["FLOW-G003"]);
}
