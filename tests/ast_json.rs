mod common;

use common::*;
use flow::ast::Unit;
use flow::config::{CompileOptions, HandlerCallMode, LocalsMode, RunnerLimits};

const UNIT: &str = r#"{
    "imports": [{"module": "request", "path": "builtin:request"}],
    "symbols": [
        {"BuiltinFunction": {"signature": {"name": "emit", "args": ["Number"], "ret": "Void"}}},
        {"BuiltinFunction": {"signature": {"name": "req.num", "args": [], "ret": "Number"}}},
        {"BuiltinFunction": {"signature": {"name": "req.ip", "args": [], "ret": "IPAddress"}}},
        {"Handler": {"name": "main", "body": {"Compound": [
            {"Expr": {"Call": {"callee": 0, "args": [
                {"Binary": {"op": "Add", "lhs": {"Call": {"callee": 1}}, "rhs": {"Number": 4}}}
            ]}}},
            {"Cond": {
                "condition": {"Binary": {"op": "In",
                    "lhs": {"Call": {"callee": 2}},
                    "rhs": {"Cidr": {"address": "10.0.0.0", "prefix": 8}}}},
                "then_stmt": {"Expr": {"Call": {"callee": 0, "args": [{"Number": 1}]}}},
                "else_stmt": {"Expr": {"Call": {"callee": 0, "args": [{"Number": 0}]}}}
            }}
        ]}}}
    ],
    "scope": [0, 1, 2, 3]
}"#;

// --- Units ---

#[test]
fn unit_from_json_compiles_and_runs() {
    let unit = Unit::from_json_str(UNIT).unwrap();
    let program = compile(&unit, &CompileOptions::default());
    assert_eq!(program.constants().modules(), &[("request".to_string(), "builtin:request".to_string())]);

    let inside = Trace { num: 38, ip: "10.1.2.3".parse().unwrap(), ..Trace::default() };
    assert_eq!(run_main(&program, inside).1.ints, vec![42, 1]);
    let outside = Trace { num: -4, ip: "192.168.0.1".parse().unwrap(), ..Trace::default() };
    assert_eq!(run_main(&program, outside).1.ints, vec![0, 0]);
}

#[test]
fn unit_survives_serialization() {
    let unit = Unit::from_json_str(UNIT).unwrap();
    let text = serde_json::to_string(&unit).unwrap();
    assert_eq!(Unit::from_json_str(&text).unwrap(), unit);
}

#[test]
fn malformed_unit_is_rejected() {
    assert!(Unit::from_json_str(r#"{"symbols": [{"Handler": {}}], "scope": []}"#).is_err());
    assert!(Unit::from_json_str(r#"{"symbols": [{"Widget": {"name": "x"}}], "scope": []}"#).is_err());
}

// --- Options ---

#[test]
fn compile_options_from_json() {
    let opts = CompileOptions::from_json_str(r#"{"handler_calls": "call", "locals": "stack_slots"}"#).unwrap();
    assert_eq!(opts.handler_calls, HandlerCallMode::Call);
    assert_eq!(opts.locals, LocalsMode::StackSlots);
    assert!(opts.verify);

    let unit = Unit::from_json_str(UNIT).unwrap();
    let program = compile(&unit, &opts);
    let trace = Trace { num: 1, ip: "10.0.0.9".parse().unwrap(), ..Trace::default() };
    assert_eq!(run_main(&program, trace).1.ints, vec![5, 1]);
}

#[test]
fn bad_options_are_rejected() {
    assert!(CompileOptions::from_json_str(r#"{"handler_calls": "jump"}"#).is_err());
    assert!(CompileOptions::from_json_str(r#"{"optimize": true}"#).is_err());
    let err = RunnerLimits::from_json_str(r#"{"max_call_depth": -1}"#).unwrap_err();
    assert!(err.to_string().starts_with("invalid configuration"));
}
