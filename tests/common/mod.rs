#![allow(dead_code)]

use std::net::IpAddr;

use flow::ast::{BinaryOp, Expr, MatchCase, MatchClass, Span, Spanned, Stmt, Symbol, SymbolId, Unit};
use flow::config::CompileOptions;
use flow::types::{LiteralType, Signature};
use flow::vm::{Program, RunError, RunResult, Runtime};

// --- AST builders ---

pub fn sp<T>(node: T) -> Spanned<T> {
    Spanned::unknown(node)
}

pub fn num(n: i64) -> Spanned<Expr> {
    sp(Expr::Number(n))
}

pub fn string(s: &str) -> Spanned<Expr> {
    sp(Expr::String(s.to_string()))
}

pub fn regex(pattern: &str) -> Spanned<Expr> {
    sp(Expr::RegExp(pattern.to_string()))
}

pub fn var(id: SymbolId) -> Spanned<Expr> {
    sp(Expr::VariableRef(id))
}

pub fn group(n: i64) -> Spanned<Expr> {
    sp(Expr::RegExpGroup(Box::new(num(n))))
}

pub fn binary(op: BinaryOp, lhs: Spanned<Expr>, rhs: Spanned<Expr>) -> Spanned<Expr> {
    sp(Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) })
}

pub fn call(callee: SymbolId, args: Vec<Spanned<Expr>>) -> Spanned<Expr> {
    sp(Expr::Call { callee, args })
}

pub fn stmt(callee: SymbolId, args: Vec<Spanned<Expr>>) -> Spanned<Stmt> {
    sp(Stmt::Expr(call(callee, args)))
}

pub fn assign(variable: SymbolId, value: Spanned<Expr>) -> Spanned<Stmt> {
    sp(Stmt::Assign { variable, value })
}

pub fn block(stmts: Vec<Spanned<Stmt>>) -> Spanned<Stmt> {
    sp(Stmt::Compound(stmts))
}

pub fn if_else(condition: Spanned<Expr>, then_stmt: Spanned<Stmt>, else_stmt: Option<Spanned<Stmt>>) -> Spanned<Stmt> {
    sp(Stmt::Cond { condition, then_stmt: Box::new(then_stmt), else_stmt: else_stmt.map(Box::new) })
}

pub fn matching(
    condition: Spanned<Expr>,
    class: MatchClass,
    cases: Vec<(Vec<Spanned<Expr>>, Spanned<Stmt>)>,
    else_stmt: Option<Spanned<Stmt>>,
) -> Spanned<Stmt> {
    let cases = cases.into_iter().map(|(labels, body)| MatchCase { labels, body }).collect();
    sp(Stmt::Match { condition, class, cases, else_stmt: else_stmt.map(Box::new) })
}

// --- Unit with the host natives below pre-declared ---

pub struct Natives {
    pub emit: SymbolId,
    pub emit_str: SymbolId,
    pub num: SymbolId,
    pub path: SymbolId,
    pub ip: SymbolId,
    pub check: SymbolId,
    pub accept: SymbolId,
    pub accept_if: SymbolId,
}

pub fn unit() -> (Unit, Natives) {
    let mut unit = Unit::new();
    let mut function = |unit: &mut Unit, sig: &str| {
        let signature: Signature = sig.parse().unwrap();
        unit.declare(Symbol::BuiltinFunction { signature, span: Span::UNKNOWN }, true)
    };
    let emit = function(&mut unit, "emit(I)V");
    let emit_str = function(&mut unit, "emit.str(S)V");
    let num = function(&mut unit, "req.num()I");
    let path = function(&mut unit, "req.path()S");
    let ip = function(&mut unit, "req.ip()P");
    let check = function(&mut unit, "check()B");
    let accept = unit.declare(
        Symbol::BuiltinHandler { signature: Signature::new("accept", vec![], LiteralType::Boolean), span: Span::UNKNOWN },
        true,
    );
    let accept_if = unit.declare(
        Symbol::BuiltinHandler {
            signature: Signature::new("accept.if", vec![LiteralType::Boolean], LiteralType::Boolean),
            span: Span::UNKNOWN,
        },
        true,
    );
    (unit, Natives { emit, emit_str, num, path, ip, check, accept, accept_if })
}

pub fn handler(unit: &mut Unit, name: &str, locals: Vec<SymbolId>, body: Vec<Spanned<Stmt>>) -> SymbolId {
    unit.declare(Symbol::Handler { name: name.into(), locals, body: Some(block(body)), span: Span::UNKNOWN }, true)
}

pub fn local(unit: &mut Unit, name: &str, init: Spanned<Expr>) -> SymbolId {
    unit.declare(Symbol::Variable { name: name.into(), initializer: init, span: Span::UNKNOWN }, false)
}

// --- Host side ---

/// Request data handed to a run and everything the natives observed.
#[derive(Debug, Clone)]
pub struct Trace {
    pub num: i64,
    pub path: String,
    pub ip: IpAddr,
    pub ints: Vec<i64>,
    pub strings: Vec<String>,
    pub checks: usize,
}

impl Default for Trace {
    fn default() -> Self {
        Trace {
            num: 0,
            path: "/".into(),
            ip: "127.0.0.1".parse().unwrap(),
            ints: Vec::new(),
            strings: Vec::new(),
            checks: 0,
        }
    }
}

fn trace<'a>(p: &'a mut flow::vm::Params<'_, '_>) -> RunResult<&'a mut Trace> {
    p.userdata::<Trace>().ok_or_else(|| RunError::Native("no trace attached".into()))
}

pub fn runtime() -> Runtime {
    let mut rt = Runtime::new();
    rt.register_function("emit(I)V".parse().unwrap(), |p| {
        let n = p.get_int(1)?;
        trace(p)?.ints.push(n);
        Ok(())
    })
    .register_function("emit.str(S)V".parse().unwrap(), |p| {
        let s = p.get_string(1)?.to_string();
        trace(p)?.strings.push(s);
        Ok(())
    })
    .register_function("req.num()I".parse().unwrap(), |p| {
        let n = trace(p)?.num;
        p.set_result(n)
    })
    .register_function("req.path()S".parse().unwrap(), |p| {
        let path = trace(p)?.path.clone();
        p.set_result(path)
    })
    .register_function("req.ip()P".parse().unwrap(), |p| {
        let ip = trace(p)?.ip;
        p.set_result(ip)
    })
    .register_function("check()B".parse().unwrap(), |p| {
        trace(p)?.checks += 1;
        p.set_result(true)
    })
    .register_handler("accept()B".parse().unwrap(), |p| p.set_result(true))
    .register_handler("accept.if(B)B".parse().unwrap(), |p| {
        let b = p.get_bool(1)?;
        p.set_result(b)
    });
    rt
}

pub fn compile(unit: &Unit, options: &CompileOptions) -> Program {
    let mut program = match flow::compile(unit, &[], options) {
        Ok(p) => p,
        Err(e) => panic!("compile failed: {e}: {:?}", e.diagnostics()),
    };
    program.link(&runtime()).expect("every native is registered");
    program
}

/// Runs `handler` with `input` attached and returns the outcome plus what the natives saw.
pub fn run(program: &Program, handler: &str, input: Trace) -> (Result<bool, RunError>, Trace) {
    let mut runner = program.find_handler(handler).expect("handler exists").create_runner().with_userdata(Box::new(input));
    let result = runner.run();
    let trace = runner.take_userdata().and_then(|d| d.downcast::<Trace>().ok()).expect("trace survives the run");
    (result, *trace)
}

pub fn run_main(program: &Program, input: Trace) -> (Result<bool, RunError>, Trace) {
    run(program, "main", input)
}
