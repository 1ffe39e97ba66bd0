mod common;

use common::*;
use flow::ast::{BinaryOp, Expr, Spanned};
use flow::config::CompileOptions;
use flow::vm::{ConstantPool, LoadError, Opcode, Program, RunError, instruction};

fn emit_num_plus_four() -> Program {
    let (mut unit, n) = unit();
    handler(&mut unit, "main", vec![], vec![stmt(n.emit, vec![binary(BinaryOp::Add, call(n.num, vec![]), num(4))])]);
    flow::compile(&unit, &[], &CompileOptions::default()).unwrap()
}

// --- Listing ---

#[test]
fn golden_disassembly() {
    let program = emit_num_plus_four();
    let main = program.find_handler("main").unwrap();
    let expected = [
        "  CALL       0, 0, r0         ;   0 | 55 00 00 00 00 00 00 00",
        "  NIADD      r1, r0, 4        ;   1 | 21 00 01 00 00 00 04 00",
        "  MOV        r3, r1           ;   2 | 06 00 03 00 01 00 00 00",
        "  CALL       1, 1, r2         ;   3 | 55 00 01 00 01 00 02 00",
        "  EXIT       0                ;   4 | 01 00 00 00 00 00 00 00",
    ];
    assert_eq!(main.disassemble().lines().collect::<Vec<_>>(), expected);
    assert_eq!(main.register_count(), 4);
    let natives: Vec<String> = program.constants().native_functions().iter().map(ToString::to_string).collect();
    assert_eq!(natives, vec!["req.num()I", "emit(I)V"]);
}

#[test]
fn program_listing_names_every_section() {
    let listing = emit_num_plus_four().to_string();
    assert!(listing.starts_with("; Program"), "got:\n{listing}");
    assert!(listing.contains("; native functions"));
    assert!(listing.contains(".const 0    = req.num()I"));
    assert!(listing.contains(".handler main"));
    assert!(listing.contains("; registers: 4"));
}

#[test]
fn listing_shows_match_tables() {
    let (mut unit, n) = unit();
    let cases = vec![(vec![string("/a")], stmt(n.emit, vec![num(1)]))];
    handler(&mut unit, "main", vec![], vec![matching(call(n.path, vec![]), flow::ast::MatchClass::Head, cases, None)]);
    let listing = flow::compile(&unit, &[], &CompileOptions::default()).unwrap().to_string();
    assert!(listing.contains("; match 0 in main (=^)"), "got:\n{listing}");
    assert!(listing.contains("\"/a\""));
}

// --- Loading and linking ---

#[test]
fn unknown_opcode_is_rejected_at_load() {
    let err = Program::new(ConstantPool::default(), vec![("main".into(), vec![0xFFFF])]).unwrap_err();
    assert!(matches!(err, LoadError::Encode(_)), "got {err:?}");
    assert_eq!(flow::diagnostic::Diagnostic::from(&err).code, Some("FLOW-E003"));
}

#[test]
fn jump_outside_the_handler_is_rejected_at_load() {
    use instruction::make;
    let code = vec![make(Opcode::JMP, 99, 0, 0), make(Opcode::EXIT, 1, 0, 0)];
    let err = Program::new(ConstantPool::default(), vec![("main".into(), code)]).unwrap_err();
    assert!(matches!(err, LoadError::InvalidJumpTarget { target: 99, .. }), "got {err:?}");
    assert_eq!(flow::diagnostic::Diagnostic::from(&err).code, Some("FLOW-L003"));
}

#[test]
fn invalid_regex_in_the_pool_is_a_load_error() {
    let mut pool = ConstantPool::default();
    pool.make_regex("(");
    let err = Program::new(pool, vec![]).unwrap_err();
    assert!(matches!(err, LoadError::InvalidRegex { .. }));
}

#[test]
fn unlinked_program_fails_at_the_first_native_call() {
    let program = emit_num_plus_four();
    let mut runner = program.find_handler("main").unwrap().create_runner();
    assert_eq!(runner.run(), Err(RunError::UnlinkedNative { signature: "req.num()I".into() }));
}

#[test]
fn hand_assembled_program_runs() {
    use instruction::make;
    let code = vec![
        make(Opcode::IMOV, 0, 20, 0),
        make(Opcode::NIMUL, 1, 0, 3),
        make(Opcode::NICMPEQ, 2, 1, 60),
        make(Opcode::JZ, 2, 5, 0),
        make(Opcode::EXIT, 1, 0, 0),
        make(Opcode::EXIT, 0, 0, 0),
    ];
    let program = Program::new(ConstantPool::default(), vec![("main".into(), code)]).unwrap();
    let mut runner = program.find_handler("main").unwrap().create_runner();
    assert_eq!(runner.run(), Ok(true));
    assert_eq!(runner.registers(), &[20, 60, 1]);
}

// --- Random arithmetic agrees with Rust ---

const OPS: [BinaryOp; 6] = [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::BitAnd, BinaryOp::BitOr, BinaryOp::BitXor];

fn apply(op: BinaryOp, x: i64, y: i64) -> i64 {
    match op {
        BinaryOp::Add => x.wrapping_add(y),
        BinaryOp::Sub => x.wrapping_sub(y),
        BinaryOp::Mul => x.wrapping_mul(y),
        BinaryOp::BitAnd => x & y,
        BinaryOp::BitOr => x | y,
        _ => x ^ y,
    }
}

/// Random expression over `req.num()` and constants, with its value for `input`.
fn random_expr(rng: &mut fastrand::Rng, n: &Natives, input: i64, depth: u32) -> (Spanned<Expr>, i64) {
    if depth == 0 || rng.u8(..4) == 0 {
        return match rng.u8(..3) {
            0 => (call(n.num, vec![]), input),
            1 => {
                let k = rng.i64(-300..300);
                (num(k), k)
            }
            _ => {
                let k = rng.i64(..);
                (num(k), k)
            }
        };
    }
    let op = OPS[rng.usize(..OPS.len())];
    let (lhs, x) = random_expr(rng, n, input, depth - 1);
    let (rhs, y) = random_expr(rng, n, input, depth - 1);
    (binary(op, lhs, rhs), apply(op, x, y))
}

#[test]
fn random_arithmetic_matches_wrapping_semantics() {
    let mut rng = fastrand::Rng::with_seed(0x5eed_f10e);
    for round in 0..40 {
        let (mut unit, n) = unit();
        let input = if round % 2 == 0 { rng.i64(-1000..1000) } else { rng.i64(..) };
        let mut body = Vec::new();
        let mut expected = Vec::new();
        for _ in 0..6 {
            let (expr, value) = random_expr(&mut rng, &n, input, 4);
            body.push(stmt(n.emit, vec![expr]));
            expected.push(value);
        }
        handler(&mut unit, "main", vec![], body);

        let program = compile(&unit, &CompileOptions::default());
        let (result, trace) = run_main(&program, Trace { num: input, ..Trace::default() });
        assert_eq!(result, Ok(false), "round {round}");
        assert_eq!(trace.ints, expected, "round {round}, input {input}");
    }
}
