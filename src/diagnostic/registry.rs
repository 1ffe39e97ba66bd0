/// An entry in the diagnostic code registry.
pub struct ErrorEntry {
    pub code: &'static str,
    pub short: &'static str,
    pub long: &'static str,
}

/// All stable diagnostic codes. Prefixes: `G` IR generation, `E` bytecode
/// encoding, `L` loading and linking, `R` runtime faults.
pub static REGISTRY: &[ErrorEntry] = &[
    // ── IR generation ────────────────────────────────────────────────────────
    ErrorEntry {
        code: "FLOW-G001",
        short: "unknown symbol",
        long: r#"## FLOW-G001: unknown symbol

An expression, call or export refers to a symbol that does not exist, or to
a variable that is not in scope at that point.

**Common causes:**
- An export name that matches no handler in the unit
- A symbol id in a hand-written AST that is past the end of the symbol table
- A handler-local variable read from another handler
"#,
    },
    ErrorEntry {
        code: "FLOW-G002",
        short: "wrong number of arguments",
        long: r#"## FLOW-G002: wrong number of arguments

A call passes a different number of arguments than the callee's signature
declares.

**Example:** calling `log(SI)V` with one argument:

    log("request seen")

**Fix:** pass every declared argument:

    log("request seen", 1)
"#,
    },
    ErrorEntry {
        code: "FLOW-G003",
        short: "type mismatch",
        long: r#"## FLOW-G003: type mismatch

An operand, argument, condition or assignment has a type that the operation
does not accept. Binary operators only exist for specific operand type pairs:
`+` on two numbers or two strings, `=^` on two strings, `in` with an IP on the
left and a Cidr on the right, and so on.

Conditions of `if` must be booleans; `match` subjects must be strings.
An empty array literal has no element type and is reported here too.
"#,
    },
    ErrorEntry {
        code: "FLOW-G004",
        short: "recursive handler inlining",
        long: r#"## FLOW-G004: recursive handler inlining

With inline handler calls, a handler that (directly or indirectly) calls
itself would expand forever. The note on the diagnostic shows the call chain.

**Fix:** break the cycle, or compile with `handler_calls = "call"` so
handler calls become runtime calls bounded by `max_call_depth`.
"#,
    },
    ErrorEntry {
        code: "FLOW-G005",
        short: "duplicate match label",
        long: r#"## FLOW-G005: duplicate match label

Two cases of one `match` statement use the same label. Only the first case
could ever be taken. A label repeated inside a single case is a warning; a
label shared between different cases is an error.
"#,
    },
    ErrorEntry {
        code: "FLOW-G006",
        short: "invalid match label",
        long: r#"## FLOW-G006: invalid match label

Match labels must be constant strings, or constant regular expressions when
the match uses `=~`. Variables, calls and other literal kinds are rejected.
"#,
    },
    ErrorEntry {
        code: "FLOW-G007",
        short: "non-constant array element",
        long: r#"## FLOW-G007: non-constant array element

Array literals are stored in the constant pool, so every element must be a
literal of the same type (numbers, strings, IP addresses or Cidrs).
"#,
    },
    ErrorEntry {
        code: "FLOW-G008",
        short: "invalid regular expression",
        long: r#"## FLOW-G008: invalid regular expression

A regular expression literal does not compile. The diagnostic note carries
the error reported by the regex engine.
"#,
    },
    ErrorEntry {
        code: "FLOW-G009",
        short: "handler without body",
        long: r#"## FLOW-G009: handler without body

A handler was declared but never defined, and something exports or calls
it. Give the handler a body or remove the reference.
"#,
    },
    ErrorEntry {
        code: "FLOW-G010",
        short: "symbol used in the wrong role",
        long: r#"## FLOW-G010: symbol used in the wrong role

A symbol was used in a way its kind does not allow: calling a variable,
assigning to a handler, or passing a handler as a value where the callee does
not take a handler reference.
"#,
    },
    ErrorEntry {
        code: "FLOW-G011",
        short: "internal IR error",
        long: r#"## FLOW-G011: internal IR error

An IR construction primitive rejected an operation (for example appending
after a terminator). This indicates a compiler bug, not a problem with the
input program.
"#,
    },
    ErrorEntry {
        code: "FLOW-G012",
        short: "IR verification failed",
        long: r#"## FLOW-G012: IR verification failed

The IR verifier found a structural problem: a missing or misplaced
terminator, asymmetric block edges, a phi that disagrees with the block's
predecessors, or a use that its definition does not dominate.
"#,
    },

    // ── Encoding ─────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "FLOW-E001",
        short: "register out of range",
        long: r#"## FLOW-E001: register out of range

A handler needs more registers than a 16-bit register operand can address.
Split the handler into smaller handlers.
"#,
    },
    ErrorEntry {
        code: "FLOW-E002",
        short: "immediate out of range",
        long: r#"## FLOW-E002: immediate out of range

A constant pool index, jump target or handler index does not fit into a
16-bit operand.
"#,
    },
    ErrorEntry {
        code: "FLOW-E003",
        short: "unknown opcode",
        long: r#"## FLOW-E003: unknown opcode

A code stream handed to `Program::new` contains an instruction word whose
opcode is not in the instruction set.
"#,
    },
    ErrorEntry {
        code: "FLOW-E004",
        short: "unlowerable IR",
        long: r#"## FLOW-E004: unlowerable IR

The encoder met an IR construct it has no bytecode for, such as a cast
between unsupported types or a phi without an incoming value for one of its
predecessors.
"#,
    },

    // ── Load / link ──────────────────────────────────────────────────────────
    ErrorEntry {
        code: "FLOW-L001",
        short: "unresolved native callback",
        long: r#"## FLOW-L001: unresolved native callback

`Program::link` found native function or handler signatures that the runtime
does not provide. Each missing signature is listed in a note. Register them
with `Runtime::register_function` / `Runtime::register_handler`, matching the
signature exactly (name, argument codes and return code).
"#,
    },
    ErrorEntry {
        code: "FLOW-L002",
        short: "program load failed",
        long: r#"## FLOW-L002: program load failed

The constant pool contains a regular expression that does not compile, or a
match table refers to a label that is not in the pool.
"#,
    },
    ErrorEntry {
        code: "FLOW-L003",
        short: "control transfer out of range",
        long: r#"## FLOW-L003: control transfer out of range

A `JMP`, `JN` or `JZ` targets a program counter outside its handler, a match
table sends a case or its fallback outside the handler it belongs to, or an
`HCALL` names a handler the program does not have. The code stream is
rejected at load instead of failing at run time.
"#,
    },

    // ── Runtime ──────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "FLOW-R001",
        short: "invalid register",
        long: r#"## FLOW-R001: invalid register

An instruction or native callback accessed a register outside the handler's
register frame.
"#,
    },
    ErrorEntry {
        code: "FLOW-R002",
        short: "invalid handle",
        long: r#"## FLOW-R002: invalid handle

A register that should hold a string, IP, Cidr, regex or array handle holds
an index that is neither in the constant pool nor on the runner heap.
"#,
    },
    ErrorEntry {
        code: "FLOW-R003",
        short: "division by zero",
        long: r#"## FLOW-R003: division by zero

An integer division or remainder had a zero divisor. The run is aborted.
"#,
    },
    ErrorEntry {
        code: "FLOW-R004",
        short: "handler call depth exceeded",
        long: r#"## FLOW-R004: handler call depth exceeded

Handler calls nested deeper than `RunnerLimits::max_call_depth`, usually
because handlers call each other in a cycle.
"#,
    },
    ErrorEntry {
        code: "FLOW-R005",
        short: "unknown opcode at runtime",
        long: r#"## FLOW-R005: unknown opcode at runtime

The runner decoded an instruction word with an opcode outside the
instruction set.
"#,
    },
    ErrorEntry {
        code: "FLOW-R006",
        short: "runner not ready",
        long: r#"## FLOW-R006: runner not ready

`Runner::run` was called on a runner that already ran. Create a fresh
runner for each invocation.
"#,
    },
    ErrorEntry {
        code: "FLOW-R007",
        short: "unlinked native callback",
        long: r#"## FLOW-R007: unlinked native callback

The program called a native function or handler that was never bound.
Call `Program::link` with a runtime that provides every signature first.
"#,
    },
    ErrorEntry {
        code: "FLOW-R008",
        short: "native callback failed",
        long: r#"## FLOW-R008: native callback failed

A native callback returned an error, for example after reading an argument
outside its argument window.
"#,
    },
];

/// Look up an entry by code (e.g. `"FLOW-G003"`).
pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    REGISTRY.iter().find(|e| e.code == code)
}
