use std::any::Any;
use std::fmt;
use std::net::IpAddr;

use regex::Regex;
use tracing::{debug, instrument, trace};

use crate::config::RunnerLimits;
use crate::types::{Cidr, number_pow, parse_number};

use super::instruction::{Instruction, Opcode, operand_a, operand_b, operand_c, opcode};
use super::params::Params;
use super::program::Program;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("invalid register r{register} at pc {pc}")]
    InvalidRegister { register: usize, pc: usize },
    #[error("invalid {kind} handle {handle:#x}")]
    InvalidHandle { kind: &'static str, handle: u64 },
    #[error("unknown opcode {opcode} at pc {pc}")]
    UnknownOpcode { opcode: u16, pc: usize },
    #[error("division by zero at pc {pc}")]
    DivisionByZero { pc: usize },
    #[error("native callback {signature} is not linked")]
    UnlinkedNative { signature: String },
    #[error("handler call depth {depth} exceeds the limit")]
    CallDepthExceeded { depth: usize },
    #[error("runner cannot start from state {state}")]
    NotReady { state: RunnerState },
    #[error("native call failed: {0}")]
    Native(String),
}

impl RunError {
    /// Registry code of this fault.
    pub fn code(&self) -> &'static str {
        match self {
            RunError::InvalidRegister { .. } => "FLOW-R001",
            RunError::InvalidHandle { .. } => "FLOW-R002",
            RunError::DivisionByZero { .. } => "FLOW-R003",
            RunError::CallDepthExceeded { .. } => "FLOW-R004",
            RunError::UnknownOpcode { .. } => "FLOW-R005",
            RunError::NotReady { .. } => "FLOW-R006",
            RunError::UnlinkedNative { .. } => "FLOW-R007",
            RunError::Native(_) => "FLOW-R008",
        }
    }
}

pub type RunResult<T> = Result<T, RunError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Ready,
    Running,
    /// Inside a native call.
    Suspended,
    /// Finished through `EXIT`; the flag is the handler result.
    Completed(bool),
    /// Aborted by a runtime fault.
    Failed,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerState::Ready => f.write_str("ready"),
            RunnerState::Running => f.write_str("running"),
            RunnerState::Suspended => f.write_str("suspended"),
            RunnerState::Completed(r) => write!(f, "completed({r})"),
            RunnerState::Failed => f.write_str("failed"),
        }
    }
}

// ── Register values ──────────────────────────────────────────────────
//
// Registers are raw u64 words. Numbers are two's complement, booleans 0/1.
// Strings, IPs and Cidrs are handles: a constant pool index, or an index
// into the runner heap tagged with HEAP_TAG. Regexes and arrays are always
// pool indices.

pub const HEAP_TAG: u64 = 1 << 63;

#[derive(Debug, Clone)]
enum HeapValue {
    String(String),
    IPAddress(IpAddr),
    Cidr(Cidr),
}

/// Executes one handler of a program. A runner runs once.
pub struct Runner<'p> {
    program: &'p Program,
    handler: usize,
    registers: Vec<u64>,
    heap: Vec<HeapValue>,
    captures: Vec<String>,
    state: RunnerState,
    pc: usize,
    depth: usize,
    limits: RunnerLimits,
    userdata: Option<Box<dyn Any + Send>>,
}

impl fmt::Debug for Runner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("handler", &self.handler_name())
            .field("state", &self.state)
            .field("pc", &self.pc)
            .field("registers", &self.registers)
            .finish_non_exhaustive()
    }
}

impl<'p> Runner<'p> {
    pub(crate) fn new(program: &'p Program, handler: usize, limits: RunnerLimits) -> Self {
        let size = program.handler(handler).map_or(0, |h| h.register_count);
        Runner {
            program,
            handler,
            registers: vec![0; size],
            heap: Vec::new(),
            captures: Vec::new(),
            state: RunnerState::Ready,
            pc: 0,
            depth: 0,
            limits,
            userdata: None,
        }
    }

    /// Attaches host data, reachable from native callbacks via `Params::userdata`.
    pub fn with_userdata(mut self, data: Box<dyn Any + Send>) -> Self {
        self.userdata = Some(data);
        self
    }

    pub fn userdata(&self) -> Option<&(dyn Any + Send)> {
        self.userdata.as_deref()
    }

    pub fn userdata_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.userdata.as_deref_mut()
    }

    pub fn take_userdata(&mut self) -> Option<Box<dyn Any + Send>> {
        self.userdata.take()
    }

    pub fn program(&self) -> &'p Program {
        self.program
    }

    pub fn handler_name(&self) -> &'p str {
        self.program.handler(self.handler).map_or("?", |h| h.name.as_str())
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn registers(&self) -> &[u64] {
        &self.registers
    }

    /// Capture groups of the last successful regex match.
    pub fn captures(&self) -> &[String] {
        &self.captures
    }

    pub fn register(&self, index: usize) -> RunResult<u64> {
        self.registers.get(index).copied().ok_or(RunError::InvalidRegister { register: index, pc: self.pc })
    }

    pub fn set_register(&mut self, index: usize, value: u64) -> RunResult<()> {
        let pc = self.pc;
        let slot = self.registers.get_mut(index).ok_or(RunError::InvalidRegister { register: index, pc })?;
        *slot = value;
        Ok(())
    }

    // ---- heap ----

    fn alloc(&mut self, value: HeapValue) -> u64 {
        self.heap.push(value);
        (self.heap.len() as u64 - 1) | HEAP_TAG
    }

    fn heap_value(&self, handle: u64, kind: &'static str) -> RunResult<&HeapValue> {
        self.heap.get((handle & !HEAP_TAG) as usize).ok_or(RunError::InvalidHandle { kind, handle })
    }

    /// Allocates a runner-owned string and returns its handle.
    pub fn create_string(&mut self, s: impl Into<String>) -> u64 {
        self.alloc(HeapValue::String(s.into()))
    }

    pub fn create_ipaddr(&mut self, ip: IpAddr) -> u64 {
        self.alloc(HeapValue::IPAddress(ip))
    }

    pub fn create_cidr(&mut self, cidr: Cidr) -> u64 {
        self.alloc(HeapValue::Cidr(cidr))
    }

    pub fn string(&self, handle: u64) -> RunResult<&str> {
        let invalid = RunError::InvalidHandle { kind: "string", handle };
        if handle & HEAP_TAG != 0 {
            return match self.heap_value(handle, "string")? {
                HeapValue::String(s) => Ok(s),
                _ => Err(invalid),
            };
        }
        self.program.constants().strings().get(handle as usize).map(String::as_str).ok_or(invalid)
    }

    pub fn ipaddr(&self, handle: u64) -> RunResult<IpAddr> {
        let invalid = RunError::InvalidHandle { kind: "ipaddr", handle };
        if handle & HEAP_TAG != 0 {
            return match self.heap_value(handle, "ipaddr")? {
                HeapValue::IPAddress(ip) => Ok(*ip),
                _ => Err(invalid),
            };
        }
        self.program.constants().ipaddrs().get(handle as usize).copied().ok_or(invalid)
    }

    pub fn cidr(&self, handle: u64) -> RunResult<Cidr> {
        let invalid = RunError::InvalidHandle { kind: "cidr", handle };
        if handle & HEAP_TAG != 0 {
            return match self.heap_value(handle, "cidr")? {
                HeapValue::Cidr(c) => Ok(*c),
                _ => Err(invalid),
            };
        }
        self.program.constants().cidrs().get(handle as usize).copied().ok_or(invalid)
    }

    pub fn regex(&self, handle: u64) -> RunResult<&'p Regex> {
        self.program.regex(handle as usize).ok_or(RunError::InvalidHandle { kind: "regex", handle })
    }

    pub fn int_array(&self, handle: u64) -> RunResult<&'p [i64]> {
        pool_entry(self.program.constants().int_arrays(), handle, "int array")
    }

    pub fn string_array(&self, handle: u64) -> RunResult<&'p [String]> {
        pool_entry(self.program.constants().string_arrays(), handle, "string array")
    }

    pub fn ipaddr_array(&self, handle: u64) -> RunResult<&'p [IpAddr]> {
        pool_entry(self.program.constants().ipaddr_arrays(), handle, "ipaddr array")
    }

    pub fn cidr_array(&self, handle: u64) -> RunResult<&'p [Cidr]> {
        pool_entry(self.program.constants().cidr_arrays(), handle, "cidr array")
    }

    // ---- execution ----

    /// Runs the handler to completion: `Ok(true)` if it handled the
    /// invocation, `Ok(false)` if it declined, `Err` on a runtime fault.
    #[instrument(skip_all, name = "run", fields(handler = self.handler_name(), depth = self.depth))]
    pub fn run(&mut self) -> RunResult<bool> {
        if self.state != RunnerState::Ready {
            return Err(RunError::NotReady { state: self.state });
        }
        self.state = RunnerState::Running;
        let result = self.execute();
        match &result {
            Ok(accepted) => {
                self.state = RunnerState::Completed(*accepted);
                debug!(accepted, pc = self.pc, "run completed");
            }
            Err(e) => {
                self.state = RunnerState::Failed;
                debug!(error = %e, pc = self.pc, "run failed");
            }
        }
        result
    }

    fn num(&self, r: u16) -> RunResult<i64> {
        self.register(r as usize).map(|v| v as i64)
    }

    fn reg(&self, r: u16) -> RunResult<u64> {
        self.register(r as usize)
    }

    fn set(&mut self, r: u16, value: u64) -> RunResult<()> {
        self.set_register(r as usize, value)
    }

    fn str_at(&self, r: u16) -> RunResult<&str> {
        self.string(self.reg(r)?)
    }

    fn execute(&mut self) -> RunResult<bool> {
        use Opcode::*;

        let program = self.program;
        let code: &'p [Instruction] = program
            .handler(self.handler)
            .map(|h| h.code.as_slice())
            .ok_or(RunError::InvalidHandle { kind: "handler", handle: self.handler as u64 })?;

        let mut pc = 0usize;
        loop {
            // running off the end declines
            let Some(&instr) = code.get(pc) else { return Ok(false) };
            let raw = opcode(instr);
            let op = Opcode::from_raw(raw).ok_or(RunError::UnknownOpcode { opcode: raw, pc })?;
            let (a, b, c) = (operand_a(instr), operand_b(instr), operand_c(instr));
            trace!(pc, op = op.mnemonic(), a, b, c);
            self.pc = pc;
            pc += 1;

            match op {
                NOP => {}
                EXIT => return Ok(a != 0),
                JMP => pc = a as usize,
                JN => {
                    if self.reg(a)? != 0 {
                        pc = b as usize;
                    }
                }
                JZ => {
                    if self.reg(a)? == 0 {
                        pc = b as usize;
                    }
                }
                HCALL => {
                    if self.call_handler(a as usize)? {
                        return Ok(true);
                    }
                }
                MOV => {
                    let v = self.reg(b)?;
                    self.set(a, v)?;
                }

                ITCONST | STCONST | PTCONST | CTCONST | SCONST | PCONST | CCONST | RCONST => self.set(a, b as u64)?,
                IMOV => self.set(a, b as i16 as i64 as u64)?,
                NCONST => {
                    let n = program
                        .constants()
                        .numbers()
                        .get(b as usize)
                        .copied()
                        .ok_or(RunError::InvalidHandle { kind: "number", handle: b as u64 })?;
                    self.set(a, n as u64)?;
                }

                NNEG => {
                    let x = self.num(b)?;
                    self.set(a, x.wrapping_neg() as u64)?;
                }
                NNOT => {
                    let x = self.num(b)?;
                    self.set(a, !x as u64)?;
                }
                NCMPZ => {
                    let x = self.num(b)?;
                    self.set(a, (x == 0) as u64)?;
                }
                NADD | NSUB | NMUL | NDIV | NREM | NSHL | NSHR | NPOW | NAND | NOR | NXOR | NCMPEQ | NCMPNE | NCMPLE
                | NCMPGE | NCMPLT | NCMPGT => {
                    let (x, y) = (self.num(b)?, self.num(c)?);
                    let r = arith(op, x, y, self.pc)?;
                    self.set(a, r as u64)?;
                }
                NIADD | NISUB | NIMUL | NIDIV | NIREM | NISHL | NISHR | NIPOW | NIAND | NIOR | NIXOR | NICMPEQ
                | NICMPNE | NICMPLE | NICMPGE | NICMPLT | NICMPGT => {
                    let x = self.num(b)?;
                    let r = arith(op, x, c as i16 as i64, self.pc)?;
                    self.set(a, r as u64)?;
                }

                BNOT => {
                    let x = self.reg(b)?;
                    self.set(a, (x == 0) as u64)?;
                }
                BAND | BOR | BXOR => {
                    let (x, y) = (self.reg(b)? != 0, self.reg(c)? != 0);
                    let r = match op {
                        BAND => x && y,
                        BOR => x || y,
                        _ => x ^ y,
                    };
                    self.set(a, r as u64)?;
                }

                SADD => {
                    let s = format!("{}{}", self.str_at(b)?, self.str_at(c)?);
                    let h = self.create_string(s);
                    self.set(a, h)?;
                }
                SSUBSTR => {
                    let count_reg = c.checked_add(1).ok_or(RunError::InvalidRegister { register: c as usize + 1, pc: self.pc })?;
                    let offset = self.num(c)?.max(0) as usize;
                    let count = self.num(count_reg)?.max(0) as usize;
                    let sub = substr(self.str_at(b)?, offset, count).to_string();
                    let h = self.create_string(sub);
                    self.set(a, h)?;
                }
                SCMPEQ | SCMPNE | SCMPLE | SCMPGE | SCMPLT | SCMPGT | SCMPBEG | SCMPEND | SCONTAINS => {
                    let (x, y) = (self.str_at(b)?, self.str_at(c)?);
                    let r = match op {
                        SCMPEQ => x == y,
                        SCMPNE => x != y,
                        SCMPLE => x <= y,
                        SCMPGE => x >= y,
                        SCMPLT => x < y,
                        SCMPGT => x > y,
                        SCMPBEG => x.starts_with(y),
                        SCMPEND => x.ends_with(y),
                        _ => x.contains(y),
                    };
                    self.set(a, r as u64)?;
                }
                SLEN => {
                    let n = self.str_at(b)?.len();
                    self.set(a, n as u64)?;
                }
                SISEMPTY => {
                    let empty = self.str_at(b)?.is_empty();
                    self.set(a, empty as u64)?;
                }
                SMATCHEQ | SMATCHBEG | SMATCHEND | SMATCHR => {
                    let matcher = program
                        .matcher(b as usize)
                        .ok_or(RunError::InvalidHandle { kind: "match", handle: b as u64 })?;
                    let mut captures = std::mem::take(&mut self.captures);
                    let target = matcher.evaluate_with_captures(self.str_at(a)?, &mut captures);
                    self.captures = captures;
                    trace!(target, "match dispatch");
                    pc = target;
                }

                PCMPEQ | PCMPNE => {
                    let (x, y) = (self.ipaddr(self.reg(b)?)?, self.ipaddr(self.reg(c)?)?);
                    let r = if op == PCMPEQ { x == y } else { x != y };
                    self.set(a, r as u64)?;
                }
                PINCIDR => {
                    let ip = self.ipaddr(self.reg(b)?)?;
                    let net = self.cidr(self.reg(c)?)?;
                    self.set(a, net.contains(&ip) as u64)?;
                }

                SREGMATCH => {
                    let re = self.regex(self.reg(c)?)?;
                    let groups: Option<Vec<String>> = re.captures(self.str_at(b)?).map(|caps| {
                        caps.iter().map(|g| g.map_or_else(String::new, |m| m.as_str().to_string())).collect()
                    });
                    let matched = groups.is_some();
                    if let Some(groups) = groups {
                        self.captures = groups;
                    }
                    self.set(a, matched as u64)?;
                }
                SREGGROUP => {
                    let n = self.num(b)?;
                    let group = usize::try_from(n).ok().and_then(|i| self.captures.get(i)).cloned().unwrap_or_default();
                    let h = self.create_string(group);
                    self.set(a, h)?;
                }

                N2S => {
                    let s = self.num(b)?.to_string();
                    let h = self.create_string(s);
                    self.set(a, h)?;
                }
                P2S => {
                    let s = self.ipaddr(self.reg(b)?)?.to_string();
                    let h = self.create_string(s);
                    self.set(a, h)?;
                }
                C2S => {
                    let s = self.cidr(self.reg(b)?)?.to_string();
                    let h = self.create_string(s);
                    self.set(a, h)?;
                }
                R2S => {
                    let s = self.regex(self.reg(b)?)?.as_str().to_string();
                    let h = self.create_string(s);
                    self.set(a, h)?;
                }
                S2N => {
                    let n = parse_number(self.str_at(b)?);
                    self.set(a, n as u64)?;
                }

                CALL => {
                    self.call_native(a as usize, b as usize, c as usize, false)?;
                }
                HANDLER => {
                    if self.call_native(a as usize, b as usize, c as usize, true)? {
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Invokes native `id` with `argc` arguments at `base + 1..`; the result
    /// lands in `base`. Returns whether a native handler reported success.
    fn call_native(&mut self, id: usize, argc: usize, base: usize, handler: bool) -> RunResult<bool> {
        let program = self.program;
        let (callback, signatures) = if handler {
            (program.native_handler(id), program.constants().native_handlers())
        } else {
            (program.native_function(id), program.constants().native_functions())
        };
        let callback = callback.ok_or_else(|| RunError::UnlinkedNative {
            signature: signatures.get(id).map_or_else(|| format!("#{id}"), ToString::to_string),
        })?;
        if base + argc >= self.registers.len() {
            return Err(RunError::InvalidRegister { register: base + argc, pc: self.pc });
        }

        trace!(signature = %callback.signature(), argc, "native call");
        self.state = RunnerState::Suspended;
        let result = {
            let mut params = Params::new(self, base, argc);
            callback.invoke(&mut params)
        };
        self.state = RunnerState::Running;
        result?;
        Ok(handler && self.registers[base] != 0)
    }

    /// Runs handler `index` in a fresh runner one level deeper.
    fn call_handler(&mut self, index: usize) -> RunResult<bool> {
        let depth = self.depth + 1;
        if depth > self.limits.max_call_depth {
            return Err(RunError::CallDepthExceeded { depth });
        }
        if self.program.handler(index).is_none() {
            return Err(RunError::InvalidHandle { kind: "handler", handle: index as u64 });
        }
        let mut callee = Runner::new(self.program, index, self.limits);
        callee.depth = depth;
        callee.userdata = self.userdata.take();
        let result = callee.run();
        self.userdata = callee.userdata.take();
        result
    }
}

fn pool_entry<'p, T>(table: &'p [Vec<T>], handle: u64, kind: &'static str) -> RunResult<&'p [T]> {
    table.get(handle as usize).map(Vec::as_slice).ok_or(RunError::InvalidHandle { kind, handle })
}

/// Integer arithmetic and comparison shared by the register and immediate forms.
fn arith(op: Opcode, x: i64, y: i64, pc: usize) -> RunResult<i64> {
    use Opcode::*;
    Ok(match op {
        NADD | NIADD => x.wrapping_add(y),
        NSUB | NISUB => x.wrapping_sub(y),
        NMUL | NIMUL => x.wrapping_mul(y),
        NDIV | NIDIV | NREM | NIREM if y == 0 => return Err(RunError::DivisionByZero { pc }),
        NDIV | NIDIV => x.wrapping_div(y),
        NREM | NIREM => x.wrapping_rem(y),
        NSHL | NISHL => x.wrapping_shl(y as u32),
        NSHR | NISHR => x.wrapping_shr(y as u32),
        NPOW | NIPOW => number_pow(x, y),
        NAND | NIAND => x & y,
        NOR | NIOR => x | y,
        NXOR | NIXOR => x ^ y,
        NCMPEQ | NICMPEQ => (x == y) as i64,
        NCMPNE | NICMPNE => (x != y) as i64,
        NCMPLE | NICMPLE => (x <= y) as i64,
        NCMPGE | NICMPGE => (x >= y) as i64,
        NCMPLT | NICMPLT => (x < y) as i64,
        NCMPGT | NICMPGT => (x > y) as i64,
        _ => return Err(RunError::UnknownOpcode { opcode: op as u16, pc }),
    })
}

/// `count` bytes of `s` from `offset`, clamped to the string. Both ends move
/// back to the nearest character boundary.
fn substr(s: &str, offset: usize, count: usize) -> &str {
    let floor = |mut i: usize| {
        while !s.is_char_boundary(i) {
            i -= 1;
        }
        i
    };
    let start = floor(offset.min(s.len()));
    let end = floor(offset.saturating_add(count).min(s.len())).max(start);
    &s[start..end]
}
