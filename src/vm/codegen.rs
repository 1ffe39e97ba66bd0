//! Lowering of an `IrProgram` to register bytecode.
//!
//! Every value-producing instruction gets its own register; calls reserve a
//! consecutive window (result first, then arguments). Constants are
//! materialized lazily once per block. Phi nodes turn into moves placed just
//! before each predecessor's terminator, which is sound because handlers
//! have no back edges.

use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument, trace};

use crate::ast::MatchClass;
use crate::ir::verify::reachable;
use crate::ir::{BinaryKind, BlockId, ConstId, Constant, HandlerId, InstrId, InstrKind, IrProgram, UnaryKind, Value};
use crate::types::LiteralType;

use super::instruction::{Instruction, Opcode, Operand, make};
use super::matcher::{MatchCaseDef, MatchDef};
use super::program::{ConstantPool, LoadError, Program};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("handler '{handler}' needs more than 65536 registers")]
    RegisterOverflow { handler: String },
    #[error("{what} {value} in handler '{handler}' does not fit a 16-bit operand")]
    ImmediateOverflow { handler: String, what: &'static str, value: usize },
    #[error("unknown opcode {opcode} at pc {pc} in handler '{handler}'")]
    UnknownOpcode { handler: String, pc: usize, opcode: u16 },
    #[error("cannot lower {instr} in handler '{handler}'")]
    Unlowerable { handler: String, instr: String },
}

impl EncodeError {
    pub fn code(&self) -> &'static str {
        match self {
            EncodeError::RegisterOverflow { .. } => "FLOW-E001",
            EncodeError::ImmediateOverflow { .. } => "FLOW-E002",
            EncodeError::UnknownOpcode { .. } => "FLOW-E003",
            EncodeError::Unlowerable { .. } => "FLOW-E004",
        }
    }
}

type EncodeResult<T> = Result<T, EncodeError>;

/// Turns verified IR into a loadable `Program`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TargetCodeGenerator;

impl TargetCodeGenerator {
    pub fn new() -> Self {
        TargetCodeGenerator
    }

    #[instrument(skip_all, name = "encode")]
    pub fn generate(&self, ir: &IrProgram) -> Result<Program, LoadError> {
        let mut pool = ConstantPool::default();
        for (module, path) in ir.imports() {
            pool.add_module(module, path);
        }

        let handler_indices: HashMap<HandlerId, usize> =
            ir.handlers().enumerate().map(|(index, (id, _))| (id, index)).collect();

        let mut handlers = Vec::with_capacity(handler_indices.len());
        for (index, (id, handler)) in ir.handlers().enumerate() {
            let encoder = HandlerEncoder::new(ir, &mut pool, &handler_indices, index, handler.name());
            let code = encoder.encode(id)?;
            debug!(handler = handler.name(), instructions = code.len(), "handler encoded");
            handlers.push((handler.name().to_string(), code));
        }

        let program = Program::new(pool, handlers)?;
        debug!(handlers = program.handlers().len(), "program encoded");
        Ok(program)
    }
}

#[derive(Debug, Clone, Copy)]
enum Field {
    A,
    B,
}

struct MatchFixup {
    def: usize,
    cases: Vec<BlockId>,
    otherwise: BlockId,
}

struct HandlerEncoder<'a> {
    ir: &'a IrProgram,
    pool: &'a mut ConstantPool,
    handler_indices: &'a HashMap<HandlerId, usize>,
    index: usize,
    name: &'a str,
    code: Vec<Instruction>,
    registers: HashMap<InstrId, Operand>,
    next_register: usize,
    constants: HashMap<ConstId, Operand>,
    layout: Vec<BlockId>,
    block_pcs: HashMap<BlockId, usize>,
    jumps: Vec<(usize, Field, BlockId)>,
    matches: Vec<MatchFixup>,
}

impl<'a> HandlerEncoder<'a> {
    fn new(
        ir: &'a IrProgram,
        pool: &'a mut ConstantPool,
        handler_indices: &'a HashMap<HandlerId, usize>,
        index: usize,
        name: &'a str,
    ) -> Self {
        HandlerEncoder {
            ir,
            pool,
            handler_indices,
            index,
            name,
            code: Vec::new(),
            registers: HashMap::new(),
            next_register: 0,
            constants: HashMap::new(),
            layout: Vec::new(),
            block_pcs: HashMap::new(),
            jumps: Vec::new(),
            matches: Vec::new(),
        }
    }

    fn encode(mut self, id: HandlerId) -> EncodeResult<Vec<Instruction>> {
        let ir = self.ir;
        let Some(handler) = ir.handler(id) else {
            return Err(self.unlowerable(format!("handler #{}", id.index())));
        };
        let Some(entry) = handler.entry() else {
            // an empty handler declines
            return Ok(vec![make(Opcode::EXIT, 0, 0, 0)]);
        };
        let live = reachable(ir, entry);
        self.layout = handler.blocks().iter().copied().filter(|b| live.contains(b)).collect();

        self.assign_registers()?;
        for n in 0..self.layout.len() {
            self.encode_block(n)?;
        }
        self.apply_fixups()?;
        Ok(self.code)
    }

    // ---- registers ----

    fn alloc(&mut self, count: usize) -> EncodeResult<Operand> {
        let first = self.next_register;
        if first + count > Operand::MAX as usize + 1 {
            return Err(EncodeError::RegisterOverflow { handler: self.name.to_string() });
        }
        self.next_register += count;
        Ok(first as Operand)
    }

    fn assign_registers(&mut self) -> EncodeResult<()> {
        let ir = self.ir;
        for &block in &self.layout.clone() {
            let Some(bb) = ir.block(block) else { continue };
            for &id in bb.instrs() {
                let Some(instr) = ir.instr(id) else { continue };
                let width = match instr.kind() {
                    InstrKind::CallFunction | InstrKind::InvokeHandler => instr.operands().len(),
                    InstrKind::Alloca => 1,
                    _ if instr.ty() != LiteralType::Void => 1,
                    _ => continue,
                };
                let r = self.alloc(width)?;
                self.registers.insert(id, r);
            }
        }
        Ok(())
    }

    fn register_of(&self, id: InstrId) -> EncodeResult<Operand> {
        self.registers.get(&id).copied().ok_or_else(|| self.unlowerable(format!("use of {id} without a value")))
    }

    /// Register holding `value`, materializing a constant if needed.
    fn operand(&mut self, value: Value) -> EncodeResult<Operand> {
        match value {
            Value::Instr(id) => self.register_of(id),
            Value::Constant(c) => {
                if let Some(r) = self.constants.get(&c) {
                    return Ok(*r);
                }
                let r = self.alloc(1)?;
                self.materialize(r, c)?;
                self.constants.insert(c, r);
                Ok(r)
            }
        }
    }

    /// Copies `value` into `dst`, loading constants straight into it.
    fn move_into(&mut self, dst: Operand, value: Value) -> EncodeResult<()> {
        match value {
            Value::Constant(c) if !self.constants.contains_key(&c) => self.materialize(dst, c),
            _ => {
                let src = self.operand(value)?;
                if src != dst {
                    self.emit(make(Opcode::MOV, dst, src, 0));
                }
                Ok(())
            }
        }
    }

    // ---- constants ----

    fn immediate(&self, what: &'static str, value: usize) -> EncodeResult<Operand> {
        Operand::try_from(value).map_err(|_| EncodeError::ImmediateOverflow {
            handler: self.name.to_string(),
            what,
            value,
        })
    }

    fn constant(&self, c: ConstId) -> EncodeResult<&'a Constant> {
        let ir = self.ir;
        ir.constant(c).ok_or_else(|| self.unlowerable(format!("constant {c}")))
    }

    fn materialize(&mut self, dst: Operand, c: ConstId) -> EncodeResult<()> {
        let instr = match self.constant(c)? {
            Constant::Boolean(b) => make(Opcode::IMOV, dst, *b as Operand, 0),
            Constant::Integer(n) => match i16::try_from(*n) {
                Ok(small) => make(Opcode::IMOV, dst, small as Operand, 0),
                Err(_) => {
                    let index = self.pool.make_number(*n);
                    make(Opcode::NCONST, dst, self.immediate("number constant", index)?, 0)
                }
            },
            Constant::String(s) => {
                let index = self.pool.make_string(s);
                make(Opcode::SCONST, dst, self.immediate("string constant", index)?, 0)
            }
            Constant::IPAddress(ip) => {
                let index = self.pool.make_ipaddr(*ip);
                make(Opcode::PCONST, dst, self.immediate("ipaddr constant", index)?, 0)
            }
            Constant::Cidr(cidr) => {
                let index = self.pool.make_cidr(*cidr);
                make(Opcode::CCONST, dst, self.immediate("cidr constant", index)?, 0)
            }
            Constant::RegExp(pattern) => {
                let index = self.pool.make_regex(pattern);
                make(Opcode::RCONST, dst, self.immediate("regex constant", index)?, 0)
            }
            Constant::Array { element, items } => self.array(dst, *element, items)?,
            Constant::Handler(h) => {
                let index = self.handler_index(*h)?;
                make(Opcode::IMOV, dst, self.immediate("handler index", index)?, 0)
            }
            Constant::BuiltinFunction(sig) | Constant::BuiltinHandler(sig) => {
                return Err(self.unlowerable(format!("reference to builtin {sig} as a value")));
            }
        };
        self.emit(instr);
        Ok(())
    }

    fn array(&mut self, dst: Operand, element: LiteralType, items: &[ConstId]) -> EncodeResult<Instruction> {
        let values = items.iter().map(|c| self.constant(*c)).collect::<EncodeResult<Vec<_>>>()?;
        let mismatch = || self.unlowerable(format!("{element} array with mixed elements"));
        let (op, index) = match element {
            LiteralType::Number => {
                let ints = values
                    .iter()
                    .map(|v| if let Constant::Integer(n) = v { Some(*n) } else { None })
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(mismatch)?;
                (Opcode::ITCONST, self.pool.make_int_array(ints))
            }
            LiteralType::String => {
                let strings = values
                    .iter()
                    .map(|v| if let Constant::String(s) = v { Some(s.clone()) } else { None })
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(mismatch)?;
                (Opcode::STCONST, self.pool.make_string_array(strings))
            }
            LiteralType::IPAddress => {
                let ips = values
                    .iter()
                    .map(|v| if let Constant::IPAddress(ip) = v { Some(*ip) } else { None })
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(mismatch)?;
                (Opcode::PTCONST, self.pool.make_ipaddr_array(ips))
            }
            LiteralType::Cidr => {
                let cidrs = values
                    .iter()
                    .map(|v| if let Constant::Cidr(c) = v { Some(*c) } else { None })
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(mismatch)?;
                (Opcode::CTCONST, self.pool.make_cidr_array(cidrs))
            }
            other => return Err(self.unlowerable(format!("array of {other}"))),
        };
        Ok(make(op, dst, self.immediate("array constant", index)?, 0))
    }

    fn handler_index(&self, h: HandlerId) -> EncodeResult<usize> {
        self.handler_indices.get(&h).copied().ok_or_else(|| self.unlowerable(format!("handler #{}", h.index())))
    }

    // ---- emission ----

    fn emit(&mut self, instr: Instruction) -> usize {
        let pc = self.code.len();
        self.code.push(instr);
        pc
    }

    fn emit_jump(&mut self, op: Opcode, cond: Operand, target: BlockId) {
        let (pc, field) = match op {
            Opcode::JMP => (self.emit(make(op, 0, 0, 0)), Field::A),
            _ => (self.emit(make(op, cond, 0, 0)), Field::B),
        };
        self.jumps.push((pc, field, target));
    }

    fn unlowerable(&self, instr: impl Into<String>) -> EncodeError {
        EncodeError::Unlowerable { handler: self.name.to_string(), instr: instr.into() }
    }

    fn next_block(&self, n: usize) -> Option<BlockId> {
        self.layout.get(n + 1).copied()
    }

    fn encode_block(&mut self, n: usize) -> EncodeResult<()> {
        let ir = self.ir;
        let block = self.layout[n];
        self.block_pcs.insert(block, self.code.len());
        self.constants.clear();

        let Some(bb) = ir.block(block) else { return Ok(()) };
        for &id in bb.instrs() {
            let Some(instr) = ir.instr(id) else { continue };
            if instr.kind().is_terminator() {
                self.phi_moves(block)?;
            }
            trace!(instr = %id, op = instr.kind().mnemonic(), "lowering");
            self.encode_instr(n, id)?;
        }
        Ok(())
    }

    /// Feeds every phi of every successor with the value flowing in from `block`.
    fn phi_moves(&mut self, block: BlockId) -> EncodeResult<()> {
        let ir = self.ir;
        let Some(bb) = ir.block(block) else { return Ok(()) };
        let mut seen = HashSet::new();
        for &succ in bb.successors() {
            if !seen.insert(succ) {
                continue;
            }
            for phi in ir.phis(succ) {
                let Some(instr) = ir.instr(phi) else { continue };
                let InstrKind::Phi { incoming } = instr.kind() else { continue };
                let value = incoming
                    .iter()
                    .position(|b| *b == block)
                    .and_then(|i| instr.operand(i))
                    .ok_or_else(|| self.unlowerable(format!("phi {phi} without incoming edge from {block}")))?;
                let dst = self.register_of(phi)?;
                self.move_into(dst, value)?;
            }
        }
        Ok(())
    }

    fn encode_instr(&mut self, n: usize, id: InstrId) -> EncodeResult<()> {
        let ir = self.ir;
        let Some(instr) = ir.instr(id) else { return Ok(()) };
        let ops = instr.operands();
        let handler_name = self.name;
        let arg = |i: usize| {
            instr.operand(i).ok_or_else(|| EncodeError::Unlowerable {
                handler: handler_name.to_string(),
                instr: format!("{id} missing operand {i}"),
            })
        };

        match instr.kind() {
            InstrKind::Nop | InstrKind::Alloca | InstrKind::Phi { .. } => {}

            InstrKind::Load => {
                let dst = self.register_of(id)?;
                let slot = self.operand(arg(0)?)?;
                self.emit(make(Opcode::MOV, dst, slot, 0));
            }
            InstrKind::Store => {
                let slot = self.operand(arg(0)?)?;
                self.move_into(slot, arg(1)?)?;
            }

            InstrKind::Cast => {
                let value = arg(0)?;
                let dst = self.register_of(id)?;
                let op = match (ir.type_of(value), instr.ty()) {
                    (from, to) if from == to => return self.move_into(dst, value),
                    (LiteralType::Number, LiteralType::String) => Opcode::N2S,
                    (LiteralType::IPAddress, LiteralType::String) => Opcode::P2S,
                    (LiteralType::Cidr, LiteralType::String) => Opcode::C2S,
                    (LiteralType::RegExp, LiteralType::String) => Opcode::R2S,
                    (LiteralType::String, LiteralType::Number) => Opcode::S2N,
                    (from, to) => return Err(self.unlowerable(format!("cast from {from} to {to}"))),
                };
                let src = self.operand(value)?;
                self.emit(make(op, dst, src, 0));
            }

            InstrKind::Unary(kind) => {
                let dst = self.register_of(id)?;
                let src = self.operand(arg(0)?)?;
                let op = match kind {
                    UnaryKind::INeg => Opcode::NNEG,
                    UnaryKind::INot => Opcode::NNOT,
                    UnaryKind::BNot => Opcode::BNOT,
                    UnaryKind::SLen => Opcode::SLEN,
                    UnaryKind::SIsEmpty => Opcode::SISEMPTY,
                };
                self.emit(make(op, dst, src, 0));
            }

            InstrKind::Binary(kind) => {
                let dst = self.register_of(id)?;
                let (lhs, rhs) = (arg(0)?, arg(1)?);
                if let (Some(op), Some(imm)) = (immediate_form(*kind), self.small_int(rhs)) {
                    let l = self.operand(lhs)?;
                    self.emit(make(op, dst, l, imm as Operand));
                    return Ok(());
                }
                let (l, r) = (self.operand(lhs)?, self.operand(rhs)?);
                let instr = match kind {
                    // `x in y` tests whether y contains x
                    BinaryKind::SIn => make(Opcode::SCONTAINS, dst, r, l),
                    other => make(register_form(*other), dst, l, r),
                };
                self.emit(instr);
            }

            InstrKind::RegExpGroup => {
                let dst = self.register_of(id)?;
                let group = self.operand(arg(0)?)?;
                self.emit(make(Opcode::SREGGROUP, dst, group, 0));
            }

            InstrKind::CallFunction | InstrKind::InvokeHandler => {
                let handler = matches!(instr.kind(), InstrKind::InvokeHandler);
                let Some(Value::Constant(callee)) = ops.first().copied() else {
                    return Err(self.unlowerable(format!("{id} without a callee")));
                };
                let native = match (self.constant(callee)?, handler) {
                    (Constant::BuiltinFunction(sig), false) => self.pool.make_native_function(sig),
                    (Constant::BuiltinHandler(sig), true) => self.pool.make_native_handler(sig),
                    (other, _) => return Err(self.unlowerable(format!("call through {other:?}"))),
                };
                let base = self.register_of(id)?;
                for (i, value) in ops[1..].iter().enumerate() {
                    self.move_into(base + 1 + i as Operand, *value)?;
                }
                let (op, what) = if handler { (Opcode::HANDLER, "native handler") } else { (Opcode::CALL, "native function") };
                let native = self.immediate(what, native)?;
                let argc = self.immediate("argument count", ops.len() - 1)?;
                self.emit(make(op, native, argc, base));
            }

            InstrKind::HandlerCall => {
                let callee = match arg(0)? {
                    Value::Constant(c) => match self.constant(c)? {
                        Constant::Handler(h) => self.handler_index(*h)?,
                        other => return Err(self.unlowerable(format!("handler call through {other:?}"))),
                    },
                    Value::Instr(i) => return Err(self.unlowerable(format!("indirect handler call through {i}"))),
                };
                let callee = self.immediate("handler index", callee)?;
                self.emit(make(Opcode::HCALL, callee, 0, 0));
            }

            InstrKind::Br { target } => self.branch(n, *target),

            InstrKind::CondBr { on_true, on_false } => {
                let cond = arg(0)?;
                if on_true == on_false {
                    self.branch(n, *on_true);
                } else if let Some(b) = self.bool_constant(cond) {
                    self.branch(n, if b { *on_true } else { *on_false });
                } else {
                    let c = self.operand(cond)?;
                    let next = self.next_block(n);
                    if next == Some(*on_true) {
                        self.emit_jump(Opcode::JZ, c, *on_false);
                    } else if next == Some(*on_false) {
                        self.emit_jump(Opcode::JN, c, *on_true);
                    } else {
                        self.emit_jump(Opcode::JN, c, *on_true);
                        self.emit_jump(Opcode::JMP, 0, *on_false);
                    }
                }
            }

            InstrKind::Ret => {
                let result = arg(0)?;
                match self.bool_constant(result) {
                    Some(b) => {
                        self.emit(make(Opcode::EXIT, b as Operand, 0, 0));
                    }
                    None => {
                        let r = self.operand(result)?;
                        let skip = self.immediate("jump target", self.code.len() + 2)?;
                        self.emit(make(Opcode::JZ, r, skip, 0));
                        self.emit(make(Opcode::EXIT, 1, 0, 0));
                        self.emit(make(Opcode::EXIT, 0, 0, 0));
                    }
                }
            }

            InstrKind::Match { class, cases, otherwise } => {
                let subject = self.operand(arg(0)?)?;
                let mut defs = Vec::with_capacity(cases.len());
                for (label, _) in cases {
                    let index = match (class, self.constant(*label)?) {
                        (MatchClass::RegExp, Constant::RegExp(p)) => self.pool.make_regex(p),
                        (MatchClass::Same | MatchClass::Head | MatchClass::Tail, Constant::String(s)) => {
                            self.pool.make_string(s)
                        }
                        (_, other) => return Err(self.unlowerable(format!("match label {other:?}"))),
                    };
                    defs.push(MatchCaseDef { label: index, pc: 0 });
                }
                let def = self.pool.make_match_def(MatchDef { handler: self.index, class: *class, else_pc: 0, cases: defs });
                let op = match class {
                    MatchClass::Same => Opcode::SMATCHEQ,
                    MatchClass::Head => Opcode::SMATCHBEG,
                    MatchClass::Tail => Opcode::SMATCHEND,
                    MatchClass::RegExp => Opcode::SMATCHR,
                };
                let def_operand = self.immediate("match table", def)?;
                self.emit(make(op, subject, def_operand, 0));
                self.matches.push(MatchFixup {
                    def,
                    cases: cases.iter().map(|(_, b)| *b).collect(),
                    otherwise: *otherwise,
                });
            }
        }
        Ok(())
    }

    /// Unconditional jump, dropped when `target` is laid out next.
    fn branch(&mut self, n: usize, target: BlockId) {
        if self.next_block(n) != Some(target) {
            self.emit_jump(Opcode::JMP, 0, target);
        }
    }

    fn bool_constant(&self, value: Value) -> Option<bool> {
        match value {
            Value::Constant(c) => match self.ir.constant(c) {
                Some(Constant::Boolean(b)) => Some(*b),
                _ => None,
            },
            Value::Instr(_) => None,
        }
    }

    fn small_int(&self, value: Value) -> Option<i16> {
        match value {
            Value::Constant(c) => match self.ir.constant(c) {
                Some(Constant::Integer(n)) => i16::try_from(*n).ok(),
                _ => None,
            },
            Value::Instr(_) => None,
        }
    }

    fn block_pc(&self, block: BlockId) -> EncodeResult<usize> {
        self.block_pcs.get(&block).copied().ok_or_else(|| self.unlowerable(format!("branch to unplaced {block}")))
    }

    fn apply_fixups(&mut self) -> EncodeResult<()> {
        for (pc, field, target) in std::mem::take(&mut self.jumps) {
            let dest = self.immediate("jump target", self.block_pc(target)?)? as u64;
            let shift = match field {
                Field::A => 16,
                Field::B => 32,
            };
            self.code[pc] = (self.code[pc] & !(0xFFFF_u64 << shift)) | dest << shift;
        }
        for fixup in std::mem::take(&mut self.matches) {
            let else_pc = self.block_pc(fixup.otherwise)?;
            let pcs = fixup.cases.iter().map(|b| self.block_pc(*b)).collect::<EncodeResult<Vec<_>>>()?;
            if let Some(def) = self.pool.match_def_mut(fixup.def) {
                def.else_pc = else_pc;
                for (case, pc) in def.cases.iter_mut().zip(pcs) {
                    case.pc = pc;
                }
            }
        }
        Ok(())
    }
}

fn immediate_form(kind: BinaryKind) -> Option<Opcode> {
    use BinaryKind::*;
    Some(match kind {
        IAdd => Opcode::NIADD,
        ISub => Opcode::NISUB,
        IMul => Opcode::NIMUL,
        IDiv => Opcode::NIDIV,
        IRem => Opcode::NIREM,
        IPow => Opcode::NIPOW,
        IAnd => Opcode::NIAND,
        IOr => Opcode::NIOR,
        IXor => Opcode::NIXOR,
        IShl => Opcode::NISHL,
        IShr => Opcode::NISHR,
        ICmpEQ => Opcode::NICMPEQ,
        ICmpNE => Opcode::NICMPNE,
        ICmpLE => Opcode::NICMPLE,
        ICmpGE => Opcode::NICMPGE,
        ICmpLT => Opcode::NICMPLT,
        ICmpGT => Opcode::NICMPGT,
        _ => return None,
    })
}

/// Three-register opcode for `kind`; `SIn` swaps its operands at the call site.
fn register_form(kind: BinaryKind) -> Opcode {
    use BinaryKind::*;
    match kind {
        IAdd => Opcode::NADD,
        ISub => Opcode::NSUB,
        IMul => Opcode::NMUL,
        IDiv => Opcode::NDIV,
        IRem => Opcode::NREM,
        IPow => Opcode::NPOW,
        IAnd => Opcode::NAND,
        IOr => Opcode::NOR,
        IXor => Opcode::NXOR,
        IShl => Opcode::NSHL,
        IShr => Opcode::NSHR,
        ICmpEQ => Opcode::NCMPEQ,
        ICmpNE => Opcode::NCMPNE,
        ICmpLE => Opcode::NCMPLE,
        ICmpGE => Opcode::NCMPGE,
        ICmpLT => Opcode::NCMPLT,
        ICmpGT => Opcode::NCMPGT,
        BAnd => Opcode::BAND,
        BOr => Opcode::BOR,
        BXor => Opcode::BXOR,
        SAdd => Opcode::SADD,
        SCmpEQ => Opcode::SCMPEQ,
        SCmpNE => Opcode::SCMPNE,
        SCmpLE => Opcode::SCMPLE,
        SCmpGE => Opcode::SCMPGE,
        SCmpLT => Opcode::SCMPLT,
        SCmpGT => Opcode::SCMPGT,
        SCmpRE => Opcode::SREGMATCH,
        SCmpBeg => Opcode::SCMPBEG,
        SCmpEnd => Opcode::SCMPEND,
        SIn => Opcode::SCONTAINS,
        PCmpEQ => Opcode::PCMPEQ,
        PCmpNE => Opcode::PCMPNE,
        PInCidr => Opcode::PINCIDR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrBuilder;
    use crate::vm::instruction::{operand_a, operand_b, operand_c, opcode};

    fn encode(ir: &IrProgram) -> Program {
        TargetCodeGenerator::new().generate(ir).unwrap()
    }

    fn opcodes(code: &[Instruction]) -> Vec<Opcode> {
        code.iter().map(|i| Opcode::from_raw(opcode(*i)).unwrap()).collect()
    }

    /// `main` with one entry block; `body` fills it and returns the ret value.
    fn single_block(body: impl FnOnce(&mut IrBuilder<'_>) -> Value) -> IrProgram {
        let mut ir = IrProgram::new();
        let h = ir.create_handler("main");
        let mut b = IrBuilder::new(&mut ir);
        b.set_handler(h);
        let entry = b.create_block("EntryPoint").unwrap();
        b.set_insert_point(entry);
        let result = body(&mut b);
        b.create_ret(result).unwrap();
        ir
    }

    #[test]
    fn constant_return_is_a_single_exit() {
        let ir = single_block(|b| Value::Constant(b.program_mut().get_bool(true)));
        let program = encode(&ir);
        assert_eq!(program.handlers()[0].code, vec![make(Opcode::EXIT, 1, 0, 0)]);
    }

    #[test]
    fn small_constant_rhs_uses_immediate_form() {
        let ir = single_block(|b| {
            let sig = "req.port()I".parse().unwrap();
            let f = b.program_mut().get_builtin_function(sig);
            let port = b.create_call(f, vec![], "port").unwrap();
            let k = Value::Constant(b.program_mut().get_int(8080));
            b.create_binary(BinaryKind::ICmpEQ, port, k, "is_http").unwrap()
        });
        let program = encode(&ir);
        let code = &program.handlers()[0].code;
        assert_eq!(opcodes(code), vec![Opcode::CALL, Opcode::NICMPEQ, Opcode::JZ, Opcode::EXIT, Opcode::EXIT]);
        assert_eq!(operand_c(code[1]) as i16, 8080);
        // JZ skips to the declining exit
        assert_eq!(operand_b(code[2]), 4);
    }

    #[test]
    fn wide_integer_goes_through_the_pool() {
        let ir = single_block(|b| {
            let sig = "req.size()I".parse().unwrap();
            let f = b.program_mut().get_builtin_function(sig);
            let size = b.create_call(f, vec![], "size").unwrap();
            let k = Value::Constant(b.program_mut().get_int(1 << 40));
            b.create_binary(BinaryKind::ICmpGT, size, k, "big").unwrap()
        });
        let program = encode(&ir);
        let code = &program.handlers()[0].code;
        assert_eq!(opcodes(code)[1], Opcode::NCONST);
        assert_eq!(program.constants().numbers(), &[1i64 << 40]);
        assert_eq!(opcodes(code)[2], Opcode::NCMPGT);
    }

    #[test]
    fn call_arguments_follow_the_result_register() {
        let ir = single_block(|b| {
            let sig = "log(SI)V".parse().unwrap();
            let f = b.program_mut().get_builtin_function(sig);
            let s = Value::Constant(b.program_mut().get_string("hi"));
            let n = Value::Constant(b.program_mut().get_int(3));
            b.create_call(f, vec![s, n], "").unwrap();
            Value::Constant(b.program_mut().get_bool(false))
        });
        let program = encode(&ir);
        let code = &program.handlers()[0].code;
        assert_eq!(opcodes(code), vec![Opcode::SCONST, Opcode::IMOV, Opcode::CALL, Opcode::EXIT]);
        assert_eq!((operand_a(code[0]), operand_a(code[1])), (1, 2));
        assert_eq!((operand_a(code[2]), operand_b(code[2]), operand_c(code[2])), (0, 2, 0));
        assert_eq!(program.constants().native_functions()[0].to_string(), "log(SI)V");
    }

    #[test]
    fn fallthrough_branch_is_elided() {
        let mut ir = IrProgram::new();
        let h = ir.create_handler("main");
        let mut b = IrBuilder::new(&mut ir);
        b.set_handler(h);
        let entry = b.create_block("EntryPoint").unwrap();
        let next = b.create_block("next").unwrap();
        b.set_insert_point(entry);
        b.create_br(next).unwrap();
        b.set_insert_point(next);
        let t = Value::Constant(b.program_mut().get_bool(true));
        b.create_ret(t).unwrap();
        let program = encode(&ir);
        assert_eq!(opcodes(&program.handlers()[0].code), vec![Opcode::EXIT]);
    }

    #[test]
    fn unknown_cast_is_unlowerable() {
        let ir = single_block(|b| {
            let sig = "req.secure()B".parse().unwrap();
            let f = b.program_mut().get_builtin_function(sig);
            let flag = b.create_call(f, vec![], "flag").unwrap();
            b.create_cast(LiteralType::String, flag, "s").unwrap();
            Value::Constant(b.program_mut().get_bool(false))
        });
        let err = TargetCodeGenerator::new().generate(&ir).unwrap_err();
        assert!(matches!(err, LoadError::Encode(EncodeError::Unlowerable { .. })));
    }

    #[test]
    fn encode_error_codes() {
        let e = EncodeError::RegisterOverflow { handler: "h".into() };
        assert_eq!(e.code(), "FLOW-E001");
        let e = EncodeError::Unlowerable { handler: "h".into(), instr: "x".into() };
        assert_eq!(e.code(), "FLOW-E004");
    }
}
