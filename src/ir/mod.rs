//! SSA intermediate representation.
//!
//! All IR objects live in one `IrProgram`. Instructions sit in a
//! generation-checked arena so a handle to a removed instruction resolves to
//! `None` instead of aliasing whatever reused the slot. Operands are plain
//! handles; every value keeps the set of instructions that use it so operands
//! can be rewritten without a full scan.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;

use crate::ast::MatchClass;
use crate::types::{Cidr, LiteralType, Signature};

pub mod builder;
pub mod generator;
pub mod transform;
pub mod verify;

pub use builder::IrBuilder;
pub use generator::{GenerateErrors, IrGenerator};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IrError {
    #[error("stale instruction handle {0}")]
    StaleInstr(InstrId),
    #[error("unknown block {0}")]
    UnknownBlock(BlockId),
    #[error("unknown handler #{}", .0.index())]
    UnknownHandler(HandlerId),
    #[error("unknown constant {0}")]
    UnknownConstant(ConstId),
    #[error("block '{0}' already ends in a terminator")]
    BlockTerminated(String),
    #[error("operand {index} out of range for {instr}")]
    OperandOutOfRange { instr: InstrId, index: usize },
    #[error("{0} still has uses")]
    StillInUse(InstrId),
    #[error("{0} is not a phi node")]
    NotAPhi(InstrId),
    #[error("no insert point")]
    NoInsertPoint,
}

pub type IrResult<T> = Result<T, IrError>;

// ── Handles ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId {
    index: u32,
    generation: u32,
}

impl InstrId {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u32);

impl HandlerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstId(u32);

impl ConstId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ConstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Anything usable as an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Constant(ConstId),
    Instr(InstrId),
}

impl From<ConstId> for Value {
    fn from(id: ConstId) -> Self {
        Value::Constant(id)
    }
}

impl From<InstrId> for Value {
    fn from(id: InstrId) -> Self {
        Value::Instr(id)
    }
}

// ── Constants ────────────────────────────────────────────────────────

/// Interning key and payload of a constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Boolean(bool),
    Integer(i64),
    String(String),
    IPAddress(IpAddr),
    Cidr(Cidr),
    RegExp(String),
    Array { element: LiteralType, items: Vec<ConstId> },
    BuiltinFunction(Signature),
    BuiltinHandler(Signature),
    Handler(HandlerId),
}

impl Constant {
    pub fn ty(&self) -> LiteralType {
        match self {
            Constant::Boolean(_) => LiteralType::Boolean,
            Constant::Integer(_) => LiteralType::Number,
            Constant::String(_) => LiteralType::String,
            Constant::IPAddress(_) => LiteralType::IPAddress,
            Constant::Cidr(_) => LiteralType::Cidr,
            Constant::RegExp(_) => LiteralType::RegExp,
            Constant::Array { element, .. } => element.array_of().unwrap_or(LiteralType::Void),
            Constant::BuiltinFunction(sig) | Constant::BuiltinHandler(sig) => sig.ret,
            Constant::Handler(_) => LiteralType::Handler,
        }
    }
}

#[derive(Debug, Clone)]
struct ConstantData {
    constant: Constant,
    uses: BTreeSet<InstrId>,
}

// ── Instructions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryKind {
    INeg,
    INot,
    BNot,
    SLen,
    SIsEmpty,
}

impl UnaryKind {
    pub fn operand_type(self) -> LiteralType {
        match self {
            UnaryKind::INeg | UnaryKind::INot => LiteralType::Number,
            UnaryKind::BNot => LiteralType::Boolean,
            UnaryKind::SLen | UnaryKind::SIsEmpty => LiteralType::String,
        }
    }

    pub fn result_type(self) -> LiteralType {
        match self {
            UnaryKind::INeg | UnaryKind::INot | UnaryKind::SLen => LiteralType::Number,
            UnaryKind::BNot | UnaryKind::SIsEmpty => LiteralType::Boolean,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            UnaryKind::INeg => "ineg",
            UnaryKind::INot => "inot",
            UnaryKind::BNot => "bnot",
            UnaryKind::SLen => "slen",
            UnaryKind::SIsEmpty => "sisempty",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryKind {
    IAdd,
    ISub,
    IMul,
    IDiv,
    IRem,
    IPow,
    IAnd,
    IOr,
    IXor,
    IShl,
    IShr,
    ICmpEQ,
    ICmpNE,
    ICmpLE,
    ICmpGE,
    ICmpLT,
    ICmpGT,
    BAnd,
    BOr,
    BXor,
    SAdd,
    SCmpEQ,
    SCmpNE,
    SCmpLE,
    SCmpGE,
    SCmpLT,
    SCmpGT,
    SCmpRE,
    SCmpBeg,
    SCmpEnd,
    SIn,
    PCmpEQ,
    PCmpNE,
    PInCidr,
}

impl BinaryKind {
    /// Types of the (lhs, rhs) operands.
    pub fn operand_types(self) -> (LiteralType, LiteralType) {
        use BinaryKind::*;
        match self {
            IAdd | ISub | IMul | IDiv | IRem | IPow | IAnd | IOr | IXor | IShl | IShr | ICmpEQ | ICmpNE
            | ICmpLE | ICmpGE | ICmpLT | ICmpGT => (LiteralType::Number, LiteralType::Number),
            BAnd | BOr | BXor => (LiteralType::Boolean, LiteralType::Boolean),
            SAdd | SCmpEQ | SCmpNE | SCmpLE | SCmpGE | SCmpLT | SCmpGT | SCmpBeg | SCmpEnd | SIn => {
                (LiteralType::String, LiteralType::String)
            }
            SCmpRE => (LiteralType::String, LiteralType::RegExp),
            PCmpEQ | PCmpNE => (LiteralType::IPAddress, LiteralType::IPAddress),
            PInCidr => (LiteralType::IPAddress, LiteralType::Cidr),
        }
    }

    pub fn result_type(self) -> LiteralType {
        use BinaryKind::*;
        match self {
            IAdd | ISub | IMul | IDiv | IRem | IPow | IAnd | IOr | IXor | IShl | IShr => LiteralType::Number,
            SAdd => LiteralType::String,
            _ => LiteralType::Boolean,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        use BinaryKind::*;
        match self {
            IAdd => "iadd",
            ISub => "isub",
            IMul => "imul",
            IDiv => "idiv",
            IRem => "irem",
            IPow => "ipow",
            IAnd => "iand",
            IOr => "ior",
            IXor => "ixor",
            IShl => "ishl",
            IShr => "ishr",
            ICmpEQ => "icmpeq",
            ICmpNE => "icmpne",
            ICmpLE => "icmple",
            ICmpGE => "icmpge",
            ICmpLT => "icmplt",
            ICmpGT => "icmpgt",
            BAnd => "band",
            BOr => "bor",
            BXor => "bxor",
            SAdd => "sadd",
            SCmpEQ => "scmpeq",
            SCmpNE => "scmpne",
            SCmpLE => "scmple",
            SCmpGE => "scmpge",
            SCmpLT => "scmplt",
            SCmpGT => "scmpgt",
            SCmpRE => "scmpre",
            SCmpBeg => "scmpbeg",
            SCmpEnd => "scmpend",
            SIn => "sin",
            PCmpEQ => "pcmpeq",
            PCmpNE => "pcmpne",
            PInCidr => "pincidr",
        }
    }
}

/// Closed set of instruction kinds. Operand layout per kind:
///
/// | kind            | operands                  |
/// |-----------------|---------------------------|
/// | `Load`          | slot                      |
/// | `Store`         | slot, value               |
/// | `Phi`           | one value per `incoming`  |
/// | `Cast`          | value (target is the type)|
/// | `CallFunction`  | callee, args...           |
/// | `InvokeHandler` | callee, args...           |
/// | `HandlerCall`   | handler reference         |
/// | `CondBr`        | condition                 |
/// | `Ret`           | result                    |
/// | `Match`         | subject                   |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrKind {
    Nop,
    Alloca,
    Load,
    Store,
    Phi { incoming: Vec<BlockId> },
    Cast,
    Unary(UnaryKind),
    Binary(BinaryKind),
    RegExpGroup,
    CallFunction,
    InvokeHandler,
    HandlerCall,
    Br { target: BlockId },
    CondBr { on_true: BlockId, on_false: BlockId },
    Ret,
    Match { class: MatchClass, cases: Vec<(ConstId, BlockId)>, otherwise: BlockId },
}

impl InstrKind {
    pub fn is_terminator(&self) -> bool {
        matches!(self, InstrKind::Br { .. } | InstrKind::CondBr { .. } | InstrKind::Ret | InstrKind::Match { .. })
    }

    /// Block targets in the order they appear; may contain duplicates.
    pub fn targets(&self) -> Vec<BlockId> {
        match self {
            InstrKind::Br { target } => vec![*target],
            InstrKind::CondBr { on_true, on_false } => vec![*on_true, *on_false],
            InstrKind::Match { cases, otherwise, .. } => {
                let mut out: Vec<BlockId> = cases.iter().map(|(_, b)| *b).collect();
                out.push(*otherwise);
                out
            }
            _ => Vec::new(),
        }
    }

    /// False for instructions that can be dropped when unused.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            InstrKind::Store
                | InstrKind::CallFunction
                | InstrKind::InvokeHandler
                | InstrKind::HandlerCall
                | InstrKind::Binary(BinaryKind::SCmpRE)
        ) || self.is_terminator()
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            InstrKind::Nop => "nop",
            InstrKind::Alloca => "alloca",
            InstrKind::Load => "load",
            InstrKind::Store => "store",
            InstrKind::Phi { .. } => "phi",
            InstrKind::Cast => "cast",
            InstrKind::Unary(op) => op.mnemonic(),
            InstrKind::Binary(op) => op.mnemonic(),
            InstrKind::RegExpGroup => "regexpgroup",
            InstrKind::CallFunction => "call",
            InstrKind::InvokeHandler => "handler",
            InstrKind::HandlerCall => "hcall",
            InstrKind::Br { .. } => "br",
            InstrKind::CondBr { .. } => "condbr",
            InstrKind::Ret => "ret",
            InstrKind::Match { class, .. } => match class {
                MatchClass::Same => "match.same",
                MatchClass::Head => "match.head",
                MatchClass::Tail => "match.tail",
                MatchClass::RegExp => "match.re",
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instr {
    kind: InstrKind,
    operands: Vec<Value>,
    ty: LiteralType,
    name: String,
    block: BlockId,
    uses: BTreeSet<InstrId>,
}

impl Instr {
    pub fn kind(&self) -> &InstrKind {
        &self.kind
    }

    pub fn operands(&self) -> &[Value] {
        &self.operands
    }

    pub fn operand(&self, index: usize) -> Option<Value> {
        self.operands.get(index).copied()
    }

    pub fn ty(&self) -> LiteralType {
        self.ty
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn uses(&self) -> &BTreeSet<InstrId> {
        &self.uses
    }
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    instr: Option<Instr>,
}

// ── Blocks and handlers ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BasicBlock {
    name: String,
    handler: HandlerId,
    instrs: Vec<InstrId>,
    preds: Vec<BlockId>,
    succs: Vec<BlockId>,
}

impl BasicBlock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    pub fn instrs(&self) -> &[InstrId] {
        &self.instrs
    }

    pub fn predecessors(&self) -> &[BlockId] {
        &self.preds
    }

    pub fn successors(&self) -> &[BlockId] {
        &self.succs
    }
}

#[derive(Debug, Clone)]
pub struct IrHandler {
    name: String,
    blocks: Vec<BlockId>,
}

impl IrHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.blocks.first().copied()
    }
}

// ── Program ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct IrProgram {
    constants: Vec<ConstantData>,
    interned: HashMap<Constant, ConstId>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    blocks: Vec<Option<BasicBlock>>,
    handlers: Vec<IrHandler>,
    imports: Vec<(String, String)>,
}

impl IrProgram {
    pub fn new() -> Self {
        IrProgram::default()
    }

    // ---- constants ----

    /// Returns the one constant equal to `constant`, creating it on first request.
    pub fn intern(&mut self, constant: Constant) -> ConstId {
        if let Some(id) = self.interned.get(&constant) {
            return *id;
        }
        let id = ConstId(self.constants.len() as u32);
        self.interned.insert(constant.clone(), id);
        self.constants.push(ConstantData { constant, uses: BTreeSet::new() });
        id
    }

    pub fn get_bool(&mut self, b: bool) -> ConstId {
        self.intern(Constant::Boolean(b))
    }

    pub fn get_int(&mut self, n: i64) -> ConstId {
        self.intern(Constant::Integer(n))
    }

    pub fn get_string(&mut self, s: impl Into<String>) -> ConstId {
        self.intern(Constant::String(s.into()))
    }

    pub fn get_ip(&mut self, ip: IpAddr) -> ConstId {
        self.intern(Constant::IPAddress(ip))
    }

    pub fn get_cidr(&mut self, cidr: Cidr) -> ConstId {
        self.intern(Constant::Cidr(cidr))
    }

    pub fn get_regexp(&mut self, pattern: impl Into<String>) -> ConstId {
        self.intern(Constant::RegExp(pattern.into()))
    }

    pub fn get_array(&mut self, element: LiteralType, items: Vec<ConstId>) -> ConstId {
        self.intern(Constant::Array { element, items })
    }

    pub fn get_builtin_function(&mut self, signature: Signature) -> ConstId {
        self.intern(Constant::BuiltinFunction(signature))
    }

    pub fn get_builtin_handler(&mut self, signature: Signature) -> ConstId {
        self.intern(Constant::BuiltinHandler(signature))
    }

    pub fn get_handler_ref(&mut self, handler: HandlerId) -> ConstId {
        self.intern(Constant::Handler(handler))
    }

    pub fn constant(&self, id: ConstId) -> Option<&Constant> {
        self.constants.get(id.index()).map(|c| &c.constant)
    }

    pub fn constants(&self) -> impl Iterator<Item = (ConstId, &Constant)> {
        self.constants.iter().enumerate().map(|(i, c)| (ConstId(i as u32), &c.constant))
    }

    // ---- handlers and blocks ----

    pub fn create_handler(&mut self, name: impl Into<String>) -> HandlerId {
        let id = HandlerId(self.handlers.len() as u32);
        self.handlers.push(IrHandler { name: name.into(), blocks: Vec::new() });
        id
    }

    pub fn handler(&self, id: HandlerId) -> Option<&IrHandler> {
        self.handlers.get(id.index())
    }

    pub fn handlers(&self) -> impl Iterator<Item = (HandlerId, &IrHandler)> {
        self.handlers.iter().enumerate().map(|(i, h)| (HandlerId(i as u32), h))
    }

    pub fn find_handler(&self, name: &str) -> Option<HandlerId> {
        self.handlers.iter().position(|h| h.name == name).map(|i| HandlerId(i as u32))
    }

    pub fn create_block(&mut self, handler: HandlerId, name: impl Into<String>) -> IrResult<BlockId> {
        let id = BlockId(self.blocks.len() as u32);
        let h = self.handlers.get_mut(handler.index()).ok_or(IrError::UnknownHandler(handler))?;
        h.blocks.push(id);
        self.blocks.push(Some(BasicBlock {
            name: name.into(),
            handler,
            instrs: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
        }));
        Ok(id)
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.index()).and_then(Option::as_ref)
    }

    fn block_mut(&mut self, id: BlockId) -> IrResult<&mut BasicBlock> {
        self.blocks.get_mut(id.index()).and_then(Option::as_mut).ok_or(IrError::UnknownBlock(id))
    }

    pub fn terminator(&self, block: BlockId) -> Option<InstrId> {
        let last = *self.block(block)?.instrs.last()?;
        self.instr(last).filter(|i| i.kind.is_terminator()).map(|_| last)
    }

    pub fn is_terminated(&self, block: BlockId) -> bool {
        self.terminator(block).is_some()
    }

    /// Adds the edge `from -> to` on both ends. Idempotent.
    pub fn link_successor(&mut self, from: BlockId, to: BlockId) -> IrResult<()> {
        self.block_mut(to)?;
        let f = self.block_mut(from)?;
        if !f.succs.contains(&to) {
            f.succs.push(to);
        }
        let t = self.block_mut(to)?;
        if !t.preds.contains(&from) {
            t.preds.push(from);
        }
        Ok(())
    }

    /// Removes the edge `from -> to` on both ends.
    pub fn unlink_successor(&mut self, from: BlockId, to: BlockId) -> IrResult<()> {
        self.block_mut(to)?;
        self.block_mut(from)?.succs.retain(|b| *b != to);
        self.block_mut(to)?.preds.retain(|b| *b != from);
        Ok(())
    }

    // ---- instructions ----

    pub fn instr(&self, id: InstrId) -> Option<&Instr> {
        self.slots
            .get(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.instr.as_ref())
    }

    fn instr_mut(&mut self, id: InstrId) -> IrResult<&mut Instr> {
        self.slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.instr.as_mut())
            .ok_or(IrError::StaleInstr(id))
    }

    pub fn is_live(&self, value: Value) -> bool {
        match value {
            Value::Constant(c) => c.index() < self.constants.len(),
            Value::Instr(i) => self.instr(i).is_some(),
        }
    }

    /// Appends an instruction to `block`. Terminators link their targets.
    pub fn append_instr(
        &mut self,
        block: BlockId,
        kind: InstrKind,
        operands: Vec<Value>,
        ty: LiteralType,
        name: impl Into<String>,
    ) -> IrResult<InstrId> {
        if self.is_terminated(block) {
            let name = self.block_mut(block)?.name.clone();
            return Err(IrError::BlockTerminated(name));
        }
        self.block_mut(block)?;
        for op in &operands {
            if !self.is_live(*op) {
                return Err(match op {
                    Value::Instr(i) => IrError::StaleInstr(*i),
                    Value::Constant(c) => IrError::UnknownConstant(*c),
                });
            }
        }

        let targets = kind.targets();
        let instr = Instr { kind, operands, ty, name: name.into(), block, uses: BTreeSet::new() };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.instr = Some(instr);
                InstrId { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, instr: Some(instr) });
                InstrId { index, generation: 0 }
            }
        };

        let operands = self.instr(id).map(|i| i.operands.clone()).unwrap_or_default();
        for op in operands {
            self.add_use(op, id);
        }
        self.block_mut(block)?.instrs.push(id);
        for target in targets {
            self.link_successor(block, target)?;
        }
        Ok(id)
    }

    fn add_use(&mut self, value: Value, user: InstrId) {
        match value {
            Value::Constant(c) => {
                if let Some(data) = self.constants.get_mut(c.index()) {
                    data.uses.insert(user);
                }
            }
            Value::Instr(i) => {
                if let Ok(instr) = self.instr_mut(i) {
                    instr.uses.insert(user);
                }
            }
        }
    }

    /// Drops `user` from `value`'s use-set unless another operand still refers to it.
    fn drop_use(&mut self, value: Value, user: InstrId) {
        let still_used = self.instr(user).is_some_and(|u| u.operands.contains(&value));
        if still_used {
            return;
        }
        match value {
            Value::Constant(c) => {
                if let Some(data) = self.constants.get_mut(c.index()) {
                    data.uses.remove(&user);
                }
            }
            Value::Instr(i) => {
                if let Ok(instr) = self.instr_mut(i) {
                    instr.uses.remove(&user);
                }
            }
        }
    }

    pub fn uses_of(&self, value: Value) -> Option<&BTreeSet<InstrId>> {
        match value {
            Value::Constant(c) => self.constants.get(c.index()).map(|d| &d.uses),
            Value::Instr(i) => self.instr(i).map(|i| &i.uses),
        }
    }

    pub fn type_of(&self, value: Value) -> LiteralType {
        match value {
            Value::Constant(c) => self.constant(c).map_or(LiteralType::Void, Constant::ty),
            Value::Instr(i) => self.instr(i).map_or(LiteralType::Void, |i| i.ty),
        }
    }

    pub fn set_operand(&mut self, instr: InstrId, index: usize, value: Value) -> IrResult<()> {
        let old = {
            let i = self.instr_mut(instr)?;
            let slot = i.operands.get_mut(index).ok_or(IrError::OperandOutOfRange { instr, index })?;
            std::mem::replace(slot, value)
        };
        self.drop_use(old, instr);
        self.add_use(value, instr);
        Ok(())
    }

    /// Rewrites every operand equal to `old` into `new`. Returns the number of users rewritten.
    pub fn replace_all_uses_with(&mut self, old: Value, new: Value) -> IrResult<usize> {
        if old == new {
            return Ok(0);
        }
        let users: Vec<InstrId> = self.uses_of(old).map(|u| u.iter().copied().collect()).unwrap_or_default();
        for user in &users {
            let positions: Vec<usize> = match self.instr(*user) {
                Some(i) => i.operands.iter().enumerate().filter(|(_, v)| **v == old).map(|(n, _)| n).collect(),
                None => continue,
            };
            for n in positions {
                self.set_operand(*user, n, new)?;
            }
        }
        Ok(users.len())
    }

    /// Adds one incoming `(value, block)` pair to a phi node.
    pub fn add_phi_incoming(&mut self, phi: InstrId, value: Value, block: BlockId) -> IrResult<()> {
        let i = self.instr_mut(phi)?;
        match &mut i.kind {
            InstrKind::Phi { incoming } => incoming.push(block),
            _ => return Err(IrError::NotAPhi(phi)),
        }
        i.operands.push(value);
        self.add_use(value, phi);
        Ok(())
    }

    /// Drops every incoming pair of `phi` that arrives from `block`.
    pub fn remove_phi_incoming(&mut self, phi: InstrId, block: BlockId) -> IrResult<()> {
        let removed = {
            let i = self.instr_mut(phi)?;
            let InstrKind::Phi { incoming } = &mut i.kind else {
                return Err(IrError::NotAPhi(phi));
            };
            let mut removed = Vec::new();
            let mut n = 0;
            while n < incoming.len() {
                if incoming[n] == block {
                    incoming.remove(n);
                    removed.push(i.operands.remove(n));
                } else {
                    n += 1;
                }
            }
            removed
        };
        for value in removed {
            self.drop_use(value, phi);
        }
        Ok(())
    }

    /// Rewrites the block targets of a terminator, keeping the edges in sync.
    pub fn retarget(&mut self, term: InstrId, from: BlockId, to: BlockId) -> IrResult<()> {
        let block = {
            let i = self.instr_mut(term)?;
            let swap = |b: &mut BlockId| {
                if *b == from {
                    *b = to;
                }
            };
            match &mut i.kind {
                InstrKind::Br { target } => swap(target),
                InstrKind::CondBr { on_true, on_false } => {
                    swap(on_true);
                    swap(on_false);
                }
                InstrKind::Match { cases, otherwise, .. } => {
                    cases.iter_mut().for_each(|(_, b)| swap(b));
                    swap(otherwise);
                }
                _ => {}
            }
            i.block
        };
        self.unlink_successor(block, from)?;
        self.link_successor(block, to)
    }

    /// Removes an unused instruction; its handle goes stale.
    pub fn remove_instr(&mut self, id: InstrId) -> IrResult<Instr> {
        let (block, targets) = {
            let i = self.instr(id).ok_or(IrError::StaleInstr(id))?;
            if !i.uses.is_empty() {
                return Err(IrError::StillInUse(id));
            }
            (i.block, i.kind.targets())
        };
        self.detach(id)?;
        for target in targets {
            if self.block(target).is_some() {
                self.unlink_successor(block, target)?;
            }
        }
        self.block_mut(block)?.instrs.retain(|i| *i != id);
        let slot = &mut self.slots[id.index()];
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        slot.instr.take().ok_or(IrError::StaleInstr(id))
    }

    /// Clears the operand list of `id`, releasing its uses.
    fn detach(&mut self, id: InstrId) -> IrResult<()> {
        let operands = std::mem::take(&mut self.instr_mut(id)?.operands);
        for op in operands {
            self.drop_use(op, id);
        }
        Ok(())
    }

    /// Deletes a block and everything in it. Phi nodes in successors lose
    /// their incoming pairs from this block.
    pub fn remove_block(&mut self, id: BlockId) -> IrResult<()> {
        let (handler, instrs, succs, preds) = {
            let b = self.block(id).ok_or(IrError::UnknownBlock(id))?;
            (b.handler, b.instrs.clone(), b.succs.clone(), b.preds.clone())
        };
        for succ in succs {
            let phis: Vec<InstrId> = self.phis(succ);
            for phi in phis {
                self.remove_phi_incoming(phi, id)?;
            }
            self.unlink_successor(id, succ)?;
        }
        for pred in preds {
            self.unlink_successor(pred, id)?;
        }
        for instr in &instrs {
            self.detach(*instr)?;
        }
        for instr in instrs {
            let slot = &mut self.slots[instr.index()];
            slot.instr = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(instr.index);
        }
        if let Some(h) = self.handlers.get_mut(handler.index()) {
            h.blocks.retain(|b| *b != id);
        }
        self.blocks[id.index()] = None;
        Ok(())
    }

    /// Phi nodes at the head of `block`.
    pub fn phis(&self, block: BlockId) -> Vec<InstrId> {
        self.block(block)
            .map(|b| {
                b.instrs
                    .iter()
                    .copied()
                    .take_while(|i| self.instr(*i).is_some_and(|i| matches!(i.kind, InstrKind::Phi { .. })))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Moves all instructions of `src` to the end of `dst`. Used when merging
    /// straight-line blocks; `dst` must not be terminated.
    pub(crate) fn splice_block(&mut self, dst: BlockId, src: BlockId) -> IrResult<()> {
        if self.is_terminated(dst) {
            let name = self.block_mut(dst)?.name.clone();
            return Err(IrError::BlockTerminated(name));
        }
        let moved = std::mem::take(&mut self.block_mut(src)?.instrs);
        for instr in &moved {
            self.instr_mut(*instr)?.block = dst;
        }
        let succs = self.block_mut(src)?.succs.clone();
        for succ in succs {
            for phi in self.phis(succ) {
                let i = self.instr_mut(phi)?;
                if let InstrKind::Phi { incoming } = &mut i.kind {
                    incoming.iter_mut().filter(|b| **b == src).for_each(|b| *b = dst);
                }
            }
            self.unlink_successor(src, succ)?;
            self.link_successor(dst, succ)?;
        }
        self.block_mut(dst)?.instrs.extend(moved);
        Ok(())
    }

    // ---- imports ----

    pub fn add_import(&mut self, module: impl Into<String>, path: impl Into<String>) {
        self.imports.push((module.into(), path.into()));
    }

    pub fn imports(&self) -> &[(String, String)] {
        &self.imports
    }

    // ---- display helpers ----

    fn fmt_value(&self, value: Value) -> String {
        match value {
            Value::Instr(i) => match self.instr(i) {
                Some(instr) if !instr.name.is_empty() => format!("%{}", instr.name),
                _ => i.to_string(),
            },
            Value::Constant(c) => match self.constant(c) {
                Some(constant) => self.fmt_constant(constant),
                None => c.to_string(),
            },
        }
    }

    fn fmt_constant(&self, constant: &Constant) -> String {
        match constant {
            Constant::Boolean(b) => b.to_string(),
            Constant::Integer(n) => n.to_string(),
            Constant::String(s) => format!("{s:?}"),
            Constant::IPAddress(ip) => ip.to_string(),
            Constant::Cidr(c) => c.to_string(),
            Constant::RegExp(r) => format!("/{r}/"),
            Constant::Array { items, .. } => {
                let parts: Vec<String> = items.iter().map(|c| self.fmt_value(Value::Constant(*c))).collect();
                format!("[{}]", parts.join(", "))
            }
            Constant::BuiltinFunction(sig) | Constant::BuiltinHandler(sig) => format!("@{sig}"),
            Constant::Handler(h) => match self.handler(*h) {
                Some(h) => format!("@{}", h.name),
                None => "@?".to_string(),
            },
        }
    }

    fn block_label(&self, id: BlockId) -> String {
        self.block(id).map_or_else(|| id.to_string(), |b| b.name.clone())
    }
}

impl fmt::Display for IrProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (module, path) in &self.imports {
            writeln!(f, "import {module} from {path:?}")?;
        }
        for handler in &self.handlers {
            writeln!(f, "handler {} {{", handler.name)?;
            for block in &handler.blocks {
                let Some(bb) = self.block(*block) else { continue };
                writeln!(f, "{}:", bb.name)?;
                for id in &bb.instrs {
                    let Some(instr) = self.instr(*id) else { continue };
                    let operands: Vec<String> = instr.operands.iter().map(|v| self.fmt_value(*v)).collect();
                    let mut line = String::from("  ");
                    if instr.ty != LiteralType::Void {
                        line.push_str(&format!("%{} = ", instr.name));
                    }
                    line.push_str(instr.kind.mnemonic());
                    if !operands.is_empty() {
                        line.push(' ');
                        line.push_str(&operands.join(", "));
                    }
                    match &instr.kind {
                        InstrKind::Phi { incoming } => {
                            let from: Vec<String> = incoming.iter().map(|b| self.block_label(*b)).collect();
                            line.push_str(&format!(" [{}]", from.join(", ")));
                        }
                        InstrKind::Cast => line.push_str(&format!(" to {}", instr.ty)),
                        kind if kind.is_terminator() => {
                            let targets: Vec<String> = match kind {
                                InstrKind::Match { cases, otherwise, .. } => cases
                                    .iter()
                                    .map(|(label, b)| {
                                        format!("{} -> {}", self.fmt_value(Value::Constant(*label)), self.block_label(*b))
                                    })
                                    .chain(std::iter::once(format!("else -> {}", self.block_label(*otherwise))))
                                    .collect(),
                                other => other.targets().iter().map(|b| self.block_label(*b)).collect(),
                            };
                            if !targets.is_empty() {
                                line.push_str(&format!(" {}", targets.join(", ")));
                            }
                        }
                        _ => {}
                    }
                    writeln!(f, "{line}")?;
                }
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}
