use std::collections::HashMap;

use crate::ast::MatchClass;
use crate::types::{LiteralType, number_pow, parse_number};

use super::{
    BinaryKind, BlockId, ConstId, Constant, HandlerId, InstrKind, IrError, IrProgram, IrResult, UnaryKind, Value,
};

/// Positioned instruction factory over an `IrProgram`.
///
/// Every `create_*` method folds when all operands are constants and the
/// result is pure, returning an interned constant instead of an instruction.
pub struct IrBuilder<'p> {
    program: &'p mut IrProgram,
    handler: Option<HandlerId>,
    insert_point: Option<BlockId>,
    names: HashMap<String, usize>,
}

impl<'p> IrBuilder<'p> {
    pub fn new(program: &'p mut IrProgram) -> Self {
        IrBuilder { program, handler: None, insert_point: None, names: HashMap::new() }
    }

    pub fn program(&self) -> &IrProgram {
        &*self.program
    }

    pub fn program_mut(&mut self) -> &mut IrProgram {
        &mut *self.program
    }

    pub fn handler(&self) -> Option<HandlerId> {
        self.handler
    }

    /// Targets `handler`; value names restart per handler.
    pub fn set_handler(&mut self, handler: HandlerId) {
        self.handler = Some(handler);
        self.insert_point = None;
        self.names.clear();
    }

    pub fn create_block(&mut self, name: &str) -> IrResult<BlockId> {
        let handler = self.handler.ok_or(IrError::NoInsertPoint)?;
        let name = self.make_name(name);
        self.program.create_block(handler, name)
    }

    pub fn set_insert_point(&mut self, block: BlockId) {
        self.insert_point = Some(block);
    }

    pub fn insert_point(&self) -> Option<BlockId> {
        self.insert_point
    }

    fn make_name(&mut self, base: &str) -> String {
        let base = if base.is_empty() { "tmp" } else { base };
        let n = self.names.entry(base.to_string()).or_insert(0);
        let name = if *n == 0 { base.to_string() } else { format!("{base}{n}") };
        *n += 1;
        name
    }

    fn insert(&mut self, kind: InstrKind, operands: Vec<Value>, ty: LiteralType, name: &str) -> IrResult<Value> {
        let mut block = self.insert_point.ok_or(IrError::NoInsertPoint)?;
        if self.program.is_terminated(block) {
            // code after a terminator is unreachable; give it its own block
            block = self.create_block("unreachable")?;
            self.insert_point = Some(block);
        }
        let name = if ty == LiteralType::Void { String::new() } else { self.make_name(name) };
        self.program.append_instr(block, kind, operands, ty, name).map(Value::Instr)
    }

    fn constant_of(&self, value: Value) -> Option<&Constant> {
        match value {
            Value::Constant(c) => self.program.constant(c),
            Value::Instr(_) => None,
        }
    }

    // ---- values ----

    pub fn create_unary(&mut self, op: UnaryKind, operand: Value, name: &str) -> IrResult<Value> {
        let folded = match (op, self.constant_of(operand)) {
            (UnaryKind::INeg, Some(Constant::Integer(n))) => Some(Constant::Integer(n.wrapping_neg())),
            (UnaryKind::INot, Some(Constant::Integer(n))) => Some(Constant::Integer(!n)),
            (UnaryKind::BNot, Some(Constant::Boolean(b))) => Some(Constant::Boolean(!b)),
            (UnaryKind::SLen, Some(Constant::String(s))) => Some(Constant::Integer(s.len() as i64)),
            (UnaryKind::SIsEmpty, Some(Constant::String(s))) => Some(Constant::Boolean(s.is_empty())),
            _ => None,
        };
        if let Some(c) = folded {
            return Ok(Value::Constant(self.program.intern(c)));
        }
        self.insert(InstrKind::Unary(op), vec![operand], op.result_type(), name)
    }

    pub fn create_binary(&mut self, op: BinaryKind, lhs: Value, rhs: Value, name: &str) -> IrResult<Value> {
        if let (Some(a), Some(b)) = (self.constant_of(lhs), self.constant_of(rhs)) {
            if let Some(c) = fold_binary(op, a, b) {
                return Ok(Value::Constant(self.program.intern(c)));
            }
        }
        self.insert(InstrKind::Binary(op), vec![lhs, rhs], op.result_type(), name)
    }

    /// Converts `value` to `target`. Same-type casts are no-ops.
    pub fn create_cast(&mut self, target: LiteralType, value: Value, name: &str) -> IrResult<Value> {
        if self.program.type_of(value) == target {
            return Ok(value);
        }
        let folded = match (target, self.constant_of(value)) {
            (LiteralType::String, Some(Constant::Integer(n))) => Some(Constant::String(n.to_string())),
            (LiteralType::String, Some(Constant::IPAddress(ip))) => Some(Constant::String(ip.to_string())),
            (LiteralType::String, Some(Constant::Cidr(c))) => Some(Constant::String(c.to_string())),
            (LiteralType::String, Some(Constant::RegExp(r))) => Some(Constant::String(r.clone())),
            (LiteralType::Number, Some(Constant::String(s))) => Some(Constant::Integer(parse_number(s))),
            _ => None,
        };
        if let Some(c) = folded {
            return Ok(Value::Constant(self.program.intern(c)));
        }
        self.insert(InstrKind::Cast, vec![value], target, name)
    }

    pub fn create_regexp_group(&mut self, group: Value, name: &str) -> IrResult<Value> {
        self.insert(InstrKind::RegExpGroup, vec![group], LiteralType::String, name)
    }

    pub fn create_alloca(&mut self, ty: LiteralType, name: &str) -> IrResult<Value> {
        self.insert(InstrKind::Alloca, vec![], ty, name)
    }

    pub fn create_load(&mut self, slot: Value, name: &str) -> IrResult<Value> {
        let ty = self.program.type_of(slot);
        self.insert(InstrKind::Load, vec![slot], ty, name)
    }

    pub fn create_store(&mut self, slot: Value, value: Value) -> IrResult<Value> {
        self.insert(InstrKind::Store, vec![slot, value], LiteralType::Void, "")
    }

    /// Phi node at the current insert point, typed after its first incoming value.
    pub fn create_phi(&mut self, incoming: Vec<(Value, BlockId)>, name: &str) -> IrResult<Value> {
        let ty = incoming.first().map_or(LiteralType::Void, |(v, _)| self.program.type_of(*v));
        let (values, blocks): (Vec<Value>, Vec<BlockId>) = incoming.into_iter().unzip();
        self.insert(InstrKind::Phi { incoming: blocks }, values, ty, name)
    }

    pub fn create_call(&mut self, callee: ConstId, args: Vec<Value>, name: &str) -> IrResult<Value> {
        let ty = self.program.type_of(Value::Constant(callee));
        let mut operands = vec![Value::Constant(callee)];
        operands.extend(args);
        self.insert(InstrKind::CallFunction, operands, ty, name)
    }

    pub fn create_invoke_handler(&mut self, callee: ConstId, args: Vec<Value>) -> IrResult<Value> {
        let mut operands = vec![Value::Constant(callee)];
        operands.extend(args);
        self.insert(InstrKind::InvokeHandler, operands, LiteralType::Void, "")
    }

    pub fn create_handler_call(&mut self, handler: HandlerId) -> IrResult<Value> {
        let callee = self.program.get_handler_ref(handler);
        self.insert(InstrKind::HandlerCall, vec![Value::Constant(callee)], LiteralType::Void, "")
    }

    // ---- terminators ----

    pub fn create_br(&mut self, target: BlockId) -> IrResult<Value> {
        self.insert(InstrKind::Br { target }, vec![], LiteralType::Void, "")
    }

    pub fn create_cond_br(&mut self, condition: Value, on_true: BlockId, on_false: BlockId) -> IrResult<Value> {
        self.insert(InstrKind::CondBr { on_true, on_false }, vec![condition], LiteralType::Void, "")
    }

    pub fn create_ret(&mut self, result: Value) -> IrResult<Value> {
        self.insert(InstrKind::Ret, vec![result], LiteralType::Void, "")
    }

    pub fn create_match(
        &mut self,
        class: MatchClass,
        subject: Value,
        cases: Vec<(ConstId, BlockId)>,
        otherwise: BlockId,
    ) -> IrResult<Value> {
        self.insert(InstrKind::Match { class, cases, otherwise }, vec![subject], LiteralType::Void, "")
    }
}

fn fold_binary(op: BinaryKind, a: &Constant, b: &Constant) -> Option<Constant> {
    use BinaryKind::*;
    use Constant::{Boolean, Cidr, IPAddress, Integer, String};
    Some(match (op, a, b) {
        (IAdd, Integer(x), Integer(y)) => Integer(x.wrapping_add(*y)),
        (ISub, Integer(x), Integer(y)) => Integer(x.wrapping_sub(*y)),
        (IMul, Integer(x), Integer(y)) => Integer(x.wrapping_mul(*y)),
        // division by zero is left for the VM to report
        (IDiv, Integer(x), Integer(y)) if *y != 0 => Integer(x.wrapping_div(*y)),
        (IRem, Integer(x), Integer(y)) if *y != 0 => Integer(x.wrapping_rem(*y)),
        (IPow, Integer(x), Integer(y)) => Integer(number_pow(*x, *y)),
        (IAnd, Integer(x), Integer(y)) => Integer(x & y),
        (IOr, Integer(x), Integer(y)) => Integer(x | y),
        (IXor, Integer(x), Integer(y)) => Integer(x ^ y),
        (IShl, Integer(x), Integer(y)) => Integer(x.wrapping_shl(*y as u32)),
        (IShr, Integer(x), Integer(y)) => Integer(x.wrapping_shr(*y as u32)),
        (ICmpEQ, Integer(x), Integer(y)) => Boolean(x == y),
        (ICmpNE, Integer(x), Integer(y)) => Boolean(x != y),
        (ICmpLE, Integer(x), Integer(y)) => Boolean(x <= y),
        (ICmpGE, Integer(x), Integer(y)) => Boolean(x >= y),
        (ICmpLT, Integer(x), Integer(y)) => Boolean(x < y),
        (ICmpGT, Integer(x), Integer(y)) => Boolean(x > y),
        (BAnd, Boolean(x), Boolean(y)) => Boolean(*x && *y),
        (BOr, Boolean(x), Boolean(y)) => Boolean(*x || *y),
        (BXor, Boolean(x), Boolean(y)) => Boolean(x ^ y),
        (SAdd, String(x), String(y)) => String(format!("{x}{y}")),
        (SCmpEQ, String(x), String(y)) => Boolean(x == y),
        (SCmpNE, String(x), String(y)) => Boolean(x != y),
        (SCmpLE, String(x), String(y)) => Boolean(x <= y),
        (SCmpGE, String(x), String(y)) => Boolean(x >= y),
        (SCmpLT, String(x), String(y)) => Boolean(x < y),
        (SCmpGT, String(x), String(y)) => Boolean(x > y),
        (SCmpBeg, String(x), String(y)) => Boolean(x.starts_with(y.as_str())),
        (SCmpEnd, String(x), String(y)) => Boolean(x.ends_with(y.as_str())),
        (SIn, String(x), String(y)) => Boolean(y.contains(x.as_str())),
        (PCmpEQ, IPAddress(x), IPAddress(y)) => Boolean(x == y),
        (PCmpNE, IPAddress(x), IPAddress(y)) => Boolean(x != y),
        (PInCidr, IPAddress(x), Cidr(y)) => Boolean(y.contains(x)),
        _ => return None,
    })
}
