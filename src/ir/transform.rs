//! Cleanup passes run between generation and encoding.
//!
//! Each pass returns whether it changed anything; `optimize` repeats the
//! whole set until a fixpoint.

use tracing::{debug, instrument, trace};

use super::verify::reachable;
use super::{BinaryKind, BlockId, Constant, HandlerId, Instr, InstrId, InstrKind, IrProgram, IrResult, Value};
use crate::types::LiteralType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub folded_branches: usize,
    pub removed_blocks: usize,
    pub merged_blocks: usize,
    pub removed_phis: usize,
    pub removed_instrs: usize,
}

/// Runs every pass over every handler until nothing changes.
#[instrument(skip_all, name = "optimize")]
pub fn optimize(program: &mut IrProgram) -> IrResult<OptimizeStats> {
    let mut stats = OptimizeStats::default();
    let handlers: Vec<HandlerId> = program.handlers().map(|(id, _)| id).collect();
    for h in handlers {
        loop {
            let mut changed = false;
            changed |= fold_constant_branches(program, h, &mut stats)?;
            changed |= remove_unreachable_blocks(program, h, &mut stats)?;
            changed |= simplify_phis(program, h, &mut stats)?;
            changed |= merge_straight_line_blocks(program, h, &mut stats)?;
            changed |= eliminate_dead_code(program, h, &mut stats)?;
            if !changed {
                break;
            }
        }
    }
    debug!(?stats, "optimized");
    Ok(stats)
}

fn blocks_of(program: &IrProgram, h: HandlerId) -> Vec<BlockId> {
    program.handler(h).map(|h| h.blocks().to_vec()).unwrap_or_default()
}

/// `condbr true, a, b` becomes `br a`.
pub fn fold_constant_branches(program: &mut IrProgram, h: HandlerId, stats: &mut OptimizeStats) -> IrResult<bool> {
    let mut changed = false;
    for bb in blocks_of(program, h) {
        let Some(term) = program.terminator(bb) else { continue };
        let Some(instr) = program.instr(term) else { continue };
        let InstrKind::CondBr { on_true, on_false } = *instr.kind() else { continue };
        let Some(Value::Constant(c)) = instr.operand(0) else { continue };
        let Some(Constant::Boolean(flag)) = program.constant(c) else { continue };
        let (taken, dropped) = if *flag { (on_true, on_false) } else { (on_false, on_true) };

        program.remove_instr(term)?;
        if dropped != taken {
            for phi in program.phis(dropped) {
                program.remove_phi_incoming(phi, bb)?;
            }
        }
        program.append_instr(bb, InstrKind::Br { target: taken }, vec![], LiteralType::Void, "")?;
        trace!(block = %bb, target = %taken, "folded constant branch");
        stats.folded_branches += 1;
        changed = true;
    }
    Ok(changed)
}

pub fn remove_unreachable_blocks(program: &mut IrProgram, h: HandlerId, stats: &mut OptimizeStats) -> IrResult<bool> {
    let Some(entry) = program.handler(h).and_then(|h| h.entry()) else { return Ok(false) };
    let live = reachable(program, entry);
    let dead: Vec<BlockId> = blocks_of(program, h).into_iter().filter(|b| !live.contains(b)).collect();
    for bb in &dead {
        program.remove_block(*bb)?;
    }
    stats.removed_blocks += dead.len();
    Ok(!dead.is_empty())
}

/// Removes phi nodes whose incoming values are all the same.
pub fn simplify_phis(program: &mut IrProgram, h: HandlerId, stats: &mut OptimizeStats) -> IrResult<bool> {
    let mut changed = false;
    for bb in blocks_of(program, h) {
        for phi in program.phis(bb) {
            let Some(instr) = program.instr(phi) else { continue };
            let me = Value::Instr(phi);
            let mut distinct = instr.operands().iter().copied().filter(|v| *v != me);
            let Some(first) = distinct.next() else { continue };
            if distinct.any(|v| v != first) {
                continue;
            }
            program.replace_all_uses_with(me, first)?;
            program.remove_instr(phi)?;
            stats.removed_phis += 1;
            changed = true;
        }
    }
    Ok(changed)
}

/// Folds `a: ...; br b` into `a` when `b` has `a` as its only predecessor.
pub fn merge_straight_line_blocks(program: &mut IrProgram, h: HandlerId, stats: &mut OptimizeStats) -> IrResult<bool> {
    let mut changed = false;
    let entry = program.handler(h).and_then(|h| h.entry());
    for bb in blocks_of(program, h) {
        let Some(term) = program.terminator(bb) else { continue };
        let Some(&InstrKind::Br { target }) = program.instr(term).map(|i| i.kind()) else { continue };
        if target == bb || Some(target) == entry {
            continue;
        }
        let single_pred = program.block(target).is_some_and(|b| b.predecessors() == [bb]);
        if !single_pred || !program.phis(target).is_empty() {
            continue;
        }
        program.remove_instr(term)?;
        program.splice_block(bb, target)?;
        program.remove_block(target)?;
        trace!(into = %bb, merged = %target, "merged blocks");
        stats.merged_blocks += 1;
        changed = true;
        // block lists changed under us; pick up the rest on the next round
        break;
    }
    Ok(changed)
}

/// Unused, and dropping it cannot change how the run ends.
fn is_dead(program: &IrProgram, instr: &Instr) -> bool {
    if !instr.uses().is_empty() || instr.kind().has_side_effects() {
        return false;
    }
    match instr.kind() {
        // a zero divisor faults at run time
        InstrKind::Binary(BinaryKind::IDiv | BinaryKind::IRem) => matches!(
            instr.operands().get(1),
            Some(Value::Constant(c)) if matches!(program.constant(*c), Some(Constant::Integer(n)) if *n != 0)
        ),
        _ => true,
    }
}

pub fn eliminate_dead_code(program: &mut IrProgram, h: HandlerId, stats: &mut OptimizeStats) -> IrResult<bool> {
    let mut changed = false;
    loop {
        let dead: Vec<InstrId> = blocks_of(program, h)
            .into_iter()
            .filter_map(|bb| program.block(bb).map(|b| b.instrs().to_vec()))
            .flatten()
            .filter(|i| program.instr(*i).is_some_and(|i| is_dead(program, i)))
            .collect();
        if dead.is_empty() {
            return Ok(changed);
        }
        for id in dead {
            program.remove_instr(id)?;
            stats.removed_instrs += 1;
        }
        changed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::verify::verify;
    use crate::ir::IrBuilder;

    /// entry: condbr %c, then, else; then: br join; else: br join; join: ret
    fn diamond(p: &mut IrProgram, cond: Option<bool>) -> (HandlerId, [BlockId; 4]) {
        let h = p.create_handler("main");
        let mut b = IrBuilder::new(p);
        b.set_handler(h);
        let blocks = [
            b.create_block("EntryPoint").unwrap(),
            b.create_block("then").unwrap(),
            b.create_block("else").unwrap(),
            b.create_block("join").unwrap(),
        ];
        b.set_insert_point(blocks[0]);
        let c = match cond {
            Some(v) => Value::Constant(b.program_mut().get_bool(v)),
            None => {
                let slot = b.create_alloca(LiteralType::Boolean, "slot").unwrap();
                b.create_load(slot, "c").unwrap()
            }
        };
        b.create_cond_br(c, blocks[1], blocks[2]).unwrap();
        b.set_insert_point(blocks[1]);
        b.create_br(blocks[3]).unwrap();
        b.set_insert_point(blocks[2]);
        b.create_br(blocks[3]).unwrap();
        b.set_insert_point(blocks[3]);
        let one = b.program_mut().get_int(1);
        let two = b.program_mut().get_int(2);
        let x = b.create_phi(vec![(one.into(), blocks[1]), (two.into(), blocks[2])], "x").unwrap();
        let slot = b.create_alloca(LiteralType::Number, "out").unwrap();
        b.create_store(slot, x).unwrap();
        let f = b.program_mut().get_bool(false);
        b.create_ret(f.into()).unwrap();
        (h, blocks)
    }

    #[test]
    fn constant_branch_collapses_to_one_block() {
        let mut p = IrProgram::new();
        let (h, _) = diamond(&mut p, Some(true));
        let stats = optimize(&mut p).unwrap();
        assert_eq!(stats.folded_branches, 1);
        assert_eq!(stats.removed_blocks, 1);
        assert_eq!(stats.removed_phis, 1);
        assert_eq!(p.handler(h).unwrap().blocks().len(), 1);
        assert_eq!(verify(&p), Ok(()));

        // the store now writes the constant of the taken arm
        let one = p.get_int(1);
        assert_eq!(p.uses_of(one.into()).unwrap().len(), 1);
    }

    #[test]
    fn dynamic_branch_is_kept() {
        let mut p = IrProgram::new();
        let (h, blocks) = diamond(&mut p, None);
        let stats = optimize(&mut p).unwrap();
        assert_eq!(stats.folded_branches, 0);
        assert_eq!(stats.removed_phis, 0);
        assert!(p.handler(h).unwrap().blocks().contains(&blocks[3]));
        assert_eq!(verify(&p), Ok(()));
    }

    #[test]
    fn unused_pure_instructions_are_removed() {
        let mut p = IrProgram::new();
        let h = p.create_handler("main");
        let mut b = IrBuilder::new(&mut p);
        b.set_handler(h);
        let entry = b.create_block("EntryPoint").unwrap();
        b.set_insert_point(entry);
        let slot = b.create_alloca(LiteralType::Number, "x").unwrap();
        let x = b.create_load(slot, "x").unwrap();
        let one = b.program_mut().get_int(1);
        let sum = b.create_binary(BinaryKind::IAdd, x, one.into(), "sum").unwrap();
        b.create_binary(BinaryKind::IMul, sum, sum, "unused").unwrap();
        let f = b.program_mut().get_bool(false);
        b.create_ret(f.into()).unwrap();

        let stats = optimize(&mut p).unwrap();
        // imul, then iadd, then load, then alloca
        assert_eq!(stats.removed_instrs, 4);
        assert_eq!(p.block(entry).unwrap().instrs().len(), 1);
    }

    #[test]
    fn unused_division_stays_unless_the_divisor_is_known() {
        let mut p = IrProgram::new();
        let h = p.create_handler("main");
        let mut b = IrBuilder::new(&mut p);
        b.set_handler(h);
        let entry = b.create_block("EntryPoint").unwrap();
        b.set_insert_point(entry);
        let slot = b.create_alloca(LiteralType::Number, "x").unwrap();
        let x = b.create_load(slot, "x").unwrap();
        let two = b.program_mut().get_int(2);
        let ten = b.program_mut().get_int(10);
        b.create_binary(BinaryKind::IDiv, x, two.into(), "half").unwrap();
        b.create_binary(BinaryKind::IRem, ten.into(), x, "rest").unwrap();
        let f = b.program_mut().get_bool(false);
        b.create_ret(f.into()).unwrap();

        let stats = optimize(&mut p).unwrap();
        assert_eq!(stats.removed_instrs, 1);
        let kinds: Vec<_> = p.block(entry).unwrap().instrs().iter().map(|i| p.instr(*i).unwrap().kind().mnemonic()).collect();
        assert_eq!(kinds, vec!["alloca", "load", "irem", "ret"]);
    }
}
