//! Structural checks on a generated `IrProgram`.
//!
//! Run after generation and after each transform pass when
//! `CompileOptions::verify` is set. Every reachable block must end in exactly
//! one terminator, CFG edges must agree on both ends, and every operand must
//! be defined on all paths to its use.

use std::collections::{HashMap, HashSet};

use super::{BlockId, HandlerId, InstrKind, IrProgram, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{handler}: {message}")]
pub struct VerifyError {
    pub handler: String,
    pub message: String,
}

pub fn verify(program: &IrProgram) -> Result<(), Vec<VerifyError>> {
    let mut errors = Vec::new();
    for (id, _) in program.handlers() {
        verify_handler(program, id, &mut errors);
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn verify_handler(p: &IrProgram, id: HandlerId, errors: &mut Vec<VerifyError>) {
    let Some(handler) = p.handler(id) else { return };
    let mut fail = |message: String| errors.push(VerifyError { handler: handler.name().to_string(), message });

    let Some(entry) = handler.entry() else {
        fail("handler has no blocks".into());
        return;
    };
    if p.block(entry).is_some_and(|b| !b.predecessors().is_empty()) {
        fail("entry block must not have predecessors".into());
    }

    let doms = dominators(p, handler.blocks(), entry);

    for &bb in handler.blocks() {
        let Some(block) = p.block(bb) else {
            fail(format!("dangling block {bb}"));
            continue;
        };
        let name = block.name();

        for succ in block.successors() {
            if !p.block(*succ).is_some_and(|s| s.predecessors().contains(&bb)) {
                fail(format!("{name}: edge to {succ} missing from its predecessor list"));
            }
        }
        for pred in block.predecessors() {
            if !p.block(*pred).is_some_and(|s| s.successors().contains(&bb)) {
                fail(format!("{name}: predecessor {pred} does not list it as successor"));
            }
        }

        if !doms.contains_key(&bb) {
            // unreachable code is not required to be well-formed
            continue;
        }

        let instrs = block.instrs();
        match instrs.last().and_then(|i| p.instr(*i)) {
            Some(last) if last.kind().is_terminator() => {
                let mut targets = last.kind().targets();
                targets.sort();
                targets.dedup();
                let mut succs = block.successors().to_vec();
                succs.sort();
                if targets != succs {
                    fail(format!("{name}: successor list does not match the terminator"));
                }
            }
            _ => fail(format!("{name}: block does not end in a terminator")),
        }

        let mut seen_non_phi = false;
        for (pos, &iid) in instrs.iter().enumerate() {
            let Some(instr) = p.instr(iid) else {
                fail(format!("{name}: stale instruction {iid}"));
                continue;
            };
            if instr.block() != bb {
                fail(format!("{name}: {iid} claims to live in {}", instr.block()));
            }
            if instr.kind().is_terminator() && pos + 1 != instrs.len() {
                fail(format!("{name}: terminator {} in the middle of the block", instr.kind().mnemonic()));
            }

            if let InstrKind::Phi { incoming } = instr.kind() {
                if seen_non_phi {
                    fail(format!("{name}: phi node after a non-phi instruction"));
                }
                if incoming.len() != instr.operands().len() {
                    fail(format!("{name}: phi has {} values for {} blocks", instr.operands().len(), incoming.len()));
                }
                let mut from: Vec<BlockId> = incoming.clone();
                from.sort();
                let mut preds = block.predecessors().to_vec();
                preds.sort();
                if from != preds {
                    fail(format!("{name}: phi incoming blocks do not match the predecessors"));
                }
                for (value, pred) in instr.operands().iter().zip(incoming) {
                    if !defined_at_end(p, &doms, *value, *pred) {
                        fail(format!("{name}: phi operand does not dominate the end of {pred}"));
                    }
                }
                continue;
            }
            seen_non_phi = true;

            for (n, value) in instr.operands().iter().enumerate() {
                if !p.is_live(*value) {
                    fail(format!("{name}: operand {n} of {} is dead", instr.kind().mnemonic()));
                    continue;
                }
                if let Value::Instr(def) = value {
                    let ok = match p.instr(*def) {
                        Some(d) if d.block() == bb => {
                            instrs[..pos].contains(def)
                        }
                        Some(d) => dominates(&doms, d.block(), bb),
                        None => false,
                    };
                    if !ok {
                        fail(format!("{name}: operand {n} of {} is not dominated by its definition", instr.kind().mnemonic()));
                    }
                }
            }
        }
    }
}

fn defined_at_end(p: &IrProgram, doms: &HashMap<BlockId, HashSet<BlockId>>, value: Value, block: BlockId) -> bool {
    match value {
        Value::Constant(_) => p.is_live(value),
        Value::Instr(def) => p.instr(def).is_some_and(|d| dominates(doms, d.block(), block)),
    }
}

fn dominates(doms: &HashMap<BlockId, HashSet<BlockId>>, a: BlockId, b: BlockId) -> bool {
    doms.get(&b).is_some_and(|set| set.contains(&a))
}

/// Dominator sets of every block reachable from `entry`, by the classic
/// iterative data-flow fixpoint.
pub(crate) fn dominators(p: &IrProgram, blocks: &[BlockId], entry: BlockId) -> HashMap<BlockId, HashSet<BlockId>> {
    let reachable = reachable(p, entry);
    let order: Vec<BlockId> = blocks.iter().copied().filter(|b| reachable.contains(b)).collect();

    let mut doms: HashMap<BlockId, HashSet<BlockId>> = HashMap::new();
    for &b in &order {
        if b == entry {
            doms.insert(b, HashSet::from([b]));
        } else {
            doms.insert(b, reachable.clone());
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for &b in &order {
            if b == entry {
                continue;
            }
            let Some(block) = p.block(b) else { continue };
            let mut new: Option<HashSet<BlockId>> = None;
            for pred in block.predecessors().iter().filter(|p| reachable.contains(p)) {
                let Some(pd) = doms.get(pred) else { continue };
                new = Some(match new {
                    None => pd.clone(),
                    Some(acc) => acc.intersection(pd).copied().collect(),
                });
            }
            let mut new = new.unwrap_or_default();
            new.insert(b);
            if doms.get(&b) != Some(&new) {
                doms.insert(b, new);
                changed = true;
            }
        }
    }
    doms
}

pub(crate) fn reachable(p: &IrProgram, entry: BlockId) -> HashSet<BlockId> {
    let mut seen = HashSet::new();
    let mut stack = vec![entry];
    while let Some(b) = stack.pop() {
        if !seen.insert(b) {
            continue;
        }
        if let Some(block) = p.block(b) {
            stack.extend(block.successors().iter().copied());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryKind, IrBuilder};
    use crate::types::LiteralType;

    #[test]
    fn well_formed_diamond_passes() {
        let mut p = IrProgram::new();
        let h = p.create_handler("main");
        let mut b = IrBuilder::new(&mut p);
        b.set_handler(h);
        let entry = b.create_block("EntryPoint").unwrap();
        let left = b.create_block("left").unwrap();
        let right = b.create_block("right").unwrap();
        let join = b.create_block("join").unwrap();
        b.set_insert_point(entry);
        let slot = b.create_alloca(LiteralType::Boolean, "c").unwrap();
        let c = b.create_load(slot, "c").unwrap();
        b.create_cond_br(c, left, right).unwrap();
        b.set_insert_point(left);
        b.create_br(join).unwrap();
        b.set_insert_point(right);
        b.create_br(join).unwrap();
        b.set_insert_point(join);
        let one = b.program_mut().get_int(1);
        let two = b.program_mut().get_int(2);
        let x = b.create_phi(vec![(one.into(), left), (two.into(), right)], "x").unwrap();
        let f = b.program_mut().get_bool(false);
        b.create_binary(BinaryKind::IAdd, x, one.into(), "y").unwrap();
        b.create_ret(f.into()).unwrap();
        assert_eq!(verify(&p), Ok(()));
    }

    #[test]
    fn missing_terminator_is_reported() {
        let mut p = IrProgram::new();
        let h = p.create_handler("main");
        p.create_block(h, "EntryPoint").unwrap();
        let errors = verify(&p).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("terminator"), "{errors:?}");
        assert_eq!(errors[0].handler, "main");
    }

    #[test]
    fn use_not_dominated_by_definition() {
        let mut p = IrProgram::new();
        let h = p.create_handler("main");
        let mut b = IrBuilder::new(&mut p);
        b.set_handler(h);
        let entry = b.create_block("EntryPoint").unwrap();
        let left = b.create_block("left").unwrap();
        let right = b.create_block("right").unwrap();
        let join = b.create_block("join").unwrap();
        b.set_insert_point(entry);
        let t = b.program_mut().get_bool(true);
        let slot = b.create_alloca(LiteralType::Boolean, "c").unwrap();
        let c = b.create_load(slot, "c").unwrap();
        b.create_cond_br(c, left, right).unwrap();
        b.set_insert_point(left);
        let only_left = b.create_alloca(LiteralType::Boolean, "l").unwrap();
        b.create_br(join).unwrap();
        b.set_insert_point(right);
        b.create_br(join).unwrap();
        b.set_insert_point(join);
        b.create_store(only_left, t.into()).unwrap();
        b.create_ret(t.into()).unwrap();
        let errors = verify(&p).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("not dominated")), "{errors:?}");
    }

    #[test]
    fn unreachable_blocks_are_skipped() {
        let mut p = IrProgram::new();
        let h = p.create_handler("main");
        let entry = p.create_block(h, "EntryPoint").unwrap();
        p.create_block(h, "dead").unwrap();
        let f = p.get_bool(false);
        p.append_instr(entry, InstrKind::Ret, vec![f.into()], LiteralType::Void, "").unwrap();
        assert_eq!(verify(&p), Ok(()));
    }

    #[test]
    fn dominators_of_a_loop_free_chain() {
        let mut p = IrProgram::new();
        let h = p.create_handler("main");
        let a = p.create_block(h, "a").unwrap();
        let b = p.create_block(h, "b").unwrap();
        let c = p.create_block(h, "c").unwrap();
        p.append_instr(a, InstrKind::Br { target: b }, vec![], LiteralType::Void, "").unwrap();
        p.append_instr(b, InstrKind::Br { target: c }, vec![], LiteralType::Void, "").unwrap();
        let doms = dominators(&p, &[a, b, c], a);
        assert_eq!(doms[&c], HashSet::from([a, b, c]));
        assert_eq!(doms[&b], HashSet::from([a, b]));
    }
}
