//! Control-flow graph over decoded bytecode
//!
//! Two passes: first scan branch targets to find block boundaries, then
//! assign instructions to blocks and connect terminators. The lifter walks
//! this graph to emit SSA.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::bytecode::Opcode;

use super::decoder::DecodedInstr;

/// Basic-block id in the bytecode CFG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CfgBlockId(pub u32);

/// How a bytecode block ends
#[derive(Debug, Clone, Copy)]
pub enum CfgTerminator {
    Fallthrough(CfgBlockId),
    Jump(CfgBlockId),
    Branch {
        /// Jump taken when the popped condition matches this sense
        jump_if: bool,
        target: CfgBlockId,
        fallthrough: CfgBlockId,
    },
    Return,
    Throw,
    /// Code runs off the end (implicit return undefined)
    End,
}

/// A bytecode basic block
#[derive(Debug)]
pub struct CfgBlock {
    pub id: CfgBlockId,
    pub start_offset: usize,
    /// Indices into the decoded instruction array
    pub instrs: Vec<usize>,
    pub terminator: CfgTerminator,
    pub preds: Vec<CfgBlockId>,
}

/// The whole graph
#[derive(Debug)]
pub struct BytecodeCfg {
    pub blocks: Vec<CfgBlock>,
    pub entry: CfgBlockId,
    pub offset_to_block: FxHashMap<usize, CfgBlockId>,
}

impl BytecodeCfg {
    pub fn block(&self, id: CfgBlockId) -> &CfgBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn successors(&self, id: CfgBlockId) -> Vec<CfgBlockId> {
        match self.blocks[id.0 as usize].terminator {
            CfgTerminator::Fallthrough(b) | CfgTerminator::Jump(b) => vec![b],
            CfgTerminator::Branch {
                target,
                fallthrough,
                ..
            } => vec![target, fallthrough],
            _ => vec![],
        }
    }
}

/// Pass 1: every branch target and post-terminator offset starts a block
fn collect_block_starts(instrs: &[DecodedInstr]) -> FxHashSet<usize> {
    let mut starts = FxHashSet::default();
    starts.insert(0);
    for instr in instrs {
        match instr.opcode {
            Opcode::Jump => {
                if let Some(t) = instr.jump_target() {
                    starts.insert(t);
                }
                starts.insert(instr.next_offset());
            }
            Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
                if let Some(t) = instr.jump_target() {
                    starts.insert(t);
                }
                starts.insert(instr.next_offset());
            }
            Opcode::Return | Opcode::ReturnUndef | Opcode::Throw => {
                starts.insert(instr.next_offset());
            }
            _ => {}
        }
    }
    starts
}

/// Build the CFG from decoded instructions
pub fn build_cfg(instrs: &[DecodedInstr]) -> BytecodeCfg {
    if instrs.is_empty() {
        let mut offset_to_block = FxHashMap::default();
        offset_to_block.insert(0, CfgBlockId(0));
        return BytecodeCfg {
            blocks: vec![CfgBlock {
                id: CfgBlockId(0),
                start_offset: 0,
                instrs: vec![],
                terminator: CfgTerminator::End,
                preds: vec![],
            }],
            entry: CfgBlockId(0),
            offset_to_block,
        };
    }

    let end_offset = instrs.last().map(|i| i.next_offset()).unwrap_or(0);
    let mut sorted_starts: Vec<usize> = collect_block_starts(instrs)
        .into_iter()
        .filter(|&o| o < end_offset)
        .collect();
    sorted_starts.sort_unstable();

    let mut offset_to_block = FxHashMap::default();
    for (i, &start) in sorted_starts.iter().enumerate() {
        offset_to_block.insert(start, CfgBlockId(i as u32));
    }

    // Pass 2: fill blocks
    let mut blocks: Vec<CfgBlock> = sorted_starts
        .iter()
        .enumerate()
        .map(|(i, &start)| CfgBlock {
            id: CfgBlockId(i as u32),
            start_offset: start,
            instrs: vec![],
            terminator: CfgTerminator::End,
            preds: vec![],
        })
        .collect();

    let mut current = 0usize;
    for (idx, instr) in instrs.iter().enumerate() {
        if current + 1 < sorted_starts.len() && instr.offset >= sorted_starts[current + 1] {
            current += 1;
        }
        blocks[current].instrs.push(idx);
    }

    // Terminators
    let block_count = blocks.len();
    for bi in 0..block_count {
        let term = {
            let block = &blocks[bi];
            let next_block = (bi + 1 < block_count).then(|| CfgBlockId((bi + 1) as u32));
            match block.instrs.last().map(|&i| &instrs[i]) {
                None => match next_block {
                    Some(n) => CfgTerminator::Fallthrough(n),
                    None => CfgTerminator::End,
                },
                Some(last) => match last.opcode {
                    Opcode::Jump => {
                        let t = last.jump_target().unwrap();
                        CfgTerminator::Jump(offset_to_block[&t])
                    }
                    Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
                        let t = last.jump_target().unwrap();
                        let ft = offset_to_block
                            .get(&last.next_offset())
                            .copied()
                            .or(next_block)
                            .unwrap_or(CfgBlockId(bi as u32));
                        CfgTerminator::Branch {
                            jump_if: last.opcode == Opcode::JumpIfTrue,
                            target: offset_to_block[&t],
                            fallthrough: ft,
                        }
                    }
                    Opcode::Return | Opcode::ReturnUndef => CfgTerminator::Return,
                    Opcode::Throw => CfgTerminator::Throw,
                    _ => match offset_to_block.get(&last.next_offset()) {
                        Some(&n) => CfgTerminator::Fallthrough(n),
                        None => CfgTerminator::End,
                    },
                },
            }
        };
        blocks[bi].terminator = term;
    }

    // Predecessors
    let edges: Vec<(CfgBlockId, CfgBlockId)> = blocks
        .iter()
        .flat_map(|b| {
            let succs = match b.terminator {
                CfgTerminator::Fallthrough(s) | CfgTerminator::Jump(s) => vec![s],
                CfgTerminator::Branch {
                    target,
                    fallthrough,
                    ..
                } => vec![target, fallthrough],
                _ => vec![],
            };
            succs.into_iter().map(move |s| (b.id, s))
        })
        .collect();
    for (from, to) in edges {
        blocks[to.0 as usize].preds.push(from);
    }

    BytecodeCfg {
        blocks,
        entry: CfgBlockId(0),
        offset_to_block,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeBuilder, Const, Opcode};
    use crate::jit::analysis::decoder::decode_function;

    #[test]
    fn test_straight_line_is_one_block() {
        let mut b = BytecodeBuilder::new("t", 0, 0);
        b.load_const(Const::Integer(1));
        b.emit(Opcode::Return);
        let f = b.finish();
        let cfg = build_cfg(&decode_function(&f.code).unwrap());
        assert_eq!(cfg.block_count(), 1);
        assert!(matches!(cfg.block(cfg.entry).terminator, CfgTerminator::Return));
    }

    #[test]
    fn test_branch_creates_blocks() {
        // if (true) { 1 } else { 2 }
        let mut b = BytecodeBuilder::new("t", 0, 0);
        let else_l = b.new_label();
        b.emit(Opcode::LoadTrue);
        b.jump_if_false(else_l);
        b.load_const(Const::Integer(1));
        b.emit(Opcode::Return);
        b.bind(else_l);
        b.load_const(Const::Integer(2));
        b.emit(Opcode::Return);
        let f = b.finish();

        let cfg = build_cfg(&decode_function(&f.code).unwrap());
        assert!(cfg.block_count() >= 3);
        match cfg.block(cfg.entry).terminator {
            CfgTerminator::Branch { jump_if, .. } => assert!(!jump_if),
            ref other => panic!("unexpected terminator {other:?}"),
        }
    }

    #[test]
    fn test_loop_back_edge() {
        // loop: jump loop (with a branch out first)
        let mut b = BytecodeBuilder::new("t", 0, 0);
        let top = b.new_label();
        let out = b.new_label();
        b.bind(top);
        b.emit(Opcode::LoadTrue);
        b.jump_if_false(out);
        b.jump(top);
        b.bind(out);
        b.emit(Opcode::ReturnUndef);
        let f = b.finish();

        let cfg = build_cfg(&decode_function(&f.code).unwrap());
        // The entry block must be a branch target (predecessor from the
        // back-edge block)
        assert!(!cfg.block(cfg.entry).preds.is_empty());
    }

    #[test]
    fn test_empty_function() {
        let cfg = build_cfg(&[]);
        assert_eq!(cfg.block_count(), 1);
        assert!(matches!(cfg.block(cfg.entry).terminator, CfgTerminator::End));
    }
}
