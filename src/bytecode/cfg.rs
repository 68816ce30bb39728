//! Control-flow graph over basic blocks of a code object.
//!
//! Blocks hold `(instruction, line)` pairs; jump operands inside blocks are
//! rewritten to block ids while a graph is held, and resolved back to
//! instruction offsets on linearization. The instrumentation chain mutates
//! blocks in place and relinearizes, so offsets never have to be patched by
//! hand.

use super::{CodeObject, Instruction};

/// Labeled edge between basic blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub target: usize,
    /// For conditional branches, the predicate outcome this edge encodes.
    pub outcome: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: usize,
    /// Instructions with their source lines. Jump operands refer to block
    /// ids while the graph is held.
    pub code: Vec<(Instruction, u32)>,
}

impl BasicBlock {
    /// Index of the terminating jump instruction, if the block ends in one.
    #[must_use]
    pub fn jump_index(&self) -> Option<usize> {
        let (last, _) = self.code.last()?;
        last.jump_target().map(|_| self.code.len() - 1)
    }
}

/// CFG with explicit entry and a virtual exit block.
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    pub blocks: Vec<BasicBlock>,
    pub entry: usize,
    /// Virtual exit: holds no instructions, succeeds every return/raise.
    pub exit: usize,
    pub successors: Vec<Vec<Edge>>,
}

impl ControlFlowGraph {
    /// Decomposes a code object into basic blocks.
    #[must_use]
    pub fn from_code(code: &CodeObject) -> Self {
        let n = code.instructions.len();
        let mut leaders = vec![false; n.max(1)];
        if n > 0 {
            leaders[0] = true;
        }
        for (offset, instruction) in code.instructions.iter().enumerate() {
            if let Some(target) = instruction.jump_target() {
                leaders[target as usize] = true;
                if offset + 1 < n {
                    leaders[offset + 1] = true;
                }
            } else if instruction.is_terminator() && offset + 1 < n {
                leaders[offset + 1] = true;
            }
        }

        // offset -> block id
        let mut block_of = vec![0usize; n];
        let mut current = 0usize;
        for offset in 0..n {
            if leaders[offset] && offset > 0 {
                current += 1;
            }
            block_of[offset] = current;
        }
        let block_count = if n == 0 { 1 } else { current + 1 };

        let mut blocks: Vec<BasicBlock> = (0..block_count)
            .map(|id| BasicBlock {
                id,
                code: Vec::new(),
            })
            .collect();
        for (offset, instruction) in code.instructions.iter().enumerate() {
            let mut instruction = instruction.clone();
            if let Some(target) = instruction.jump_target() {
                instruction.set_jump_target(block_of[target as usize] as u32);
            }
            blocks[block_of[offset]]
                .code
                .push((instruction, code.lines[offset]));
        }

        let exit = block_count;
        let mut successors: Vec<Vec<Edge>> = vec![Vec::new(); block_count + 1];
        for block in &blocks {
            let id = block.id;
            let Some((last, _)) = block.code.last() else {
                successors[id].push(Edge {
                    target: exit,
                    outcome: None,
                });
                continue;
            };
            let fallthrough = if id + 1 < block_count { id + 1 } else { exit };
            match last {
                Instruction::Jump(t) => successors[id].push(Edge {
                    target: *t as usize,
                    outcome: None,
                }),
                Instruction::JumpIfFalse(t) | Instruction::JumpIfFalseOrPop(t) => {
                    successors[id].push(Edge {
                        target: fallthrough,
                        outcome: Some(true),
                    });
                    successors[id].push(Edge {
                        target: *t as usize,
                        outcome: Some(false),
                    });
                }
                Instruction::JumpIfTrue(t) | Instruction::JumpIfTrueOrPop(t) => {
                    successors[id].push(Edge {
                        target: fallthrough,
                        outcome: Some(false),
                    });
                    successors[id].push(Edge {
                        target: *t as usize,
                        outcome: Some(true),
                    });
                }
                Instruction::ForIter(t) => {
                    successors[id].push(Edge {
                        target: fallthrough,
                        outcome: Some(true),
                    });
                    successors[id].push(Edge {
                        target: *t as usize,
                        outcome: Some(false),
                    });
                }
                Instruction::SetupExcept(t) => {
                    successors[id].push(Edge {
                        target: fallthrough,
                        outcome: None,
                    });
                    successors[id].push(Edge {
                        target: *t as usize,
                        outcome: None,
                    });
                }
                Instruction::Return | Instruction::Raise | Instruction::Reraise => {
                    successors[id].push(Edge {
                        target: exit,
                        outcome: None,
                    });
                }
                _ => successors[id].push(Edge {
                    target: fallthrough,
                    outcome: None,
                }),
            }
        }

        Self {
            blocks,
            entry: 0,
            exit,
            successors,
        }
    }

    /// Total number of nodes including the virtual exit.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.blocks.len() + 1
    }

    #[must_use]
    pub fn predecessors(&self) -> Vec<Vec<usize>> {
        let mut preds = vec![Vec::new(); self.node_count()];
        for (source, edges) in self.successors.iter().enumerate() {
            for edge in edges {
                preds[edge.target].push(source);
            }
        }
        preds
    }

    /// Reassembles the blocks into a flat instruction vector, resolving
    /// block-id jump operands back to instruction offsets.
    #[must_use]
    pub fn linearize(&self) -> (Vec<Instruction>, Vec<u32>) {
        let mut block_start = vec![0u32; self.blocks.len()];
        let mut offset = 0u32;
        for block in &self.blocks {
            block_start[block.id] = offset;
            offset += block.code.len() as u32;
        }
        let mut instructions = Vec::with_capacity(offset as usize);
        let mut lines = Vec::with_capacity(offset as usize);
        for block in &self.blocks {
            for (instruction, line) in &block.code {
                let mut instruction = instruction.clone();
                if let Some(target_block) = instruction.jump_target() {
                    instruction.set_jump_target(block_start[target_block as usize]);
                }
                instructions.push(instruction);
                lines.push(*line);
            }
        }
        (instructions, lines)
    }

    /// Whether any block ends in a conditional jump.
    #[must_use]
    pub fn has_branches(&self) -> bool {
        self.blocks.iter().any(|block| {
            matches!(
                block.code.last().map(|(i, _)| i),
                Some(
                    Instruction::JumpIfFalse(_)
                        | Instruction::JumpIfTrue(_)
                        | Instruction::JumpIfFalseOrPop(_)
                        | Instruction::JumpIfTrueOrPop(_)
                        | Instruction::ForIter(_)
                )
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::ast::CompareOp;

    fn code_with(instructions: Vec<Instruction>) -> CodeObject {
        let lines = vec![1; instructions.len()];
        CodeObject {
            name: "t".to_string(),
            params: vec![],
            consts: vec![],
            names: vec![],
            locals: vec![],
            kw_tables: vec![],
            instructions,
            lines,
            first_line: 1,
        }
    }

    #[test]
    fn splits_blocks_at_branches_and_targets() {
        // 0: LoadConst 1: Compare 2: JumpIfFalse(5) 3: LoadConst 4: Return 5: LoadConst 6: Return
        let code = code_with(vec![
            Instruction::LoadConst(0),
            Instruction::Compare(CompareOp::Eq),
            Instruction::JumpIfFalse(5),
            Instruction::LoadConst(0),
            Instruction::Return,
            Instruction::LoadConst(0),
            Instruction::Return,
        ]);
        let cfg = ControlFlowGraph::from_code(&code);
        assert_eq!(cfg.blocks.len(), 3);
        let edges = &cfg.successors[0];
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].outcome, Some(true));
        assert_eq!(edges[1].outcome, Some(false));
        // both arms return to the virtual exit
        assert_eq!(cfg.successors[1][0].target, cfg.exit);
        assert_eq!(cfg.successors[2][0].target, cfg.exit);
    }

    #[test]
    fn linearize_round_trips_jump_targets() {
        let code = code_with(vec![
            Instruction::LoadConst(0),
            Instruction::JumpIfFalse(4),
            Instruction::LoadConst(0),
            Instruction::Return,
            Instruction::LoadConst(0),
            Instruction::Return,
        ]);
        let cfg = ControlFlowGraph::from_code(&code);
        let (instructions, lines) = cfg.linearize();
        assert_eq!(instructions, code.instructions);
        assert_eq!(lines.len(), instructions.len());
    }
}
