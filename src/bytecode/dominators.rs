//! Post-dominance and control dependence over a [`ControlFlowGraph`].
//!
//! Immediate post-dominators are computed with the Cooper–Harvey–Kennedy
//! iterative algorithm on the reversed graph; control dependencies follow
//! the classic Ferrante–Ottenstein–Warren construction.

use super::cfg::ControlFlowGraph;

/// Immediate post-dominator per node, indexed by node id. The virtual exit
/// post-dominates itself. Nodes that cannot reach the exit (none, in
/// well-formed code objects) map to the exit.
#[must_use]
pub fn post_dominator_tree(cfg: &ControlFlowGraph) -> Vec<usize> {
    let n = cfg.node_count();
    let root = cfg.exit;

    // reverse graph: edges exit -> ... -> entry
    let preds_of_reverse: Vec<Vec<usize>> = {
        // predecessors in reverse graph are successors in the original
        let mut out = vec![Vec::new(); n];
        for (source, edges) in cfg.successors.iter().enumerate() {
            for edge in edges {
                out[source].push(edge.target);
            }
        }
        out
    };
    let succs_of_reverse = cfg.predecessors();

    // reverse postorder of the reverse graph from the exit
    let mut order = Vec::with_capacity(n);
    let mut visited = vec![false; n];
    let mut stack = vec![(root, 0usize)];
    visited[root] = true;
    while let Some(&mut (node, ref mut next)) = stack.last_mut() {
        if *next < succs_of_reverse[node].len() {
            let child = succs_of_reverse[node][*next];
            *next += 1;
            if !visited[child] {
                visited[child] = true;
                stack.push((child, 0));
            }
        } else {
            order.push(node);
            stack.pop();
        }
    }
    order.reverse();
    let mut rpo_number = vec![usize::MAX; n];
    for (i, &node) in order.iter().enumerate() {
        rpo_number[node] = i;
    }

    let mut idom = vec![usize::MAX; n];
    idom[root] = root;
    let intersect = |idom: &[usize], rpo: &[usize], mut a: usize, mut b: usize| {
        while a != b {
            while rpo[a] > rpo[b] {
                a = idom[a];
            }
            while rpo[b] > rpo[a] {
                b = idom[b];
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &node in order.iter().skip(1) {
            let mut new_idom = usize::MAX;
            for &pred in &preds_of_reverse[node] {
                if idom[pred] == usize::MAX || rpo_number[pred] == usize::MAX {
                    continue;
                }
                new_idom = if new_idom == usize::MAX {
                    pred
                } else {
                    intersect(&idom, &rpo_number, new_idom, pred)
                };
            }
            if new_idom != usize::MAX && idom[node] != new_idom {
                idom[node] = new_idom;
                changed = true;
            }
        }
    }
    for entry in idom.iter_mut() {
        if *entry == usize::MAX {
            *entry = root;
        }
    }
    idom
}

/// A control dependence: `dependent` executes iff `controlling` takes the
/// branch labeled `outcome` (where labeled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlDependence {
    pub dependent: usize,
    pub controlling: usize,
    pub outcome: Option<bool>,
}

/// Control dependencies of the graph, derived from post-dominance.
#[must_use]
pub fn control_dependencies(cfg: &ControlFlowGraph) -> Vec<ControlDependence> {
    let ipdom = post_dominator_tree(cfg);
    let mut out = Vec::new();
    for (source, edges) in cfg.successors.iter().enumerate() {
        if edges.len() < 2 {
            continue;
        }
        for edge in edges {
            // walk from the edge target up to (exclusive) ipdom(source)
            let stop = ipdom[source];
            let mut node = edge.target;
            while node != stop && node != cfg.exit {
                out.push(ControlDependence {
                    dependent: node,
                    controlling: source,
                    outcome: edge.outcome,
                });
                if node == ipdom[node] {
                    break;
                }
                node = ipdom[node];
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeObject, Instruction};
    use crate::lang::ast::CompareOp;

    fn diamond() -> ControlFlowGraph {
        // b0: cmp + branch, b1: then, b2: else, b3: join/return
        let instructions = vec![
            Instruction::Compare(CompareOp::Lt),
            Instruction::JumpIfFalse(4),
            Instruction::LoadConst(0),
            Instruction::Jump(5),
            Instruction::LoadConst(1),
            Instruction::Return,
        ];
        let lines = vec![1; instructions.len()];
        ControlFlowGraph::from_code(&CodeObject {
            name: "t".to_string(),
            params: vec![],
            consts: vec![],
            names: vec![],
            locals: vec![],
            kw_tables: vec![],
            instructions,
            lines,
            first_line: 1,
        })
    }

    #[test]
    fn join_block_post_dominates_branch() {
        let cfg = diamond();
        let ipdom = post_dominator_tree(&cfg);
        // block ids: 0 = branch, 1 = then, 2 = else, 3 = join
        assert_eq!(ipdom[0], 3);
        assert_eq!(ipdom[1], 3);
        assert_eq!(ipdom[2], 3);
        assert_eq!(ipdom[3], cfg.exit);
    }

    #[test]
    fn arms_are_control_dependent_on_branch() {
        let cfg = diamond();
        let deps = control_dependencies(&cfg);
        assert!(deps.contains(&ControlDependence {
            dependent: 1,
            controlling: 0,
            outcome: Some(true)
        }));
        assert!(deps.contains(&ControlDependence {
            dependent: 2,
            controlling: 0,
            outcome: Some(false)
        }));
        // the join depends on nothing
        assert!(deps.iter().all(|d| d.dependent != 3));
    }
}
