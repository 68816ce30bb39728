//! Dynamic backward slicing over the trace instruction log.
//!
//! The log records memory accesses (local, attribute, subscript) with the
//! innermost governing predicate. Slicing walks the log backwards from the
//! seed entries, following data dependencies through symbols and control
//! dependencies through governing predicates. The result feeds checked
//! coverage and assertion relevance.

use std::collections::HashSet;

use crate::bytecode::MemoryAccess;
use crate::execution::trace::{ExecutionResult, LoggedInstruction};
use crate::execution::tracer::SubjectProperties;

/// A data dependency key: symbol within a code object.
type SymbolKey = (u32, String);

/// Computes the backward slice as a set of log indices, starting from the
/// given seed indices.
#[must_use]
pub fn backward_slice(log: &[LoggedInstruction], seeds: &[usize]) -> HashSet<usize> {
    let mut slice: HashSet<usize> = HashSet::new();
    let mut use_set: HashSet<SymbolKey> = HashSet::new();
    let mut needed_predicates: HashSet<u32> = HashSet::new();

    let mut ordered_seeds: Vec<usize> = seeds
        .iter()
        .copied()
        .filter(|&index| index < log.len())
        .collect();
    ordered_seeds.sort_unstable();

    for &seed in &ordered_seeds {
        include(log, seed, &mut slice, &mut use_set, &mut needed_predicates);
    }
    let Some(&last_seed) = ordered_seeds.last() else {
        return slice;
    };

    // walk backwards from the latest seed; earlier seeds are already in
    for index in (0..last_seed).rev() {
        if slice.contains(&index) {
            continue;
        }
        let entry = &log[index];
        let key = (entry.code_object, entry.symbol.clone());
        let data_relevant = entry.access.is_definition() && use_set.contains(&key);
        let control_relevant = entry
            .controlling_predicate
            .is_some_and(|p| needed_predicates.contains(&p))
            && entry.access.is_definition();
        if data_relevant || control_relevant {
            if data_relevant && entry.access != MemoryAccess::StoreAttr {
                // a local store kills earlier definitions of the symbol;
                // attribute stores may alias, so their history stays live
                use_set.remove(&key);
            }
            include(log, index, &mut slice, &mut use_set, &mut needed_predicates);
        }
    }
    slice
}

/// Adds a log entry to the slice, extending the use set with the loads that
/// computed it (entries at the same line directly before it).
fn include(
    log: &[LoggedInstruction],
    index: usize,
    slice: &mut HashSet<usize>,
    use_set: &mut HashSet<SymbolKey>,
    needed_predicates: &mut HashSet<u32>,
) {
    if !slice.insert(index) {
        return;
    }
    let entry = &log[index];
    if let Some(predicate) = entry.controlling_predicate {
        needed_predicates.insert(predicate);
    }
    if !entry.access.is_definition() {
        use_set.insert((entry.code_object, entry.symbol.clone()));
        return;
    }
    // the definition's right-hand side: preceding loads on the same line of
    // the same code object
    let mut back = index;
    while back > 0 {
        back -= 1;
        let candidate = &log[back];
        if candidate.code_object != entry.code_object || candidate.line != entry.line {
            break;
        }
        if !candidate.access.is_definition() {
            slice.insert(back);
            use_set.insert((candidate.code_object, candidate.symbol.clone()));
            if let Some(predicate) = candidate.controlling_predicate {
                needed_predicates.insert(predicate);
            }
        }
    }
}

/// Source lines checked by a test execution: the lines of every sliced
/// instruction plus the lines of the predicates governing them.
///
/// Seeds are the log ranges of checked statement positions; when the test
/// carries no assertions, every executed statement counts as observed.
#[must_use]
pub fn checked_lines(
    result: &ExecutionResult,
    subject: &SubjectProperties,
    checked_positions: &[usize],
) -> HashSet<u32> {
    let log = &result.trace.instruction_log;
    let mut seeds = Vec::new();
    for &position in checked_positions {
        if let Some(&(start, end)) = result.statement_log_ranges.get(position) {
            seeds.extend(start..end);
        }
    }
    let slice = backward_slice(log, &seeds);

    let mut lines = HashSet::new();
    let mut predicates = HashSet::new();
    for index in slice {
        let entry = &log[index];
        lines.insert(entry.line);
        if let Some(predicate) = entry.controlling_predicate {
            predicates.insert(predicate);
        }
    }
    for predicate in predicates {
        if let Some(meta) = subject.predicates.get(&predicate) {
            lines.insert(meta.line);
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::MemoryAccess;

    fn entry(
        code_object: u32,
        offset: u32,
        line: u32,
        access: MemoryAccess,
        symbol: &str,
        predicate: Option<u32>,
    ) -> LoggedInstruction {
        LoggedInstruction {
            code_object,
            offset,
            line,
            access,
            symbol: symbol.to_string(),
            controlling_predicate: predicate,
        }
    }

    #[test]
    fn slice_follows_data_dependencies_backwards() {
        // line 1: x = <input>     (store x)
        // line 2: y = x + 1       (load x, store y)
        // line 3: z = 5           (store z, unrelated)
        // line 4: return y        (load y)
        let log = vec![
            entry(0, 0, 1, MemoryAccess::StoreLocal, "x", None),
            entry(0, 1, 2, MemoryAccess::LoadLocal, "x", None),
            entry(0, 2, 2, MemoryAccess::StoreLocal, "y", None),
            entry(0, 3, 3, MemoryAccess::StoreLocal, "z", None),
            entry(0, 4, 4, MemoryAccess::LoadLocal, "y", None),
        ];
        let slice = backward_slice(&log, &[4]);
        assert!(slice.contains(&4));
        assert!(slice.contains(&2), "definition of y must be sliced");
        assert!(slice.contains(&1), "load of x feeding y must be sliced");
        assert!(slice.contains(&0), "definition of x must be sliced");
        assert!(!slice.contains(&3), "unrelated definition must stay out");
    }

    #[test]
    fn slice_terminates_on_empty_worklist() {
        let log = vec![entry(0, 0, 1, MemoryAccess::LoadLocal, "q", None)];
        let slice = backward_slice(&log, &[0]);
        assert_eq!(slice.len(), 1);
        assert!(backward_slice(&log, &[]).is_empty());
    }

    #[test]
    fn control_parent_definitions_are_included() {
        // line 1: flag = ...            (store flag)
        // line 2 (under predicate 7): y = 1   (store y)
        // line 3: return y              (load y)
        let log = vec![
            entry(0, 0, 1, MemoryAccess::StoreLocal, "flag", None),
            entry(0, 1, 2, MemoryAccess::StoreLocal, "y", Some(7)),
            entry(0, 2, 3, MemoryAccess::LoadLocal, "y", None),
        ];
        let slice = backward_slice(&log, &[2]);
        assert!(slice.contains(&1));
    }
}
