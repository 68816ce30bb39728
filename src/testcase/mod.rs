//! The test-case model: arena-backed statement sequences with positional
//! variable references, assertions keyed to statement positions, and the
//! structural operations the search mutates them with (clone, chop,
//! crossover, structural equality).

use rand::Rng;

pub mod factory;
pub mod statement;

pub use factory::TestFactory;
pub use statement::{Statement, StatementKind, VariableRef};

use crate::cluster::TypeInfo;
use crate::execution::trace::ValueSnapshot;

/// A regression assertion attached to a statement position.
#[derive(Debug, Clone, PartialEq)]
pub enum Assertion {
    /// Exact equality for int/bool/str/none values.
    ValueEquals {
        position: usize,
        expected: ValueSnapshot,
    },
    /// Tolerance-approximate float equality.
    FloatApprox {
        position: usize,
        expected: f64,
        tolerance: f64,
    },
    /// Type-name check for non-primitive values.
    TypeNameIs {
        position: usize,
        expected: String,
    },
    /// Container length check.
    LenEquals {
        position: usize,
        expected: usize,
    },
    /// Equality on a public primitive field of the produced object.
    FieldEquals {
        position: usize,
        field: String,
        expected: ValueSnapshot,
    },
    /// The statement must raise an exception of (a subtype of) this type.
    ExpectedException {
        position: usize,
        exception_type: String,
    },
}

impl Assertion {
    /// The statement position this assertion checks.
    #[must_use]
    pub fn position(&self) -> usize {
        match self {
            Assertion::ValueEquals { position, .. }
            | Assertion::FloatApprox { position, .. }
            | Assertion::TypeNameIs { position, .. }
            | Assertion::LenEquals { position, .. }
            | Assertion::FieldEquals { position, .. }
            | Assertion::ExpectedException { position, .. } => *position,
        }
    }
}

/// A finite ordered statement sequence. Statements refer to earlier values
/// by arena index; the reference-before-use invariant is maintained by every
/// operation and checkable via [`TestCase::references_valid`].
#[derive(Debug, Clone, Default)]
pub struct TestCase {
    statements: Vec<Statement>,
    assertions: Vec<Assertion>,
}

impl TestCase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.statements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    #[must_use]
    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    #[must_use]
    pub fn statement(&self, position: usize) -> &Statement {
        &self.statements[position]
    }

    pub fn statement_mut(&mut self, position: usize) -> &mut Statement {
        &mut self.statements[position]
    }

    #[must_use]
    pub fn assertions(&self) -> &[Assertion] {
        &self.assertions
    }

    pub fn add_assertion(&mut self, assertion: Assertion) {
        debug_assert!(assertion.position() < self.statements.len());
        self.assertions.push(assertion);
    }

    pub fn clear_assertions(&mut self) {
        self.assertions.clear();
    }

    pub fn retain_assertions(&mut self, keep: impl FnMut(&Assertion) -> bool) {
        self.assertions.retain(keep);
    }

    /// Appends a statement, returning the reference to its value.
    pub fn push(&mut self, statement: Statement) -> VariableRef {
        debug_assert!(statement
            .references()
            .iter()
            .all(|r| r.index() < self.statements.len()));
        self.statements.push(statement);
        VariableRef(self.statements.len() - 1)
    }

    /// Inserts a statement at `position`, shifting later references.
    pub fn insert(&mut self, position: usize, statement: Statement) -> VariableRef {
        debug_assert!(position <= self.statements.len());
        self.statements.insert(position, statement);
        for later in self.statements.iter_mut().skip(position + 1) {
            later.remap_references(&|r| {
                if r.index() >= position {
                    Some(VariableRef(r.index() + 1))
                } else {
                    Some(r)
                }
            });
        }
        for assertion in &mut self.assertions {
            shift_assertion(assertion, position);
        }
        VariableRef(position)
    }

    /// Whether every argument reference points at an earlier statement.
    #[must_use]
    pub fn references_valid(&self) -> bool {
        self.statements.iter().enumerate().all(|(position, s)| {
            s.references().iter().all(|r| r.index() < position)
        })
    }

    /// Variables before `limit` whose type satisfies `slot`.
    #[must_use]
    pub fn variables_satisfying(&self, slot: &TypeInfo, limit: usize) -> Vec<VariableRef> {
        self.statements
            .iter()
            .take(limit)
            .enumerate()
            .filter(|(_, s)| s.value_type.satisfies(slot) && s.value_type != TypeInfo::None)
            .map(|(i, _)| VariableRef(i))
            .collect()
    }

    /// Removes the statement at `position` together with every forward
    /// dependent, compacting references. Assertions on removed statements
    /// are dropped.
    pub fn remove_with_dependents(&mut self, position: usize) {
        if position >= self.statements.len() {
            return;
        }
        let mut removed = vec![false; self.statements.len()];
        removed[position] = true;
        for later in position + 1..self.statements.len() {
            if self.statements[later]
                .references()
                .iter()
                .any(|r| removed[r.index()])
            {
                removed[later] = true;
            }
        }
        self.compact(&removed);
    }

    /// Chops the test case to at most `limit` statements, dropping the tail.
    /// The remaining reference graph stays closed because dependents always
    /// sit after their producers.
    pub fn chop(&mut self, limit: usize) {
        if self.statements.len() > limit {
            self.statements.truncate(limit);
            self.assertions.retain(|a| a.position() < limit);
        }
    }

    fn compact(&mut self, removed: &[bool]) {
        let mut mapping: Vec<Option<VariableRef>> = Vec::with_capacity(removed.len());
        let mut next = 0usize;
        for &gone in removed {
            if gone {
                mapping.push(None);
            } else {
                mapping.push(Some(VariableRef(next)));
                next += 1;
            }
        }
        let old_statements = std::mem::take(&mut self.statements);
        for (index, mut statement) in old_statements.into_iter().enumerate() {
            if removed[index] {
                continue;
            }
            let kept = statement.remap_references(&|r| mapping[r.index()]);
            debug_assert!(kept, "dependent survived its producer");
            self.statements.push(statement);
        }
        let old_assertions = std::mem::take(&mut self.assertions);
        self.assertions = old_assertions
            .into_iter()
            .filter_map(|a| remap_assertion(a, &mapping))
            .collect();
    }

    /// Structural equality: same statement shape at each position with the
    /// same positional reference graph. Assertions and inferred types are
    /// not part of the structure.
    #[must_use]
    pub fn structurally_equal(&self, other: &TestCase) -> bool {
        self.statements.len() == other.statements.len()
            && self
                .statements
                .iter()
                .zip(other.statements.iter())
                .all(|(a, b)| a.kind == b.kind)
    }
}

fn shift_assertion(assertion: &mut Assertion, inserted_at: usize) {
    let bump = |position: &mut usize| {
        if *position >= inserted_at {
            *position += 1;
        }
    };
    match assertion {
        Assertion::ValueEquals { position, .. }
        | Assertion::FloatApprox { position, .. }
        | Assertion::TypeNameIs { position, .. }
        | Assertion::LenEquals { position, .. }
        | Assertion::FieldEquals { position, .. }
        | Assertion::ExpectedException { position, .. } => bump(position),
    }
}

fn remap_assertion(assertion: Assertion, mapping: &[Option<VariableRef>]) -> Option<Assertion> {
    let new_position = mapping[assertion.position()]?.index();
    let mut assertion = assertion;
    match &mut assertion {
        Assertion::ValueEquals { position, .. }
        | Assertion::FloatApprox { position, .. }
        | Assertion::TypeNameIs { position, .. }
        | Assertion::LenEquals { position, .. }
        | Assertion::FieldEquals { position, .. }
        | Assertion::ExpectedException { position, .. } => *position = new_position,
    }
    Some(assertion)
}

/// Single-point relative crossover: cut both parents at the same relative
/// point, splice head of one with tail of the other, and rebuild the tail's
/// references against the new head by type-compatible structural mapping.
/// Tail statements that cannot be resolved are discarded. Each offspring is
/// bounded by the longer parent.
#[must_use]
pub fn crossover(p1: &TestCase, p2: &TestCase, rng: &mut impl Rng) -> (TestCase, TestCase) {
    let split: f64 = rng.gen();
    let bound = p1.size().max(p2.size());
    let o1 = splice(p1, p2, split, bound);
    let o2 = splice(p2, p1, split, bound);
    (o1, o2)
}

fn cut_point(len: usize, split: f64) -> usize {
    if len == 0 {
        0
    } else {
        ((len - 1) as f64 * split).floor() as usize + 1
    }
}

fn splice(head_parent: &TestCase, tail_parent: &TestCase, split: f64, bound: usize) -> TestCase {
    let head_len = cut_point(head_parent.size(), split);
    let tail_start = cut_point(tail_parent.size(), split);

    let mut offspring = TestCase::new();
    for statement in &head_parent.statements()[..head_len.min(head_parent.size())] {
        offspring.statements.push(statement.clone());
    }

    // structural mapping: tail-internal references move with the splice;
    // references into the tail parent's head resolve to the latest
    // type-compatible variable of the new head
    let mut tail_mapping: Vec<Option<VariableRef>> = vec![None; tail_parent.size()];
    for (tail_index, statement) in tail_parent.statements().iter().enumerate().skip(tail_start) {
        let mut candidate = statement.clone();
        let offspring_len = offspring.statements.len();
        let resolvable = candidate.remap_references(&|r| {
            if r.index() >= tail_start {
                tail_mapping[r.index()]
            } else {
                let source_type = &tail_parent.statement(r.index()).value_type;
                offspring
                    .variables_satisfying(source_type, offspring_len)
                    .into_iter()
                    .next_back()
            }
        });
        if resolvable {
            tail_mapping[tail_index] = Some(VariableRef(offspring.statements.len()));
            offspring.statements.push(candidate);
        }
    }
    offspring.chop(bound.max(1));
    debug_assert!(offspring.references_valid());
    offspring
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::TypeInfo;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn literal_int(value: i64) -> Statement {
        Statement::new(StatementKind::IntLiteral(value), TypeInfo::Int)
    }

    fn list_of(items: Vec<VariableRef>) -> Statement {
        Statement::new(
            StatementKind::ListLiteral(items),
            TypeInfo::List(Box::new(TypeInfo::Int)),
        )
    }

    #[test]
    fn remove_with_dependents_drops_the_closure() {
        let mut test = TestCase::new();
        let a = test.push(literal_int(1));
        let b = test.push(literal_int(2));
        let lst = test.push(list_of(vec![a, b]));
        test.push(list_of(vec![lst]));
        test.push(literal_int(3));
        test.remove_with_dependents(a.index());
        // a, the list using it, and the list of that list are gone
        assert_eq!(test.size(), 2);
        assert!(test.references_valid());
        assert!(matches!(
            test.statement(0).kind,
            StatementKind::IntLiteral(2)
        ));
    }

    #[test]
    fn chop_keeps_reference_graph_closed() {
        let mut test = TestCase::new();
        let a = test.push(literal_int(1));
        let lst = test.push(list_of(vec![a]));
        test.push(list_of(vec![lst]));
        test.chop(2);
        assert_eq!(test.size(), 2);
        assert!(test.references_valid());
    }

    #[test]
    fn clone_is_deep_and_structurally_equal() {
        let mut test = TestCase::new();
        let a = test.push(literal_int(5));
        test.push(list_of(vec![a]));
        let mut copy = test.clone();
        assert!(test.structurally_equal(&copy));
        copy.statement_mut(0).kind = StatementKind::IntLiteral(6);
        assert!(!test.structurally_equal(&copy));
        assert!(matches!(test.statement(0).kind, StatementKind::IntLiteral(5)));
    }

    #[test]
    fn insert_shifts_later_references_and_assertions() {
        let mut test = TestCase::new();
        let a = test.push(literal_int(1));
        test.push(list_of(vec![a]));
        test.add_assertion(Assertion::LenEquals {
            position: 1,
            expected: 1,
        });
        test.insert(0, literal_int(9));
        assert!(test.references_valid());
        assert_eq!(test.assertions()[0].position(), 2);
        match &test.statement(2).kind {
            StatementKind::ListLiteral(items) => assert_eq!(items[0].index(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn crossover_offspring_satisfy_reference_validity() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut p1 = TestCase::new();
        let a = p1.push(literal_int(1));
        let b = p1.push(literal_int(2));
        p1.push(list_of(vec![a, b]));
        let mut p2 = TestCase::new();
        let c = p2.push(literal_int(7));
        p2.push(list_of(vec![c]));
        p2.push(literal_int(8));
        for _ in 0..50 {
            let (o1, o2) = crossover(&p1, &p2, &mut rng);
            assert!(o1.references_valid());
            assert!(o2.references_valid());
            assert!(o1.size() <= p1.size().max(p2.size()));
            assert!(o2.size() <= p1.size().max(p2.size()));
        }
    }
}
