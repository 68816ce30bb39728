//! Parent selection: rank-biased and tournament selection over a ranked
//! population.

use rand::Rng;

use super::ranking::Ranking;

/// The configured selection operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selection {
    /// Rank selection with the given bias in `(1, 2]`.
    Rank { bias: f64 },
    /// Tournament selection with the given arity.
    Tournament { size: usize },
}

impl Default for Selection {
    fn default() -> Self {
        Selection::Tournament { size: 5 }
    }
}

impl Selection {
    /// Picks one population index. Assumes `order` lists indices from most
    /// to least preferred.
    pub fn select(
        &self,
        ranking: &Ranking,
        order: &[usize],
        rng: &mut impl Rng,
    ) -> usize {
        debug_assert!(!order.is_empty());
        match self {
            Selection::Rank { bias } => {
                let n = order.len() as f64;
                let random: f64 = rng.gen();
                // standard rank-bias transformation onto [0, n)
                let index = (n
                    * (bias - (bias * bias - 4.0 * (bias - 1.0) * random).sqrt())
                    / (2.0 * (bias - 1.0)))
                    .floor() as usize;
                order[index.min(order.len() - 1)]
            }
            Selection::Tournament { size } => {
                let mut best = order[rng.gen_range(0..order.len())];
                for _ in 1..*size {
                    let challenger = order[rng.gen_range(0..order.len())];
                    if ranking.preferred(challenger, best) {
                        best = challenger;
                    }
                }
                best
            }
        }
    }
}

/// Indices ordered by preference (rank ascending, distance descending).
#[must_use]
pub fn preference_order(ranking: &Ranking, population_len: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..population_len).collect();
    order.sort_by(|&a, &b| {
        ranking.rank_of(a).cmp(&ranking.rank_of(b)).then(
            ranking
                .distance_of(b)
                .partial_cmp(&ranking.distance_of(a))
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ranking() -> Ranking {
        Ranking {
            fronts: vec![vec![2], vec![0], vec![1]],
            rank: vec![1, 2, 0],
            distance: vec![0.0, 0.0, 1.0],
        }
    }

    #[test]
    fn preference_order_sorts_by_rank() {
        let order = preference_order(&ranking(), 3);
        assert_eq!(order, vec![2, 0, 1]);
    }

    #[test]
    fn tournament_prefers_lower_ranks() {
        let ranking = ranking();
        let order = preference_order(&ranking, 3);
        let selection = Selection::Tournament { size: 3 };
        let mut rng = StdRng::seed_from_u64(4);
        let mut wins = [0usize; 3];
        for _ in 0..200 {
            wins[selection.select(&ranking, &order, &mut rng)] += 1;
        }
        assert!(wins[2] > wins[0]);
        assert!(wins[0] >= wins[1]);
    }

    #[test]
    fn rank_selection_is_biased_to_the_front() {
        let ranking = ranking();
        let order = preference_order(&ranking, 3);
        let selection = Selection::Rank { bias: 1.7 };
        let mut rng = StdRng::seed_from_u64(9);
        let mut wins = [0usize; 3];
        for _ in 0..300 {
            wins[selection.select(&ranking, &order, &mut rng)] += 1;
        }
        assert!(wins[2] > wins[1]);
    }
}
