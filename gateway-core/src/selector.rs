//! Weighted random selection over an eligibility-filtered candidate set.
//!
//! A pure function, deliberately decoupled from [`crate::circuit`] and
//! [`crate::health`]: the pool is responsible for resolving each
//! credential's admission (including claiming a HALF_OPEN probe slot)
//! before candidates ever reach this module. Selection expands each
//! candidate by its integer weight and draws uniformly from the result.

use rand::Rng;

/// One credential eligible for selection at this instant.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The credential's stable id.
    pub id: String,
    /// Its configured weight; must be `>= 1` (enforced by
    /// [`crate::credential::CredentialRecord::new`]).
    pub weight: u32,
}

/// Draw one candidate, with probability proportional to weight.
///
/// Returns `None` if `candidates` is empty. Expands each candidate into a
/// virtual pool sized by its weight and draws a uniform index into the
/// combined pool, so `P(pick c) == weight(c) / sum(weight(eligible))`.
pub fn select<R: Rng + ?Sized>(candidates: &[Candidate], rng: &mut R) -> Option<String> {
    let total_weight: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();
    if total_weight == 0 {
        return None;
    }
    let mut draw = rng.random_range(0..total_weight);
    for candidate in candidates {
        let weight = u64::from(candidate.weight);
        if draw < weight {
            return Some(candidate.id.clone());
        }
        draw -= weight;
    }
    unreachable!("draw must fall within the expanded weight pool")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashMap;

    #[test]
    fn empty_candidates_yield_none() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(select(&[], &mut rng), None);
    }

    #[test]
    fn single_candidate_always_wins() {
        let candidates = vec![Candidate {
            id: "k1".to_string(),
            weight: 1,
        }];
        let mut rng = StdRng::seed_from_u64(42);
        assert_eq!(select(&candidates, &mut rng).as_deref(), Some("k1"));
    }

    #[test]
    fn selection_frequency_tracks_weight() {
        let candidates = vec![
            Candidate {
                id: "heavy".to_string(),
                weight: 9,
            },
            Candidate {
                id: "light".to_string(),
                weight: 1,
            },
        ];
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..10_000 {
            let picked = select(&candidates, &mut rng).unwrap();
            *counts.entry(picked).or_default() += 1;
        }
        let heavy = f64::from(*counts.get("heavy").unwrap_or(&0));
        let light = f64::from(*counts.get("light").unwrap_or(&0));
        let ratio = heavy / light;
        assert!((ratio - 9.0).abs() < 2.0, "ratio was {ratio}");
    }
}
