// THEORY:
// Descriptor matching is brute force: every query descriptor is compared with
// every train descriptor by Hamming distance. Frames carry a few hundred
// features at most, so the quadratic scan stays cheap, and it is exact, which
// keeps RANSAC's input identical from run to run.

use crate::core_modules::features::orb::Descriptor;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
}

/// Brute-force Hamming matching. With cross-check enabled a pair survives only
/// when each descriptor is the other's nearest neighbour.
pub struct Matcher {
    cross_check: bool,
}

impl Default for Matcher {
    fn default() -> Self {
        Self { cross_check: true }
    }
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cross_check(mut self, enabled: bool) -> Self {
        self.cross_check = enabled;
        self
    }

    /// Matches sorted by ascending distance.
    pub fn match_descriptors(&self, query: &[Descriptor], train: &[Descriptor]) -> Vec<FeatureMatch> {
        if query.is_empty() || train.is_empty() {
            return Vec::new();
        }

        let mut matches = Vec::with_capacity(query.len());
        for (query_idx, q) in query.iter().enumerate() {
            let Some((train_idx, distance)) = nearest(q, train) else {
                continue;
            };
            if self.cross_check {
                let reverse = nearest(&train[train_idx], query).map(|(idx, _)| idx);
                if reverse != Some(query_idx) {
                    continue;
                }
            }
            matches.push(FeatureMatch {
                query_idx,
                train_idx,
                distance,
            });
        }

        matches.sort_by(|a, b| a.distance.cmp(&b.distance).then(a.query_idx.cmp(&b.query_idx)));
        matches
    }
}

/// Index and distance of the closest descriptor; the first one wins ties.
fn nearest(descriptor: &Descriptor, candidates: &[Descriptor]) -> Option<(usize, u32)> {
    candidates
        .iter()
        .enumerate()
        .map(|(idx, c)| (idx, descriptor.hamming_distance(c)))
        .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(fill: u8) -> Descriptor {
        Descriptor([fill; 32])
    }

    #[test]
    fn identical_sets_match_one_to_one() {
        let set = vec![desc(0x00), desc(0x0f), desc(0xff)];
        let matches = Matcher::new().match_descriptors(&set, &set);
        assert_eq!(matches.len(), 3);
        assert!(matches.iter().all(|m| m.query_idx == m.train_idx && m.distance == 0));
    }

    #[test]
    fn cross_check_rejects_one_sided_matches() {
        // Both queries prefer train[0], which only prefers query[0] back.
        let query = vec![desc(0x00), desc(0x01)];
        let train = vec![desc(0x00), desc(0xff)];
        let checked = Matcher::new().match_descriptors(&query, &train);
        assert_eq!(checked.len(), 1);
        assert_eq!(checked[0].query_idx, 0);

        let unchecked = Matcher::new()
            .with_cross_check(false)
            .match_descriptors(&query, &train);
        assert_eq!(unchecked.len(), 2);
    }

    #[test]
    fn empty_inputs_produce_no_matches() {
        assert!(Matcher::new().match_descriptors(&[], &[desc(1)]).is_empty());
    }
}
