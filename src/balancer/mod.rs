use std::collections::HashMap;
use std::hash::Hash;

use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PickError {
    #[error("no items to pick from")]
    EmptyItems,

    #[error("total weight must be greater than 0")]
    NonPositiveTotal,
}

/// 按权重随机选取一个 key，概率为 weight / total。
///
/// 单次调用内只遍历一遍，遍历顺序在本次调用中固定。
pub fn weighted_random<K>(items: &HashMap<K, i64>) -> Result<K, PickError>
where
    K: Eq + Hash + Clone,
{
    if items.is_empty() {
        return Err(PickError::EmptyItems);
    }
    let total: i64 = items.values().sum();
    if total <= 0 {
        return Err(PickError::NonPositiveTotal);
    }

    let mut r = rand::rng().random_range(0..total);
    for (key, weight) in items {
        if r < *weight {
            return Ok(key.clone());
        }
        r -= *weight;
    }
    // r < total and the pass subtracts every weight, so this is unreachable.
    Err(PickError::NonPositiveTotal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_items_is_an_error() {
        let items: HashMap<i64, i64> = HashMap::new();
        assert_eq!(weighted_random(&items), Err(PickError::EmptyItems));
    }

    #[test]
    fn non_positive_total_is_an_error() {
        let mut items = HashMap::new();
        items.insert(1i64, 0i64);
        items.insert(2i64, 0i64);
        assert_eq!(weighted_random(&items), Err(PickError::NonPositiveTotal));
    }

    #[test]
    fn single_entry_is_deterministic() {
        let mut items = HashMap::new();
        items.insert(42i64, 3i64);
        for _ in 0..100 {
            assert_eq!(weighted_random(&items), Ok(42));
        }
    }

    #[test]
    fn only_positive_weights_are_reachable() {
        // 权重为0的条目永远不会被选中（r 严格小于 total）。
        let mut items = HashMap::new();
        items.insert("a", 5i64);
        items.insert("b", 0i64);
        for _ in 0..200 {
            assert_eq!(weighted_random(&items), Ok("a"));
        }
    }

    #[test]
    fn distribution_tracks_weights() {
        let mut items = HashMap::new();
        items.insert("heavy", 9i64);
        items.insert("light", 1i64);

        let mut heavy = 0usize;
        let rounds = 5000;
        for _ in 0..rounds {
            if weighted_random(&items).unwrap() == "heavy" {
                heavy += 1;
            }
        }
        // 期望约 90%，留出宽松的统计余量。
        let ratio = heavy as f64 / rounds as f64;
        assert!(ratio > 0.8, "heavy ratio too low: {ratio}");
        assert!(ratio < 0.98, "heavy ratio too high: {ratio}");
    }
}
