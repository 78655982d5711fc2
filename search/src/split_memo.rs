//! Memoized enumeration of tile-size factorization schemes.

use std::collections::HashMap;
use std::sync::Arc;

type QueryKey = (i64, usize, i64);

/// Enumerates, and caches per policy lifetime, every way to pick
/// `num_lengths` factors whose product divides `extent`, with the innermost
/// factor capped.
///
/// Scheme order is deterministic (factors ascending, depth-first), so a
/// seeded random pick over the list reproduces across runs.
#[derive(Debug, Default)]
pub struct SplitFactorizationMemo {
    memory: HashMap<QueryKey, Arc<Vec<Vec<i64>>>>,
    factor_cache: HashMap<i64, Arc<Vec<i64>>>,
}

impl SplitFactorizationMemo {
    pub fn get_factorization_schemes(
        &mut self,
        extent: i64,
        num_lengths: usize,
        max_innermost_factor: i64,
    ) -> Arc<Vec<Vec<i64>>> {
        let key = (extent, num_lengths, max_innermost_factor);
        if let Some(cached) = self.memory.get(&key) {
            return cached.clone();
        }
        if num_lengths == 0 || extent <= 0 {
            let empty = Arc::new(Vec::new());
            self.memory.insert(key, Arc::clone(&empty));
            return empty;
        }
        let mut results = Vec::new();
        let mut stack = vec![0i64; num_lengths];
        self.dfs_enumerate(0, extent, max_innermost_factor, num_lengths, &mut stack, &mut results);
        let results = Arc::new(results);
        self.memory.insert(key, results.clone());
        results
    }

    fn dfs_enumerate(
        &mut self,
        now: usize,
        remaining_length: i64,
        max_innermost_factor: i64,
        num_lengths: usize,
        stack: &mut Vec<i64>,
        results: &mut Vec<Vec<i64>>,
    ) {
        if now == num_lengths {
            if stack[num_lengths - 1] <= max_innermost_factor {
                results.push(stack.clone());
            }
            return;
        }
        for f in self.get_factors(remaining_length).iter() {
            stack[now] = *f;
            self.dfs_enumerate(now + 1, remaining_length / f, max_innermost_factor, num_lengths, stack, results);
        }
    }

    /// Sorted divisors of `n`.
    fn get_factors(&mut self, n: i64) -> Arc<Vec<i64>> {
        if let Some(cached) = self.factor_cache.get(&n) {
            return cached.clone();
        }
        let mut factors = Vec::new();
        let mut d = 1;
        while d * d <= n {
            if n % d == 0 {
                factors.push(d);
                if d * d != n {
                    factors.push(n / d);
                }
            }
            d += 1;
        }
        factors.sort_unstable();
        let factors = Arc::new(factors);
        self.factor_cache.insert(n, factors.clone());
        factors
    }
}
