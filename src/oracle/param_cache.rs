//! Cache of the on-chain oracle module parameters.
//!
//! Parameters change rarely, so a fetch performed at height H serves
//! every height in H's voting-period bucket; at most one gRPC query is
//! issued per bucket.

use crate::chain::OracleParams;

#[derive(Default)]
pub struct ParamCache {
    entry: Option<(i64, OracleParams)>,
}

impl ParamCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached params if `current_height` falls in the same voting-period
    /// bucket as the height the entry was fetched at.
    pub fn get(&self, current_height: i64) -> Option<&OracleParams> {
        let (as_of, params) = self.entry.as_ref()?;
        let vote_period = params.vote_period as i64;
        if vote_period == 0 {
            return None;
        }
        (current_height / vote_period == as_of / vote_period).then_some(params)
    }

    pub fn update(&mut self, height: i64, params: OracleParams) {
        self.entry = Some((height, params));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(vote_period: u64) -> OracleParams {
        OracleParams {
            vote_period,
            accept_list: vec!["ATOM".to_string()],
        }
    }

    #[test]
    fn empty_cache_misses() {
        let cache = ParamCache::new();
        assert!(cache.get(100).is_none());
    }

    #[test]
    fn fresh_within_same_bucket() {
        let mut cache = ParamCache::new();
        cache.update(101, params(10));

        assert!(cache.get(101).is_some());
        assert!(cache.get(109).is_some());
        // Next voting period: stale again.
        assert!(cache.get(110).is_none());
    }

    #[test]
    fn zero_vote_period_never_fresh() {
        let mut cache = ParamCache::new();
        cache.update(101, params(0));
        assert!(cache.get(101).is_none());
    }
}
