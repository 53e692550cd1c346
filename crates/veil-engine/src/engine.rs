//! Composite engine over one or more filter lists.
//!
//! A leaf engine wraps a single list. Merging leaf engines shares their
//! lists by `Arc`, so composing `main` never copies filters.

use std::collections::HashSet;
use std::hash::Hasher;
use std::sync::Arc;

use twox_hash::XxHash64;

use crate::filters::{CosmeticFilter, LineError, NetworkFilter};
use crate::list::{CosmeticQuery, FilterIndex, FilterList, NetworkCandidate};
use crate::snapshot::{self, SnapshotError};
use crate::types::Request;

/// Immutable matching engine.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    lists: Vec<Arc<FilterList>>,
}

/// Filter counts of an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub lists: usize,
    pub network: usize,
    pub cosmetic: usize,
}

impl Engine {
    /// Engine that matches nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile list text into a single-list engine.
    pub fn compile(name: &str, text: &str) -> Self {
        let (engine, errors) = Self::compile_with_errors(name, text);
        if !errors.is_empty() {
            log::debug!("{name}: skipped {} unsupported filters", errors.len());
        }
        engine
    }

    pub fn compile_with_errors(name: &str, text: &str) -> (Self, Vec<LineError>) {
        let (list, errors) = FilterList::parse(name, text);
        (Self::from_list(list), errors)
    }

    /// Engine from already-validated filters.
    pub fn from_filters(
        name: &str,
        digest: u64,
        network: Vec<NetworkFilter>,
        cosmetic: Vec<CosmeticFilter>,
    ) -> Self {
        Self::from_list(FilterList::from_filters(name, digest, network, cosmetic))
    }

    pub fn from_list(list: FilterList) -> Self {
        Self {
            lists: vec![Arc::new(list)],
        }
    }

    /// Union of several engines. Lists shared between inputs are kept once.
    pub fn merge<'a>(engines: impl IntoIterator<Item = &'a Engine>) -> Self {
        let mut seen: HashSet<*const FilterList> = HashSet::new();
        let mut lists = Vec::new();
        for engine in engines {
            for list in &engine.lists {
                if seen.insert(Arc::as_ptr(list)) {
                    lists.push(Arc::clone(list));
                }
            }
        }
        Self { lists }
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Names of the member lists, in merge order.
    pub fn list_names(&self) -> Vec<&str> {
        self.lists.iter().map(|l| l.name()).collect()
    }

    pub fn lists(&self) -> &[Arc<FilterList>] {
        &self.lists
    }

    /// Source digest. Composite engines combine their members' digests.
    pub fn digest(&self) -> u64 {
        match self.lists.as_slice() {
            [single] => single.digest(),
            lists => {
                let mut hasher = XxHash64::with_seed(0);
                for list in lists {
                    hasher.write(list.name().as_bytes());
                    hasher.write_u64(list.digest());
                }
                hasher.finish()
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            lists: self.lists.len(),
            network: self.lists.iter().map(|l| l.network_filters().len()).sum(),
            cosmetic: self.lists.iter().map(|l| l.cosmetic_filters().len()).sum(),
        }
    }

    /// Encode as a versioned snapshot blob.
    pub fn serialize(&self) -> Result<Vec<u8>, SnapshotError> {
        snapshot::encode(self.lists.iter().map(|l| l.as_ref()))
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, SnapshotError> {
        let lists = snapshot::decode(data)?;
        Ok(Self {
            lists: lists.into_iter().map(Arc::new).collect(),
        })
    }
}

impl FilterIndex for Engine {
    fn collect_network<'a>(&'a self, request: &Request, out: &mut Vec<NetworkCandidate<'a>>) {
        for list in &self.lists {
            list.collect_network(request, out);
        }
    }

    fn collect_cosmetics<'a>(&'a self, query: &CosmeticQuery, out: &mut Vec<&'a CosmeticFilter>) {
        for list in &self.lists {
            list.collect_cosmetics(query, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MatchDecision;

    #[test]
    fn merged_engine_matches_union() {
        let ads = Engine::compile("ads", "||ads.com^");
        let tracking = Engine::compile("tracking", "||tracker.com^\n@@||ads.com/allowed^");
        let main = Engine::merge([&ads, &tracking]);

        assert_eq!(main.list_names(), vec!["ads", "tracking"]);
        let req = Request::new("https://tracker.com/t.js", Some("https://site.com"), "script");
        assert_eq!(main.match_request(&req).decision, MatchDecision::Block);

        // exceptions apply across member lists
        let req = Request::new("https://ads.com/allowed", Some("https://site.com"), "script");
        let result = main.match_request(&req);
        assert_eq!(result.decision, MatchDecision::Allow);
        assert_eq!(result.list.as_deref(), Some("tracking"));
    }

    #[test]
    fn merge_shares_lists() {
        let ads = Engine::compile("ads", "||ads.com^");
        let main = Engine::merge([&ads, &ads]);
        assert_eq!(main.stats().lists, 1);
        assert!(Arc::ptr_eq(&main.lists()[0], &ads.lists()[0]));
    }

    #[test]
    fn empty_engine_allows_everything() {
        let engine = Engine::empty();
        let req = Request::new("https://ads.com/", Some("https://site.com"), "script");
        assert!(!engine.match_request(&req).matched());
        assert!(engine.match_cosmetics(&CosmeticQuery::bootstrap("https://site.com/")).is_empty());
    }

    #[test]
    fn snapshot_round_trip_keeps_behaviour() {
        let engine = Engine::compile("ads", "||ads.com^$script\n/ad[0-9]+/\nsite.com##.ad");
        let restored = Engine::deserialize(&engine.serialize().unwrap()).unwrap();

        assert_eq!(restored.digest(), engine.digest());
        assert_eq!(restored.stats(), engine.stats());
        let req = Request::new("https://cdn.com/ad42.png", Some("https://site.com"), "image");
        assert_eq!(restored.match_request(&req).decision, MatchDecision::Block);
        let cosmetic = restored.match_cosmetics(&CosmeticQuery::bootstrap("https://site.com/"));
        assert_eq!(cosmetic.styles, ".ad{display:none !important;}");
    }
}
