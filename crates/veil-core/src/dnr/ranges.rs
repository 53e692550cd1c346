//! Rule id partitioning
//!
//! Every family owns a half-open id range. Ranges never overlap, so replacing
//! one family can never remove another family's rules.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::Rule;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleFamily {
    Pause,
    /// Managed trusted domains
    TrustedDomains,
    RedirectProtection,
    /// Tab-scoped session rules
    RedirectAllowOnce,
    SafeMode,
    Exceptions,
    CustomFilters,
    Fixes,
}

impl RuleFamily {
    /// Families in submission order.
    pub const ALL: [RuleFamily; 8] = [
        RuleFamily::Pause,
        RuleFamily::TrustedDomains,
        RuleFamily::RedirectProtection,
        RuleFamily::RedirectAllowOnce,
        RuleFamily::SafeMode,
        RuleFamily::Exceptions,
        RuleFamily::CustomFilters,
        RuleFamily::Fixes,
    ];

    pub const fn range(self) -> Range<u32> {
        match self {
            RuleFamily::Pause => 1..1_000,
            RuleFamily::RedirectProtection => 1_000..2_000,
            RuleFamily::RedirectAllowOnce => 2_000..3_000,
            RuleFamily::SafeMode => 3_000..3_010,
            RuleFamily::TrustedDomains => 3_100..3_200,
            RuleFamily::Exceptions => 1_000_000..2_000_000,
            RuleFamily::CustomFilters => 2_000_000..3_000_000,
            RuleFamily::Fixes => 3_000_000..4_000_000,
        }
    }

    /// Session rules live until the browser restarts.
    pub const fn is_session(self) -> bool {
        matches!(self, RuleFamily::RedirectAllowOnce)
    }

    pub fn contains(self, id: u32) -> bool {
        self.range().contains(&id)
    }

    pub fn capacity(self) -> usize {
        let range = self.range();
        (range.end - range.start) as usize
    }

    /// Family owning `id`, if any.
    pub fn of(id: u32) -> Option<RuleFamily> {
        Self::ALL.into_iter().find(|family| family.contains(id))
    }

    /// Number the rules from the start of the range.
    pub fn assign(self, rules: Vec<Rule>) -> Result<Vec<Rule>> {
        if rules.len() > self.capacity() {
            return Err(Error::RangeOverflow {
                family: self,
                count: rules.len(),
                capacity: self.capacity(),
            });
        }
        Ok(rules
            .into_iter()
            .zip(self.range())
            .map(|(rule, id)| Rule { id, ..rule })
            .collect())
    }
}

const fn ranges_disjoint() -> bool {
    let all = RuleFamily::ALL;
    let mut i = 0;
    while i < all.len() {
        let a = all[i].range();
        if a.start == 0 || a.start >= a.end {
            return false;
        }
        let mut j = i + 1;
        while j < all.len() {
            let b = all[j].range();
            if a.start < b.end && b.start < a.end {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const _: () = assert!(ranges_disjoint(), "rule family id ranges overlap");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnr::{ActionType, RuleAction, RuleCondition};

    fn rules(n: usize) -> Vec<Rule> {
        (0..n)
            .map(|_| Rule::new(1, RuleAction::new(ActionType::Block), RuleCondition::default()))
            .collect()
    }

    #[test]
    fn ids_start_at_range_start() {
        let assigned = RuleFamily::Exceptions.assign(rules(3)).unwrap();
        let ids: Vec<u32> = assigned.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1_000_000, 1_000_001, 1_000_002]);
        assert!(ids.iter().all(|&id| RuleFamily::of(id) == Some(RuleFamily::Exceptions)));
    }

    #[test]
    fn overflow_is_an_error() {
        let err = RuleFamily::SafeMode.assign(rules(11)).unwrap_err();
        assert!(matches!(
            err,
            Error::RangeOverflow {
                family: RuleFamily::SafeMode,
                count: 11,
                capacity: 10
            }
        ));
    }

    #[test]
    fn no_id_belongs_to_two_families() {
        for family in RuleFamily::ALL {
            let range = family.range();
            for id in [range.start, range.end - 1] {
                assert_eq!(RuleFamily::of(id), Some(family));
            }
        }
        assert_eq!(RuleFamily::of(0), None);
        assert_eq!(RuleFamily::of(500_000), None);
    }
}
