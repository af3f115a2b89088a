//! Transfer-share accounting.
//!
//! A share is a named fairness bucket, typically derived from the owning
//! identity. `TransferSharesConf` is the long-lived configuration (base
//! priorities for reference shares); `TransferShares` is the per-admission
//! pass accounting, rebuilt from scratch each pass from a snapshot of
//! queued and active requests.

use std::collections::HashMap;

use dtr::Dtr;

pub const DEFAULT_SHARE: &str = "_default";
pub const DEFAULT_PRIORITY: u32 = 50;

/// How share names are derived from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShareType {
    /// Every request lands in the default share.
    #[default]
    None,
    /// One share per owning identity.
    User,
}

/// Share configuration: derivation rule plus base priorities for
/// explicitly configured ("reference") shares.
#[derive(Debug, Clone, Default)]
pub struct TransferSharesConf {
    share_type: ShareType,
    reference_shares: HashMap<String, u32>,
}

impl TransferSharesConf {
    pub fn new(share_type: ShareType) -> Self {
        Self {
            share_type,
            reference_shares: HashMap::new(),
        }
    }

    /// Derive the share a request belongs to. Empty owner means no share
    /// information is available and the caller falls back to the default.
    pub fn extract_share_info(&self, dtr: &Dtr) -> String {
        match self.share_type {
            ShareType::None => DEFAULT_SHARE.to_owned(),
            ShareType::User => {
                if dtr.owner().is_empty() {
                    String::new()
                } else {
                    dtr.owner().to_owned()
                }
            }
        }
    }

    pub fn is_configured(&self, share: &str) -> bool {
        self.reference_shares.contains_key(share)
    }

    /// Promote a share to a reference share with an explicit priority.
    pub fn set_reference_share(&mut self, share: impl Into<String>, priority: u32) {
        self.reference_shares.insert(share.into(), priority);
    }

    pub fn basic_priority(&self, share: &str) -> u32 {
        self.reference_shares
            .get(share)
            .copied()
            .unwrap_or(DEFAULT_PRIORITY)
    }
}

/// Per-pass slot accounting for one processing stage.
///
/// Allotment is proportional to the share's base priority, bounded by the
/// stage slot limit, with a floor of one slot for every share that has
/// demand. The floor is what guarantees the emergency-slot fairness
/// property: a share with queued work is always allowed at least one
/// grant.
#[derive(Debug)]
pub struct TransferShares {
    conf: TransferSharesConf,
    demand: HashMap<String, usize>,
    allotted: HashMap<String, i64>,
}

impl TransferShares {
    pub fn new(conf: TransferSharesConf) -> Self {
        Self {
            conf,
            demand: HashMap::new(),
            allotted: HashMap::new(),
        }
    }

    /// Count one queued or active request for `share`.
    pub fn increase_transfer_share(&mut self, share: &str) {
        *self.demand.entry(share.to_owned()).or_insert(0) += 1;
    }

    /// Compute each share's slot entitlement from the recorded demand.
    pub fn calculate_shares(&mut self, slot_limit: usize) {
        self.allotted.clear();
        if self.demand.is_empty() {
            return;
        }
        let total_weight: u64 = self
            .demand
            .keys()
            .map(|share| u64::from(self.conf.basic_priority(share)))
            .sum();
        for share in self.demand.keys() {
            let weight = u64::from(self.conf.basic_priority(share));
            let proportional = if total_weight == 0 {
                0
            } else {
                (slot_limit as u64 * weight / total_weight) as i64
            };
            self.allotted.insert(share.clone(), proportional.max(1));
        }
    }

    pub fn can_start(&self, share: &str) -> bool {
        self.allotted.get(share).copied().unwrap_or(0) > 0
    }

    /// Consume one slot of `share`'s entitlement. Goes negative for
    /// transient overcommit by already-active requests, which simply keeps
    /// the share from starting more.
    pub fn decrease_number_of_slots(&mut self, share: &str) {
        *self.allotted.entry(share.to_owned()).or_insert(0) -= 1;
    }

    /// Shares with any demand recorded this pass.
    pub fn active_shares(&self) -> Vec<&str> {
        self.demand.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtr::PlainEndpoint;
    use url::Url;

    fn dtr_for(owner: &str) -> Dtr {
        Dtr::new(
            Box::new(PlainEndpoint::new(
                Url::parse("gsiftp://se.example.org/f").unwrap(),
            )),
            Box::new(PlainEndpoint::new(Url::parse("file:///tmp/f").unwrap())),
            "job1",
            owner,
        )
    }

    #[test]
    fn share_extraction_by_user() {
        let conf = TransferSharesConf::new(ShareType::User);
        assert_eq!(conf.extract_share_info(&dtr_for("alice")), "alice");
        assert_eq!(conf.extract_share_info(&dtr_for("")), "");

        let none = TransferSharesConf::new(ShareType::None);
        assert_eq!(none.extract_share_info(&dtr_for("alice")), DEFAULT_SHARE);
    }

    #[test]
    fn reference_share_priority() {
        let mut conf = TransferSharesConf::new(ShareType::User);
        conf.set_reference_share("vip", 80);
        assert!(conf.is_configured("vip"));
        assert!(!conf.is_configured("alice"));
        assert_eq!(conf.basic_priority("vip"), 80);
        assert_eq!(conf.basic_priority("alice"), DEFAULT_PRIORITY);
    }

    #[test]
    fn equal_weights_split_evenly() {
        let conf = TransferSharesConf::new(ShareType::User);
        let mut shares = TransferShares::new(conf);
        for _ in 0..5 {
            shares.increase_transfer_share("alice");
        }
        for _ in 0..5 {
            shares.increase_transfer_share("bob");
        }
        shares.calculate_shares(10);
        for _ in 0..5 {
            assert!(shares.can_start("alice"));
            shares.decrease_number_of_slots("alice");
        }
        assert!(!shares.can_start("alice"));
        assert!(shares.can_start("bob"));
    }

    #[test]
    fn higher_priority_share_gets_more_slots() {
        let mut conf = TransferSharesConf::new(ShareType::User);
        conf.set_reference_share("vip", 75);
        conf.set_reference_share("batch", 25);
        let mut shares = TransferShares::new(conf);
        shares.increase_transfer_share("vip");
        shares.increase_transfer_share("batch");
        shares.calculate_shares(8);
        // vip: 8 * 75/100 = 6, batch: 8 * 25/100 = 2
        let mut vip = 0;
        while shares.can_start("vip") {
            shares.decrease_number_of_slots("vip");
            vip += 1;
        }
        let mut batch = 0;
        while shares.can_start("batch") {
            shares.decrease_number_of_slots("batch");
            batch += 1;
        }
        assert_eq!(vip, 6);
        assert_eq!(batch, 2);
    }

    #[test]
    fn every_share_with_demand_gets_at_least_one_slot() {
        let conf = TransferSharesConf::new(ShareType::User);
        let mut shares = TransferShares::new(conf);
        for i in 0..10 {
            shares.increase_transfer_share(&format!("share{i}"));
        }
        // Slot limit smaller than the number of shares.
        shares.calculate_shares(3);
        for i in 0..10 {
            assert!(shares.can_start(&format!("share{i}")), "share{i} has no slot");
        }
    }

    #[test]
    fn active_shares_lists_demand() {
        let conf = TransferSharesConf::default();
        let mut shares = TransferShares::new(conf);
        shares.increase_transfer_share("alice");
        shares.increase_transfer_share("alice");
        shares.increase_transfer_share("bob");
        let mut active = shares.active_shares();
        active.sort_unstable();
        assert_eq!(active, vec!["alice", "bob"]);
    }
}
