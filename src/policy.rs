//! Rule model and the policy repository
//!
//! The repository owns the currently installed rule set as an immutable
//! snapshot behind a reader/writer lock. A reload builds a complete new set
//! and swaps the pointer; readers holding the previous snapshot keep seeing
//! it unchanged. Selection scans the snapshot in parallel and picks the
//! highest-priority candidate, breaking ties by file order.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use rayon::prelude::*;
use regex::Regex;
use tracing::{debug, info};

/// A number predicate compiled from a rule column.
///
/// A pattern that failed to compile degrades to a predicate that matches
/// nothing, so one bad column disables its rule instead of the whole load.
#[derive(Debug, Clone)]
pub struct NumberPattern(Option<Regex>);

impl NumberPattern {
    pub fn compiled(re: Regex) -> Self {
        NumberPattern(Some(re))
    }

    /// The never-matching predicate used when compilation failed
    pub fn never() -> Self {
        NumberPattern(None)
    }

    /// Unanchored match against a caller/callee/diversion number
    pub fn matches(&self, number: &str) -> bool {
        match &self.0 {
            Some(re) => re.is_match(number),
            None => false,
        }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_ref().map(|re| re.as_str()).unwrap_or("")
    }
}

/// One routing rule: a matching clause plus an action template
#[derive(Debug)]
pub struct Rule {
    pub id: i64,
    /// Semantic reserved; parsed and preserved
    pub state: i64,
    pub priority: i64,
    pub description: String,
    pub num_a: NumberPattern,
    pub num_b: NumberPattern,
    pub num_c: NumberPattern,
    /// Inclusive Unix-second activity window
    pub period_start: i64,
    pub period_stop: i64,
    pub src_cidrs: Vec<IpNet>,
    pub sbc_cidrs: Vec<IpNet>,
    /// Redirect-target template; placeholders resolved by the engine
    pub target: String,
    pub src_type: String,
    pub require_sim_a: Option<bool>,
    pub require_sim_b: Option<bool>,
    pub operator_b: String,
    pub match_counter: AtomicU64,
}

impl Rule {
    /// Check every predicate of this rule against one call.
    ///
    /// `src_ip`/`sbc_ip` are `None` when the address string did not parse;
    /// that never matches.
    pub fn matches(
        &self,
        num_a: &str,
        num_b: &str,
        num_c: &str,
        now_unix: i64,
        src_ip: Option<IpAddr>,
        sbc_ip: Option<IpAddr>,
    ) -> bool {
        if now_unix < self.period_start || now_unix > self.period_stop {
            return false;
        }
        if !ip_in_range(src_ip, &self.src_cidrs) || !ip_in_range(sbc_ip, &self.sbc_cidrs) {
            return false;
        }
        self.num_a.matches(num_a) && self.num_b.matches(num_b) && self.num_c.matches(num_c)
    }

    pub fn matches_seen(&self) -> u64 {
        self.match_counter.load(Ordering::Relaxed)
    }
}

/// CIDR membership over an ordered block list.
///
/// An empty list matches nothing: a rule loaded without source ranges is
/// deliberately inert (see the loader module docs).
pub fn ip_in_range(ip: Option<IpAddr>, ranges: &[IpNet]) -> bool {
    let Some(ip) = ip else {
        return false;
    };
    ranges.iter().any(|net| net.contains(&ip))
}

/// An installed, immutable rule set with its provenance
#[derive(Debug)]
pub struct RuleSet {
    pub rules: Vec<Arc<Rule>>,
    pub version: String,
    pub loaded_at: DateTime<Utc>,
}

/// Owner of the current rule set
#[derive(Debug, Default)]
pub struct PolicyRepository {
    current: RwLock<Option<Arc<RuleSet>>>,
}

impl PolicyRepository {
    pub fn new() -> Self {
        PolicyRepository {
            current: RwLock::new(None),
        }
    }

    /// Atomically install a freshly loaded rule set
    pub fn set_rules(&self, rules: Vec<Rule>, version: impl Into<String>) {
        let set = Arc::new(RuleSet {
            rules: rules.into_iter().map(Arc::new).collect(),
            version: version.into(),
            loaded_at: Utc::now(),
        });
        let mut guard = self.current.write().expect("policy store lock poisoned");
        *guard = Some(set);
    }

    /// Snapshot of the installed set; empty before the first load
    pub fn snapshot(&self) -> Option<Arc<RuleSet>> {
        self.current
            .read()
            .expect("policy store lock poisoned")
            .clone()
    }

    pub fn version(&self) -> String {
        self.snapshot().map(|s| s.version.clone()).unwrap_or_default()
    }

    pub fn last_load_time(&self) -> Option<DateTime<Utc>> {
        self.snapshot().map(|s| s.loaded_at)
    }

    /// Select the best rule for one call.
    ///
    /// Candidates are evaluated in parallel; the winner is the candidate
    /// with the highest priority, and among equal priorities the one that
    /// came first in the file. The winner's match counter is incremented
    /// exactly once.
    pub fn find_best(
        &self,
        num_a: &str,
        num_b: &str,
        num_c: &str,
        now_unix: i64,
        src_ip: &str,
        sbc_ip: &str,
        call_id: &str,
    ) -> Option<Arc<Rule>> {
        let set = self.snapshot()?;

        let src = src_ip.parse::<IpAddr>().ok();
        let sbc = sbc_ip.parse::<IpAddr>().ok();
        if src.is_none() {
            debug!("Call-ID: {} invalid source IP: {}", call_id, src_ip);
        }
        if sbc.is_none() {
            debug!("Call-ID: {} invalid SBC IP: {}", call_id, sbc_ip);
        }

        let best = set
            .rules
            .par_iter()
            .enumerate()
            .filter(|(_, rule)| rule.matches(num_a, num_b, num_c, now_unix, src, sbc))
            // min over (-priority, file index) is the deterministic winner
            .min_by_key(|(idx, rule)| (std::cmp::Reverse(rule.priority), *idx))
            .map(|(_, rule)| Arc::clone(rule));

        if let Some(rule) = &best {
            rule.match_counter.fetch_add(1, Ordering::Relaxed);
            info!(
                "Call-ID: {} best policy ID {} found with priority {}",
                call_id, rule.id, rule.priority
            );
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(p: &str) -> NumberPattern {
        NumberPattern::compiled(Regex::new(p).unwrap())
    }

    fn cidrs(blocks: &[&str]) -> Vec<IpNet> {
        blocks.iter().map(|b| b.parse().unwrap()).collect()
    }

    fn rule(id: i64, priority: i64, num_a: &str, num_b: &str) -> Rule {
        Rule {
            id,
            state: 0,
            priority,
            description: String::new(),
            num_a: pattern(num_a),
            num_b: pattern(num_b),
            num_c: pattern(".*"),
            period_start: 0,
            period_stop: 99_999_999_999,
            src_cidrs: cidrs(&["10.0.0.0/24"]),
            sbc_cidrs: cidrs(&["10.0.0.0/24"]),
            target: format!("sip:target{}@host", id),
            src_type: String::new(),
            require_sim_a: None,
            require_sim_b: None,
            operator_b: String::new(),
            match_counter: AtomicU64::new(0),
        }
    }

    fn find(repo: &PolicyRepository, num_a: &str, num_b: &str) -> Option<Arc<Rule>> {
        repo.find_best(num_a, num_b, "", 1000, "10.0.0.7", "10.0.0.7", "cid-test")
    }

    #[test]
    fn test_highest_priority_wins() {
        let repo = PolicyRepository::new();
        repo.set_rules(
            vec![rule(1, 5, "^555$", "^777$"), rule(2, 10, "^555$", "^777$")],
            "rules.csv",
        );
        let best = find(&repo, "555", "777").unwrap();
        assert_eq!(best.id, 2);
    }

    #[test]
    fn test_priority_tie_file_order_wins() {
        let repo = PolicyRepository::new();
        repo.set_rules(
            vec![rule(7, 5, "^555$", "^777$"), rule(8, 5, "^555$", "^777$")],
            "rules.csv",
        );
        let set = repo.snapshot().unwrap();
        let best = find(&repo, "555", "777").unwrap();
        assert_eq!(best.id, 7);
        assert_eq!(set.rules[0].matches_seen(), 1);
        assert_eq!(set.rules[1].matches_seen(), 0);
    }

    #[test]
    fn test_no_candidates() {
        let repo = PolicyRepository::new();
        repo.set_rules(vec![rule(1, 5, "^555$", "^777$")], "rules.csv");
        assert!(find(&repo, "555", "888").is_none());
    }

    #[test]
    fn test_empty_cidr_list_matches_nothing() {
        let repo = PolicyRepository::new();
        let mut r = rule(1, 5, ".*", ".*");
        r.src_cidrs.clear();
        repo.set_rules(vec![r], "rules.csv");
        assert!(find(&repo, "555", "777").is_none());
    }

    #[test]
    fn test_unparseable_address_matches_nothing() {
        let repo = PolicyRepository::new();
        repo.set_rules(vec![rule(1, 5, ".*", ".*")], "rules.csv");
        assert!(repo
            .find_best("555", "777", "", 1000, "not-an-ip", "10.0.0.7", "cid")
            .is_none());
    }

    #[test]
    fn test_inverted_period_never_matches() {
        let repo = PolicyRepository::new();
        let mut r = rule(1, 5, ".*", ".*");
        r.period_start = 2000;
        r.period_stop = 1000;
        repo.set_rules(vec![r], "rules.csv");
        for now in [0, 1000, 1500, 2000, 3000] {
            assert!(repo
                .find_best("555", "777", "", now, "10.0.0.7", "10.0.0.7", "cid")
                .is_none());
        }
    }

    #[test]
    fn test_period_bounds_inclusive() {
        let mut r = rule(1, 5, ".*", ".*");
        r.period_start = 100;
        r.period_stop = 200;
        let src = "10.0.0.7".parse().ok();
        assert!(r.matches("a", "b", "", 100, src, src));
        assert!(r.matches("a", "b", "", 200, src, src));
        assert!(!r.matches("a", "b", "", 99, src, src));
        assert!(!r.matches("a", "b", "", 201, src, src));
    }

    #[test]
    fn test_never_pattern() {
        assert!(!NumberPattern::never().matches("555"));
        assert!(!NumberPattern::never().matches(""));
    }

    #[test]
    fn test_snapshot_survives_replacement() {
        let repo = PolicyRepository::new();
        repo.set_rules(vec![rule(1, 5, ".*", ".*")], "v1.csv");
        let old = repo.snapshot().unwrap();
        repo.set_rules(vec![rule(2, 5, ".*", ".*")], "v2.csv");
        assert_eq!(old.version, "v1.csv");
        assert_eq!(old.rules[0].id, 1);
        assert_eq!(repo.version(), "v2.csv");
    }
}
