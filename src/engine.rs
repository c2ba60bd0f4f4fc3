//! Ban decisions: offense tracking and ban finalization under one lock.
//!
//! Both the local path (log lines) and the foreign path (bans learned from
//! other nodes) check the store and enforce while holding the same mutex, so
//! an address is enforced at most once per node whichever path sees it first.

use anyhow::Result;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::banlog::BanLog;
use crate::enforcer::Enforcer;
use crate::pattern::{Offense, PatternEngine};
use crate::store::{BanChannel, BanStore, InsertOutcome};
use crate::tracker::{Limits, OffenseTracker, Transition};

/// Optional geolocation seam; the country ends up in the ban reason
pub trait CountryLookup: Send + Sync {
    fn country(&self, address: IpAddr) -> Option<String>;
}

/// What happened to one offense
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Address is on an ignore list
    Ignored,
    /// Already banned on this node
    AlreadyBanned,
    /// Counted (or not) without reaching the threshold
    Tracked(Transition),
    /// A ban was finalized
    Banned,
    /// Unknown rule or the store could not be consulted
    Dropped,
}

pub struct BanEngine {
    tracker: Mutex<OffenseTracker>,
    patterns: PatternEngine,
    store: Arc<dyn BanStore>,
    channel: Option<Arc<dyn BanChannel>>,
    enforcer: Arc<Enforcer>,
    country: Option<Arc<dyn CountryLookup>>,
    ban_log: BanLog,
}

impl BanEngine {
    pub fn new(patterns: PatternEngine, store: Arc<dyn BanStore>, enforcer: Arc<Enforcer>) -> Self {
        Self {
            tracker: Mutex::new(OffenseTracker::new()),
            patterns,
            store,
            channel: None,
            enforcer,
            country: None,
            ban_log: BanLog::default(),
        }
    }

    pub fn with_channel(mut self, channel: Option<Arc<dyn BanChannel>>) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_country_lookup(mut self, lookup: Arc<dyn CountryLookup>) -> Self {
        self.country = Some(lookup);
        self
    }

    pub fn with_ban_log(mut self, ban_log: BanLog) -> Self {
        self.ban_log = ban_log;
        self
    }

    pub fn patterns(&self) -> &PatternEngine {
        &self.patterns
    }

    pub fn store(&self) -> &Arc<dyn BanStore> {
        &self.store
    }

    pub fn node_name(&self) -> &str {
        self.store.node_name()
    }

    // A panic while holding the lock leaves the tracker consistent (every
    // mutation is a single map operation), so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, OffenseTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one log line of `rule` through extraction and tracking.
    /// Returns `None` when the line carries no offense.
    pub fn process_line(&self, rule: &str, line: &str) -> Option<Outcome> {
        let offense = self.patterns.extract(rule, line)?;
        Some(self.observe(rule, offense))
    }

    /// Apply one offense: ignore check, presence check, then either the
    /// instant-ban path or the sliding-window counter.
    pub fn observe(&self, rule_name: &str, offense: Offense) -> Outcome {
        let Some(rule) = self.patterns.rule(rule_name) else {
            warn!("Offense for unknown rule '{}'", rule_name);
            return Outcome::Dropped;
        };
        let address = offense.address;

        let mut tracker = self.lock();

        if rule.ignored.contains(address) {
            debug!("Rule {}: {} is ignored", rule_name, address);
            return Outcome::Ignored;
        }

        match self.store.select(address) {
            Ok(Some(_)) => {
                debug!("Rule {}: {} is already banned", rule_name, address);
                return Outcome::AlreadyBanned;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Ban lookup for {} failed, dropping event: {:#}", address, e);
                return Outcome::Dropped;
            }
        }

        if offense.instant_ban {
            tracker.forget(rule_name, address);
            self.finalize(address, format!("instant ban via {}", rule_name));
            return Outcome::Banned;
        }

        let limits = Limits {
            window_seconds: rule.window_seconds,
            threshold: rule.threshold,
        };
        match tracker.record(rule_name, address, offense.at, limits) {
            Transition::Ban { attempts } => {
                self.finalize(address, format!("{} failed attempts via {}", attempts, rule_name));
                Outcome::Banned
            }
            other => {
                debug!("Rule {}: {} {:?}", rule_name, address, other);
                Outcome::Tracked(other)
            }
        }
    }

    /// Enforce, record, announce, and log a local ban. Caller holds the lock.
    fn finalize(&self, address: IpAddr, reason: String) {
        let country = self.country.as_ref().and_then(|c| c.country(address));
        let reason = match &country {
            Some(country) => format!("{} ({})", reason, country),
            None => reason,
        };

        if let Err(e) = self.enforcer.enforce(address) {
            warn!("Failed to enforce ban on {}: {:#}", address, e);
        }

        match self.store.insert(address, &reason, country.as_deref()) {
            Ok(InsertOutcome::Inserted) => {
                if let Some(channel) = &self.channel {
                    if let Err(e) = channel.publish(address) {
                        warn!("Failed to announce ban of {}: {:#}", address, e);
                    }
                }
            }
            Ok(InsertOutcome::Duplicate) => {
                debug!("{} was already recorded by another path", address);
            }
            Err(e) => warn!("Failed to record ban of {}: {:#}", address, e),
        }

        self.ban_log.record(address, &reason, self.store.node_name());
    }

    /// Apply a ban decided by `origin`. Returns `false` if this node has
    /// already applied it.
    pub fn apply_foreign(&self, address: IpAddr, origin: &str) -> Result<bool> {
        let _tracker = self.lock();

        if self.store.select(address)?.is_some() {
            return Ok(false);
        }

        if let Err(e) = self.enforcer.enforce(address) {
            warn!("Failed to enforce ban on {} from {}: {:#}", address, origin, e);
        }
        self.store.mark_applied(address)?;
        self.ban_log
            .record(address, &format!("propagated from {}", origin), origin);
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{DenyAction, LogShape, PatternConfig, RuleConfig};
    use crate::dns::MockHostResolver;
    use crate::enforcer::{IpVersion, MockFirewall};
    use crate::pattern::Rule;
    use crate::store::SqliteStore;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const SSH_FAILED: &str = r"^(\w{3}\s+\d{1,2} \d{2}:\d{2}:\d{2}) \S+ sshd\[\d+\]: Failed password for \S+ from (\S+) port";

    pub(crate) fn ssh_rule(threshold: u32, ignored: Vec<String>) -> Rule {
        let cfg = RuleConfig {
            log_files: vec![PathBuf::from("/var/log/auth.log")],
            shape: LogShape::Auth,
            patterns: vec![PatternConfig::Literal {
                regex: SSH_FAILED.to_string(),
            }],
            time_format: "%b %e %H:%M:%S".to_string(),
            window_seconds: 60,
            failure_threshold: threshold,
            http_status_allow_list: vec![],
            ignored_addresses: ignored,
        };
        Rule::compile("ssh", &cfg, &[]).unwrap()
    }

    /// Firewall mock counting deny calls
    pub(crate) fn counting_enforcer(count: Arc<AtomicUsize>) -> Arc<Enforcer> {
        let mut firewall = MockFirewall::new();
        firewall.expect_deny().returning(move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        Arc::new(Enforcer::new(
            Box::new(firewall),
            DenyAction::Drop,
            std::env::temp_dir(),
        ))
    }

    fn engine(rule: Rule, denies: Arc<AtomicUsize>) -> BanEngine {
        let patterns = PatternEngine::new(vec![rule], Arc::new(MockHostResolver::new()));
        let store: Arc<dyn BanStore> = Arc::new(SqliteStore::in_memory("local").unwrap());
        BanEngine::new(patterns, store, counting_enforcer(denies))
    }

    fn t(secs: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 6, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
            + Duration::seconds(secs)
    }

    fn offense(addr: &str, secs: i64, instant_ban: bool) -> Offense {
        Offense {
            address: addr.parse().unwrap(),
            at: t(secs),
            instant_ban,
        }
    }

    #[test]
    fn test_threshold_bans_exactly_once() {
        let denies = Arc::new(AtomicUsize::new(0));
        let engine = engine(ssh_rule(3, vec![]), Arc::clone(&denies));

        let outcomes: Vec<Outcome> = [0, 10, 20, 30]
            .iter()
            .map(|&s| engine.observe("ssh", offense("203.0.113.7", s, false)))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                Outcome::Tracked(Transition::Baseline),
                Outcome::Tracked(Transition::Counted(1)),
                Outcome::Tracked(Transition::Counted(2)),
                Outcome::Banned,
            ]
        );
        assert_eq!(denies.load(Ordering::SeqCst), 1);

        let record = engine
            .store()
            .select("203.0.113.7".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(record.reason, "3 failed attempts via ssh");

        // Further events dedup against the store
        assert_eq!(
            engine.observe("ssh", offense("203.0.113.7", 40, false)),
            Outcome::AlreadyBanned
        );
        assert_eq!(denies.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_window_expiry_prevents_ban() {
        let denies = Arc::new(AtomicUsize::new(0));
        let engine = engine(ssh_rule(2, vec![]), Arc::clone(&denies));
        engine.observe("ssh", offense("203.0.113.7", 0, false));
        assert_eq!(
            engine.observe("ssh", offense("203.0.113.7", 100, false)),
            Outcome::Tracked(Transition::Expired)
        );
        assert_eq!(
            engine.observe("ssh", offense("203.0.113.7", 110, false)),
            Outcome::Tracked(Transition::Counted(1))
        );
        assert_eq!(denies.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_instant_ban_bypasses_counter() {
        let denies = Arc::new(AtomicUsize::new(0));
        let engine = engine(ssh_rule(5, vec![]), Arc::clone(&denies));
        assert_eq!(
            engine.observe("ssh", offense("2001:db8::66", 0, true)),
            Outcome::Banned
        );
        assert_eq!(denies.load(Ordering::SeqCst), 1);
        let record = engine
            .store()
            .select("2001:db8::66".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(record.reason, "instant ban via ssh");
    }

    #[test]
    fn test_ignore_list_wins_over_instant_ban() {
        let denies = Arc::new(AtomicUsize::new(0));
        let engine = engine(
            ssh_rule(1, vec!["10.0.0.0/8".to_string()]),
            Arc::clone(&denies),
        );
        assert_eq!(
            engine.observe("ssh", offense("10.20.30.40", 0, true)),
            Outcome::Ignored
        );
        for s in [1, 2, 3] {
            assert_eq!(
                engine.observe("ssh", offense("10.20.30.40", s, false)),
                Outcome::Ignored
            );
        }
        assert_eq!(denies.load(Ordering::SeqCst), 0);
        assert!(engine
            .store()
            .select("10.20.30.40".parse().unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_existing_ban_short_circuits() {
        let denies = Arc::new(AtomicUsize::new(0));
        let engine = engine(ssh_rule(1, vec![]), Arc::clone(&denies));
        engine
            .store()
            .insert("198.51.100.3".parse().unwrap(), "earlier", None)
            .unwrap();
        assert_eq!(
            engine.observe("ssh", offense("198.51.100.3", 0, true)),
            Outcome::AlreadyBanned
        );
        assert_eq!(denies.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_enforcement_failure_still_records() {
        let mut firewall = MockFirewall::new();
        firewall
            .expect_deny()
            .withf(|_, version, _| *version == IpVersion::V4)
            .returning(|_, _, _| Err(anyhow::anyhow!("iptables: not found")));
        let enforcer = Arc::new(Enforcer::new(
            Box::new(firewall),
            DenyAction::Drop,
            std::env::temp_dir(),
        ));
        let patterns = PatternEngine::new(vec![ssh_rule(1, vec![])], Arc::new(MockHostResolver::new()));
        let store: Arc<dyn BanStore> = Arc::new(SqliteStore::in_memory("local").unwrap());
        let engine = BanEngine::new(patterns, store, enforcer);

        assert_eq!(engine.observe("ssh", offense("192.0.2.8", 0, true)), Outcome::Banned);
        assert!(engine
            .store()
            .select("192.0.2.8".parse().unwrap())
            .unwrap()
            .is_some());
    }

    struct FixedCountry;

    impl CountryLookup for FixedCountry {
        fn country(&self, _address: IpAddr) -> Option<String> {
            Some("NL".to_string())
        }
    }

    #[test]
    fn test_country_lookup_enriches_record() {
        let denies = Arc::new(AtomicUsize::new(0));
        let engine = engine(ssh_rule(1, vec![]), denies).with_country_lookup(Arc::new(FixedCountry));
        engine.observe("ssh", offense("192.0.2.9", 0, true));
        let record = engine
            .store()
            .select("192.0.2.9".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(record.country.as_deref(), Some("NL"));
        assert_eq!(record.reason, "instant ban via ssh (NL)");
    }

    #[test]
    fn test_process_line() {
        let denies = Arc::new(AtomicUsize::new(0));
        let engine = engine(ssh_rule(3, vec![]), denies);
        let line = "Jun  1 08:00:00 host sshd[4]: Failed password for root from 203.0.113.7 port 22 ssh2";
        assert_eq!(
            engine.process_line("ssh", line),
            Some(Outcome::Tracked(Transition::Baseline))
        );
        assert_eq!(engine.process_line("ssh", "unrelated noise"), None);
    }

    #[test]
    fn test_unknown_rule_is_dropped() {
        let denies = Arc::new(AtomicUsize::new(0));
        let engine = engine(ssh_rule(3, vec![]), denies);
        assert_eq!(
            engine.observe("ftp", offense("203.0.113.7", 0, true)),
            Outcome::Dropped
        );
    }
}
