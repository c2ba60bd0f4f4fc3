//! Daemon lifecycle: tail workers, snapshot persistence, and the sync loop.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::banlog::BanLog;
use crate::config::{Config, StorageConfig};
use crate::dns::{HostResolver, SystemResolver};
use crate::enforcer::{Enforcer, Firewall, IptablesFirewall, PersistGuard};
use crate::engine::BanEngine;
use crate::pattern::PatternEngine;
use crate::signal::ShutdownToken;
use crate::store::{self, Backends, BanChannel};
use crate::sync::SyncEngine;
use crate::tail::{TailOptions, Tailer};

/// Everything `run` needs, wired from configuration.
pub struct Daemon {
    config: Config,
    engine: Arc<BanEngine>,
    enforcer: Arc<Enforcer>,
    channel: Option<Arc<dyn BanChannel>>,
}

impl Daemon {
    /// Wire the production collaborators: iptables, the configured store,
    /// and the system resolver.
    pub fn from_config(config: Config) -> Result<Self> {
        let backends = store::open(&config)?;
        Self::build(
            config,
            Box::new(IptablesFirewall::new()),
            backends,
            Arc::new(SystemResolver),
        )
    }

    pub fn build(
        config: Config,
        firewall: Box<dyn Firewall>,
        backends: Backends,
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Self> {
        let patterns = PatternEngine::from_config(&config, resolver)?;
        let enforcer = Arc::new(Enforcer::new(
            firewall,
            config.deny_action,
            config.snapshot_dir.clone(),
        ));
        let engine = BanEngine::new(patterns, backends.store, Arc::clone(&enforcer))
            .with_channel(backends.channel.clone())
            .with_ban_log(BanLog::new(&config.logging));

        Ok(Self {
            config,
            engine: Arc::new(engine),
            enforcer,
            channel: backends.channel,
        })
    }

    pub fn engine(&self) -> &Arc<BanEngine> {
        &self.engine
    }

    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.enforcer
    }

    fn sync_engine(&self) -> Option<Arc<SyncEngine>> {
        match self.config.storage {
            StorageConfig::Networked(ref networked) if networked.sync.enabled => {
                Some(Arc::new(SyncEngine::new(
                    Arc::clone(&self.engine),
                    self.channel.clone(),
                    &networked.sync,
                )))
            }
            _ => None,
        }
    }

    /// One tailing worker per (rule, log file) whose file exists now
    fn spawn_tailers(&self, token: &ShutdownToken) -> JoinSet<()> {
        let options = TailOptions::from_config(&self.config.tail, self.config.run_once);
        let mut workers = JoinSet::new();

        for rule in self.engine.patterns().rules() {
            for path in &rule.log_files {
                let tailer = match Tailer::open(path, options, token.clone()) {
                    Ok(tailer) => tailer,
                    Err(e) => {
                        warn!("Rule {}: skipping {}: {:#}", rule.name, path.display(), e);
                        continue;
                    }
                };
                info!("Rule {}: tailing {}", rule.name, path.display());

                let engine = Arc::clone(&self.engine);
                let rule_name = rule.name.clone();
                workers.spawn_blocking(move || tail_worker(engine, rule_name, tailer));
            }
        }
        workers
    }

    /// Run until shutdown (or, in run-once mode, until every log is read).
    /// Pending snapshot state is flushed however this returns.
    pub async fn run(self, token: ShutdownToken) -> Result<()> {
        let _persist = PersistGuard::new(Arc::clone(&self.enforcer));

        if self.config.reload_firewall_rules_on_start {
            match self.enforcer.restore() {
                Ok(0) => debug!("No firewall snapshots to restore"),
                Ok(n) => info!("Restored {} firewall snapshot(s)", n),
                Err(e) => warn!("Failed to restore firewall snapshots: {:#}", e),
            }
        }

        let mut workers = self.spawn_tailers(&token);
        if workers.is_empty() {
            warn!("No log source could be opened");
        }

        let persistence = tokio::spawn(Arc::clone(&self.enforcer).run_persistence(
            Duration::from_secs(self.config.persist_interval_seconds),
            token.clone(),
        ));

        let sync = self.sync_engine();

        if self.config.run_once {
            while workers.join_next().await.is_some() {}
            if let Some(sync) = sync {
                let result = tokio::task::spawn_blocking(move || {
                    sync.drain_notices()?;
                    sync.reconcile()
                })
                .await;
                match result {
                    Ok(Ok(applied)) => debug!("Final sync pass applied {} ban(s)", applied),
                    Ok(Err(e)) => warn!("Final sync pass failed: {:#}", e),
                    Err(e) => warn!("Final sync pass aborted: {}", e),
                }
            }
        } else if let Some(sync) = sync {
            sync.run(token.clone()).await;
        } else if !workers.is_empty() {
            tokio::select! {
                _ = workers.join_next() => warn!("A tail worker stopped, shutting down"),
                _ = token.cancelled() => {}
            }
        } else {
            token.cancelled().await;
        }

        token.cancel();
        while workers.join_next().await.is_some() {}
        if let Err(e) = persistence.await {
            warn!("Persistence task failed: {}", e);
        }

        info!("Stopped");
        Ok(())
    }
}

fn tail_worker(engine: Arc<BanEngine>, rule: String, tailer: Tailer) {
    let path: PathBuf = tailer.path().to_path_buf();
    let mut lines = 0u64;
    for line in tailer {
        lines += 1;
        engine.process_line(&rule, &line);
    }
    debug!("Rule {}: stopped tailing {} after {} line(s)", rule, path.display(), lines);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddedConfig, LogShape, NetworkedConfig, PatternConfig, RuleConfig, SyncConfig};
    use crate::dns::MockHostResolver;
    use crate::enforcer::MockFirewall;
    use crate::store::{BanRecord, BanStore, InsertOutcome, SqliteStore};
    use std::collections::BTreeMap;
    use std::fs;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const AUTH_LOG: &str = "\
Jun  1 08:00:00 host sshd[1]: Failed password for root from 203.0.113.7 port 22 ssh2
Jun  1 08:00:10 host sshd[1]: Failed password for root from 203.0.113.7 port 22 ssh2
Jun  1 08:00:20 host sshd[1]: Failed password for root from 203.0.113.7 port 22 ssh2
Jun  1 08:00:30 host sshd[1]: Failed password for root from 203.0.113.7 port 22 ssh2
Jun  1 08:00:40 host sshd[1]: Failed password for root from 203.0.113.7 port 22 ssh2
Jun  1 08:00:05 host sshd[2]: Failed password for root from 127.0.0.1 port 22 ssh2
Jun  1 08:00:06 host sshd[2]: Failed password for root from 127.0.0.1 port 22 ssh2
Jun  1 08:00:07 host sshd[2]: Failed password for root from 127.0.0.1 port 22 ssh2
Jun  1 08:00:08 host sshd[2]: Failed password for root from 127.0.0.1 port 22 ssh2
Jun  1 08:01:00 host sshd[3]: Invalid user oracle from 198.51.100.23
";

    fn config(dir: &TempDir, log: PathBuf) -> Config {
        let mut rules = BTreeMap::new();
        rules.insert(
            "ssh".to_string(),
            RuleConfig {
                log_files: vec![log, dir.path().join("missing.log")],
                shape: LogShape::Auth,
                patterns: vec![
                    PatternConfig::Literal {
                        regex: crate::engine::tests::SSH_FAILED.to_string(),
                    },
                    PatternConfig::InstantBan {
                        regex: r"^(\w{3}\s+\d{1,2} \d{2}:\d{2}:\d{2}) \S+ sshd\[\d+\]: Invalid user (?:{}) from (\S+)".to_string(),
                        values: vec!["oracle".to_string()],
                    },
                ],
                time_format: "%b %e %H:%M:%S".to_string(),
                window_seconds: 60,
                failure_threshold: 3,
                http_status_allow_list: vec![],
                ignored_addresses: vec![],
            },
        );
        Config {
            run_once: true,
            reload_firewall_rules_on_start: false,
            ignored_addresses: vec!["127.0.0.1".to_string()],
            snapshot_dir: dir.path().join("snapshots"),
            storage: StorageConfig::Embedded(EmbeddedConfig {
                path: dir.path().join("bans.db"),
            }),
            rules,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_once_bans_and_flushes_snapshots() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("auth.log");
        fs::write(&log, AUTH_LOG).unwrap();

        let denies = Arc::new(AtomicUsize::new(0));
        let snapshots = Arc::new(AtomicUsize::new(0));
        let mut firewall = MockFirewall::new();
        {
            let denies = Arc::clone(&denies);
            firewall.expect_deny().returning(move |_, _, _| {
                denies.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        {
            let snapshots = Arc::clone(&snapshots);
            firewall.expect_snapshot().returning(move |_, _| {
                snapshots.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let config = config(&dir, log);
        let backends = Backends {
            store: Arc::new(SqliteStore::open(dir.path().join("bans.db"), "local").unwrap()),
            channel: None,
        };
        let daemon = Daemon::build(
            config,
            Box::new(firewall),
            backends,
            Arc::new(MockHostResolver::new()),
        )
        .unwrap();
        let engine = Arc::clone(daemon.engine());

        tokio::time::timeout(Duration::from_secs(10), daemon.run(ShutdownToken::new()))
            .await
            .unwrap()
            .unwrap();

        // One threshold ban, one instant ban, the ignored address untouched
        assert_eq!(denies.load(Ordering::SeqCst), 2);
        assert_eq!(snapshots.load(Ordering::SeqCst), 2);

        let store = engine.store();
        let banned: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(
            store.select(banned).unwrap().unwrap().reason,
            "3 failed attempts via ssh"
        );
        let instant: IpAddr = "198.51.100.23".parse().unwrap();
        assert_eq!(
            store.select(instant).unwrap().unwrap().reason,
            "instant ban via ssh"
        );
        assert!(store.select("127.0.0.1".parse().unwrap()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_follow_mode_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("auth.log");
        fs::write(&log, "").unwrap();

        let mut cfg = config(&dir, log);
        cfg.run_once = false;
        cfg.tail.poll_interval_ms = 10;

        let backends = Backends {
            store: Arc::new(SqliteStore::in_memory("local").unwrap()),
            channel: None,
        };
        let daemon = Daemon::build(
            cfg,
            Box::new(MockFirewall::new()),
            backends,
            Arc::new(MockHostResolver::new()),
        )
        .unwrap();

        let token = ShutdownToken::new();
        let task = tokio::spawn(daemon.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_restore_on_start() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("auth.log");
        fs::write(&log, "").unwrap();
        fs::create_dir_all(dir.path().join("snapshots")).unwrap();
        fs::write(dir.path().join("snapshots").join("banned.v6"), "*filter\nCOMMIT\n").unwrap();

        let mut cfg = config(&dir, log);
        cfg.reload_firewall_rules_on_start = true;

        let mut firewall = MockFirewall::new();
        firewall.expect_restore().times(1).returning(|_, _| Ok(()));

        let backends = Backends {
            store: Arc::new(SqliteStore::in_memory("local").unwrap()),
            channel: None,
        };
        let daemon = Daemon::build(
            cfg,
            Box::new(firewall),
            backends,
            Arc::new(MockHostResolver::new()),
        )
        .unwrap();
        daemon.run(ShutdownToken::new()).await.unwrap();
    }

    /// Store whose reconciliation scan panics
    struct PanickingScan(SqliteStore);

    impl BanStore for PanickingScan {
        fn insert(&self, address: IpAddr, reason: &str, country: Option<&str>) -> Result<InsertOutcome> {
            self.0.insert(address, reason, country)
        }

        fn select(&self, address: IpAddr) -> Result<Option<BanRecord>> {
            self.0.select(address)
        }

        fn scan(&self) -> Result<Vec<BanRecord>> {
            panic!("scan failed")
        }

        fn mark_applied(&self, address: IpAddr) -> Result<()> {
            self.0.mark_applied(address)
        }

        fn node_name(&self) -> &str {
            self.0.node_name()
        }
    }

    #[tokio::test]
    async fn test_run_once_shuts_down_when_final_sync_aborts() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("auth.log");
        fs::write(&log, "").unwrap();

        let mut cfg = config(&dir, log);
        cfg.storage = StorageConfig::Networked(NetworkedConfig {
            sync: SyncConfig {
                enabled: true,
                node_name: "a".to_string(),
                ..Default::default()
            },
            ..Default::default()
        });

        let backends = Backends {
            store: Arc::new(PanickingScan(SqliteStore::in_memory("a").unwrap())),
            channel: None,
        };
        let daemon = Daemon::build(
            cfg,
            Box::new(MockFirewall::new()),
            backends,
            Arc::new(MockHostResolver::new()),
        )
        .unwrap();

        // Returning at all means the persistence task saw the shutdown
        let token = ShutdownToken::new();
        tokio::time::timeout(Duration::from_secs(10), daemon.run(token.clone()))
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }
}
