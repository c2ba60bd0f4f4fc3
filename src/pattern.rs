//! Pattern engine: compiles rule configuration into matchers and extracts
//! offenses (address, timestamp, instant-ban flag) from log lines.

use chrono::{DateTime, Datelike, Local, NaiveDateTime};
use ipnet::IpNet;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{Config, LogShape, PatternConfig, RuleConfig};
use crate::dns::HostResolver;
use crate::error::WardenError;
use crate::validation::{classify_address, validate_ip_or_cidr};

/// Placeholder replaced by the value alternation in templated patterns
const PLACEHOLDER: &str = "{}";

/// Format specifiers that carry a year
const YEAR_SPECIFIERS: &[&str] = &["%Y", "%y", "%G", "%g", "%C", "%s", "%F", "%D", "%c", "%+"];

/// Capture group indexes for one compiled pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRoles {
    pub address: usize,
    pub timestamp: usize,
    pub status: Option<usize>,
}

impl CaptureRoles {
    /// Resolve roles from named groups, falling back to the shape's positions.
    fn resolve(regex: &Regex, shape: LogShape) -> Self {
        let named = |name: &str| regex.capture_names().position(|n| n == Some(name));
        let groups = regex.captures_len() - 1;

        let (address, timestamp, status) = match shape {
            LogShape::Auth => (2, 1, None),
            LogShape::Web => (1, 2, Some(4)),
        };

        Self {
            address: named("address").unwrap_or(address),
            timestamp: named("time").unwrap_or(timestamp),
            status: named("status").or(status.filter(|&idx| idx <= groups)),
        }
    }
}

/// A pattern resolved once at startup
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub regex: Regex,
    pub roles: CaptureRoles,
    pub instant_ban: bool,
}

impl CompiledPattern {
    /// Build a pattern from its configuration variant.
    pub fn compile(rule: &str, config: &PatternConfig, shape: LogShape) -> Result<Self, WardenError> {
        let err = |message: String| WardenError::Pattern {
            rule: rule.to_string(),
            message,
        };

        let (expression, instant_ban) = match config {
            PatternConfig::Literal { regex } => (regex.clone(), false),
            PatternConfig::Template { regex, values } => {
                if !regex.contains(PLACEHOLDER) {
                    return Err(err(format!("template has no '{}' placeholder: {}", PLACEHOLDER, regex)));
                }
                (substitute(regex, values).map_err(err)?, false)
            }
            PatternConfig::InstantBan { regex, values } => {
                if regex.contains(PLACEHOLDER) || !values.is_empty() {
                    (substitute(regex, values).map_err(err)?, true)
                } else {
                    (regex.clone(), true)
                }
            }
        };

        let regex = Regex::new(&expression).map_err(|e| err(e.to_string()))?;
        let roles = CaptureRoles::resolve(&regex, shape);
        let groups = regex.captures_len() - 1;

        if roles.address > groups || roles.timestamp > groups {
            return Err(err(format!(
                "expression has {} groups but needs address group {} and time group {}: {}",
                groups, roles.address, roles.timestamp, expression
            )));
        }

        Ok(Self {
            regex,
            roles,
            instant_ban,
        })
    }
}

/// Replace the placeholder with an escaped alternation of `values`.
fn substitute(template: &str, values: &[String]) -> Result<String, String> {
    if values.is_empty() {
        return Err(format!("template needs at least one value: {}", template));
    }
    if !template.contains(PLACEHOLDER) {
        return Err(format!("template has no '{}' placeholder: {}", PLACEHOLDER, template));
    }
    let alternation = values
        .iter()
        .map(|v| regex::escape(v))
        .collect::<Vec<_>>()
        .join("|");
    Ok(template.replace(PLACEHOLDER, &alternation))
}

/// Addresses and networks that are never banned
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    nets: Vec<IpNet>,
}

impl IgnoreList {
    pub fn parse<'a, I>(entries: I) -> Result<Self, WardenError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let nets = entries
            .into_iter()
            .map(|e| validate_ip_or_cidr(e).map_err(|err| WardenError::Config(err.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { nets })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&addr))
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

/// A rule compiled from configuration. Immutable after startup.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub log_files: Vec<PathBuf>,
    pub patterns: Vec<CompiledPattern>,
    pub time_format: String,
    pub window_seconds: u64,
    pub threshold: u32,
    pub status_allow_list: HashSet<u16>,
    pub ignored: IgnoreList,
}

/// Capture text of the first usable match in a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMatch<'l> {
    pub address: &'l str,
    pub timestamp: &'l str,
    pub instant_ban: bool,
}

impl Rule {
    pub fn compile(name: &str, config: &RuleConfig, global_ignored: &[String]) -> Result<Self, WardenError> {
        let patterns = config
            .patterns
            .iter()
            .map(|p| CompiledPattern::compile(name, p, config.shape))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: name.to_string(),
            log_files: config.log_files.clone(),
            patterns,
            time_format: config.time_format.clone(),
            window_seconds: config.window_seconds,
            threshold: config.failure_threshold,
            status_allow_list: config.http_status_allow_list.iter().copied().collect(),
            ignored: IgnoreList::parse(global_ignored.iter().chain(&config.ignored_addresses))?,
        })
    }

    /// Try each pattern in order and return the first usable match.
    ///
    /// A match whose status capture is outside the allow-list is discarded
    /// and the next pattern is tried. An empty allow-list filters nothing.
    pub fn find_match<'l>(&self, line: &'l str) -> Option<RawMatch<'l>> {
        for pattern in &self.patterns {
            let Some(caps) = pattern.regex.captures(line) else {
                continue;
            };

            if let Some(status) = pattern.roles.status.and_then(|idx| caps.get(idx)) {
                if !self.status_allow_list.is_empty() {
                    let allowed = status
                        .as_str()
                        .parse::<u16>()
                        .map(|code| self.status_allow_list.contains(&code))
                        .unwrap_or(false);
                    if !allowed {
                        continue;
                    }
                }
            }

            let (Some(address), Some(timestamp)) =
                (caps.get(pattern.roles.address), caps.get(pattern.roles.timestamp))
            else {
                continue;
            };

            return Some(RawMatch {
                address: address.as_str(),
                timestamp: timestamp.as_str(),
                instant_ban: pattern.instant_ban,
            });
        }
        None
    }
}

/// Parse a captured timestamp, pinning it to the current year.
///
/// Formats without a year are parsed in `now`'s year. A parsed year that
/// differs from `now`'s is overwritten, since logs are read near real time.
pub fn parse_timestamp(text: &str, format: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let parsed = if format.contains("%z") || format.contains("%:z") {
        DateTime::parse_from_str(text, format)
            .ok()?
            .with_timezone(&Local)
            .naive_local()
    } else if YEAR_SPECIFIERS.iter().any(|s| format.contains(s)) {
        NaiveDateTime::parse_from_str(text, format).ok()?
    } else {
        NaiveDateTime::parse_from_str(&format!("{} {}", now.year(), text), &format!("%Y {}", format))
            .ok()?
    };

    if parsed.year() != now.year() {
        // Feb 29 has no counterpart in a non-leap year; keep it as parsed
        Some(parsed.with_year(now.year()).unwrap_or(parsed))
    } else {
        Some(parsed)
    }
}

/// An offense extracted from a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offense {
    pub address: IpAddr,
    pub at: NaiveDateTime,
    pub instant_ban: bool,
}

/// All compiled rules plus the resolver used for hostname captures
pub struct PatternEngine {
    rules: HashMap<String, Rule>,
    resolver: Arc<dyn HostResolver>,
}

impl PatternEngine {
    pub fn new(rules: Vec<Rule>, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            rules: rules.into_iter().map(|r| (r.name.clone(), r)).collect(),
            resolver,
        }
    }

    /// Compile every configured rule. Any invalid pattern is fatal.
    pub fn from_config(config: &Config, resolver: Arc<dyn HostResolver>) -> Result<Self, WardenError> {
        let rules = config
            .rules
            .iter()
            .map(|(name, rule)| Rule::compile(name, rule, &config.ignored_addresses))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules, resolver))
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    /// Extract an offense from a line of the given rule's log.
    pub fn extract(&self, rule: &str, line: &str) -> Option<Offense> {
        self.extract_at(rule, line, Local::now().naive_local())
    }

    /// Like [`extract`](Self::extract) with an explicit "now" for year pinning.
    pub fn extract_at(&self, rule: &str, line: &str, now: NaiveDateTime) -> Option<Offense> {
        let Some(compiled) = self.rules.get(rule) else {
            warn!("Line offered to unknown rule '{}'", rule);
            return None;
        };

        let raw = compiled.find_match(line)?;

        let Some(at) = parse_timestamp(raw.timestamp, &compiled.time_format, now) else {
            debug!(
                "Rule {}: timestamp '{}' does not match format '{}'",
                rule, raw.timestamp, compiled.time_format
            );
            return None;
        };

        let address = match classify_address(raw.address) {
            Some(addr) => addr,
            None => match self.resolver.resolve(raw.address) {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Rule {}: {}, dropping event", rule, e);
                    return None;
                }
            },
        };

        Some(Offense {
            address,
            at,
            instant_ban: raw.instant_ban,
        })
    }
}
