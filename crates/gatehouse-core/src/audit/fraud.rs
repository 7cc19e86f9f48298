//! Sliding-window fraud detector
//!
//! Windows are evicted lazily on each observation; there is no timer. Each
//! trigger creates or updates one [`SuspiciousPattern`] keyed by kind and
//! subject, and a pattern's severity only ever rises.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::event::OperationKind;
use crate::config::FraudSettings;

/// Maps above this size are swept of empty windows
const SWEEP_THRESHOLD: usize = 1024;

lazy_static! {
    static ref SENSITIVE: Vec<(&'static str, Regex, Severity)> = vec![
        ("null byte in path", Regex::new(r"\x00").unwrap(), Severity::Critical),
        ("system credential file", Regex::new(r"(^|/)etc/(passwd|shadow)$").unwrap(), Severity::High),
        ("ssh or cloud credentials", Regex::new(r"(^|/)\.(ssh|aws|gnupg)(/|$)").unwrap(), Severity::High),
        ("private key material", Regex::new(r"(?i)\.(pem|key|p12|pfx)$").unwrap(), Severity::High),
        ("environment secrets", Regex::new(r"(^|/)\.env(\.[^/]*)?$").unwrap(), Severity::Medium),
        ("backup artifact", Regex::new(r"(?i)\.(bak|backup|old|orig)$").unwrap(), Severity::Low),
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    RapidAccess,
    UnauthorizedPath,
    Anomaly,
    PrivilegeEscalation,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RapidAccess => "rapid_access",
            Self::UnauthorizedPath => "unauthorized_path",
            Self::Anomaly => "anomaly",
            Self::PrivilegeEscalation => "privilege_escalation",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

/// Aggregated anomaly, updated in place on repeat detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousPattern {
    pub kind: PatternKind,
    /// Path, or `caller:<name>` / `sensitive:<path>` / `oversize:<path>` for anomalies
    pub subject: String,
    pub severity: Severity,
    pub description: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: u64,
}

/// One pattern touched by an observation
#[derive(Debug, Clone)]
pub struct Detection {
    /// State of the pattern after the update
    pub pattern: SuspiciousPattern,
    /// Severity of this observation alone
    pub observed: Severity,
    /// Pattern was created or moved into a higher tier
    pub escalated: bool,
}

/// Result of feeding one operation to the detector
#[derive(Debug, Clone, Default)]
pub struct Assessment {
    pub detections: Vec<Detection>,
}

impl Assessment {
    pub fn is_clean(&self) -> bool {
        self.detections.is_empty()
    }

    /// First detection severe enough to stop the operation
    pub fn blocking(&self) -> Option<&Detection> {
        self.detections
            .iter()
            .find(|d| d.observed == Severity::Critical)
    }

    pub fn escalations(&self) -> impl Iterator<Item = &SuspiciousPattern> {
        self.detections
            .iter()
            .filter(|d| d.escalated)
            .map(|d| &d.pattern)
    }

    /// Human-readable notes for the non-blocking detections
    pub fn warnings(&self) -> Vec<String> {
        self.detections
            .iter()
            .filter(|d| d.observed < Severity::Critical)
            .map(|d| {
                format!(
                    "{} ({}): {}",
                    d.pattern.kind, d.observed, d.pattern.description
                )
            })
            .collect()
    }
}

/// What the gate knows about an operation when it asks the detector
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub path: &'a str,
    pub operation: OperationKind,
    pub caller: Option<&'a str>,
    pub administrative: bool,
    pub bytes: Option<u64>,
    pub max_bytes: Option<u64>,
}

impl<'a> Observation<'a> {
    pub fn new(path: &'a str, operation: OperationKind) -> Self {
        Self {
            path,
            operation,
            caller: None,
            administrative: false,
            bytes: None,
            max_bytes: None,
        }
    }
}

#[derive(Debug)]
struct Tracked {
    pattern: SuspiciousPattern,
    last_hit: Instant,
}

#[derive(Debug)]
struct CallerHistory {
    first_seen: Instant,
    total: u64,
    recent: VecDeque<Instant>,
}

/// Windowed anomaly detector over gated operations
#[derive(Debug)]
pub struct FraudDetector {
    settings: FraudSettings,
    window: Duration,
    accesses: HashMap<String, VecDeque<Instant>>,
    rejections: HashMap<String, VecDeque<Instant>>,
    callers: HashMap<String, CallerHistory>,
    patterns: Vec<Tracked>,
    index: HashMap<(PatternKind, String), usize>,
}

impl FraudDetector {
    pub fn new(settings: FraudSettings) -> Self {
        Self {
            window: Duration::from_secs(settings.window_secs),
            settings,
            accesses: HashMap::new(),
            rejections: HashMap::new(),
            callers: HashMap::new(),
            patterns: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn settings(&self) -> &FraudSettings {
        &self.settings
    }

    /// Feed an operation that passed structure checks
    pub fn observe(&mut self, obs: &Observation<'_>) -> Assessment {
        self.observe_at(obs, Instant::now())
    }

    /// Feed a path the manifest refused
    pub fn record_rejection(&mut self, path: &str, caller: Option<&str>, frozen: bool) -> Assessment {
        self.record_rejection_at(path, caller, frozen, Instant::now())
    }

    pub fn patterns(&self) -> Vec<SuspiciousPattern> {
        self.patterns.iter().map(|t| t.pattern.clone()).collect()
    }

    pub fn pattern(&self, kind: PatternKind, subject: &str) -> Option<&SuspiciousPattern> {
        self.index
            .get(&(kind, subject.to_string()))
            .map(|&i| &self.patterns[i].pattern)
    }

    pub(crate) fn observe_at(&mut self, obs: &Observation<'_>, now: Instant) -> Assessment {
        let mut out = Assessment::default();
        if !self.settings.enabled {
            return out;
        }

        self.check_rapid_access(obs, now, &mut out);
        self.check_caller_baseline(obs, now, &mut out);

        if obs.administrative && !self.is_privileged(obs.caller) {
            let who = obs.caller.unwrap_or("anonymous");
            let d = self.upsert(
                PatternKind::PrivilegeEscalation,
                obs.path.to_string(),
                Severity::Critical,
                format!("{} into administrative area by non-privileged '{who}'", obs.operation),
                1,
                now,
            );
            out.detections.push(d);
        }

        for (name, re, severity) in SENSITIVE.iter() {
            if re.is_match(obs.path) {
                let d = self.upsert(
                    PatternKind::Anomaly,
                    format!("sensitive:{}", obs.path),
                    *severity,
                    format!("{name} targeted by {}", obs.operation),
                    1,
                    now,
                );
                out.detections.push(d);
                break;
            }
        }

        if let (Some(bytes), Some(max)) = (obs.bytes, obs.max_bytes) {
            if bytes > max {
                let d = self.upsert(
                    PatternKind::Anomaly,
                    format!("oversize:{}", obs.path),
                    Severity::Low,
                    format!("artifact of {bytes} bytes exceeds type limit of {max}"),
                    1,
                    now,
                );
                out.detections.push(d);
            }
        }

        self.sweep(now);
        out
    }

    pub(crate) fn record_rejection_at(
        &mut self,
        path: &str,
        caller: Option<&str>,
        frozen: bool,
        now: Instant,
    ) -> Assessment {
        let mut out = Assessment::default();
        if !self.settings.enabled {
            return out;
        }

        let window = self.window;
        let hits = self.rejections.entry(path.to_string()).or_default();
        evict(hits, now, window);
        hits.push_back(now);
        let count = hits.len();

        if count >= self.settings.rejection_threshold {
            let severity = if frozen { Severity::High } else { Severity::Medium };
            let who = caller.unwrap_or("anonymous");
            let d = self.upsert(
                PatternKind::UnauthorizedPath,
                path.to_string(),
                severity,
                format!("{count} rejected attempts within the window, last by '{who}'"),
                count as u64,
                now,
            );
            out.detections.push(d);
        }
        out
    }

    fn check_rapid_access(&mut self, obs: &Observation<'_>, now: Instant, out: &mut Assessment) {
        let window = self.window;
        let hits = self.accesses.entry(obs.path.to_string()).or_default();
        evict(hits, now, window);
        hits.push_back(now);
        let count = hits.len();

        let s = &self.settings;
        if count <= s.rapid_access_threshold {
            return;
        }
        let severity = if count > s.rapid_access_critical {
            Severity::Critical
        } else if count > s.rapid_access_high {
            Severity::High
        } else {
            Severity::Medium
        };
        let d = self.upsert(
            PatternKind::RapidAccess,
            obs.path.to_string(),
            severity,
            format!("{count} accesses within {}s", window.as_secs()),
            count as u64,
            now,
        );
        out.detections.push(d);
    }

    fn check_caller_baseline(&mut self, obs: &Observation<'_>, now: Instant, out: &mut Assessment) {
        let Some(caller) = obs.caller else {
            return;
        };
        let window = self.window;
        let history = self
            .callers
            .entry(caller.to_string())
            .or_insert_with(|| CallerHistory {
                first_seen: now,
                total: 0,
                recent: VecDeque::new(),
            });
        evict(&mut history.recent, now, window);
        history.recent.push_back(now);
        history.total += 1;

        let elapsed = now.saturating_duration_since(history.first_seen);
        if elapsed <= window {
            return;
        }
        let recent = history.recent.len() as u64;
        let prior = history.total - recent;
        if prior < self.settings.baseline_min_ops as u64 {
            return;
        }

        let prior_windows = ((elapsed - window).as_secs_f64() / window.as_secs_f64()).max(1.0);
        let baseline = prior as f64 / prior_windows;
        let limit = baseline * self.settings.baseline_multiplier;
        if (recent as f64) <= limit || recent as usize <= self.settings.rapid_access_threshold {
            return;
        }

        let severity = if recent as f64 > limit * 2.0 {
            Severity::High
        } else {
            Severity::Medium
        };
        let d = self.upsert(
            PatternKind::Anomaly,
            format!("caller:{caller}"),
            severity,
            format!("{recent} operations in the window against a baseline of {baseline:.1}"),
            1,
            now,
        );
        out.detections.push(d);
    }

    fn is_privileged(&self, caller: Option<&str>) -> bool {
        caller.is_some_and(|c| self.settings.privileged_callers.iter().any(|p| p == c))
    }

    /// Create or update the pattern for `(kind, subject)`.
    ///
    /// A repeat inside the window adds one occurrence; the first hit of a
    /// quiet pattern adds `opening` (the count that crossed the threshold).
    fn upsert(
        &mut self,
        kind: PatternKind,
        subject: String,
        observed: Severity,
        description: String,
        opening: u64,
        now: Instant,
    ) -> Detection {
        let stamp = Utc::now();
        let key = (kind, subject);

        if let Some(&i) = self.index.get(&key) {
            let window = self.window;
            let tracked = &mut self.patterns[i];
            let repeat = now.saturating_duration_since(tracked.last_hit) <= window;
            let p = &mut tracked.pattern;
            p.occurrences += if repeat { 1 } else { opening };
            p.last_seen = stamp;
            p.description = description;
            tracked.last_hit = now;

            let escalated = observed > p.severity;
            if escalated {
                warn!(kind = %kind, subject = %p.subject, from = %p.severity, to = %observed, "suspicious pattern escalated");
                p.severity = observed;
            }
            return Detection {
                pattern: p.clone(),
                observed,
                escalated,
            };
        }

        let pattern = SuspiciousPattern {
            kind,
            subject: key.1.clone(),
            severity: observed,
            description,
            first_seen: stamp,
            last_seen: stamp,
            occurrences: opening,
        };
        warn!(kind = %kind, subject = %pattern.subject, severity = %observed, "suspicious pattern detected");
        self.index.insert(key, self.patterns.len());
        self.patterns.push(Tracked {
            pattern: pattern.clone(),
            last_hit: now,
        });
        Detection {
            pattern,
            observed,
            escalated: true,
        }
    }

    fn sweep(&mut self, now: Instant) {
        let window = self.window;
        for map in [&mut self.accesses, &mut self.rejections] {
            if map.len() > SWEEP_THRESHOLD {
                map.retain(|_, hits| {
                    evict(hits, now, window);
                    !hits.is_empty()
                });
                debug!(remaining = map.len(), "swept idle access windows");
            }
        }
        if self.callers.len() > SWEEP_THRESHOLD {
            self.callers.retain(|_, history| {
                evict(&mut history.recent, now, window);
                !history.recent.is_empty()
            });
            debug!(remaining = self.callers.len(), "swept idle caller histories");
        }
    }
}

fn evict(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while hits
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) > window)
    {
        hits.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> FraudDetector {
        FraudDetector::new(FraudSettings {
            privileged_callers: vec!["root".into()],
            ..FraudSettings::default()
        })
    }

    fn write(path: &str) -> Observation<'_> {
        Observation::new(path, OperationKind::Write)
    }

    #[test]
    fn test_rapid_access_single_pattern() {
        let mut d = detector();
        let t0 = Instant::now();
        for i in 0..25u64 {
            d.observe_at(&write("docs/a.md"), t0 + Duration::from_millis(i * 10));
        }

        let patterns = d.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].kind, PatternKind::RapidAccess);
        assert_eq!(patterns[0].occurrences, 25);
        assert_eq!(patterns[0].severity, Severity::Medium);
    }

    #[test]
    fn test_rapid_access_below_threshold() {
        let mut d = detector();
        let t0 = Instant::now();
        for i in 0..10u64 {
            let a = d.observe_at(&write("docs/a.md"), t0 + Duration::from_millis(i));
            assert!(a.is_clean());
        }
        // outside the window the count restarts
        let a = d.observe_at(&write("docs/a.md"), t0 + Duration::from_secs(120));
        assert!(a.is_clean());
    }

    #[test]
    fn test_escalation_fires_once_per_tier() {
        let mut d = FraudDetector::new(FraudSettings {
            rapid_access_threshold: 2,
            rapid_access_high: 4,
            rapid_access_critical: 6,
            ..FraudSettings::default()
        });
        let t0 = Instant::now();
        let mut escalations = Vec::new();
        let mut blocked = 0;
        for i in 0..8u64 {
            let a = d.observe_at(&write("x"), t0 + Duration::from_millis(i));
            escalations.extend(a.escalations().map(|p| p.severity));
            if a.blocking().is_some() {
                blocked += 1;
            }
        }
        assert_eq!(
            escalations,
            vec![Severity::Medium, Severity::High, Severity::Critical]
        );
        assert_eq!(blocked, 2);
    }

    #[test]
    fn test_privilege_escalation_is_critical() {
        let mut d = detector();
        let mut obs = write("config/secrets/db.toml");
        obs.administrative = true;
        obs.caller = Some("intern");
        let a = d.observe(&obs);
        let block = a.blocking().unwrap();
        assert_eq!(block.pattern.kind, PatternKind::PrivilegeEscalation);

        obs.caller = Some("root");
        assert!(d.observe(&obs).blocking().is_none());
    }

    #[test]
    fn test_repeated_rejections() {
        let mut d = detector();
        let t0 = Instant::now();
        assert!(d.record_rejection_at("layer/x", None, true, t0).is_clean());
        assert!(d
            .record_rejection_at("layer/x", None, true, t0 + Duration::from_secs(1))
            .is_clean());
        let a = d.record_rejection_at("layer/x", Some("bot"), true, t0 + Duration::from_secs(2));
        let det = &a.detections[0];
        assert_eq!(det.pattern.kind, PatternKind::UnauthorizedPath);
        assert_eq!(det.pattern.severity, Severity::High);
        assert_eq!(det.pattern.occurrences, 3);
        assert!(a.blocking().is_none());

        d.record_rejection_at("layer/x", None, true, t0 + Duration::from_secs(3));
        let p = d.pattern(PatternKind::UnauthorizedPath, "layer/x").unwrap();
        assert_eq!(p.occurrences, 4);
    }

    #[test]
    fn test_sensitive_paths() {
        let mut d = detector();
        let a = d.observe(&write("deploy/.env"));
        assert_eq!(a.detections[0].observed, Severity::Medium);
        let a = d.observe(&write("keys/server.pem"));
        assert_eq!(a.detections[0].observed, Severity::High);
        let a = d.observe(&write("notes.txt.bak"));
        assert_eq!(a.detections[0].observed, Severity::Low);
        assert!(d.observe(&write("src/env.rs")).is_clean());
    }

    #[test]
    fn test_oversize_is_low_anomaly() {
        let mut d = detector();
        let mut obs = write("gen/report.md");
        obs.bytes = Some(4096);
        obs.max_bytes = Some(1024);
        let a = d.observe(&obs);
        assert_eq!(a.detections.len(), 1);
        assert_eq!(a.detections[0].pattern.kind, PatternKind::Anomaly);
        assert_eq!(a.detections[0].observed, Severity::Low);
        assert_eq!(a.warnings().len(), 1);
    }

    #[test]
    fn test_caller_spike_against_baseline() {
        let mut d = detector();
        let t0 = Instant::now();
        // quiet history: one op every 30s
        for i in 0..20u64 {
            let path = format!("quiet/{i}");
            let a = d.observe_at(
                &Observation { caller: Some("bot"), ..write(&path) },
                t0 + Duration::from_secs(i * 30),
            );
            assert!(a.is_clean());
        }

        let burst_start = t0 + Duration::from_secs(1_000);
        let mut flagged = false;
        for i in 0..15u64 {
            let path = format!("burst/{i}");
            let a = d.observe_at(
                &Observation { caller: Some("bot"), ..write(&path) },
                burst_start + Duration::from_millis(i),
            );
            flagged |= a
                .detections
                .iter()
                .any(|det| det.pattern.subject == "caller:bot");
        }
        assert!(flagged);
    }

    #[test]
    fn test_sweep_drops_idle_windows_and_callers() {
        let mut d = detector();
        let t0 = Instant::now();
        for i in 0..(SWEEP_THRESHOLD + 10) {
            let path = format!("bulk/{i}");
            d.observe_at(
                &Observation { caller: Some(path.as_str()), ..write(&path) },
                t0,
            );
        }
        assert!(d.callers.len() > SWEEP_THRESHOLD);

        d.observe_at(
            &Observation { caller: Some("late"), ..write("late.txt") },
            t0 + Duration::from_secs(120),
        );
        assert_eq!(d.callers.len(), 1);
        assert_eq!(d.accesses.len(), 1);
        assert!(d.callers.contains_key("late"));
    }

    #[test]
    fn test_disabled_detector() {
        let mut d = FraudDetector::new(FraudSettings {
            enabled: false,
            ..FraudSettings::default()
        });
        let mut obs = write("config/secrets/x");
        obs.administrative = true;
        assert!(d.observe(&obs).is_clean());
        assert!(d.patterns().is_empty());
    }
}
