use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StartdError};

/// Identity of this node as it appears in claim ids and published records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeIdentity {
    /// Host name used to build slot names (`slot1@host`)
    pub host: String,
    /// Address embedded in claim ids
    pub address: String,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            address: "127.0.0.1:9618".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Static,
    Partitionable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    pub name: String,
    #[serde(default = "default_slot_kind")]
    pub kind: SlotKind,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_memory")]
    pub memory_mb: u64,
}

fn default_slot_kind() -> SlotKind {
    SlotKind::Static
}

fn default_cpus() -> u32 {
    1
}

fn default_memory() -> u64 {
    1024
}

impl SlotConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SlotKind::Static,
            cpus: default_cpus(),
            memory_mb: default_memory(),
        }
    }

    pub fn partitionable(name: impl Into<String>, cpus: u32, memory_mb: u64) -> Self {
        Self {
            name: name.into(),
            kind: SlotKind::Partitionable,
            cpus,
            memory_mb,
        }
    }
}

/// Policy expressions, in the expression language of [`crate::policy::expr`].
///
/// An empty string means "not configured", which evaluates as undefined.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub start: String,
    pub is_owner: String,
    pub preempt: String,
    pub suspend: String,
    #[serde(rename = "continue")]
    pub continue_: String,
    pub kill: String,
    pub want_suspend: String,
    pub want_vacate: String,
    pub want_hold: String,
    pub rank: String,
    pub start_backfill: String,
    pub evict_backfill: String,
    pub periodic_checkpoint: String,
    pub max_job_retirement_time: String,
    pub machine_max_vacate_time: String,
    pub draining_start: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            start: "true".to_string(),
            is_owner: "false".to_string(),
            preempt: "false".to_string(),
            suspend: "false".to_string(),
            continue_: "true".to_string(),
            kill: "false".to_string(),
            want_suspend: "false".to_string(),
            want_vacate: "true".to_string(),
            want_hold: "false".to_string(),
            rank: "0".to_string(),
            start_backfill: "false".to_string(),
            evict_backfill: "false".to_string(),
            periodic_checkpoint: "false".to_string(),
            max_job_retirement_time: "0".to_string(),
            machine_max_vacate_time: "10".to_string(),
            draining_start: "false".to_string(),
        }
    }
}

/// Timer intervals, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub update_interval_secs: u64,
    pub polling_interval_secs: u64,
    /// Delay before the first periodic update
    pub update_offset_secs: u64,
    pub match_timeout_secs: u64,
    pub killing_timeout_secs: u64,
    pub max_claim_alives_missed: u32,
    pub default_lease_duration_secs: u64,
    pub alive_retry_secs: u64,
    /// Idle claims older than this (after one activation) are preempted
    pub claim_worklife_secs: Option<u64>,
    /// Coalescing delay before dirty slot records are flushed
    pub dirty_update_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 300,
            polling_interval_secs: 5,
            update_offset_secs: 0,
            match_timeout_secs: 120,
            killing_timeout_secs: 30,
            max_claim_alives_missed: 6,
            default_lease_duration_secs: 1200,
            alive_retry_secs: 5,
            claim_worklife_secs: None,
            dirty_update_delay_ms: 1000,
        }
    }
}

impl TimingConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn match_timeout(&self) -> Duration {
        Duration::from_secs(self.match_timeout_secs)
    }

    pub fn killing_timeout(&self) -> Duration {
        Duration::from_secs(self.killing_timeout_secs)
    }

    pub fn default_lease_duration(&self) -> Duration {
        Duration::from_secs(self.default_lease_duration_secs)
    }

    pub fn alive_retry(&self) -> Duration {
        Duration::from_secs(self.alive_retry_secs)
    }

    pub fn claim_worklife(&self) -> Option<Duration> {
        self.claim_worklife_secs.map(Duration::from_secs)
    }

    pub fn dirty_update_delay(&self) -> Duration {
        Duration::from_millis(self.dirty_update_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// When false, keep-alives are the remote client's job ("peer" mode)
    pub startd_sends_alives: bool,
    pub enable_backfill: bool,
    pub backfill_command: Option<String>,
    pub run_benchmarks: bool,
    pub benchmark_duration_secs: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            startd_sends_alives: false,
            enable_backfill: false,
            backfill_command: None,
            run_benchmarks: false,
            benchmark_duration_secs: 10,
        }
    }
}

/// Settings for launching job processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StarterConfig {
    pub shell: String,
}

impl Default for StarterConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartdConfig {
    pub node: NodeIdentity,
    pub slots: Vec<SlotConfig>,
    pub policy: PolicyConfig,
    pub timing: TimingConfig,
    pub claims: ClaimConfig,
    pub starter: StarterConfig,
}

impl Default for StartdConfig {
    fn default() -> Self {
        Self {
            node: NodeIdentity::default(),
            slots: vec![SlotConfig::new("slot1")],
            policy: PolicyConfig::default(),
            timing: TimingConfig::default(),
            claims: ClaimConfig::default(),
            starter: StarterConfig::default(),
        }
    }
}

impl StartdConfig {
    /// Load a configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: StartdConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.slots.is_empty() {
            return Err(StartdError::Config("at least one slot is required".into()));
        }
        let mut names: Vec<&str> = self.slots.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(StartdError::Config("slot names must be unique".into()));
        }
        if self.timing.update_interval_secs == 0 || self.timing.polling_interval_secs == 0 {
            return Err(StartdError::Config(
                "update and polling intervals must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Replace the slot list with `count` identical static slots.
    pub fn with_static_slots(mut self, count: usize) -> Self {
        self.slots = (1..=count)
            .map(|i| SlotConfig::new(format!("slot{}", i)))
            .collect();
        self
    }

    pub fn with_slot(mut self, slot: SlotConfig) -> Self {
        self.slots.push(slot);
        self
    }

    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn startd_config_default() {
        let cfg = StartdConfig::default();
        assert_eq!(cfg.slots.len(), 1);
        assert_eq!(cfg.slots[0].name, "slot1");
        assert_eq!(cfg.slots[0].kind, SlotKind::Static);
        assert_eq!(cfg.timing.match_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.timing.max_claim_alives_missed, 6);
        assert!(!cfg.claims.startd_sends_alives);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn with_static_slots_numbers_from_one() {
        let cfg = StartdConfig::default().with_static_slots(3);
        let names: Vec<_> = cfg.slots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["slot1", "slot2", "slot3"]);
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let cfg = StartdConfig::default().with_slot(SlotConfig::new("slot1"));
        assert!(matches!(cfg.validate(), Err(StartdError::Config(_))));
    }

    #[test]
    fn validate_rejects_empty_slot_list() {
        let mut cfg = StartdConfig::default();
        cfg.slots.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"slots":[{{"name":"pslot","kind":"partitionable","cpus":8,"memory_mb":16384}}],
                "policy":{{"preempt":"true"}},
                "timing":{{"match_timeout_secs":15}}}}"#
        )
        .unwrap();

        let cfg = StartdConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.slots[0].kind, SlotKind::Partitionable);
        assert_eq!(cfg.slots[0].cpus, 8);
        assert_eq!(cfg.policy.preempt, "true");
        assert_eq!(cfg.policy.start, "true");
        assert_eq!(cfg.timing.match_timeout_secs, 15);
        assert_eq!(cfg.timing.polling_interval_secs, 5);
    }

    #[test]
    fn from_file_reports_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            StartdConfig::from_file(file.path()),
            Err(StartdError::Json(_))
        ));
    }
}
