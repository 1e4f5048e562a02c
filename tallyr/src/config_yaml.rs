use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tallyr_core::{
    EntityKind, ExecutionConfig, NewSchedule, QuotaConfig, RampStep, Recurrence,
    SchedulerConfig, Target, TenantId, Trigger,
};

/// An execution definition: who runs it and what "done" means.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct ExecutionYaml {
    pub tenant: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub iterations: Option<u64>,

    #[serde(default)]
    pub duration: Option<YamlDuration>,

    #[serde(default = "default_threads")]
    pub threads: u64,

    #[serde(default)]
    pub stages: Vec<StageYaml>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct StageYaml {
    pub duration: YamlDuration,

    /// Threads added when the stage begins; negative values remove threads.
    #[serde(default)]
    pub thread_delta: i64,
}

fn default_threads() -> u64 {
    1
}

impl ExecutionYaml {
    /// Builds the engine config. `fallback_name` is used when the YAML has no `name`.
    pub(crate) fn into_config(self, fallback_name: &str) -> anyhow::Result<ExecutionConfig> {
        let target = match (self.iterations, self.duration) {
            (Some(n), None) => Some(Target::Iterations(n)),
            (None, Some(d)) => Some(Target::Duration(d.into_inner())),
            (None, None) => None,
            (Some(_), Some(_)) => {
                anyhow::bail!("execution sets both `iterations` and `duration`; pick one")
            }
        };

        let config = ExecutionConfig {
            tenant: TenantId(self.tenant),
            name: self.name.unwrap_or_else(|| fallback_name.to_string()),
            target,
            threads: self.threads,
            ramp: self
                .stages
                .into_iter()
                .map(|s| RampStep {
                    duration: s.duration.into_inner(),
                    thread_delta: s.thread_delta,
                })
                .collect(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct TallyrYaml {
    #[serde(default)]
    pub scheduler: SchedulerYaml,

    #[serde(default)]
    pub quota: QuotaYaml,

    #[serde(default)]
    pub schedules: Vec<ScheduleYaml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct SchedulerYaml {
    #[serde(default)]
    pub poll_interval: Option<YamlDuration>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub lease_ttl: Option<YamlDuration>,
    #[serde(default)]
    pub dispatch_timeout: Option<YamlDuration>,
    #[serde(default)]
    pub owner: Option<String>,
}

impl SchedulerYaml {
    pub(crate) fn into_config(self) -> anyhow::Result<SchedulerConfig> {
        let defaults = SchedulerConfig::default();
        let config = SchedulerConfig {
            poll_interval: self
                .poll_interval
                .map_or(defaults.poll_interval, YamlDuration::into_inner),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            lease_ttl: self
                .lease_ttl
                .map_or(defaults.lease_ttl, YamlDuration::into_inner),
            dispatch_timeout: self
                .dispatch_timeout
                .map_or(defaults.dispatch_timeout, YamlDuration::into_inner),
            owner: self.owner.unwrap_or(defaults.owner),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct QuotaYaml {
    #[serde(default = "default_max_running")]
    pub default_max_running: u64,
    #[serde(default)]
    pub trial_max_running: Option<u64>,
    #[serde(default)]
    pub global_max_running: Option<u64>,
    #[serde(default)]
    pub trial_tenants: Vec<String>,
    #[serde(default)]
    pub tenants: HashMap<String, u64>,
}

impl Default for QuotaYaml {
    fn default() -> Self {
        Self {
            default_max_running: default_max_running(),
            trial_max_running: None,
            global_max_running: None,
            trial_tenants: Vec::new(),
            tenants: HashMap::new(),
        }
    }
}

fn default_max_running() -> u64 {
    10
}

impl From<QuotaYaml> for QuotaConfig {
    fn from(q: QuotaYaml) -> Self {
        QuotaConfig {
            default_max_running: q.default_max_running,
            trial_max_running: q.trial_max_running,
            global_max_running: q.global_max_running,
            trial_tenants: q.trial_tenants.into_iter().map(TenantId).collect::<HashSet<_>>(),
            tenants: q
                .tenants
                .into_iter()
                .map(|(tenant, limit)| (TenantId(tenant), limit))
                .collect(),
        }
    }
}

/// One monitor or report. The trigger follows from which of `at`, `every` and `cron` are
/// set: none fires on the first tick, `at` alone fires once at that instant, `every` or
/// `cron` repeat (with `at` as the optional first run).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct ScheduleYaml {
    pub kind: String,
    pub name: String,

    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub every: Option<YamlDuration>,
    #[serde(default)]
    pub cron: Option<String>,

    pub execution: ExecutionYaml,
}

impl ScheduleYaml {
    pub(crate) fn into_new_schedule(self) -> anyhow::Result<NewSchedule> {
        let kind: EntityKind = self.kind.parse().map_err(|_| {
            anyhow::anyhow!(
                "unknown schedule kind `{}` (expected monitor or report)",
                self.kind
            )
        })?;

        let recurrence = match (self.every, self.cron) {
            (Some(every), None) => Some(Recurrence::Every(every.into_inner())),
            (None, Some(cron)) => Some(Recurrence::Cron(cron)),
            (None, None) => None,
            (Some(_), Some(_)) => {
                anyhow::bail!("schedule `{}` sets both `every` and `cron`", self.name)
            }
        };
        let trigger = match (recurrence, self.at) {
            (Some(r), _) => Trigger::Periodically(r),
            (None, Some(_)) => Trigger::AtSomeDate,
            (None, None) => Trigger::Now,
        };

        let template = self
            .execution
            .into_config(&self.name)
            .with_context(|| format!("schedule `{}`", self.name))?;
        let new = NewSchedule::new(kind, self.name, trigger, template);
        Ok(match self.at {
            Some(at) => new.at(at),
            None => new,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct YamlDuration(Duration);

impl YamlDuration {
    pub(crate) fn into_inner(self) -> Duration {
        self.0
    }
}

impl<'de> Deserialize<'de> for YamlDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = YamlDuration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("duration as string (e.g. 10s, 1m) or integer seconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(YamlDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(v)
                    .map(|secs| YamlDuration(Duration::from_secs(secs)))
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let d = humantime::parse_duration(v.trim()).map_err(E::custom)?;
                Ok(YamlDuration(d))
            }
        }

        deserializer.deserialize_any(V)
    }
}

pub(crate) async fn load_execution(path: &Path) -> anyhow::Result<ExecutionConfig> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read execution YAML: {}", path.display()))?;
    let doc: ExecutionYaml = serde_yaml::from_slice(&bytes)
        .with_context(|| format!("failed to parse YAML: {}", path.display()))?;

    let fallback = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("replay");
    doc.into_config(fallback)
        .with_context(|| format!("invalid execution: {}", path.display()))
}

pub(crate) async fn load_config(path: &Path) -> anyhow::Result<TallyrYaml> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read config YAML: {}", path.display()))?;
    serde_yaml::from_slice(&bytes)
        .with_context(|| format!("failed to parse YAML: {}", path.display()))
}
