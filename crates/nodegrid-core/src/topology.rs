//! nodegrid.toml topology parser and validator.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::types::*;
use crate::units::{parse_duration, parse_size, SizeError};

pub const DEFAULT_COORDINATOR_NAME: &str = "coordinator";
pub const DEFAULT_COORDINATOR_PORT: u16 = 7077;
pub const DEFAULT_COORDINATOR_UI_PORT: u16 = 8080;
pub const DEFAULT_WORKER_PREFIX: &str = "worker-";
pub const DEFAULT_WORKER_UI_PORT_BASE: u16 = 8081;
pub const DEFAULT_WORKER_MEMORY: &str = "1G";
pub const DEFAULT_WORKER_CORES: i64 = 2;
pub const DEFAULT_SUBNET: &str = "172.28.0.0/16";
/// Longest accepted interval, timeout, or delay.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// The topology document as written on disk.
///
/// Numeric fields are kept signed so that a negative value is reported
/// against its field instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyDocument {
    pub cluster: ClusterSection,
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<WorkerSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_defaults: Option<WorkerDefaultsSection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountSection>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSection {
    pub name: String,
    /// Default image for every node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Fabric name; defaults to `<name>-net`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSection {
    pub name: String,
    /// Defaults to `worker_defaults.ui_port_base + index`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDefaultsSection {
    #[serde(default = "default_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_ui_port_base")]
    pub ui_port_base: i64,
    #[serde(default = "default_memory")]
    pub memory_limit: String,
    #[serde(default = "default_cores")]
    pub core_count: i64,
}

impl Default for WorkerDefaultsSection {
    fn default() -> Self {
        Self {
            name_prefix: default_prefix(),
            ui_port_base: default_ui_port_base(),
            memory_limit: default_memory(),
            core_count: default_cores(),
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_WORKER_PREFIX.to_string()
}

fn default_ui_port_base() -> i64 {
    DEFAULT_WORKER_UI_PORT_BASE as i64
}

fn default_memory() -> String {
    DEFAULT_WORKER_MEMORY.to_string()
}

fn default_cores() -> i64 {
    DEFAULT_WORKER_CORES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSection {
    pub source: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSection {
    /// "tcp" or "http".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<String>,
    /// HTTP path for `probe = "http"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_threshold: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

impl TopologyDocument {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Write the document back to disk (used by `scale`).
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Scaffold a two-worker document with the default ports.
    pub fn scaffold(name: &str, image: &str) -> Self {
        let mut doc = TopologyDocument {
            cluster: ClusterSection {
                name: name.to_string(),
                image: Some(image.to_string()),
                network: None,
                subnet: None,
            },
            coordinator: CoordinatorSection {
                port: Some(DEFAULT_COORDINATOR_PORT as i64),
                ui_port: Some(DEFAULT_COORDINATOR_UI_PORT as i64),
                ..CoordinatorSection::default()
            },
            workers: Vec::new(),
            worker_defaults: None,
            mounts: Vec::new(),
            env: BTreeMap::new(),
            health: None,
            lifecycle: None,
            retry: None,
        };
        doc.scale_workers(2);
        doc
    }

    /// Edit the desired worker list to exactly `count` entries.
    ///
    /// Shrinking drops the most recently added workers (the tail of the
    /// list). Growing appends `<name_prefix><n>` workers on
    /// `ui_port_base + index`, skipping names and ports already taken.
    pub fn scale_workers(&mut self, count: usize) {
        if count <= self.workers.len() {
            self.workers.truncate(count);
            return;
        }

        let defaults = self.worker_defaults.clone().unwrap_or_default();

        let mut taken_names: HashSet<String> =
            self.workers.iter().map(|w| w.name.clone()).collect();
        taken_names.insert(self.coordinator_name());

        let mut taken_ports: HashSet<i64> = HashSet::new();
        taken_ports.insert(self.coordinator.port.unwrap_or(DEFAULT_COORDINATOR_PORT as i64));
        taken_ports.insert(
            self.coordinator
                .ui_port
                .unwrap_or(DEFAULT_COORDINATOR_UI_PORT as i64),
        );
        for (index, worker) in self.workers.iter().enumerate() {
            taken_ports.insert(worker.ui_port.unwrap_or(defaults.ui_port_base + index as i64));
        }

        while self.workers.len() < count {
            let index = self.workers.len();

            let mut ordinal = index + 1;
            let name = loop {
                let candidate = format!("{}{ordinal}", defaults.name_prefix);
                if !taken_names.contains(&candidate) {
                    break candidate;
                }
                ordinal += 1;
            };

            let mut port = defaults.ui_port_base + index as i64;
            while taken_ports.contains(&port) {
                port += 1;
            }

            taken_names.insert(name.clone());
            taken_ports.insert(port);
            debug!(%name, port, "worker appended to topology");

            self.workers.push(WorkerSection {
                name,
                ui_port: Some(port),
                memory_limit: Some(defaults.memory_limit.clone()),
                core_count: Some(defaults.core_count),
                image: None,
                command: None,
            });
        }
    }

    fn coordinator_name(&self) -> String {
        self.coordinator
            .name
            .clone()
            .unwrap_or_else(|| DEFAULT_COORDINATOR_NAME.to_string())
    }

    /// Validate the document into an immutable [`ClusterSpec`].
    ///
    /// Performs no I/O. The first problem found is returned, naming the
    /// offending field.
    pub fn validate(&self) -> ConfigResult<ClusterSpec> {
        let name = self.cluster.name.trim();
        if name.is_empty() {
            return Err(ConfigError::invalid("cluster.name", "must not be empty"));
        }
        if !is_valid_object_name(name) {
            return Err(ConfigError::invalid(
                "cluster.name",
                "may only contain ASCII letters, digits, '-', '_' and '.'",
            ));
        }

        let network = match &self.cluster.network {
            Some(n) if !is_valid_object_name(n) => {
                return Err(ConfigError::invalid("cluster.network", "invalid network name"));
            }
            Some(n) => n.clone(),
            None => format!("{name}-net"),
        };

        let subnet: Subnet = self
            .cluster
            .subnet
            .as_deref()
            .unwrap_or(DEFAULT_SUBNET)
            .parse()
            .map_err(|reason: String| ConfigError::invalid("cluster.subnet", reason))?;

        let default_image = self.cluster.image.clone();
        let resolve_image = |field: &str, own: &Option<String>| -> ConfigResult<String> {
            match own.as_ref().or(default_image.as_ref()) {
                Some(image) if !image.trim().is_empty() => Ok(image.clone()),
                _ => Err(ConfigError::invalid(
                    field,
                    "no image given here or in cluster.image",
                )),
            }
        };

        // Every host-published port, keyed to the field that claimed it.
        let mut ports: HashMap<u16, String> = HashMap::new();
        let mut claim_port = |field: String, port: u16| -> ConfigResult<()> {
            if let Some(other) = ports.get(&port) {
                return Err(ConfigError::PortCollision {
                    field,
                    port,
                    other: other.clone(),
                });
            }
            ports.insert(port, field);
            Ok(())
        };

        // ── Coordinator ──
        let coordinator_name = self.coordinator_name();
        if !is_valid_object_name(&coordinator_name) {
            return Err(ConfigError::invalid("coordinator.name", "invalid node name"));
        }
        let coordinator_port = port_field(
            "coordinator.port",
            self.coordinator.port.unwrap_or(DEFAULT_COORDINATOR_PORT as i64),
        )?;
        let coordinator_ui_port = port_field(
            "coordinator.ui_port",
            self.coordinator
                .ui_port
                .unwrap_or(DEFAULT_COORDINATOR_UI_PORT as i64),
        )?;
        claim_port("coordinator.port".to_string(), coordinator_port)?;
        claim_port("coordinator.ui_port".to_string(), coordinator_ui_port)?;

        let coordinator = CoordinatorSpec {
            name: coordinator_name.clone(),
            port: coordinator_port,
            ui_port: coordinator_ui_port,
            image: resolve_image("coordinator.image", &self.coordinator.image)?,
            command: self.coordinator.command.clone().unwrap_or_default(),
        };

        // ── Worker defaults ──
        let defaults_section = self.worker_defaults.clone().unwrap_or_default();
        if defaults_section.name_prefix.is_empty()
            || !is_valid_object_name(&defaults_section.name_prefix)
        {
            return Err(ConfigError::invalid(
                "worker_defaults.name_prefix",
                "invalid node name prefix",
            ));
        }
        let worker_defaults = WorkerDefaults {
            name_prefix: defaults_section.name_prefix.clone(),
            ui_port_base: port_field("worker_defaults.ui_port_base", defaults_section.ui_port_base)?,
            memory_bytes: size_field("worker_defaults.memory_limit", &defaults_section.memory_limit)?,
            core_count: count_field("worker_defaults.core_count", defaults_section.core_count)?,
        };

        // ── Workers ──
        let mut names: HashSet<String> = HashSet::new();
        names.insert(coordinator_name);
        let mut workers = Vec::with_capacity(self.workers.len());

        for (index, section) in self.workers.iter().enumerate() {
            let field = |leaf: &str| format!("workers[{index}].{leaf}");

            let worker_name = section.name.trim().to_string();
            if worker_name.is_empty() || !is_valid_object_name(&worker_name) {
                return Err(ConfigError::invalid(field("name"), "invalid node name"));
            }
            if !names.insert(worker_name.clone()) {
                return Err(ConfigError::DuplicateName {
                    field: field("name"),
                    value: worker_name,
                });
            }

            let ui_port = port_field(
                &field("ui_port"),
                section
                    .ui_port
                    .unwrap_or(worker_defaults.ui_port_base as i64 + index as i64),
            )?;
            claim_port(field("ui_port"), ui_port)?;

            let memory_bytes = match &section.memory_limit {
                Some(raw) => size_field(&field("memory_limit"), raw)?,
                None => worker_defaults.memory_bytes,
            };
            let core_count = match section.core_count {
                Some(raw) => count_field(&field("core_count"), raw)?,
                None => worker_defaults.core_count,
            };

            workers.push(WorkerSpec {
                name: worker_name,
                ui_port,
                memory_bytes,
                core_count,
                image: resolve_image(&field("image"), &section.image)?,
                command: section.command.clone().unwrap_or_default(),
            });
        }

        // ── Mounts ──
        let mut targets = HashSet::new();
        let mut mounts = Vec::with_capacity(self.mounts.len());
        for (index, mount) in self.mounts.iter().enumerate() {
            if mount.source.as_os_str().is_empty() {
                return Err(ConfigError::invalid(
                    format!("mounts[{index}].source"),
                    "must not be empty",
                ));
            }
            if !mount.target.is_absolute() {
                return Err(ConfigError::invalid(
                    format!("mounts[{index}].target"),
                    "must be an absolute path",
                ));
            }
            if !targets.insert(mount.target.clone()) {
                return Err(ConfigError::invalid(
                    format!("mounts[{index}].target"),
                    format!("{} is mounted twice", mount.target.display()),
                ));
            }
            mounts.push(Mount {
                source: mount.source.clone(),
                target: mount.target.clone(),
            });
        }

        // ── Environment ──
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(ConfigError::invalid(format!("env.{key}"), "invalid variable name"));
            }
            if env::RESERVED.contains(&key.as_str()) {
                return Err(ConfigError::invalid(
                    format!("env.{key}"),
                    "is set by nodegrid and cannot be overridden",
                ));
            }
        }

        let spec = ClusterSpec {
            name: name.to_string(),
            network,
            subnet,
            coordinator,
            workers,
            mounts,
            env: self.env.clone(),
            health: self.health_policy()?,
            lifecycle: self.lifecycle_policy()?,
            retry: self.retry_settings()?,
            worker_defaults,
        };

        debug!(
            cluster = %spec.name,
            workers = spec.workers.len(),
            mounts = spec.mounts.len(),
            "topology validated"
        );
        Ok(spec)
    }

    fn health_policy(&self) -> ConfigResult<HealthPolicy> {
        let defaults = HealthPolicy::default();
        let section = self.health.clone().unwrap_or_default();

        let probe = match section.probe.as_deref().unwrap_or("tcp") {
            "tcp" => ProbeKind::Tcp,
            "http" => {
                let path = section.path.clone().unwrap_or_else(|| "/".to_string());
                if !path.starts_with('/') {
                    return Err(ConfigError::invalid("health.path", "must start with '/'"));
                }
                ProbeKind::Http { path }
            }
            other => {
                return Err(ConfigError::invalid(
                    "health.probe",
                    format!("unknown probe kind {other:?} (expected \"tcp\" or \"http\")"),
                ));
            }
        };

        Ok(HealthPolicy {
            probe,
            host: section.host.clone().unwrap_or(defaults.host),
            interval: duration_field("health.interval", section.interval.as_deref(), defaults.interval)?,
            timeout: duration_field("health.timeout", section.timeout.as_deref(), defaults.timeout)?,
            unhealthy_threshold: match section.unhealthy_threshold {
                Some(raw) => count_field("health.unhealthy_threshold", raw)?,
                None => defaults.unhealthy_threshold,
            },
        })
    }

    fn lifecycle_policy(&self) -> ConfigResult<LifecyclePolicy> {
        let defaults = LifecyclePolicy::default();
        let section = self.lifecycle.clone().unwrap_or_default();
        Ok(LifecyclePolicy {
            readiness_timeout: duration_field(
                "lifecycle.readiness_timeout",
                section.readiness_timeout.as_deref(),
                defaults.readiness_timeout,
            )?,
            grace_period: duration_field(
                "lifecycle.grace_period",
                section.grace_period.as_deref(),
                defaults.grace_period,
            )?,
            reconcile_interval: duration_field(
                "lifecycle.reconcile_interval",
                section.reconcile_interval.as_deref(),
                defaults.reconcile_interval,
            )?,
            up_timeout: duration_field(
                "lifecycle.up_timeout",
                section.up_timeout.as_deref(),
                defaults.up_timeout,
            )?,
            command_timeout: duration_field(
                "lifecycle.command_timeout",
                section.command_timeout.as_deref(),
                defaults.command_timeout,
            )?,
        })
    }

    fn retry_settings(&self) -> ConfigResult<RetrySettings> {
        let defaults = RetrySettings::default();
        let section = self.retry.clone().unwrap_or_default();

        let base_delay =
            duration_field("retry.base_delay", section.base_delay.as_deref(), defaults.base_delay)?;
        let max_delay =
            duration_field("retry.max_delay", section.max_delay.as_deref(), defaults.max_delay)?;
        if max_delay < base_delay {
            return Err(ConfigError::invalid(
                "retry.max_delay",
                "must not be shorter than retry.base_delay",
            ));
        }

        let jitter = section.jitter.unwrap_or(defaults.jitter);
        if !(0.0..1.0).contains(&jitter) {
            return Err(ConfigError::invalid("retry.jitter", "must be in [0, 1)"));
        }

        Ok(RetrySettings {
            base_delay,
            max_delay,
            max_attempts: match section.max_attempts {
                Some(raw) => count_field("retry.max_attempts", raw)?,
                None => defaults.max_attempts,
            },
            jitter,
        })
    }
}

fn is_valid_object_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn port_field(field: &str, raw: i64) -> ConfigResult<u16> {
    if raw <= 0 {
        return Err(ConfigError::NonPositive {
            field: field.to_string(),
            value: raw.to_string(),
        });
    }
    u16::try_from(raw).map_err(|_| ConfigError::invalid(field, format!("port {raw} out of range")))
}

fn count_field(field: &str, raw: i64) -> ConfigResult<u32> {
    if raw <= 0 {
        return Err(ConfigError::NonPositive {
            field: field.to_string(),
            value: raw.to_string(),
        });
    }
    u32::try_from(raw).map_err(|_| ConfigError::invalid(field, format!("{raw} is too large")))
}

fn size_field(field: &str, raw: &str) -> ConfigResult<u64> {
    parse_size(raw).map_err(|e| match e {
        SizeError::Negative | SizeError::Zero => ConfigError::NonPositive {
            field: field.to_string(),
            value: raw.to_string(),
        },
        SizeError::Malformed => {
            ConfigError::invalid(field, format!("cannot parse memory size {raw:?}"))
        }
    })
}

fn duration_field(field: &str, raw: Option<&str>, default: Duration) -> ConfigResult<Duration> {
    match raw {
        None => Ok(default),
        Some(s) => match parse_duration(s) {
            Some(d) if d.is_zero() => Err(ConfigError::NonPositive {
                field: field.to_string(),
                value: s.to_string(),
            }),
            Some(d) if d > MAX_DURATION => {
                Err(ConfigError::invalid(field, format!("{s:?} exceeds the 24h maximum")))
            }
            Some(d) => Ok(d),
            None => Err(ConfigError::invalid(field, format!("cannot parse duration {s:?}"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_WORKERS: &str = r#"
[cluster]
name = "spark"
image = "bitnami/spark:3.5"

[coordinator]
port = 7077
ui_port = 8080

[[workers]]
name = "w1"
ui_port = 8081
memory_limit = "1G"
core_count = 2

[[workers]]
name = "w2"
ui_port = 8082
memory_limit = "1G"
core_count = 2

[[mounts]]
source = "./data"
target = "/opt/data"
"#;

    fn parse(s: &str) -> TopologyDocument {
        TopologyDocument::parse(s).unwrap()
    }

    #[test]
    fn validates_two_worker_topology() {
        let spec = parse(TWO_WORKERS).validate().unwrap();
        assert_eq!(spec.name, "spark");
        assert_eq!(spec.network, "spark-net");
        assert_eq!(spec.coordinator.name, "coordinator");
        assert_eq!(spec.coordinator.port, 7077);
        assert_eq!(spec.coordinator.ui_port, 8080);
        assert_eq!(spec.workers.len(), 2);
        assert_eq!(spec.workers[0].memory_bytes, 1 << 30);
        assert_eq!(spec.workers[1].core_count, 2);
        assert_eq!(spec.workers[1].image, "bitnami/spark:3.5");
        assert_eq!(spec.mounts[0].target, PathBuf::from("/opt/data"));
        assert_eq!(spec.health.unhealthy_threshold, 3);
    }

    #[test]
    fn minimal_document_uses_defaults() {
        let spec = parse(
            r#"
[cluster]
name = "c"
image = "img"
"#,
        )
        .validate()
        .unwrap();
        assert_eq!(spec.coordinator.port, DEFAULT_COORDINATOR_PORT);
        assert_eq!(spec.coordinator.ui_port, DEFAULT_COORDINATOR_UI_PORT);
        assert!(spec.workers.is_empty());
        assert_eq!(spec.subnet.to_string(), DEFAULT_SUBNET);
        assert_eq!(spec.retry.max_attempts, 5);
    }

    #[test]
    fn duplicate_worker_name_is_rejected() {
        let doc = TWO_WORKERS.replace("name = \"w2\"", "name = \"w1\"");
        let err = parse(&doc).validate().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName { .. }));
        assert_eq!(err.field(), Some("workers[1].name"));
    }

    #[test]
    fn worker_named_like_coordinator_is_rejected() {
        let doc = TWO_WORKERS.replace("name = \"w1\"", "name = \"coordinator\"");
        let err = parse(&doc).validate().unwrap_err();
        assert_eq!(err.field(), Some("workers[0].name"));
    }

    #[test]
    fn ui_port_collision_is_rejected() {
        let doc = TWO_WORKERS.replace("ui_port = 8082", "ui_port = 8081");
        let err = parse(&doc).validate().unwrap_err();
        match err {
            ConfigError::PortCollision { field, port, other } => {
                assert_eq!(field, "workers[1].ui_port");
                assert_eq!(port, 8081);
                assert_eq!(other, "workers[0].ui_port");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn worker_port_colliding_with_coordinator_is_rejected() {
        let doc = TWO_WORKERS.replace("ui_port = 8081", "ui_port = 7077");
        let err = parse(&doc).validate().unwrap_err();
        assert!(err.to_string().contains("coordinator.port"));
    }

    #[test]
    fn negative_resources_are_rejected() {
        let doc = TWO_WORKERS.replacen("core_count = 2", "core_count = -2", 1);
        let err = parse(&doc).validate().unwrap_err();
        assert!(matches!(err, ConfigError::NonPositive { .. }));
        assert_eq!(err.field(), Some("workers[0].core_count"));

        let doc = TWO_WORKERS.replacen("memory_limit = \"1G\"", "memory_limit = \"-1G\"", 1);
        let err = parse(&doc).validate().unwrap_err();
        assert_eq!(err.field(), Some("workers[0].memory_limit"));
    }

    #[test]
    fn relative_mount_target_is_rejected() {
        let doc = TWO_WORKERS.replace("target = \"/opt/data\"", "target = \"opt/data\"");
        let err = parse(&doc).validate().unwrap_err();
        assert_eq!(err.field(), Some("mounts[0].target"));
    }

    #[test]
    fn reserved_env_is_rejected() {
        let doc = format!("{TWO_WORKERS}\n[env]\nMODE = \"worker\"\n");
        let err = parse(&doc).validate().unwrap_err();
        assert_eq!(err.field(), Some("env.MODE"));
    }

    #[test]
    fn missing_image_is_rejected() {
        let doc = TWO_WORKERS.replace("image = \"bitnami/spark:3.5\"", "");
        let err = parse(&doc).validate().unwrap_err();
        assert_eq!(err.field(), Some("coordinator.image"));
    }

    #[test]
    fn bad_durations_and_jitter_are_rejected() {
        let doc = format!("{TWO_WORKERS}\n[health]\ninterval = \"often\"\n");
        let err = parse(&doc).validate().unwrap_err();
        assert_eq!(err.field(), Some("health.interval"));

        let doc = format!("{TWO_WORKERS}\n[lifecycle]\nup_timeout = \"400000000000000000m\"\n");
        let err = parse(&doc).validate().unwrap_err();
        assert_eq!(err.field(), Some("lifecycle.up_timeout"));

        let doc = format!("{TWO_WORKERS}\n[retry]\njitter = 1.5\n");
        let err = parse(&doc).validate().unwrap_err();
        assert_eq!(err.field(), Some("retry.jitter"));
    }

    #[test]
    fn durations_over_a_day_are_rejected() {
        let doc = format!("{TWO_WORKERS}\n[lifecycle]\nup_timeout = \"18446744073709551615s\"\n");
        let err = parse(&doc).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }), "{err}");
        assert_eq!(err.field(), Some("lifecycle.up_timeout"));

        let doc = format!("{TWO_WORKERS}\n[retry]\nmax_delay = \"25h\"\n");
        assert_eq!(parse(&doc).validate().unwrap_err().field(), Some("retry.max_delay"));

        let doc = format!("{TWO_WORKERS}\n[lifecycle]\nup_timeout = \"24h\"\ncommand_timeout = \"90s\"\n");
        let spec = parse(&doc).validate().unwrap();
        assert_eq!(spec.lifecycle.up_timeout, MAX_DURATION);
        assert_eq!(spec.lifecycle.command_timeout, Duration::from_secs(90));
    }

    #[test]
    fn http_probe_takes_path() {
        let doc = format!("{TWO_WORKERS}\n[health]\nprobe = \"http\"\npath = \"/json\"\n");
        let spec = parse(&doc).validate().unwrap();
        assert_eq!(
            spec.health.probe,
            ProbeKind::Http {
                path: "/json".to_string()
            }
        );
    }

    #[test]
    fn scale_down_drops_most_recent_workers() {
        let mut doc = parse(TWO_WORKERS);
        doc.scale_workers(1);
        let spec = doc.validate().unwrap();
        assert_eq!(spec.worker_names().collect::<Vec<_>>(), vec!["w1"]);
    }

    #[test]
    fn scale_up_uses_base_plus_index_ports() {
        let mut doc = parse(TWO_WORKERS);
        doc.scale_workers(4);
        let spec = doc.validate().unwrap();
        assert_eq!(spec.workers.len(), 4);
        assert_eq!(spec.workers[2].name, "worker-3");
        assert_eq!(spec.workers[2].ui_port, 8083);
        assert_eq!(spec.workers[3].name, "worker-4");
        assert_eq!(spec.workers[3].ui_port, 8084);
    }

    #[test]
    fn scale_up_skips_taken_names_and_ports() {
        let mut doc = parse(
            r#"
[cluster]
name = "c"
image = "img"

[[workers]]
name = "worker-2"
ui_port = 8082
"#,
        );
        doc.scale_workers(3);
        let spec = doc.validate().unwrap();
        let names: Vec<_> = spec.worker_names().collect();
        assert_eq!(names, vec!["worker-2", "worker-3", "worker-4"]);
        let ports: Vec<_> = spec.workers.iter().map(|w| w.ui_port).collect();
        assert_eq!(ports, vec![8082, 8083, 8084]);
    }

    #[test]
    fn scaffold_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodegrid.toml");

        let doc = TopologyDocument::scaffold("demo", "bitnami/spark:3.5");
        doc.save(&path).unwrap();

        let spec = TopologyDocument::from_file(&path).unwrap().validate().unwrap();
        assert_eq!(spec.name, "demo");
        assert_eq!(spec.worker_names().collect::<Vec<_>>(), vec!["worker-1", "worker-2"]);
        assert_eq!(spec.workers[1].ui_port, 8082);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = TopologyDocument::from_file(Path::new("/nonexistent/nodegrid.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/nodegrid.toml"));
    }
}
