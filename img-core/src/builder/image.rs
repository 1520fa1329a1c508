//! Image configuration and OCI document types.
//!
//! [`ImageConfig`] is the builder's view of runtime metadata. It converts to
//! and from the OCI image config JSON; manifests and indexes are plain serde
//! types following the OCI image spec.

use crate::builder::parser::{HealthcheckConfig, RunCommand, StageConfig};
use crate::builder::platform::Platform;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Annotation carrying the image name in an index.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// A layer blob: an uncompressed tar delta.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerRef {
    pub digest: String,
    pub size: u64,
}

/// Ordered layers of a root filesystem, lowest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    pub layers: Vec<LayerRef>,
}

impl RootFs {
    /// This filesystem with `layer` on top.
    pub fn with_layer(&self, layer: LayerRef) -> Self {
        let mut layers = self.layers.clone();
        layers.push(layer);
        Self { layers }
    }

    pub fn size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Runtime metadata of an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub exposed_ports: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
    pub stop_signal: Option<String>,
    pub healthcheck: Option<OciHealthcheck>,
}

impl ImageConfig {
    /// Layers a stage's metadata over the config of its base image.
    pub fn from_stage(base: &ImageConfig, stage: &StageConfig) -> Self {
        let shell = stage.shell();
        let argv = |command: &RunCommand| command.to_argv(&shell);

        let mut env = base.env.clone();
        env.extend(stage.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut labels = base.labels.clone();
        labels.extend(stage.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        // Setting an entrypoint drops the CMD inherited from the base image.
        let (entrypoint, cmd) = match &stage.entrypoint {
            Some(entrypoint) => (Some(argv(entrypoint)), stage.cmd.as_ref().map(argv)),
            None => (base.entrypoint.clone(), stage.cmd.as_ref().map(argv).or_else(|| base.cmd.clone())),
        };

        Self {
            entrypoint,
            cmd,
            env,
            workdir: stage.workdir.clone().or_else(|| base.workdir.clone()),
            user: stage.user.clone().or_else(|| base.user.clone()),
            exposed_ports: base.exposed_ports.union(&stage.exposed_ports).cloned().collect(),
            volumes: base.volumes.union(&stage.volumes).cloned().collect(),
            labels,
            stop_signal: stage.stop_signal.clone().or_else(|| base.stop_signal.clone()),
            healthcheck: match &stage.healthcheck {
                Some(check) => Some(OciHealthcheck::from_config(check, &shell)),
                None => base.healthcheck.clone(),
            },
        }
    }

    /// Environment as `KEY=VALUE` strings.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    /// Converts to the OCI config document.
    pub fn to_oci(&self, platform: &Platform, rootfs: &RootFs, created: &str) -> OciImageConfig {
        let exposed_ports = self
            .exposed_ports
            .iter()
            .flat_map(|value| value.split_whitespace())
            .map(|port| {
                let key = if port.contains('/') { port.to_string() } else { format!("{}/tcp", port) };
                (key, EmptyObject {})
            })
            .collect::<BTreeMap<_, _>>();

        OciImageConfig {
            created: Some(created.to_string()),
            architecture: platform.architecture.clone(),
            os: platform.os.clone(),
            variant: platform.variant.clone(),
            config: OciRuntimeConfig {
                user: self.user.clone(),
                env: Some(self.env_list()).filter(|e| !e.is_empty()),
                entrypoint: self.entrypoint.clone(),
                cmd: self.cmd.clone(),
                working_dir: self.workdir.clone(),
                exposed_ports: Some(exposed_ports).filter(|p| !p.is_empty()),
                volumes: Some(self.volumes.iter().map(|v| (v.clone(), EmptyObject {})).collect::<BTreeMap<_, _>>())
                    .filter(|v| !v.is_empty()),
                labels: Some(self.labels.clone()).filter(|l| !l.is_empty()),
                stop_signal: self.stop_signal.clone(),
                healthcheck: self.healthcheck.clone(),
            },
            rootfs: OciRootFs {
                kind: "layers".to_string(),
                diff_ids: rootfs.layers.iter().map(|l| l.digest.clone()).collect(),
            },
        }
    }

    /// Reads the runtime part of an OCI config document.
    pub fn from_oci(config: &OciImageConfig) -> Self {
        let runtime = &config.config;
        Self {
            entrypoint: runtime.entrypoint.clone(),
            cmd: runtime.cmd.clone(),
            env: runtime
                .env
                .iter()
                .flatten()
                .filter_map(|item| item.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            workdir: runtime.working_dir.clone().filter(|w| !w.is_empty()),
            user: runtime.user.clone().filter(|u| !u.is_empty()),
            exposed_ports: runtime.exposed_ports.iter().flatten().map(|(k, _)| k.clone()).collect(),
            volumes: runtime.volumes.iter().flatten().map(|(k, _)| k.clone()).collect(),
            labels: runtime.labels.clone().unwrap_or_default(),
            stop_signal: runtime.stop_signal.clone(),
            healthcheck: runtime.healthcheck.clone(),
        }
    }
}

/// `{}` in OCI port and volume maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// OCI image config (`application/vnd.oci.image.config.v1+json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OciImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default)]
    pub config: OciRuntimeConfig,
    pub rootfs: OciRootFs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OciRuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, EmptyObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, EmptyObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<OciHealthcheck>,
}

/// Docker healthcheck extension of the runtime config. Durations are nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OciHealthcheck {
    pub test: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl OciHealthcheck {
    fn from_config(config: &HealthcheckConfig, shell: &[String]) -> Self {
        let test = match &config.command {
            RunCommand::Shell(cmd) => vec!["CMD-SHELL".to_string(), cmd.clone()],
            RunCommand::Exec(_) => {
                let mut test = vec!["CMD".to_string()];
                test.extend(config.command.to_argv(shell));
                test
            }
        };
        Self {
            test,
            interval: config.interval.as_deref().and_then(parse_duration_ns),
            timeout: config.timeout.as_deref().and_then(parse_duration_ns),
            start_period: config.start_period.as_deref().and_then(parse_duration_ns),
            retries: config.retries,
        }
    }
}

/// Parses Go-style durations such as `30s`, `1m30s` or `500ms` into nanoseconds.
pub fn parse_duration_ns(value: &str) -> Option<u64> {
    let mut total: u64 = 0;
    let mut rest = value.trim();
    if rest.is_empty() {
        return None;
    }

    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let amount: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let factor: u64 = match &rest[..unit_len] {
            "ns" => 1,
            "us" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total = total.checked_add(amount.checked_mul(factor)?)?;
    }

    Some(total)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciRootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

/// Platform object of an index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciPlatform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl From<&Platform> for OciPlatform {
    fn from(p: &Platform) -> Self {
        Self { architecture: p.architecture.clone(), os: p.os.clone(), variant: p.variant.clone() }
    }
}

impl From<&OciPlatform> for Platform {
    fn from(p: &OciPlatform) -> Self {
        Platform::new(&p.os, &p.architecture, p.variant.as_deref())
    }
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<OciPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: String, size: u64) -> Self {
        Self { media_type: media_type.to_string(), digest, size, platform: None, annotations: None }
    }
}

/// OCI image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self { schema_version: 2, media_type: Some(MEDIA_TYPE_MANIFEST.to_string()), config, layers }
    }
}

/// OCI image index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self { schema_version: 2, media_type: Some(MEDIA_TYPE_INDEX.to_string()), manifests }
    }
}
