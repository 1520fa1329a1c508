//! Grammar for the build options handed over by the CLI.
//!
//! Covers `--secret`, `--ssh`, `-o/--output`, `--label` and `--build-arg`.
//! Parsing only checks syntax; sink contract rules live in the exporter.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Error for malformed option values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid {option} value {value:?}: {reason}")]
pub struct OptionError {
    pub option: &'static str,
    pub value: String,
    pub reason: String,
}

impl OptionError {
    fn new(option: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self { option, value: value.to_string(), reason: reason.into() }
    }
}

/// Splits `k=v,k2=v2` into ordered pairs. Items without `=` map to an empty value.
fn split_fields(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (item.to_string(), String::new()),
        })
        .collect()
}

/// `--secret id=<id>,src=<path>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSpec {
    pub id: String,
    pub source: PathBuf,
}

impl FromStr for SecretSpec {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = None;
        let mut source = None;

        for (key, value) in split_fields(s) {
            match key.as_str() {
                "id" => id = Some(value),
                "src" | "source" => source = Some(PathBuf::from(value)),
                "type" if value == "file" => {}
                _ => return Err(OptionError::new("--secret", s, format!("unknown field {}", key))),
            }
        }

        let id = id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| OptionError::new("--secret", s, "missing id"))?;
        let source = source.ok_or_else(|| OptionError::new("--secret", s, "missing src"))?;

        Ok(Self { id, source })
    }
}

/// `--ssh id=<id>[,key=<path>]`, or the short form `<id>[=<path>[,<path>...]]`.
///
/// No key paths means "forward the ambient agent" (`$SSH_AUTH_SOCK`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSpec {
    pub id: String,
    pub paths: Vec<PathBuf>,
}

impl FromStr for SshSpec {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = split_fields(s);
        if fields.is_empty() {
            return Err(OptionError::new("--ssh", s, "empty value"));
        }

        if fields.iter().any(|(k, _)| k == "id") {
            let mut id = String::new();
            let mut paths = Vec::new();
            for (key, value) in fields {
                match key.as_str() {
                    "id" => id = value,
                    "key" | "src" | "source" => paths.push(PathBuf::from(value)),
                    _ => return Err(OptionError::new("--ssh", s, format!("unknown field {}", key))),
                }
            }
            if id.is_empty() {
                return Err(OptionError::new("--ssh", s, "missing id"));
            }
            return Ok(Self { id, paths });
        }

        // Short form: the first key is the id, every value is a key path.
        let mut iter = fields.into_iter();
        let (id, first) = iter.next().ok_or_else(|| OptionError::new("--ssh", s, "empty value"))?;
        let mut paths: Vec<PathBuf> = Vec::new();
        if !first.is_empty() {
            paths.push(first.into());
        }
        for (key, value) in iter {
            // Extra comma items are bare paths, which split_fields reports as keys.
            if !value.is_empty() {
                return Err(OptionError::new("--ssh", s, "unexpected key=value after id"));
            }
            paths.push(key.into());
        }

        Ok(Self { id, paths })
    }
}

/// Sink kinds for `-o type=<kind>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// Unpack the final filesystem into a directory.
    Local,
    /// Stream the final filesystem as a tar archive.
    Tar,
    /// OCI image layout.
    Oci,
    /// docker-save archive.
    Docker,
    /// Register in the local image store.
    Image,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Local => "local",
            OutputKind::Tar => "tar",
            OutputKind::Oci => "oci",
            OutputKind::Docker => "docker",
            OutputKind::Image => "image",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputKind {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(OutputKind::Local),
            "tar" => Ok(OutputKind::Tar),
            "oci" => Ok(OutputKind::Oci),
            "docker" => Ok(OutputKind::Docker),
            "image" => Ok(OutputKind::Image),
            _ => Err(OptionError::new("--output", s, "unknown output type")),
        }
    }
}

/// Layer compression for archive sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Gzip,
    Uncompressed,
}

/// `-o type=<kind>[,dest=<path>][,name=<value>][,compression=<c>]`
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub kind: OutputKind,
    pub dest: Option<PathBuf>,
    pub names: Vec<String>,
    pub compression: Option<Compression>,
}

impl OutputSpec {
    /// The default sink: register the image under the given tags.
    pub fn image(names: Vec<String>) -> Self {
        Self { kind: OutputKind::Image, dest: None, names, compression: None }
    }

    /// True when the destination means standard output.
    pub fn is_stdout(&self) -> bool {
        match &self.dest {
            None => true,
            Some(path) => path.as_os_str() == "-",
        }
    }
}

impl FromStr for OutputSpec {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut kind = None;
        let mut dest = None;
        let mut names = Vec::new();
        let mut compression = None;

        for (key, value) in split_fields(s) {
            match key.as_str() {
                "type" => kind = Some(value.parse::<OutputKind>()?),
                "dest" => dest = Some(PathBuf::from(value)),
                "name" => names.push(value),
                "compression" => {
                    compression = Some(match value.as_str() {
                        "gzip" => Compression::Gzip,
                        "uncompressed" => Compression::Uncompressed,
                        _ => {
                            return Err(OptionError::new("--output", s, "unknown compression"));
                        }
                    })
                }
                _ => return Err(OptionError::new("--output", s, format!("unknown field {}", key))),
            }
        }

        let kind = kind.ok_or_else(|| OptionError::new("--output", s, "missing type"))?;
        Ok(Self { kind, dest, names, compression })
    }
}

/// Parses `KEY=VALUE` items (labels, build args) into a map. Later keys win.
///
/// A bare `KEY` takes its value from `fallback`, and is skipped when the
/// fallback has none.
pub fn parse_key_values<F>(
    option: &'static str,
    items: &[String],
    fallback: F,
) -> Result<BTreeMap<String, String>, OptionError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut map = BTreeMap::new();
    for item in items {
        match item.split_once('=') {
            Some((key, _)) if key.trim().is_empty() => {
                return Err(OptionError::new(option, item, "empty key"));
            }
            Some((key, value)) => {
                map.insert(key.trim().to_string(), value.to_string());
            }
            None => {
                if let Some(value) = fallback(item.trim()) {
                    map.insert(item.trim().to_string(), value);
                }
            }
        }
    }
    Ok(map)
}
