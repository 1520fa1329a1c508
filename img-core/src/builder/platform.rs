//! Target platform triples for multi-platform builds.
//!
//! A platform is `os/architecture[/variant]`. The CLI accepts any number of
//! `--platform` flags, each of which may itself be a comma-separated list;
//! the resulting set is the de-duplicated union in first-seen order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single build target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Error returned for malformed platform strings.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid platform {value:?}: {reason}")]
pub struct PlatformParseError {
    pub value: String,
    pub reason: String,
}

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        let (architecture, variant) = normalize_arch(architecture, variant);
        Self { os: os.to_ascii_lowercase(), architecture, variant }
    }

    /// The default build target: linux on the host's architecture.
    ///
    /// Images are always linux images, even when the builder runs on macOS.
    pub fn host() -> Self {
        Self::new("linux", std::env::consts::ARCH, None)
    }

    /// Returns true if an image index entry for `other` can serve this platform.
    ///
    /// A missing variant on either side matches any variant.
    pub fn matches(&self, other: &Platform) -> bool {
        if self.os != other.os || self.architecture != other.architecture {
            return false;
        }
        match (&self.variant, &other.variant) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Maps architecture aliases onto their OCI names.
fn normalize_arch(arch: &str, variant: Option<&str>) -> (String, Option<String>) {
    let arch = arch.to_ascii_lowercase();
    let variant = variant.map(|v| v.to_ascii_lowercase());
    match arch.as_str() {
        "x86_64" | "x86-64" | "amd64" => ("amd64".to_string(), None),
        "aarch64" | "arm64" => match variant.as_deref() {
            // arm64/v8 is the only arm64 variant in practice.
            None | Some("v8") | Some("8") => ("arm64".to_string(), None),
            Some(_) => ("arm64".to_string(), variant),
        },
        "armhf" => ("arm".to_string(), Some("v7".to_string())),
        "armel" => ("arm".to_string(), Some("v6".to_string())),
        "i386" | "i686" | "x86" => ("386".to_string(), None),
        _ => (arch, variant),
    }
}

impl FromStr for Platform {
    type Err = PlatformParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        let err = |reason: &str| PlatformParseError { value: s.to_string(), reason: reason.into() };

        if value.is_empty() {
            return Err(err("empty platform"));
        }

        let parts: Vec<&str> = value.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(err("empty path component"));
        }

        match parts.as_slice() {
            // A bare architecture ("amd64") implies linux.
            [arch] => Ok(Self::new("linux", arch, None)),
            [os, arch] => Ok(Self::new(os, arch, None)),
            [os, arch, variant] => Ok(Self::new(os, arch, Some(variant))),
            _ => Err(err("expected os/arch[/variant]")),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Parses every `--platform` occurrence into one ordered, de-duplicated set.
///
/// An empty input yields the host platform.
pub fn parse_platforms<S: AsRef<str>>(values: &[S]) -> Result<Vec<Platform>, PlatformParseError> {
    let mut platforms: Vec<Platform> = Vec::new();

    for value in values {
        for item in value.as_ref().split(',') {
            if item.trim().is_empty() {
                continue;
            }
            let platform: Platform = item.parse()?;
            if !platforms.contains(&platform) {
                platforms.push(platform);
            }
        }
    }

    if platforms.is_empty() {
        platforms.push(Platform::host());
    }

    Ok(platforms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_arch_defaults_to_linux() {
        let p: Platform = "amd64".parse().unwrap();
        assert_eq!(p.to_string(), "linux/amd64");
    }

    #[test]
    fn test_variant_preserved() {
        let p: Platform = "linux/arm/v7".parse().unwrap();
        assert_eq!(p.architecture, "arm");
        assert_eq!(p.variant.as_deref(), Some("v7"));
        assert_eq!(p.to_string(), "linux/arm/v7");
    }

    #[test]
    fn test_aliases_normalize() {
        assert_eq!("linux/x86_64".parse::<Platform>().unwrap().architecture, "amd64");
        assert_eq!("linux/aarch64".parse::<Platform>().unwrap().to_string(), "linux/arm64");
        assert_eq!("linux/arm64/v8".parse::<Platform>().unwrap().to_string(), "linux/arm64");
    }

    #[test]
    fn test_union_of_flags_with_comma_lists() {
        let platforms =
            parse_platforms(&["amd64", "linux/arm64,linux/arm/v7", "linux/amd64"]).unwrap();
        let names: Vec<String> = platforms.iter().map(|p| p.to_string()).collect();
        assert_eq!(names, vec!["linux/amd64", "linux/arm64", "linux/arm/v7"]);
    }

    #[test]
    fn test_empty_means_host() {
        let platforms = parse_platforms::<&str>(&[]).unwrap();
        assert_eq!(platforms, vec![Platform::host()]);
    }

    #[test]
    fn test_invalid_platform() {
        assert!("linux//amd64".parse::<Platform>().is_err());
        assert!("a/b/c/d".parse::<Platform>().is_err());
    }

    #[test]
    fn test_matches_ignores_missing_variant() {
        let want: Platform = "linux/arm".parse().unwrap();
        let have: Platform = "linux/arm/v7".parse().unwrap();
        assert!(want.matches(&have));
        assert!(!have.matches(&"linux/arm/v6".parse().unwrap()));
    }
}
