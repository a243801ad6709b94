//! Host platform detection and provider selection.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleet_core::ProviderError;

use crate::runtime_cache::ClientRuntimeConfig;

use super::kubeadm::RetryPolicy;
use super::linux::LinuxProvider;
use super::runner::{quote, CommandRunner};
use super::{CapabilityProvider, UnimplementedProvider};

/// `(vendor, major version)` as read from os-release.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    pub vendor: String,
    pub major: String,
}

impl Platform {
    pub fn new(vendor: impl Into<String>, major: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            major: major.into(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.vendor, self.major)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Yum,
    Dnf,
    Apt,
}

impl PackageManager {
    pub fn install(&self, packages: &[String]) -> String {
        let list = word_list(packages);
        match self {
            PackageManager::Yum => format!("yum install -y {list}"),
            PackageManager::Dnf => format!("dnf install -y {list}"),
            PackageManager::Apt => {
                format!("apt-get update -q && DEBIAN_FRONTEND=noninteractive apt-get install -y {list}")
            }
        }
    }

    pub fn remove(&self, packages: &[String]) -> String {
        let list = word_list(packages);
        match self {
            PackageManager::Yum => format!("yum remove -y {list}"),
            PackageManager::Dnf => format!("dnf remove -y {list}"),
            PackageManager::Apt => format!("DEBIAN_FRONTEND=noninteractive apt-get purge -y {list}"),
        }
    }

    /// Fetch a package file into `dir` without installing it.
    pub fn download(&self, package: &str, dir: &str) -> String {
        let (package, dir) = (quote(package), quote(dir));
        match self {
            PackageManager::Yum => {
                format!("yum install -y --downloadonly --downloaddir={dir} {package}")
            }
            PackageManager::Dnf => format!("dnf download --resolve --destdir={dir} {package}"),
            PackageManager::Apt => format!("cd {dir} && apt-get download {package}"),
        }
    }

    /// Package name with a pinned version, in this manager's syntax.
    pub fn pinned(&self, package: &str, version: &str) -> String {
        if version.is_empty() {
            return package.to_string();
        }
        match self {
            PackageManager::Yum | PackageManager::Dnf => format!("{package}-{version}"),
            PackageManager::Apt => format!("{package}={version}*"),
        }
    }
}

fn word_list(words: &[String]) -> String {
    words
        .iter()
        .map(|w| quote(w))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy)]
enum Support {
    Supported(PackageManager),
    Experimental,
}

const PLATFORMS: &[(&str, &str, Support)] = &[
    ("centos", "7", Support::Supported(PackageManager::Yum)),
    ("centos", "8", Support::Supported(PackageManager::Dnf)),
    ("rocky", "8", Support::Supported(PackageManager::Dnf)),
    ("rocky", "9", Support::Supported(PackageManager::Dnf)),
    ("kylin", "10", Support::Supported(PackageManager::Yum)),
    ("ubuntu", "20", Support::Supported(PackageManager::Apt)),
    ("ubuntu", "22", Support::Supported(PackageManager::Apt)),
    ("ubuntu", "24", Support::Experimental),
];

/// Parse `ID` and the major part of `VERSION_ID` from os-release text.
pub fn parse_os_release(text: &str) -> Option<Platform> {
    let mut vendor = None;
    let mut version = None;
    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'');
        match key {
            "ID" => vendor = Some(value.to_ascii_lowercase()),
            "VERSION_ID" => version = Some(value.to_string()),
            _ => {}
        }
    }
    let major = version?.split('.').next()?.to_string();
    Some(Platform::new(vendor?, major))
}

pub fn detect(os_release: &Path) -> Result<Platform, ProviderError> {
    let text = std::fs::read_to_string(os_release).map_err(|source| ProviderError::Io {
        path: os_release.display().to_string(),
        source,
    })?;
    parse_os_release(&text).ok_or_else(|| ProviderError::UnsupportedPlatform {
        vendor: "unknown".into(),
        version: "unknown".into(),
    })
}

/// Settings every concrete provider needs.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub retry: RetryPolicy,
    pub command_timeout: Option<std::time::Duration>,
    /// Filesystem root for every file the provider writes. `/` in production.
    pub root: PathBuf,
}

impl ProviderSettings {
    /// Settings for the agent described by `runtime`, writing under `root`.
    pub fn from_runtime(runtime: &ClientRuntimeConfig, root: impl Into<PathBuf>) -> Self {
        Self {
            retry: RetryPolicy {
                attempts: runtime.kubeadm_attempts.max(1),
                backoff: runtime.kubeadm_backoff,
            },
            command_timeout: runtime.command_timeout,
            root: root.into(),
        }
    }
}

/// Pick the provider for `platform`.
pub fn resolve(
    platform: &Platform,
    runner: Arc<dyn CommandRunner>,
    settings: ProviderSettings,
) -> Result<Arc<dyn CapabilityProvider>, ProviderError> {
    let support = PLATFORMS
        .iter()
        .find(|(vendor, major, _)| *vendor == platform.vendor && *major == platform.major)
        .map(|(_, _, support)| *support)
        .ok_or_else(|| ProviderError::UnsupportedPlatform {
            vendor: platform.vendor.clone(),
            version: platform.major.clone(),
        })?;

    Ok(match support {
        Support::Supported(packages) => Arc::new(LinuxProvider::new(
            platform.clone(),
            packages,
            runner,
            settings,
        )),
        Support::Experimental => {
            tracing::warn!(%platform, "platform support is experimental");
            Arc::new(UnimplementedProvider::new(platform.clone()))
        }
    })
}
