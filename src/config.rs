use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Connection parameters for one saved cluster.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClusterPreferences {
    pub name: String,
    #[serde(default)]
    pub kubeconfig: Option<KubeconfigRef>,
    #[serde(default)]
    pub in_cluster: bool,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct KubeconfigRef {
    pub path: PathBuf,
    #[serde(default)]
    pub context: Option<String>,
}

impl ClusterPreferences {
    pub fn validate(&self) -> Result<()> {
        if self.in_cluster && self.kubeconfig.is_some() {
            anyhow::bail!(
                "cluster '{}' sets both in_cluster and kubeconfig; pick one",
                self.name
            );
        }
        if let Some(kubeconfig) = &self.kubeconfig
            && kubeconfig.path.as_os_str().is_empty()
        {
            anyhow::bail!("cluster '{}' has an empty kubeconfig path", self.name);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct WatchTuning {
    /// Pause before reopening a watch whose stream ended.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_recent_watches")]
    pub recent_watches: usize,
}

impl Default for WatchTuning {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
            recent_watches: default_recent_watches(),
        }
    }
}

impl WatchTuning {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub clusters: Vec<ClusterPreferences>,
    #[serde(default)]
    pub watch: WatchTuning,
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Preferences {
    pub fn load() -> Result<Self> {
        match discover_config_path() {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: PathBuf) -> Result<Self> {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read preferences {}", path.display()))?;
        let mut parsed = Self::parse(&raw)
            .with_context(|| format!("failed to parse preferences {}", path.display()))?;
        parsed.source = Some(path);
        Ok(parsed)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let parsed: Self = serde_yaml::from_str(raw)?;
        for cluster in &parsed.clusters {
            cluster.validate()?;
        }
        Ok(parsed)
    }

    pub fn find_cluster(&self, name: &str) -> Option<&ClusterPreferences> {
        self.clusters
            .iter()
            .find(|cluster| cluster.name.eq_ignore_ascii_case(name.trim()))
    }
}

fn default_restart_delay_ms() -> u64 {
    1_000
}

fn default_recent_watches() -> usize {
    4
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("PETREL_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("petrel.yaml"),
        PathBuf::from("petrel.yml"),
        PathBuf::from(".petrel.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/petrel/config.yaml"),
            PathBuf::from(&home).join(".config/petrel/config.yml"),
            PathBuf::from(&home).join(".petrel.yaml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}
