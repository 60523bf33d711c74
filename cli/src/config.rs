use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use humantime::parse_duration;
use pointer_codenav::CodeNavConfig;
use pointer_codenav::db::models::RepositoryId;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub global: GlobalConfig,
    pub codenav: CodeNavConfig,
    pub repos: Vec<RepoConfig>,
}

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub git_bin: String,
}

/// Local checkout used to diff files of one repository.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    pub id: RepositoryId,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    global: RawGlobalConfig,
    #[serde(default)]
    codenav: RawCodeNavConfig,
    #[serde(rename = "repo", default)]
    repos: Vec<RawRepoConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGlobalConfig {
    git_bin: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCodeNavConfig {
    default_page_limit: Option<usize>,
    max_page_limit: Option<usize>,
    max_indexes_per_moniker_search: Option<usize>,
    bulk_lookup_ceiling: Option<usize>,
    upload_cache_capacity: Option<usize>,
    request_timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRepoConfig {
    id: RepositoryId,
    name: Option<String>,
    path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            global: GlobalConfig {
                git_bin: "git".to_string(),
            },
            codenav: CodeNavConfig::default(),
            repos: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;

        let parsed: FileConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse TOML {}", path.display()))?;

        Self::from_raw(parsed)
    }

    fn from_raw(raw: FileConfig) -> Result<Self> {
        let defaults = CodeNavConfig::default();
        let nav = raw.codenav;

        let request_timeout = nav
            .request_timeout
            .as_deref()
            .map(|value| parse_duration_string(value, "codenav.request_timeout"))
            .transpose()?;

        let codenav = CodeNavConfig {
            default_page_limit: positive(
                nav.default_page_limit,
                defaults.default_page_limit,
                "codenav.default_page_limit",
            )?,
            max_page_limit: positive(
                nav.max_page_limit,
                defaults.max_page_limit,
                "codenav.max_page_limit",
            )?,
            max_indexes_per_moniker_search: positive(
                nav.max_indexes_per_moniker_search,
                defaults.max_indexes_per_moniker_search,
                "codenav.max_indexes_per_moniker_search",
            )?,
            bulk_lookup_ceiling: positive(
                nav.bulk_lookup_ceiling,
                defaults.bulk_lookup_ceiling,
                "codenav.bulk_lookup_ceiling",
            )?,
            upload_cache_capacity: positive(
                nav.upload_cache_capacity,
                defaults.upload_cache_capacity,
                "codenav.upload_cache_capacity",
            )?,
            request_timeout,
        };

        let git_bin = raw.global.git_bin.unwrap_or_else(|| "git".to_string());
        if git_bin.trim().is_empty() {
            bail!("global.git_bin must not be empty");
        }

        let repos = raw
            .repos
            .into_iter()
            .map(|repo| RepoConfig {
                name: repo.name.unwrap_or_else(|| format!("repo-{}", repo.id)),
                id: repo.id,
                path: repo.path,
            })
            .collect();

        let cfg = Self {
            global: GlobalConfig { git_bin },
            codenav,
            repos,
        };
        cfg.validate_config()?;
        Ok(cfg)
    }

    pub fn validate_config(&self) -> Result<()> {
        if self.codenav.default_page_limit > self.codenav.max_page_limit {
            bail!(
                "codenav.default_page_limit ({}) must not exceed codenav.max_page_limit ({})",
                self.codenav.default_page_limit,
                self.codenav.max_page_limit
            );
        }

        let mut seen = HashSet::new();
        for repo in &self.repos {
            if repo.path.as_os_str().is_empty() {
                bail!("repo '{}' must define a path", repo.name);
            }
            if !seen.insert(repo.id) {
                bail!("repository id {} is configured more than once", repo.id);
            }
        }

        Ok(())
    }

    pub fn repo_dirs(&self) -> HashMap<RepositoryId, PathBuf> {
        self.repos
            .iter()
            .map(|repo| (repo.id, repo.path.clone()))
            .collect()
    }
}

fn positive(value: Option<usize>, default: usize, field: &str) -> Result<usize> {
    match value {
        Some(0) => Err(anyhow!("{field} must be greater than zero")),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

fn parse_duration_string(value: &str, field: &str) -> Result<Duration> {
    let duration = parse_duration(value)
        .with_context(|| format!("invalid duration for {field}: '{value}'"))?;

    if duration.is_zero() {
        return Err(anyhow!("duration for {field} must be greater than zero"));
    }

    Ok(duration)
}
