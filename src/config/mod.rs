mod file_config;

pub use file_config::{FileConfig, GitHubFileConfig};

use crate::server::RequestsLoggingLevel;
use crate::storage::GitHubConfig;
use anyhow::Result;
use clap::ValueEnum;
use std::path::PathBuf;

pub const DEFAULT_GITHUB_BRANCH: &str = "main";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub downloads_dir: PathBuf,
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub frontend_dir_path: Option<String>,
    pub max_concurrent_jobs: usize,
}

/// Settings read from the process environment.
///
/// Secrets only live here; the config file never carries them.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub github_token: Option<String>,
    pub github_repo: Option<String>,
    pub github_branch: Option<String>,
    pub kie_api_key: Option<String>,
    pub public_base_url: Option<String>,
    pub port: Option<u16>,
}

fn non_empty(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl EnvConfig {
    pub fn load() -> Self {
        Self {
            github_token: non_empty("GITHUB_TOKEN"),
            github_repo: non_empty("GITHUB_REPO"),
            github_branch: non_empty("GITHUB_BRANCH"),
            kie_api_key: non_empty("KIE_API_KEY"),
            public_base_url: non_empty("PUBLIC_BASE_URL"),
            port: non_empty("PORT").and_then(|v| v.parse().ok()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub downloads_dir: PathBuf,
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub frontend_dir_path: Option<String>,
    pub max_concurrent_jobs: usize,
    pub public_base_url: Option<String>,
    pub github_repo: Option<String>,
    pub github_branch: String,
    pub github_token: Option<String>,
    pub kie_api_key: Option<String>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments, optional TOML file
    /// config and the environment. Environment beats TOML beats CLI.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>, env: &EnvConfig) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let downloads_dir = file
            .downloads_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| cli.downloads_dir.clone());

        let port = env.port.or(file.port).unwrap_or(cli.port);

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let frontend_dir_path = file
            .frontend_dir_path
            .or_else(|| cli.frontend_dir_path.clone());

        let max_concurrent_jobs = file
            .max_concurrent_jobs
            .unwrap_or(cli.max_concurrent_jobs)
            .max(1);

        let public_base_url = env
            .public_base_url
            .clone()
            .or(file.public_base_url);

        let github_file = file.github.unwrap_or_default();
        let github_repo = env.github_repo.clone().or(github_file.repo);
        let github_branch = env
            .github_branch
            .clone()
            .or(github_file.branch)
            .unwrap_or_else(|| DEFAULT_GITHUB_BRANCH.to_string());

        Ok(Self {
            downloads_dir,
            port,
            logging_level,
            frontend_dir_path,
            max_concurrent_jobs,
            public_base_url,
            github_repo,
            github_branch,
            github_token: env.github_token.clone(),
            kie_api_key: env.kie_api_key.clone(),
        })
    }

    /// Remote storage settings, present only when both the token and
    /// the repository are configured.
    pub fn github_config(&self) -> Option<GitHubConfig> {
        match (&self.github_token, &self.github_repo) {
            (Some(token), Some(repo)) => Some(GitHubConfig {
                token: token.clone(),
                repo: repo.clone(),
                branch: self.github_branch.clone(),
            }),
            _ => None,
        }
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> CliConfig {
        CliConfig {
            downloads_dir: PathBuf::from("/cli/downloads"),
            port: 8080,
            logging_level: RequestsLoggingLevel::Path,
            frontend_dir_path: None,
            max_concurrent_jobs: 2,
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let config = AppConfig::resolve(&cli(), None, &EnvConfig::default()).unwrap();
        assert_eq!(config.downloads_dir, PathBuf::from("/cli/downloads"));
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.github_branch, "main");
        assert!(config.github_config().is_none());
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let file = FileConfig {
            downloads_dir: Some("/toml/downloads".to_string()),
            port: Some(9000),
            logging_level: Some("headers".to_string()),
            max_concurrent_jobs: Some(4),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli(), Some(file), &EnvConfig::default()).unwrap();
        assert_eq!(config.downloads_dir, PathBuf::from("/toml/downloads"));
        assert_eq!(config.port, 9000);
        assert_eq!(config.logging_level, RequestsLoggingLevel::Headers);
        assert_eq!(config.max_concurrent_jobs, 4);
    }

    #[test]
    fn test_resolve_env_beats_toml() {
        let file = FileConfig {
            port: Some(9000),
            public_base_url: Some("https://file.example.com".to_string()),
            ..Default::default()
        };
        let env = EnvConfig {
            port: Some(9100),
            public_base_url: Some("https://env.example.com".to_string()),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli(), Some(file), &env).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(
            config.public_base_url.as_deref(),
            Some("https://env.example.com")
        );
    }

    #[test]
    fn test_github_config_needs_token_and_repo() {
        let env = EnvConfig {
            github_token: Some("tok".to_string()),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli(), None, &env).unwrap();
        assert!(config.github_config().is_none());

        let env = EnvConfig {
            github_token: Some("tok".to_string()),
            github_repo: Some("owner/beats".to_string()),
            github_branch: Some("mirror".to_string()),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli(), None, &env).unwrap();
        let github = config.github_config().unwrap();
        assert_eq!(github.repo, "owner/beats");
        assert_eq!(github.branch, "mirror");
    }

    #[test]
    fn test_zero_job_slots_is_clamped() {
        let file = FileConfig {
            max_concurrent_jobs: Some(0),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli(), Some(file), &EnvConfig::default()).unwrap();
        assert_eq!(config.max_concurrent_jobs, 1);
    }

    #[test]
    fn test_parse_logging_level() {
        assert!(matches!(
            parse_logging_level("none"),
            Some(RequestsLoggingLevel::None)
        ));
        assert!(matches!(
            parse_logging_level("PATH"),
            Some(RequestsLoggingLevel::Path)
        ));
        assert!(parse_logging_level("invalid").is_none());
    }
}
