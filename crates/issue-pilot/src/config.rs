//! Run configuration: secrets from the environment, tunables from an optional TOML file.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variables (`GITHUB_API_URL`, `PILOT_MODEL`, ...)
//! 2. Values in the settings file passed with `--config`
//! 3. Built-in defaults
//!
//! The three required variables are checked together so one failed CI run
//! reports every missing name at once.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::PilotError;

const ENV_TRACKER_TOKEN: &str = "GITHUB_TOKEN";
const ENV_MODEL_TOKEN: &str = "OPENAI_API_KEY";
const ENV_REPOSITORY: &str = "GITHUB_REPOSITORY";
const ENV_TRACKER_API_URL: &str = "GITHUB_API_URL";
const ENV_MODEL_API_URL: &str = "PILOT_MODEL_API_URL";
const ENV_MODEL: &str = "PILOT_MODEL";

const DEFAULT_TRACKER_API_URL: &str = "https://api.github.com";
const DEFAULT_MODEL_API_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-5.2";
const DEFAULT_WORK_LABEL: &str = "agent";
const DEFAULT_LOCK_LABEL: &str = "agent-in-progress";
const DEFAULT_BASE_BRANCH: &str = "main";
const DEFAULT_REMOTE: &str = "origin";
const DEFAULT_PAGE_SIZE: u32 = 50;
const DEFAULT_MAX_ATTEMPTS: u32 = 8;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 90;
const DEFAULT_MAX_JITTER_MS: u64 = 2_000;
const DEFAULT_GIT_USER_NAME: &str = "issue-pilot";
const DEFAULT_GIT_USER_EMAIL: &str = "issue-pilot@users.noreply.github.com";

/// Connect/read timeout for every tracker call.
pub const TRACKER_TIMEOUT: Duration = Duration::from_secs(60);
/// Connect/read timeout for the model call.
pub const MODEL_TIMEOUT: Duration = Duration::from_secs(180);

/// Non-secret tunables read from the `--config` file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSettings {
    pub work_label: Option<String>,
    pub lock_label: Option<String>,
    pub base_branch: Option<String>,
    pub remote: Option<String>,
    pub page_size: Option<u32>,
    pub model: Option<String>,
    pub max_attempts: Option<u32>,
    pub max_backoff_secs: Option<u64>,
    pub max_jitter_ms: Option<u64>,
    pub git_user_name: Option<String>,
    pub git_user_email: Option<String>,
}

impl FileSettings {
    pub fn load(path: &Path) -> Result<Self, PilotError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PilotError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
            .map_err(|e| PilotError::Configuration(format!("{}: {e}", path.display())))
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

/// Tracker-side settings.
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub api_url: String,
    pub token: String,
    /// Fully-qualified `owner/name`.
    pub repo: String,
    pub work_label: String,
    pub lock_label: String,
    /// Integration branch every pull request targets.
    pub base_branch: String,
    pub page_size: u32,
}

/// Model provider settings, including the backoff budget.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub api_url: String,
    pub token: String,
    pub model: String,
    pub max_attempts: u32,
    pub max_backoff: Duration,
    pub max_jitter: Duration,
}

/// Version-control settings for the publish sequence.
#[derive(Debug, Clone)]
pub struct GitSettings {
    pub remote: String,
    pub user_name: String,
    pub user_email: String,
}

/// Top-level run configuration, built once at startup and passed down explicitly.
#[derive(Debug, Clone)]
pub struct PilotConfig {
    pub tracker: TrackerSettings,
    pub model: ModelSettings,
    pub git: GitSettings,
    /// Root of the working tree the plan is applied to.
    pub workdir: PathBuf,
}

impl PilotConfig {
    /// Build from the process environment.
    pub fn from_env(file: FileSettings, workdir: PathBuf) -> Result<Self, PilotError> {
        Self::from_lookup(|key| std::env::var(key).ok(), file, workdir)
    }

    /// Build from an arbitrary variable lookup. Empty values count as missing.
    pub fn from_lookup<F>(lookup: F, file: FileSettings, workdir: PathBuf) -> Result<Self, PilotError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let tracker_token = get(ENV_TRACKER_TOKEN);
        let model_token = get(ENV_MODEL_TOKEN);
        let repo = get(ENV_REPOSITORY);

        let missing: Vec<&str> = [
            (ENV_TRACKER_TOKEN, tracker_token.is_none()),
            (ENV_MODEL_TOKEN, model_token.is_none()),
            (ENV_REPOSITORY, repo.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        let (Some(tracker_token), Some(model_token), Some(repo)) =
            (tracker_token, model_token, repo)
        else {
            return Err(PilotError::Configuration(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        };

        let repo = repo.trim().to_string();
        if !is_repo_identifier(&repo) {
            return Err(PilotError::Configuration(format!(
                "{ENV_REPOSITORY} must look like `owner/name`, got `{repo}`"
            )));
        }

        let max_attempts = file.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(PilotError::Configuration(
                "max_attempts must be at least 1".into(),
            ));
        }
        let page_size = file.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=100).contains(&page_size) {
            return Err(PilotError::Configuration(format!(
                "page_size must be within 1..=100, got {page_size}"
            )));
        }

        Ok(Self {
            tracker: TrackerSettings {
                api_url: trim_base(
                    get(ENV_TRACKER_API_URL).unwrap_or_else(|| DEFAULT_TRACKER_API_URL.into()),
                ),
                token: tracker_token,
                repo,
                work_label: file.work_label.unwrap_or_else(|| DEFAULT_WORK_LABEL.into()),
                lock_label: file.lock_label.unwrap_or_else(|| DEFAULT_LOCK_LABEL.into()),
                base_branch: file
                    .base_branch
                    .unwrap_or_else(|| DEFAULT_BASE_BRANCH.into()),
                page_size,
            },
            model: ModelSettings {
                api_url: trim_base(
                    get(ENV_MODEL_API_URL).unwrap_or_else(|| DEFAULT_MODEL_API_URL.into()),
                ),
                token: model_token,
                model: get(ENV_MODEL)
                    .or(file.model)
                    .unwrap_or_else(|| DEFAULT_MODEL.into()),
                max_attempts,
                max_backoff: Duration::from_secs(
                    file.max_backoff_secs.unwrap_or(DEFAULT_MAX_BACKOFF_SECS),
                ),
                max_jitter: Duration::from_millis(
                    file.max_jitter_ms.unwrap_or(DEFAULT_MAX_JITTER_MS),
                ),
            },
            git: GitSettings {
                remote: file.remote.unwrap_or_else(|| DEFAULT_REMOTE.into()),
                user_name: file
                    .git_user_name
                    .unwrap_or_else(|| DEFAULT_GIT_USER_NAME.into()),
                user_email: file
                    .git_user_email
                    .unwrap_or_else(|| DEFAULT_GIT_USER_EMAIL.into()),
            },
            workdir,
        })
    }
}

fn is_repo_identifier(repo: &str) -> bool {
    match repo.split_once('/') {
        Some((owner, name)) => {
            !owner.is_empty() && !name.is_empty() && !name.contains('/') && !repo.contains(' ')
        }
        None => false,
    }
}

fn trim_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("GITHUB_TOKEN", "ghs_test"),
            ("OPENAI_API_KEY", "sk-test"),
            ("GITHUB_REPOSITORY", "acme/widgets"),
        ]
    }

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let config =
            PilotConfig::from_lookup(lookup(&required()), FileSettings::default(), ".".into())
                .unwrap();
        assert_eq!(config.tracker.repo, "acme/widgets");
        assert_eq!(config.tracker.api_url, "https://api.github.com");
        assert_eq!(config.tracker.work_label, "agent");
        assert_eq!(config.tracker.lock_label, "agent-in-progress");
        assert_eq!(config.tracker.base_branch, "main");
        assert_eq!(config.tracker.page_size, 50);
        assert_eq!(config.model.model, "gpt-5.2");
        assert_eq!(config.model.max_attempts, 8);
        assert_eq!(config.model.max_backoff, Duration::from_secs(90));
        assert_eq!(config.model.max_jitter, Duration::from_millis(2000));
        assert_eq!(config.git.remote, "origin");
    }

    #[test]
    fn all_missing_vars_are_reported_together() {
        let err = PilotConfig::from_lookup(
            lookup(&[("OPENAI_API_KEY", "sk-test")]),
            FileSettings::default(),
            ".".into(),
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("GITHUB_TOKEN"), "{msg}");
        assert!(msg.contains("GITHUB_REPOSITORY"), "{msg}");
        assert!(!msg.contains("OPENAI_API_KEY"), "{msg}");
        assert_eq!(err.kind(), crate::errors::ErrorKind::Configuration);
    }

    #[test]
    fn blank_values_count_as_missing() {
        let mut vars = required();
        vars[1] = ("OPENAI_API_KEY", "   ");
        let err = PilotConfig::from_lookup(lookup(&vars), FileSettings::default(), ".".into())
            .unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn malformed_repository_is_rejected() {
        for bad in ["widgets", "acme/", "/widgets", "acme/widgets/extra"] {
            let mut vars = required();
            vars[2] = ("GITHUB_REPOSITORY", bad);
            assert!(
                PilotConfig::from_lookup(lookup(&vars), FileSettings::default(), ".".into())
                    .is_err(),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn file_settings_override_defaults_and_env_overrides_file() {
        let file = FileSettings::parse(
            r#"
            work_label = "bot"
            lock_label = "bot-busy"
            base_branch = "develop"
            model = "file-model"
            max_attempts = 3
            "#,
        )
        .unwrap();
        let mut vars = required();
        vars.push(("PILOT_MODEL", "env-model"));
        vars.push(("GITHUB_API_URL", "https://ghe.example.com/api/v3/"));
        let config = PilotConfig::from_lookup(lookup(&vars), file, ".".into()).unwrap();
        assert_eq!(config.tracker.work_label, "bot");
        assert_eq!(config.tracker.lock_label, "bot-busy");
        assert_eq!(config.tracker.base_branch, "develop");
        assert_eq!(config.model.model, "env-model");
        assert_eq!(config.model.max_attempts, 3);
        assert_eq!(config.tracker.api_url, "https://ghe.example.com/api/v3");
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        assert!(FileSettings::parse("wrok_label = \"typo\"").is_err());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let file = FileSettings {
            max_attempts: Some(0),
            ..Default::default()
        };
        assert!(PilotConfig::from_lookup(lookup(&required()), file, ".".into()).is_err());
    }
}
