//! Option resolution and the `config` subcommand.
//!
//! Precedence, highest first: CLI flags, the explicit JSON config file,
//! repository-local git config (`codestory.*`), `CODESTORY_*` environment
//! variables, global git config, built-in defaults.

use std::path::PathBuf;

use serde::Deserialize;

use crate::chunk::ChunkingLevel;
use crate::errors::{Error, Result};
use crate::filter::Aggression;
use crate::logical::BatchingStrategy;
use crate::semantic::FallbackGrouping;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffDisplay {
    Semantic,
    Git,
}

impl std::str::FromStr for DiffDisplay {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(DiffDisplay::Semantic),
            "git" => Ok(DiffDisplay::Git),
            other => Err(format!("unknown diff display {:?}", other)),
        }
    }
}

/// Fully resolved options for one run.
#[derive(Debug, Clone)]
pub struct Options {
    pub model: String,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub relevance_filtering: bool,
    pub relevance_filter_similarity_threshold: f32,
    pub secret_scanner_aggression: Aggression,
    pub fallback_grouping_strategy: FallbackGrouping,
    pub chunking_level: ChunkingLevel,
    pub cluster_strictness: f32,
    pub batching_strategy: BatchingStrategy,
    pub num_retries: u32,
    pub fail_on_syntax_errors: bool,
    pub ask_for_commit_message: bool,
    pub display_diff_type: DiffDisplay,
    pub auto_accept: bool,
    pub silent: bool,
    pub verbose: bool,
    pub custom_embedding_model: Option<String>,
    pub custom_language_config: Option<PathBuf>,
    pub intent: Option<String>,
}

/// Partial options, as they arrive from the CLI or the JSON config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Overrides {
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub relevance_filtering: Option<bool>,
    pub relevance_filter_similarity_threshold: Option<f32>,
    pub secret_scanner_aggression: Option<String>,
    pub fallback_grouping_strategy: Option<String>,
    pub chunking_level: Option<String>,
    pub cluster_strictness: Option<f32>,
    pub batching_strategy: Option<String>,
    pub num_retries: Option<u32>,
    pub fail_on_syntax_errors: Option<bool>,
    pub ask_for_commit_message: Option<bool>,
    pub display_diff_type: Option<String>,
    pub auto_accept: Option<bool>,
    pub silent: Option<bool>,
    pub verbose: Option<bool>,
    pub custom_embedding_model: Option<String>,
    pub custom_language_config: Option<String>,
    pub intent: Option<String>,
}

impl Overrides {
    pub fn from_file(path: &std::path::Path) -> Result<Overrides> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            Error::Usage(format!("cannot parse config file {}: {}", path.display(), e))
        })
    }
}

pub struct Key {
    pub name: &'static str,
    pub git: &'static str,
    pub env: &'static str,
    pub description: &'static str,
}

pub const KEYS: &[Key] = &[
    Key { name: "model", git: "codestory.model", env: "CODESTORY_MODEL", description: "Model provider and name, e.g. openai:gpt-4o-mini or heuristic" },
    Key { name: "apiKey", git: "codestory.apiKey", env: "CODESTORY_API_KEY", description: "API key for the model provider" },
    Key { name: "apiBase", git: "codestory.apiBase", env: "CODESTORY_API_BASE", description: "Base URL of the OpenAI-compatible endpoint" },
    Key { name: "temperature", git: "codestory.temperature", env: "CODESTORY_TEMPERATURE", description: "Sampling temperature, 0 to 1" },
    Key { name: "maxTokens", git: "codestory.maxTokens", env: "CODESTORY_MAX_TOKENS", description: "Token budget per model request" },
    Key { name: "relevanceFiltering", git: "codestory.relevanceFiltering", env: "CODESTORY_RELEVANCE_FILTERING", description: "Drop groups unrelated to the stated intent" },
    Key { name: "relevanceFilterSimilarityThreshold", git: "codestory.relevanceFilterSimilarityThreshold", env: "CODESTORY_RELEVANCE_FILTER_SIMILARITY_THRESHOLD", description: "Minimum intent similarity, 0 to 1" },
    Key { name: "secretScannerAggression", git: "codestory.secretScannerAggression", env: "CODESTORY_SECRET_SCANNER_AGGRESSION", description: "Secret scanner level: none, safe, standard or strict" },
    Key { name: "fallbackGroupingStrategy", git: "codestory.fallbackGroupingStrategy", env: "CODESTORY_FALLBACK_GROUPING_STRATEGY", description: "Grouping for unparsed files: all_together, by_file or by_extension" },
    Key { name: "chunkingLevel", git: "codestory.chunkingLevel", env: "CODESTORY_CHUNKING_LEVEL", description: "Chunk splitting: none, full_files or all_files" },
    Key { name: "clusterStrictness", git: "codestory.clusterStrictness", env: "CODESTORY_CLUSTER_STRICTNESS", description: "How aggressively the model merges groups, 0 to 1" },
    Key { name: "batchingStrategy", git: "codestory.batchingStrategy", env: "CODESTORY_BATCHING_STRATEGY", description: "Model request batching: auto, requests or prompt" },
    Key { name: "numRetries", git: "codestory.numRetries", env: "CODESTORY_NUM_RETRIES", description: "Model retries before the heuristic fallback, 0 to 10" },
    Key { name: "failOnSyntaxErrors", git: "codestory.failOnSyntaxErrors", env: "CODESTORY_FAIL_ON_SYNTAX_ERRORS", description: "Treat parse errors as fatal / reject broken groups" },
    Key { name: "askForCommitMessage", git: "codestory.askForCommitMessage", env: "CODESTORY_ASK_FOR_COMMIT_MESSAGE", description: "Prompt for every commit message" },
    Key { name: "displayDiffType", git: "codestory.displayDiffType", env: "CODESTORY_DISPLAY_DIFF_TYPE", description: "Preview rendering: semantic or git" },
    Key { name: "autoAccept", git: "codestory.autoAccept", env: "CODESTORY_AUTO_ACCEPT", description: "Skip the confirmation prompt" },
    Key { name: "silent", git: "codestory.silent", env: "CODESTORY_SILENT", description: "Only report errors" },
    Key { name: "customEmbeddingModel", git: "codestory.customEmbeddingModel", env: "CODESTORY_CUSTOM_EMBEDDING_MODEL", description: "Embedding backend for relevance filtering" },
    Key { name: "customLanguageConfig", git: "codestory.customLanguageConfig", env: "CODESTORY_CUSTOM_LANGUAGE_CONFIG", description: "Path to a JSON language configuration" },
];

fn key(name: &str) -> Option<&'static Key> {
    KEYS.iter()
        .find(|k| k.name == name || k.git == name || k.git.strip_prefix("codestory.") == Some(name))
}

struct GitSources {
    local: Option<git2::Config>,
    global: Option<git2::Config>,
}

impl GitSources {
    fn open(repo: Option<&git2::Repository>) -> GitSources {
        let local = repo
            .and_then(|r| r.config().ok())
            .and_then(|c| c.open_level(git2::ConfigLevel::Local).ok());
        let global = git2::Config::open_default().ok();
        GitSources { local, global }
    }

    /// Raw string for a key from one layer, in precedence order:
    /// local git config, environment, global git config.
    fn layered(&self, key: &Key) -> Option<String> {
        if let Some(value) = self.local.as_ref().and_then(|c| c.get_string(key.git).ok()) {
            return Some(value);
        }
        if let Ok(value) = std::env::var(key.env) {
            return Some(value);
        }
        self.global.as_ref().and_then(|c| c.get_string(key.git).ok())
    }
}

fn parse_with<T>(raw: &str, key: &Key, parse: impl Fn(&str) -> std::result::Result<T, String>) -> Result<T> {
    parse(raw).map_err(|e| Error::Usage(format!("bad value for {}: {}", key.name, e)))
}

fn resolve_field<T>(
    explicit: Option<T>,
    key_name: &str,
    sources: &GitSources,
    default: T,
    parse: impl Fn(&str) -> std::result::Result<T, String>,
) -> Result<T> {
    if let Some(value) = explicit {
        return Ok(value);
    }
    let key = key(key_name).expect("unknown option key");
    match sources.layered(key) {
        Some(raw) => parse_with(&raw, key, parse),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> std::result::Result<bool, String> {
    match raw {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(format!("{:?} is not a boolean", other)),
    }
}

fn unit_interval(value: f32, what: &str) -> Result<f32> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(Error::Usage(format!("{} must be between 0 and 1", what)))
    }
}

/// Resolve the full option set. `cli` wins over `file`, both win over the
/// layered sources.
pub fn resolve(
    cli: &Overrides,
    file: &Overrides,
    repo: Option<&git2::Repository>,
) -> Result<Options> {
    let sources = GitSources::open(repo);
    let pick_string = |c: &Option<String>, f: &Option<String>| c.clone().or_else(|| f.clone());

    let options = Options {
        model: resolve_field(
            pick_string(&cli.model, &file.model),
            "model",
            &sources,
            "openai:gpt-4o-mini".to_string(),
            |s| Ok(s.to_string()),
        )?,
        api_key: match pick_string(&cli.api_key, &file.api_key) {
            some @ Some(_) => some,
            None => key("apiKey").and_then(|k| sources.layered(k)),
        },
        api_base: match pick_string(&cli.api_base, &file.api_base) {
            some @ Some(_) => some,
            None => key("apiBase").and_then(|k| sources.layered(k)),
        },
        temperature: resolve_field(
            cli.temperature.or(file.temperature),
            "temperature",
            &sources,
            0.2,
            |s| s.parse::<f32>().map_err(|e| e.to_string()),
        )?,
        max_tokens: resolve_field(
            cli.max_tokens.or(file.max_tokens),
            "maxTokens",
            &sources,
            4096,
            |s| s.parse::<u32>().map_err(|e| e.to_string()),
        )?,
        relevance_filtering: resolve_field(
            cli.relevance_filtering.or(file.relevance_filtering),
            "relevanceFiltering",
            &sources,
            false,
            parse_bool,
        )?,
        relevance_filter_similarity_threshold: resolve_field(
            cli.relevance_filter_similarity_threshold
                .or(file.relevance_filter_similarity_threshold),
            "relevanceFilterSimilarityThreshold",
            &sources,
            0.35,
            |s| s.parse::<f32>().map_err(|e| e.to_string()),
        )?,
        secret_scanner_aggression: resolve_field(
            parse_override(&cli.secret_scanner_aggression, &file.secret_scanner_aggression)?,
            "secretScannerAggression",
            &sources,
            Aggression::Standard,
            |s| s.parse(),
        )?,
        fallback_grouping_strategy: resolve_field(
            parse_override(
                &cli.fallback_grouping_strategy,
                &file.fallback_grouping_strategy,
            )?,
            "fallbackGroupingStrategy",
            &sources,
            FallbackGrouping::ByFile,
            |s| s.parse(),
        )?,
        chunking_level: resolve_field(
            parse_override(&cli.chunking_level, &file.chunking_level)?,
            "chunkingLevel",
            &sources,
            ChunkingLevel::AllFiles,
            |s| s.parse(),
        )?,
        cluster_strictness: resolve_field(
            cli.cluster_strictness.or(file.cluster_strictness),
            "clusterStrictness",
            &sources,
            0.5,
            |s| s.parse::<f32>().map_err(|e| e.to_string()),
        )?,
        batching_strategy: resolve_field(
            parse_override(&cli.batching_strategy, &file.batching_strategy)?,
            "batchingStrategy",
            &sources,
            BatchingStrategy::Auto,
            |s| s.parse(),
        )?,
        num_retries: resolve_field(
            cli.num_retries.or(file.num_retries),
            "numRetries",
            &sources,
            2,
            |s| s.parse::<u32>().map_err(|e| e.to_string()),
        )?,
        fail_on_syntax_errors: resolve_field(
            cli.fail_on_syntax_errors.or(file.fail_on_syntax_errors),
            "failOnSyntaxErrors",
            &sources,
            false,
            parse_bool,
        )?,
        ask_for_commit_message: resolve_field(
            cli.ask_for_commit_message.or(file.ask_for_commit_message),
            "askForCommitMessage",
            &sources,
            false,
            parse_bool,
        )?,
        display_diff_type: resolve_field(
            parse_override(&cli.display_diff_type, &file.display_diff_type)?,
            "displayDiffType",
            &sources,
            DiffDisplay::Semantic,
            |s| s.parse(),
        )?,
        auto_accept: resolve_field(
            cli.auto_accept.or(file.auto_accept),
            "autoAccept",
            &sources,
            false,
            parse_bool,
        )?,
        silent: resolve_field(cli.silent.or(file.silent), "silent", &sources, false, parse_bool)?,
        verbose: cli.verbose.or(file.verbose).unwrap_or(false),
        custom_embedding_model: match pick_string(
            &cli.custom_embedding_model,
            &file.custom_embedding_model,
        ) {
            some @ Some(_) => some,
            None => key("customEmbeddingModel").and_then(|k| sources.layered(k)),
        },
        custom_language_config: match pick_string(
            &cli.custom_language_config,
            &file.custom_language_config,
        ) {
            Some(path) => Some(PathBuf::from(path)),
            None => key("customLanguageConfig")
                .and_then(|k| sources.layered(k))
                .map(PathBuf::from),
        },
        intent: cli.intent.clone(),
    };

    unit_interval(options.temperature, "temperature")?;
    unit_interval(
        options.relevance_filter_similarity_threshold,
        "relevance-filter-similarity-threshold",
    )?;
    unit_interval(options.cluster_strictness, "cluster-strictness")?;
    if options.num_retries > 10 {
        return Err(Error::Usage("num-retries must be between 0 and 10".to_string()));
    }
    Ok(options)
}

fn parse_override<T: std::str::FromStr<Err = String>>(
    cli: &Option<String>,
    file: &Option<String>,
) -> Result<Option<T>> {
    match cli.as_ref().or(file.as_ref()) {
        Some(raw) => raw.parse().map(Some).map_err(Error::Usage),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// `config` subcommand
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    Local,
    Global,
}

fn scoped_config(repo: &git2::Repository, scope: ConfigScope) -> Result<git2::Config> {
    let config = match scope {
        ConfigScope::Local => repo.config()?.open_level(git2::ConfigLevel::Local)?,
        ConfigScope::Global => git2::Config::open_default()?.open_level(git2::ConfigLevel::Global)?,
    };
    Ok(config)
}

fn known_key(name: &str) -> Result<&'static Key> {
    key(name).ok_or_else(|| {
        Error::Usage(format!(
            "unknown config key {:?}; run `codestory config --describe`",
            name
        ))
    })
}

pub fn config_get(repo: &git2::Repository, name: &str) -> Result<Option<String>> {
    let key = known_key(name)?;
    Ok(repo.config()?.get_string(key.git).ok())
}

pub fn config_set(
    repo: &git2::Repository,
    name: &str,
    value: &str,
    scope: ConfigScope,
) -> Result<()> {
    let key = known_key(name)?;
    scoped_config(repo, scope)?.set_str(key.git, value)?;
    Ok(())
}

pub fn config_delete(repo: &git2::Repository, name: &str, scope: ConfigScope) -> Result<()> {
    let key = known_key(name)?;
    let mut config = scoped_config(repo, scope)?;
    match config.remove(key.git) {
        Ok(()) => Ok(()),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn config_delete_all(repo: &git2::Repository, scope: ConfigScope) -> Result<()> {
    let mut config = scoped_config(repo, scope)?;
    for key in KEYS {
        match config.remove(key.git) {
            Ok(()) | Err(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo() -> (tempfile::TempDir, git2::Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn defaults_apply_when_nothing_is_configured() {
        let (_dir, repo) = init_repo();
        let options = resolve(&Overrides::default(), &Overrides::default(), Some(&repo)).unwrap();
        assert_eq!(options.chunking_level, ChunkingLevel::AllFiles);
        assert_eq!(options.secret_scanner_aggression, Aggression::Standard);
        assert_eq!(options.num_retries, 2);
        assert!(!options.auto_accept);
    }

    #[test]
    fn local_git_config_overrides_defaults() {
        let (_dir, repo) = init_repo();
        repo.config()
            .unwrap()
            .set_str("codestory.chunkingLevel", "none")
            .unwrap();
        repo.config()
            .unwrap()
            .set_str("codestory.numRetries", "7")
            .unwrap();
        let options = resolve(&Overrides::default(), &Overrides::default(), Some(&repo)).unwrap();
        assert_eq!(options.chunking_level, ChunkingLevel::None);
        assert_eq!(options.num_retries, 7);
    }

    #[test]
    fn cli_beats_file_beats_git_config() {
        let (_dir, repo) = init_repo();
        repo.config()
            .unwrap()
            .set_str("codestory.model", "openai:from-git")
            .unwrap();
        let file = Overrides {
            model: Some("openai:from-file".to_string()),
            ..Overrides::default()
        };
        let resolved = resolve(&Overrides::default(), &file, Some(&repo)).unwrap();
        assert_eq!(resolved.model, "openai:from-file");

        let cli = Overrides {
            model: Some("heuristic".to_string()),
            ..Overrides::default()
        };
        let resolved = resolve(&cli, &file, Some(&repo)).unwrap();
        assert_eq!(resolved.model, "heuristic");
    }

    #[test]
    fn out_of_range_values_are_usage_errors() {
        let cli = Overrides {
            temperature: Some(1.5),
            ..Overrides::default()
        };
        assert!(matches!(
            resolve(&cli, &Overrides::default(), None),
            Err(Error::Usage(_))
        ));

        let cli = Overrides {
            num_retries: Some(11),
            ..Overrides::default()
        };
        assert!(matches!(
            resolve(&cli, &Overrides::default(), None),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn bad_enum_values_are_usage_errors() {
        let cli = Overrides {
            chunking_level: Some("half_files".to_string()),
            ..Overrides::default()
        };
        assert!(matches!(
            resolve(&cli, &Overrides::default(), None),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn config_set_get_delete_roundtrip() {
        let (_dir, repo) = init_repo();
        config_set(&repo, "model", "heuristic", ConfigScope::Local).unwrap();
        assert_eq!(
            config_get(&repo, "model").unwrap(),
            Some("heuristic".to_string())
        );
        // both spellings address the same key
        assert_eq!(
            config_get(&repo, "codestory.model").unwrap(),
            Some("heuristic".to_string())
        );
        config_delete(&repo, "model", ConfigScope::Local).unwrap();
        assert_eq!(config_get(&repo, "model").unwrap(), None);
        // deleting a missing key is fine
        config_delete(&repo, "model", ConfigScope::Local).unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let (_dir, repo) = init_repo();
        assert!(matches!(
            config_get(&repo, "not-a-key"),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn overrides_parse_from_json() {
        let parsed: Overrides = serde_json::from_str(
            r#"{"model": "heuristic", "cluster_strictness": 0.9, "auto_accept": true}"#,
        )
        .unwrap();
        assert_eq!(parsed.model.as_deref(), Some("heuristic"));
        assert_eq!(parsed.cluster_strictness, Some(0.9));
        assert_eq!(parsed.auto_accept, Some(true));
    }
}
