use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    pub completion: CompletionConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Directory holding one sub-directory per indexed session.
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./temp_files")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    pub url: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_input_cost")]
    pub input_cost_per_1k: f64,
    #[serde(default = "default_output_cost")]
    pub output_cost_per_1k: f64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_temperature() -> f64 {
    0.3
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_input_cost() -> f64 {
    0.01
}
fn default_output_cost() -> f64 {
    0.03
}
fn default_max_parallel() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_small_max_rows")]
    pub small_max_rows: usize,
    #[serde(default = "default_small_max_cols")]
    pub small_max_cols: usize,
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,
    #[serde(default = "default_renderer")]
    pub renderer: String,
    #[serde(default = "default_soffice_bin")]
    pub soffice_bin: String,
    #[serde(default = "default_convert_bin")]
    pub convert_bin: String,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            small_max_rows: default_small_max_rows(),
            small_max_cols: default_small_max_cols(),
            sample_rows: default_sample_rows(),
            renderer: default_renderer(),
            soffice_bin: default_soffice_bin(),
            convert_bin: default_convert_bin(),
        }
    }
}

fn default_small_max_rows() -> usize {
    40
}
fn default_small_max_cols() -> usize {
    10
}
fn default_sample_rows() -> usize {
    5
}
fn default_renderer() -> String {
    "external".to_string()
}
fn default_soffice_bin() -> String {
    "soffice".to_string()
}
fn default_convert_bin() -> String {
    "convert".to_string()
}

/// What the table selector does when the fuzzy scan implicates no table.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchPolicy {
    #[default]
    AllTables,
    Fail,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    #[serde(default = "default_max_cell_tokens")]
    pub max_cell_tokens: usize,
    #[serde(default)]
    pub no_match_policy: NoMatchPolicy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: default_fuzzy_threshold(),
            max_cell_tokens: default_max_cell_tokens(),
            no_match_policy: NoMatchPolicy::default(),
        }
    }
}

fn default_fuzzy_threshold() -> f64 {
    0.8
}
fn default_max_cell_tokens() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:5002".to_string()
}

impl CompletionConfig {
    /// Reads the bearer token from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Completion
    if config.completion.url.trim().is_empty() {
        anyhow::bail!("completion.url must not be empty");
    }
    if config.completion.model.trim().is_empty() {
        anyhow::bail!("completion.model must not be empty");
    }
    if !(0.0..=2.0).contains(&config.completion.temperature) {
        anyhow::bail!("completion.temperature must be in [0.0, 2.0]");
    }
    if config.completion.timeout_secs == 0 {
        anyhow::bail!("completion.timeout_secs must be > 0");
    }
    if config.completion.max_parallel == 0 {
        anyhow::bail!("completion.max_parallel must be > 0");
    }
    if config.completion.input_cost_per_1k < 0.0 || config.completion.output_cost_per_1k < 0.0 {
        anyhow::bail!("completion cost factors must be >= 0");
    }

    // Indexing
    if config.indexing.small_max_rows == 0 || config.indexing.small_max_cols == 0 {
        anyhow::bail!("indexing.small_max_rows and indexing.small_max_cols must be > 0");
    }
    match config.indexing.renderer.as_str() {
        "external" | "none" => {}
        other => anyhow::bail!(
            "Unknown renderer: '{}'. Must be external or none.",
            other
        ),
    }

    // Retrieval
    if !(0.0..=1.0).contains(&config.retrieval.fuzzy_threshold) {
        anyhow::bail!("retrieval.fuzzy_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.max_cell_tokens == 0 {
        anyhow::bail!("retrieval.max_cell_tokens must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[completion]
url = "http://localhost:9999/v1/chat/completions"
model = "gpt-4o"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.workspace.root, PathBuf::from("./temp_files"));
        assert_eq!(config.indexing.small_max_rows, 40);
        assert_eq!(config.indexing.small_max_cols, 10);
        assert_eq!(config.retrieval.fuzzy_threshold, 0.8);
        assert_eq!(config.retrieval.no_match_policy, NoMatchPolicy::AllTables);
        assert_eq!(config.completion.temperature, 0.3);
        assert_eq!(config.server.bind, "0.0.0.0:5002");
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let content = format!("{}\n[retrieval]\nfuzzy_threshold = 1.5\n", MINIMAL);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("fuzzy_threshold"));
    }

    #[test]
    fn rejects_unknown_renderer() {
        let content = format!("{}\n[indexing]\nrenderer = \"magic\"\n", MINIMAL);
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn parses_fail_policy() {
        let content = format!("{}\n[retrieval]\nno_match_policy = \"fail\"\n", MINIMAL);
        let config = parse_config(&content).unwrap();
        assert_eq!(config.retrieval.no_match_policy, NoMatchPolicy::Fail);
    }

    #[test]
    fn example_config_parses() {
        let config = parse_config(include_str!("../config/wbqa.example.toml")).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:5002");
        assert_eq!(config.completion.max_parallel, 4);
        assert_eq!(config.retrieval.no_match_policy, NoMatchPolicy::AllTables);
    }
}
