use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Everything a run needs to know, passed explicitly into the engine.
///
/// Layering: `Default` → JSON file (`from_file`) → environment (`apply_env`)
/// → caller overrides (the CLI sets fields directly).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub work_root: PathBuf,
    pub key_info_budget: usize,
    pub max_iterations: u32,
    pub score_threshold: f64,
    pub use_llm_routing: bool,
    pub parallel_layers: bool,
    pub http_timeout_secs: u64,
    pub render_timeout_secs: u64,
    pub model_timeout_secs: u64,
    pub banner_width: u32,
    pub banner_height: u32,
    pub max_prompt_chars: usize,
    pub api_base: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub text_model: Option<String>,
    pub code_model: Option<String>,
    pub vision_model: Option<String>,
    pub image_provider: String,
    pub renderer_binary: Option<PathBuf>,
    /// Offline mode: deterministic agent, image generator and renderer.
    pub dryrun: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("banner_projects"),
            key_info_budget: 500,
            max_iterations: 5,
            score_threshold: 7.0,
            use_llm_routing: false,
            parallel_layers: false,
            http_timeout_secs: 30,
            render_timeout_secs: 60,
            model_timeout_secs: 180,
            banner_width: 1200,
            banner_height: 600,
            max_prompt_chars: 25_000,
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            text_model: None,
            code_model: None,
            vision_model: None,
            image_provider: "pollinations".to_string(),
            renderer_binary: None,
            dryrun: false,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config JSON in {}", path.display()))?;
        Ok(config)
    }

    /// Fills credentials, endpoint and browser binary from the environment.
    /// Values already set (from a file) win over the environment.
    pub fn apply_env(&mut self) {
        if self.api_key.is_none() {
            self.api_key =
                first_non_empty_env(&["BANNER_API_KEY", "DASHSCOPE_API_KEY", "OPENAI_API_KEY"]);
        }
        if self.api_base == DEFAULT_API_BASE {
            if let Some(base) = first_non_empty_env(&["BANNER_API_BASE", "OPENAI_API_BASE"]) {
                self.api_base = base;
            }
        }
        if self.renderer_binary.is_none() {
            self.renderer_binary = first_non_empty_env(&["BANNER_CHROME"]).map(PathBuf::from);
        }
        self.api_base = self.api_base.trim().trim_end_matches('/').to_string();
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_info_budget == 0 {
            bail!("key_info_budget must be positive");
        }
        if self.banner_width == 0 || self.banner_height == 0 {
            bail!(
                "banner size must be positive (got {}x{})",
                self.banner_width,
                self.banner_height
            );
        }
        if !(0.0..=10.0).contains(&self.score_threshold) {
            bail!("score_threshold must be within 0..=10");
        }
        if !self.dryrun && self.api_key.is_none() {
            bail!("no API key configured (set BANNER_API_KEY, DASHSCOPE_API_KEY or OPENAI_API_KEY, or use dryrun)");
        }
        Ok(())
    }
}

pub(crate) fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}
