use crate::Settings;
use anyhow::{Context, Result};
use jsonc_parser::{parse_to_serde_value, ParseOptions};
use once_cell::sync::Lazy;
use regex::Regex;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

static ENV_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{env:([^}]+)\}").expect("env reference pattern is valid"));

/// Layered settings loader. Later sources override earlier ones key by key.
pub struct ConfigLoader {
    merged: serde_json::Value,
    config_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            merged: serde_json::Value::Object(serde_json::Map::new()),
            config_paths: Vec::new(),
        }
    }

    pub fn load_from_str(&mut self, content: &str) -> Result<()> {
        let content = substitute_env_vars(content);
        let value = parse_jsonc(&content).with_context(|| "Failed to parse settings content")?;
        merge_values(&mut self.merged, value);
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {:?}", path))?;
        let content = substitute_env_vars(&content);
        let value = parse_jsonc(&content)
            .with_context(|| format!("Failed to parse settings file: {:?}", path))?;

        merge_values(&mut self.merged, value);
        self.config_paths.push(path.to_path_buf());
        tracing::debug!(path = %path.display(), "loaded settings file");
        Ok(())
    }

    pub fn load_global(&mut self) -> Result<()> {
        let base = get_global_config_path();
        for ext in ["jsonc", "json"] {
            let path = base.with_extension(ext);
            if path.exists() {
                self.load_from_file(&path)?;
                break;
            }
        }
        Ok(())
    }

    pub fn load_project<P: AsRef<Path>>(&mut self, project_dir: P) -> Result<()> {
        let dir = project_dir.as_ref().join(".agentloop");
        for name in ["settings.jsonc", "settings.json"] {
            let path = dir.join(name);
            if path.exists() {
                self.load_from_file(&path)?;
                break;
            }
        }
        Ok(())
    }

    pub fn load_from_env(&mut self) -> Result<()> {
        if let Ok(path) = env::var("AGENTLOOP_CONFIG") {
            self.load_from_file(&path)?;
        }
        Ok(())
    }

    pub fn load_from_env_content(&mut self) -> Result<()> {
        if let Ok(content) = env::var("AGENTLOOP_CONFIG_CONTENT") {
            self.load_from_str(&content)?;
        }
        Ok(())
    }

    /// Merge order:
    /// 1. Global settings (`<config dir>/agentloop/settings.json{c,}`)
    /// 2. Custom file (`AGENTLOOP_CONFIG`)
    /// 3. Project settings (`.agentloop/settings.json{c,}`)
    /// 4. Inline settings (`AGENTLOOP_CONFIG_CONTENT`)
    pub fn load_all<P: AsRef<Path>>(&mut self, project_dir: P) -> Result<Settings> {
        self.load_global()?;
        self.load_from_env()?;
        self.load_project(project_dir)?;
        self.load_from_env_content()?;
        self.settings()
    }

    pub fn settings(&self) -> Result<Settings> {
        serde_json::from_value(self.merged.clone()).with_context(|| "Failed to decode settings")
    }

    pub fn config_paths(&self) -> &[PathBuf] {
        &self.config_paths
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

pub fn load_settings<P: AsRef<Path>>(project_dir: P) -> Result<Settings> {
    ConfigLoader::new().load_all(project_dir)
}

fn get_global_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("agentloop/settings")
}

fn substitute_env_vars(text: &str) -> String {
    ENV_REFERENCE
        .replace_all(text, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .to_string()
}

fn parse_jsonc(content: &str) -> Result<serde_json::Value> {
    let parse_options = ParseOptions {
        allow_trailing_commas: true,
        ..Default::default()
    };
    parse_to_serde_value(content, &parse_options)
        .with_context(|| "Failed to parse JSONC")?
        .context("Settings content is empty")
}

/// Objects merge recursively; any other value replaces the target.
fn merge_values(target: &mut serde_json::Value, source: serde_json::Value) {
    match (target, source) {
        (serde_json::Value::Object(target), serde_json::Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_sources_override_key_by_key() {
        let mut loader = ConfigLoader::new();
        loader
            .load_from_str(r#"{ "tools": { "maxIterations": 5, "autoExec": { "ls": true } } }"#)
            .expect("first source should load");
        loader
            .load_from_str(r#"{ "tools": { "autoExec": { "rm": false } }, }"#)
            .expect("second source should load");

        let settings = loader.settings().expect("settings should decode");
        assert_eq!(settings.tools.max_iterations, 5);
        assert_eq!(settings.tools.auto_exec.get("ls"), Some(&true));
        assert_eq!(settings.tools.auto_exec.get("rm"), Some(&false));
    }

    #[test]
    fn project_file_with_comments_is_loaded() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let settings_dir = dir.path().join(".agentloop");
        fs::create_dir_all(&settings_dir).expect("settings dir should be created");
        fs::write(
            settings_dir.join("settings.jsonc"),
            "{\n  // keep summaries short\n  \"context\": { \"keepRecentRounds\": 4 }\n}\n",
        )
        .expect("settings file should be written");

        let mut loader = ConfigLoader::new();
        loader
            .load_project(dir.path())
            .expect("project settings should load");
        let settings = loader.settings().expect("settings should decode");
        assert_eq!(settings.context.keep_recent_rounds, 4);
        assert_eq!(loader.config_paths().len(), 1);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let mut loader = ConfigLoader::new();
        loader
            .load_from_file("/definitely/not/here/settings.json")
            .expect("missing file should be skipped");
        assert!(loader.config_paths().is_empty());
    }

    #[test]
    fn env_references_are_substituted() {
        std::env::set_var("AGENTLOOP_TEST_SUMMARY_MODEL", "small-model");
        let mut loader = ConfigLoader::new();
        loader
            .load_from_str(r#"{ "context": { "summaryModel": "{env:AGENTLOOP_TEST_SUMMARY_MODEL}" } }"#)
            .expect("source should load");
        let settings = loader.settings().expect("settings should decode");
        assert_eq!(settings.context.summary_model.as_deref(), Some("small-model"));
    }
}
