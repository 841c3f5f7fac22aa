use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_yaml::{Mapping, Value};

pub const DEFAULT_CONFIG_FILENAME: &str = "config.yaml";
pub const DEFAULT_RESULTS_DIR: &str = "results";
pub const DEFAULT_AUDIT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct LabDocsConfig {
    #[serde(default)]
    pub bookstack: BookStackSection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default, deserialize_with = "deserialize_books")]
    pub books: Vec<BookEntry>,
    #[serde(default)]
    pub discord: DiscordSection,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct BookStackSection {
    pub url: Option<String>,
    pub api_token_id: Option<String>,
    pub api_token_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AuditSection {
    pub script: Option<String>,
    pub results_dir: Option<String>,
    /// Reject short text-table lines instead of skipping them.
    #[serde(default)]
    pub strict: bool,
    #[serde(default = "default_audit_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            script: None,
            results_dir: None,
            strict: false,
            timeout_secs: DEFAULT_AUDIT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct DiscordSection {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: Option<String>,
}

/// A book declaration together with its key under `books:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookEntry {
    pub key: String,
    pub book: BookConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BookConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub chapters: Vec<ChapterConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChapterConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pages: Vec<PageConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PageConfig {
    pub name: String,
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub token_id: String,
    pub token_secret: String,
}

impl LabDocsConfig {
    /// Trimmed base URL; env overrides are applied beforehand via `apply_env_overrides`.
    pub fn bookstack_url(&self) -> Option<String> {
        non_empty(self.bookstack.url.as_deref())
    }

    /// Both token fields must be present for API access.
    pub fn api_credentials(&self) -> Option<ApiCredentials> {
        let token_id = non_empty(self.bookstack.api_token_id.as_deref())?;
        let token_secret = non_empty(self.bookstack.api_token_secret.as_deref())?;
        Some(ApiCredentials {
            token_id,
            token_secret,
        })
    }

    /// Settings that must be filled in before the API client can be built.
    pub fn missing_api_settings(&self) -> Vec<&'static str> {
        [
            ("bookstack.url", self.bookstack.url.as_deref()),
            ("bookstack.api_token_id", self.bookstack.api_token_id.as_deref()),
            ("bookstack.api_token_secret", self.bookstack.api_token_secret.as_deref()),
        ]
        .into_iter()
        .filter(|(_, value)| non_empty(*value).is_none())
        .map(|(name, _)| name)
        .collect()
    }

    pub fn discord_webhook_url(&self) -> Option<String> {
        non_empty(self.discord.webhook_url.as_deref())
    }

    /// Apply process environment overrides on top of the loaded file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup_trimmed = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(url) = lookup_trimmed("BOOKSTACK_URL") {
            self.bookstack.url = Some(url);
        }
        if let Some(token_id) = lookup_trimmed("BOOKSTACK_TOKEN_ID") {
            self.bookstack.api_token_id = Some(token_id);
        }
        if let Some(token_secret) = lookup_trimmed("BOOKSTACK_TOKEN_SECRET") {
            self.bookstack.api_token_secret = Some(token_secret);
        }
        if let Some(results_dir) = lookup_trimmed("LABDOCS_RESULTS_DIR") {
            self.audit.results_dir = Some(results_dir);
        }
        if let Some(webhook_url) = lookup_trimmed("DISCORD_WEBHOOK_URL") {
            self.discord.webhook_url = Some(webhook_url);
        }
    }
}

/// Load and parse the YAML config. A missing file is a configuration error.
pub fn load_config(config_path: &Path) -> Result<LabDocsConfig> {
    if !config_path.exists() {
        bail!("config file not found: {}", config_path.display());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: LabDocsConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Rewrite `bookstack.api_token_id` / `bookstack.api_token_secret` while
/// preserving all other config content. Returns `true` when a write occurred.
///
/// Block-style configs are edited line by line so comments and layout survive;
/// anything else is re-serialized.
pub fn patch_bookstack_tokens(config_path: &Path, token_id: &str, token_secret: &str) -> Result<bool> {
    if !config_path.exists() {
        return Ok(false);
    }

    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let root: Value = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    if tokens_of(&root) == Some((token_id, token_secret)) {
        return Ok(false);
    }

    let patched = match patch_token_lines(&content, token_id, token_secret) {
        Some(patched)
            if serde_yaml::from_str::<Value>(&patched)
                .ok()
                .is_some_and(|value| tokens_of(&value) == Some((token_id, token_secret))) =>
        {
            patched
        }
        _ => reserialize_with_tokens(root, token_id, token_secret)
            .with_context(|| format!("failed to patch {}", config_path.display()))?,
    };

    fs::write(config_path, patched)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

fn tokens_of(root: &Value) -> Option<(&str, &str)> {
    let bookstack = root.get("bookstack")?;
    Some((
        bookstack.get("api_token_id")?.as_str()?,
        bookstack.get("api_token_secret")?.as_str()?,
    ))
}

// `None` when there is no block-style top-level `bookstack:` section to edit.
fn patch_token_lines(content: &str, token_id: &str, token_secret: &str) -> Option<String> {
    let mut lines: Vec<String> = content.lines().map(ToString::to_string).collect();
    let header = lines.iter().position(|line| {
        line.strip_prefix("bookstack:")
            .is_some_and(|rest| split_inline_comment(rest).0.trim().is_empty())
    })?;
    let body_end = lines[header + 1..]
        .iter()
        .position(|line| is_top_level_content(line))
        .map_or(lines.len(), |offset| header + 1 + offset);
    let indent = lines[header + 1..body_end]
        .iter()
        .find(|line| !is_blank_or_comment(line))
        .map_or(2, |line| indentation(line));

    let mut inserted = 0;
    for (key, value) in [("api_token_id", token_id), ("api_token_secret", token_secret)] {
        let rendered = serde_json::to_string(value).ok()?;
        let existing = (header + 1..body_end + inserted).find(|&index| {
            let line = &lines[index];
            indentation(line) == indent
                && line.trim_start().strip_prefix(key).is_some_and(|rest| rest.starts_with(':'))
        });
        match existing {
            Some(index) => {
                let line = &lines[index];
                let after_key = &line.trim_start()[key.len() + 1..];
                let (_, comment) = split_inline_comment(after_key);
                let replacement = format!("{}{key}: {rendered}{comment}", " ".repeat(indent));
                lines[index] = replacement;
            }
            None => {
                lines.insert(
                    header + 1 + inserted,
                    format!("{}{key}: {rendered}", " ".repeat(indent)),
                );
                inserted += 1;
            }
        }
    }

    let mut patched = lines.join("\n");
    if content.ends_with('\n') {
        patched.push('\n');
    }
    Some(patched)
}

fn reserialize_with_tokens(mut root: Value, token_id: &str, token_secret: &str) -> Result<String> {
    if root.is_null() {
        root = Value::Mapping(Mapping::new());
    }
    let root_mapping = root
        .as_mapping_mut()
        .ok_or_else(|| anyhow::anyhow!("top-level YAML must be a mapping"))?;
    let bookstack_entry = root_mapping
        .entry(Value::from("bookstack"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if bookstack_entry.is_null() {
        *bookstack_entry = Value::Mapping(Mapping::new());
    }
    let bookstack = bookstack_entry
        .as_mapping_mut()
        .ok_or_else(|| anyhow::anyhow!("`bookstack` must be a mapping"))?;
    bookstack.insert(Value::from("api_token_id"), Value::from(token_id));
    bookstack.insert(Value::from("api_token_secret"), Value::from(token_secret));
    serde_yaml::to_string(&root).context("failed to serialize config YAML")
}

fn indentation(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn is_blank_or_comment(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn is_top_level_content(line: &str) -> bool {
    !is_blank_or_comment(line) && indentation(line) == 0
}

// Splits `value  # note` into the value and the comment (with its leading
// whitespace); `#` inside quotes is part of the value.
fn split_inline_comment(text: &str) -> (&str, &str) {
    let mut quote = None;
    let mut previous = ' ';
    for (index, ch) in text.char_indices() {
        match (quote, ch) {
            (None, '"' | '\'') => quote = Some(ch),
            (Some(open), _) if ch == open => quote = None,
            (None, '#') if previous.is_whitespace() => {
                let value = &text[..index];
                let trimmed = value.trim_end();
                return (trimmed, &text[trimmed.len()..]);
            }
            _ => {}
        }
        previous = ch;
    }
    (text, "")
}

fn default_audit_timeout_secs() -> u64 {
    DEFAULT_AUDIT_TIMEOUT_SECS
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

// `books` is a mapping keyed by an arbitrary identifier; declaration order drives
// reconciliation order, so it is kept as a list.
fn deserialize_books<'de, D>(deserializer: D) -> std::result::Result<Vec<BookEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let mapping = Option::<Mapping>::deserialize(deserializer)?.unwrap_or_default();
    let mut entries = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let key = match key {
            Value::String(key) => key,
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            other => {
                return Err(D::Error::custom(format!(
                    "unsupported book key: {other:?}"
                )));
            }
        };
        let book: BookConfig = serde_yaml::from_value(value)
            .map_err(|error| D::Error::custom(format!("book `{key}`: {error}")))?;
        entries.push(BookEntry { key, book });
    }
    Ok(entries)
}
