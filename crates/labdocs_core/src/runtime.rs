use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{DEFAULT_CONFIG_FILENAME, DEFAULT_RESULTS_DIR, LabDocsConfig};

pub const TEMPLATES_DIRNAME: &str = "templates";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub config: Option<PathBuf>,
    pub templates_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub config_path: PathBuf,
    pub templates_dir: PathBuf,
    pub config_source: ValueSource,
    pub templates_source: ValueSource,
}

impl ResolvedPaths {
    pub fn config_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "config_path={} ({})\ntemplates_dir={} ({})",
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.templates_dir),
            self.templates_source.as_str(),
        )
    }
}

pub fn resolve_paths(overrides: &PathOverrides, context: &ResolutionContext) -> ResolvedPaths {
    resolve_paths_with_lookup(overrides, context, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    overrides: &PathOverrides,
    context: &ResolutionContext,
    lookup: F,
) -> ResolvedPaths
where
    F: Fn(&str) -> Option<String>,
{
    let (config_path, config_source) = resolve_config_path(overrides, context, &lookup);
    let config_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| context.cwd.clone());

    let (templates_dir, templates_source) = match &overrides.templates_dir {
        Some(dir) => (absolutize(dir, &context.cwd), ValueSource::Flag),
        None => (config_dir.join(TEMPLATES_DIRNAME), ValueSource::Default),
    };

    ResolvedPaths {
        config_path,
        templates_dir,
        config_source,
        templates_source,
    }
}

// A relative config path is tried against the working directory first and then
// against the directory holding the executable.
fn resolve_config_path<F>(
    overrides: &PathOverrides,
    context: &ResolutionContext,
    lookup: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    let (requested, source) = if let Some(path) = &overrides.config {
        (path.clone(), ValueSource::Flag)
    } else if let Some(value) = lookup("LABDOCS_CONFIG").filter(|value| !value.trim().is_empty())
    {
        (PathBuf::from(value.trim()), ValueSource::Env)
    } else {
        (PathBuf::from(DEFAULT_CONFIG_FILENAME), ValueSource::Default)
    };

    if requested.is_absolute() {
        return (requested, source);
    }
    let from_cwd = context.cwd.join(&requested);
    if from_cwd.exists() {
        return (from_cwd, source);
    }
    if let Some(executable_dir) = &context.executable_dir {
        let beside_executable = executable_dir.join(&requested);
        if beside_executable.exists() {
            return (beside_executable, ValueSource::Heuristic);
        }
    }
    (from_cwd, source)
}

/// Expand `~` and `$VAR` and anchor relative results to `base`.
pub fn expand_path(raw: &str, base: &Path) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw.trim())
        .with_context(|| format!("failed to expand path `{raw}`"))?;
    Ok(absolutize(Path::new(expanded.as_ref()), base))
}

pub fn resolve_results_dir(config: &LabDocsConfig, paths: &ResolvedPaths) -> Result<PathBuf> {
    let raw = config
        .audit
        .results_dir
        .as_deref()
        .unwrap_or(DEFAULT_RESULTS_DIR);
    expand_path(raw, paths.config_dir())
}

pub fn resolve_audit_script(config: &LabDocsConfig, paths: &ResolvedPaths) -> Result<Option<PathBuf>> {
    match config.audit.script.as_deref() {
        Some(raw) if !raw.trim().is_empty() => expand_path(raw, paths.config_dir()).map(Some),
        _ => Ok(None),
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use tempfile::tempdir;

    fn context(cwd: &Path, executable_dir: Option<&Path>) -> ResolutionContext {
        ResolutionContext {
            cwd: cwd.to_path_buf(),
            executable_dir: executable_dir.map(Path::to_path_buf),
        }
    }

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let overrides = PathOverrides {
            config: Some(temp.path().join("flag.yaml")),
            templates_dir: None,
        };
        let paths = resolve_paths_with_lookup(&overrides, &context(temp.path(), None), |key| {
            (key == "LABDOCS_CONFIG").then(|| "/elsewhere/env.yaml".to_string())
        });
        assert_eq!(paths.config_path, temp.path().join("flag.yaml"));
        assert_eq!(paths.config_source, ValueSource::Flag);
        assert_eq!(paths.templates_dir, temp.path().join("templates"));
        assert_eq!(paths.templates_source, ValueSource::Default);
    }

    #[test]
    fn resolve_paths_uses_env_when_no_flag() {
        let temp = tempdir().expect("tempdir");
        let paths = resolve_paths_with_lookup(
            &PathOverrides::default(),
            &context(temp.path(), None),
            |key| (key == "LABDOCS_CONFIG").then(|| "/etc/labdocs/config.yaml".to_string()),
        );
        assert_eq!(paths.config_path, PathBuf::from("/etc/labdocs/config.yaml"));
        assert_eq!(paths.config_source, ValueSource::Env);
        assert_eq!(paths.templates_dir, PathBuf::from("/etc/labdocs/templates"));
    }

    #[test]
    fn relative_config_falls_back_to_executable_dir() {
        let cwd = tempdir().expect("cwd");
        let install = tempdir().expect("install");
        fs::write(install.path().join("config.yaml"), "books: {}\n").expect("write config");

        let paths = resolve_paths_with_lookup(
            &PathOverrides::default(),
            &context(cwd.path(), Some(install.path())),
            |_| None,
        );
        assert_eq!(paths.config_path, install.path().join("config.yaml"));
        assert_eq!(paths.config_source, ValueSource::Heuristic);
    }

    #[test]
    fn templates_flag_overrides_config_dir() {
        let temp = tempdir().expect("tempdir");
        let overrides = PathOverrides {
            config: None,
            templates_dir: Some(PathBuf::from("custom")),
        };
        let paths = resolve_paths_with_lookup(&overrides, &context(temp.path(), None), |_| None);
        assert_eq!(paths.templates_dir, temp.path().join("custom"));
        assert_eq!(paths.templates_source, ValueSource::Flag);
        assert!(paths.diagnostics().contains("(flag)"));
    }

    #[test]
    fn results_dir_is_anchored_to_config_dir() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths {
            config_path: temp.path().join("config.yaml"),
            templates_dir: temp.path().join("templates"),
            config_source: ValueSource::Flag,
            templates_source: ValueSource::Default,
        };
        let mut config = LabDocsConfig::default();
        assert_eq!(
            resolve_results_dir(&config, &paths).expect("default"),
            temp.path().join(DEFAULT_RESULTS_DIR)
        );

        config.audit.results_dir = Some("/var/lib/audit".to_string());
        assert_eq!(
            resolve_results_dir(&config, &paths).expect("absolute"),
            PathBuf::from("/var/lib/audit")
        );
        assert!(resolve_audit_script(&config, &paths).expect("script").is_none());
    }
}
