use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const CONFIG_FILENAME: &str = "tabxtool.toml";
pub const DEFAULT_OUTPUT_DIR: &str = "output";

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
    pub project_root: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub output_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub output_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    /// Layout rooted at `project_root` with every other path defaulted.
    pub fn under(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            output_dir: project_root.join(DEFAULT_OUTPUT_DIR),
            config_path: project_root.join(CONFIG_FILENAME),
            root_source: ValueSource::Flag,
            output_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\noutput_dir={} ({})\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.output_dir),
            self.output_source.as_str(),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

pub fn resolve_paths(context: &ResolutionContext, overrides: &PathOverrides) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);

    let (output_dir, output_source) = if let Some(path) = overrides.output_dir.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = lookup_env("TABXTOOL_OUTPUT_DIR") {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (project_root.join(DEFAULT_OUTPUT_DIR), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = lookup_env("TABXTOOL_CONFIG") {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (project_root.join(CONFIG_FILENAME), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        project_root,
        output_dir,
        config_path,
        root_source,
        output_source,
        config_source,
    })
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }
    if let Some(value) = lookup_env("TABXTOOL_PROJECT_ROOT") {
        return (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        );
    }

    // Nearest ancestor carrying a config file, else the working directory.
    for candidate in context.cwd.ancestors() {
        if candidate.join(CONFIG_FILENAME).exists() {
            return (candidate.to_path_buf(), ValueSource::Heuristic);
        }
    }
    (context.cwd.clone(), ValueSource::Default)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext { cwd };
        let env = HashMap::from([(
            "TABXTOOL_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(resolved.output_dir, from_flag.join("output"));
        assert_eq!(resolved.config_path, from_flag.join(CONFIG_FILENAME));
    }

    #[test]
    fn resolve_paths_finds_config_in_ancestor() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("input").join("csv");
        fs::create_dir_all(&nested).expect("create nested");
        fs::write(root.join(CONFIG_FILENAME), "").expect("write config");

        let resolved = resolve_paths_with_lookup(
            &ResolutionContext { cwd: nested },
            &PathOverrides::default(),
            |_| None,
        )
        .expect("resolve paths");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn relative_output_dir_is_resolved_against_project_root() {
        let temp = tempdir().expect("tempdir");
        let overrides = PathOverrides {
            project_root: Some(temp.path().to_path_buf()),
            ..PathOverrides::default()
        };
        let env = HashMap::from([("TABXTOOL_OUTPUT_DIR".to_string(), "build/chunks".to_string())]);

        let resolved = resolve_paths_with_lookup(
            &ResolutionContext {
                cwd: temp.path().to_path_buf(),
            },
            &overrides,
            |key| env.get(key).cloned(),
        )
        .expect("resolve paths");
        assert_eq!(resolved.output_dir, temp.path().join("build/chunks"));
        assert_eq!(resolved.output_source, ValueSource::Env);
        assert!(resolved.diagnostics().contains("output_dir="));
    }
}
