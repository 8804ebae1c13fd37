//! Workflow discovery
//!
//! Workflows come from three places, searched in this order:
//! `<dir>/workflows/` of the project, the user workflows directory, and the
//! samples compiled into the binary.

use super::WorkflowError;
use crate::config::{ConfigError, WorkflowConfig, WorkflowFormat, load_workflow_file, paths};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BUILTIN: &[(&str, &str)] = &[
    (
        "network-reset.toml",
        include_str!("../../workflows/samples/network-reset.toml"),
    ),
    (
        "dev-port-check.toml",
        include_str!("../../workflows/samples/dev-port-check.toml"),
    ),
    (
        "web-restart.toml",
        include_str!("../../workflows/samples/web-restart.toml"),
    ),
];

const EXTENSIONS: &[&str] = &["toml", "json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowSource {
    Project,
    User,
    Builtin,
    /// Loaded from an explicit file path
    File,
}

impl fmt::Display for WorkflowSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Project => "project",
            Self::User => "user",
            Self::Builtin => "builtin",
            Self::File => "file",
        })
    }
}

/// One discoverable workflow
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowEntry {
    pub name: String,
    pub description: String,
    pub source: WorkflowSource,
    /// File on disk; `None` for built-in samples
    pub path: Option<PathBuf>,
    pub steps: usize,
    /// Set when the file failed to load
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Finds workflows by name
#[derive(Debug, Clone, Default)]
pub struct WorkflowCatalog {
    project_dir: Option<PathBuf>,
    user_dir: Option<PathBuf>,
}

impl WorkflowCatalog {
    pub fn new(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
        }
    }

    /// Catalog for a working directory and the user's app directory
    pub fn discover(working_dir: &Path) -> Self {
        let user_dir = match paths::workflows_dir() {
            Ok(dir) => Some(dir),
            Err(e) => {
                warn!(error = %e, "user workflows directory unavailable");
                None
            }
        };
        Self::new(Some(working_dir.join("workflows")), user_dir)
    }

    fn directories(&self) -> impl Iterator<Item = (WorkflowSource, &Path)> {
        [
            (WorkflowSource::Project, self.project_dir.as_deref()),
            (WorkflowSource::User, self.user_dir.as_deref()),
        ]
        .into_iter()
        .filter_map(|(source, dir)| dir.map(|d| (source, d)))
    }

    /// Every workflow, first occurrence of a name wins
    pub fn list(&self) -> Vec<WorkflowEntry> {
        let mut entries: Vec<WorkflowEntry> = Vec::new();
        let mut push = |entry: WorkflowEntry| {
            if !entries.iter().any(|e| e.name == entry.name) {
                entries.push(entry);
            }
        };

        for (source, dir) in self.directories() {
            for path in workflow_files(dir) {
                push(entry_for_file(&path, source));
            }
        }
        for (file, contents) in BUILTIN {
            let path = Path::new(file);
            let entry = match parse_builtin(file, contents) {
                Ok(workflow) => WorkflowEntry {
                    name: workflow.name,
                    description: workflow.description,
                    source: WorkflowSource::Builtin,
                    path: None,
                    steps: workflow.steps.len(),
                    error: None,
                },
                Err(e) => WorkflowEntry {
                    name: stem(path),
                    description: String::new(),
                    source: WorkflowSource::Builtin,
                    path: None,
                    steps: 0,
                    error: Some(e.to_string()),
                },
            };
            push(entry);
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Load a workflow by name, or by path when `name` points at a file
    pub fn load(&self, name: &str) -> Result<(WorkflowConfig, WorkflowEntry), WorkflowError> {
        let as_path = Path::new(name);
        if as_path.is_file() {
            let workflow = load_workflow_file(as_path)?;
            let entry = WorkflowEntry {
                name: workflow.name.clone(),
                description: workflow.description.clone(),
                source: WorkflowSource::File,
                path: Some(as_path.to_path_buf()),
                steps: workflow.steps.len(),
                error: None,
            };
            return Ok((workflow, entry));
        }

        for (source, dir) in self.directories() {
            for ext in EXTENSIONS {
                let path = dir.join(format!("{name}.{ext}"));
                if path.is_file() {
                    debug!(path = %path.display(), %source, "loading workflow");
                    let workflow = load_workflow_file(&path)?;
                    let entry = WorkflowEntry {
                        name: workflow.name.clone(),
                        description: workflow.description.clone(),
                        source,
                        path: Some(path),
                        steps: workflow.steps.len(),
                        error: None,
                    };
                    return Ok((workflow, entry));
                }
            }
        }

        for (file, contents) in BUILTIN {
            if stem(Path::new(file)) == name {
                let workflow = parse_builtin(file, contents)?;
                let entry = WorkflowEntry {
                    name: workflow.name.clone(),
                    description: workflow.description.clone(),
                    source: WorkflowSource::Builtin,
                    path: None,
                    steps: workflow.steps.len(),
                    error: None,
                };
                return Ok((workflow, entry));
            }
        }

        Err(WorkflowError::NotFound {
            name: name.to_string(),
            available: self.list().into_iter().map(|e| e.name).collect(),
        })
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn parse_builtin(file: &str, contents: &str) -> Result<WorkflowConfig, ConfigError> {
    let path = Path::new(file);
    WorkflowConfig::parse(contents, WorkflowFormat::from_path(path)?, path)
}

fn workflow_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = read_dir
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    files
}

fn entry_for_file(path: &Path, source: WorkflowSource) -> WorkflowEntry {
    match load_workflow_file(path) {
        Ok(workflow) => WorkflowEntry {
            name: stem(path),
            description: workflow.description,
            source,
            path: Some(path.to_path_buf()),
            steps: workflow.steps.len(),
            error: None,
        },
        Err(e) => WorkflowEntry {
            name: stem(path),
            description: String::new(),
            source,
            path: Some(path.to_path_buf()),
            steps: 0,
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::tools::builtin_registry;
    use crate::workflow::validate_with;
    use tempfile::TempDir;

    const SIMPLE: &str = r#"
description = "from disk"

[[steps]]
action = "network.flush_dns"
"#;

    #[test]
    fn test_builtin_samples_are_valid() {
        let registry = builtin_registry(&AppConfig::default());
        let catalog = WorkflowCatalog::default();
        let entries = catalog.list();
        assert_eq!(entries.len(), BUILTIN.len());

        for entry in entries {
            assert!(entry.error.is_none(), "{}: {:?}", entry.name, entry.error);
            let (workflow, loaded) = catalog.load(&entry.name).unwrap();
            assert_eq!(loaded.source, WorkflowSource::Builtin);
            validate_with(&workflow, &registry).unwrap();
        }
    }

    #[test]
    fn test_lookup_order() {
        let project = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        std::fs::write(project.path().join("network-reset.toml"), SIMPLE).unwrap();
        std::fs::write(user.path().join("network-reset.toml"), SIMPLE).unwrap();
        std::fs::write(user.path().join("mine.json"), r#"{"steps":[{"action":"ports.urlacl"}]}"#)
            .unwrap();

        let catalog = WorkflowCatalog::new(
            Some(project.path().to_path_buf()),
            Some(user.path().to_path_buf()),
        );

        let (workflow, entry) = catalog.load("network-reset").unwrap();
        assert_eq!(entry.source, WorkflowSource::Project);
        assert_eq!(workflow.description, "from disk");

        let (workflow, entry) = catalog.load("mine").unwrap();
        assert_eq!(entry.source, WorkflowSource::User);
        assert_eq!(workflow.steps[0].name, "step-1");

        let (_, entry) = catalog.load("dev-port-check").unwrap();
        assert_eq!(entry.source, WorkflowSource::Builtin);

        let listed = catalog.list();
        let reset = listed.iter().find(|e| e.name == "network-reset").unwrap();
        assert_eq!(reset.source, WorkflowSource::Project);
        assert!(listed.iter().any(|e| e.name == "mine"));
    }

    #[test]
    fn test_load_by_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("adhoc.toml");
        std::fs::write(&path, SIMPLE).unwrap();

        let catalog = WorkflowCatalog::default();
        let (workflow, entry) = catalog.load(path.to_str().unwrap()).unwrap();
        assert_eq!(workflow.name, "adhoc");
        assert_eq!(entry.source, WorkflowSource::File);
    }

    #[test]
    fn test_not_found_lists_available() {
        let err = WorkflowCatalog::default().load("nope").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("'nope' not found"));
        assert!(message.contains("network-reset"));
    }

    #[test]
    fn test_broken_file_is_listed_with_error() {
        let project = TempDir::new().unwrap();
        std::fs::write(project.path().join("broken.toml"), "steps = 3").unwrap();
        std::fs::write(project.path().join("notes.txt"), "ignored").unwrap();

        let catalog = WorkflowCatalog::new(Some(project.path().to_path_buf()), None);
        let listed = catalog.list();
        let broken = listed.iter().find(|e| e.name == "broken").unwrap();
        assert!(broken.error.is_some());
        assert!(!listed.iter().any(|e| e.name == "notes"));
        assert!(matches!(catalog.load("broken"), Err(WorkflowError::Config(_))));
    }
}
