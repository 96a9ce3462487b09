//! Task manifest parsing.
//!
//! A manifest is a TOML file with one `[[task]]` table per task:
//!
//! ```toml
//! [[task]]
//! name = "numpy"
//! phase = "parallel"
//! workdir = "pkgs/numpy"
//! script = """
//! make
//! make test
//! """
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// When a task runs relative to the parallel window.
///
/// `setup` tasks run one at a time before the parallel phase, `serial`
/// tasks run one at a time after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Setup,
    #[default]
    Parallel,
    Serial,
}

impl Phase {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Parallel => "parallel",
            Self::Serial => "serial",
        }
    }
}

/// One `[[task]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDef {
    pub name: String,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    pub script: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskDef>,
}

impl Manifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read manifest {}: {e}", path.display()))?;
        let manifest: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse manifest {}: {e}", path.display()))?;
        Ok(manifest)
    }

    /// Tasks belonging to one phase, in manifest order.
    pub fn phase_tasks(&self, phase: Phase) -> Vec<&TaskDef> {
        self.tasks.iter().filter(|t| t.phase == phase).collect()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_tasks_with_default_phase() {
        let manifest: Manifest = toml::from_str(
            "[[task]]\nname = \"numpy\"\nscript = \"make test\"\n",
        )
        .unwrap();
        assert_eq!(manifest.tasks.len(), 1);
        assert_eq!(manifest.tasks[0].phase, Phase::Parallel);
        assert!(manifest.tasks[0].workdir.is_none());
    }

    #[test]
    fn parses_all_phases() {
        let manifest: Manifest = toml::from_str(
            r#"
            [[task]]
            name = "fetch"
            phase = "setup"
            script = "git fetch"

            [[task]]
            name = "build"
            script = "make"

            [[task]]
            name = "publish"
            phase = "serial"
            workdir = "dist"
            script = "make publish"
            "#,
        )
        .unwrap();
        assert_eq!(manifest.phase_tasks(Phase::Setup).len(), 1);
        assert_eq!(manifest.phase_tasks(Phase::Parallel).len(), 1);
        assert_eq!(manifest.phase_tasks(Phase::Serial).len(), 1);
        assert_eq!(
            manifest.tasks[2].workdir.as_deref(),
            Some(Path::new("dist"))
        );
    }

    #[test]
    fn rejects_unknown_phase() {
        let result: Result<Manifest, _> = toml::from_str(
            "[[task]]\nname = \"x\"\nphase = \"warp\"\nscript = \"true\"\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn empty_manifest_has_no_tasks() {
        let manifest: Manifest = toml::from_str("").unwrap();
        assert!(manifest.tasks.is_empty());
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Manifest::load(&dir.path().join("absent.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.toml");
        std::fs::write(&path, "[[task]]\nname = \"a\"\nscript = \"true\"\n").unwrap();
        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.tasks[0].name, "a");
    }
}
