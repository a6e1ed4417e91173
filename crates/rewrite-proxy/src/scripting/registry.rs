//! Discovery and compilation of the transformation scripts.
//!
//! The registry is built once at startup and is read-only afterwards. Entries
//! are ordered by file name (byte-wise), which is the order scripts run in and
//! the order their proposals are reconciled in.

use rhai::AST;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::rhai_validator::RhaiValidator;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read script directory {}: {source}", dir.display())]
    Unreadable {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no scripts matching `*{suffix}` found in {}", dir.display())]
    NoScripts { dir: PathBuf, suffix: String },
}

/// One compiled script.
#[derive(Debug, Clone)]
pub struct ScriptEntry {
    name: String,
    path: PathBuf,
    ast: Arc<AST>,
}

impl ScriptEntry {
    /// File name, used as the script's identity in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ast(&self) -> &AST {
        &self.ast
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptRegistry {
    entries: Vec<ScriptEntry>,
}

impl ScriptRegistry {
    /// Load every `*suffix` file in `dir`.
    ///
    /// A missing or unreadable directory, or one with no matching files, is an
    /// error. Individual files that fail to read or validate are skipped with
    /// a warning.
    pub fn load(
        dir: impl AsRef<Path>,
        suffix: &str,
        validator: &RhaiValidator,
    ) -> Result<Self, RegistryError> {
        let dir = dir.as_ref();
        let unreadable = |source| RegistryError::Unreadable {
            dir: dir.to_path_buf(),
            source,
        };

        let mut files = Vec::new();
        for entry in fs::read_dir(dir).map_err(unreadable)? {
            let entry = entry.map_err(unreadable)?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                debug!("Skipping directory {}", entry.path().display());
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => files.push((name, entry.path())),
                Err(name) => debug!("Skipping non UTF-8 file name {:?}", name),
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut candidates = 0usize;
        let mut entries = Vec::new();
        for (name, path) in files {
            if !name.ends_with(suffix) {
                debug!("Skipping {} (not a *{} file)", name, suffix);
                continue;
            }
            candidates += 1;

            let source = match fs::read_to_string(&path) {
                Ok(source) => source,
                Err(e) => {
                    warn!("Skipping script {}: {}", path.display(), e);
                    continue;
                }
            };
            match validator.validate(&source) {
                Ok(ast) => {
                    info!("Loaded script {}", path.display());
                    entries.push(ScriptEntry {
                        name,
                        path,
                        ast: Arc::new(ast),
                    });
                }
                Err(e) => warn!("Skipping script {}: {}", path.display(), e),
            }
        }

        if candidates == 0 {
            return Err(RegistryError::NoScripts {
                dir: dir.to_path_buf(),
                suffix: suffix.to_string(),
            });
        }
        if entries.is_empty() {
            warn!(
                "None of the {} scripts in {} could be loaded; responses will pass through unchanged",
                candidates,
                dir.display()
            );
        }

        Ok(Self { entries })
    }

    /// Build a registry from in-memory `(name, source)` pairs, applying the
    /// same ordering and skip rules as `load`.
    pub fn from_sources<'a>(
        sources: impl IntoIterator<Item = (&'a str, &'a str)>,
        validator: &RhaiValidator,
    ) -> Self {
        let mut sources: Vec<_> = sources.into_iter().collect();
        sources.sort_by(|a, b| a.0.cmp(b.0));

        let entries = sources
            .into_iter()
            .filter_map(|(name, source)| match validator.validate(source) {
                Ok(ast) => Some(ScriptEntry {
                    name: name.to_string(),
                    path: PathBuf::from(name),
                    ast: Arc::new(ast),
                }),
                Err(e) => {
                    warn!("Skipping script {}: {}", name, e);
                    None
                }
            })
            .collect();

        Self { entries }
    }

    pub fn entries(&self) -> &[ScriptEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(ScriptEntry::name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    const NOOP: &str = "fn modify(request, response) { () }";

    fn write(dir: &TempDir, name: &str, contents: &str) {
        fs::write(dir.path().join(name), contents).unwrap();
    }

    #[test]
    fn test_load_sorted_by_file_name() {
        let dir = TempDir::new().unwrap();
        write(&dir, "20-second.rhai", NOOP);
        write(&dir, "10-first.rhai", NOOP);
        write(&dir, "B.rhai", NOOP);
        write(&dir, "a.rhai", NOOP);

        let registry = ScriptRegistry::load(dir.path(), ".rhai", &RhaiValidator::default())
            .unwrap();

        assert_eq!(
            registry.names(),
            vec!["10-first.rhai", "20-second.rhai", "B.rhai", "a.rhai"]
        );
    }

    #[test]
    fn test_load_skips_other_suffixes_and_dirs() {
        let dir = TempDir::new().unwrap();
        write(&dir, "keep.rhai", NOOP);
        write(&dir, "README.md", "not a script");
        write(&dir, "old.rhai.bak", NOOP);
        fs::create_dir(dir.path().join("nested.rhai")).unwrap();

        let registry = ScriptRegistry::load(dir.path(), ".rhai", &RhaiValidator::default())
            .unwrap();

        assert_eq!(registry.names(), vec!["keep.rhai"]);
        assert_eq!(registry.entries()[0].path(), dir.path().join("keep.rhai"));
    }

    #[test]
    fn test_load_skips_invalid_scripts() {
        let dir = TempDir::new().unwrap();
        write(&dir, "1-broken.rhai", "fn modify(request, response) {");
        write(&dir, "2-wrong-name.rhai", "fn transform(request, response) { () }");
        write(&dir, "3-good.rhai", NOOP);

        let registry = ScriptRegistry::load(dir.path(), ".rhai", &RhaiValidator::default())
            .unwrap();

        assert_eq!(registry.names(), vec!["3-good.rhai"]);
    }

    #[test]
    #[traced_test]
    fn test_load_logs_skipped_scripts() {
        let dir = TempDir::new().unwrap();
        write(&dir, "1-broken.rhai", "fn modify(request, response) {");
        write(&dir, "2-good.rhai", NOOP);

        let registry = ScriptRegistry::load(dir.path(), ".rhai", &RhaiValidator::default())
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(logs_contain("Skipping script"));
        assert!(logs_contain("1-broken.rhai"));
        assert!(logs_contain("Loaded script"));
    }

    #[test]
    fn test_load_all_invalid_is_empty_not_error() {
        let dir = TempDir::new().unwrap();
        write(&dir, "broken.rhai", "fn modify(");

        let registry = ScriptRegistry::load(dir.path(), ".rhai", &RhaiValidator::default())
            .unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_no_candidates() {
        let dir = TempDir::new().unwrap();
        write(&dir, "script.lua", NOOP);

        let err = ScriptRegistry::load(dir.path(), ".rhai", &RhaiValidator::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoScripts { .. }));
        assert!(err.to_string().contains("*.rhai"));
    }

    #[test]
    fn test_load_missing_directory() {
        let err = ScriptRegistry::load(
            "/nonexistent/rewrite-proxy/scripts",
            ".rhai",
            &RhaiValidator::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::Unreadable { .. }));
    }

    #[test]
    fn test_custom_suffix() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.rhai", NOOP);
        write(&dir, "b.transform", NOOP);

        let registry =
            ScriptRegistry::load(dir.path(), ".transform", &RhaiValidator::default()).unwrap();
        assert_eq!(registry.names(), vec!["b.transform"]);
    }

    #[test]
    fn test_from_sources_sorts_and_skips() {
        let registry = ScriptRegistry::from_sources(
            [("b", NOOP), ("a", NOOP), ("c", "fn nope() {}")],
            &RhaiValidator::default(),
        );
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert_eq!(registry.len(), 2);
    }
}
