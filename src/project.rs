//! Project-local working directory (`.xcbolt/`)

use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Entries the project `.gitignore` must carry.
const GITIGNORE_ENTRIES: &[&str] = &["DerivedData/", "Results/"];

/// Paths under `<root>/.xcbolt`.
#[derive(Debug, Clone)]
pub struct ProjectDirs {
    pub root: PathBuf,
    pub base: PathBuf,
    pub derived_data: PathBuf,
    pub results: PathBuf,
}

impl ProjectDirs {
    pub fn new(root: &Path) -> Self {
        let base = root.join(".xcbolt");
        Self {
            root: root.to_path_buf(),
            derived_data: base.join("DerivedData"),
            results: base.join("Results"),
            base,
        }
    }

    /// Create the directory layout and keep the `.gitignore` entries present.
    pub fn ensure(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.derived_data)?;
        fs::create_dir_all(&self.results)?;
        self.ensure_gitignore()
    }

    fn ensure_gitignore(&self) -> std::io::Result<()> {
        let path = self.base.join(".gitignore");
        let existing = fs::read_to_string(&path).unwrap_or_default();
        let present: Vec<&str> = existing.lines().map(str::trim).collect();
        let missing: Vec<&str> = GITIGNORE_ENTRIES
            .iter()
            .copied()
            .filter(|entry| !present.contains(entry))
            .collect();
        if missing.is_empty() && !existing.is_empty() {
            return Ok(());
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let mut out = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            out.push('\n');
        }
        for entry in missing {
            out.push_str(entry);
            out.push('\n');
        }
        file.write_all(out.as_bytes())
    }

    /// Result bundle path for a pipeline invocation starting now.
    pub fn result_bundle_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.results
            .join(format!("{}.xcresult", at.format("%Y%m%d-%H%M%S")))
    }
}

/// What `clean` should remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanSelection {
    pub derived_data: bool,
    pub results: bool,
    pub sessions: bool,
    pub spm_cache: bool,
}

impl CleanSelection {
    pub fn all() -> Self {
        Self {
            derived_data: true,
            results: true,
            sessions: true,
            spm_cache: true,
        }
    }
}

/// Remove the selected artifacts, returning the paths actually deleted.
pub fn clean(dirs: &ProjectDirs, selection: CleanSelection) -> std::io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let mut targets: Vec<PathBuf> = Vec::new();
    if selection.derived_data {
        targets.push(dirs.derived_data.clone());
    }
    if selection.results {
        targets.push(dirs.results.clone());
    }
    if selection.sessions {
        targets.push(dirs.base.join("sessions.json"));
    }
    if selection.spm_cache {
        if let Some(cache) = spm_cache_path() {
            targets.push(cache);
        }
    }
    for target in targets {
        if !target.exists() {
            continue;
        }
        if target.is_dir() {
            fs::remove_dir_all(&target)?;
        } else {
            fs::remove_file(&target)?;
        }
        removed.push(target);
    }
    Ok(removed)
}

/// SwiftPM's global checkout cache under the user's home.
fn spm_cache_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("Library/Caches/org.swift.swiftpm"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_layout_and_gitignore() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dirs = ProjectDirs::new(dir.path());
        dirs.ensure().expect("ensure");

        assert!(dirs.derived_data.is_dir());
        assert!(dirs.results.is_dir());
        let gitignore = fs::read_to_string(dirs.base.join(".gitignore")).unwrap();
        assert!(gitignore.contains("DerivedData/"));
        assert!(gitignore.contains("Results/"));
    }

    #[test]
    fn gitignore_entries_never_duplicate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dirs = ProjectDirs::new(dir.path());
        dirs.ensure().expect("first");
        dirs.ensure().expect("second");
        let gitignore = fs::read_to_string(dirs.base.join(".gitignore")).unwrap();
        assert_eq!(
            gitignore.matches("DerivedData/").count(),
            1,
            "repeated ensure must not re-append"
        );
    }

    #[test]
    fn gitignore_preserves_user_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dirs = ProjectDirs::new(dir.path());
        fs::create_dir_all(&dirs.base).unwrap();
        fs::write(dirs.base.join(".gitignore"), "scratch/\n").unwrap();
        dirs.ensure().expect("ensure");
        let gitignore = fs::read_to_string(dirs.base.join(".gitignore")).unwrap();
        assert!(gitignore.starts_with("scratch/\n"));
        assert!(gitignore.contains("Results/"));
    }

    #[test]
    fn result_bundle_path_is_timestamped() {
        let dirs = ProjectDirs::new(Path::new("/work"));
        let at = DateTime::parse_from_rfc3339("2026-03-14T09:26:53Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            dirs.result_bundle_path(at),
            PathBuf::from("/work/.xcbolt/Results/20260314-092653.xcresult")
        );
    }

    #[test]
    fn clean_removes_only_the_selection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dirs = ProjectDirs::new(dir.path());
        dirs.ensure().expect("ensure");
        fs::write(dirs.base.join("sessions.json"), "{}").unwrap();

        let removed = clean(
            &dirs,
            CleanSelection {
                derived_data: true,
                results: false,
                sessions: false,
                spm_cache: false,
            },
        )
        .expect("clean");
        assert_eq!(removed, vec![dirs.derived_data.clone()]);
        assert!(dirs.results.is_dir());
        assert!(dirs.base.join("sessions.json").exists());
    }
}
