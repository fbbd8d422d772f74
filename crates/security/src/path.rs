//! Path validation: filesystem containment to allowed roots.
//!
//! Ensures file operations can only touch paths that resolve under an
//! allowed root and never under a forbidden prefix (e.g., ~/.ssh, /etc).
//! Forbidden prefixes always win, even when they sit inside an allowed root.

use std::path::{Component, Path, PathBuf};

use toolgate_core::GateError;

/// Error returned when path validation fails.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PathValidationError {
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Path '{path}' is outside allowed roots")]
    OutsideAllowedRoots { path: String },

    #[error("Path '{path}' is under a forbidden prefix")]
    ForbiddenPath { path: String },
}

impl From<PathValidationError> for GateError {
    fn from(err: PathValidationError) -> Self {
        match err {
            PathValidationError::InvalidPath { .. } => GateError::InvalidInput(err.to_string()),
            _ => GateError::AccessDenied(err.to_string()),
        }
    }
}

/// What the caller intends to do with the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathAccess {
    /// Target must exist.
    Read,
    /// Target may be missing; its parent is checked too.
    Write,
}

#[derive(Debug, Clone)]
struct Root {
    /// Symlink-free form, used for the final check.
    canonical: PathBuf,
    /// As configured (absolute, `..`-free), used for the lexical pre-check.
    lexical: PathBuf,
}

/// Canonicalizes paths and decides read/write admissibility.
#[derive(Debug, Clone)]
pub struct PathGuard {
    roots: Vec<Root>,
    /// Lowercased, `/`-separated forbidden prefixes.
    forbidden: Vec<String>,
}

impl PathGuard {
    /// Build a guard from configured roots and forbidden prefixes.
    ///
    /// Roots are resolved once here; a root that does not exist is skipped
    /// because nothing can resolve beneath it.
    pub fn new(allowed_roots: &[String], forbidden_paths: &[String]) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

        let mut roots = Vec::new();
        for raw in allowed_roots {
            let lexical = normalize_lexically(&absolutize(Path::new(&expand_tilde(raw)), &cwd));
            match lexical.canonicalize() {
                Ok(canonical) => roots.push(Root { canonical, lexical }),
                Err(e) => tracing::warn!(root = %raw, error = %e, "Skipping unresolvable allowed root"),
            }
        }

        let mut forbidden = Vec::new();
        for raw in forbidden_paths {
            let lexical = normalize_lexically(&absolutize(Path::new(&expand_tilde(raw)), &cwd));
            if let Ok(canonical) = lexical.canonicalize()
                && canonical != lexical
            {
                forbidden.push(normalize_for_match(&canonical));
            }
            forbidden.push(normalize_for_match(&lexical));
        }

        Self { roots, forbidden }
    }

    /// Resolved allowed roots, in configuration order.
    pub fn roots(&self) -> Vec<&Path> {
        self.roots.iter().map(|r| r.canonical.as_path()).collect()
    }

    /// Directory relative paths are resolved against.
    pub fn base_dir(&self) -> Option<&Path> {
        self.roots.first().map(|r| r.canonical.as_path())
    }

    /// Whether a forbidden prefix lies at or below `dir`.
    pub fn covers_forbidden(&self, dir: &Path) -> bool {
        let dir = normalize_for_match(dir);
        self.forbidden
            .iter()
            .any(|prefix| is_under_prefix(prefix, &dir))
    }

    /// Validate `path` for `access` and return its canonical form.
    ///
    /// Checks, in order:
    /// 1. Input is non-empty and free of NUL bytes
    /// 2. The lexically normalized path is inside a root and not forbidden
    ///    (denies outside paths without probing the filesystem)
    /// 3. The path resolves (symlinks and `..` followed); reads require it to exist
    /// 4. The resolved path is inside a root and not forbidden
    /// 5. For writes, the resolved parent directory passes the same checks
    pub fn validate(&self, path: &str, access: PathAccess) -> Result<PathBuf, PathValidationError> {
        if path.trim().is_empty() {
            return Err(PathValidationError::InvalidPath {
                path: path.into(),
                reason: "path is empty".into(),
            });
        }
        if path.contains('\0') {
            return Err(PathValidationError::InvalidPath {
                path: path.escape_default().to_string(),
                reason: "path contains a NUL byte".into(),
            });
        }

        let base = self
            .base_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let absolute = absolutize(Path::new(&expand_tilde(path)), &base);
        let lexical = normalize_lexically(&absolute);

        self.check_policy(path, &lexical, true)?;

        let canonical = match access {
            PathAccess::Read => resolve_existing(path, &absolute)?,
            PathAccess::Write => resolve_for_write(path, &absolute, &lexical)?,
        };

        self.check_policy(path, &canonical, false)?;

        if access == PathAccess::Write {
            if canonical.is_dir() {
                return Err(PathValidationError::InvalidPath {
                    path: path.into(),
                    reason: "target is a directory".into(),
                });
            }
            let parent = canonical
                .parent()
                .ok_or_else(|| PathValidationError::InvalidPath {
                    path: path.into(),
                    reason: "target has no parent directory".into(),
                })?;
            self.check_policy(path, parent, false)?;
        }

        Ok(canonical)
    }

    fn check_policy(
        &self,
        raw: &str,
        candidate: &Path,
        lexical: bool,
    ) -> Result<(), PathValidationError> {
        let inside = self.roots.iter().any(|root| {
            candidate.starts_with(&root.canonical) || (lexical && candidate.starts_with(&root.lexical))
        });
        if !inside {
            return Err(PathValidationError::OutsideAllowedRoots { path: raw.into() });
        }

        let normalized = normalize_for_match(candidate);
        if self
            .forbidden
            .iter()
            .any(|prefix| is_under_prefix(&normalized, prefix))
        {
            return Err(PathValidationError::ForbiddenPath { path: raw.into() });
        }

        Ok(())
    }
}

fn resolve_existing(raw: &str, absolute: &Path) -> Result<PathBuf, PathValidationError> {
    absolute.canonicalize().map_err(|e| PathValidationError::InvalidPath {
        path: raw.into(),
        reason: match e.kind() {
            std::io::ErrorKind::NotFound => "path does not exist".into(),
            _ => e.to_string(),
        },
    })
}

/// Resolve a write target that may not exist yet: canonicalize the deepest
/// existing ancestor and re-attach the missing tail.
fn resolve_for_write(
    raw: &str,
    absolute: &Path,
    lexical: &Path,
) -> Result<PathBuf, PathValidationError> {
    if absolute.symlink_metadata().is_ok() {
        return resolve_existing(raw, absolute);
    }

    let mut existing = lexical.to_path_buf();
    let mut tail = Vec::new();
    while existing.symlink_metadata().is_err() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => {
                return Err(PathValidationError::InvalidPath {
                    path: raw.into(),
                    reason: "no existing ancestor directory".into(),
                });
            }
        }
    }

    let mut resolved = resolve_existing(raw, &existing)?;
    if !resolved.is_dir() {
        return Err(PathValidationError::InvalidPath {
            path: raw.into(),
            reason: format!("ancestor '{}' is not a directory", existing.display()),
        });
    }
    for name in tail.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn normalize_for_match(path: &Path) -> String {
    let s = path.to_string_lossy().replace('\\', "/").to_lowercase();
    // Strip the Windows extended-length prefix (\\?\) that canonicalize() adds.
    let s = s.strip_prefix("//?/").unwrap_or(&s);
    if s.len() > 1 {
        s.trim_end_matches('/').to_string()
    } else {
        s.to_string()
    }
}

/// Component-boundary prefix match on normalized strings.
fn is_under_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Expand ~ to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if (path.starts_with("~/") || path == "~")
        && let Ok(home) = home_dir()
    {
        return path.replacen('~', &home, 1);
    }
    path.to_string()
}

fn home_dir() -> Result<String, std::env::VarError> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::write(root.join("notes.txt"), "hello").unwrap();
        std::fs::create_dir(root.join("secrets")).unwrap();
        std::fs::write(root.join("secrets").join("key.pem"), "-----").unwrap();
        (dir, root)
    }

    fn guard_for(root: &Path, forbidden: &[&Path]) -> PathGuard {
        PathGuard::new(
            &[root.display().to_string()],
            &forbidden
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn read_inside_root_returns_canonical() {
        let (_dir, root) = workspace();
        let guard = guard_for(&root, &[]);
        let resolved = guard
            .validate(&root.join("notes.txt").display().to_string(), PathAccess::Read)
            .unwrap();
        assert_eq!(resolved, root.join("notes.txt"));
    }

    #[test]
    fn relative_path_resolves_against_first_root() {
        let (_dir, root) = workspace();
        let guard = guard_for(&root, &[]);
        let resolved = guard.validate("./notes.txt", PathAccess::Read).unwrap();
        assert_eq!(resolved, root.join("notes.txt"));
    }

    #[test]
    fn traversal_out_of_root_denied() {
        let (_dir, root) = workspace();
        let guard = guard_for(&root, &[]);
        let result = guard.validate("../../../etc/passwd", PathAccess::Read);
        assert!(matches!(
            result,
            Err(PathValidationError::OutsideAllowedRoots { .. })
        ));
    }

    #[test]
    fn absolute_outside_path_denied_for_both_ops() {
        let (_dir, root) = workspace();
        let guard = guard_for(&root, &[]);
        for access in [PathAccess::Read, PathAccess::Write] {
            let result = guard.validate("/etc/passwd", access);
            assert!(matches!(
                result,
                Err(PathValidationError::OutsideAllowedRoots { .. })
            ));
        }
    }

    #[test]
    fn outside_missing_path_is_denied_not_invalid() {
        let (_dir, root) = workspace();
        let guard = guard_for(&root, &[]);
        // Must not reveal whether the file exists.
        let result = guard.validate("/definitely/not/here.txt", PathAccess::Read);
        assert!(matches!(
            result,
            Err(PathValidationError::OutsideAllowedRoots { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_root_denied() {
        let (_dir, root) = workspace();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("loot.txt");
        std::fs::write(&target, "loot").unwrap();
        std::os::unix::fs::symlink(&target, root.join("link.txt")).unwrap();

        let guard = guard_for(&root, &[]);
        let result = guard.validate(&root.join("link.txt").display().to_string(), PathAccess::Read);
        assert!(matches!(
            result,
            Err(PathValidationError::OutsideAllowedRoots { .. })
        ));
    }

    #[test]
    fn forbidden_wins_under_allowed_root() {
        let (_dir, root) = workspace();
        let secrets = root.join("secrets");
        let guard = guard_for(&root, &[&secrets]);
        let result = guard.validate(
            &secrets.join("key.pem").display().to_string(),
            PathAccess::Read,
        );
        assert!(matches!(result, Err(PathValidationError::ForbiddenPath { .. })));
    }

    #[test]
    fn forbidden_match_is_case_insensitive() {
        let (_dir, root) = workspace();
        let upper = PathBuf::from(root.join("SECRETS").display().to_string());
        let guard = guard_for(&root, &[&upper]);
        let result = guard.validate("secrets/key.pem", PathAccess::Read);
        assert!(matches!(result, Err(PathValidationError::ForbiddenPath { .. })));
    }

    #[test]
    fn forbidden_prefix_respects_component_boundary() {
        let (_dir, root) = workspace();
        std::fs::write(root.join("secrets-public.txt"), "ok").unwrap();
        let guard = guard_for(&root, &[&root.join("secrets")]);
        assert!(guard.validate("secrets-public.txt", PathAccess::Read).is_ok());
    }

    #[test]
    fn read_missing_file_is_invalid() {
        let (_dir, root) = workspace();
        let guard = guard_for(&root, &[]);
        let result = guard.validate("missing.txt", PathAccess::Read);
        match result {
            Err(PathValidationError::InvalidPath { reason, .. }) => {
                assert!(reason.contains("does not exist"));
            }
            other => panic!("Expected InvalidPath, got: {other:?}"),
        }
    }

    #[test]
    fn write_new_nested_file_allowed() {
        let (_dir, root) = workspace();
        let guard = guard_for(&root, &[]);
        let resolved = guard
            .validate("out/deeper/report.md", PathAccess::Write)
            .unwrap();
        assert_eq!(resolved, root.join("out").join("deeper").join("report.md"));
        assert!(!root.join("out").exists(), "validation must not create anything");
    }

    #[test]
    fn write_into_forbidden_parent_denied() {
        let (_dir, root) = workspace();
        let guard = guard_for(&root, &[&root.join("secrets")]);
        let result = guard.validate("secrets/new.pem", PathAccess::Write);
        assert!(matches!(result, Err(PathValidationError::ForbiddenPath { .. })));
    }

    #[test]
    fn write_to_root_itself_denied() {
        let (_dir, root) = workspace();
        let guard = guard_for(&root, &[]);
        let result = guard.validate(&root.display().to_string(), PathAccess::Write);
        assert!(result.is_err());
    }

    #[test]
    fn empty_roots_deny_everything() {
        let (_dir, root) = workspace();
        let guard = PathGuard::new(&[], &[]);
        let result = guard.validate(&root.join("notes.txt").display().to_string(), PathAccess::Read);
        assert!(matches!(
            result,
            Err(PathValidationError::OutsideAllowedRoots { .. })
        ));
    }

    #[test]
    fn empty_and_nul_paths_invalid() {
        let (_dir, root) = workspace();
        let guard = guard_for(&root, &[]);
        assert!(matches!(
            guard.validate("   ", PathAccess::Read),
            Err(PathValidationError::InvalidPath { .. })
        ));
        assert!(matches!(
            guard.validate("notes\0.txt", PathAccess::Read),
            Err(PathValidationError::InvalidPath { .. })
        ));
    }

    #[test]
    fn multiple_roots_any_match_allowed() {
        let (_a, root_a) = workspace();
        let (_b, root_b) = workspace();
        let guard = PathGuard::new(
            &[root_a.display().to_string(), root_b.display().to_string()],
            &[],
        );
        assert!(guard
            .validate(&root_b.join("notes.txt").display().to_string(), PathAccess::Read)
            .is_ok());
        assert_eq!(guard.roots().len(), 2);
    }

    #[test]
    fn errors_map_to_gate_taxonomy() {
        let denied: GateError = PathValidationError::ForbiddenPath { path: "/etc".into() }.into();
        assert!(matches!(denied, GateError::AccessDenied(_)));
        let invalid: GateError = PathValidationError::InvalidPath {
            path: "".into(),
            reason: "path is empty".into(),
        }
        .into();
        assert!(matches!(invalid, GateError::InvalidInput(_)));
    }

    #[test]
    fn lexical_normalization() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_lexically(Path::new("/../../x")), PathBuf::from("/x"));
    }

    #[test]
    fn covers_forbidden_looks_below_dir() {
        let (_tmp, root) = workspace();
        let secrets = root.join("secrets");
        let guard = guard_for(&root, &[&secrets]);
        assert!(guard.covers_forbidden(&root));
        assert!(guard.covers_forbidden(&secrets));
        assert!(!guard.covers_forbidden(&root.join("src")));
        assert!(guard.covers_forbidden(Path::new("/")));
    }
}
