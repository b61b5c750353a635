//! Executable discovery for the tndr language server
//!
//! Resolves the server binary from an explicit override, the PATH, or a
//! fallback list of well-known install directories derived from the Go
//! toolchain environment.

use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Binary names probed during discovery, in preference order
pub const SERVER_BINARY_NAMES: &[&str] = &["tndr", "t1"];

// ============================================================================
// Locator Errors
// ============================================================================

/// Errors from executable discovery
#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    /// Explicit override path does not point at an executable
    #[error("Configured server path is not an executable: {path}")]
    InvalidOverride { path: PathBuf },

    /// No candidate resolved to an executable
    #[error("No tndr executable found; searched: {}", candidates.join(", "))]
    NotFound { candidates: Vec<String> },
}

// ============================================================================
// Executable Locator
// ============================================================================

/// Locates the tndr server binary
///
/// Search order: explicit override, then each binary name on PATH, then each
/// binary name inside the fallback directory list. The first executable hit
/// wins; a miss reports every candidate that was probed.
pub struct ExecutableLocator {
    /// Explicit path override (skips discovery entirely when set)
    override_path: Option<PathBuf>,

    /// Fallback directories probed after PATH
    fallback_dirs: Vec<PathBuf>,
}

impl ExecutableLocator {
    /// Create a locator with fallback directories derived from the environment
    pub fn from_env() -> Self {
        Self {
            override_path: None,
            fallback_dirs: fallback_directories(),
        }
    }

    /// Create a locator with an explicit fallback directory list
    pub fn with_fallback_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            override_path: None,
            fallback_dirs: dirs,
        }
    }

    /// Set an explicit server path, bypassing discovery
    pub fn override_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.override_path = Some(path.into());
        self
    }

    /// Resolve the server binary path
    pub fn locate(&self) -> Result<PathBuf, LocatorError> {
        if let Some(path) = &self.override_path {
            return if is_executable(path) {
                debug!("Using configured server path: {}", path.display());
                Ok(path.clone())
            } else {
                Err(LocatorError::InvalidOverride { path: path.clone() })
            };
        }

        let mut candidates = Vec::new();

        // PATH lookup first, in binary-name preference order
        for name in SERVER_BINARY_NAMES {
            match which::which(name) {
                Ok(path) => {
                    debug!("Found {} on PATH: {}", name, path.display());
                    return Ok(path);
                }
                Err(_) => {
                    trace!("{} not found on PATH", name);
                    candidates.push(format!("{name} (PATH)"));
                }
            }
        }

        // Fallback directories next
        for dir in &self.fallback_dirs {
            for name in SERVER_BINARY_NAMES {
                let path = dir.join(name);
                if is_executable(&path) {
                    debug!("Found server in fallback location: {}", path.display());
                    return Ok(path);
                }
                candidates.push(path.to_string_lossy().to_string());
            }
        }

        Err(LocatorError::NotFound { candidates })
    }
}

/// Build the fallback directory list from the process environment
///
/// Mirrors where the Go toolchain installs binaries: GOBIN, GOPATH/bin,
/// GOROOT/bin, HOME/bin, HOME/go/bin (the implicit GOPATH default), then
/// common system prefixes.
fn fallback_directories() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(gobin) = env::var("GOBIN") {
        dirs.push(PathBuf::from(gobin));
    }
    if let Ok(gopath) = env::var("GOPATH") {
        dirs.push(PathBuf::from(gopath).join("bin"));
    }
    if let Ok(goroot) = env::var("GOROOT") {
        dirs.push(PathBuf::from(goroot).join("bin"));
    }
    if let Ok(home) = env::var("HOME") {
        let home = PathBuf::from(home);
        dirs.push(home.join("bin"));
        dirs.push(home.join("go").join("bin"));
    }

    dirs.push(PathBuf::from("/usr/local/bin"));
    dirs.push(PathBuf::from("/usr/bin"));
    dirs.push(PathBuf::from("/usr/local/go/bin"));
    dirs.push(PathBuf::from("/usr/local/share/go/bin"));
    dirs.push(PathBuf::from("/usr/share/go/bin"));

    dirs
}

/// Check a path points at an executable regular file
///
/// Stricter than a bare existence probe: a candidate without the execute
/// bit would only fail later at spawn, so discovery skips it here.
#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.is_file()
        && std::fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_fallback_directory_hit() {
        let temp_dir = tempdir().unwrap();
        let binary = temp_dir.path().join("tndr");
        make_executable(&binary);

        let locator = ExecutableLocator::with_fallback_dirs(vec![temp_dir.path().to_path_buf()]);
        // Skip when a real binary sits on PATH; it would win over the fallback
        if which::which("tndr").is_err() && which::which("t1").is_err() {
            let found = locator.locate().unwrap();
            assert_eq!(found, binary);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_secondary_binary_name_found() {
        let temp_dir = tempdir().unwrap();
        let binary = temp_dir.path().join("t1");
        make_executable(&binary);

        let locator = ExecutableLocator::with_fallback_dirs(vec![temp_dir.path().to_path_buf()]);
        if which::which("tndr").is_err() && which::which("t1").is_err() {
            let found = locator.locate().unwrap();
            assert_eq!(found, binary);
        }
    }

    #[test]
    fn test_not_found_lists_probed_candidates() {
        let temp_dir = tempdir().unwrap();
        let locator = ExecutableLocator::with_fallback_dirs(vec![temp_dir.path().to_path_buf()]);

        if which::which("tndr").is_ok() || which::which("t1").is_ok() {
            return;
        }

        let err = locator.locate().unwrap_err();
        match err {
            LocatorError::NotFound { candidates } => {
                assert!(candidates.iter().any(|c| c.contains("tndr")));
                assert!(candidates.iter().any(|c| c.contains("t1")));
                assert!(
                    candidates
                        .iter()
                        .any(|c| c.starts_with(&temp_dir.path().to_string_lossy().to_string()))
                );
            }
            other => panic!("Expected NotFound, got: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_override_bypasses_discovery() {
        let temp_dir = tempdir().unwrap();
        let binary = temp_dir.path().join("custom-tndr");
        make_executable(&binary);

        let locator = ExecutableLocator::with_fallback_dirs(Vec::new()).override_path(&binary);
        assert_eq!(locator.locate().unwrap(), binary);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let temp_dir = tempdir().unwrap();
        let missing = temp_dir.path().join("missing");

        let locator = ExecutableLocator::with_fallback_dirs(Vec::new()).override_path(&missing);
        assert!(matches!(
            locator.locate(),
            Err(LocatorError::InvalidOverride { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_file_skipped() {
        let temp_dir = tempdir().unwrap();
        let plain = temp_dir.path().join("tndr");
        std::fs::write(&plain, "not a binary").unwrap();
        // No execute bit set; discovery must skip it
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o644)).unwrap();

        if which::which("tndr").is_ok() || which::which("t1").is_ok() {
            return;
        }

        let locator = ExecutableLocator::with_fallback_dirs(vec![temp_dir.path().to_path_buf()]);
        assert!(matches!(
            locator.locate(),
            Err(LocatorError::NotFound { .. })
        ));
    }
}
