//! File read handler: read a file that passed the path guard.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;

use toolgate_core::{Admission, GateError, OperationHandler, OperationKind, OperationOutput, OperationRequest, Result};
use toolgate_security::{PathAccess, PathGuard};

pub struct FileReadHandler {
    paths: PathGuard,
    max_file_bytes: u64,
}

impl FileReadHandler {
    pub fn new(paths: PathGuard, max_file_bytes: u64) -> Self {
        Self {
            paths,
            max_file_bytes,
        }
    }
}

#[async_trait]
impl OperationHandler for FileReadHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::FileRead
    }

    async fn admit(&self, request: &OperationRequest) -> Result<Admission> {
        let canonical = self.paths.validate(&request.target, PathAccess::Read)?;
        if canonical.is_dir() {
            return Err(GateError::InvalidInput(format!(
                "'{}' is a directory",
                request.target
            )));
        }
        Ok(Admission::new(
            OperationKind::FileRead,
            canonical.to_string_lossy().into_owned(),
        ))
    }

    async fn execute(
        &self,
        _request: &OperationRequest,
        admission: &Admission,
        timeout: Duration,
    ) -> Result<OperationOutput> {
        let path = PathBuf::from(&admission.target);
        let bytes = tokio::time::timeout(timeout, read_limited(&path, self.max_file_bytes))
            .await
            .map_err(|_| GateError::Timeout { after: timeout })??;

        debug!(path = %path.display(), bytes = bytes.len(), "Read file");
        let mut output = OperationOutput::text(String::from_utf8_lossy(&bytes));
        output.bytes = bytes.len() as u64;
        Ok(output)
    }
}

async fn read_limited(path: &Path, limit: u64) -> Result<Vec<u8>> {
    let read_error = |e: std::io::Error| GateError::execution(format!("Failed to read '{}': {e}", path.display()));

    let size = tokio::fs::metadata(path).await.map_err(read_error)?.len();
    if size > limit {
        return Err(GateError::SizeExceeded { limit, actual: size });
    }
    // The file may have grown since the size check; never buffer past the cap.
    let file = tokio::fs::File::open(path).await.map_err(read_error)?;
    let mut bytes = Vec::with_capacity(size as usize);
    file.take(limit.saturating_add(1))
        .read_to_end(&mut bytes)
        .await
        .map_err(read_error)?;
    if bytes.len() as u64 > limit {
        return Err(GateError::SizeExceeded {
            limit,
            actual: bytes.len() as u64,
        });
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn handler(root: &std::path::Path, max: u64) -> FileReadHandler {
        let roots = vec![root.to_string_lossy().into_owned()];
        let forbidden = vec![root.join("secret").to_string_lossy().into_owned()];
        FileReadHandler::new(PathGuard::new(&roots, &forbidden), max)
    }

    async fn read(h: &FileReadHandler, path: &str) -> Result<OperationOutput> {
        let request = OperationRequest::new(OperationKind::FileRead, path);
        let admission = h.admit(&request).await?;
        h.execute(&request, &admission, Duration::from_secs(5)).await
    }

    #[tokio::test]
    async fn read_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("test.txt");
        let mut f = std::fs::File::create(&file_path).unwrap();
        writeln!(f, "Hello, world!").unwrap();

        let out = read(&handler(dir.path(), 1024), file_path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(out.content, "Hello, world!\n");
        assert_eq!(out.bytes, 14);
    }

    #[tokio::test]
    async fn relative_paths_resolve_against_first_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.md"), "# notes").unwrap();
        let out = read(&handler(dir.path(), 1024), "notes.md").await.unwrap();
        assert_eq!(out.content, "# notes");
    }

    #[tokio::test]
    async fn read_nonexistent_file_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = read(&handler(dir.path(), 1024), "missing.txt").await.unwrap_err();
        assert!(matches!(err, GateError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn system_file_outside_root_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let err = read(&handler(dir.path(), 1024), "/etc/passwd").await.unwrap_err();
        assert!(matches!(err, GateError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn forbidden_prefix_inside_root_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("secret")).unwrap();
        std::fs::write(dir.path().join("secret").join("key.pem"), "k").unwrap();
        let err = read(&handler(dir.path(), 1024), "secret/key.pem").await.unwrap_err();
        assert!(matches!(err, GateError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let err = read(&handler(dir.path(), 1024), "sub").await.unwrap_err();
        assert!(matches!(err, GateError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.bin"), vec![b'x'; 64]).unwrap();
        let err = read(&handler(dir.path(), 16), "big.bin").await.unwrap_err();
        assert_eq!(err, GateError::SizeExceeded { limit: 16, actual: 64 });
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn read_stops_at_cap_when_metadata_understates_size() {
        // procfs reports a zero length for files that have content.
        let err = read_limited(Path::new("/proc/self/status"), 16).await.unwrap_err();
        assert_eq!(err, GateError::SizeExceeded { limit: 16, actual: 17 });
    }
}
