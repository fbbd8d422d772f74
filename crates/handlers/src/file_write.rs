//! File write handler: overwrite or append to a file that passed the path guard.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use toolgate_core::{Admission, GateError, OperationHandler, OperationKind, OperationOutput, OperationRequest, Result};
use toolgate_security::{PathAccess, PathGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    Append,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Overwrite => "overwrite",
            WriteMode::Append => "append",
        }
    }

    fn from_request(request: &OperationRequest) -> Result<Self> {
        match request.arg_str("mode") {
            None | Some("overwrite") => Ok(WriteMode::Overwrite),
            Some("append") => Ok(WriteMode::Append),
            Some(other) => Err(GateError::InvalidInput(format!(
                "Unknown write mode '{other}' (expected overwrite or append)"
            ))),
        }
    }
}

pub struct FileWriteHandler {
    paths: PathGuard,
    max_file_bytes: u64,
}

impl FileWriteHandler {
    pub fn new(paths: PathGuard, max_file_bytes: u64) -> Self {
        Self {
            paths,
            max_file_bytes,
        }
    }
}

fn content_arg(request: &OperationRequest) -> Result<&str> {
    request
        .arg_str("content")
        .ok_or_else(|| GateError::InvalidInput("Missing 'content' argument".into()))
}

#[async_trait]
impl OperationHandler for FileWriteHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::FileWrite
    }

    async fn admit(&self, request: &OperationRequest) -> Result<Admission> {
        let content = content_arg(request)?;
        let mode = WriteMode::from_request(request)?;
        if content.len() as u64 > self.max_file_bytes {
            return Err(GateError::SizeExceeded {
                limit: self.max_file_bytes,
                actual: content.len() as u64,
            });
        }

        let canonical = self.paths.validate(&request.target, PathAccess::Write)?;
        Ok(
            Admission::new(OperationKind::FileWrite, canonical.to_string_lossy().into_owned())
                .with_detail("mode", mode.as_str())
                .with_detail("bytes", content.len() as u64),
        )
    }

    async fn execute(
        &self,
        request: &OperationRequest,
        admission: &Admission,
        timeout: Duration,
    ) -> Result<OperationOutput> {
        let content = content_arg(request)?;
        let mode = WriteMode::from_request(request)?;
        let path = PathBuf::from(&admission.target);

        tokio::time::timeout(timeout, write(&path, content, mode, self.max_file_bytes))
            .await
            .map_err(|_| GateError::Timeout { after: timeout })??;

        debug!(path = %path.display(), bytes = content.len(), mode = mode.as_str(), "Wrote file");
        let mut output = OperationOutput::text(format!(
            "Wrote {} bytes to {}",
            content.len(),
            path.display()
        ))
        .with_data(serde_json::json!({
            "path": path.to_string_lossy(),
            "bytes": content.len(),
            "mode": mode.as_str(),
        }));
        output.bytes = content.len() as u64;
        Ok(output)
    }
}

async fn write(path: &Path, content: &str, mode: WriteMode, limit: u64) -> Result<()> {
    let write_error = |e: std::io::Error| GateError::execution(format!("Failed to write '{}': {e}", path.display()));

    // The parent already passed the guard; only now is it safe to create it.
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_error)?;
    }

    match mode {
        WriteMode::Overwrite => tokio::fs::write(path, content).await.map_err(write_error),
        WriteMode::Append => {
            let existing = match tokio::fs::metadata(path).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(write_error(e)),
            };
            let total = existing + content.len() as u64;
            if total > limit {
                return Err(GateError::SizeExceeded { limit, actual: total });
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(write_error)?;
            file.write_all(content.as_bytes()).await.map_err(write_error)?;
            file.flush().await.map_err(write_error)
        }
    }
}
