use std::{io::Write as _, path::PathBuf};

use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression};
use forge_core_deployment::TickReport;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("failed to serialize tick report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write diagnostics file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Emits a tick's diagnostics document (spec.md §4.10 step 7).
#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn write(&self, report: &TickReport) -> Result<(), DiagnosticsError>;
}

/// Writes the gzip-compressed JSON tick report to
/// `<data_dir>/diagnostics/<tick-start-millis>.json.gz`.
pub struct FilesystemDiagnosticsSink {
    dir: PathBuf,
}

impl FilesystemDiagnosticsSink {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { dir: data_dir.into().join("diagnostics") }
    }
}

#[async_trait]
impl DiagnosticsSink for FilesystemDiagnosticsSink {
    async fn write(&self, report: &TickReport) -> Result<(), DiagnosticsError> {
        let json = serde_json::to_vec(report)?;
        let dir = self.dir.clone();
        let filename = format!("{}.json.gz", report.start.timestamp_millis());

        tokio::task::spawn_blocking(move || -> Result<(), DiagnosticsError> {
            std::fs::create_dir_all(&dir)
                .map_err(|source| DiagnosticsError::Write { path: dir.display().to_string(), source })?;
            let path = dir.join(&filename);
            let file = std::fs::File::create(&path)
                .map_err(|source| DiagnosticsError::Write { path: path.display().to_string(), source })?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder
                .write_all(&json)
                .map_err(|source| DiagnosticsError::Write { path: path.display().to_string(), source })?;
            encoder
                .finish()
                .map_err(|source| DiagnosticsError::Write { path: path.display().to_string(), source })?;
            Ok(())
        })
        .await
        .expect("diagnostics write task panicked")
    }
}
