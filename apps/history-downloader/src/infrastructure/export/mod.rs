//! Bar Export
//!
//! Writes a downloaded bar series to `{dir}/{key}.json`:
//!
//! ```json
//! { "key": "FUT_ES_GLOBEX", "bar_count": 2, "bars": [ { "timestamp": ..., "open": ... } ] }
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::domain::instrument::{InstrumentKey, TimedBar};

/// Export failure.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Directory or file could not be written.
    #[error("failed to write {path}: {source}")]
    Io {
        /// Path being written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Bars could not be encoded.
    #[error("failed to encode bars: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct BarFile<'a> {
    key: &'a InstrumentKey,
    bar_count: usize,
    bars: &'a [TimedBar],
}

/// Write `bars` for `key` under `dir`, creating the directory if needed.
///
/// # Errors
///
/// Returns [`ExportError`] if encoding or any filesystem operation fails.
pub fn export_bars(dir: &Path, key: &InstrumentKey, bars: &[TimedBar]) -> Result<PathBuf, ExportError> {
    std::fs::create_dir_all(dir).map_err(|source| ExportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(format!("{key}.json"));
    let body = serde_json::to_vec_pretty(&BarFile {
        key,
        bar_count: bars.len(),
        bars,
    })?;
    std::fs::write(&path, body).map_err(|source| ExportError::Io {
        path: path.clone(),
        source,
    })?;

    tracing::info!(key = %key, bars = bars.len(), path = %path.display(), "Bars exported");
    Ok(path)
}
