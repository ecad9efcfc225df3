use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::api::ClusterSnapshot;
use tracing::{debug, info};

use super::{ConfigConsumer, ConsumerError, SnapshotEnvelope};

pub const NAME: &str = "file";
pub const REQUIRED_KEYS: &[&str] = &["path"];

/// Writes each snapshot as pretty JSON, replacing the previous file
/// atomically.
#[derive(Debug, Clone)]
pub struct FileConsumer {
    path: PathBuf,
}

impl FileConsumer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_settings(settings: &HashMap<String, String>) -> Self {
        Self::new(settings.get("path").map(String::as_str).unwrap_or_default())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ConsumerError {
    ConsumerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes `data` to a temp file next to `path`, then renames it into place.
/// The temp file is removed if any step fails.
fn write_atomically(path: &Path, data: &[u8]) -> Result<(), ConsumerError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;

    let tmp = tempfile::NamedTempFile::new_in(parent).map_err(|err| io_error(parent, err))?;
    fs::write(tmp.path(), data).map_err(|err| io_error(tmp.path(), err))?;
    tmp.persist(path).map_err(|err| io_error(path, err.error))?;
    Ok(())
}

#[async_trait]
impl ConfigConsumer for FileConsumer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn required_config_keys(&self) -> &'static [&'static str] {
        REQUIRED_KEYS
    }

    async fn update_conf(&self, snapshot: &ClusterSnapshot) -> Result<(), ConsumerError> {
        let body = serde_json::to_vec_pretty(&SnapshotEnvelope::new(snapshot))?;
        let bytes = body.len();

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &body))
            .await
            .map_err(|err| io_error(&self.path, std::io::Error::other(err)))??;

        info!(
            path = %self.path.display(),
            bytes,
            services = snapshot.service_count(),
            "snapshot written"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), ConsumerError> {
        debug!(path = %self.path.display(), "file consumer idle");
        Ok(())
    }
}
