// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sink for DUMP payloads.

use crate::error::{ReplicationError, Result};
use crate::message::maybe_decompress;
use crate::transport::BoxFuture;
use std::path::{Path, PathBuf};
use tracing::info;

/// Stores raw DUMP payloads under their declared name.
pub trait DumpSink: Send + Sync + 'static {
    /// Store `payload` as `name`. Returns where it ended up.
    fn store<'a>(&'a self, name: &'a str, payload: &'a [u8]) -> BoxFuture<'a, PathBuf>;
}

/// Writes dumps into a directory (`replication.importLocation`).
///
/// Compressed payloads are inflated first. An existing file with the same
/// name is replaced, or moved aside with a timestamp suffix when
/// `keep_dump_files` is set.
#[derive(Debug, Clone)]
pub struct FileDumpSink {
    dir: PathBuf,
    keep_dump_files: bool,
}

impl FileDumpSink {
    pub fn new(dir: impl Into<PathBuf>, keep_dump_files: bool) -> Self {
        Self {
            dir: dir.into(),
            keep_dump_files,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Only a bare file name is accepted; anything with a directory part
    /// would escape the import location.
    fn target(&self, name: &str) -> Result<PathBuf> {
        let file = Path::new(name);
        let valid = !name.is_empty()
            && file.file_name().map(|f| f == file.as_os_str()).unwrap_or(false);
        if !valid {
            return Err(ReplicationError::Dump {
                name: name.to_string(),
                message: "dump name must be a plain file name".to_string(),
            });
        }
        Ok(self.dir.join(file))
    }
}

impl DumpSink for FileDumpSink {
    fn store<'a>(&'a self, name: &'a str, payload: &'a [u8]) -> BoxFuture<'a, PathBuf> {
        Box::pin(async move {
            let dump_err = |e: std::io::Error| ReplicationError::Dump {
                name: name.to_string(),
                message: e.to_string(),
            };
            let target = self.target(name)?;
            let data = maybe_decompress(payload)?;

            tokio::fs::create_dir_all(&self.dir).await.map_err(dump_err)?;

            if self.keep_dump_files && tokio::fs::try_exists(&target).await.map_err(dump_err)? {
                let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
                let aside = self.dir.join(format!("{}.{}", name, stamp));
                tokio::fs::rename(&target, &aside).await.map_err(dump_err)?;
                info!(name = %name, kept = %aside.display(), "Kept previous dump file");
            }

            let tmp = self.dir.join(format!(".{}.part", name));
            tokio::fs::write(&tmp, &data).await.map_err(dump_err)?;
            tokio::fs::rename(&tmp, &target).await.map_err(dump_err)?;

            info!(name = %name, bytes = data.len(), path = %target.display(), "Stored dump");
            Ok(target)
        })
    }
}
