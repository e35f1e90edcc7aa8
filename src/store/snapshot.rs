//! Snapshot: checkpoint the engine and copy the database file atomically.

use std::path::{Path, PathBuf};

use super::{Store, StoreError};

impl Store {
    /// Write a consistent copy of the database to `dst`.
    ///
    /// The write lock is held only across the checkpoint so ingestion is
    /// blocked as briefly as possible. The copy lands at `dst.tmp` first
    /// and is renamed into place, so the destination is either complete or
    /// absent.
    #[tracing::instrument(skip(self, dst), fields(dst = %dst.as_ref().display()), err)]
    pub async fn snapshot_to(&self, dst: impl AsRef<Path>) -> Result<(), StoreError> {
        let dst = dst.as_ref();
        let src = self.db_path().cloned().ok_or(StoreError::InMemoryStore)?;

        if let Some(parent) = dst.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        {
            let _guard = self.write_guard().await;
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .fetch_optional(self.pool())
                .await?;
        }

        let tmp = tmp_sibling(dst);
        let mut reader = tokio::fs::File::open(&src).await?;
        let mut writer = tokio::fs::File::create(&tmp).await?;
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.sync_all().await?;
        drop(writer);

        tokio::fs::rename(&tmp, dst).await?;
        tracing::info!(src = %src.display(), "snapshot written");
        Ok(())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}
