//! FileSink - キーごとに 1 ファイルの durable sink
//!
//! `{dir}/{key}.json` に保存。書き込みは一時ファイル + rename で、
//! 途中でクラッシュしても前回の内容か今回の内容のどちらかが残ります。
//! rename の前に一時ファイルを sync_all し、rename 後はディレクトリも
//! sync するので、`write` が Ok を返した時点で電源断にも耐えます。

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::domain::SinkError;
use crate::ports::KeyValueSink;

#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    /// Open (and create if needed) the storage directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, SinkError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(SinkError::Other(format!("invalid storage key: {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    /// Make the rename itself durable.
    #[cfg(unix)]
    async fn sync_dir(&self) -> Result<(), SinkError> {
        fs::File::open(&self.dir).await?.sync_all().await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn sync_dir(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl KeyValueSink for FileSink {
    async fn read(&self, key: &str) -> Result<Option<String>, SinkError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, value: String) -> Result<(), SinkError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(value.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        self.sync_dir().await?;
        trace!(path = %path.display(), bytes = value.len(), "sink written");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SinkError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[tokio::test]
    async fn write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::open(dir.path().join("store")).await.unwrap();

        assert_eq!(sink.read("persistence-queue").await.unwrap(), None);

        sink.write("persistence-queue", "[]".to_string()).await.unwrap();
        sink.write("persistence-queue", "[1]".to_string()).await.unwrap();
        assert_eq!(
            sink.read("persistence-queue").await.unwrap().as_deref(),
            Some("[1]")
        );
        assert!(!dir.path().join("store/persistence-queue.json.tmp").exists());

        sink.remove("persistence-queue").await.unwrap();
        sink.remove("persistence-queue").await.unwrap();
        assert_eq!(sink.read("persistence-queue").await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_replaces_a_leftover_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::open(dir.path()).await.unwrap();
        let leftover = dir.path().join("persistence-queue.json.tmp");
        std::fs::write(&leftover, "partial garbage from a crashed write").unwrap();

        sink.write("persistence-queue", "[]".to_string()).await.unwrap();

        assert!(!leftover.exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("persistence-queue.json")).unwrap(),
            "[]"
        );
    }

    #[tokio::test]
    async fn data_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        FileSink::open(dir.path())
            .await
            .unwrap()
            .write("k", "v".to_string())
            .await
            .unwrap();

        let reopened = FileSink::open(dir.path()).await.unwrap();
        assert_eq!(reopened.read("k").await.unwrap().as_deref(), Some("v"));
    }

    #[rstest]
    #[case("")]
    #[case("../escape")]
    #[case(".hidden")]
    #[case("a/b")]
    #[tokio::test]
    async fn rejects_unsafe_keys(#[case] key: &str) {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::open(dir.path()).await.unwrap();
        assert!(sink.write(key, "v".to_string()).await.is_err());
    }
}
