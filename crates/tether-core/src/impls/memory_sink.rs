//! MemorySink - テスト・開発用の durable sink
//!
//! Clone は同じストレージを共有します。キューを drop して同じ sink から
//! `PersistentQueue::load` し直すことで、プロセス再起動をシミュレートできます。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::domain::SinkError;
use crate::ports::KeyValueSink;

#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<HashMap<String, String>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `write` / `remove` fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Raw stored value, for assertions.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn check_writable(&self) -> Result<(), SinkError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SinkError::Other("storage quota exceeded".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueSink for MemorySink {
    async fn read(&self, key: &str) -> Result<Option<String>, SinkError> {
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, value: String) -> Result<(), SinkError> {
        self.check_writable()?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SinkError> {
        self.check_writable()?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_storage() {
        let sink = MemorySink::new();
        let other = sink.clone();

        sink.write("k", "v".to_string()).await.unwrap();
        assert_eq!(other.read("k").await.unwrap().as_deref(), Some("v"));

        other.remove("k").await.unwrap();
        assert_eq!(sink.read("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failing_writes_keep_previous_value() {
        let sink = MemorySink::new();
        sink.write("k", "v1".to_string()).await.unwrap();

        sink.fail_writes(true);
        assert!(sink.write("k", "v2".to_string()).await.is_err());
        assert_eq!(sink.get("k").as_deref(), Some("v1"));

        sink.fail_writes(false);
        sink.write("k", "v2".to_string()).await.unwrap();
        assert_eq!(sink.get("k").as_deref(), Some("v2"));
    }
}
