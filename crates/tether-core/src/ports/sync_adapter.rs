//! SyncAdapter port - 永続化結果をローカル状態へ反映
//!
//! # 設計原則
//! - Adapter はイベントバスを持たない。ローカル状態を直接書き換えるだけなので、
//!   entity:created/updated/deleted を再発行して永続化ループになることがない。

use async_trait::async_trait;

use crate::domain::{ErrorInfo, SyncError, TaskPayload};

#[async_trait]
pub trait SyncAdapter<T: Send + Sync>: Send + Sync {
    /// Called after `entity:persisted`. `persisted.metadata` is `synced`
    /// and carries the backend id when the remote assigned one.
    async fn sync_entity(
        &self,
        original: &TaskPayload<T>,
        persisted: &TaskPayload<T>,
    ) -> Result<(), SyncError>;

    /// Called after every failure event, transient or terminal.
    async fn on_error(&self, _error: &ErrorInfo, _payload: &TaskPayload<T>) {}
}
