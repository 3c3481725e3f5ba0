//! KeyValueSink port - 永続キューの保存先
//!
//! ブラウザの localStorage 相当。キューはタスク一覧を 1 つのキーに
//! JSON で丸ごと書き込み、起動時に 1 回だけ全件読み込みます。
//!
//! # 実装
//! - MemorySink: テスト・リロードのシミュレーション用
//! - FileSink: キーごとに 1 ファイル（CLI 用）

use async_trait::async_trait;

use crate::domain::SinkError;

#[async_trait]
pub trait KeyValueSink: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, SinkError>;

    /// Durable once this returns `Ok`.
    async fn write(&self, key: &str, value: String) -> Result<(), SinkError>;

    async fn remove(&self, key: &str) -> Result<(), SinkError>;
}
