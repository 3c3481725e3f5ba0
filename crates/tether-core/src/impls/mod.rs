//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **MemorySink**: テスト用の KeyValueSink（再起動のシミュレーション）
//! - **FileSink**: ファイルベースの KeyValueSink（CLI 用）
//!
//! リモート API の Strategy や UI 側の Sync Adapter はアプリケーション側で実装します。

pub mod file_sink;
pub mod memory_sink;

pub use self::file_sink::FileSink;
pub use self::memory_sink::MemorySink;
