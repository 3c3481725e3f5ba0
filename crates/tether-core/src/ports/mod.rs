//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! リモート API、ローカル状態、durable storage、時刻、ID 生成は
//! すべて trait の向こう側にあり、コアは実装の詳細を知りません。

pub mod clock;
pub mod id_generator;
pub mod sink;
pub mod strategy;
pub mod sync_adapter;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::sink::KeyValueSink;
pub use self::strategy::{PersistenceStrategy, Persisted};
pub use self::sync_adapter::SyncAdapter;
