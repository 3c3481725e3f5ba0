//! Typed - 型付き Entity API
//!
//! このモジュールは entity_type の typo を型で排除し、
//! Strategy / Sync Adapter との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Entity` trait, `EntityStrategy<E>`, `EntitySyncAdapter<E>`
//! - **内部（Dyn）**: `PersistenceStrategy<Value>`, `SyncAdapter<Value>` - type erasure

pub mod entity;
pub mod strategy;

pub use self::entity::{Entity, decode_payload};
pub use self::strategy::{EntityStrategy, EntitySyncAdapter, TypedStrategy, TypedSyncAdapter};
