//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **PipelineBuilder**: パイプラインの構築とワイヤリング
//! - **Orchestrator**: イベント → task → キュー → Strategy の橋渡し
//! - **TaskFactory**: エンティティイベントから task を組み立てる

pub mod builder;
pub mod orchestrator;
pub mod task_factory;

pub use self::builder::{Pipeline, PipelineBuilder};
pub use self::orchestrator::Orchestrator;
pub use self::task_factory::TaskFactory;
