//! App - アプリケーション層
//!
//! queue / promise / ports を組み合わせて executor を実装します。
//!
//! # 主要コンポーネント
//! - **ExecutorBuilder**: executor の構築とワイヤリング
//! - **TaskExecutor**: submit → queue → worker の Active Object
//! - **worker_loop**: 唯一の consumer（pop→run→settle→record）
//! - **guarded**: breaker を通して operation を submit する helper

pub mod builder;
pub mod executor;
pub mod guarded;
mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, ExecutorBuilder};
pub use self::executor::TaskExecutor;
pub use self::guarded::submit_guarded;
