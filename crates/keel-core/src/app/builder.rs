//! ExecutorBuilder - executor の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - worker の spawn は build() の中だけで行う

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::config::ExecutorConfig;
use crate::domain::ExecutorState;
use crate::error::ConfigError;
use crate::impls::{SinkSet, TracingSink};
use crate::ports::{EventSink, IdGenerator, UlidGenerator};
use crate::queue::WorkQueue;

use super::executor::{Core, TaskExecutor};
use super::worker_loop::worker_loop;

/// ExecutorBuilder は `TaskExecutor` を構築
///
/// # 使用例
/// ```ignore
/// let executor = TaskExecutor::builder(ExecutorConfig::named("orders"))
///     .with_sink(Arc::new(MemorySink::new()))
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - build() 時に config を検証し、不正なら BuildError を返す
/// - Tokio runtime の外で build() すると BuildError::NoRuntime
/// - sink を 1 つも指定しなければ `TracingSink` を使う
pub struct ExecutorBuilder {
    config: ExecutorConfig,
    sinks: SinkSet,
    ids: Option<Arc<dyn IdGenerator>>,
}

/// BuildError は executor 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid executor configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("an executor must be built inside a Tokio runtime")]
    NoRuntime,
}

impl ExecutorBuilder {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            sinks: SinkSet::new(),
            ids: None,
        }
    }

    /// Sink を追加（複数可）
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// ID 生成器を差し替え（テスト用）
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// 検証して worker を起動
    pub fn build(self) -> Result<TaskExecutor, BuildError> {
        self.config.validate()?;
        let handle = Handle::try_current().map_err(|_| BuildError::NoRuntime)?;

        let mut sinks = self.sinks;
        if sinks.is_empty() {
            sinks.push(Arc::new(TracingSink));
        }
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new()) as Arc<dyn IdGenerator>);

        let (state, _rx) = watch::channel(ExecutorState::Running);
        let core = Arc::new(Core {
            id: ids.executor_id(),
            queue: WorkQueue::new(self.config.queue_capacity),
            config: self.config,
            sinks,
            ids,
            state,
        });

        handle.spawn(worker_loop(Arc::clone(&core)));
        Ok(TaskExecutor::from_core(core))
    }
}
