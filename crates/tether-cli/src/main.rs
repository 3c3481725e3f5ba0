use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether_core::domain::{
    BackendId, EntityRef, ErrorInfo, Event, EventKind, FrontId, PersistError, PersistenceMetadata,
    SyncError, TaskPayload,
};
use tether_core::impls::FileSink;
use tether_core::ports::{IdGenerator, Persisted, SystemClock, UlidGenerator};
use tether_core::typed::{Entity, EntityStrategy, EntitySyncAdapter};
use tether_core::{PipelineBuilder, PipelineConfig, RetryConfig};

/// Offline-first persistence demo: notes and tags against a flaky remote.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Directory holding the durable queue.
    #[arg(long, default_value = ".tether")]
    data_dir: PathBuf,

    /// JSON pipeline config. Defaults to a fast demo retry schedule.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Remote calls that fail before the remote recovers.
    #[arg(long, default_value_t = 2)]
    failures: u32,

    /// Remote never answers; pending tasks stay queued for the next run.
    #[arg(long)]
    offline: bool,

    /// Give up waiting for the queue to drain after this many seconds.
    #[arg(long, default_value_t = 15)]
    wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Note {
    title: String,
    #[serde(default)]
    body: String,
}

impl Entity for Note {
    const TYPE: &'static str = "note";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tag {
    label: String,
}

impl Entity for Tag {
    const TYPE: &'static str = "tag";
}

/// Simulated REST backend. Fails the first `remaining_failures` calls.
#[derive(Clone)]
struct MockRemote {
    remaining_failures: Arc<AtomicU32>,
    offline: Arc<AtomicBool>,
    next_id: Arc<AtomicU32>,
}

impl MockRemote {
    fn new(failures: u32, offline: bool) -> Self {
        Self {
            remaining_failures: Arc::new(AtomicU32::new(failures)),
            offline: Arc::new(AtomicBool::new(offline)),
            next_id: Arc::new(AtomicU32::new(1)),
        }
    }

    fn call(&self) -> Result<(), PersistError> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(PersistError::Network("remote unreachable (offline)".into()));
        }
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(PersistError::Http {
                status: 503,
                message: format!("intentional failure (left={left})"),
            });
        }
        Ok(())
    }

    fn assign_id(&self) -> BackendId {
        BackendId::new(format!("srv-{}", self.next_id.fetch_add(1, Ordering::Relaxed)))
    }
}

#[async_trait]
impl<E: Entity> EntityStrategy<E> for MockRemote {
    async fn create(
        &self,
        entity: E,
        _metadata: &PersistenceMetadata,
    ) -> Result<Persisted<E>, PersistError> {
        self.call()?;
        Ok(Persisted::new(Some(entity), Some(self.assign_id())))
    }

    async fn update(
        &self,
        entity: E,
        metadata: &PersistenceMetadata,
    ) -> Result<Persisted<E>, PersistError> {
        self.call()?;
        Ok(Persisted::new(Some(entity), metadata.backend_id.clone()))
    }

    async fn delete(&self, _target: &EntityRef) -> Result<(), PersistError> {
        self.call()
    }
}

#[derive(Debug, Clone)]
struct LocalRecord {
    entity_type: &'static str,
    backend_id: Option<BackendId>,
    status: String,
}

/// Local state the UI would read from. Never publishes on the bus.
#[derive(Clone, Default)]
struct LocalStore {
    records: Arc<Mutex<BTreeMap<FrontId, LocalRecord>>>,
}

impl LocalStore {
    fn upsert(&self, front_id: FrontId, entity_type: &'static str, metadata: &PersistenceMetadata) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(front_id).or_insert_with(|| LocalRecord {
            entity_type,
            backend_id: None,
            status: String::new(),
        });
        if metadata.backend_id.is_some() {
            record.backend_id = metadata.backend_id.clone();
        }
        record.status = metadata.sync_status.as_str().to_string();
    }

    fn print(&self) {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        println!("local store ({} records):", records.len());
        for (front_id, record) in records.iter() {
            println!(
                "  {:<5} {front_id} backend_id={} status={}",
                record.entity_type,
                record.backend_id.as_ref().map_or("-", |id| id.as_str()),
                record.status
            );
        }
    }
}

#[async_trait]
impl<E: Entity> EntitySyncAdapter<E> for LocalStore {
    async fn sync_entity(
        &self,
        _original: TaskPayload<E>,
        persisted: TaskPayload<E>,
    ) -> Result<(), SyncError> {
        self.upsert(persisted.metadata.front_id.clone(), E::TYPE, &persisted.metadata);
        Ok(())
    }

    async fn on_error(&self, error: &ErrorInfo, metadata: &PersistenceMetadata) {
        warn!(entity_type = E::TYPE, front_id = %metadata.front_id, error = %error, "sync error");
        self.upsert(metadata.front_id.clone(), E::TYPE, &metadata.errored(error.message.clone()));
    }
}

/// Fast schedule so the demo finishes in seconds.
fn demo_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry = RetryConfig {
        max_retries: 5,
        initial_delay_ms: 200,
        multiplier: 2.0,
        max_delay_ms: Some(2_000),
        ..RetryConfig::default()
    };
    config.queue.max_idle_wait_ms = 1_000;
    config.queue.max_concurrent = 2;
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // (A) 設定と durable sink
    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .await
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => demo_config(),
    };
    let sink = FileSink::open(&args.data_dir)
        .await
        .with_context(|| format!("opening data dir {}", args.data_dir.display()))?;

    // (B) Strategy / Sync Adapter を登録してパイプラインを構築
    let remote = MockRemote::new(args.failures, args.offline);
    let store = LocalStore::default();
    let pipeline = PipelineBuilder::<Value>::new()
        .config(config)
        .sink(Arc::new(sink))
        .register::<Note, _>(remote.clone())
        .register::<Tag, _>(remote.clone())
        .register_sync_adapter::<Note, _>(store.clone())
        .register_sync_adapter::<Tag, _>(store.clone())
        .expect_entity_types(&[Note::TYPE, Tag::TYPE])
        .build()
        .await?;

    let restored = pipeline.queue().pending_tasks().await;
    if !restored.is_empty() {
        println!("restored {} pending task(s) from a previous run:", restored.len());
        for task in &restored {
            println!("  {} (retry_count={})", task.id, task.retry_count);
        }
    }

    for kind in [EventKind::TaskRetryScheduled, EventKind::TaskAbandoned] {
        pipeline.bus().subscribe(kind, |event| {
            match event {
                Event::TaskRetryScheduled {
                    task_id,
                    retry_count,
                    retry_at,
                    ..
                } => println!("retry #{retry_count} scheduled for {task_id} at {retry_at}"),
                Event::TaskAbandoned {
                    task_id, reason, ..
                } => println!("abandoned {task_id}: {reason}"),
                _ => {}
            }
            Ok(())
        });
    }

    // (C) UI 側の変更をイベントとして発行
    let ids = UlidGenerator::new(SystemClock);
    let note_id = ids.generate_front_id();
    let note = Note {
        title: "Groceries".into(),
        body: "milk".into(),
    };
    pipeline.publish(note.created(Some(note_id.clone()))?);
    pipeline.publish(
        Note {
            body: "milk, eggs".into(),
            ..note
        }
        .updated(EntityRef::new(note_id))?,
    );

    let tag_id = ids.generate_front_id();
    pipeline.publish(Tag { label: "home".into() }.created(Some(tag_id))?);
    let scratch_id = ids.generate_front_id();
    pipeline.publish(Tag { label: "scratch".into() }.created(Some(scratch_id.clone()))?);
    pipeline.publish(Tag::deleted(EntityRef::new(scratch_id)));
    info!("published demo mutations");

    // (D) キューが空になるのを待つ（Ctrl-C / タイムアウトで中断）
    pipeline.settle().await;
    let drained = tokio::select! {
        result = tokio::time::timeout(Duration::from_secs(args.wait_secs), pipeline.wait_idle()) => result.is_ok(),
        _ = tokio::signal::ctrl_c() => false,
    };

    let stats = pipeline.stats().await;
    if drained {
        println!("queue drained");
    } else {
        println!(
            "stopped with {} task(s) pending; they resume on the next run from {}",
            stats.pending,
            args.data_dir.display()
        );
    }
    println!("stats: {stats:?}");
    store.print();

    // (E) 後片付け（pending task は sink に残る）
    pipeline.destroy();
    Ok(())
}
