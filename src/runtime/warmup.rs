//! Model warmup
//!
//! Runs a few short synthetic generations through the dispatcher so the
//! one-time costs of a freshly loaded model (kernel compilation, lazy
//! allocations) are paid before real traffic arrives. Timing history can be
//! persisted for reporting; warm state itself never survives a restart.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::dispatcher::InferenceDispatcher;
use super::prompt::PromptInput;
use super::GenerationConfig;
use crate::models::LoadedModel;

const WARMUP_PROMPTS: &[&str] = &[
    "Hello",
    "The quick brown fox",
    "Once upon a time",
    "What is 2 + 2?",
];

pub const DEFAULT_WARMUP_MAX_TOKENS: usize = 8;
pub const MAX_WARMUP_PROMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupMode {
    /// Block until every prompt ran
    Sync,
    /// Return a cold status now and warm in the background
    Async,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupStatus {
    pub model_id: String,
    pub is_warmed: bool,
    pub warmup_time_ms: f64,
    pub kernel_compilation_time_ms: f64,
    pub warmup_prompts_used: usize,
    pub last_warmup: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WarmupStatus {
    fn cold(model_id: &str, history: Option<&WarmupRecord>) -> Self {
        let mut status = Self {
            model_id: model_id.to_owned(),
            is_warmed: false,
            warmup_time_ms: 0.0,
            kernel_compilation_time_ms: 0.0,
            warmup_prompts_used: 0,
            last_warmup: None,
            error: None,
        };
        if let Some(record) = history {
            status.warmup_time_ms = record.warmup_time_ms;
            status.kernel_compilation_time_ms = record.kernel_compilation_time_ms;
            status.warmup_prompts_used = record.warmup_prompts_used;
            status.last_warmup = Some(record.last_warmup);
        }
        status
    }
}

/// Persisted timing of the last successful warmup of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupRecord {
    pub warmup_time_ms: f64,
    pub kernel_compilation_time_ms: f64,
    pub warmup_prompts_used: usize,
    pub last_warmup: DateTime<Utc>,
}

struct WarmupTask {
    done: Shared<BoxFuture<'static, ()>>,
    abort: AbortHandle,
}

pub struct WarmupService {
    dispatcher: Arc<InferenceDispatcher>,
    max_tokens: usize,
    statuses: DashMap<String, WarmupStatus>,
    history: Mutex<BTreeMap<String, WarmupRecord>>,
    history_file: Option<PathBuf>,
    tasks: Mutex<HashMap<String, WarmupTask>>,
    shutdown: CancellationToken,
}

fn read_history(path: &Path) -> BTreeMap<String, WarmupRecord> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!("Ignoring unreadable warmup history {}: {}", path.display(), e);
            BTreeMap::new()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
        Err(e) => {
            warn!("Failed to read warmup history {}: {}", path.display(), e);
            BTreeMap::new()
        }
    }
}

async fn write_history(path: &Path, history: &BTreeMap<String, WarmupRecord>) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(history)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

impl WarmupService {
    pub fn new(dispatcher: Arc<InferenceDispatcher>) -> Self {
        Self {
            dispatcher,
            max_tokens: DEFAULT_WARMUP_MAX_TOKENS,
            statuses: DashMap::new(),
            history: Mutex::new(BTreeMap::new()),
            history_file: None,
            tasks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    /// Load timing history from `path` and persist new timings there
    pub fn with_history_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let history = read_history(&path);
        if !history.is_empty() {
            info!("Loaded warmup history for {} models", history.len());
        }
        self.history = Mutex::new(history);
        self.history_file = Some(path);
        self
    }

    pub fn history(&self, model_id: &str) -> Option<WarmupRecord> {
        self.history.lock().get(model_id).cloned()
    }

    pub fn get_status(&self, model_id: &str) -> Option<WarmupStatus> {
        self.statuses.get(model_id).map(|s| s.clone())
    }

    pub fn is_warm(&self, model_id: &str) -> bool {
        self.statuses
            .get(model_id)
            .map(|s| s.is_warmed)
            .unwrap_or(false)
    }

    pub fn is_running(&self, model_id: &str) -> bool {
        self.tasks.lock().contains_key(model_id)
    }

    pub fn all_statuses(&self) -> BTreeMap<String, WarmupStatus> {
        self.statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Forget a model's status and abort a background warmup in flight
    pub fn clear_status(&self, model_id: &str) {
        if let Some(task) = self.tasks.lock().remove(model_id) {
            task.abort.abort();
        }
        self.statuses.remove(model_id);
    }

    /// Await the background warmup of `model_id`, if one is running
    pub async fn wait(&self, model_id: &str) {
        let done = self.tasks.lock().get(model_id).map(|t| t.done.clone());
        if let Some(done) = done {
            done.await;
        }
    }

    /// Cancel every background warmup and wait for them to stop
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let pending: Vec<_> = self.tasks.lock().values().map(|t| t.done.clone()).collect();
        futures::future::join_all(pending).await;
    }

    fn cold_status(&self, model_id: &str) -> WarmupStatus {
        WarmupStatus::cold(model_id, self.history.lock().get(model_id))
    }

    #[instrument(skip(self, model), fields(model_id = %model.id()))]
    pub async fn warmup(
        self: &Arc<Self>,
        model: Arc<LoadedModel>,
        num_prompts: usize,
        mode: WarmupMode,
    ) -> WarmupStatus {
        let model_id = model.id().to_owned();
        let num_prompts = num_prompts.clamp(1, MAX_WARMUP_PROMPTS);

        match mode {
            WarmupMode::Sync => {
                self.wait(&model_id).await;
                let status = self.run(model, num_prompts).await;
                self.statuses.insert(model_id, status.clone());
                status
            }
            WarmupMode::Async => self.spawn_background(model, num_prompts),
        }
    }

    fn spawn_background(self: &Arc<Self>, model: Arc<LoadedModel>, num_prompts: usize) -> WarmupStatus {
        let model_id = model.id().to_owned();
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&model_id) {
            debug!("Warmup already running");
            return self
                .get_status(&model_id)
                .unwrap_or_else(|| self.cold_status(&model_id));
        }
        let cold = self.cold_status(&model_id);
        self.statuses.insert(model_id.clone(), cold.clone());

        let service = Arc::clone(self);
        let id = model_id.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                status = service.run(model, num_prompts) => {
                    service.statuses.insert(id.clone(), status);
                }
                _ = service.shutdown.cancelled() => {
                    debug!("Warmup of {id} cancelled by shutdown");
                }
            }
            service.tasks.lock().remove(&id);
        });
        let abort = handle.abort_handle();
        let done = async move {
            let _ = handle.await;
        }
        .boxed()
        .shared();
        tasks.insert(model_id, WarmupTask { done, abort });
        cold
    }

    /// Run the synthetic prompts. The first one is attributed to kernel
    /// compilation, the rest to steady-state warmup time.
    async fn run(&self, model: Arc<LoadedModel>, num_prompts: usize) -> WarmupStatus {
        let model_id = model.id().to_owned();
        let mut status = self.cold_status(&model_id);
        let config = GenerationConfig {
            max_tokens: self.max_tokens,
            temperature: 0.0,
            ..Default::default()
        };

        let started = Instant::now();
        let mut kernel_ms = 0.0;
        for i in 0..num_prompts {
            let prompt = PromptInput::Text(WARMUP_PROMPTS[i % WARMUP_PROMPTS.len()].to_owned());
            let step = Instant::now();
            if let Err(e) = self
                .dispatcher
                .generate_on(Arc::clone(&model), prompt, config.clone())
                .await
            {
                warn!("Warmup of {} failed: {}", model_id, e);
                status.is_warmed = false;
                status.error = Some(e.to_string());
                return status;
            }
            if i == 0 {
                kernel_ms = step.elapsed().as_secs_f64() * 1000.0;
            }
        }
        let total_ms = started.elapsed().as_secs_f64() * 1000.0;
        let warmup_ms = if num_prompts > 1 {
            total_ms - kernel_ms
        } else {
            total_ms
        };

        let now = Utc::now();
        status.is_warmed = true;
        status.error = None;
        status.kernel_compilation_time_ms = kernel_ms;
        status.warmup_time_ms = warmup_ms;
        status.warmup_prompts_used = num_prompts;
        status.last_warmup = Some(now);
        info!(
            "Warmed {} with {} prompts: kernel {:.1} ms, warmup {:.1} ms",
            model_id, num_prompts, kernel_ms, warmup_ms
        );

        self.persist(
            &model_id,
            WarmupRecord {
                warmup_time_ms: warmup_ms,
                kernel_compilation_time_ms: kernel_ms,
                warmup_prompts_used: num_prompts,
                last_warmup: now,
            },
        )
        .await;
        status
    }

    async fn persist(&self, model_id: &str, record: WarmupRecord) {
        let snapshot = {
            let mut history = self.history.lock();
            history.insert(model_id.to_owned(), record);
            history.clone()
        };
        if let Some(path) = &self.history_file {
            if let Err(e) = write_history(path, &snapshot).await {
                warn!("Failed to persist warmup history: {e:#}");
            }
        }
    }
}
