//! Server state management

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::engine::Engine;
use crate::integrations::{InMemoryVectorStore, VectorStore};

pub use crate::config::{CorsConfig, ServerConfig};

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub engine: Arc<Engine>,

    /// Server configuration (same value the engine was built from)
    pub config: Arc<ServerConfig>,

    pub metrics: Arc<Metrics>,

    /// Retrieval backend for `use_rag` requests; `None` when RAG is disabled
    pub vector_store: Option<Arc<dyn VectorStore>>,
}

impl ServerState {
    /// State with an empty in-memory store when `rag.enabled`
    pub fn new(engine: Arc<Engine>) -> Self {
        let config = Arc::new(engine.config().clone());
        let vector_store = config
            .rag
            .enabled
            .then(|| Arc::new(InMemoryVectorStore::new()) as Arc<dyn VectorStore>);
        Self {
            engine,
            config,
            metrics: Arc::new(Metrics::default()),
            vector_store,
        }
    }

    /// Swap in another retrieval backend
    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }
}

/// Metrics collector
#[derive(Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub total_tokens: AtomicU64,
    pub active_requests: AtomicU32,
    /// Exponential moving average of request latency
    avg_latency_ms: RwLock<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub active_requests: u32,
    pub avg_latency_ms: f64,
}

const LATENCY_SMOOTHING: f64 = 0.1;

impl Metrics {
    /// Count a request as active until the guard drops
    pub fn begin(self: &Arc<Self>) -> MetricsGuard {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        MetricsGuard {
            metrics: Arc::clone(self),
            started: Instant::now(),
        }
    }

    pub fn record_tokens(&self, tokens: usize) {
        self.total_tokens.fetch_add(tokens as u64, Ordering::Relaxed);
    }

    fn record_latency(&self, latency_ms: f64) {
        let mut avg = self.avg_latency_ms.write();
        *avg = if *avg == 0.0 {
            latency_ms
        } else {
            *avg * (1.0 - LATENCY_SMOOTHING) + latency_ms * LATENCY_SMOOTHING
        };
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            avg_latency_ms: *self.avg_latency_ms.read(),
        }
    }
}

/// RAII guard for the active-request counter. Owned, so a streaming task can
/// hold it until the last event is sent.
pub struct MetricsGuard {
    metrics: Arc<Metrics>,
    started: Instant,
}

impl Drop for MetricsGuard {
    fn drop(&mut self) {
        self.metrics.active_requests.fetch_sub(1, Ordering::Relaxed);
        self.metrics
            .record_latency(self.started.elapsed().as_secs_f64() * 1000.0);
    }
}
