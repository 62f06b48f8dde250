//! Per-conversation KV cache with memory-bounded LRU eviction
//!
//! Entries are keyed by `(model_id, conversation_id)` and live in a sharded
//! map, so independent conversations never contend on one global lock. Each
//! entry's tensors sit behind their own mutex, which totally orders the
//! concatenate/truncate steps of a single conversation.
//!
//! Eviction only reads the per-entry atomics (access sequence and byte
//! size), never the entry mutexes, and runs after every mutation before
//! control returns to the caller.

use candle_core::{DType, Device, Tensor};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::CacheError;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
/// Accounting assumes float32 storage regardless of the compute dtype.
const BYTES_PER_ELEMENT: u64 = 4;
/// Sequence axis of a `[batch, kv_heads, seq, head_dim]` buffer
const SEQ_DIM: usize = 2;

/// What happens when an update would grow past `truncate_len`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationPolicy {
    /// Keep only the most recent `truncate_len` positions (lossy)
    #[default]
    SlidingWindow,
    /// Empty the entry so the caller recomputes from scratch
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvCacheSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: f64,
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,
    #[serde(default)]
    pub truncation: TruncationPolicy,
}

fn default_enabled() -> bool {
    true
}
fn default_max_memory_mb() -> f64 {
    2048.0
}
fn default_max_conversations() -> usize {
    100
}

impl Default for KvCacheSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_memory_mb: default_max_memory_mb(),
            max_conversations: default_max_conversations(),
            truncation: TruncationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub model_id: String,
    pub conversation_id: String,
}

impl CacheKey {
    pub fn new(model_id: &str, conversation_id: &str) -> Self {
        Self {
            model_id: model_id.to_owned(),
            conversation_id: conversation_id.to_owned(),
        }
    }
}

/// Snapshot of one conversation's attention state.
///
/// `keys[l]` and `values[l]` are `[1, kv_heads, sequence_length, head_dim]`.
/// Tensors are reference counted, so snapshots are cheap.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub model_id: String,
    pub conversation_id: String,
    pub keys: Vec<Tensor>,
    pub values: Vec<Tensor>,
    pub sequence_length: usize,
    /// Token ids known to occupy the leading positions, oldest first.
    /// Cleared whenever truncation shifts or drops positions.
    pub tokens: Vec<u32>,
    pub last_accessed: DateTime<Utc>,
    pub memory_mb: f64,
}

impl CacheEntry {
    pub fn layer_count(&self) -> usize {
        self.keys.len()
    }

    /// Leading positions of `prompt` this entry already holds
    pub fn reusable_prefix(&self, prompt: &[u32]) -> usize {
        self.tokens
            .iter()
            .zip(prompt)
            .take_while(|(cached, token)| cached == token)
            .count()
            .min(self.sequence_length)
    }
}

struct CacheSlot {
    entry: Mutex<CacheEntry>,
    access: AtomicU64,
    memory_bytes: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryStats {
    pub model_id: String,
    pub conversation_id: String,
    pub sequence_length: usize,
    pub memory_mb: f64,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KvCacheStats {
    pub enabled: bool,
    pub num_caches: usize,
    pub total_memory_mb: f64,
    pub max_memory_mb: f64,
    pub max_conversations: usize,
    /// A lone entry larger than the whole budget is retained and flagged here
    pub over_budget: bool,
    pub truncation: TruncationPolicy,
    pub caches: Vec<CacheEntryStats>,
}

fn buffer_bytes(keys: &[Tensor]) -> u64 {
    keys.iter()
        .map(|k| 2 * k.elem_count() as u64 * BYTES_PER_ELEMENT)
        .sum()
}

fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

fn empty_like(tensor: &Tensor) -> Result<Tensor, CacheError> {
    let (batch, heads, _, head_dim) = tensor.dims4()?;
    Ok(Tensor::zeros(
        (batch, heads, 0, head_dim),
        tensor.dtype(),
        tensor.device(),
    )?)
}

pub struct KvCacheManager {
    entries: DashMap<CacheKey, Arc<CacheSlot>>,
    settings: RwLock<KvCacheSettings>,
    /// Logical clock; bumped on every create/get/update
    access_seq: AtomicU64,
    eviction: Mutex<()>,
}

impl KvCacheManager {
    pub fn new(settings: KvCacheSettings) -> Self {
        info!(
            "KV cache: enabled={}, budget={} MB, max_conversations={}, truncation={:?}",
            settings.enabled,
            settings.max_memory_mb,
            settings.max_conversations,
            settings.truncation
        );
        Self {
            entries: DashMap::new(),
            settings: RwLock::new(settings),
            access_seq: AtomicU64::new(0),
            eviction: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> KvCacheSettings {
        self.settings.read().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.read().enabled
    }

    /// Replace the settings. Disabling drops every entry; shrinking a limit
    /// evicts down to it immediately.
    pub fn update_settings(&self, settings: KvCacheSettings) {
        let enabled = settings.enabled;
        *self.settings.write() = settings;
        if !enabled {
            self.clear_all();
        }
        self.evict();
    }

    fn tick(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn slot(&self, model_id: &str, conversation_id: &str) -> Option<Arc<CacheSlot>> {
        self.entries
            .get(&CacheKey::new(model_id, conversation_id))
            .map(|slot| Arc::clone(slot.value()))
    }

    pub fn has(&self, model_id: &str, conversation_id: &str) -> bool {
        self.is_enabled()
            && self
                .entries
                .contains_key(&CacheKey::new(model_id, conversation_id))
    }

    /// Snapshot of an entry; a hit counts as an access for LRU purposes.
    pub fn get(&self, model_id: &str, conversation_id: &str) -> Option<CacheEntry> {
        if !self.is_enabled() {
            return None;
        }
        let slot = self.slot(model_id, conversation_id)?;
        let mut entry = slot.entry.lock();
        entry.last_accessed = Utc::now();
        slot.access.store(self.tick(), Ordering::Relaxed);
        Some(entry.clone())
    }

    /// Cached sequence length without counting as an access
    pub fn sequence_length(&self, model_id: &str, conversation_id: &str) -> Option<usize> {
        if !self.is_enabled() {
            return None;
        }
        let slot = self.slot(model_id, conversation_id)?;
        let len = slot.entry.lock().sequence_length;
        Some(len)
    }

    /// Positions of `prompt` covered by the conversation's recorded tokens,
    /// without counting as an access. Zero when the history diverges at the
    /// first token.
    pub fn reusable_prefix(&self, model_id: &str, conversation_id: &str, prompt: &[u32]) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        self.slot(model_id, conversation_id)
            .map(|slot| slot.entry.lock().reusable_prefix(prompt))
            .unwrap_or(0)
    }

    /// Record which token ids the entry's leading positions hold
    pub fn record_tokens(
        &self,
        model_id: &str,
        conversation_id: &str,
        tokens: &[u32],
    ) -> Result<(), CacheError> {
        if !self.is_enabled() {
            return Err(CacheError::Disabled);
        }
        let slot = self
            .slot(model_id, conversation_id)
            .ok_or_else(|| CacheError::NotFound {
                model_id: model_id.to_owned(),
                conversation_id: conversation_id.to_owned(),
            })?;
        let mut entry = slot.entry.lock();
        let held = tokens.len().min(entry.sequence_length);
        entry.tokens = tokens[..held].to_vec();
        Ok(())
    }

    /// Allocate zeroed buffers for a new conversation, replacing any
    /// existing entry under the same key.
    #[instrument(skip_all, fields(model_id = %model_id, conversation_id = %conversation_id))]
    pub fn create(
        &self,
        model_id: &str,
        conversation_id: &str,
        layer_count: usize,
        head_count: usize,
        head_dim: usize,
        initial_len: usize,
    ) -> Result<CacheEntry, CacheError> {
        if !self.is_enabled() {
            return Err(CacheError::Disabled);
        }
        let shape = (1, head_count, initial_len, head_dim);
        let mut keys = Vec::with_capacity(layer_count);
        let mut values = Vec::with_capacity(layer_count);
        for _ in 0..layer_count {
            keys.push(Tensor::zeros(shape, DType::F32, &Device::Cpu)?);
            values.push(Tensor::zeros(shape, DType::F32, &Device::Cpu)?);
        }
        let bytes = buffer_bytes(&keys);
        let entry = CacheEntry {
            model_id: model_id.to_owned(),
            conversation_id: conversation_id.to_owned(),
            keys,
            values,
            sequence_length: initial_len,
            tokens: Vec::new(),
            last_accessed: Utc::now(),
            memory_mb: bytes_to_mb(bytes),
        };
        let slot = Arc::new(CacheSlot {
            entry: Mutex::new(entry.clone()),
            access: AtomicU64::new(self.tick()),
            memory_bytes: AtomicU64::new(bytes),
        });
        self.entries
            .insert(CacheKey::new(model_id, conversation_id), slot);
        debug!("Created KV entry: {layer_count} layers, {initial_len} positions");

        self.evict();
        Ok(entry)
    }

    /// Append one turn's keys/values along the sequence axis, then apply the
    /// truncation policy if the result is longer than `truncate_len`.
    #[instrument(skip_all, fields(model_id = %model_id, conversation_id = %conversation_id))]
    pub fn update(
        &self,
        model_id: &str,
        conversation_id: &str,
        new_keys: Vec<Tensor>,
        new_values: Vec<Tensor>,
        truncate_len: Option<usize>,
    ) -> Result<CacheEntry, CacheError> {
        let policy = {
            let settings = self.settings.read();
            if !settings.enabled {
                return Err(CacheError::Disabled);
            }
            settings.truncation
        };
        let slot = self
            .slot(model_id, conversation_id)
            .ok_or_else(|| CacheError::NotFound {
                model_id: model_id.to_owned(),
                conversation_id: conversation_id.to_owned(),
            })?;

        let snapshot = {
            let mut entry = slot.entry.lock();
            if new_keys.len() != entry.layer_count() || new_values.len() != entry.layer_count() {
                return Err(CacheError::ShapeMismatch(format!(
                    "expected {} layers, got {} keys and {} values",
                    entry.layer_count(),
                    new_keys.len(),
                    new_values.len()
                )));
            }

            let mut keys = Vec::with_capacity(new_keys.len());
            let mut values = Vec::with_capacity(new_values.len());
            for (layer, (k, v)) in new_keys.iter().zip(new_values.iter()).enumerate() {
                let (_, heads, _, head_dim) = entry.keys[layer].dims4()?;
                for tensor in [k, v] {
                    let (_, h, _, d) = tensor.dims4()?;
                    if h != heads || d != head_dim {
                        return Err(CacheError::ShapeMismatch(format!(
                            "layer {layer}: expected {heads} heads x {head_dim} dims, got {h} x {d}"
                        )));
                    }
                }
                let k = k.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
                let v = v.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
                if entry.sequence_length == 0 {
                    keys.push(k);
                    values.push(v);
                } else {
                    keys.push(Tensor::cat(&[&entry.keys[layer], &k], SEQ_DIM)?);
                    values.push(Tensor::cat(&[&entry.values[layer], &v], SEQ_DIM)?);
                }
            }

            let mut seq_len = keys.first().map(|k| k.dim(SEQ_DIM)).transpose()?.unwrap_or(0);
            if let Some(limit) = truncate_len.filter(|limit| seq_len > *limit) {
                entry.tokens.clear();
                match policy {
                    TruncationPolicy::SlidingWindow => {
                        let start = seq_len - limit;
                        for t in keys.iter_mut().chain(values.iter_mut()) {
                            *t = t.narrow(SEQ_DIM, start, limit)?;
                        }
                        seq_len = limit;
                    }
                    TruncationPolicy::Reset => {
                        for t in keys.iter_mut().chain(values.iter_mut()) {
                            *t = empty_like(t)?;
                        }
                        seq_len = 0;
                    }
                }
                debug!("Truncated KV entry with {policy:?} to {seq_len} positions");
            }

            let bytes = buffer_bytes(&keys);
            entry.keys = keys;
            entry.values = values;
            entry.sequence_length = seq_len;
            entry.memory_mb = bytes_to_mb(bytes);
            entry.last_accessed = Utc::now();
            slot.memory_bytes.store(bytes, Ordering::Relaxed);
            slot.access.store(self.tick(), Ordering::Relaxed);
            entry.clone()
        };

        self.evict();
        Ok(snapshot)
    }

    pub fn clear(&self, model_id: &str, conversation_id: &str) -> bool {
        self.entries
            .remove(&CacheKey::new(model_id, conversation_id))
            .is_some()
    }

    /// Drop every conversation of `model_id`; returns how many were removed.
    pub fn clear_model(&self, model_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.model_id != model_id);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            info!("Cleared {removed} KV entries for {model_id}");
        }
        removed
    }

    pub fn clear_all(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn total_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|slot| slot.value().memory_bytes.load(Ordering::Relaxed))
            .sum()
    }

    /// Evict least-recently-used entries until both limits hold. A single
    /// entry that alone exceeds the memory budget is kept.
    fn evict(&self) -> usize {
        let _serialized = self.eviction.lock();
        let settings = self.settings.read().clone();

        let mut candidates: Vec<(CacheKey, u64, u64)> = self
            .entries
            .iter()
            .map(|slot| {
                (
                    slot.key().clone(),
                    slot.value().access.load(Ordering::Relaxed),
                    slot.value().memory_bytes.load(Ordering::Relaxed),
                )
            })
            .collect();
        candidates.sort_by_key(|(_, access, _)| *access);

        let mut count = candidates.len();
        let mut total: u64 = candidates.iter().map(|(_, _, bytes)| bytes).sum();
        let mut evicted = 0;
        for (key, _, bytes) in candidates {
            let over_count = count > settings.max_conversations;
            let over_memory = bytes_to_mb(total) > settings.max_memory_mb;
            if !over_count && !(over_memory && count > 1) {
                break;
            }
            if self.entries.remove(&key).is_some() {
                info!(
                    "Evicted KV entry {}/{} ({:.2} MB)",
                    key.model_id,
                    key.conversation_id,
                    bytes_to_mb(bytes)
                );
                evicted += 1;
            }
            count -= 1;
            total = total.saturating_sub(bytes);
        }
        evicted
    }

    pub fn stats(&self) -> KvCacheStats {
        let settings = self.settings();
        let slots: Vec<Arc<CacheSlot>> = self
            .entries
            .iter()
            .map(|slot| Arc::clone(slot.value()))
            .collect();
        let mut caches: Vec<CacheEntryStats> = slots
            .iter()
            .map(|slot| {
                let entry = slot.entry.lock();
                CacheEntryStats {
                    model_id: entry.model_id.clone(),
                    conversation_id: entry.conversation_id.clone(),
                    sequence_length: entry.sequence_length,
                    memory_mb: entry.memory_mb,
                    last_accessed: entry.last_accessed,
                }
            })
            .collect();
        caches.sort_by(|a, b| {
            (&a.model_id, &a.conversation_id).cmp(&(&b.model_id, &b.conversation_id))
        });

        let total_memory_mb = bytes_to_mb(self.total_bytes());
        KvCacheStats {
            enabled: settings.enabled,
            num_caches: caches.len(),
            total_memory_mb,
            max_memory_mb: settings.max_memory_mb,
            max_conversations: settings.max_conversations,
            over_budget: total_memory_mb > settings.max_memory_mb,
            truncation: settings.truncation,
            caches,
        }
    }
}

impl Default for KvCacheManager {
    fn default() -> Self {
        Self::new(KvCacheSettings::default())
    }
}
