//! Collaborators the core consumes through narrow interfaces: where model
//! files live, retrieval for prompt augmentation, and hardware telemetry.

pub mod storage;
pub mod telemetry;
pub mod vector_store;

pub use storage::{DirectorySource, ModelSource};
pub use telemetry::{
    HardwareSnapshot, OptimizationHint, StaticTelemetry, SysinfoTelemetry, TelemetryProvider,
};
pub use vector_store::{
    augment_prompt, ingest_dir, retrieval_query, InMemoryVectorStore, Passage, VectorStore,
};
