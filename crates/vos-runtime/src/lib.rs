//! `vos-runtime` – the propagation engine and its surroundings.
//!
//! # Modules
//!
//! - [`engine`] – [`PropagationEngine`][engine::PropagationEngine]: the
//!   causal frame loop that encodes past frames, commits memory frames to a
//!   per-sequence [`MemoryBank`][vos_memory::MemoryBank] and decodes each new
//!   frame against the accumulated memory.
//! - [`pool`] – [`SequencePool`][pool::SequencePool]: runs distinct
//!   sequences concurrently with no shared mutable state.
//! - [`decode`] – argmax label maps, IoU and the DAVIS palette overlay.
//! - [`config`] – [`EngineConfig`][config::EngineConfig]: TOML configuration
//!   with `VOS_*` environment overrides.
//! - [`synthetic`] – deterministic moving-square clips with ground truth.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console/JSON
//!   logging with an optional OTLP span exporter.

pub mod config;
pub mod decode;
pub mod engine;
pub mod pool;
pub mod synthetic;
pub mod telemetry;

pub use config::EngineConfig;
pub use engine::{EngineOptions, Propagation, PropagationEngine, ReadRecord};
pub use pool::{SequenceOutcome, SequencePool};
pub use telemetry::{TracerProviderGuard, init_tracing};
