//! [`SequencePool`] – runs independent sequences concurrently.
//!
//! Within a sequence the engine is strictly sequential, but distinct videos
//! share nothing except the read-only codec, so they are fanned out onto
//! Tokio's blocking thread pool.  A semaphore caps the number of sequences
//! in flight at `workers`.
//!
//! Each sequence gets its own [`SequenceOutcome`]; a failing sequence is
//! reported in its outcome and never affects the others.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use vos_codec::CodecVariant;
//! use vos_memory::RetentionSpec;
//! use vos_runtime::{PropagationEngine, SequencePool};
//! use vos_runtime::synthetic::moving_square;
//!
//! # #[tokio::main(flavor = "multi_thread", worker_threads = 2)]
//! # async fn main() {
//! let engine = Arc::new(PropagationEngine::new(CodecVariant::default().build().unwrap()));
//! let videos = vec![
//!     moving_square("a", 3, 8, 8).unwrap().sequence,
//!     moving_square("b", 4, 8, 8).unwrap().sequence,
//! ];
//!
//! let outcomes = SequencePool::new(2)
//!     .run(engine, videos, RetentionSpec::every(2))
//!     .await
//!     .unwrap();
//! assert_eq!(outcomes.len(), 2);
//! assert!(outcomes.iter().all(|o| o.result.is_ok()));
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{info, warn};
use uuid::Uuid;
use vos_memory::RetentionSpec;
use vos_types::{SequenceMeta, VideoSequence, VosError};

use crate::engine::{Propagation, PropagationEngine};

/// Result of one sequence processed by the pool.
#[derive(Debug)]
pub struct SequenceOutcome {
    /// Unique identifier of this run.
    pub run_id: Uuid,
    /// Wall-clock time at which the sequence started processing.
    pub started_at: DateTime<Utc>,
    pub meta: SequenceMeta,
    pub result: Result<Propagation, VosError>,
}

/// Bounded concurrent executor for whole sequences.
#[derive(Debug, Clone)]
pub struct SequencePool {
    workers: usize,
}

impl SequencePool {
    /// `workers` is clamped to at least 1.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Propagate every sequence and return the outcomes in input order.
    ///
    /// # Errors
    ///
    /// Returns [`VosError::Configuration`] if `retention` is invalid; in that
    /// case no sequence is started.  Per-sequence failures are reported in
    /// the corresponding [`SequenceOutcome::result`].
    pub async fn run<I>(
        &self,
        engine: Arc<PropagationEngine>,
        sequences: I,
        retention: RetentionSpec,
    ) -> Result<Vec<SequenceOutcome>, VosError>
    where
        I: IntoIterator<Item = VideoSequence>,
    {
        let policy = retention.resolve()?;
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut pending: Vec<(Uuid, SequenceMeta)> = Vec::new();
        let mut task_index: HashMap<task::Id, usize> = HashMap::new();

        for (index, sequence) in sequences.into_iter().enumerate() {
            pending.push((Uuid::new_v4(), sequence.meta.clone()));
            let engine = Arc::clone(&engine);
            let semaphore = Arc::clone(&semaphore);
            let handle = tasks.spawn(async move {
                match semaphore.acquire_owned().await {
                    Ok(permit) => {
                        let started_at = Utc::now();
                        let joined = task::spawn_blocking(move || {
                            let _permit = permit;
                            engine.run_sequence(&sequence, policy)
                        })
                        .await;
                        let result = joined.unwrap_or_else(|e| {
                            Err(VosError::CodecFailure(format!("sequence worker panicked: {e}")))
                        });
                        (started_at, result)
                    }
                    Err(e) => (
                        Utc::now(),
                        Err(VosError::Configuration(format!("worker pool closed: {e}"))),
                    ),
                }
            });
            task_index.insert(handle.id(), index);
        }

        let mut slots: Vec<Option<Finished>> = (0..pending.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, finished) = match joined {
                Ok((id, finished)) => (id, finished),
                Err(e) => {
                    warn!(error = %e, "sequence task failed to join");
                    let failure = VosError::CodecFailure(format!("sequence task failed: {e}"));
                    (e.id(), (Utc::now(), Err(failure)))
                }
            };
            if let Some(&index) = task_index.get(&id) {
                slots[index] = Some(finished);
            }
        }

        let outcomes = assemble_outcomes(pending, slots);
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(sequences = outcomes.len(), failed, "pool run complete");
        Ok(outcomes)
    }
}

/// Start time and result reported by one sequence task.
type Finished = (DateTime<Utc>, Result<Propagation, VosError>);

/// Pair every input sequence with its result, in input order.  A sequence
/// whose task never reported still gets an outcome, carrying a
/// [`VosError::CodecFailure`].
fn assemble_outcomes(
    pending: Vec<(Uuid, SequenceMeta)>,
    slots: Vec<Option<Finished>>,
) -> Vec<SequenceOutcome> {
    pending
        .into_iter()
        .zip(slots)
        .map(|((run_id, meta), slot)| {
            let (started_at, result) = slot.unwrap_or_else(|| {
                let failure = format!("sequence {} produced no result", meta.name);
                (Utc::now(), Err(VosError::CodecFailure(failure)))
            });
            SequenceOutcome {
                run_id,
                started_at,
                meta,
                result,
            }
        })
        .collect()
}
