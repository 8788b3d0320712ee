use snapsort_cluster::ClusterError;
use snapsort_merge::MergeError;
use snapsort_stack::StackError;
use snapsort_task::GenerationToken;
use thiserror::Error;

/// Errors returned by the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Stack(#[from] StackError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    /// Failure reported by an [`EmbeddingSource`](crate::EmbeddingSource)
    /// or [`GroupSink`](crate::GroupSink) implementation. [`MemoryStore`]
    /// never fails; stores backed by real storage return this.
    ///
    /// [`MemoryStore`]: crate::MemoryStore
    #[error("engine: store: {0}")]
    Store(String),

    #[error("engine: config: {0}")]
    Config(#[from] serde_yaml::Error),

    /// An edit lost against a newer generation and was not applied.
    #[error("engine: {0} was superseded")]
    Superseded(GenerationToken),
}
