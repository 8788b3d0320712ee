//! Generation tokens and the deliver/discard gate.
//!
//! Every background computation (clustering run, stack regeneration, merge)
//! belongs to a [`Scope`]. Issuing a new request for a scope bumps its
//! generation counter, cancels the previous generation's
//! [`CancellationToken`](tokio_util::sync::CancellationToken), and makes every
//! older in-flight result stale before it even finishes. When a job
//! completes, [`TaskCoordinator::gate`] compares its generation against the
//! scope's current one and either delivers or silently discards it.
//!
//! ```ignore
//! let coord = TaskCoordinator::<u32>::new(CoordinatorConfig::default());
//! let scope = Scope::clustering("project-1");
//! let g1 = coord.spawn(scope.clone(), |_ctx| 1);
//! let g2 = coord.spawn(scope.clone(), |_ctx| 2);
//!
//! // g1 may finish last; it is discarded either way.
//! while let Some(gate) = coord.deliver_next().await { ... }
//! ```

mod cancel;
mod coordinator;
mod token;

pub use cancel::{CancelProbe, Cancelled};
pub use coordinator::{Completion, CoordinatorConfig, Gate, JobContext, TaskCoordinator};
pub use token::{GenerationToken, OperationKind, Phase, Scope};

pub use tokio_util::sync::CancellationToken;
