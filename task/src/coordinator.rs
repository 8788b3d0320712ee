use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cancel::CancelProbe;
use crate::token::{GenerationToken, Phase, Scope};

/// Controls the worker pool and cancellation polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximum number of jobs running at once. Default: 4.
    pub workers: usize,

    /// Comparisons between two reads of the cancellation flag. Default: 256.
    pub cancel_check_interval: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            cancel_check_interval: 256,
        }
    }
}

/// Handed to every job: its generation and its cancellation flag.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub token: GenerationToken,
    pub cancel: CancellationToken,
    check_interval: usize,
}

impl JobContext {
    /// A probe bound to this generation's flag.
    pub fn probe(&self) -> CancelProbe {
        CancelProbe::new(self.cancel.clone(), self.check_interval)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A finished job tagged with the generation that produced it.
#[derive(Debug)]
pub struct Completion<T> {
    pub token: GenerationToken,
    pub output: T,
}

/// Result of passing a completion through the staleness gate.
#[derive(Debug)]
pub enum Gate<T> {
    /// The completion belongs to the scope's current generation; apply it.
    Delivered(Completion<T>),
    /// Superseded, cancelled before it started, or the worker died.
    Discarded(GenerationToken),
}

impl<T> Gate<T> {
    pub fn token(&self) -> &GenerationToken {
        match self {
            Gate::Delivered(c) => &c.token,
            Gate::Discarded(t) => t,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Gate::Delivered(_))
    }
}

enum Outcome<T> {
    Ran(T),
    Skipped,
}

struct Finished<T> {
    token: GenerationToken,
    outcome: Outcome<T>,
}

struct ScopeState {
    current: u64,
    phase: Phase,
    cancel: CancellationToken,
}

impl ScopeState {
    fn idle() -> Self {
        Self {
            current: 0,
            phase: Phase::Idle,
            cancel: CancellationToken::new(),
        }
    }
}

type Scopes = Arc<Mutex<HashMap<Scope, ScopeState>>>;

/// Issues generations, runs jobs on a bounded pool and gates their results.
///
/// Jobs run on tokio's blocking pool, at most `workers` at a time. Results
/// arrive on an internal channel and are read by a single consumer through
/// [`TaskCoordinator::deliver_next`], which never blocks on a running job's
/// internals, only on the channel.
pub struct TaskCoordinator<T> {
    cfg: CoordinatorConfig,
    scopes: Scopes,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    tx: mpsc::UnboundedSender<Finished<T>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Finished<T>>>,
}

impl<T: Send + 'static> TaskCoordinator<T> {
    pub fn new(cfg: CoordinatorConfig) -> Self {
        let workers = cfg.workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            scopes: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(workers)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Starts a new generation for `scope`.
    ///
    /// The previous generation's flag is cancelled and the scope's current
    /// pointer moves to the new id before any work starts, so every older
    /// in-flight result is already stale.
    pub fn issue(&self, scope: Scope) -> JobContext {
        let mut scopes = self.scopes.lock();
        let state = scopes.entry(scope.clone()).or_insert_with(ScopeState::idle);
        state.cancel.cancel();
        state.current += 1;
        state.cancel = CancellationToken::new();
        state.phase = Phase::Running(state.current);
        debug!(scope = %scope, generation = state.current, "generation issued");
        JobContext {
            token: GenerationToken {
                id: state.current,
                scope,
            },
            cancel: state.cancel.clone(),
            check_interval: self.cfg.cancel_check_interval,
        }
    }

    /// Issues a generation and runs `job` in the background.
    ///
    /// Must be called from within a tokio runtime. Exactly one gate result
    /// is eventually produced for every spawned job.
    pub fn spawn<F>(&self, scope: Scope, job: F) -> GenerationToken
    where
        F: FnOnce(JobContext) -> T + Send + 'static,
    {
        let ctx = self.issue(scope);
        let token = ctx.token.clone();
        let tx = self.tx.clone();
        let permits = Arc::clone(&self.permits);
        let scopes = Arc::clone(&self.scopes);
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let token = ctx.token.clone();
            let permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    let _ = tx.send(Finished {
                        token,
                        outcome: Outcome::Skipped,
                    });
                    return;
                }
            };

            if ctx.is_cancelled() {
                debug!(token = %token, "superseded before start");
                drop(permit);
                let _ = tx.send(Finished {
                    token,
                    outcome: Outcome::Skipped,
                });
                return;
            }

            let outcome = match tokio::task::spawn_blocking(move || job(ctx)).await {
                Ok(output) => Outcome::Ran(output),
                Err(e) => {
                    warn!(token = %token, error = %e, "worker failed");
                    mark_discarded(&scopes, &token);
                    Outcome::Skipped
                }
            };
            drop(permit);
            let _ = tx.send(Finished { token, outcome });
        });

        token
    }

    /// Issues a generation and runs `job` on the calling thread, passing the
    /// result straight through the gate. Used for short merge/split work
    /// that still has to lose against a newer generation.
    ///
    /// The inline result type is independent of the pool's output type.
    pub fn run_inline<R, F>(&self, scope: Scope, job: F) -> Gate<R>
    where
        F: FnOnce(&JobContext) -> R,
    {
        let ctx = self.issue(scope);
        let output = job(&ctx);
        self.gate(Completion {
            token: ctx.token,
            output,
        })
    }

    /// Delivers the completion if it belongs to its scope's current
    /// generation and that generation has not been delivered or cancelled
    /// yet; otherwise discards it.
    pub fn gate<R>(&self, completion: Completion<R>) -> Gate<R> {
        let id = completion.token.id;
        let fresh = {
            let mut scopes = self.scopes.lock();
            match scopes.get_mut(&completion.token.scope) {
                Some(state) if state.current == id && state.phase == Phase::Running(id) => {
                    state.phase = Phase::Delivered(id);
                    true
                }
                _ => false,
            }
        };
        if fresh {
            Gate::Delivered(completion)
        } else {
            debug!(token = %completion.token, "discarding stale result");
            Gate::Discarded(completion.token)
        }
    }

    /// Waits for the next finished job and gates it.
    ///
    /// Returns `None` only when no job is in flight.
    pub async fn deliver_next(&self) -> Option<Gate<T>> {
        if self.in_flight() == 0 {
            return None;
        }
        let finished = self.rx.lock().await.recv().await?;
        Some(self.settle(finished))
    }

    /// Gates a finished job if one is ready, without waiting.
    pub fn try_deliver(&self) -> Option<Gate<T>> {
        let finished = self.rx.try_lock().ok()?.try_recv().ok()?;
        Some(self.settle(finished))
    }

    fn settle(&self, finished: Finished<T>) -> Gate<T> {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match finished.outcome {
            Outcome::Ran(output) => self.gate(Completion {
                token: finished.token,
                output,
            }),
            Outcome::Skipped => Gate::Discarded(finished.token),
        }
    }

    /// Cancels the scope's current generation without issuing a new one.
    /// Its result, if it still arrives, is discarded.
    pub fn cancel(&self, scope: &Scope) {
        let mut scopes = self.scopes.lock();
        if let Some(state) = scopes.get_mut(scope) {
            state.cancel.cancel();
            if let Phase::Running(g) = state.phase {
                state.phase = Phase::Discarded(g);
            }
        }
    }

    pub fn is_current(&self, token: &GenerationToken) -> bool {
        self.current(&token.scope) == Some(token.id)
    }

    /// The latest issued generation for `scope`, if any.
    pub fn current(&self, scope: &Scope) -> Option<u64> {
        self.scopes.lock().get(scope).map(|s| s.current)
    }

    pub fn phase(&self, scope: &Scope) -> Phase {
        self.scopes
            .lock()
            .get(scope)
            .map(|s| s.phase)
            .unwrap_or(Phase::Idle)
    }

    /// Jobs spawned whose result has not been gated yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.cfg
    }
}

fn mark_discarded(scopes: &Scopes, token: &GenerationToken) {
    let mut scopes = scopes.lock();
    if let Some(state) = scopes.get_mut(&token.scope)
        && state.phase == Phase::Running(token.id)
    {
        state.phase = Phase::Discarded(token.id);
    }
}
