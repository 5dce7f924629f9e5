//! Continuous rebuild state machine
//!
//! A single logical rebuild loop drives `created → working → idle ⇄
//! rebuild-requested → working`, with `shutdown-requested → shutdown`
//! reachable from anywhere. File-change notifications promote the state to
//! `rebuild-requested` unless a shutdown is in flight; a change arriving
//! mid-build is simply recorded, so the post-build transition skips `idle`
//! and the loop immediately rebuilds — bursts coalesce into at most one
//! follow-up build.
//!
//! State transitions broadcast over a watch channel; `is_idle()` and
//! `shutdown()` suspend on it until their predicate holds.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info};

use crate::errors::Result;
use crate::runner::BuildRunner;

/// Terminal result of one build pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuilderState {
    Created,
    Working,
    Idle(BuildOutcome),
    RebuildRequested,
    ShutdownRequested,
    Shutdown,
}

/// Derived read of the rebuilder's condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed(String),
    ShuttingDown,
    Shutdown,
}

struct RebuilderInner {
    runner: tokio::sync::Mutex<BuildRunner>,
    state: Mutex<RebuilderState>,
    state_tx: watch::Sender<RebuilderState>,
}

impl RebuilderInner {
    /// Request termination from whatever state the loop is in; an already
    /// terminal rebuilder stays terminal.
    fn request_shutdown(&self) {
        let mut state = self.state.lock();
        if *state == RebuilderState::Shutdown {
            return;
        }
        *state = RebuilderState::ShutdownRequested;
        drop(state);
        let _ = self.state_tx.send(RebuilderState::ShutdownRequested);
    }

    /// Move from `from` to `to` only if nothing (a shutdown request, a file
    /// change) got there first.
    fn transition(&self, from: &RebuilderState, to: RebuilderState) -> bool {
        let mut state = self.state.lock();
        if *state != *from {
            return false;
        }
        *state = to.clone();
        drop(state);
        let _ = self.state_tx.send(to);
        true
    }

    fn state(&self) -> RebuilderState {
        self.state.lock().clone()
    }

    fn input_did_change(&self) {
        let mut state = self.state.lock();
        match *state {
            // shutdown takes precedence
            RebuilderState::ShutdownRequested | RebuilderState::Shutdown => {}
            _ => {
                *state = RebuilderState::RebuildRequested;
                drop(state);
                let _ = self.state_tx.send(RebuilderState::RebuildRequested);
            }
        }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            match self.state() {
                RebuilderState::Created => {
                    self.transition(&RebuilderState::Created, RebuilderState::Working);
                }
                RebuilderState::Working => {
                    let outcome = match self.runner.lock().await.build().await {
                        Ok(_) => BuildOutcome::Succeeded,
                        Err(err) => {
                            error!(error = %err, "exception while building");
                            BuildOutcome::Failed(err.to_string())
                        }
                    };
                    // a change or shutdown request may have arrived while we
                    // were working; only land in idle if nothing did
                    self.transition(&RebuilderState::Working, RebuilderState::Idle(outcome));
                }
                RebuilderState::Idle(_) => {
                    let mut rx = self.state_tx.subscribe();
                    // re-check: the state may have moved between the match
                    // and the subscription
                    if matches!(self.state(), RebuilderState::Idle(_)) {
                        let _ = rx.changed().await;
                    }
                }
                RebuilderState::RebuildRequested => {
                    info!("rebuilding");
                    self.transition(&RebuilderState::RebuildRequested, RebuilderState::Working);
                }
                RebuilderState::ShutdownRequested => {
                    self.transition(
                        &RebuilderState::ShutdownRequested,
                        RebuilderState::Shutdown,
                    );
                }
                RebuilderState::Shutdown => return,
            }
        }
    }
}

pub struct Rebuilder {
    inner: Arc<RebuilderInner>,
    started: Mutex<bool>,
}

impl Rebuilder {
    /// Wires the runner's watch registry into the rebuild loop.
    pub fn new(runner: BuildRunner) -> Arc<Self> {
        let registry = runner.watch().clone();
        let (state_tx, _) = watch::channel(RebuilderState::Created);
        let inner = Arc::new(RebuilderInner {
            state: Mutex::new(RebuilderState::Created),
            state_tx,
            runner: tokio::sync::Mutex::new(runner),
        });
        let callback_inner = inner.clone();
        registry.set_on_input_change(Arc::new(move || callback_inner.input_did_change()));
        Arc::new(Rebuilder {
            inner,
            started: Mutex::new(false),
        })
    }

    /// Kick off the rebuild loop. Idempotent; only effective from `created`.
    pub fn start(&self) {
        let mut started = self.started.lock();
        if *started || self.inner.state() != RebuilderState::Created {
            return;
        }
        *started = true;
        tokio::spawn(self.inner.clone().run_loop());
    }

    fn ensure_loop(&self) {
        let mut started = self.started.lock();
        if !*started {
            *started = true;
            tokio::spawn(self.inner.clone().run_loop());
        }
    }

    pub fn state(&self) -> RebuilderState {
        self.inner.state()
    }

    /// Derived read of the current idle outcome or running condition.
    pub fn status(&self) -> BuildStatus {
        match self.inner.state() {
            RebuilderState::Created => BuildStatus::NotStarted,
            RebuilderState::Working | RebuilderState::RebuildRequested => BuildStatus::Running,
            RebuilderState::Idle(BuildOutcome::Succeeded) => BuildStatus::Succeeded,
            RebuilderState::Idle(BuildOutcome::Failed(message)) => BuildStatus::Failed(message),
            RebuilderState::ShutdownRequested => BuildStatus::ShuttingDown,
            RebuilderState::Shutdown => BuildStatus::Shutdown,
        }
    }

    /// Suspend until the loop is idle. Never resolves once the rebuilder has
    /// shut down.
    pub async fn is_idle(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            if matches!(self.inner.state(), RebuilderState::Idle(_)) {
                return;
            }
            if rx.changed().await.is_err() {
                // sender gone: pend forever, matching the contract that
                // is_idle never resolves after shutdown
                futures::future::pending::<()>().await;
            }
        }
    }

    /// Request termination and suspend until fully shut down. A never-started
    /// rebuilder still runs its loop once so it cannot be reused.
    pub async fn shutdown(&self) -> Result<()> {
        self.ensure_loop();
        self.inner.request_shutdown();
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            if self.inner.state() == RebuilderState::Shutdown {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}
