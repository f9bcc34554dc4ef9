//! Cooldown debouncer for refresh requests
//!
//! The first call outside the cooldown window runs right away. The window
//! opens when a run finishes, so a slow function is never followed back to
//! back by another run. Calls made while a run is going or inside the window
//! collapse into a single trailing run when the window closes, and that
//! trailing run opens a new window of its own.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::lock::lock;

/// Function run by the debouncer
pub type DebouncedFunction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct DebounceState {
    cooldown_until: Option<Instant>,
    running: bool,
    trailing_pending: bool,
    trailing: Option<JoinHandle<()>>,
    shut_down: bool,
}

struct Shared {
    name: String,
    cooldown: Duration,
    function: DebouncedFunction,
    state: Mutex<DebounceState>,
}

impl Shared {
    /// Close a run: open the window from now and arrange a deferred call
    fn finish_run(self: &Arc<Self>) {
        let mut state = lock(&self.state);
        state.running = false;
        if state.shut_down {
            return;
        }
        let now = Instant::now();
        state.cooldown_until = (!self.cooldown.is_zero()).then(|| now + self.cooldown);
        if state.trailing_pending && state.trailing.is_none() {
            let at = state.cooldown_until.unwrap_or(now);
            state.trailing = Some(self.spawn_trailing(at));
        }
    }

    fn spawn_trailing(self: &Arc<Self>, at: Instant) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            {
                let mut state = lock(&shared.state);
                if state.shut_down {
                    return;
                }
                state.trailing_pending = false;
                state.trailing = None;
                state.running = true;
            }
            let _finish = FinishRun(&shared);
            (shared.function)().await;
        })
    }
}

/// Closes the run even when the caller drops it midway
struct FinishRun<'a>(&'a Arc<Shared>);

impl Drop for FinishRun<'_> {
    fn drop(&mut self) {
        self.0.finish_run();
    }
}

pub struct Debouncer {
    shared: Arc<Shared>,
}

impl Debouncer {
    pub fn new(name: impl Into<String>, cooldown: Duration, function: DebouncedFunction) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                cooldown,
                function,
                state: Mutex::new(DebounceState::default()),
            }),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.shared.cooldown
    }

    /// Run the function now, or fold the call into the trailing run
    ///
    /// Only an immediate run is awaited; a call that lands in the cooldown
    /// window returns as soon as the trailing run is arranged.
    pub async fn call(&self) {
        {
            let mut state = lock(&self.shared.state);
            if state.shut_down {
                return;
            }

            let cooling = matches!(state.cooldown_until, Some(until) if until > Instant::now());
            if state.running || cooling {
                if !state.trailing_pending {
                    state.trailing_pending = true;
                    // A running call arranges the trailing run when it finishes
                    if !state.running {
                        if let Some(until) = state.cooldown_until {
                            state.trailing = Some(self.shared.spawn_trailing(until));
                        }
                    }
                    debug!(debouncer = %self.shared.name, "Call deferred to end of cooldown");
                }
                return;
            }
            state.running = true;
        }

        let _finish = FinishRun(&self.shared);
        (self.shared.function)().await;
    }

    /// Drop a pending trailing run and reset the cooldown window
    pub fn cancel(&self) {
        let mut state = lock(&self.shared.state);
        if let Some(task) = state.trailing.take() {
            task.abort();
        }
        state.trailing_pending = false;
        state.cooldown_until = None;
    }

    /// Cancel and refuse every later call
    pub fn shutdown(&self) {
        self.cancel();
        lock(&self.shared.state).shut_down = true;
    }

    pub fn has_pending_call(&self) -> bool {
        lock(&self.shared.state).trailing_pending
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.shared.state).trailing.take() {
            task.abort();
        }
    }
}
