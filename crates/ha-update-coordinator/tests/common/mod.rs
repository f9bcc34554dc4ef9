//! Shared fixtures for coordinator integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ha_core::{EntryLink, UnloadHook, UpdateError, UpdateResult};
use ha_update_coordinator::{BackoffPolicy, CoordinatorConfig, DataUpdateCoordinator, UpdateSource};
use tokio::sync::Semaphore;

pub const INTERVAL: Duration = Duration::from_secs(30);

/// Source that replays scripted results, then returns the call number
#[derive(Default)]
pub struct ScriptedSource {
    calls: AtomicUsize,
    setups: AtomicUsize,
    script: Mutex<VecDeque<UpdateResult<u32>>>,
    setup_result: Mutex<Option<UpdateError>>,
    gate: Option<Semaphore>,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(results: Vec<UpdateResult<u32>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            ..Self::default()
        })
    }

    /// Every fetch blocks until [`ScriptedSource::release`] hands out a permit
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    pub fn failing_setup(err: UpdateError) -> Arc<Self> {
        Arc::new(Self {
            setup_result: Mutex::new(Some(err)),
            ..Self::default()
        })
    }

    pub fn push(&self, result: UpdateResult<u32>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn release(&self, fetches: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(fetches);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn setups(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdateSource<u32> for ScriptedSource {
    async fn setup(&self) -> UpdateResult<()> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        let result = self.setup_result.lock().unwrap().clone();
        match result {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fetch(&self) -> UpdateResult<u32> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or(Ok(call as u32))
    }
}

/// Config entry stand-in that records what the coordinator asks of it
#[derive(Default)]
pub struct MockEntry {
    pub polling_disabled: AtomicBool,
    reauth: Mutex<Vec<String>>,
    hooks: Mutex<Vec<UnloadHook>>,
}

impl MockEntry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reauth_requests(&self) -> Vec<String> {
        self.reauth.lock().unwrap().clone()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.lock().unwrap().len()
    }

    /// Run unload hooks, last registered first
    pub async fn unload(&self) {
        let hooks: Vec<UnloadHook> = self.hooks.lock().unwrap().drain(..).collect();
        for hook in hooks.into_iter().rev() {
            hook().await;
        }
    }
}

impl EntryLink for MockEntry {
    fn entry_id(&self) -> &str {
        "01TESTENTRY"
    }

    fn title(&self) -> &str {
        "Test entry"
    }

    fn polling_disabled(&self) -> bool {
        self.polling_disabled.load(Ordering::SeqCst)
    }

    fn start_reauth(&self, reason: &str) {
        self.reauth.lock().unwrap().push(reason.to_string());
    }

    fn on_unload(&self, hook: UnloadHook) {
        self.hooks.lock().unwrap().push(hook);
    }
}

/// Counts notifications and records `last_update_success` at each one
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<bool>>>,
}

impl Recorder {
    pub fn attach(
        &self,
        coordinator: &DataUpdateCoordinator<u32>,
    ) -> ha_update_coordinator::ListenerHandle {
        let seen = Arc::clone(&self.seen);
        let observed = coordinator.clone();
        coordinator.add_listener(move || {
            seen.lock().unwrap().push(observed.last_update_success());
        })
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<bool> {
        self.seen.lock().unwrap().last().copied()
    }
}

pub fn config() -> CoordinatorConfig {
    CoordinatorConfig::new("test")
        .with_update_interval(INTERVAL)
        .with_backoff(BackoffPolicy::default().with_jitter(0.0))
        .with_jitter_seed(0)
}

pub fn coordinator(source: &Arc<ScriptedSource>) -> DataUpdateCoordinator<u32> {
    DataUpdateCoordinator::new(config(), Arc::clone(source), None)
}

pub fn coordinator_for_entry(
    source: &Arc<ScriptedSource>,
    entry: &Arc<MockEntry>,
) -> DataUpdateCoordinator<u32> {
    let link: Arc<dyn EntryLink> = entry.clone();
    DataUpdateCoordinator::new(config(), Arc::clone(source), Some(link))
}

/// Let spawned tasks run up to their next real suspension point
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Count listener notifications
pub fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&count);
    (count, move || {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}
