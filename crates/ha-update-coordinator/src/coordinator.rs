//! Data update coordinator
//!
//! One coordinator polls one upstream source on behalf of many listeners.
//! It owns the latest snapshot and the failure bookkeeping, keeps at most one
//! fetch in flight, schedules the next poll only while someone is listening,
//! and fans out to listeners once the result of a refresh is committed.
//!
//! ```text
//!  Uninitialized ──▶ Refreshing ──▶ Idle ──┐
//!                        ▲   └────▶ Failed ─┤
//!                        └──────────────────┘
//!  any ──shutdown──▶ Unloaded
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use ha_core::{EntryLink, SetupError, UpdateError, UpdateResult};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::debounce::{DebouncedFunction, Debouncer};
use crate::listeners::{ListenerCallback, ListenerHandle, ListenerHost, ListenerId, ListenerRegistry};
use crate::lock::{lock, read, write};
use crate::source::UpdateSource;

/// Cooldown between refreshes started through `request_refresh`
pub const REQUEST_REFRESH_DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Used when a backed-off delay does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Where a coordinator is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    /// No refresh has completed yet
    Uninitialized,
    /// A fetch is in flight
    Refreshing,
    /// The last attempt succeeded
    Idle,
    /// The last attempt failed
    Failed,
    /// Shut down; terminal
    Unloaded,
}

/// Static configuration for a coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Name used in logs
    pub name: String,
    /// Poll interval; `None` means the coordinator never polls on its own
    pub update_interval: Option<Duration>,
    /// Cooldown applied to `request_refresh`
    pub request_refresh_cooldown: Duration,
    /// Upper bound on a single fetch; elapsed fetches count as failed
    pub fetch_timeout: Option<Duration>,
    pub backoff: BackoffPolicy,
    /// Seed for backoff jitter; random when unset
    pub jitter_seed: Option<u64>,
}

impl CoordinatorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            update_interval: None,
            request_refresh_cooldown: REQUEST_REFRESH_DEFAULT_COOLDOWN,
            fetch_timeout: None,
            backoff: BackoffPolicy::default(),
            jitter_seed: None,
        }
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    pub fn with_request_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.request_refresh_cooldown = cooldown;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// `config_entry_first_refresh`; auth failures are reported to the caller
    First,
    Scheduled,
    Requested,
    Manual,
    Push,
}

enum RefreshOutcome {
    Committed(UpdateResult<()>),
    /// Another refresh was already in flight
    Skipped,
    /// Finished after shutdown; nothing was committed
    Discarded,
}

struct CoordinatorState<T> {
    data: Option<Arc<T>>,
    last_exception: Option<UpdateError>,
    last_update_success: bool,
    last_update_success_time: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    update_interval: Option<Duration>,
    phase: CoordinatorPhase,
}

struct ScheduledRefresh {
    id: u64,
    deadline: Instant,
    task: JoinHandle<()>,
}

/// Releases the in-flight flag and wakes joiners when a refresh ends,
/// including when the refreshing future is dropped mid-fetch
struct InFlightGuard<'a> {
    in_flight: &'a AtomicBool,
    done: &'a Notify,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::SeqCst);
        self.done.notify_waiters();
    }
}

pub(crate) struct Inner<T> {
    name: String,
    source: Box<dyn UpdateSource<T>>,
    config_entry: Option<Arc<dyn EntryLink>>,
    fetch_timeout: Option<Duration>,
    backoff: BackoffPolicy,
    state: RwLock<CoordinatorState<T>>,
    listeners: ListenerRegistry,
    in_flight: AtomicBool,
    refresh_done: Notify,
    shut_down: AtomicBool,
    setup_done: AtomicBool,
    timer: Mutex<Option<ScheduledRefresh>>,
    next_timer_id: AtomicU64,
    debouncer: Debouncer,
    rng: Mutex<StdRng>,
    pub(crate) push_tasks: Mutex<Vec<JoinHandle<()>>>,
    me: Weak<Inner<T>>,
}

impl<T: Send + Sync + 'static> Inner<T> {
    fn polling_disabled(&self) -> bool {
        self.config_entry
            .as_ref()
            .is_some_and(|entry| entry.polling_disabled())
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Arm the refresh timer `delay` from now, replacing any pending one
    ///
    /// Does nothing without listeners, after shutdown, or when the config
    /// entry has polling disabled.
    fn schedule_refresh_in(&self, delay: Duration) {
        if self.is_shut_down() || self.listeners.is_empty() || self.polling_disabled() {
            return;
        }

        let now = Instant::now();
        let deadline = now
            .checked_add(delay)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let id = self.next_timer_id.fetch_add(1, Ordering::SeqCst);
        let weak = self.me.clone();

        let mut timer = lock(&self.timer);
        if let Some(previous) = timer.take() {
            previous.task.abort();
        }
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.handle_refresh_interval(id).await;
            }
        });
        *timer = Some(ScheduledRefresh { id, deadline, task });
        debug!(
            coordinator = %self.name,
            delay_secs = delay.as_secs_f64(),
            "Scheduled next refresh"
        );
    }

    fn cancel_scheduled(&self) {
        if let Some(scheduled) = lock(&self.timer).take() {
            scheduled.task.abort();
        }
    }

    async fn handle_refresh_interval(&self, id: u64) {
        {
            let mut timer = lock(&self.timer);
            if timer.as_ref().map(|scheduled| scheduled.id) != Some(id) {
                return;
            }
            // Detach rather than abort: this is the task that is running
            *timer = None;
        }

        if self.polling_disabled() {
            debug!(coordinator = %self.name, "Polling disabled, skipping scheduled refresh");
            return;
        }
        self.try_refresh(Trigger::Scheduled).await;
    }

    fn try_begin(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlightGuard {
                in_flight: &self.in_flight,
                done: &self.refresh_done,
            })
    }

    async fn try_refresh(&self, trigger: Trigger) -> RefreshOutcome {
        match self.try_begin() {
            Some(guard) => self.refresh_locked(guard, trigger).await,
            None => {
                debug!(coordinator = %self.name, ?trigger, "Refresh already in progress");
                RefreshOutcome::Skipped
            }
        }
    }

    /// Start a refresh, or wait for the one in flight to finish
    async fn refresh_or_join(&self, trigger: Trigger) {
        // Registered before the check so a refresh ending in between still wakes us
        let done = self.refresh_done.notified();
        match self.try_begin() {
            Some(guard) => {
                self.refresh_locked(guard, trigger).await;
            }
            None => {
                debug!(coordinator = %self.name, "Joining in-flight refresh");
                done.await;
            }
        }
    }

    async fn refresh_locked(&self, _guard: InFlightGuard<'_>, trigger: Trigger) -> RefreshOutcome {
        if self.is_shut_down() {
            return RefreshOutcome::Discarded;
        }

        self.cancel_scheduled();
        {
            let mut state = write(&self.state);
            if state.phase != CoordinatorPhase::Unloaded {
                state.phase = CoordinatorPhase::Refreshing;
            }
        }

        let started = Instant::now();
        let result = self.run_source().await;

        if self.is_shut_down() {
            debug!(coordinator = %self.name, "Discarding refresh result after shutdown");
            return RefreshOutcome::Discarded;
        }

        debug!(
            coordinator = %self.name,
            "Finished fetching {} data in {:.3} seconds (success: {})",
            self.name,
            started.elapsed().as_secs_f64(),
            result.is_ok()
        );
        RefreshOutcome::Committed(self.settle(result, trigger))
    }

    async fn run_source(&self) -> UpdateResult<T> {
        let attempt = async {
            if !self.setup_done.load(Ordering::SeqCst) {
                self.source.setup().await?;
                self.setup_done.store(true, Ordering::SeqCst);
            }
            self.source.fetch().await
        };

        match self.fetch_timeout {
            Some(timeout) => tokio::time::timeout(timeout, attempt)
                .await
                .unwrap_or_else(|_| {
                    Err(UpdateError::failed(format!("Timeout fetching {} data", self.name)))
                }),
            None => attempt.await,
        }
    }

    /// Commit a result, then reschedule and notify listeners
    fn settle(&self, result: UpdateResult<T>, trigger: Trigger) -> UpdateResult<()> {
        let outcome = self.commit(result);

        if let Err(err) = &outcome {
            if err.is_auth_failure() && trigger != Trigger::First {
                if let Some(entry) = &self.config_entry {
                    entry.start_reauth(&err.to_string());
                }
            }
        }

        let polling = read(&self.state).update_interval.is_some();
        let delay = match outcome.as_ref().err().and_then(UpdateError::retry_after) {
            Some(retry_after) if polling => Some(retry_after),
            _ => self.current_delay(),
        };
        if let Some(delay) = delay {
            self.schedule_refresh_in(delay);
        }

        self.listeners.notify_all(&self.name);
        outcome
    }

    fn commit(&self, result: UpdateResult<T>) -> UpdateResult<()> {
        let mut state = write(&self.state);
        match result {
            Ok(data) => {
                if !state.last_update_success && state.last_exception.is_some() {
                    info!(coordinator = %self.name, "Fetching {} data recovered", self.name);
                }
                state.data = Some(Arc::new(data));
                state.last_update_success = true;
                state.last_update_success_time = Some(Utc::now());
                state.last_exception = None;
                state.consecutive_failures = 0;
                state.phase = CoordinatorPhase::Idle;
                Ok(())
            }
            Err(err) => {
                if err.is_auth_failure() {
                    warn!(
                        coordinator = %self.name,
                        "Authentication failed while fetching {} data: {}", self.name, err
                    );
                } else {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    if state.consecutive_failures == 1 {
                        warn!(coordinator = %self.name, "Error fetching {} data: {}", self.name, err);
                    } else {
                        debug!(
                            coordinator = %self.name,
                            failures = state.consecutive_failures,
                            "Error fetching {} data: {}", self.name, err
                        );
                    }
                }
                state.last_update_success = false;
                state.last_exception = Some(err.clone());
                state.phase = CoordinatorPhase::Failed;
                Err(err)
            }
        }
    }

    /// Delay until the next poll given the committed state
    ///
    /// `None` when not polling or when the last failure was an auth failure.
    fn current_delay(&self) -> Option<Duration> {
        let state = read(&self.state);
        let interval = state.update_interval?;
        let auth_failed = !state.last_update_success
            && state
                .last_exception
                .as_ref()
                .is_some_and(UpdateError::is_auth_failure);
        if auth_failed {
            return None;
        }
        let mut rng = lock(&self.rng);
        Some(self.backoff.next_delay(state.consecutive_failures, interval, &mut *rng))
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_scheduled();
        self.debouncer.shutdown();
        for task in lock(&self.push_tasks).drain(..) {
            task.abort();
        }
        self.listeners.clear();
        write(&self.state).phase = CoordinatorPhase::Unloaded;
        debug!(coordinator = %self.name, "Coordinator shut down");
    }
}

impl<T: Send + Sync + 'static> ListenerHost for Inner<T> {
    fn remove_listener(&self, id: ListenerId) {
        if self.listeners.remove(id) {
            debug!(coordinator = %self.name, "Last listener removed, stopping polling");
            self.cancel_scheduled();
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(scheduled) = lock(&self.timer).take() {
            scheduled.task.abort();
        }
        for task in lock(&self.push_tasks).drain(..) {
            task.abort();
        }
    }
}

/// Polls one source for many listeners
///
/// Cheap to clone; clones share the same state. Every method that may arm
/// the refresh timer must run inside a Tokio runtime.
pub struct DataUpdateCoordinator<T> {
    pub(crate) inner: Arc<Inner<T>>,
}

impl<T> Clone for DataUpdateCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for DataUpdateCoordinator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataUpdateCoordinator")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> DataUpdateCoordinator<T> {
    /// Create a coordinator for `source`
    ///
    /// With a config entry, the coordinator registers its own shutdown as
    /// an unload hook of that entry and reports auth failures to it.
    pub fn new<S>(
        config: CoordinatorConfig,
        source: S,
        config_entry: Option<Arc<dyn EntryLink>>,
    ) -> Self
    where
        S: UpdateSource<T>,
    {
        let CoordinatorConfig {
            name,
            update_interval,
            request_refresh_cooldown,
            fetch_timeout,
            backoff,
            jitter_seed,
        } = config;

        let rng = match jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let inner = Arc::new_cyclic(|me: &Weak<Inner<T>>| {
            let weak = me.clone();
            let function: DebouncedFunction = Arc::new(move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.refresh_or_join(Trigger::Requested).await;
                    }
                }
                .boxed()
            });

            Inner {
                debouncer: Debouncer::new(name.clone(), request_refresh_cooldown, function),
                name,
                source: Box::new(source),
                config_entry,
                fetch_timeout,
                backoff,
                state: RwLock::new(CoordinatorState {
                    data: None,
                    last_exception: None,
                    last_update_success: false,
                    last_update_success_time: None,
                    consecutive_failures: 0,
                    update_interval,
                    phase: CoordinatorPhase::Uninitialized,
                }),
                listeners: ListenerRegistry::new(),
                in_flight: AtomicBool::new(false),
                refresh_done: Notify::new(),
                shut_down: AtomicBool::new(false),
                setup_done: AtomicBool::new(false),
                timer: Mutex::new(None),
                next_timer_id: AtomicU64::new(1),
                rng: Mutex::new(rng),
                push_tasks: Mutex::new(Vec::new()),
                me: me.clone(),
            }
        });

        if let Some(entry) = &inner.config_entry {
            let weak = Arc::downgrade(&inner);
            entry.on_unload(Box::new(move || {
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.shutdown();
                    }
                }
                .boxed()
            }));
        }

        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The config entry this coordinator belongs to, if any
    pub fn config_entry(&self) -> Option<&Arc<dyn EntryLink>> {
        self.inner.config_entry.as_ref()
    }

    /// Refresh now
    ///
    /// Returns without fetching when a refresh is already in flight. Cancels
    /// any pending debounced request.
    pub async fn refresh(&self) {
        self.inner.debouncer.cancel();
        self.inner.try_refresh(Trigger::Manual).await;
    }

    /// Ask for a refresh, rate limited by the request cooldown
    ///
    /// Joins a refresh that is already in flight. Safe to call concurrently:
    /// concurrent calls collapse into a single fetch.
    pub async fn request_refresh(&self) {
        if self.inner.is_shut_down() {
            return;
        }
        if self.inner.in_flight.load(Ordering::SeqCst) {
            self.inner.refresh_or_join(Trigger::Requested).await;
            return;
        }
        self.inner.debouncer.call().await;
    }

    /// Commit data delivered by a push source
    ///
    /// Resets the failure count and postpones the next poll to one full
    /// interval from now.
    pub fn set_updated_data(&self, data: T) {
        if self.inner.is_shut_down() {
            debug!(coordinator = %self.inner.name, "Ignoring data pushed after shutdown");
            return;
        }
        self.inner.cancel_scheduled();
        self.inner.debouncer.cancel();
        debug!(coordinator = %self.inner.name, "Manually updated {} data", self.inner.name);
        let _ = self.inner.settle(Ok(data), Trigger::Push);
    }

    /// Record an error delivered by a push source
    pub fn set_update_error(&self, err: UpdateError) {
        if self.inner.is_shut_down() {
            return;
        }
        self.inner.cancel_scheduled();
        self.inner.debouncer.cancel();
        let _ = self.inner.settle(Err(err), Trigger::Push);
    }

    /// Change the poll interval and re-arm the timer from now
    pub fn set_update_interval(&self, interval: Option<Duration>) {
        write(&self.inner.state).update_interval = interval;
        debug!(coordinator = %self.inner.name, ?interval, "Update interval changed");
        match self.inner.current_delay() {
            Some(delay) => self.inner.schedule_refresh_in(delay),
            None => self.inner.cancel_scheduled(),
        }
    }

    /// The refresh config entry setup awaits before forwarding platforms
    ///
    /// Runs the source's setup hook and one fetch. Transient failures become
    /// [`SetupError::NotReady`], auth failures [`SetupError::AuthFailed`] and
    /// fatal entry errors [`SetupError::Failed`].
    pub async fn config_entry_first_refresh(&self) -> Result<(), SetupError> {
        let outcome = match self.inner.try_begin() {
            Some(guard) => self.inner.refresh_locked(guard, Trigger::First).await,
            None => {
                let done = self.inner.refresh_done.notified();
                if self.inner.in_flight.load(Ordering::SeqCst) {
                    done.await;
                }
                if self.last_update_success() {
                    RefreshOutcome::Committed(Ok(()))
                } else {
                    match self.last_exception() {
                        Some(err) => RefreshOutcome::Committed(Err(err)),
                        // The joined refresh committed nothing
                        None => RefreshOutcome::Discarded,
                    }
                }
            }
        };

        match outcome {
            RefreshOutcome::Committed(result) => result.map_err(SetupError::from),
            RefreshOutcome::Skipped | RefreshOutcome::Discarded => {
                Err(SetupError::not_ready(if self.inner.is_shut_down() {
                    format!("{} was shut down during setup", self.inner.name)
                } else {
                    format!("{} has no data yet", self.inner.name)
                }))
            }
        }
    }

    /// Stop polling, drop listeners and discard any in-flight result
    ///
    /// Idempotent. An in-flight fetch is left to finish.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Subscribe to refreshes
    ///
    /// The first listener arms the poll timer.
    pub fn add_listener<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(Arc::new(callback), None)
    }

    /// Subscribe with a context the source can read through [`Self::contexts`]
    pub fn add_listener_with_context<F>(&self, callback: F, context: impl Into<String>) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(Arc::new(callback), Some(context.into()))
    }

    fn register(&self, callback: ListenerCallback, context: Option<String>) -> ListenerHandle {
        let (id, first) = self.inner.listeners.add(callback, context);
        if first {
            if let Some(delay) = self.inner.current_delay() {
                self.inner.schedule_refresh_in(delay);
            }
        }
        let host: Weak<dyn ListenerHost> = Arc::downgrade(&self.inner) as Weak<Inner<T>>;
        ListenerHandle::new(id, host)
    }

    /// Unsubscribe; safe to call more than once
    pub fn remove_listener(&self, handle: &ListenerHandle) {
        handle.remove();
    }

    /// Latest successful snapshot
    pub fn data(&self) -> Option<Arc<T>> {
        read(&self.inner.state).data.clone()
    }

    pub fn last_update_success(&self) -> bool {
        read(&self.inner.state).last_update_success
    }

    pub fn last_exception(&self) -> Option<UpdateError> {
        read(&self.inner.state).last_exception.clone()
    }

    pub fn last_update_success_time(&self) -> Option<DateTime<Utc>> {
        read(&self.inner.state).last_update_success_time
    }

    pub fn consecutive_failures(&self) -> u32 {
        read(&self.inner.state).consecutive_failures
    }

    pub fn update_interval(&self) -> Option<Duration> {
        read(&self.inner.state).update_interval
    }

    pub fn phase(&self) -> CoordinatorPhase {
        read(&self.inner.state).phase
    }

    /// When the armed poll timer fires, if one is armed
    pub fn next_refresh_at(&self) -> Option<Instant> {
        lock(&self.inner.timer).as_ref().map(|scheduled| scheduled.deadline)
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Distinct contexts of current listeners
    pub fn contexts(&self) -> Vec<String> {
        self.inner.listeners.contexts()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }
}
