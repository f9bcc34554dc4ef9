//! Config entry lifecycle transitions
//!
//! ```text
//! NotLoaded ─▶ SetupInProgress ─┬▶ Loaded ──────────┐
//!                  ▲            ├▶ SetupRetry ──────┤
//!                  └────────────┼▶ SetupError ──────┤
//!                               └▶ MigrationError   ▼
//!                                         UnloadInProgress ─┬▶ NotLoaded
//!                                                           └▶ FailedUnload
//! ```
//!
//! `MigrationError` and `FailedUnload` are terminal until the process restarts.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::entry::ConfigEntryState;

/// Exponent cap for the setup retry delay (5s * 2^4 = 80s)
const MAX_RETRY_EXPONENT: u32 = 4;

const RETRY_BASE: Duration = Duration::from_secs(5);

/// Jitter added to every setup retry, in microseconds
const RETRY_JITTER_MICROS: std::ops::Range<u64> = 50_000..500_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid state transition from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
    pub reason: &'static str,
}

impl ConfigEntryState {
    /// States reachable from this one
    pub fn successors(self) -> &'static [ConfigEntryState] {
        use ConfigEntryState::*;

        match self {
            NotLoaded => &[SetupInProgress],
            SetupInProgress => &[Loaded, SetupError, SetupRetry, MigrationError],
            Loaded => &[UnloadInProgress],
            SetupError | SetupRetry => &[SetupInProgress, UnloadInProgress],
            UnloadInProgress => &[NotLoaded, FailedUnload],
            MigrationError | FailedUnload => &[],
        }
    }

    pub fn can_transition_to(self, to: ConfigEntryState) -> bool {
        self.successors().contains(&to)
    }

    pub fn try_transition(self, to: ConfigEntryState) -> Result<ConfigEntryState, InvalidTransition> {
        if self.can_transition_to(to) {
            return Ok(to);
        }
        Err(InvalidTransition {
            from: self,
            to,
            reason: rejection_reason(self, to),
        })
    }
}

fn rejection_reason(from: ConfigEntryState, to: ConfigEntryState) -> &'static str {
    use ConfigEntryState::*;

    match (from, to) {
        (MigrationError | FailedUnload, _) => "state is terminal until restart",
        (Loaded, SetupInProgress) => "already loaded, unload first",
        (SetupInProgress, _) => "setup has not finished",
        (UnloadInProgress, _) => "unload has not finished",
        (_, Loaded | SetupError | SetupRetry | MigrationError) => "setup must start first",
        (_, NotLoaded | FailedUnload) => "unload must start first",
        _ => "transition not allowed",
    }
}

/// Delay before the next setup attempt of an entry that was not ready
///
/// `tries` is the number of retries already scheduled: 5s, 10s, 20s, 40s,
/// then 80s from the fifth retry on, each plus 50-500ms of jitter.
pub fn setup_retry_delay<R: Rng + ?Sized>(tries: u32, rng: &mut R) -> Duration {
    let base = RETRY_BASE * 2u32.pow(tries.min(MAX_RETRY_EXPONENT));
    base + Duration::from_micros(rng.gen_range(RETRY_JITTER_MICROS))
}
