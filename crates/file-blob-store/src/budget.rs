//! Byte budget of a cache directory
//!
//! Loads report their sizes here. Once enough bytes have arrived since the
//! last check, an eviction pass is started on the blocking pool. Only one
//! pass per controller runs at a time; triggers that arrive meanwhile are
//! folded into a single follow-up pass.

use crate::error::{BlobStoreError, Result};
use crate::eviction::EvictionScanner;
use crate::layout::BlobLayout;
use crate::types::EvictionReport;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub max_bytes: u64,
    /// Bytes loaded between checks
    pub check_threshold: u64,
    /// Size a pass shrinks the directory to
    pub target_size: u64,
}

impl Budget {
    pub fn new(max_bytes: u64, check_percent: u8) -> Result<Self> {
        if check_percent >= 100 {
            return Err(BlobStoreError::InvalidConfig(format!(
                "check_percent must be below 100, got {}",
                check_percent
            )));
        }
        let check_threshold = (max_bytes as u128 * check_percent as u128 / 100) as u64;
        Ok(Self {
            max_bytes,
            check_threshold,
            target_size: max_bytes.saturating_sub(check_threshold),
        })
    }
}

#[derive(Debug, Default)]
struct BudgetState {
    bytes_loaded_since_check: u64,
    in_flight: bool,
    /// A trigger arrived while a pass was running
    recheck: bool,
    passes_run: u64,
    last_report: Option<EvictionReport>,
}

pub struct CacheBudgetController {
    layout: BlobLayout,
    budget: Option<Budget>,
    state: Mutex<BudgetState>,
    idle: watch::Sender<bool>,
    runtime: Option<Handle>,
}

impl CacheBudgetController {
    /// A controller for `layout`'s directory. `None` disables tracking.
    ///
    /// A bounded controller must be created inside a tokio runtime; its
    /// passes run on that runtime's blocking pool.
    pub fn new(layout: BlobLayout, budget: Option<Budget>) -> Result<Self> {
        let runtime = match budget {
            Some(_) => Some(Handle::try_current().map_err(|_| {
                BlobStoreError::InvalidConfig(
                    "a size-limited blob cache needs a tokio runtime".to_string(),
                )
            })?),
            None => None,
        };
        let (idle, _) = watch::channel(true);
        Ok(Self {
            layout,
            budget,
            state: Mutex::new(BudgetState::default()),
            idle,
            runtime,
        })
    }

    pub fn unbounded(layout: BlobLayout) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            layout,
            budget: None,
            state: Mutex::new(BudgetState::default()),
            idle,
            runtime: None,
        }
    }

    pub fn budget(&self) -> Option<Budget> {
        self.budget
    }

    pub fn bytes_loaded_since_check(&self) -> u64 {
        self.lock_state().bytes_loaded_since_check
    }

    pub fn passes_run(&self) -> u64 {
        self.lock_state().passes_run
    }

    pub fn last_report(&self) -> Option<EvictionReport> {
        self.lock_state().last_report.clone()
    }

    pub fn is_evicting(&self) -> bool {
        self.lock_state().in_flight
    }

    /// Count freshly loaded bytes, starting a pass once the threshold is crossed.
    pub fn report(self: &Arc<Self>, bytes: u64) {
        let Some(budget) = self.budget else {
            return;
        };
        let mut state = self.lock_state();
        state.bytes_loaded_since_check = state.bytes_loaded_since_check.saturating_add(bytes);
        if state.bytes_loaded_since_check < budget.check_threshold {
            return;
        }
        self.trigger(state, budget);
    }

    /// Start a pass now, whatever the counter says.
    pub fn check_now(self: &Arc<Self>) {
        if let Some(budget) = self.budget {
            let state = self.lock_state();
            self.trigger(state, budget);
        }
    }

    /// Wait until no pass is running or pending.
    pub async fn wait_quiesced(&self) {
        let mut idle = self.idle.subscribe();
        // The sender lives as long as self, so this cannot fail.
        let _ = idle.wait_for(|idle| *idle).await;
    }

    fn trigger(self: &Arc<Self>, mut state: MutexGuard<'_, BudgetState>, budget: Budget) {
        state.bytes_loaded_since_check = 0;
        if state.in_flight {
            debug!(root = %self.layout.root().display(), "Eviction already running, coalescing");
            state.recheck = true;
            return;
        }
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        state.in_flight = true;
        self.idle.send_replace(false);
        drop(state);

        let controller = Arc::clone(self);
        runtime.spawn_blocking(move || loop {
            let scanner = EvictionScanner::new(controller.layout.clone(), budget.target_size);
            let report = match scanner.run() {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(root = %controller.layout.root().display(), error = %e, "Eviction pass failed");
                    None
                }
            };
            if !controller.pass_completed(report, budget) {
                break;
            }
        });
    }

    /// Record a finished pass and decide whether another one must follow.
    fn pass_completed(&self, report: Option<EvictionReport>, budget: Budget) -> bool {
        let mut state = self.lock_state();
        state.passes_run += 1;

        let grew_back = report.as_ref().is_some_and(|r| {
            r.ran
                && r.removed_files > 0
                && r.final_size.saturating_add(state.bytes_loaded_since_check) > budget.target_size
        });
        state.last_report = report;

        if state.recheck || grew_back {
            debug!(root = %self.layout.root().display(), "Cache still over budget, running another pass");
            state.recheck = false;
            state.bytes_loaded_since_check = 0;
            return true;
        }

        state.in_flight = false;
        self.idle.send_replace(true);
        false
    }

    fn lock_state(&self) -> MutexGuard<'_, BudgetState> {
        // Counters stay consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
