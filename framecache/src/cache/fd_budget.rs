//! File descriptor budget for disk-backed entries.
//!
//! Every mapped disk entry keeps its backing file open for as long as it is
//! mapped, so a large disk cache can exhaust the process's descriptor table.
//! At startup the soft `RLIMIT_NOFILE` is raised to the hard limit and the
//! cache budget is capped at 90% of whatever limit results. Idle entries are
//! unmapped by the tables when the budget runs out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Share of the descriptor limit the caches may use.
pub const DEFAULT_FD_BUDGET_PERCENT: u64 = 90;

/// Floor applied to the computed budget on hosts with tiny limits.
pub const MIN_FD_BUDGET: u64 = 64;

/// Fallback FD limit if detection fails.
const FALLBACK_FD_LIMIT: u64 = 1024;

/// File descriptor budget controller.
///
/// Tracks descriptors held by mapped entries and refuses new mappings once
/// the budget is spent.
#[derive(Debug)]
pub struct FdBudget {
    /// Maximum descriptors this budget allows.
    budget: u64,
    /// Descriptors currently reserved.
    current: AtomicU64,
    /// Process descriptor limit the budget was derived from.
    system_limit: u64,
}

impl FdBudget {
    /// Create a budget from the process limit.
    ///
    /// Raises the soft descriptor limit to the hard limit, then keeps
    /// [`DEFAULT_FD_BUDGET_PERCENT`] of the result. `max_open_files`, when
    /// set, lowers the budget further.
    pub fn for_cache(max_open_files: Option<u64>) -> Self {
        let system_limit = raise_fd_soft_limit();
        let mut budget = (system_limit * DEFAULT_FD_BUDGET_PERCENT / 100).max(MIN_FD_BUDGET);
        if let Some(cap) = max_open_files {
            budget = budget.min(cap.max(1));
        }

        tracing::info!(
            system_limit = system_limit,
            budget = budget,
            configured_cap = ?max_open_files,
            "Cache open file budget initialized"
        );

        Self {
            budget,
            current: AtomicU64::new(0),
            system_limit,
        }
    }

    /// Create a budget with an explicit descriptor count.
    pub fn with_budget(budget: u64) -> Self {
        Self {
            budget,
            current: AtomicU64::new(0),
            system_limit: budget,
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Get the process descriptor limit the budget was derived from.
    pub fn system_limit(&self) -> u64 {
        self.system_limit
    }

    /// Descriptors currently reserved by mapped entries.
    pub fn current_usage(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.current_usage())
    }

    /// Check if the budget has capacity for `count` more descriptors.
    pub fn has_capacity(&self, count: u64) -> bool {
        self.current_usage() + count <= self.budget
    }

    /// Try to reserve `count` descriptors.
    ///
    /// Concurrent callers never push usage past the budget.
    pub fn try_acquire(&self, count: u64) -> bool {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(count).filter(|&next| next <= self.budget)
            })
            .is_ok()
    }

    /// Return `count` descriptors to the budget.
    pub fn release(&self, count: u64) {
        // The closure never returns None, so the update always succeeds.
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(count))
            });
    }
}

/// Budget shared by every table of a service.
pub type SharedFdBudget = Arc<FdBudget>;

/// Raise the soft descriptor limit to the hard limit.
///
/// Returns the soft limit in effect afterwards, or a fallback when the limit
/// cannot be read.
#[cfg(unix)]
#[allow(clippy::unnecessary_cast)] // rlim_t width varies by platform
pub fn raise_fd_soft_limit() -> u64 {
    use std::mem::MaybeUninit;

    let mut rlim = MaybeUninit::<libc::rlimit>::uninit();

    // SAFETY: getrlimit writes a full rlimit into the pointer on success
    let result = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlim.as_mut_ptr()) };
    if result != 0 {
        tracing::warn!(
            error = %std::io::Error::last_os_error(),
            fallback = FALLBACK_FD_LIMIT,
            "Could not read open file limit, using fallback"
        );
        return FALLBACK_FD_LIMIT;
    }

    // SAFETY: getrlimit succeeded, rlim is initialized
    let mut rlim = unsafe { rlim.assume_init() };
    if rlim.rlim_max == libc::RLIM_INFINITY || rlim.rlim_cur >= rlim.rlim_max {
        return clamp_limit(rlim.rlim_cur as u64);
    }

    let previous = rlim.rlim_cur;
    rlim.rlim_cur = rlim.rlim_max;

    // SAFETY: rlim is a valid, initialized rlimit
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } == 0 {
        tracing::debug!(
            previous = previous as u64,
            raised = rlim.rlim_cur as u64,
            "Raised open file soft limit"
        );
        clamp_limit(rlim.rlim_cur as u64)
    } else {
        tracing::warn!(
            error = %std::io::Error::last_os_error(),
            soft = previous as u64,
            hard = rlim.rlim_max as u64,
            "Could not raise open file soft limit"
        );
        clamp_limit(previous as u64)
    }
}

#[cfg(not(unix))]
pub fn raise_fd_soft_limit() -> u64 {
    FALLBACK_FD_LIMIT
}

/// RLIM_INFINITY and absurdly large limits are clamped to something a budget
/// percentage can be taken from without overflow.
#[cfg(unix)]
fn clamp_limit(limit: u64) -> u64 {
    limit.min(u64::from(u32::MAX))
}

/// Descriptors held on behalf of one mapping, returned on drop.
#[derive(Debug)]
pub struct FdReservation {
    budget: SharedFdBudget,
    count: u64,
}

impl FdReservation {
    /// Reserve `count` descriptors, or `None` when the budget is spent.
    pub fn try_new(budget: SharedFdBudget, count: u64) -> Option<Self> {
        if budget.try_acquire(count) {
            Some(Self { budget, count })
        } else {
            None
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Drop for FdReservation {
    fn drop(&mut self) {
        self.budget.release(self.count);
    }
}
