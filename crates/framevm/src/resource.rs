//! Execution budgets.
//!
//! An [`ExecutionContext`](crate::ExecutionContext) consults its
//! [`ResourceTracker`] once per dispatched instruction and once before every
//! frame it pushes. [`NoLimitTracker`] only bounds the chain depth;
//! [`LimitedTracker`] enforces a [`ResourceLimits`] configuration.

use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::exception::{ExcType, OperationError, RunError};

/// Chain depth allowed when no explicit limit is configured.
pub const DEFAULT_MAX_DEPTH: usize = 1000;

/// Instructions dispatched between two clock reads of a [`LimitedTracker`].
const DEADLINE_STRIDE: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// More instructions were dispatched than the budget allows.
    InstructionBudget { limit: u64 },
    Deadline { limit: Duration, elapsed: Duration },
    /// Pushing another frame would make the chain deeper than `limit`.
    Depth { limit: usize },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstructionBudget { limit } => write!(f, "instruction budget of {limit} exhausted"),
            Self::Deadline { limit, elapsed } => write!(f, "deadline of {limit:?} passed after {elapsed:?}"),
            Self::Depth { .. } => write!(f, "maximum recursion depth exceeded"),
        }
    }
}

impl std::error::Error for ResourceError {}

impl From<ResourceError> for RunError {
    /// Depth errors are ordinary `RecursionError`s that handlers may catch;
    /// exhausted budgets surface as a `TimeoutError` no handler sees.
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::Depth { .. } => {
                Self::Exc(Box::new(OperationError::new(ExcType::RecursionError, err.to_string())))
            }
            ResourceError::InstructionBudget { .. } | ResourceError::Deadline { .. } => {
                Self::Uncatchable(Box::new(OperationError::new(ExcType::TimeoutError, err.to_string())))
            }
        }
    }
}

/// Budget checks made by an execution context.
pub trait ResourceTracker: fmt::Debug {
    /// Called before each instruction is dispatched.
    fn on_dispatch(&mut self) -> Result<(), ResourceError>;

    /// Called before a frame is pushed onto a chain currently `depth` frames deep.
    fn check_depth(&self, depth: usize) -> Result<(), ResourceError>;

    /// Instructions counted so far, for trackers that count them.
    fn instructions_dispatched(&self) -> Option<u64> {
        None
    }
}

/// Tracker that only enforces [`DEFAULT_MAX_DEPTH`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimitTracker;

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn on_dispatch(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn check_depth(&self, depth: usize) -> Result<(), ResourceError> {
        depth_within(depth, DEFAULT_MAX_DEPTH)
    }
}

fn depth_within(depth: usize, limit: usize) -> Result<(), ResourceError> {
    if depth >= limit {
        Err(ResourceError::Depth { limit })
    } else {
        Ok(())
    }
}

/// Limits enforced by a [`LimitedTracker`]; `None` disables a limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub instructions: Option<u64>,
    /// Wall clock time measured from the tracker's creation.
    pub deadline: Option<Duration>,
    pub max_depth: Option<usize>,
}

impl ResourceLimits {
    /// No instruction budget or deadline, and the default depth limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_depth: Some(DEFAULT_MAX_DEPTH),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn instruction_budget(self, limit: u64) -> Self {
        Self {
            instructions: Some(limit),
            ..self
        }
    }

    #[must_use]
    pub fn deadline(self, limit: Duration) -> Self {
        Self {
            deadline: Some(limit),
            ..self
        }
    }

    #[must_use]
    pub fn max_depth(self, limit: Option<usize>) -> Self {
        Self {
            max_depth: limit,
            ..self
        }
    }
}

/// Tracker enforcing [`ResourceLimits`].
///
/// The deadline clock starts when the tracker is created and is read every
/// few hundred instructions, so a run may overshoot it slightly.
#[derive(Debug)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    started: Instant,
    dispatched: u64,
}

impl LimitedTracker {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            started: Instant::now(),
            dispatched: 0,
        }
    }

    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn check_deadline(&self) -> Result<(), ResourceError> {
        let Some(limit) = self.limits.deadline else {
            return Ok(());
        };
        let elapsed = self.started.elapsed();
        if elapsed > limit {
            Err(ResourceError::Deadline { limit, elapsed })
        } else {
            Ok(())
        }
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_dispatch(&mut self) -> Result<(), ResourceError> {
        self.dispatched += 1;
        if let Some(limit) = self.limits.instructions
            && self.dispatched > limit
        {
            return Err(ResourceError::InstructionBudget { limit });
        }
        if self.dispatched % DEADLINE_STRIDE == 1 {
            self.check_deadline()?;
        }
        Ok(())
    }

    fn check_depth(&self, depth: usize) -> Result<(), ResourceError> {
        self.limits.max_depth.map_or(Ok(()), |limit| depth_within(depth, limit))
    }

    fn instructions_dispatched(&self) -> Option<u64> {
        Some(self.dispatched)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn budget_allows_exactly_the_limit() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().instruction_budget(3));
        for _ in 0..3 {
            tracker.on_dispatch().unwrap();
        }
        assert_eq!(
            tracker.on_dispatch(),
            Err(ResourceError::InstructionBudget { limit: 3 })
        );
        assert_eq!(tracker.instructions_dispatched(), Some(4));
    }

    #[test]
    fn expired_deadline_is_seen_on_first_dispatch() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().deadline(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(1));
        assert!(matches!(tracker.on_dispatch(), Err(ResourceError::Deadline { .. })));
    }

    #[test]
    fn depth_limit_counts_frames_before_the_push() {
        let tracker = LimitedTracker::new(ResourceLimits::new().max_depth(Some(2)));
        assert_eq!(tracker.check_depth(1), Ok(()));
        assert_eq!(tracker.check_depth(2), Err(ResourceError::Depth { limit: 2 }));
        assert_eq!(NoLimitTracker.check_depth(DEFAULT_MAX_DEPTH - 1), Ok(()));
    }

    #[test]
    fn only_depth_errors_are_catchable() {
        assert!(matches!(
            RunError::from(ResourceError::Depth { limit: 1 }),
            RunError::Exc(err) if err.exc_type() == ExcType::RecursionError
        ));
        assert!(matches!(
            RunError::from(ResourceError::InstructionBudget { limit: 1 }),
            RunError::Uncatchable(err) if err.exc_type() == ExcType::TimeoutError
        ));
    }
}
