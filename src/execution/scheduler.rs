//! Execution scheduler - determines which steps to run next

use crate::core::Pipeline;

/// Strategy for scheduling step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// Execute steps in dependency order, one at a time
    #[default]
    Sequential,

    /// Execute all ready steps in parallel
    Parallel,

    /// Limited parallelism (max N concurrent steps)
    LimitedParallel(usize),
}

/// Scheduler for determining which steps to run
#[derive(Debug, Clone)]
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Get the next batch of steps to start, given what is already running
    pub fn next_steps(&self, pipeline: &Pipeline) -> Vec<String> {
        // Nothing new starts once the run has failed
        if pipeline.has_failed() {
            return vec![];
        }

        match self.strategy {
            SchedulingStrategy::Sequential => self.next_limited_parallel(pipeline, 1),
            SchedulingStrategy::Parallel => self.next_parallel(pipeline),
            SchedulingStrategy::LimitedParallel(max) => {
                self.next_limited_parallel(pipeline, max.max(1))
            }
        }
    }

    fn next_parallel(&self, pipeline: &Pipeline) -> Vec<String> {
        pipeline.ready_steps().iter().map(|s| s.id.clone()).collect()
    }

    fn next_limited_parallel(&self, pipeline: &Pipeline, max: usize) -> Vec<String> {
        let running_count = pipeline.running_steps().len();
        let remaining = max.saturating_sub(running_count);

        if remaining == 0 {
            return vec![];
        }

        pipeline
            .ready_steps()
            .into_iter()
            .take(remaining)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Check if there are more steps to run
    pub fn has_more(&self, pipeline: &Pipeline) -> bool {
        !self.next_steps(pipeline).is_empty()
    }
}
