//! Saga coordinator.
//!
//! A saga is an ordered list of remote steps sharing one state value. When
//! step *i* fails, steps `i-1..=0` are compensated in reverse order, each
//! awaited before the next starts. Compensation failures do not stop the
//! unwind; they are collected on the returned [`SagaFailure`].

use async_trait::async_trait;
use ripple_core::{CompensationFailure, SagaFailure, SyncResult};
use tracing::{debug, info, info_span, warn, Instrument};

/// One step of a saga.
#[async_trait]
pub trait SagaStep<S: Send>: Send + Sync {
    fn name(&self) -> &str;

    /// Perform the step. A failing step cleans up its own partial work;
    /// only completed steps are compensated.
    async fn action(&self, state: &mut S) -> SyncResult<()>;

    /// Undo a completed [`action`](Self::action). Defaults to nothing.
    async fn compensate(&self, _state: &mut S) -> SyncResult<()> {
        Ok(())
    }
}

/// An ordered set of steps.
pub struct Saga<S: Send> {
    name: String,
    steps: Vec<Box<dyn SagaStep<S>>>,
}

impl<S: Send> Saga<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: impl SagaStep<S> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order and return the final state.
    pub async fn run(&self, state: S) -> Result<S, SagaFailure> {
        let span = info_span!("saga", saga = %self.name, steps = self.steps.len());
        self.execute(state).instrument(span).await
    }

    async fn execute(&self, mut state: S) -> Result<S, SagaFailure> {
        for (index, step) in self.steps.iter().enumerate() {
            debug!(step = step.name(), index, "Running saga step");
            let Err(error) = step.action(&mut state).await else {
                continue;
            };

            warn!(step = step.name(), index, error = %error, "Saga step failed; compensating");
            let mut compensation_errors = Vec::new();
            for done in self.steps[..index].iter().rev() {
                match done.compensate(&mut state).await {
                    Ok(()) => debug!(step = done.name(), "Compensated"),
                    Err(error) => {
                        warn!(step = done.name(), error = %error, "Compensation failed");
                        compensation_errors.push(CompensationFailure {
                            step: done.name().to_string(),
                            error,
                        });
                    }
                }
            }

            return Err(SagaFailure {
                saga: self.name.clone(),
                failed_step: step.name().to_string(),
                step_index: index,
                source: Box::new(error),
                compensation_errors,
            });
        }

        info!("Saga completed");
        Ok(state)
    }
}

impl<S: Send> std::fmt::Debug for Saga<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saga")
            .field("name", &self.name)
            .field("steps", &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::RemoteError;

    /// Appends `"{name}"` on action and `"undo {name}"` on compensation.
    struct Record {
        name: &'static str,
        fail: bool,
        fail_compensation: bool,
    }

    impl Record {
        fn ok(name: &'static str) -> Self {
            Self {
                name,
                fail: false,
                fail_compensation: false,
            }
        }

        fn failing(name: &'static str) -> Self {
            Self {
                fail: true,
                ..Self::ok(name)
            }
        }
    }

    #[async_trait]
    impl SagaStep<Vec<String>> for Record {
        fn name(&self) -> &str {
            self.name
        }

        async fn action(&self, log: &mut Vec<String>) -> SyncResult<()> {
            if self.fail {
                return Err(RemoteError::transient(self.name, "boom").into());
            }
            log.push(self.name.to_string());
            Ok(())
        }

        async fn compensate(&self, log: &mut Vec<String>) -> SyncResult<()> {
            tokio::task::yield_now().await;
            log.push(format!("undo {}", self.name));
            if self.fail_compensation {
                return Err(RemoteError::transient(self.name, "undo failed").into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_all_steps_run_in_order() {
        let saga = Saga::new("three")
            .step(Record::ok("one"))
            .step(Record::ok("two"))
            .step(Record::ok("three"));
        let log = saga.run(Vec::new()).await.unwrap();
        assert_eq!(log, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_third_step_failure_compensates_in_reverse() {
        let saga = Saga::new("three")
            .step(Record::ok("one"))
            .step(Record::ok("two"))
            .step(Record::failing("three"));

        let failure = saga.run(Vec::new()).await.unwrap_err();
        assert_eq!(failure.failed_step, "three");
        assert_eq!(failure.step_index, 2);
        assert!(!failure.is_partially_compensated());
        assert_eq!(failure.saga, "three");
    }

    #[tokio::test]
    async fn test_compensation_order_is_observable() {
        // State is moved into the saga, so observe it through a shared log.
        use std::sync::{Arc, Mutex};

        struct Shared {
            name: &'static str,
            fail: bool,
            log: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl SagaStep<()> for Shared {
            fn name(&self) -> &str {
                self.name
            }

            async fn action(&self, _: &mut ()) -> SyncResult<()> {
                if self.fail {
                    return Err(RemoteError::validation(self.name, "rejected").into());
                }
                self.log.lock().unwrap().push(self.name.to_string());
                Ok(())
            }

            async fn compensate(&self, _: &mut ()) -> SyncResult<()> {
                self.log.lock().unwrap().push(format!("undo {}", self.name));
                Ok(())
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let step = |name, fail| Shared {
            name,
            fail,
            log: Arc::clone(&log),
        };
        let saga = Saga::new("ordered")
            .step(step("one", false))
            .step(step("two", false))
            .step(step("three", true));

        assert!(saga.run(()).await.is_err());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["one", "two", "undo two", "undo one"]
        );
    }

    #[tokio::test]
    async fn test_compensation_errors_are_collected() {
        let saga = Saga::new("leaky")
            .step(Record {
                fail_compensation: true,
                ..Record::ok("one")
            })
            .step(Record::ok("two"))
            .step(Record::failing("three"));

        let failure = saga.run(Vec::new()).await.unwrap_err();
        assert!(failure.is_partially_compensated());
        assert_eq!(failure.compensation_errors.len(), 1);
        assert_eq!(failure.compensation_errors[0].step, "one");
        assert!(failure.source.is_retryable());
    }

    #[tokio::test]
    async fn test_first_step_failure_compensates_nothing() {
        let saga = Saga::new("early").step(Record::failing("one")).step(Record::ok("two"));
        let failure = saga.run(Vec::new()).await.unwrap_err();
        assert_eq!(failure.step_index, 0);
        assert!(failure.compensation_errors.is_empty());
    }
}
