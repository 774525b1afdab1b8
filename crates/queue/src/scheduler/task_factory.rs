//! Non-blocking admission into the scheduler

use std::future::Future;

use super::task_scheduler::{SchedulerError, TaskHandle, TaskScheduler};
use super::work_group::WorkGroup;

/// Result of an admission attempt
#[derive(Debug)]
pub enum Admission<T, E, F> {
    /// The task was counted and spawned
    Admitted(TaskHandle<T, E>),

    /// No room; the work is handed back so the caller decides how to wait
    Rejected(F),
}

/// Submits work to a [`TaskScheduler`] without ever blocking
#[derive(Clone)]
pub struct TaskFactory {
    scheduler: TaskScheduler,
}

impl TaskFactory {
    pub fn new(scheduler: TaskScheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Admit `work` if its scope has room
    ///
    /// Errors only when the scheduler is not running; lack of capacity is
    /// [`Admission::Rejected`].
    pub fn try_start_new<F, Fut, T, E>(
        &self,
        work: F,
        group: Option<&WorkGroup>,
    ) -> Result<Admission<T, E, F>, SchedulerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        match self.scheduler.reserve(group)? {
            Some(guard) => Ok(Admission::Admitted(
                self.scheduler.spawn_reserved(guard, work),
            )),
            None => Ok(Admission::Rejected(work)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{SchedulerConfig, TaskOutcome};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_rejection_returns_work() {
        let scheduler = TaskScheduler::new(SchedulerConfig::new(1)).unwrap();
        scheduler.start().unwrap();
        let factory = TaskFactory::new(scheduler.clone());
        let (tx, rx) = oneshot::channel::<()>();

        let first = factory
            .try_start_new(
                move || async move {
                    let _ = rx.await;
                    Ok::<_, ()>("first")
                },
                None,
            )
            .unwrap();
        let Admission::Admitted(first) = first else {
            panic!("first task should be admitted");
        };

        let second = factory
            .try_start_new(|| async { Ok::<_, ()>("second") }, None)
            .unwrap();
        let Admission::Rejected(work) = second else {
            panic!("second task should be rejected");
        };

        tx.send(()).unwrap();
        assert!(matches!(first.join().await, TaskOutcome::Completed("first")));

        // The returned work can be resubmitted once there is room
        let Admission::Admitted(retried) = factory.try_start_new(work, None).unwrap() else {
            panic!("resubmission should be admitted");
        };
        assert!(matches!(retried.join().await, TaskOutcome::Completed("second")));
    }

    #[tokio::test]
    async fn test_not_started_is_an_error() {
        let scheduler = TaskScheduler::new(SchedulerConfig::new(1)).unwrap();
        let factory = TaskFactory::new(scheduler);

        let result = factory.try_start_new(|| async { Ok::<_, ()>(()) }, None);
        assert!(matches!(result, Err(SchedulerError::NotStarted)));
    }
}
