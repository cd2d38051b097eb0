//! In-process [`TaskScheduler`] backed by tokio tasks.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::{BoxFuture, FutureExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::capability::{ScheduleError, TaskScheduler};

struct Registered {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Named tokio tasks. A name counts as registered while its task runs.
#[derive(Default)]
pub struct TokioScheduler {
    tasks: Mutex<HashMap<String, Registered>>,
}

impl TokioScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskScheduler for TokioScheduler {
    fn register(
        &self,
        name: &str,
        task: BoxFuture<'static, ()>,
        cancel: CancellationToken,
    ) -> Result<(), ScheduleError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.get(name).is_some_and(|r| !r.handle.is_finished()) {
            return Err(ScheduleError::AlreadyRegistered(name.to_string()));
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| ScheduleError::Rejected {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        debug!("Scheduler: registering {name}");
        let handle = runtime.spawn(task);
        tasks.insert(name.to_string(), Registered { cancel, handle });
        Ok(())
    }

    fn deregister<'a>(&'a self, name: &'a str) -> BoxFuture<'a, bool> {
        async move {
            let entry = self
                .tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(name);
            let Some(entry) = entry else {
                return false;
            };
            entry.cancel.cancel();
            if let Err(e) = entry.handle.await {
                warn!("Scheduler: task {name} ended abnormally: {e}");
            }
            debug!("Scheduler: deregistered {name}");
            true
        }
        .boxed()
    }

    fn is_registered(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .is_some_and(|r| !r.handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn waiting_task(cancel: &CancellationToken) -> BoxFuture<'static, ()> {
        let cancel = cancel.clone();
        async move { cancel.cancelled().await }.boxed()
    }

    #[tokio::test]
    async fn register_and_deregister() {
        let scheduler = TokioScheduler::new();
        let cancel = CancellationToken::new();
        scheduler
            .register("job", waiting_task(&cancel), cancel.clone())
            .unwrap();
        assert!(scheduler.is_registered("job"));

        assert!(scheduler.deregister("job").await);
        assert!(cancel.is_cancelled());
        assert!(!scheduler.is_registered("job"));
        assert!(!scheduler.deregister("job").await);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected_while_running() {
        let scheduler = TokioScheduler::new();
        let cancel = CancellationToken::new();
        scheduler
            .register("job", waiting_task(&cancel), cancel.clone())
            .unwrap();

        let other = CancellationToken::new();
        let err = scheduler
            .register("job", waiting_task(&other), other.clone())
            .unwrap_err();
        assert!(matches!(err, ScheduleError::AlreadyRegistered(_)));
        scheduler.deregister("job").await;
    }

    #[test]
    fn registering_outside_a_runtime_is_rejected() {
        let scheduler = TokioScheduler::new();
        let cancel = CancellationToken::new();
        let err = scheduler
            .register("job", waiting_task(&cancel), cancel)
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Rejected { ref name, .. } if name == "job"));
        assert!(!scheduler.is_registered("job"));
    }

    #[tokio::test]
    async fn finished_task_is_not_registered() {
        let scheduler = TokioScheduler::new();
        scheduler
            .register("oneshot", async {}.boxed(), CancellationToken::new())
            .unwrap();
        for _ in 0..50 {
            if !scheduler.is_registered("oneshot") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!scheduler.is_registered("oneshot"));

        // A finished name can be registered again.
        let cancel = CancellationToken::new();
        scheduler
            .register("oneshot", waiting_task(&cancel), cancel.clone())
            .unwrap();
        assert!(scheduler.deregister("oneshot").await);
    }
}
