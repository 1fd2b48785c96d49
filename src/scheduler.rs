//! Background task scheduler
//!
//! A FIFO of pending jobs plus a map of named running tasks, drained by a
//! watcher loop. Used for ad-hoc work outside the feed lifecycle.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct TaskScheduler {
    pending: Mutex<VecDeque<(String, Job)>>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
    idle: Duration,
}

impl TaskScheduler {
    /// `idle` is how long the watcher sleeps when nothing is pending
    pub fn new(idle: Duration) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            running: Mutex::new(HashMap::new()),
            idle,
        }
    }

    /// Queue a job to be launched by the watcher
    pub fn schedule<F>(&self, name: impl Into<String>, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, "Task scheduled");
        self.lock_pending().push_back((name, Box::pin(job)));
    }

    /// Queue a job that starts after `delay`
    pub fn schedule_after<F>(&self, name: impl Into<String>, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule(name, async move {
            sleep(delay).await;
            job.await;
        });
    }

    /// Drop a pending job or abort a running one
    pub fn cancel(&self, name: &str) -> bool {
        let mut pending = self.lock_pending();
        let before = pending.len();
        pending.retain(|(pending_name, _)| pending_name != name);
        let dropped = pending.len() != before;
        drop(pending);

        let aborted = match self.lock_running().remove(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        };

        if dropped || aborted {
            info!(task = %name, "Task cancelled");
        }
        dropped || aborted
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock_running()
            .get(name)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn running_len(&self) -> usize {
        self.reap();
        self.lock_running().len()
    }

    /// Watcher loop: launch pending jobs in order until termination
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Task scheduler started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.reap();
            if self.launch_next() {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.idle) => {}
            }
        }
        self.shutdown();
    }

    /// Abort everything and drop pending jobs
    pub fn shutdown(&self) {
        let dropped = {
            let mut pending = self.lock_pending();
            let dropped = pending.len();
            pending.clear();
            dropped
        };
        let running: Vec<_> = self.lock_running().drain().collect();
        for (_, handle) in &running {
            handle.abort();
        }
        if dropped > 0 || !running.is_empty() {
            info!(dropped, aborted = running.len(), "Task scheduler shut down");
        }
    }

    fn launch_next(&self) -> bool {
        let Some((name, job)) = self.lock_pending().pop_front() else {
            return false;
        };

        debug!(task = %name, "Launching task");
        let handle = tokio::spawn(job);
        if let Some(previous) = self.lock_running().insert(name.clone(), handle) {
            warn!(task = %name, "Replacing a running task with the same name");
            previous.abort();
        }
        true
    }

    fn reap(&self) {
        self.lock_running().retain(|_, handle| !handle.is_finished());
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<(String, Job)>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
