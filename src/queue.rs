use crate::types::{SystemError, TaskRecord};
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Boxed unit of background work executed by a pool worker.
pub type Job = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

enum QueueItem {
    Work { task_id: String, job: Job },
    Shutdown,
}

/// Background task queue with a fixed worker pool and status tracking.
///
/// `enqueue` creates a pending [`TaskRecord`] and returns its id immediately;
/// a worker later executes the job and moves the record through
/// `running -> completed|failed`. Exactly one worker executes a given task and
/// failed tasks are never retried.
pub struct TaskQueue {
    tasks: Arc<DashMap<String, TaskRecord>>,
    queue: Arc<Mutex<VecDeque<QueueItem>>>,
    queue_notify: Arc<Notify>,
    running: AtomicBool,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    id_seq: AtomicU64,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            queue_notify: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            worker_handles: Mutex::new(Vec::new()),
            id_seq: AtomicU64::new(0),
        }
    }

    /// Spawn `num_workers` workers draining the shared queue.
    pub async fn start(&self, num_workers: usize) -> Result<(), SystemError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SystemError::Queue {
                message: "Worker pool already running".to_string(),
            });
        }

        info!("Starting {} queue workers", num_workers);
        let mut handles = self.worker_handles.lock().await;
        for worker_id in 0..num_workers {
            handles.push(self.spawn_worker(worker_id));
        }

        Ok(())
    }

    /// Stop all workers after their current unit of work.
    ///
    /// One shutdown sentinel is queued per worker; sentinels may be
    /// interleaved with real work. Waits for every worker to exit.
    pub async fn stop(&self) {
        let mut handles = self.worker_handles.lock().await;
        if handles.is_empty() {
            self.running.store(false, Ordering::Release);
            return;
        }

        info!("Stopping {} queue workers", handles.len());
        {
            let mut queue = self.queue.lock().await;
            for _ in 0..handles.len() {
                queue.push_back(QueueItem::Shutdown);
            }
        }
        self.queue_notify.notify_waiters();

        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                error!("Worker exited abnormally: {}", e);
            }
        }

        self.running.store(false, Ordering::Release);
        info!("All queue workers stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue a job and return its task id without waiting for execution.
    pub async fn enqueue<F>(&self, name: &str, job: F) -> String
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let task_id = self.next_task_id(name);
        self.tasks
            .insert(task_id.clone(), TaskRecord::new(task_id.clone(), name.to_string()));

        {
            let mut queue = self.queue.lock().await;
            queue.push_back(QueueItem::Work {
                task_id: task_id.clone(),
                job: Box::pin(job),
            });
        }
        self.queue_notify.notify_one();

        debug!("Task {} enqueued", task_id);
        task_id
    }

    /// Snapshot of one task record.
    pub fn status(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.get(task_id).map(|entry| entry.clone())
    }

    /// Snapshots of every known task, in no particular order.
    pub fn list_all(&self) -> Vec<TaskRecord> {
        self.tasks.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Remove terminal tasks whose completion is older than `max_age_hours`.
    /// Pending and running tasks are never removed.
    pub fn cleanup(&self, max_age_hours: i64) {
        let now = Utc::now();
        let max_age = chrono::Duration::hours(max_age_hours);
        self.tasks.retain(|_, task| {
            if !task.status.is_terminal() {
                return true;
            }
            match task.completed_at {
                Some(completed_at) => now - completed_at <= max_age,
                None => true,
            }
        });
    }

    fn next_task_id(&self, name: &str) -> String {
        // Timestamp for readability, sequence number for uniqueness under
        // concurrent enqueues of the same job name.
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}_{}", name, Utc::now().format("%Y%m%d_%H%M%S_%f"), seq)
    }

    fn spawn_worker(&self, worker_id: usize) -> JoinHandle<()> {
        let tasks = Arc::clone(&self.tasks);
        let queue = Arc::clone(&self.queue);
        let queue_notify = Arc::clone(&self.queue_notify);

        tokio::spawn(async move {
            debug!("Worker {} started", worker_id);

            loop {
                let item = {
                    let mut queue = queue.lock().await;
                    queue.pop_front()
                };

                match item {
                    Some(QueueItem::Shutdown) => break,
                    Some(QueueItem::Work { task_id, job }) => {
                        Self::execute(worker_id, &tasks, &task_id, job).await;
                    }
                    None => {
                        // Wait for new work; the timeout guards against a
                        // wakeup racing the queue push.
                        tokio::select! {
                            _ = queue_notify.notified() => {}
                            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                        }
                    }
                }
            }

            debug!("Worker {} stopped", worker_id);
        })
    }

    async fn execute(
        worker_id: usize,
        tasks: &DashMap<String, TaskRecord>,
        task_id: &str,
        job: Job,
    ) {
        if let Some(mut entry) = tasks.get_mut(task_id) {
            entry.set_running();
        }
        debug!("Worker {} running task {}", worker_id, task_id);

        // A failing or panicking job must never take the worker down.
        match AssertUnwindSafe(job).catch_unwind().await {
            Ok(Ok(result)) => {
                if let Some(mut entry) = tasks.get_mut(task_id) {
                    entry.set_completed(Some(result));
                }
                debug!("Task {} completed on worker {}", task_id, worker_id);
            }
            Ok(Err(e)) => {
                error!("Task {} failed: {:#}", task_id, e);
                if let Some(mut entry) = tasks.get_mut(task_id) {
                    entry.set_failed(format!("{:#}", e));
                }
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!("Task {} panicked: {}", task_id, message);
                if let Some(mut entry) = tasks.get_mut(task_id) {
                    entry.set_failed(message);
                }
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::time::sleep;

    async fn wait_for_terminal(queue: &TaskQueue, task_id: &str) -> TaskRecord {
        for _ in 0..200 {
            if let Some(task) = queue.status(task_id) {
                if task.status.is_terminal() {
                    return task;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached a terminal state", task_id);
    }

    #[tokio::test]
    async fn test_enqueue_and_complete() {
        let queue = TaskQueue::new();
        queue.start(2).await.unwrap();

        let task_id = queue
            .enqueue("double", async { Ok(json!({"value": 42})) })
            .await;

        let pending = queue.status(&task_id).unwrap();
        assert_eq!(pending.name, "double");

        let task = wait_for_terminal(&queue, &task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
        assert_eq!(task.result, Some(json!({"value": 42})));
        assert!(task.error.is_none());

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_failed_job_does_not_kill_worker() {
        let queue = TaskQueue::new();
        queue.start(1).await.unwrap();

        let failing = queue
            .enqueue("explode", async { anyhow::bail!("database on fire") })
            .await;
        let task = wait_for_terminal(&queue, &failing).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("database on fire"));

        // The single worker must still pick up the next job.
        let ok = queue.enqueue("recover", async { Ok(json!(1)) }).await;
        let task = wait_for_terminal(&queue, &ok).await;
        assert_eq!(task.status, TaskStatus::Completed);

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_job_is_marked_failed() {
        let queue = TaskQueue::new();
        queue.start(1).await.unwrap();

        let task_id = queue
            .enqueue("panic", async { panic!("unexpected state") })
            .await;
        let task = wait_for_terminal(&queue, &task_id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("unexpected state"));

        let ok = queue.enqueue("after_panic", async { Ok(json!(null)) }).await;
        let task = wait_for_terminal(&queue, &ok).await;
        assert_eq!(task.status, TaskStatus::Completed);

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_yields_distinct_ids() {
        let queue = Arc::new(TaskQueue::new());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue.enqueue("same_name", async { Ok(json!(null)) }).await
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 20);
        assert_eq!(queue.list_all().len(), 20);
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let queue = TaskQueue::new();
        queue.start(1).await.unwrap();
        assert!(queue.start(1).await.is_err());
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_work() {
        let queue = TaskQueue::new();
        queue.start(2).await.unwrap();

        let task_id = queue
            .enqueue("slow", async {
                sleep(Duration::from_millis(50)).await;
                Ok(json!("done"))
            })
            .await;

        // Give a worker a chance to dequeue, then stop: the in-flight job
        // must finish before stop returns.
        sleep(Duration::from_millis(10)).await;
        queue.stop().await;

        let task = queue.status(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_terminal_tasks() {
        let queue = TaskQueue::new();
        queue.start(1).await.unwrap();

        let done = queue.enqueue("finished", async { Ok(json!(1)) }).await;
        wait_for_terminal(&queue, &done).await;
        queue.stop().await;

        // Enqueued after stop: stays pending.
        let pending = queue.enqueue("waiting", async { Ok(json!(2)) }).await;

        queue.cleanup(0);

        assert!(queue.status(&done).is_none());
        let survivor = queue.status(&pending).unwrap();
        assert_eq!(survivor.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_status_unknown_task() {
        let queue = TaskQueue::new();
        assert!(queue.status("no_such_task").is_none());
        assert!(queue.list_all().is_empty());
    }
}
