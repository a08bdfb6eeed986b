//! Per-connection FIFO ordering of bus-originated sends.
//!
//! Every outbound job is queued under the compiled id of the connection it targets. The first job queued for an id
//! spawns a drainer task which runs that id's jobs one after another, in enqueue order, until the queue is empty.
//! Jobs for different ids run in parallel.
//!
//! The drainer holds the lease of the caller that started it for as long as it runs; callers whose job joins an
//! existing queue give theirs back immediately. A global backlog bound makes `enqueue` wait while the number of
//! queued or running jobs is at the configured limit.

use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{error, trace};

use crate::error::{GatewayError, GatewayResult};

struct Job {
    run: BoxFuture<'static, ()>,
    _backlog: OwnedSemaphorePermit,
}

/// Serializes jobs per key.
///
/// `L` is the lease a drainer keeps while it runs, typically a [`SessionLease`](crate::pool::SessionLease).
pub struct OutboundSequencer<L> {
    lanes: Mutex<HashMap<u64, VecDeque<Job>>>,
    backlog: Arc<Semaphore>,
    limit: usize,
    tasks: TaskTracker,
    _lease: std::marker::PhantomData<fn(L)>,
}

impl<L> OutboundSequencer<L>
where
    L: Send + 'static,
{
    /// Creates a sequencer allowing at most `limit` queued or running jobs. Drainers are spawned on `tasks`.
    pub fn new(limit: usize, tasks: TaskTracker) -> Self {
        OutboundSequencer {
            lanes: Mutex::new(HashMap::new()),
            backlog: Arc::new(Semaphore::new(limit)),
            limit,
            tasks,
            _lease: std::marker::PhantomData,
        }
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<u64, VecDeque<Job>>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of jobs queued or running.
    pub fn backlog(&self) -> usize {
        self.limit - self.backlog.available_permits()
    }

    /// Number of keys with a running drainer.
    pub fn active_lanes(&self) -> usize {
        self.lanes().len()
    }

    /// Queues `job` behind every job previously queued under `key`.
    ///
    /// Waits while the backlog is full. `lease` either moves into a newly spawned drainer or is dropped before this
    /// returns.
    pub async fn enqueue<F>(self: &Arc<Self>, key: u64, lease: L, job: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .backlog
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Shutdown)?;
        let job = Job {
            run: Box::pin(job),
            _backlog: permit,
        };

        let start_drainer = match self.lanes().entry(key) {
            Entry::Occupied(mut lane) => {
                lane.get_mut().push_back(job);
                false
            }
            Entry::Vacant(lane) => {
                lane.insert(VecDeque::from([job]));
                true
            }
        };

        if start_drainer {
            trace!(conn = key, "starting drainer");
            let sequencer = self.clone();
            self.tasks
                .spawn(async move { sequencer.drain(key, lease).await });
        } else {
            trace!(conn = key, "queued behind running drainer");
            drop(lease);
        }
        Ok(())
    }

    async fn drain(self: Arc<Self>, key: u64, lease: L) {
        loop {
            let job = {
                let mut lanes = self.lanes();
                match lanes.get_mut(&key).and_then(VecDeque::pop_front) {
                    Some(job) => job,
                    None => {
                        lanes.remove(&key);
                        break;
                    }
                }
            };
            // A panicking job drops its reply sender, which its caller sees as a closed connection.
            if AssertUnwindSafe(job.run).catch_unwind().await.is_err() {
                error!(conn = key, "outbound job panicked");
            }
        }
        trace!(conn = key, "drainer finished");
        drop(lease);
    }
}

impl<L> fmt::Debug for OutboundSequencer<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundSequencer")
            .field("limit", &self.limit)
            .field("available", &self.backlog.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use tokio::sync::oneshot;

    use super::*;
    use crate::pool::{SessionLease, SessionPool};

    #[tokio::test]
    async fn jobs_for_one_key_run_in_order() {
        let sequencer = Arc::new(OutboundSequencer::<()>::new(16, TaskTracker::new()));
        let order = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel();
        let mut done_tx = Some(done_tx);

        for n in 0..5u64 {
            let order = order.clone();
            let busy = busy.clone();
            let done = if n == 4 { done_tx.take() } else { None };
            sequencer
                .enqueue(1, (), async move {
                    assert!(!busy.swap(true, Ordering::SeqCst), "jobs overlapped");
                    tokio::time::sleep(Duration::from_millis(5 * (5 - n))).await;
                    order.lock().unwrap().push(n);
                    busy.store(false, Ordering::SeqCst);
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                })
                .await
                .unwrap();
        }

        done_rx.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn full_backlog_blocks_enqueue() {
        let sequencer = Arc::new(OutboundSequencer::<()>::new(1, TaskTracker::new()));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        sequencer
            .enqueue(1, (), async move {
                let _ = gate_rx.await;
            })
            .await
            .unwrap();
        assert_eq!(sequencer.backlog(), 1);

        let second = tokio::spawn({
            let sequencer = sequencer.clone();
            async move { sequencer.enqueue(2, (), async {}).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        gate_tx.send(()).unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn drainer_returns_its_lease_when_idle() {
        let pool = SessionPool::new("test", 2, Ok::<usize, _>).unwrap();
        let sequencer = Arc::new(OutboundSequencer::<SessionLease<usize>>::new(4, TaskTracker::new()));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let lease = pool.acquire().await.unwrap();
        sequencer
            .enqueue(7, lease, async move {
                let _ = gate_rx.await;
            })
            .await
            .unwrap();
        let lease = pool.acquire().await.unwrap();
        sequencer
            .enqueue(7, lease, async move {
                let _ = done_tx.send(());
            })
            .await
            .unwrap();

        // The second caller joined a running lane, so only the drainer still holds a session.
        assert_eq!(pool.available(), 1);
        assert_eq!(sequencer.active_lanes(), 1);

        gate_tx.send(()).unwrap();
        done_rx.await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.available() < 2 || sequencer.active_lanes() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sequencer.backlog(), 0);
    }

    #[tokio::test]
    async fn a_panicking_job_does_not_wedge_its_lane() {
        let tasks = TaskTracker::new();
        let sequencer = Arc::new(OutboundSequencer::<()>::new(4, tasks.clone()));
        let (first_tx, first_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();

        sequencer
            .enqueue(3, (), async move {
                let _tx = first_tx;
                panic!("job failed");
            })
            .await
            .unwrap();
        sequencer
            .enqueue(3, (), async move {
                let _ = done_tx.send(());
            })
            .await
            .unwrap();

        assert!(first_rx.await.is_err());
        done_rx.await.unwrap();

        tasks.close();
        tokio::time::timeout(Duration::from_secs(1), tasks.wait())
            .await
            .unwrap();
        assert_eq!(sequencer.active_lanes(), 0);
        assert_eq!(sequencer.backlog(), 0);
    }
}
