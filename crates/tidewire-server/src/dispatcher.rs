//! Request dispatch: direct (one task per request) or a fixed worker pool.
//!
//! In pool mode every request from a given connection lands on the same
//! worker, so a connection's requests are handled one at a time in arrival
//! order. Worker queues are bounded; when one is full, [`Dispatcher::dispatch`]
//! waits, which in turn stalls the offending connection's inbound task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use tidewire_core::ServerConfig;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::connection::ConnId;
use crate::errors::DispatchError;
use crate::metrics::{HANDLER_DURATION_SECONDS, HANDLER_PANICS_TOTAL, HANDLER_TIMEOUTS_TOTAL, UNKNOWN_MSG_TOTAL};
use crate::request::Request;
use crate::router::Router;

/// Dispatch tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Number of workers; `0` spawns a task per request instead.
    pub worker_pool_size: usize,
    /// Capacity of each worker's queue.
    pub max_worker_task_len: usize,
    /// Per-request handler deadline. `None` lets handlers run forever.
    pub handler_timeout: Option<Duration>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            worker_pool_size: 0,
            max_worker_task_len: 1024,
            handler_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl From<&ServerConfig> for DispatchOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            worker_pool_size: config.worker_pool_size,
            max_worker_task_len: config.max_worker_task_len,
            handler_timeout: config.handler_timeout(),
        }
    }
}

/// Routes requests to handlers.
pub struct Dispatcher {
    router: Arc<Router>,
    handler_timeout: Option<Duration>,
    pool_size: usize,
    /// One sender per worker; emptied on shutdown.
    queues: RwLock<Vec<mpsc::Sender<Request>>>,
}

impl Dispatcher {
    /// Build a dispatcher and, in pool mode, spawn its workers. Pool mode
    /// must be constructed inside a Tokio runtime.
    pub fn new(router: Router, options: DispatchOptions) -> Arc<Self> {
        let router = Arc::new(router);
        let mut queues = Vec::with_capacity(options.worker_pool_size);
        for index in 0..options.worker_pool_size {
            let (tx, rx) = mpsc::channel(options.max_worker_task_len.max(1));
            let _ = tokio::spawn(run_worker(
                index,
                Arc::clone(&router),
                options.handler_timeout,
                rx,
            ));
            queues.push(tx);
        }
        debug!(workers = options.worker_pool_size, "dispatcher ready");
        Arc::new(Self {
            router,
            handler_timeout: options.handler_timeout,
            pool_size: options.worker_pool_size,
            queues: RwLock::new(queues),
        })
    }

    /// The route table.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Number of workers, `0` in direct mode.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Whether requests go through the worker pool.
    pub fn is_pooled(&self) -> bool {
        self.pool_size > 0
    }

    /// Hand a request off for handling.
    ///
    /// Direct mode spawns a task and returns immediately. Pool mode waits
    /// for room in the selected worker's queue.
    pub async fn dispatch(&self, request: Request) -> Result<(), DispatchError> {
        if !self.is_pooled() {
            let router = Arc::clone(&self.router);
            let timeout = self.handler_timeout;
            let _ = tokio::spawn(async move { invoke(&router, timeout, request).await });
            return Ok(());
        }

        let index = worker_index(request.conn().id(), self.pool_size);
        let queue = self.queues.read().get(index).cloned();
        let Some(queue) = queue else {
            return Err(DispatchError::PoolClosed);
        };
        queue
            .send(request)
            .await
            .map_err(|_| DispatchError::PoolClosed)
    }

    /// Handle a request on the caller's task, bypassing the pool.
    pub async fn handle(&self, request: Request) {
        invoke(&self.router, self.handler_timeout, request).await;
    }

    /// Close the worker queues. Workers finish what is already queued, then
    /// exit; later dispatches fail with [`DispatchError::PoolClosed`].
    pub fn shutdown(&self) {
        let closed = std::mem::take(&mut *self.queues.write());
        if !closed.is_empty() {
            debug!(workers = closed.len(), "closing worker queues");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool_size", &self.pool_size)
            .field("handler_timeout", &self.handler_timeout)
            .finish_non_exhaustive()
    }
}

/// Worker a connection is pinned to. Spreads sequential ids across workers.
pub fn worker_index(conn_id: ConnId, pool_size: usize) -> usize {
    if pool_size == 0 {
        return 0;
    }
    let mixed = conn_id.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
    // Truncation is fine: the result is reduced modulo pool_size.
    #[allow(clippy::cast_possible_truncation)]
    let mixed = mixed as usize;
    mixed % pool_size
}

async fn run_worker(
    index: usize,
    router: Arc<Router>,
    timeout: Option<Duration>,
    mut rx: mpsc::Receiver<Request>,
) {
    debug!(worker = index, "worker started");
    while let Some(request) = rx.recv().await {
        invoke(&router, timeout, request).await;
    }
    debug!(worker = index, "worker stopped");
}

/// Run the handler for `request`, containing panics and enforcing the
/// deadline. Unknown ids are logged and dropped.
async fn invoke(router: &Router, timeout: Option<Duration>, request: Request) {
    let msg_id = request.msg_id();
    let conn_id = request.conn().id();

    let Some(handler) = router.handler(msg_id) else {
        counter!(UNKNOWN_MSG_TOTAL).increment(1);
        warn!(conn_id, msg_id, "no handler registered for msg id");
        return;
    };

    let start = Instant::now();
    let call = AssertUnwindSafe(handler.handle(request)).catch_unwind();
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, call).await.ok(),
        None => Some(call.await),
    };
    histogram!(HANDLER_DURATION_SECONDS).record(start.elapsed().as_secs_f64());

    match outcome {
        Some(Ok(())) => {}
        Some(Err(_panic)) => {
            counter!(HANDLER_PANICS_TOTAL).increment(1);
            error!(conn_id, msg_id, "handler panicked");
        }
        None => {
            counter!(HANDLER_TIMEOUTS_TOTAL).increment(1);
            error!(conn_id, msg_id, ?timeout, "handler timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::handler_fn;
    use crate::test_utils::test_connection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tidewire_core::Message;
    use tokio::sync::{Notify, Semaphore};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn request(conn_id: ConnId, msg_id: u32, payload: &[u8]) -> Request {
        let (conn, _peer) = test_connection(conn_id);
        Request::new(conn, Message::new(msg_id, payload.to_vec()))
    }

    fn pooled(router: Router, workers: usize, queue: usize) -> Arc<Dispatcher> {
        Dispatcher::new(
            router,
            DispatchOptions {
                worker_pool_size: workers,
                max_worker_task_len: queue,
                handler_timeout: None,
            },
        )
    }

    #[test]
    fn worker_index_is_stable_and_in_range() {
        for id in 0..1000u64 {
            let i = worker_index(id, 7);
            assert!(i < 7);
            assert_eq!(i, worker_index(id, 7));
        }
        assert_eq!(worker_index(5, 1), 0);
        assert_eq!(worker_index(5, 0), 0);
    }

    #[test]
    fn worker_index_spreads_sequential_ids() {
        let mut seen = [0usize; 4];
        for id in 1..=400u64 {
            seen[worker_index(id, 4)] += 1;
        }
        assert!(seen.iter().all(|&n| n > 0), "distribution: {seen:?}");
    }

    #[test]
    fn options_from_config() {
        let config = ServerConfig {
            worker_pool_size: 3,
            max_worker_task_len: 9,
            handler_timeout_secs: 0,
            ..ServerConfig::default()
        };
        let opts = DispatchOptions::from(&config);
        assert_eq!(opts.worker_pool_size, 3);
        assert_eq!(opts.max_worker_task_len, 9);
        assert_eq!(opts.handler_timeout, None);
    }

    #[tokio::test]
    async fn direct_mode_runs_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut router = Router::new();
        let _ = router.add_route(
            1,
            handler_fn(move |req: Request| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(req.data().clone());
                }
            }),
        );
        let dispatcher = Dispatcher::new(router, DispatchOptions::default());
        assert!(!dispatcher.is_pooled());
        dispatcher.dispatch(request(1, 1, b"direct")).await.unwrap();
        let got = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.as_ref(), b"direct");
    }

    #[tokio::test]
    async fn unknown_msg_id_is_dropped() {
        let dispatcher = Dispatcher::new(Router::new(), DispatchOptions::default());
        dispatcher.handle(request(1, 99, b"")).await;
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new();
        let _ = router.add_route(1, handler_fn(|_| async { panic!("boom") }));
        let _ = router.add_route(
            2,
            handler_fn({
                let calls = Arc::clone(&calls);
                move |_| {
                    let calls = Arc::clone(&calls);
                    async move {
                        let _ = calls.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }),
        );
        let dispatcher = pooled(router, 1, 8);
        let conn_req = request(1, 1, b"");
        let conn = Arc::clone(conn_req.conn());
        dispatcher.dispatch(conn_req).await.unwrap();
        dispatcher
            .dispatch(Request::new(conn, Message::new(2, Vec::new())))
            .await
            .unwrap();

        tokio::time::timeout(TIMEOUT, async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker died after panic");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new();
        let _ = router.add_route(
            1,
            handler_fn({
                let finished = Arc::clone(&finished);
                move |_| {
                    let finished = Arc::clone(&finished);
                    async move {
                        tokio::time::sleep(Duration::from_secs(120)).await;
                        let _ = finished.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }),
        );
        let dispatcher = Dispatcher::new(
            router,
            DispatchOptions {
                handler_timeout: Some(Duration::from_secs(1)),
                ..DispatchOptions::default()
            },
        );
        dispatcher.handle(request(1, 1, b"")).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pool_preserves_per_connection_order() {
        let (tx, mut rx) = mpsc::unbounded_channel::<(ConnId, u32)>();
        let mut router = Router::new();
        let _ = router.add_route(
            1,
            handler_fn(move |req: Request| {
                let tx = tx.clone();
                async move {
                    // Yield so an unordered implementation would interleave.
                    tokio::task::yield_now().await;
                    let seq = u32::from_le_bytes(req.data()[..4].try_into().unwrap());
                    let _ = tx.send((req.conn().id(), seq));
                }
            }),
        );
        let dispatcher = pooled(router, 3, 64);

        let conns: Vec<_> = (1..=4u64).map(|id| test_connection(id).0).collect();
        for seq in 0..50u32 {
            for conn in &conns {
                let req = Request::new(Arc::clone(conn), Message::new(1, seq.to_le_bytes().to_vec()));
                dispatcher.dispatch(req).await.unwrap();
            }
        }

        let mut last = std::collections::HashMap::new();
        for _ in 0..200 {
            let (conn_id, seq) = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
            if let Some(prev) = last.insert(conn_id, seq) {
                assert!(seq > prev, "conn {conn_id}: {seq} after {prev}");
            }
        }
    }

    #[tokio::test]
    async fn full_worker_queue_blocks_dispatch() {
        let gate = Arc::new(Semaphore::new(0));
        let entered = Arc::new(Notify::new());
        let mut router = Router::new();
        let _ = router.add_route(
            1,
            handler_fn({
                let gate = Arc::clone(&gate);
                let entered = Arc::clone(&entered);
                move |_| {
                    let gate = Arc::clone(&gate);
                    let entered = Arc::clone(&entered);
                    async move {
                        entered.notify_one();
                        let _permit = gate.acquire().await;
                    }
                }
            }),
        );
        let dispatcher = pooled(router, 1, 1);
        let conn = test_connection(1).0;
        let req = || Request::new(Arc::clone(&conn), Message::new(1, Vec::new()));

        // First is picked up by the worker and parks in the handler.
        dispatcher.dispatch(req()).await.unwrap();
        tokio::time::timeout(TIMEOUT, entered.notified()).await.unwrap();
        // Second fills the queue.
        dispatcher.dispatch(req()).await.unwrap();
        // Third has nowhere to go.
        let third = {
            let dispatcher = Arc::clone(&dispatcher);
            let r = req();
            tokio::spawn(async move { dispatcher.dispatch(r).await })
        };
        tokio::task::yield_now().await;
        assert!(!third.is_finished());

        gate.add_permits(10);
        tokio::time::timeout(TIMEOUT, third).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_fails() {
        let dispatcher = pooled(Router::new(), 2, 4);
        dispatcher.shutdown();
        assert_eq!(
            dispatcher.dispatch(request(1, 1, b"")).await,
            Err(DispatchError::PoolClosed)
        );
    }
}
