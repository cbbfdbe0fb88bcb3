//! Queue behaviour against the in-process log
//!
//! Covers delivery exclusivity, fan-out fairness, ack/reclaim/eviction
//! bookkeeping, request/reply correlation and the enqueue gate.

use scanq::{
    EntryId, GroupStart, HandlerError, MemoryLog, PendingQuery, Priority, QueueDefinition,
    QueueLimit, QueueState, RequestReply, RequestReplyConfig, StreamLog, StreamQueue, TaskMessage,
    WorkerPool,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ScanJob {
    n: usize,
    image: String,
}

fn job(n: usize) -> ScanJob {
    ScanJob {
        n,
        image: format!("registry.local/app:{}", n),
    }
}

async fn queue_with(definition: QueueDefinition, count: usize) -> StreamQueue<ScanJob> {
    let queue = StreamQueue::in_memory(definition);
    queue.declare(GroupStart::Beginning).await.unwrap();
    for n in 0..count {
        queue.publish(Priority::Low, &job(n)).await.unwrap();
    }
    queue
}

async fn seeded(count: usize) -> StreamQueue<ScanJob> {
    queue_with(QueueDefinition::new("scans", "scanners"), count).await
}

async fn fail_all(_task: TaskMessage<ScanJob>) -> Result<(), HandlerError> {
    Err("scanner crashed".into())
}

async fn succeed(_task: TaskMessage<ScanJob>) -> Result<(), HandlerError> {
    Ok(())
}

/// Deliver everything once to `consumer` with a failing handler
async fn make_stale(queue: &StreamQueue<ScanJob>, consumer: &str) {
    let result = queue
        .subscribe("scanners", consumer, Duration::from_millis(20), &fail_all)
        .await;
    assert!(result.unwrap_err().is_timeout());
}

async fn deliveries(queue: &StreamQueue<ScanJob>) -> HashMap<EntryId, u64> {
    queue
        .log()
        .pending(queue.stream(), "scanners", &PendingQuery::new(usize::MAX))
        .await
        .unwrap()
        .into_iter()
        .map(|p| (p.id, p.deliveries))
        .collect()
}

// Scenario 1
#[tokio::test]
async fn test_publish_thousand_then_state() {
    let queue = queue_with(
        "queue://scans:scanners/?maxlen=10000".parse().unwrap(),
        1000,
    )
    .await;

    assert_eq!(
        queue.get_state("scanners").await.unwrap(),
        QueueState {
            total: 1000,
            queued: 1000,
            stale: 0
        }
    );
}

// Scenario 2
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_four_consumers_with_every_fifth_failing() {
    let queue = seeded(1000).await;
    let failures = Arc::new(AtomicUsize::new(0));
    let handler = {
        let failures = Arc::clone(&failures);
        Arc::new(move |task: TaskMessage<ScanJob>| {
            let fail = task.payload.n % 5 == 4;
            if fail {
                failures.fetch_add(1, Ordering::SeqCst);
            }
            async move {
                if fail {
                    Err::<(), HandlerError>("simulated scan error".into())
                } else {
                    Ok(())
                }
            }
        })
    };

    let workers: Vec<_> = (1..=4)
        .map(|n| {
            let queue = queue.clone();
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                queue
                    .subscribe(
                        "scanners",
                        &format!("worker-{}", n),
                        Duration::from_millis(100),
                        handler.as_ref(),
                    )
                    .await
            })
        })
        .collect();
    for worker in futures::future::join_all(workers).await {
        assert!(worker.unwrap().unwrap_err().is_timeout());
    }

    let state = queue.get_state("scanners").await.unwrap();
    assert_eq!(failures.load(Ordering::SeqCst), 200);
    assert_eq!(state.stale, 200);
    assert_eq!(state.queued, 0);
    assert_eq!(state.total, 1000);
}

// Scenario 3
#[tokio::test]
async fn test_reclaim_five_stale_entries() {
    let queue = seeded(8).await;
    make_stale(&queue, "worker-dead").await;
    let before = deliveries(&queue).await;
    assert_eq!(queue.get_state("scanners").await.unwrap().stale, 8);

    let seen = Mutex::new(Vec::new());
    let record = |task: TaskMessage<ScanJob>| {
        seen.lock().unwrap().push((task.id, task.retry_count));
        async { Ok::<(), HandlerError>(()) }
    };
    let claimed = queue
        .reclaim_stale("scanners", "workerA", 5, Duration::ZERO, &record)
        .await
        .unwrap();
    assert_eq!(claimed, 5);
    assert_eq!(queue.get_state("scanners").await.unwrap().stale, 3);

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.len(), 5);
    for (id, retry_count) in seen {
        assert_eq!(retry_count, before[&id] + 1);
    }
}

// Scenario 4
#[tokio::test]
async fn test_reclaim_until_exhausted_then_remove() {
    let queue = queue_with(
        QueueDefinition::new("scans", "scanners").with_max_retry(3),
        1,
    )
    .await;
    make_stale(&queue, "worker-dead").await;

    let mut rounds = 0;
    while deliveries(&queue).await.values().all(|d| *d < 3) {
        queue
            .reclaim_stale("scanners", "workerA", 5, Duration::ZERO, &fail_all)
            .await
            .unwrap();
        rounds += 1;
    }
    assert_eq!(rounds, 2);

    let total_before = queue.get_state("scanners").await.unwrap().total;
    let removed = queue
        .remove_stale("scanners", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let state = queue.get_state("scanners").await.unwrap();
    assert_eq!(state.total, total_before - 1);
    assert_eq!(state.stale, 0);
}

// Scenario 5 and P7
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_pool_answers_each_request_once() {
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Lookup {
        nonce: u64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct LookupResult {
        nonce: u64,
        server: String,
    }

    let log = Arc::new(MemoryLog::new());
    let client: RequestReply<Lookup, LookupResult> = RequestReply::new(
        StreamQueue::new(
            Arc::clone(&log),
            QueueDefinition::new("lookup-req", "rpc"),
            scanq::FlatCodec,
        ),
        StreamQueue::new(log, QueueDefinition::new("lookup-resp", "rpc"), scanq::FlatCodec),
        RequestReplyConfig::default().with_block(Duration::from_millis(20)),
    );
    client.declare().await.unwrap();

    let processed: Arc<Mutex<HashMap<u64, usize>>> = Arc::default();
    let token = CancellationToken::new();
    let servers: Vec<_> = (1..=3)
        .map(|n| {
            let server = client.with_consumer(format!("server-{}", n));
            let processed = Arc::clone(&processed);
            let token = token.clone();
            tokio::spawn(async move {
                let name = server.config().consumer.clone();
                let handler = move |request: Lookup| {
                    *processed.lock().unwrap().entry(request.nonce).or_default() += 1;
                    let reply = LookupResult {
                        nonce: request.nonce,
                        server: name.clone(),
                    };
                    async move { Ok::<LookupResult, HandlerError>(reply) }
                };
                server.serve_until(&handler, &token).await
            })
        })
        .collect();

    let calls: Vec<_> = (0..5u64)
        .map(|nonce| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request_reply_timeout(&Lookup { nonce }, Duration::from_secs(5))
                    .await
            })
        })
        .collect();

    let mut replies = HashSet::new();
    for (nonce, call) in futures::future::join_all(calls).await.into_iter().enumerate() {
        let reply = call.unwrap().unwrap();
        assert_eq!(reply.nonce, nonce as u64);
        assert!(reply.server.starts_with("server-"));
        replies.insert(reply.nonce);
    }
    assert_eq!(replies.len(), 5);

    token.cancel();
    for server in futures::future::join_all(servers).await {
        server.unwrap().unwrap();
    }

    let processed = processed.lock().unwrap();
    assert_eq!(processed.len(), 5);
    assert!(processed.values().all(|count| *count == 1));
    assert_eq!(
        client.requests().get_state("rpc").await.unwrap().stale,
        0,
        "every served request is acknowledged"
    );
}

// Scenario 6
#[tokio::test]
async fn test_queue_limit_rejects_sixth() {
    let queue = seeded(0).await;
    let rejected = Arc::new(Mutex::new(Vec::new()));
    let limit = {
        let rejected = Arc::clone(&rejected);
        QueueLimit::new(5).on_reject(move |item: &ScanJob| rejected.lock().unwrap().push(item.clone()))
    };

    let mut admitted = 0;
    for n in 0..6 {
        if queue
            .publish_gated(&limit, Priority::Low, &job(n))
            .await
            .unwrap()
            .is_some()
        {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 5);
    assert_eq!(*rejected.lock().unwrap(), vec![job(5)]);
    assert_eq!(queue.log().len("scans").await.unwrap(), 5);
    assert_eq!(queue.metrics().snapshot().rejected_total, 1);
}

// P1
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_entry_is_never_in_flight_twice() {
    let queue = seeded(300).await;
    let in_flight: Arc<Mutex<HashSet<EntryId>>> = Arc::default();
    let handled: Arc<Mutex<HashMap<EntryId, usize>>> = Arc::default();
    let overlaps = Arc::new(AtomicUsize::new(0));

    let handler = {
        let (in_flight, handled, overlaps) = (
            Arc::clone(&in_flight),
            Arc::clone(&handled),
            Arc::clone(&overlaps),
        );
        Arc::new(move |task: TaskMessage<ScanJob>| {
            let (in_flight, handled, overlaps) = (
                Arc::clone(&in_flight),
                Arc::clone(&handled),
                Arc::clone(&overlaps),
            );
            async move {
                if !in_flight.lock().unwrap().insert(task.id) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::task::yield_now().await;
                in_flight.lock().unwrap().remove(&task.id);
                *handled.lock().unwrap().entry(task.id).or_default() += 1;
                Ok::<(), HandlerError>(())
            }
        })
    };

    let pool = WorkerPool::spawn(
        &queue,
        "scanners",
        "worker",
        6,
        Duration::from_millis(20),
        handler,
    );
    assert_eq!(pool.len(), 6);

    let deadline = Instant::now() + Duration::from_secs(10);
    while handled.lock().unwrap().len() < 300 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for (_, result) in pool.shutdown().await {
        result.unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    let handled = handled.lock().unwrap();
    assert_eq!(handled.len(), 300);
    assert!(handled.values().all(|count| *count == 1));
    assert_eq!(queue.get_state("scanners").await.unwrap().stale, 0);
}

// P2
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fan_out_finishes_close_together() {
    const COSTS_MS: [u64; 4] = [2, 4, 6, 8];
    let queue = seeded(200).await;
    let started = Instant::now();

    let workers: Vec<_> = COSTS_MS
        .iter()
        .enumerate()
        .map(|(n, cost)| {
            let queue = queue.clone();
            let cost = Duration::from_millis(*cost);
            tokio::spawn(async move {
                let finished = Mutex::new(Duration::ZERO);
                let handler = |_task: TaskMessage<ScanJob>| {
                    let finished = &finished;
                    async move {
                        tokio::time::sleep(cost).await;
                        *finished.lock().unwrap() = started.elapsed();
                        Ok::<(), HandlerError>(())
                    }
                };
                let result = queue
                    .subscribe(
                        "scanners",
                        &format!("worker-{}", n),
                        Duration::from_millis(50),
                        &handler,
                    )
                    .await;
                assert!(result.unwrap_err().is_timeout());
                finished.into_inner().unwrap()
            })
        })
        .collect();

    let finish_times: Vec<Duration> = futures::future::join_all(workers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();
    let first = finish_times.iter().min().copied().unwrap();
    let last = finish_times.iter().max().copied().unwrap();

    // Bounded by a small multiple of the slowest per-entry cost, not by
    // the size of the backlog.
    assert!(
        last - first < Duration::from_millis(8 * 10),
        "finish spread {:?} ({:?})",
        last - first,
        finish_times
    );
    assert_eq!(queue.get_state("scanners").await.unwrap().stale, 0);
    assert_eq!(queue.metrics().snapshot().acked_total, 200);
}

// P3
#[tokio::test]
async fn test_ack_removes_from_pending_and_queued() {
    let queue = seeded(10).await;
    let handler = |task: TaskMessage<ScanJob>| async move {
        if task.payload.n < 4 {
            Ok(())
        } else {
            Err::<(), HandlerError>("later".into())
        }
    };
    let _ = queue
        .subscribe("scanners", "worker-1", Duration::from_millis(20), &handler)
        .await;

    let state = queue.get_state("scanners").await.unwrap();
    assert_eq!(state.queued, 0);
    assert_eq!(state.stale, 6);
    assert_eq!(state.total, 10);

    let still_pending = deliveries(&queue).await;
    assert_eq!(still_pending.len(), 6);
    assert_eq!(queue.metrics().snapshot().acked_total, 4);
}

// P4
#[tokio::test]
async fn test_reclaim_increments_once_and_respects_max_retry() {
    let queue = queue_with(
        QueueDefinition::new("scans", "scanners").with_max_retry(4),
        5,
    )
    .await;
    make_stale(&queue, "worker-dead").await;

    let highest = Mutex::new(0u64);
    let track = |task: TaskMessage<ScanJob>| {
        let mut highest = highest.lock().unwrap();
        *highest = (*highest).max(task.retry_count);
        async { Err::<(), HandlerError>("still broken".into()) }
    };

    for _ in 0..6 {
        let before = deliveries(&queue).await;
        queue
            .reclaim_stale("scanners", "workerA", 10, Duration::ZERO, &track)
            .await
            .unwrap();
        let after = deliveries(&queue).await;
        for (id, count) in &after {
            let previous = before[id];
            if previous < 4 {
                assert_eq!(*count, previous + 1);
            } else {
                assert_eq!(*count, previous);
            }
        }
    }
    assert_eq!(*highest.lock().unwrap(), 4);

    // Not yet idle long enough: nothing moves
    let claimed = queue
        .reclaim_stale("scanners", "workerB", 10, Duration::from_secs(3600), &succeed)
        .await
        .unwrap();
    assert_eq!(claimed, 0);
}

// P5
#[tokio::test]
async fn test_remove_stale_deletes_exactly_the_exhausted() {
    let queue = queue_with(
        QueueDefinition::new("scans", "scanners").with_max_retry(2),
        4,
    )
    .await;
    make_stale(&queue, "worker-dead").await;

    // Push the first two entries to the retry limit
    queue
        .reclaim_stale("scanners", "workerA", 2, Duration::ZERO, &fail_all)
        .await
        .unwrap();
    let exhausted: HashSet<EntryId> = deliveries(&queue)
        .await
        .into_iter()
        .filter(|(_, d)| *d >= 2)
        .map(|(id, _)| id)
        .collect();
    assert_eq!(exhausted.len(), 2);

    let too_fresh = queue
        .remove_stale("scanners", 10, Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(too_fresh, 0);

    let removed = queue
        .remove_stale("scanners", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(removed, 2);
    let remaining: HashSet<EntryId> = deliveries(&queue).await.into_keys().collect();
    assert!(remaining.is_disjoint(&exhausted));
    assert_eq!(remaining.len(), 2);

    let again = queue
        .remove_stale("scanners", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(again, 0);
    assert_eq!(queue.get_state("scanners").await.unwrap().total, 2);
}

#[tokio::test]
async fn test_evicted_entries_land_in_dead_letter_stream() {
    let queue = queue_with(
        QueueDefinition::new("scans", "scanners")
            .with_max_retry(1)
            .with_dead_letter("scans-dead"),
        2,
    )
    .await;
    make_stale(&queue, "worker-dead").await;
    let original = deliveries(&queue).await;

    let removed = queue
        .remove_stale("scanners", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let dead = queue
        .log()
        .read("scans-dead", EntryId::ZERO, 10, None)
        .await
        .unwrap();
    assert_eq!(dead.len(), 2);
    for entry in &dead {
        let source: EntryId = entry.fields["__source_id"].parse().unwrap();
        assert!(original.contains_key(&source));
        assert_eq!(entry.fields["__deliveries"], "1");
        assert!(entry.fields.contains_key("image"));
    }
    assert_eq!(queue.metrics().snapshot().dead_lettered_total, 2);
}

// P6
#[tokio::test]
async fn test_total_only_shrinks_by_eviction_or_trim() {
    let queue = queue_with(
        QueueDefinition::new("scans", "scanners").with_max_retry(2),
        20,
    )
    .await;
    let total = |q: StreamQueue<ScanJob>| async move { q.get_state("scanners").await.unwrap().total };

    let half = |task: TaskMessage<ScanJob>| async move {
        if task.payload.n % 2 == 0 {
            Ok(())
        } else {
            Err::<(), HandlerError>("odd".into())
        }
    };
    let _ = queue
        .subscribe("scanners", "worker-1", Duration::from_millis(20), &half)
        .await;
    assert_eq!(total(queue.clone()).await, 20);

    queue
        .reclaim_stale("scanners", "worker-2", 20, Duration::ZERO, &fail_all)
        .await
        .unwrap();
    assert_eq!(total(queue.clone()).await, 20);

    let evicted = queue
        .remove_stale("scanners", 20, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(evicted, 10);
    assert_eq!(total(queue.clone()).await, 10);

    let trimmed = queue.with_definition(QueueDefinition::new("scans", "scanners").with_max_len(5));
    trimmed.publish(Priority::High, &job(99)).await.unwrap();
    assert_eq!(total(queue.clone()).await, 5);
}

#[tokio::test]
async fn test_restarted_worker_resumes_its_backlog() {
    let queue = seeded(3).await;
    make_stale(&queue, "worker-1").await;

    let seen = Mutex::new(Vec::new());
    let record = |task: TaskMessage<ScanJob>| {
        seen.lock().unwrap().push((task.payload.n, task.retry_count));
        async { Ok::<(), HandlerError>(()) }
    };
    let _ = queue
        .subscribe("scanners", "worker-1", Duration::from_millis(20), &record)
        .await;

    assert_eq!(seen.into_inner().unwrap(), vec![(0, 2), (1, 2), (2, 2)]);
    assert_eq!(queue.get_state("scanners").await.unwrap().stale, 0);
}
