use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use nlq_common::{EngineConfig, JobId, NlqError, NodeId, SubContextId};
use nlq_execution::{JobContextService, JobContextState, ShardSearchContext, SubContext};

struct Tracked {
    closes: Arc<AtomicUsize>,
}

impl SubContext for Tracked {
    fn name(&self) -> &str {
        "tracked"
    }

    fn close(&mut self) -> nlq_common::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn service() -> JobContextService {
    JobContextService::new(NodeId::new("n1"), &EngineConfig::default())
}

#[test]
fn racing_close_and_kill_tear_down_exactly_once() {
    for round in 0..20 {
        let svc = service();
        let ctx = svc.get_or_create(JobId(round)).expect("context");

        let closes = Arc::new(AtomicUsize::new(0));
        for i in 0..8 {
            ctx.add_context(
                SubContextId(i),
                Box::new(Tracked {
                    closes: Arc::clone(&closes),
                }),
            )
            .expect("register");
        }

        let fired = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let fired = Arc::clone(&fired);
            let cancelled = Arc::clone(&cancelled);
            ctx.add_callback(move |err, _| {
                fired.fetch_add(1, Ordering::SeqCst);
                if err.is_some_and(NlqError::is_cancellation) {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                }
            })
            .expect("callback");
        }

        let barrier = Arc::new(Barrier::new(6));
        let winners: Vec<bool> = (0..6)
            .map(|t| {
                let ctx = Arc::clone(&ctx);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    if t % 2 == 0 { ctx.kill() } else { ctx.close() }
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();

        assert_eq!(winners.iter().filter(|w| **w).count(), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 8);
        assert_eq!(fired.load(Ordering::SeqCst), 4);
        let expected_cancelled = match ctx.state() {
            JobContextState::Killed => 4,
            JobContextState::Closed => 0,
            JobContextState::Open => panic!("context still open"),
        };
        assert_eq!(cancelled.load(Ordering::SeqCst), expected_cancelled);
        assert_eq!(svc.active_jobs(), 0);
    }
}

#[test]
fn concurrent_registration_and_kill_never_leak() {
    let svc = service();
    let ctx = svc.get_or_create(JobId(1)).expect("context");
    let closes = Arc::new(AtomicUsize::new(0));
    let accepted = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let ctx = Arc::clone(&ctx);
            let closes = Arc::clone(&closes);
            let accepted = Arc::clone(&accepted);
            thread::spawn(move || {
                for i in 0..50 {
                    let id = SubContextId(w * 100 + i);
                    let tracked = Box::new(Tracked {
                        closes: Arc::clone(&closes),
                    });
                    match ctx.add_context(id, tracked) {
                        Ok(()) => {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(NlqError::ContextClosed { .. }) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(1));
    assert!(svc.kill_job(JobId(1)));
    for w in workers {
        w.join().expect("worker");
    }

    // every offered context was closed: registered ones by teardown, late ones on rejection
    assert_eq!(closes.load(Ordering::SeqCst), 200);
    assert!(accepted.load(Ordering::SeqCst) <= 200);
    assert_eq!(ctx.num_contexts(), 0);
}

#[test]
fn kill_before_registration_fails_fast() {
    let svc = service();
    let ctx = svc.get_or_create(JobId(5)).expect("context");
    assert!(ctx.kill());
    let (search, signal) = ShardSearchContext::new(SubContextId(0), "users", 0);
    let err = ctx.add_context(search.id(), Box::new(search)).expect_err("killed");
    assert!(matches!(err, NlqError::ContextClosed { job_id: JobId(5) }));
    assert!(signal.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_wakes_blocked_scans() {
    let svc = service();
    let ctx = svc.get_or_create(JobId(9)).expect("context");

    let mut scans = Vec::new();
    for shard in 0..3 {
        let (search, mut signal) = ShardSearchContext::new(SubContextId(shard), "users", shard as u32);
        ctx.add_context(search.id(), Box::new(search)).expect("register");
        scans.push(tokio::spawn(async move {
            // stands in for a scan waiting on storage
            tokio::select! {
                _ = signal.cancelled() => "cancelled",
                _ = tokio::time::sleep(Duration::from_secs(30)) => "timed out",
            }
        }));
    }

    let (tx, rx) = tokio::sync::oneshot::channel();
    ctx.add_callback(move |err, _| {
        let _ = tx.send(err.map(|e| e.to_string()));
    })
    .expect("callback");

    assert!(svc.kill_job(JobId(9)));
    for scan in scans {
        assert_eq!(scan.await.expect("join"), "cancelled");
    }
    let message = rx.await.expect("callback fired").expect("cancellation error");
    assert!(message.contains("killed"));
    assert!(svc.get(JobId(9)).is_none());
}
