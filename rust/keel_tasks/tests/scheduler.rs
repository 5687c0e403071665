use keel::alloc::OS_ALLOCATOR;
use keel::future::{Future, FutureError, FutureStatus};
use keel_tasks::{chain, TaskScheduler, CRITICAL_PRIORITY, NORMAL_PRIORITY};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

fn scheduler(workers: Option<usize>) -> TaskScheduler {
    INIT.call_once(pretty_env_logger::init);
    TaskScheduler::with_workers(OS_ALLOCATOR, Instant::now(), workers).unwrap()
}

/// Ticks until `done` returns true, failing the test on timeout.
fn tick_until(scheduler: &mut TaskScheduler, timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for the scheduler");
        scheduler.tick(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn fn_task_completes() {
    let mut scheduler = scheduler(Some(2));
    let future = scheduler.spawn(|| 42, NORMAL_PRIORITY, Default::default()).unwrap();

    assert_eq!(scheduler.pending_count(), 1);
    tick_until(&mut scheduler, Duration::from_secs(5), || future.is_done());

    assert_eq!(future.copy(), Ok(42));
    assert_eq!(scheduler.pending_count(), 0);
}

#[test]
fn tick_drains_ready_tasks_from_the_pending_queue() {
    let mut scheduler = scheduler(Some(2));

    let a = scheduler.spawn(|| "hello", NORMAL_PRIORITY, Default::default()).unwrap();
    let b = scheduler.spawn(|| "world", NORMAL_PRIORITY, Default::default()).unwrap();
    let c = scheduler
        .spawn_chain(chain![|| 2, |x: i32| x + 1], NORMAL_PRIORITY, Default::default())
        .unwrap();

    assert_eq!(scheduler.pending_count(), 3);
    scheduler.tick(Duration::from_millis(1));
    assert_eq!(scheduler.pending_count(), 0);

    tick_until(&mut scheduler, Duration::from_secs(5), || {
        a.is_done() && b.is_done() && c.is_done()
    });
    assert_eq!(c.copy(), Ok(3));
}

#[test]
fn chain_canceled_between_phases_skips_later_phases() {
    let mut scheduler = scheduler(Some(2));

    let second_ran = Arc::new(AtomicBool::new(false));
    let third_ran = Arc::new(AtomicBool::new(false));
    let second_flag = second_ran.clone();
    let third_flag = third_ran.clone();

    let chain = chain![
        || {
            std::thread::sleep(Duration::from_millis(150));
            1
        },
        move |x: i32| {
            second_flag.store(true, Ordering::SeqCst);
            x + 2
        },
        move |x: i32| {
            third_flag.store(true, Ordering::SeqCst);
            x * 10
        }
    ];

    let future = scheduler.spawn_chain(chain, NORMAL_PRIORITY, Default::default()).unwrap();

    scheduler.tick(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(30));
    future.request_cancel();

    tick_until(&mut scheduler, Duration::from_secs(5), || future.is_done());

    assert_eq!(future.fetch_status(), FutureStatus::Canceled);
    assert_eq!(future.copy(), Err(FutureError::Canceled));
    assert!(!second_ran.load(Ordering::SeqCst));
    assert!(!third_ran.load(Ordering::SeqCst));
}

#[test]
fn await_all_runs_once_every_input_is_done() {
    let mut scheduler = scheduler(Some(2));

    let a = scheduler.spawn(|| 3, NORMAL_PRIORITY, Default::default()).unwrap();
    let b = scheduler.spawn(|| 7, NORMAL_PRIORITY, Default::default()).unwrap();

    let sum = scheduler
        .await_all(
            |(a, b): (Future<i32>, Future<i32>)| a.copy().unwrap_or(0) + b.copy().unwrap_or(0),
            NORMAL_PRIORITY,
            Default::default(),
            (a, b),
        )
        .unwrap();

    tick_until(&mut scheduler, Duration::from_secs(5), || sum.is_done());
    assert_eq!(sum.copy(), Ok(10));
}

#[test]
fn await_any_runs_once_one_input_is_done() {
    let mut scheduler = scheduler(Some(2));

    let slow = scheduler
        .spawn_delayed(|| "slow", NORMAL_PRIORITY, Default::default(), Duration::from_secs(3600))
        .unwrap();
    let quick = scheduler.spawn(|| "quick", NORMAL_PRIORITY, Default::default()).unwrap();

    let first = scheduler
        .await_any(
            |(slow, quick): (Future<&str>, Future<&str>)| {
                quick.copy().or_else(|_| slow.copy()).unwrap_or("none")
            },
            NORMAL_PRIORITY,
            Default::default(),
            (slow, quick),
        )
        .unwrap();

    tick_until(&mut scheduler, Duration::from_secs(5), || first.is_done());
    assert_eq!(first.copy(), Ok("quick"));
    // the slow task never became ready
    assert_eq!(scheduler.pending_count(), 1);
}

#[test]
fn delayed_task_stays_pending_until_its_time() {
    let mut scheduler = scheduler(Some(2));
    let submitted = Instant::now();

    let future = scheduler
        .spawn_delayed(|| "done", NORMAL_PRIORITY, Default::default(), Duration::from_millis(200))
        .unwrap();

    scheduler.tick(Duration::from_millis(1));
    assert_eq!(scheduler.pending_count(), 1);
    assert!(!future.is_done());

    std::thread::sleep(Duration::from_millis(50));
    scheduler.tick(Duration::from_millis(1));
    if Instant::now() - submitted < Duration::from_millis(200) {
        assert_eq!(scheduler.pending_count(), 1);
        assert_eq!(future.copy(), Err(FutureError::Pending));
    }

    std::thread::sleep(Duration::from_millis(200));
    tick_until(&mut scheduler, Duration::from_secs(5), || future.is_done());
    assert_eq!(future.copy(), Ok("done"));
}

#[test]
fn critical_tasks_are_admitted_promptly_and_nothing_starves() {
    let mut scheduler = scheduler(Some(4));
    let completion_counter = Arc::new(AtomicUsize::new(0));

    let mut normals = Vec::new();
    for _ in 0..20 {
        let counter = completion_counter.clone();
        let future = scheduler
            .spawn(
                move || {
                    std::thread::sleep(Duration::from_millis(20));
                    counter.fetch_add(1, Ordering::SeqCst)
                },
                NORMAL_PRIORITY,
                Default::default(),
            )
            .unwrap();
        normals.push(future);
    }

    let counter = completion_counter.clone();
    let critical = scheduler
        .spawn(
            move || counter.fetch_add(1, Ordering::SeqCst),
            CRITICAL_PRIORITY,
            Default::default(),
        )
        .unwrap();

    tick_until(&mut scheduler, Duration::from_secs(30), || {
        critical.is_done() && normals.iter().all(Future::is_done)
    });

    // the critical task was selected ahead of the equally-starved normal
    // tasks, so it finished within the first couple of batches
    let critical_position = critical.copy().unwrap();
    assert!(
        critical_position < 8,
        "critical task completed {critical_position} tasks late"
    );

    // and no normal task starved
    assert_eq!(completion_counter.load(Ordering::SeqCst), 21);
}

#[test]
fn scheduler_wide_cancel_drains_everything() {
    let mut scheduler = scheduler(Some(2));

    let mut futures = Vec::new();
    for _ in 0..10 {
        let mut chain = keel_tasks::Chain::new(|| {
            std::thread::sleep(Duration::from_millis(5));
            0u32
        });
        for _ in 0..49 {
            chain = chain.then(|x| {
                std::thread::sleep(Duration::from_millis(5));
                x + 1
            });
        }
        futures.push(scheduler.spawn_chain(chain, NORMAL_PRIORITY, Default::default()).unwrap());
    }

    scheduler.tick(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(20));

    scheduler.request_cancel();
    let shutdown = scheduler.shutdown_future();
    tick_until(&mut scheduler, Duration::from_secs(30), || {
        futures.iter().all(Future::is_done) && shutdown.is_done()
    });

    for future in &futures {
        assert_eq!(future.fetch_status(), FutureStatus::Canceled);
        assert_eq!(future.copy(), Err(FutureError::Canceled));
    }

    // joins the workers
    drop(scheduler);
    assert!(shutdown.is_done());
}

#[test]
fn suspended_task_resumes_on_request() {
    let mut scheduler = scheduler(Some(2));

    let mut chain = keel_tasks::Chain::new(|| {
        std::thread::sleep(Duration::from_millis(30));
        0u32
    });
    for _ in 0..9 {
        chain = chain.then(|x| {
            std::thread::sleep(Duration::from_millis(30));
            x + 1
        });
    }

    let future = scheduler.spawn_chain(chain, NORMAL_PRIORITY, Default::default()).unwrap();

    scheduler.tick(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(10));
    future.request_suspend();

    tick_until(&mut scheduler, Duration::from_secs(5), || {
        future.fetch_status() == FutureStatus::Suspended
    });
    assert!(!future.is_done());

    future.request_resume();
    tick_until(&mut scheduler, Duration::from_secs(10), || future.is_done());
    assert_eq!(future.copy(), Ok(9));
}

#[test]
fn cancel_before_first_run_skips_execution() {
    let mut scheduler = scheduler(Some(2));
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();

    let future = scheduler
        .spawn(
            move || flag.store(true, Ordering::SeqCst),
            NORMAL_PRIORITY,
            Default::default(),
        )
        .unwrap();
    future.request_cancel();

    tick_until(&mut scheduler, Duration::from_secs(5), || future.is_done());
    assert_eq!(future.fetch_status(), FutureStatus::Canceled);
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn never_ready_task_stays_pending_without_consuming_a_slot() {
    let mut scheduler = scheduler(Some(1));

    let parked = scheduler
        .spawn_delayed(|| (), NORMAL_PRIORITY, Default::default(), Duration::from_secs(3600))
        .unwrap();

    for _ in 0..10 {
        scheduler.tick(Duration::from_millis(1));
        assert_eq!(scheduler.pending_count(), 1);
        assert_eq!(scheduler.active_count(), 0);
    }
    assert!(!parked.is_done());

    // the slot stays free for other work
    let quick = scheduler.spawn(|| 1, NORMAL_PRIORITY, Default::default()).unwrap();
    tick_until(&mut scheduler, Duration::from_secs(5), || quick.is_done());
    assert_eq!(scheduler.pending_count(), 1);
}

#[test]
fn zero_worker_scheduler_still_promotes_ready_tasks() {
    let mut scheduler = scheduler(Some(0));

    let future = scheduler.spawn(|| 5, NORMAL_PRIORITY, Default::default()).unwrap();
    scheduler.tick(Duration::from_millis(1));

    // promoted out of the pending queue even though nothing can execute it
    assert_eq!(scheduler.pending_count(), 0);
    assert_eq!(scheduler.active_count(), 1);
    assert!(!future.is_done());

    scheduler.tick(Duration::from_millis(1));
    assert_eq!(scheduler.active_count(), 1);
}

#[test]
fn an_exhausted_allocator_surfaces_at_construction() {
    assert!(matches!(
        TaskScheduler::new(keel::alloc::NOOP_ALLOCATOR, Instant::now()),
        Err(keel::alloc::AllocError::OutOfMemory)
    ));
}

#[test]
fn trace_info_rides_along_with_the_task() {
    let mut scheduler = scheduler(Some(1));
    let trace = keel_tasks::TaskTraceInfo {
        content: keel::rc::make_static("texture atlas"),
        purpose: keel::rc::make_static("decode"),
    };

    let future = scheduler.spawn(|| 1, NORMAL_PRIORITY, trace).unwrap();
    tick_until(&mut scheduler, Duration::from_secs(5), || future.is_done());
    assert_eq!(future.copy(), Ok(1));
}

#[test]
fn task_ids_are_monotone() {
    let mut scheduler = scheduler(Some(1));
    let futures: Vec<_> = (0..4)
        .map(|i| scheduler.spawn(move || i, NORMAL_PRIORITY, Default::default()).unwrap())
        .collect();

    tick_until(&mut scheduler, Duration::from_secs(5), || {
        futures.iter().all(Future::is_done)
    });

    for (i, future) in futures.iter().enumerate() {
        assert_eq!(future.copy(), Ok(i));
    }
}
