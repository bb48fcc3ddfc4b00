//! Dispatcher pool behavior under wedged handlers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use routeip::dispatch::DispatcherPool;

#[test_log::test]
fn wedged_handlers_do_not_stall_the_queue() {
    let pool = DispatcherPool::new(3, Duration::from_millis(100));
    pool.start();

    let started = Instant::now();
    let fast_done_at = Arc::new(Mutex::new(Vec::<Duration>::new()));
    let slow_done = Arc::new(AtomicUsize::new(0));

    // Two handlers wedge for 500 ms, three more are quick.
    for _ in 0..2 {
        let slow_done = Arc::clone(&slow_done);
        pool.enqueue(Box::new(move || {
            thread::sleep(Duration::from_millis(500));
            slow_done.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for _ in 0..3 {
        let fast_done_at = Arc::clone(&fast_done_at);
        pool.enqueue(Box::new(move || {
            fast_done_at.lock().unwrap().push(started.elapsed());
        }));
    }

    // The fast handlers must complete while both wedged handlers are
    // still sleeping: the watchdog spawned auxiliaries to keep the queue
    // moving.
    while started.elapsed() < Duration::from_millis(450) {
        if fast_done_at.lock().unwrap().len() == 3 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    {
        let fast = fast_done_at.lock().unwrap();
        assert_eq!(fast.len(), 3, "fast handlers did not run alongside wedged ones");
        for elapsed in fast.iter() {
            assert!(
                *elapsed < Duration::from_millis(450),
                "fast handler delayed: {:?}",
                elapsed
            );
        }
    }

    // The pool never exceeded its bound.
    assert_eq!(pool.stats().peak, 3);

    // Quiescence: the wedged handlers finish and the surplus dispatchers
    // exit. The next drain joins them, leaving the main dispatcher alone.
    while slow_done.load(Ordering::SeqCst) < 2 && started.elapsed() < Duration::from_secs(2) {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(slow_done.load(Ordering::SeqCst), 2);
    thread::sleep(Duration::from_millis(250));

    let reaped = Arc::new(AtomicUsize::new(0));
    {
        let reaped = Arc::clone(&reaped);
        pool.enqueue(Box::new(move || {
            reaped.fetch_add(1, Ordering::SeqCst);
        }));
    }
    while reaped.load(Ordering::SeqCst) == 0 && started.elapsed() < Duration::from_secs(3) {
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(50));
    let stats = pool.stats();
    assert_eq!(stats.dispatchers, 1, "auxiliary dispatchers were not reaped");
    assert_eq!(stats.blocked, 0);

    pool.stop();
}

#[test_log::test]
fn dispatcher_cap_holds_under_many_wedges() {
    let pool = DispatcherPool::new(2, Duration::from_millis(50));
    pool.start();

    // More wedged handlers than dispatchers: the cap must hold, and all
    // handlers must eventually run.
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let done = Arc::clone(&done);
        pool.enqueue(Box::new(move || {
            thread::sleep(Duration::from_millis(150));
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let started = Instant::now();
    while done.load(Ordering::SeqCst) < 4 && started.elapsed() < Duration::from_secs(3) {
        assert!(pool.stats().dispatchers <= 2, "dispatcher cap exceeded");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(done.load(Ordering::SeqCst), 4);
    assert!(pool.stats().peak <= 2);

    pool.stop();
}
