//! End-to-end scenarios exercising the fiber runtime as a whole,
//! rather than one module's internals in isolation.

use std::os::fd::IntoRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use turbo_fiber::{self as fiber, Attr, FiberId, StackKind, Status};

fn wait_a_bit() {
    std::thread::sleep(Duration::from_millis(5));
}

#[test]
fn sleep_cancellation_on_a_normal_stack_fiber_is_interruptible() {
    let elapsed = Arc::new(AtomicUsize::new(0));
    let elapsed_clone = elapsed.clone();
    let start = Instant::now();

    let tid = fiber::start_background(Attr::new(), None, move || {
        let _ = fiber::sleep(Duration::from_millis(100));
        elapsed_clone.store(start.elapsed().as_millis() as usize, Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(10));
    fiber::stop(tid).unwrap();
    fiber::join(tid).unwrap();

    let ms = elapsed.load(Ordering::SeqCst);
    assert!(ms < 50, "expected the stop to cut the 100ms sleep short, got {ms}ms");
}

#[test]
fn sleep_cancellation_on_a_pthread_fiber_cannot_be_interrupted() {
    let elapsed = Arc::new(AtomicUsize::new(0));
    let elapsed_clone = elapsed.clone();
    let start = Instant::now();

    let attr = Attr::new().with_stack_kind(StackKind::Pthread);
    let tid = fiber::start_background(attr, None, move || {
        let _ = fiber::sleep(Duration::from_millis(100));
        elapsed_clone.store(start.elapsed().as_millis() as usize, Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(10));
    fiber::stop(tid).unwrap();
    fiber::join(tid).unwrap();

    let ms = elapsed.load(Ordering::SeqCst);
    assert!(ms >= 85, "a pthread-kind sleep has no yield point to resume from, expected ~100ms, got {ms}ms");
}

#[test]
fn wait_on_unmatched_value_is_immediate_ewouldblock() {
    let event = fiber::event_create(1);
    let result = Arc::new(std::sync::Mutex::new(None));
    let result_clone = result.clone();

    let tid = fiber::start_background(Attr::new(), None, move || {
        *result_clone.lock().unwrap() = Some(fiber::event_wait(event, 2, None));
    });
    fiber::join(tid).unwrap();

    assert_eq!(*result.lock().unwrap(), Some(Err(Status::EWouldBlock)));
    fiber::event_destroy(event).unwrap();
}

#[test]
fn wake_one_fairness_across_ten_waiters() {
    let event = fiber::event_create(1);
    let woken = Arc::new(AtomicUsize::new(0));
    let mut tids = Vec::new();

    for _ in 0..10 {
        let woken_clone = woken.clone();
        tids.push(fiber::start_background(Attr::new(), None, move || {
            if fiber::event_wait(event, 1, None).is_ok() {
                woken_clone.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    // Give every waiter a chance to actually register before waking.
    wait_a_bit();

    for _ in 0..10 {
        assert_eq!(fiber::event_wake_one(event).unwrap(), 1);
    }
    let eleventh = fiber::event_wake_one(event).unwrap();
    assert_eq!(eleventh, 0, "an eleventh wake_one on a drained waiter list must wake no one");

    for tid in tids {
        fiber::join(tid).unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 10);
    fiber::event_destroy(event).unwrap();
}

#[test]
fn wait_timeout_resolves_etimedout_and_leaves_the_event_clean() {
    let event = fiber::event_create(7);
    let result = Arc::new(std::sync::Mutex::new(None));
    let result_clone = result.clone();
    let start = Instant::now();

    let tid = fiber::start_background(Attr::new(), None, move || {
        *result_clone.lock().unwrap() = Some(fiber::event_wait(event, 7, Some(Duration::from_millis(100))));
    });
    fiber::join(tid).unwrap();

    assert_eq!(*result.lock().unwrap(), Some(Err(Status::ETimedOut)));
    assert!(start.elapsed() >= Duration::from_millis(90));

    // Nothing left to wake: the waiter list drained itself on timeout.
    assert_eq!(fiber::event_wake_all(event).unwrap(), 0);
    fiber::event_destroy(event).unwrap();
}

#[test]
fn joining_self_is_rejected_without_deadlock() {
    let result = Arc::new(std::sync::Mutex::new(None));
    let result_clone = result.clone();

    let tid = fiber::start_background(Attr::new(), None, move || {
        let me = fiber::self_id();
        *result_clone.lock().unwrap() = Some(fiber::join(me));
    });
    fiber::join(tid).unwrap();

    assert_eq!(*result.lock().unwrap(), Some(Err(Status::EInval)));
}

#[test]
fn closing_an_fd_wakes_a_parked_fd_wait_and_the_next_wait_gets_ebadf() {
    let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
    // `fd_close` takes real ownership of the descriptor, so hand it off
    // with `into_raw_fd` rather than leaving `a` to close it again on drop.
    let read_fd = a.into_raw_fd();
    let result = Arc::new(std::sync::Mutex::new(None));
    let result_clone = result.clone();
    let start = Instant::now();

    let tid = fiber::start_background(Attr::new(), None, move || {
        *result_clone.lock().unwrap() = Some(fiber::fd_wait(read_fd));
    });

    wait_a_bit();
    fiber::fd_close(read_fd).unwrap();
    fiber::join(tid).unwrap();

    assert_eq!(*result.lock().unwrap(), Some(Ok(())));
    assert!(start.elapsed() < Duration::from_millis(50));

    let second = Arc::new(std::sync::Mutex::new(None));
    let second_clone = second.clone();
    let tid2 = fiber::start_background(Attr::new(), None, move || {
        *second_clone.lock().unwrap() = Some(fiber::fd_wait(read_fd));
    });
    fiber::join(tid2).unwrap();
    assert_eq!(*second.lock().unwrap(), Some(Err(Status::EBadF)));

    drop(b);
}

#[test]
fn interrupt_is_idempotent() {
    let event = fiber::event_create(1);
    let results = Arc::new(std::sync::Mutex::new(Vec::new()));
    let results_clone = results.clone();

    let tid = fiber::start_background(Attr::new(), None, move || {
        results_clone.lock().unwrap().push(fiber::event_wait(event, 1, None));
    });
    wait_a_bit();

    fiber::interrupt(tid).unwrap();
    fiber::interrupt(tid).unwrap();
    fiber::join(tid).unwrap();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0], Err(Status::EIntr));
    fiber::event_destroy(event).unwrap();
}

#[test]
fn setting_the_same_concurrency_twice_leaves_it_unchanged() {
    let n = fiber::get_concurrency();
    let _ = fiber::set_concurrency(n);
    let _ = fiber::set_concurrency(n);
    assert_eq!(fiber::get_concurrency(), n);
}

#[test]
fn a_value_change_survives_value_plus_wake() {
    let handle = fiber::event_create(0);
    let waiters_done = Arc::new(AtomicUsize::new(0));
    let mut tids = Vec::new();

    for _ in 0..4 {
        let waiters_done = waiters_done.clone();
        tids.push(fiber::start_background(Attr::new(), None, move || {
            if fiber::event_wait(handle, 0, Some(Duration::from_secs(1))).is_ok() {
                waiters_done.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    wait_a_bit();

    fiber::event_set_value(handle, 1).unwrap();
    assert_eq!(fiber::event_wake_all(handle).unwrap(), 4);

    for tid in tids {
        fiber::join(tid).unwrap();
    }
    assert_eq!(waiters_done.load(Ordering::SeqCst), 4);
    assert_eq!(fiber::event_get_value(handle).unwrap(), 1);
    fiber::event_destroy(handle).unwrap();
}

#[test]
fn unknown_fiber_id_operations_return_einval() {
    let bogus = FiberId::default();
    assert_eq!(fiber::join(bogus), Err(Status::EInval));
    assert!(!fiber::exists(bogus));
    assert_eq!(fiber::get_attr(bogus), Err(Status::EInval));
}
