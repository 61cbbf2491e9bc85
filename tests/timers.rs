//! `run_after`/`run_every`/`cancel` semantics on a live loop.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reactor_net::EventLoopThread;

fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn run_after_fires_once_not_before_the_delay() {
    init_logging();

    let thread = EventLoopThread::new("timer-once");
    let loop_ = thread.start_loop();

    let (tx, rx) = mpsc::channel();
    let fired_at = std::time::Instant::now();
    loop_.run_after(Duration::from_millis(50), move || {
        tx.send(()).unwrap();
    });

    rx.recv_timeout(Duration::from_secs(2))
        .expect("the one-shot timer to fire");
    assert!(fired_at.elapsed() >= Duration::from_millis(40));
}

#[test]
fn run_every_fires_repeatedly_until_cancelled() {
    init_logging();

    let thread = EventLoopThread::new("timer-repeat");
    let loop_ = thread.start_loop();

    let count = Arc::new(Mutex::new(0u32));
    let count_for_timer = count.clone();
    let id = loop_.run_every(Duration::from_millis(20), move || {
        *count_for_timer.lock().unwrap() += 1;
    });

    std::thread::sleep(Duration::from_millis(110));
    loop_.cancel(id);
    let observed_at_cancel = *count.lock().unwrap();
    assert!(observed_at_cancel >= 3, "expected several ticks, got {observed_at_cancel}");

    std::thread::sleep(Duration::from_millis(100));
    let observed_after_cancel = *count.lock().unwrap();
    assert_eq!(
        observed_after_cancel, observed_at_cancel,
        "cancelled timer must not fire again"
    );
}

#[test]
fn cancel_in_the_same_tick_as_expiry_suppresses_the_rearm() {
    init_logging();

    let thread = EventLoopThread::new("timer-cancel-same-tick");
    let loop_ = thread.start_loop();

    let count = Arc::new(Mutex::new(0u32));
    let loop_for_timer = loop_.clone();
    let count_for_timer = count.clone();
    // A repeating timer that cancels itself the first time it fires: the
    // cancellation races with `TimerQueue::reset`'s re-insertion within the
    // same `handle_read`, and must win.
    let id_cell: Arc<Mutex<Option<reactor_net::TimerId>>> = Arc::new(Mutex::new(None));
    let id_cell_for_timer = id_cell.clone();
    let id = loop_.run_every(Duration::from_millis(20), move || {
        *count_for_timer.lock().unwrap() += 1;
        if let Some(id) = *id_cell_for_timer.lock().unwrap() {
            loop_for_timer.cancel(id);
        }
    });
    *id_cell.lock().unwrap() = Some(id);

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(*count.lock().unwrap(), 1);
}
