//! Tests for background work streaming back to the owning thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use horizon_lattice_bridge::{BackgroundWork, Control, Engine, HostError};
use parking_lot::Mutex;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

#[test]
fn test_thread_work_streams_results() {
    init_logging();
    let engine = Engine::new();
    let owner = thread::current().id();
    let results = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));
    let (sink, done_in) = (results.clone(), done.clone());

    let data = vec![1, 2, 3];
    let task = BackgroundWork::<i32>::new(move |task| {
        for n in data {
            task.yield_value(n * 10)?;
        }
        Ok(())
    })
    .name("stream-worker")
    .on_progress(move |value| sink.lock().push((value, thread::current().id())))
    .on_done(move || done_in.store(true, Ordering::SeqCst))
    .start(engine.handle())
    .unwrap();

    task.wait().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert!(task.is_done());
    let results = results.lock();
    let values: Vec<i32> = results.iter().map(|(value, _)| *value).collect();
    assert_eq!(values, vec![10, 20, 30]);
    assert!(results.iter().all(|(_, thread)| *thread == owner));
}

#[test]
fn test_many_values_arrive_in_order() {
    let engine = Engine::new();
    let count = Arc::new(AtomicUsize::new(0));
    let in_order = Arc::new(AtomicBool::new(true));
    let (count_in, order_in) = (count.clone(), in_order.clone());

    let task = BackgroundWork::<usize>::new(|task| {
        for i in 0..100 {
            task.yield_value(i)?;
        }
        Ok(())
    })
    .on_progress(move |i| {
        if count_in.fetch_add(1, Ordering::SeqCst) != i {
            order_in.store(false, Ordering::SeqCst);
        }
    })
    .start(engine.handle())
    .unwrap();

    task.wait().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 100);
    assert!(in_order.load(Ordering::SeqCst));
}

#[test]
fn test_pause_and_resume() {
    let engine = Engine::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_in = counter.clone();

    let task = BackgroundWork::<usize>::new(|task| {
        for i in 0..20 {
            task.check_pause()?;
            task.yield_value(i)?;
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    })
    .poll_interval(Duration::from_millis(2))
    .on_progress(move |i| counter_in.store(i, Ordering::SeqCst))
    .start(engine.handle())
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    engine
        .run_until(|| counter.load(Ordering::SeqCst) >= 3 || Instant::now() > deadline)
        .unwrap();

    task.pause();
    let paused_at = counter.load(Ordering::SeqCst);
    let settle = Instant::now() + Duration::from_millis(150);
    engine.run_until(|| Instant::now() > settle).unwrap();
    let advance = counter.load(Ordering::SeqCst) - paused_at;
    assert!(advance <= 3, "advanced {advance} while paused");

    task.resume();
    task.wait().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 19);
}

#[test]
fn test_stop_ends_work_cleanly() {
    let failures = Arc::new(AtomicUsize::new(0));
    let seen = failures.clone();
    let engine = Engine::builder()
        .on_background_error(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    let produced = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let (produced_in, done_in) = (produced.clone(), done.clone());

    let task = BackgroundWork::<usize>::new(|task| {
        for i in 0.. {
            task.check_message()?;
            task.yield_value(i)?;
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    })
    .on_progress(move |_| {
        produced_in.fetch_add(1, Ordering::SeqCst);
    })
    .on_done(move || done_in.store(true, Ordering::SeqCst))
    .start(engine.handle())
    .unwrap();

    engine.run_until(|| produced.load(Ordering::SeqCst) >= 3).unwrap();
    task.stop();
    task.wait().unwrap();

    assert!(done.load(Ordering::SeqCst));
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[test]
fn test_messages_flow_both_ways() {
    let engine = Engine::new();
    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = replies.clone();

    let task = BackgroundWork::<(), String>::new(|task| {
        while let Control::Message(message) = task.wait_message()? {
            if message == "bye" {
                break;
            }
            task.send_message(format!("{message}-pong"))?;
        }
        Ok(())
    })
    .on_message(move |reply| sink.lock().push(reply))
    .start(engine.handle())
    .unwrap();

    task.send_message("ping".to_string())
        .send_message("again".to_string())
        .send_message("bye".to_string());
    task.wait().unwrap();
    assert_eq!(*replies.lock(), vec!["ping-pong".to_string(), "again-pong".to_string()]);
}

#[test]
fn test_worker_error_is_reported_and_done_still_runs() {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let seen = reports.clone();
    let engine = Engine::builder()
        .on_background_error(move |err| {
            seen.lock().push(err.to_string());
        })
        .build();
    let done = Arc::new(AtomicBool::new(false));
    let done_in = done.clone();

    let task = BackgroundWork::<()>::new(|_task| Err(HostError::runtime("Intentional test error")))
        .on_done(move || done_in.store(true, Ordering::SeqCst))
        .start(engine.handle())
        .unwrap();

    task.wait().unwrap();
    assert!(done.load(Ordering::SeqCst));
    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("Intentional test error"), "{reports:?}");
}

#[test]
fn test_panicking_worker_is_reported() {
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let seen = kinds.clone();
    let engine = Engine::builder()
        .on_background_error(move |err| {
            seen.lock().push(err.kind().unwrap_or_default().to_string());
        })
        .build();

    let task = BackgroundWork::<()>::new(|_task| panic!("worker gave up"))
        .start(engine.handle())
        .unwrap();

    task.wait().unwrap();
    assert_eq!(*kinds.lock(), vec![HostError::PANIC.to_string()]);
}

#[test]
fn test_wait_from_another_thread() {
    let engine = Engine::builder()
        .keepalive_tick(Duration::from_millis(5))
        .build();
    let task = BackgroundWork::<u8>::new(|task| task.yield_value(1))
        .start(engine.handle())
        .unwrap();

    let waiter = thread::spawn(move || task.wait());
    engine.run_until(|| waiter.is_finished()).unwrap();
    waiter.join().unwrap().unwrap();
}

#[test]
fn test_shutdown_fails_waiters() {
    let engine = Engine::new();
    let task = BackgroundWork::<()>::new(|task| {
        task.check_pause()?;
        thread::sleep(Duration::from_millis(20));
        Ok(())
    })
    .start(engine.handle())
    .unwrap();
    task.pause();

    engine.shutdown();
    assert!(task.wait().unwrap_err().is_dispatch_closed());
    assert!(
        BackgroundWork::<()>::new(|_| Ok(()))
            .start(engine.handle())
            .unwrap_err()
            .is_dispatch_closed()
    );
    task.resume();
}
