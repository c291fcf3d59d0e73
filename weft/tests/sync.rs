//! Synchronization-primitive laws: mutual exclusion and hand-off, barrier
//! release, writer priority, condvar wake counts, teardown, and deadlock
//! detection.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use weft::sync::{Barrier, Condvar, Mutex, RwLock};
use weft::{Error, spawn, yield_now};

#[test]
fn mutex_serializes_critical_sections() {
    let mutex = Rc::new(Mutex::new(0usize));
    let mut handles = Vec::new();
    for id in 1..=30 {
        let m = mutex.clone();
        handles.push(
            spawn(move || {
                let mut g = m.lock().unwrap();
                *g = id;
                // Let every other fiber have a turn while we hold the lock.
                yield_now();
                assert_eq!(*g, id, "another fiber entered the critical section");
                0
            })
            .unwrap(),
        );
    }

    for h in handles {
        h.join().unwrap();
    }

    let g = mutex.try_lock().unwrap();
    assert_eq!(mutex.try_lock().unwrap_err(), Error::Busy);
    drop(g);
    assert!(mutex.try_lock().is_ok());
}

#[test]
fn mutex_hands_off_in_fifo_order() {
    let mutex = Rc::new(Mutex::new(()));
    let log = Rc::new(RefCell::new(Vec::new()));
    let guard = mutex.lock().unwrap();

    let mut handles = Vec::new();
    for id in 0..3 {
        let m = mutex.clone();
        let l = log.clone();
        handles.push(
            spawn(move || {
                let _g = m.lock().unwrap();
                l.borrow_mut().push(id);
                0
            })
            .unwrap(),
        );
    }

    yield_now();
    assert!(log.borrow().is_empty(), "a waiter got the lock while held");

    drop(guard);
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*log.borrow(), [0, 1, 2]);
}

#[test]
fn relocking_a_held_mutex_reports_deadlock() {
    let mutex = Rc::new(Mutex::new(()));
    let m = mutex.clone();
    let handle = spawn(move || {
        let _g = m.lock().unwrap();
        // Nothing else is runnable, so the scheduler wakes us with the
        // deadlock error instead of hanging the thread.
        match m.lock() {
            Err(Error::Deadlock) => 1,
            _ => 0,
        }
    })
    .unwrap();

    assert_eq!(handle.join().unwrap(), 1);
}

#[test]
fn destroying_a_mutex_fails_its_waiters() {
    let mutex = Rc::new(Mutex::new(()));
    let guard = mutex.lock().unwrap();

    let m = mutex.clone();
    let handle = spawn(move || match m.lock() {
        Err(Error::Invalid) => 1,
        _ => 0,
    })
    .unwrap();

    yield_now();
    mutex.destroy();
    drop(guard);
    assert_eq!(handle.join().unwrap(), 1);
}

#[test]
fn barrier_releases_everyone_with_one_leader() {
    let barrier = Rc::new(Barrier::new(5));
    let leaders = Rc::new(Cell::new(0));
    let done = Rc::new(Cell::new(0));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let b = barrier.clone();
        let l = leaders.clone();
        let d = done.clone();
        handles.push(
            spawn(move || {
                let r = b.wait().unwrap();
                if r.is_leader() {
                    l.set(l.get() + 1);
                }
                d.set(d.get() + 1);
                0
            })
            .unwrap(),
        );
    }

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(leaders.get(), 1);
    assert_eq!(done.get(), 5);

    // Single-use: the next cycle needs a fresh barrier.
    assert_eq!(barrier.wait().unwrap_err(), Error::Invalid);
}

#[test]
fn destroying_a_barrier_fails_its_waiters() {
    let barrier = Rc::new(Barrier::new(3));
    let b = barrier.clone();
    let handle = spawn(move || match b.wait() {
        Err(Error::Invalid) => 1,
        _ => 0,
    })
    .unwrap();

    yield_now();
    barrier.destroy();
    assert_eq!(handle.join().unwrap(), 1);
}

#[test]
fn signal_wakes_one_broadcast_wakes_all_late_waiters_stay() {
    let cv = Rc::new(Condvar::new());
    let log: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(Vec::new()));

    let mut handles = Vec::new();
    for name in ["a", "b"] {
        let cv = cv.clone();
        let log = log.clone();
        handles.push(
            spawn(move || {
                cv.wait_unlocked().unwrap();
                log.borrow_mut().push(name);
                0
            })
            .unwrap(),
        );
    }

    yield_now();
    assert!(log.borrow().is_empty());

    // Signal wakes exactly the longest waiter.
    cv.signal();
    yield_now();
    assert_eq!(*log.borrow(), ["a"]);

    // Broadcast wakes everyone currently waiting...
    cv.broadcast();
    let cvc = cv.clone();
    let logc = log.clone();
    handles.push(
        spawn(move || {
            cvc.wait_unlocked().unwrap();
            logc.borrow_mut().push("c");
            0
        })
        .unwrap(),
    );

    // ...but a fiber that starts waiting afterwards stays blocked.
    yield_now();
    assert_eq!(*log.borrow(), ["a", "b"]);

    cv.signal();
    yield_now();
    assert_eq!(*log.borrow(), ["a", "b", "c"]);

    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn condvar_wait_releases_and_relocks_the_mutex() {
    let shared = Rc::new((Mutex::new(Vec::<usize>::new()), Condvar::new()));

    let s = shared.clone();
    let consumer = spawn(move || {
        let (mutex, cv) = &*s;
        let mut queue = mutex.lock().unwrap();
        while queue.is_empty() {
            // Atomically release and sleep; wait re-locks before returning.
            queue = cv.wait(queue).unwrap();
        }
        queue.pop().unwrap()
    })
    .unwrap();

    yield_now();

    let (mutex, cv) = &*shared;
    {
        let mut queue = mutex.lock().unwrap();
        queue.push(42);
        cv.signal();
    }
    assert_eq!(consumer.join().unwrap(), 42);
}

#[test]
fn destroying_a_condvar_fails_its_waiters() {
    let cv = Rc::new(Condvar::new());
    let c = cv.clone();
    let handle = spawn(move || match c.wait_unlocked() {
        Err(Error::Invalid) => 1,
        _ => 0,
    })
    .unwrap();

    yield_now();
    cv.destroy();
    assert_eq!(handle.join().unwrap(), 1);
}

#[test]
fn waiting_with_no_waker_reports_deadlock() {
    let cv = Rc::new(Condvar::new());
    let c = cv.clone();
    let handle = spawn(move || match c.wait_unlocked() {
        Err(Error::Deadlock) => 1,
        _ => 0,
    })
    .unwrap();

    assert_eq!(handle.join().unwrap(), 1);
}

#[test]
fn queued_writers_bar_new_readers_then_readers_see_the_write() {
    let lock = Rc::new(RwLock::new(0usize));
    let observed = Rc::new(RefCell::new(Vec::new()));

    // A held reader cohort of two.
    let r1 = lock.read().unwrap();
    let r2 = lock.read().unwrap();

    // A writer queues up behind them.
    let l = lock.clone();
    let writer = spawn(move || {
        let mut g = l.write().unwrap();
        *g = 7;
        0
    })
    .unwrap();
    yield_now();

    // Writer priority: with a writer queued, new readers are barred even
    // though only readers hold the lock.
    assert_eq!(lock.try_read().unwrap_err(), Error::Busy);

    // Two readers queue up behind the writer.
    let mut readers = Vec::new();
    for _ in 0..2 {
        let l = lock.clone();
        let o = observed.clone();
        readers.push(
            spawn(move || {
                let g = l.read().unwrap();
                o.borrow_mut().push(*g);
                0
            })
            .unwrap(),
        );
    }
    yield_now();

    // The last reader out hands the lock to the writer before it even runs.
    drop(r1);
    drop(r2);
    assert_eq!(lock.try_read().unwrap_err(), Error::Busy);

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    // The whole cohort was admitted together, after the write.
    assert_eq!(*observed.borrow(), [7, 7]);

    // Everyone is gone; the lock is free again.
    let g = lock.try_write().unwrap();
    drop(g);
}

#[test]
fn queued_writers_drain_before_any_reader() {
    let lock = Rc::new(RwLock::new(0usize));
    let log = Rc::new(RefCell::new(Vec::new()));

    let guard = lock.read().unwrap();

    let mut handles = Vec::new();
    for id in 1..=2 {
        let l = lock.clone();
        let lg = log.clone();
        handles.push(
            spawn(move || {
                let mut g = l.write().unwrap();
                *g += 1;
                lg.borrow_mut().push(format!("w{id}"));
                0
            })
            .unwrap(),
        );
    }
    let l = lock.clone();
    let lg = log.clone();
    handles.push(
        spawn(move || {
            let g = l.read().unwrap();
            lg.borrow_mut().push(format!("r{}", *g));
            0
        })
        .unwrap(),
    );

    yield_now();
    drop(guard);

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*log.borrow(), ["w1", "w2", "r2"]);
}

#[test]
fn try_write_is_busy_while_read_held() {
    let lock = RwLock::new(());
    let g = lock.read().unwrap();
    assert_eq!(lock.try_write().unwrap_err(), Error::Busy);
    drop(g);
    assert!(lock.try_write().is_ok());
}

#[test]
fn destroying_an_rwlock_fails_waiters_on_both_sides() {
    let lock = Rc::new(RwLock::new(()));
    let held = lock.write().unwrap();

    let l = lock.clone();
    let reader = spawn(move || match l.read() {
        Err(Error::Invalid) => 1,
        _ => 0,
    })
    .unwrap();
    let l = lock.clone();
    let writer = spawn(move || match l.write() {
        Err(Error::Invalid) => 1,
        _ => 0,
    })
    .unwrap();

    yield_now();
    lock.destroy();
    drop(held);
    assert_eq!(reader.join().unwrap(), 1);
    assert_eq!(writer.join().unwrap(), 1);
}
