//! The "park main" path: a thread of interest spins the designated main
//! thread inside the suspend handler until it lets go.

mod common;

use common::{isolated_coordinator, wait_until};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

#[test]
fn test_thread_of_interest_parks_main() {
    let stop = Arc::new(AtomicBool::new(false));
    let ticks = Arc::new(AtomicU64::new(0));
    let (tx, rx) = mpsc::channel();

    let (s, t) = (Arc::clone(&stop), Arc::clone(&ticks));
    let main = std::thread::spawn(move || {
        let coord = isolated_coordinator();
        let park = Arc::new(AtomicBool::new(false));
        let p = Arc::clone(&park);
        let worker = coord
            .spawn(move || {
                while !p.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        let bystander = coord.spawn(|| ()).unwrap();
        tx.send((coord.lifecycle(), worker.tid(), bystander.tid()))
            .unwrap();

        while !s.load(Ordering::SeqCst) {
            t.fetch_add(1, Ordering::SeqCst);
            std::hint::spin_loop();
        }

        park.store(true, Ordering::SeqCst);
        worker.join().unwrap();
        bystander.join().unwrap();
        coord.teardown().unwrap();
    });

    let (lc, worker, bystander) = rx.recv().unwrap();
    let fp = lc.fingerprint(worker).expect("creation was correlated");
    assert!(lc.fingerprint(bystander).is_some());
    assert_ne!(lc.fingerprint(bystander), Some(fp));

    // not of interest yet
    assert!(!lc.suspend(worker));
    assert_eq!(lc.spin_count(), 0);

    assert!(lc.watch(fp));
    assert!(lc.wait_for(worker));
    assert!(!lc.wait_for(bystander));
    assert!(!lc.suspend(bystander));

    assert!(lc.suspend(worker));
    assert!(wait_until(Duration::from_secs(5), || lc.is_spinning()));
    assert_eq!(lc.spin_count(), 1);
    let parked = ticks.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(ticks.load(Ordering::SeqCst), parked);

    // only a thread of interest may release it
    assert!(!lc.resume(bystander));
    assert!(lc.is_spinning());
    assert!(lc.resume(worker));
    assert!(wait_until(Duration::from_secs(5), || !lc.is_spinning()));
    assert!(wait_until(Duration::from_secs(5), || {
        ticks.load(Ordering::SeqCst) > parked
    }));

    // main may ask for it itself
    assert!(lc.suspend(lc.main_thread()));
    assert!(wait_until(Duration::from_secs(5), || lc.spin_count() == 2));
    assert!(lc.resume(worker));
    assert!(wait_until(Duration::from_secs(5), || !lc.is_spinning()));

    stop.store(true, Ordering::SeqCst);
    main.join().unwrap();
}
