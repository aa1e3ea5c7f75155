// ==============================================
// CACHE MAP CONCURRENCY TESTS (integration)
// ==============================================
//
// Multi-threaded access to a shared map. These tests rely on the map's own
// locking; no external synchronization wraps the map.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use segmented_cache::CacheMap;
use segmented_cache::notification::{RemovalCause, RemovalNotification};
use segmented_cache::time::Ticker;

#[test]
fn disjoint_writers_all_land() {
    let map: Arc<CacheMap<u64, u64>> = Arc::new(CacheMap::builder().concurrency_level(16).build());
    let threads = 8u64;
    let per_thread = 2_000u64;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let key = t * per_thread + i;
                    map.insert(key, key);
                    assert_eq!(map.get(&key).as_deref(), Some(&key));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.len() as u64, threads * per_thread);
    map.check_invariants().unwrap();
}

#[test]
fn contended_key_reports_every_replacement() {
    let replaced = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&replaced);
    let map: Arc<CacheMap<&'static str, usize>> = Arc::new(
        CacheMap::builder()
            .removal_listener(move |n: RemovalNotification<&'static str, usize>| {
                if n.cause() == RemovalCause::Replaced {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build(),
    );

    let threads = 8;
    let per_thread = 500;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let map = Arc::clone(&map);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    map.insert("hot", t * per_thread + i);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // The first write creates the entry; every later one replaces it.
    assert_eq!(replaced.load(Ordering::SeqCst), threads * per_thread - 1);
    assert_eq!(map.len(), 1);
}

#[test]
fn bounded_map_stays_bounded_under_contention() {
    let evicted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&evicted);
    let map: Arc<CacheMap<u32, u32>> = Arc::new(
        CacheMap::builder()
            .concurrency_level(8)
            .maximum_size(200)
            .removal_listener(move |n: RemovalNotification<u32, u32>| {
                if n.cause() == RemovalCause::Size {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build(),
    );

    let handles: Vec<_> = (0..8u32)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..5_000u32 {
                    let key = t * 5_000 + i;
                    map.insert(key, i);
                    if i % 3 == 0 {
                        let _ = map.get(&(key / 2));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(map.len() <= 200);
    assert_eq!(evicted.load(Ordering::SeqCst) + map.len(), 40_000);
    map.check_invariants().unwrap();
}

#[test]
fn readers_and_writers_interleave() {
    let map: Arc<CacheMap<u32, u32>> = Arc::new(
        CacheMap::builder()
            .concurrency_level(4)
            .maximum_size(500)
            .expire_after_access(Duration::from_secs(60))
            .build(),
    );
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let map = Arc::clone(&map);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut hits = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    for key in 0..100 {
                        if let Some(value) = map.get(&key) {
                            assert_eq!(*value % 1_000, key);
                            hits += 1;
                        }
                    }
                }
                hits
            })
        })
        .collect();

    for round in 0..50u32 {
        for key in 0..100u32 {
            map.insert(key, round * 1_000 + key);
        }
        map.remove(&(round % 100));
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }
    map.check_invariants().unwrap();
}

#[test]
fn slow_listener_does_not_block_other_operations() {
    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let map: Arc<CacheMap<String, u32>> = Arc::new(
        CacheMap::builder()
            .concurrency_level(4)
            .removal_listener({
                let entered = Arc::clone(&entered);
                let release = Arc::clone(&release);
                move |n: RemovalNotification<String, u32>| {
                    if n.key().is_some_and(|k| k.as_str() == "slow") {
                        entered.store(true, Ordering::SeqCst);
                        let deadline = Instant::now() + Duration::from_secs(10);
                        while !release.load(Ordering::SeqCst) && Instant::now() < deadline {
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                }
            })
            .build(),
    );

    map.insert("slow".to_string(), 0);
    let remover = {
        let map = Arc::clone(&map);
        thread::spawn(move || map.remove("slow"))
    };
    while !entered.load(Ordering::SeqCst) {
        thread::yield_now();
    }

    // The remover is parked inside the listener; every segment, including
    // the one that held "slow", must still accept work.
    let started = Instant::now();
    for i in 0..1_000u32 {
        let key = format!("key{}", i);
        map.insert(key.clone(), i);
        assert_eq!(map.get(key.as_str()).as_deref(), Some(&i));
    }
    map.insert("slow".to_string(), 1);
    assert!(started.elapsed() < Duration::from_secs(5));

    release.store(true, Ordering::SeqCst);
    assert_eq!(remover.join().unwrap().as_deref(), Some(&0));
    assert_eq!(map.get("slow").as_deref(), Some(&1));
}

static STALL_ENTERED: AtomicBool = AtomicBool::new(false);
static STALL_LEFT: AtomicBool = AtomicBool::new(false);

/// A key whose equality check between 6 and 7 takes 800ms. Keys `n` and
/// `n + 1` share a hash when `n` is even.
#[derive(Debug)]
struct StallKey(u32);

impl Hash for StallKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.0 / 2);
    }
}

impl PartialEq for StallKey {
    fn eq(&self, other: &Self) -> bool {
        if self.0.min(other.0) == 6 && self.0.max(other.0) == 7 {
            STALL_ENTERED.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(800));
            STALL_LEFT.store(true, Ordering::SeqCst);
        }
        self.0 == other.0
    }
}

impl Eq for StallKey {}

#[test]
fn reads_complete_while_a_writer_holds_the_segment() {
    let map: Arc<CacheMap<StallKey, u32>> =
        Arc::new(CacheMap::builder().concurrency_level(1).build());
    map.insert(StallKey(1), 1);
    map.insert(StallKey(6), 6);

    // The writer compares 7 against the colliding 6 while holding the lock.
    let writer = {
        let map = Arc::clone(&map);
        thread::spawn(move || map.insert(StallKey(7), 7))
    };
    while !STALL_ENTERED.load(Ordering::SeqCst) {
        thread::yield_now();
    }

    let started = Instant::now();
    assert_eq!(map.get(&StallKey(1)).as_deref(), Some(&1));
    assert!(map.contains_key(&StallKey(1)));
    assert!(map.contains_value(&1));
    assert!(!STALL_LEFT.load(Ordering::SeqCst));
    assert!(started.elapsed() < Duration::from_millis(400));

    assert_eq!(writer.join().unwrap(), None);
    assert_eq!(map.len(), 3);
    map.check_invariants().unwrap();
}

/// Parks the thread named `late` for 300ms right after its first clock read.
struct LateTicker {
    nanos: AtomicU64,
    late_read: AtomicBool,
}

impl Ticker for LateTicker {
    fn read(&self) -> u64 {
        let now = self.nanos.load(Ordering::SeqCst);
        if thread::current().name() == Some("late") && !self.late_read.swap(true, Ordering::SeqCst)
        {
            thread::sleep(Duration::from_millis(300));
        }
        now
    }
}

#[test]
fn delayed_clock_read_does_not_strand_expired_entries() {
    let ticker = Arc::new(LateTicker {
        nanos: AtomicU64::new(0),
        late_read: AtomicBool::new(false),
    });
    let events = Arc::new(Mutex::new(Vec::new()));
    let map: Arc<CacheMap<u32, u32>> = Arc::new(
        CacheMap::builder()
            .concurrency_level(1)
            .expire_after_write(Duration::from_nanos(1_000))
            .ticker(ticker.clone())
            .removal_listener({
                let events = Arc::clone(&events);
                move |n: RemovalNotification<u32, u32>| {
                    events.lock().unwrap().push((n.key().map(|k| **k), n.cause()));
                }
            })
            .build(),
    );

    let late = {
        let map = Arc::clone(&map);
        thread::Builder::new()
            .name("late".to_string())
            .spawn(move || map.insert(1, 1))
            .unwrap()
    };
    while !ticker.late_read.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    ticker.nanos.store(500, Ordering::SeqCst);
    map.insert(2, 2);
    assert_eq!(late.join().unwrap(), None);

    ticker.nanos.store(1_200, Ordering::SeqCst);
    map.clean_up();

    assert_eq!(*events.lock().unwrap(), vec![(Some(1), RemovalCause::Expired)]);
    assert_eq!(map.len(), 1);
    map.check_invariants().unwrap();
}
