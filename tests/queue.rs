mod common;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use conquer_split::Queue;
use proptest::prelude::*;
use rand::Rng;

use common::{scaled, Tracked};

#[test]
fn test_queue_simple() {
    let queue = Queue::new();
    assert_eq!(queue.pop(), None);

    queue.push(42);
    queue.push(100);
    queue.push(200);

    assert_eq!(queue.pop(), Some(42));
    assert_eq!(queue.pop(), Some(100));
    assert_eq!(queue.pop(), Some(200));
    assert_eq!(queue.pop(), None);
}

#[test]
fn test_queue_empty_is_repeatable() {
    let queue: Queue<u32> = Queue::default();
    for _ in 0..10 {
        assert_eq!(queue.pop(), None);
    }

    queue.push(1);
    assert_eq!(queue.pop(), Some(1));
    for _ in 0..10 {
        assert_eq!(queue.pop(), None);
    }
}

#[test]
fn test_queue_is_empty() {
    let queue = Queue::new();
    assert!(queue.is_empty());
    queue.push("a");
    assert!(!queue.is_empty());
    assert_eq!(queue.pop(), Some("a"));
    assert!(queue.is_empty());
}

#[test]
fn test_queue_try_push() {
    let queue = Queue::new();
    assert!(queue.try_push(1).is_ok());
    assert!(queue.try_push(2).is_ok());
    assert_eq!(queue.pop(), Some(1));
    assert_eq!(queue.pop(), Some(2));
}

#[derive(Debug, Clone, PartialEq)]
struct CustomData {
    id: i32,
    name: String,
    value: f64,
}

#[test]
fn test_queue_custom_type() {
    let queue = Queue::new();
    let data = [
        CustomData { id: 1, name: "test1".into(), value: 3.14 },
        CustomData { id: 2, name: "test2".into(), value: 2.71 },
        CustomData { id: 3, name: "test3".into(), value: 1.41 },
    ];

    for elem in data.iter().cloned() {
        queue.push(elem);
    }

    for expected in &data {
        assert_eq!(queue.pop().as_ref(), Some(expected));
    }
    assert_eq!(queue.pop(), None);
}

#[test]
fn test_queue_zero_sized() {
    let queue = Queue::new();
    queue.push(());
    queue.push(());
    assert_eq!(queue.pop(), Some(()));
    assert_eq!(queue.pop(), Some(()));
    assert_eq!(queue.pop(), None);
}

#[test]
fn test_queue_iter() {
    let mut queue: Queue<_> = (0..5).collect();
    queue.extend(5..8);
    assert_eq!(queue.into_iter().collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
}

#[test]
fn test_queue_drop_releases_elements() {
    let drops = Arc::new(AtomicUsize::new(0));
    let queue = Queue::new();
    for i in 0..100 {
        queue.push(Tracked::new(i, &drops));
    }

    for i in 0..40 {
        assert_eq!(queue.pop().map(|elem| elem.value), Some(i));
    }
    assert_eq!(drops.load(Ordering::Relaxed), 40);

    drop(queue);
    assert_eq!(drops.load(Ordering::Relaxed), 100);
}

#[test]
fn test_queue_spsc_ordered() {
    let count = scaled(10_000);
    let queue = Arc::new(Queue::new());

    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            for i in 0..count {
                queue.push(i);
            }
        })
    };

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut consumed = Vec::with_capacity(count);
            while consumed.len() < count {
                match queue.pop() {
                    Some(elem) => consumed.push(elem),
                    None => thread::yield_now(),
                }
            }
            consumed
        })
    };

    producer.join().unwrap();
    let consumed = consumer.join().unwrap();
    assert_eq!(consumed, (0..count).collect::<Vec<_>>());
    assert!(queue.is_empty());
}

#[test]
fn test_queue_mpmc_conservation() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 3;
    let per_producer = scaled(2500);
    let total = PRODUCERS * per_producer;

    let queue = Arc::new(Queue::new());
    let consumed = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..per_producer {
                    queue.push(p * per_producer + i);
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let consumed = Arc::clone(&consumed);
            thread::spawn(move || {
                let mut local = Vec::new();
                while consumed.load(Ordering::Relaxed) < total {
                    match queue.pop() {
                        Some(elem) => {
                            local.push(elem);
                            consumed.fetch_add(1, Ordering::Relaxed);
                        }
                        None => thread::yield_now(),
                    }
                }
                local
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }

    let mut all = HashSet::new();
    for consumer in consumers {
        for elem in consumer.join().unwrap() {
            assert!(all.insert(elem), "value {} popped twice", elem);
        }
    }

    assert_eq!(all.len(), total);
    assert!((0..total).all(|elem| all.contains(&elem)));
    assert_eq!(queue.pop(), None);
}

#[test]
fn test_queue_many_producers_keep_order() {
    const PRODUCERS: usize = 16;
    let per_producer = scaled(1000);

    let queue = Arc::new(Queue::new());
    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..per_producer {
                    queue.push((p, i));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // the elements of every single producer must come out in the order they were pushed
    let mut next = [0usize; PRODUCERS];
    while let Some((p, i)) = queue.pop() {
        assert_eq!(next[p], i);
        next[p] += 1;
    }

    assert!(next.iter().all(|&count| count == per_producer));
}

#[test]
fn test_queue_mixed_stress() {
    const THREADS: usize = 8;
    let operations = scaled(20_000);

    let drops = Arc::new(AtomicUsize::new(0));
    let queue = Arc::new(Queue::new());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let queue = Arc::clone(&queue);
            let drops = Arc::clone(&drops);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let (mut pushed, mut popped) = (0, Vec::new());
                for i in 0..operations {
                    if rng.gen_bool(0.5) {
                        queue.push(Tracked::new(t * operations + i, &drops));
                        pushed += 1;
                    } else if let Some(elem) = queue.pop() {
                        popped.push(elem.value);
                    }
                }
                (pushed, popped)
            })
        })
        .collect();

    let mut pushed = 0;
    let mut seen = HashSet::new();
    for handle in handles {
        let (count, popped) = handle.join().unwrap();
        pushed += count;
        for value in popped {
            assert!(seen.insert(value), "value {} popped twice", value);
        }
    }

    let successful_pops = seen.len();
    let mut remaining = 0;
    while let Some(elem) = queue.pop() {
        assert!(seen.insert(elem.value), "value {} popped twice", elem.value);
        remaining += 1;
    }

    assert_eq!(successful_pops + remaining, pushed);
    assert_eq!(drops.load(Ordering::Relaxed), pushed);
}

#[derive(Debug, Clone)]
enum Op {
    Push(u32),
    Pop,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![any::<u32>().prop_map(Op::Push), Just(Op::Pop)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(if cfg!(miri) { 4 } else { 256 }))]

    /// A single-threaded sequence of operations behaves like a `VecDeque`.
    #[test]
    fn queue_matches_model(ops in prop::collection::vec(op(), 0..200)) {
        let queue = Queue::new();
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                Op::Push(elem) => {
                    queue.push(elem);
                    model.push_back(elem);
                }
                Op::Pop => prop_assert_eq!(queue.pop(), model.pop_front()),
            }
            prop_assert_eq!(queue.is_empty(), model.is_empty());
        }

        prop_assert_eq!(queue.into_iter().collect::<Vec<_>>(), Vec::from(model));
    }
}
