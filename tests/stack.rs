use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use lockfree::Stack;

#[test]
fn push_pop_order() {
    let stack = Stack::new();
    let guard = stack.guard();
    stack.push('a', &guard);
    stack.push('b', &guard);
    assert_eq!(stack.pop(&guard), Some(&'b'));
    assert_eq!(stack.pop(&guard), Some(&'a'));
    assert_eq!(stack.pop(&guard), None);
}

#[test]
fn concurrent_push_then_pop() {
    const WORKERS: u32 = 4;
    const RANGE: u32 = 10_000;

    let stack = Arc::new(Stack::new());
    let popped = Arc::new(Mutex::new(HashSet::new()));

    let mut threads = Vec::new();
    for w in 0..WORKERS {
        let stack = Arc::clone(&stack);
        let popped = Arc::clone(&popped);
        threads.push(thread::spawn(move || {
            let guard = stack.guard();
            for i in w * RANGE..(w + 1) * RANGE {
                stack.push(i, &guard);
            }
            // pop as many as this worker pushed; the values may be anyone's
            let mut mine = Vec::with_capacity(RANGE as usize);
            for _ in 0..RANGE {
                let value = loop {
                    if let Some(&v) = stack.pop(&guard) {
                        break v;
                    }
                };
                mine.push(value);
            }
            popped.lock().unwrap().extend(mine);
        }));
    }
    for t in threads {
        t.join().expect("worker panicked");
    }

    assert_eq!(stack.len(), 0);
    let guard = stack.guard();
    assert_eq!(stack.pop(&guard), None);

    let popped = popped.lock().unwrap();
    assert_eq!(popped.len(), (WORKERS * RANGE) as usize);
    for i in 0..WORKERS * RANGE {
        assert!(popped.contains(&i), "value {i} was lost");
    }
}

#[test]
fn popped_reference_survives_the_pop() {
    let stack = Stack::new();
    let guard = stack.guard();
    stack.push(String::from("kept alive by the guard"), &guard);
    let value = stack.pop(&guard).unwrap();
    // the node is retired, not freed, while this guard is pinned
    assert_eq!(value, "kept alive by the guard");
}
