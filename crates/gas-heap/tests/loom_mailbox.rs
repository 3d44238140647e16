//! Loom tests for the remote-free mailbox atomic ordering.
//!
//! These tests verify that concurrent pushes and a take-all drain never
//! lose or duplicate a node.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use gas_heap::list::{MailboxStack, UnusedBlock};

fn new_node() -> NonNull<UnusedBlock> {
    let node = Box::new(UnusedBlock {
        next: AtomicPtr::new(std::ptr::null_mut()),
        spb: std::ptr::null_mut(),
    });
    NonNull::new(Box::into_raw(node)).unwrap()
}

fn drain(stack: &MailboxStack) -> Vec<usize> {
    let mut out = Vec::new();
    let mut cur = stack.take_all();
    while let Some(node) = NonNull::new(cur) {
        out.push(node.as_ptr() as usize);
        cur = unsafe { node.as_ref().next.load(Ordering::Relaxed) };
        drop(unsafe { Box::from_raw(node.as_ptr()) });
    }
    out
}

#[test]
#[ignore = "loom test - run with cargo test loom_mailbox_push --release"]
fn test_concurrent_pushes_are_all_drained() {
    loom::model(|| {
        let stack = Arc::new(MailboxStack::new());

        let pushers: Vec<_> = (0..2)
            .map(|_| {
                let stack = Arc::clone(&stack);
                loom::thread::spawn(move || {
                    let node = new_node();
                    let addr = node.as_ptr() as usize;
                    unsafe { stack.push(node) };
                    addr
                })
            })
            .collect();

        let pushed: Vec<usize> = pushers.into_iter().map(|t| t.join().unwrap()).collect();
        let mut drained = drain(&stack);
        drained.sort_unstable();
        let mut expected = pushed;
        expected.sort_unstable();
        assert_eq!(drained, expected);
    });
}

#[test]
#[ignore = "loom test - run with cargo test loom_mailbox_race --release"]
fn test_push_racing_take_all_never_loses_a_node() {
    loom::model(|| {
        let stack = Arc::new(MailboxStack::new());

        let pusher = loom::thread::spawn({
            let stack = Arc::clone(&stack);
            move || {
                let node = new_node();
                let addr = node.as_ptr() as usize;
                unsafe { stack.push(node) };
                addr
            }
        });

        let early = drain(&stack);
        let addr = pusher.join().unwrap();
        let late = drain(&stack);

        // The node came out of exactly one of the two drains.
        let seen = early.len() + late.len();
        assert_eq!(seen, 1);
        assert!(early.contains(&addr) || late.contains(&addr));
    });
}
