// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::backoff::Backoff;
use crate::loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use crate::loom::thread::{self, Thread};
use core::fmt;
use core::ptr::{self, NonNull};

/// Set in [`Waiters::walkers`] while a thread is reclaiming retired nodes.
const RECLAIMING: usize = 1 << (usize::BITS - 1);

/// A lock-free stack of threads parked on a task (a Treiber stack).
///
/// # Implementation Notes
///
/// Waiting threads push a [`Node`] onto the stack and park. When the task reaches a terminal
/// state, the completing thread [drains](Waiters::drain) the stack by swapping the head for
/// null in one step, which hands it the entire chain, and unparks every node on it.
///
/// Waiters that give up (timeout or interrupt) cannot pop themselves off a Treiber stack, since
/// they may sit anywhere in it. Instead they clear their node's `waiting` flag, turning it into
/// a tombstone, and then walk the stack unlinking every tombstone they find, restarting the
/// walk whenever a concurrent change is detected. Multiple threads may do this at once and they
/// may even race a drain; the worst outcome is that a node gets unlinked twice or a tombstone
/// survives a little longer.
///
/// Nodes are owned by their waiting thread, which hands them back through [`Registration`]
/// once it is done waiting. A returned node may still be linked, and a walker that unlinked it
/// may still hold a pointer to it, or even write it back into the chain through a stale
/// `next`. Returned nodes are therefore only *retired*. They are freed once no walker is
/// active: the thread that finds the walker count at zero sets [`RECLAIMING`], which keeps new
/// walkers out, unlinks every tombstone (only pushes can race it now, and those only touch the
/// head), and frees the retired nodes, none of which can be reachable anymore. Pushes never
/// dereference the head, so a freed address showing up again as a new node is harmless.
pub(crate) struct Waiters {
    /// The top of the stack of waiting nodes.
    head: AtomicPtr<Node>,
    /// Nodes handed back by their owners, linked through [`Node::retired_next`].
    retired: AtomicPtr<Node>,
    /// Number of threads currently dereferencing nodes they don't own, plus [`RECLAIMING`].
    walkers: AtomicUsize,
    /// Number of nodes allocated and not yet freed.
    live: AtomicUsize,
}

pub(crate) struct Node {
    thread: Thread,
    /// `true` while the owning thread is parked (or about to park) on this node. Cleared exactly
    /// once, either by a drain (which then unparks the thread) or by the owning thread itself.
    waiting: AtomicBool,
    /// The next node on the wait stack.
    next: AtomicPtr<Node>,
    /// The next node on the retired list. Written once, when the owner gives the node up.
    retired_next: AtomicPtr<Node>,
}

/// A node owned by a waiting thread. Dropping it retires the node.
#[must_use]
pub(crate) struct Registration<'a> {
    waiters: &'a Waiters,
    node: NonNull<Node>,
}

/// Keeps reclamation out while alive, see [`Waiters::walk`].
struct Walk<'a>(&'a Waiters);

// === impl Waiters ===

impl Waiters {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            retired: AtomicPtr::new(ptr::null_mut()),
            walkers: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        }
    }

    /// Allocates a node for the calling thread.
    ///
    /// The node is not on the wait stack yet, see [`Waiters::push`].
    pub(crate) fn register(&self) -> Registration<'_> {
        let node = Box::new(Node {
            thread: thread::current(),
            waiting: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
            retired_next: AtomicPtr::new(ptr::null_mut()),
        });
        self.live.fetch_add(1, Ordering::Relaxed);

        Registration {
            waiters: self,
            node: NonNull::from(Box::leak(node)),
        }
    }

    /// Makes one attempt at pushing `node` onto the wait stack.
    ///
    /// Returns `false` if the head moved concurrently. Callers retry after re-checking whether
    /// they still need to wait at all.
    pub(crate) fn push(&self, node: &Node) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        node.next.store(head, Ordering::Relaxed);

        // `AcqRel`: release publishes the node to the draining thread; acquire makes sure that,
        // if we land on top of a head that a drain already cleared, we also see the terminal
        // state that drain published before clearing it.
        self.head
            .compare_exchange_weak(
                head,
                ptr::from_ref(node).cast_mut(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Claims every node currently on the stack and unparks its thread.
    ///
    /// Must only be called after the task reached a terminal state. Returns the number of
    /// threads that were unparked.
    pub(crate) fn drain(&self) -> usize {
        let _walk = self.walk();

        let mut woken = 0;
        let mut curr = self.head.swap(ptr::null_mut(), Ordering::AcqRel);

        while !curr.is_null() {
            // Safety: we are registered as a walker, so no node is freed under us
            let node = unsafe { &*curr };
            curr = node.next.load(Ordering::Acquire);
            node.next.store(ptr::null_mut(), Ordering::Release);

            if node.waiting.swap(false, Ordering::AcqRel) {
                tracing::trace!(thread = ?node.thread.id(), "unparking waiter");
                node.thread.unpark();
                woken += 1;
            }
        }

        woken
    }

    /// Tombstones `node` and unlinks all tombstones from the stack.
    pub(crate) fn remove(&self, node: &Node) {
        node.leave();

        let _walk = self.walk();
        'retry: loop {
            let mut pred: Option<&Node> = None;
            let mut curr = self.head.load(Ordering::Acquire);

            while !curr.is_null() {
                // Safety: we are registered as a walker, so no node is freed under us
                let node = unsafe { &*curr };
                let next = node.next.load(Ordering::Acquire);

                if node.waiting.load(Ordering::Acquire) {
                    pred = Some(node);
                } else if let Some(pred) = pred {
                    pred.next.store(next, Ordering::Release);
                    if !pred.waiting.load(Ordering::Acquire) {
                        // our predecessor became a tombstone too, so our unlink may have been
                        // lost; start over
                        continue 'retry;
                    }
                } else if self
                    .head
                    .compare_exchange(curr, next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    continue 'retry;
                }

                curr = next;
            }

            break;
        }
    }

    /// Number of nodes that have been allocated and not freed yet.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Returns the number of nodes that are on the stack and still waiting.
    #[cfg(test)]
    pub(crate) fn waiting(&self) -> usize {
        let _walk = self.walk();

        let mut count = 0;
        let mut curr = self.head.load(Ordering::Acquire);
        while !curr.is_null() {
            // Safety: we are registered as a walker, so no node is freed under us
            let node = unsafe { &*curr };
            if node.waiting.load(Ordering::Acquire) {
                count += 1;
            }
            curr = node.next.load(Ordering::Acquire);
        }
        count
    }

    /// Registers the calling thread as a walker, waiting out a running reclamation.
    fn walk(&self) -> Walk<'_> {
        let mut boff = Backoff::new();
        let mut walkers = self.walkers.load(Ordering::Relaxed);
        loop {
            if walkers & RECLAIMING != 0 {
                boff.spin();
                walkers = self.walkers.load(Ordering::Relaxed);
                continue;
            }

            match self.walkers.compare_exchange_weak(
                walkers,
                walkers + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Walk(self),
                Err(actual) => walkers = actual,
            }
        }
    }

    fn retire(&self, node: NonNull<Node>) {
        // Safety: the owner gave the node up, but it is not freed before it's on the list
        let node_ref = unsafe { node.as_ref() };
        node_ref.leave();

        let mut head = self.retired.load(Ordering::Relaxed);
        loop {
            node_ref.retired_next.store(head, Ordering::Relaxed);
            match self.retired.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        self.try_reclaim();
    }

    /// Frees all retired nodes, unless a walker is active. In that case the last walker to
    /// leave tries again.
    pub(crate) fn try_reclaim(&self) {
        if self
            .walkers
            .compare_exchange(0, RECLAIMING, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        // everything retired from here on waits for the next round
        let mut retired = self.retired.swap(ptr::null_mut(), Ordering::SeqCst);

        if !retired.is_null() {
            self.unlink_tombstones();
        }

        let mut freed = 0_usize;
        while !retired.is_null() {
            // Safety: the owner gave the node up, it is not waiting and therefore no longer
            // reachable from `head` after `unlink_tombstones`, and no walker is active
            let node = unsafe { Box::from_raw(retired) };
            retired = node.retired_next.load(Ordering::Relaxed);
            freed += 1;
        }

        if freed > 0 {
            self.live.fetch_sub(freed, Ordering::Relaxed);
            tracing::trace!(freed, "reclaimed waiter nodes");
        }

        self.walkers.store(0, Ordering::Release);
    }

    /// Unlinks every node that is not waiting. Requires [`RECLAIMING`] to be held.
    fn unlink_tombstones(&self) {
        'retry: loop {
            let mut pred: Option<&Node> = None;
            let mut curr = self.head.load(Ordering::Acquire);

            while !curr.is_null() {
                // Safety: nodes are only freed by the reclaiming thread, i.e. us
                let node = unsafe { &*curr };
                let next = node.next.load(Ordering::Acquire);

                if node.waiting.load(Ordering::Acquire) {
                    pred = Some(node);
                } else if let Some(pred) = pred {
                    // concurrent pushes only ever touch the head, so this can't be lost
                    pred.next.store(next, Ordering::Release);
                } else if self
                    .head
                    .compare_exchange(curr, next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    continue 'retry;
                }

                curr = next;
            }

            break;
        }
    }
}

impl Drop for Waiters {
    fn drop(&mut self) {
        // every registration borrows `self`, so all nodes have been retired by now and none of
        // them is still waiting
        let mut curr = self.retired.load(Ordering::Acquire);
        while !curr.is_null() {
            // Safety: we have exclusive access, and every retired node was created through
            // `Box::leak` in `register` and is on the retired list exactly once
            let node = unsafe { Box::from_raw(curr) };
            curr = node.retired_next.load(Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for Waiters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiters")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("retired", &self.retired.load(Ordering::Relaxed))
            .field("walkers", &self.walkers.load(Ordering::Relaxed))
            .field("live", &self.live())
            .finish()
    }
}

// === impl Walk ===

impl Drop for Walk<'_> {
    fn drop(&mut self) {
        let waiters = self.0;
        // `SeqCst` pairs with `retire`: either the retiring thread sees us gone, or we see its
        // node on the retired list
        if waiters.walkers.fetch_sub(1, Ordering::SeqCst) == 1
            && !waiters.retired.load(Ordering::SeqCst).is_null()
        {
            waiters.try_reclaim();
        }
    }
}

// === impl Registration ===

impl Registration<'_> {
    pub(crate) fn node(&self) -> &Node {
        // Safety: the node is only retired when `self` is dropped
        unsafe { self.node.as_ref() }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.waiters.retire(self.node);
    }
}

impl fmt::Debug for Registration<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("node", self.node())
            .finish_non_exhaustive()
    }
}

// === impl Node ===

impl Node {
    /// Marks the node as no longer waiting, without unlinking it.
    ///
    /// Called by the owning thread once it is done waiting, so that a later drain doesn't bother
    /// unparking it.
    pub(crate) fn leave(&self) {
        self.waiting.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("thread", &self.thread.id())
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .field("next", &self.next.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
