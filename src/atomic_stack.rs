//! Intrusive lock-free stack used to hand tasks to the worker threads.
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A node that can be linked into an [`AtomicStack`].
///
/// Links are read and written through raw pointers so that other fields of a node may be
/// shared with another thread while it sits in a stack.
pub(crate) trait Linked {
    /// # Safety
    ///
    /// `node` must be valid for reads.
    unsafe fn next(node: *mut Self) -> *mut Self;

    /// # Safety
    ///
    /// `node` must be valid for writes and its link must not be read concurrently.
    unsafe fn set_next(node: *mut Self, next: *mut Self);
}

/// Treiber stack supporting concurrent pushes and an atomic drain.
///
/// There is no single-node pop. Draining swaps the head out in one step, so the ABA problem
/// of a CAS pop cannot occur.
pub(crate) struct AtomicStack<T: Linked> {
    head: AtomicPtr<T>,
}

unsafe impl<T: Linked + Send> Send for AtomicStack<T> {}
unsafe impl<T: Linked + Send> Sync for AtomicStack<T> {}

impl<T: Linked> AtomicStack<T> {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push `node`. Returns `true` if the stack was empty.
    ///
    /// # Safety
    ///
    /// `node` must be valid, must not already be linked into a stack and must stay valid until
    /// it has been drained and processed.
    pub(crate) unsafe fn push(&self, node: *mut T) -> bool {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { T::set_next(node, head) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return head.is_null(),
                Err(current) => head = current,
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Take every node at once in the order they were pushed.
    pub(crate) fn pop_all_reversed(&self) -> Drain<'_, T> {
        let mut current = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut reversed = ptr::null_mut();
        while !current.is_null() {
            // SAFETY: pushed nodes stay valid until they are processed, which happens after
            // the drain hands them out.
            let next = unsafe { T::next(current) };
            assert!(next != current, "task stack contains a cycle");
            unsafe { T::set_next(current, reversed) };
            reversed = current;
            current = next;
        }
        Drain {
            current: reversed,
            _stack: PhantomData,
        }
    }
}

/// Nodes detached from an [`AtomicStack`].
///
/// The successor of each node is read before the node is yielded, so a yielded node may be
/// released by whoever owns it without invalidating the rest of the drain.
pub(crate) struct Drain<'a, T: Linked> {
    current: *mut T,
    _stack: PhantomData<&'a AtomicStack<T>>,
}

impl<T: Linked> Iterator for Drain<'_, T> {
    type Item = *mut T;

    fn next(&mut self) -> Option<*mut T> {
        if self.current.is_null() {
            return None;
        }
        let node = self.current;
        // SAFETY: see `AtomicStack::push`.
        let next = unsafe { T::next(node) };
        assert!(next != node, "task stack contains a cycle");
        self.current = next;
        Some(node)
    }
}
