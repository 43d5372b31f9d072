//! Atomic control words with futex-style wait/notify.
//!
//! A [`ControlWord`] is a view over one 32-bit word of a [`crate::ShmRegion`] plus
//! the process-local wait queue attached to it. Waiting follows `Atomics.wait`
//! semantics: a waiter only sleeps while the word still holds the expected
//! value, and `notify(count)` wakes at most `count` sleepers in FIFO order.
//!
//! Two kinds of waiter share one queue:
//! - blocking waiters park the calling thread ([`ControlWord::wait`])
//! - task waiters register a [`Waker`] ([`ControlWord::poll_wait`])
//!
//! The queue lock is only held to register or pop waiters; the word itself is
//! always accessed with atomic operations.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::thread::{self, Thread};

use crate::layout::WordState;

/// Which control word of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordId {
    Reader,
    Writer,
}

/// Why a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Removed from the queue by `notify`. The value may or may not have changed.
    Woken,
    /// The word no longer held the expected value.
    NotEqual,
    /// The region was interrupted by a peer lifecycle event.
    Interrupted,
}

/// Registration of a task waiter, kept by the future that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitKey {
    pub(crate) word: WordId,
    pub(crate) key: u64,
}

enum Wake {
    Thread {
        thread: Thread,
        notified: Arc<AtomicBool>,
    },
    Task(Waker),
}

struct Waiter {
    key: u64,
    wake: Wake,
}

pub(crate) struct WaitQueue {
    waiters: Mutex<VecDeque<Waiter>>,
    next_key: AtomicU64,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
            next_key: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    fn wake(&self, count: usize) -> usize {
        let woken: Vec<Wake> = {
            let mut q = self.lock();
            let n = count.min(q.len());
            q.drain(..n).map(|w| w.wake).collect()
        };
        let n = woken.len();
        for wake in woken {
            match wake {
                Wake::Thread { thread, notified } => {
                    notified.store(true, Ordering::SeqCst);
                    thread.unpark();
                }
                Wake::Task(waker) => waker.wake(),
            }
        }
        n
    }

    /// Returns `false` if the waiter was already popped by `wake`.
    fn remove(&self, key: u64) -> bool {
        let mut q = self.lock();
        match q.iter().position(|w| w.key == key) {
            Some(idx) => {
                q.remove(idx);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// View over one control word of a region.
#[derive(Clone, Copy)]
pub struct ControlWord<'a> {
    id: WordId,
    atom: &'a AtomicU32,
    queue: &'a WaitQueue,
    interrupted: &'a AtomicBool,
}

impl<'a> ControlWord<'a> {
    pub(crate) fn new(
        id: WordId,
        atom: &'a AtomicU32,
        queue: &'a WaitQueue,
        interrupted: &'a AtomicBool,
    ) -> Self {
        Self {
            id,
            atom,
            queue,
            interrupted,
        }
    }

    pub fn id(&self) -> WordId {
        self.id
    }

    pub fn load_raw(&self) -> u32 {
        self.atom.load(Ordering::SeqCst)
    }

    /// Load the current state. Values outside the state enum read as `Closed`.
    pub fn load(&self) -> WordState {
        let raw = self.load_raw();
        debug_assert!(WordState::from_u32(raw).is_some(), "bogus control word {raw}");
        WordState::from_u32(raw).unwrap_or(WordState::Closed)
    }

    pub fn store(&self, state: WordState) {
        self.atom.store(state.as_u32(), Ordering::SeqCst);
    }

    pub fn compare_exchange(
        &self,
        current: WordState,
        new: WordState,
    ) -> Result<WordState, WordState> {
        self.atom
            .compare_exchange(
                current.as_u32(),
                new.as_u32(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| current)
            .map_err(|actual| WordState::from_u32(actual).unwrap_or(WordState::Closed))
    }

    /// Wake at most `count` waiters. Returns how many were woken.
    pub fn notify(&self, count: usize) -> usize {
        self.queue.wake(count)
    }

    pub fn notify_all(&self) -> usize {
        self.queue.wake(usize::MAX)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Number of registered waiters (thread and task).
    pub fn waiters(&self) -> usize {
        self.queue.len()
    }

    /// Park the calling thread while the word holds `expected`.
    ///
    /// Spurious thread wakeups are absorbed; the call returns only on notify,
    /// a value change, or an interrupt.
    pub fn wait(&self, expected: WordState) -> WaitOutcome {
        if self.is_interrupted() {
            return WaitOutcome::Interrupted;
        }

        let notified = Arc::new(AtomicBool::new(false));
        let key = {
            let mut q = self.queue.lock();
            // Checked under the queue lock: notifiers store first and lock second.
            if self.load_raw() != expected.as_u32() {
                return WaitOutcome::NotEqual;
            }
            if self.is_interrupted() {
                return WaitOutcome::Interrupted;
            }
            let key = self.queue.next_key();
            q.push_back(Waiter {
                key,
                wake: Wake::Thread {
                    thread: thread::current(),
                    notified: notified.clone(),
                },
            });
            key
        };

        loop {
            thread::park();
            if notified.load(Ordering::SeqCst) {
                return WaitOutcome::Woken;
            }
            let outcome = if self.is_interrupted() {
                WaitOutcome::Interrupted
            } else if self.load_raw() != expected.as_u32() {
                WaitOutcome::NotEqual
            } else {
                continue;
            };
            return if self.queue.remove(key) {
                outcome
            } else {
                WaitOutcome::Woken
            };
        }
    }

    /// Non-blocking wait: registers `cx`'s waker while the word holds `expected`.
    ///
    /// `slot` carries the registration between polls. It must be either empty
    /// or registered on this word.
    pub fn poll_wait(
        &self,
        cx: &mut Context<'_>,
        expected: WordState,
        slot: &mut Option<WaitKey>,
    ) -> Poll<WaitOutcome> {
        debug_assert!(slot.map_or(true, |k| k.word == self.id));

        let mut q = self.queue.lock();
        let registered = match *slot {
            Some(k) => match q.iter().position(|w| w.key == k.key) {
                Some(idx) => Some(idx),
                None => {
                    *slot = None;
                    return Poll::Ready(WaitOutcome::Woken);
                }
            },
            None => None,
        };

        let outcome = if self.is_interrupted() {
            Some(WaitOutcome::Interrupted)
        } else if self.load_raw() != expected.as_u32() {
            Some(WaitOutcome::NotEqual)
        } else {
            None
        };
        if let Some(outcome) = outcome {
            if let Some(idx) = registered {
                q.remove(idx);
            }
            *slot = None;
            return Poll::Ready(outcome);
        }

        match registered {
            Some(idx) => {
                if let Wake::Task(waker) = &mut q[idx].wake {
                    if !waker.will_wake(cx.waker()) {
                        *waker = cx.waker().clone();
                    }
                }
            }
            None => {
                let key = self.queue.next_key();
                q.push_back(Waiter {
                    key,
                    wake: Wake::Task(cx.waker().clone()),
                });
                *slot = Some(WaitKey { word: self.id, key });
            }
        }
        Poll::Pending
    }

    /// Drop a task registration made by [`ControlWord::poll_wait`].
    pub fn cancel(&self, slot: &mut Option<WaitKey>) {
        if let Some(k) = slot.take() {
            debug_assert_eq!(k.word, self.id);
            self.queue.remove(k.key);
        }
    }

    /// Future form of [`ControlWord::poll_wait`].
    pub fn wait_async(self, expected: WordState) -> WaitFuture<'a> {
        WaitFuture {
            word: self,
            expected,
            slot: None,
        }
    }
}

impl std::fmt::Debug for ControlWord<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlWord")
            .field("id", &self.id)
            .field("value", &self.load_raw())
            .finish()
    }
}

/// Resolves once the word leaves the expected value, is notified, or is interrupted.
pub struct WaitFuture<'a> {
    word: ControlWord<'a>,
    expected: WordState,
    slot: Option<WaitKey>,
}

impl Future for WaitFuture<'_> {
    type Output = WaitOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WaitOutcome> {
        let this = self.get_mut();
        this.word.poll_wait(cx, this.expected, &mut this.slot)
    }
}

impl Drop for WaitFuture<'_> {
    fn drop(&mut self) {
        self.word.cancel(&mut self.slot);
    }
}
