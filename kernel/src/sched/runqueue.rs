// Per-CPU Ready Queue
//
// 32 FIFO buckets indexed by priority plus a bitmap of non-empty buckets,
// so picking the next thread is a trailing-zeros scan instead of a walk
// over every level.
//
// Correctness notes:
// - Bit `n` of `bitmap` is set iff bucket `n` is non-empty
// - Threads pinned to another CPU stay in place during `pop_eligible`;
//   `drain_foreign` moves them out when the owner is known

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::thread::{Thread, PRIORITY_LEVELS};

pub struct RunQueue {
    buckets: [VecDeque<Arc<Thread>>; PRIORITY_LEVELS],
    bitmap: u32,
    len: usize,
}

impl RunQueue {
    pub fn new() -> Self {
        RunQueue {
            buckets: core::array::from_fn(|_| VecDeque::new()),
            bitmap: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, thread: Arc<Thread>) {
        let level = thread.priority().level();
        self.buckets[level].push_back(thread);
        self.bitmap |= 1 << level;
        self.len += 1;
    }

    /// Removes the most urgent thread allowed to run on `cpu`, FIFO within
    /// a priority level.
    pub fn pop_eligible(&mut self, cpu: usize) -> Option<Arc<Thread>> {
        let mut pending = self.bitmap;
        while pending != 0 {
            let level = pending.trailing_zeros() as usize;
            pending &= pending - 1;

            let bucket = &mut self.buckets[level];
            if let Some(pos) = bucket.iter().position(|t| t.runs_on(cpu)) {
                let thread = bucket.remove(pos);
                if bucket.is_empty() {
                    self.bitmap &= !(1 << level);
                }
                self.len -= 1;
                return thread;
            }
        }
        None
    }

    /// Takes out every thread pinned away from `cpu`.
    pub fn drain_foreign(&mut self, cpu: usize) -> Vec<Arc<Thread>> {
        let mut moved = Vec::new();
        if self.len == 0 {
            return moved;
        }

        for (level, bucket) in self.buckets.iter_mut().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let before = bucket.len();
            bucket.retain(|t| {
                if t.runs_on(cpu) {
                    true
                } else {
                    moved.push(t.clone());
                    false
                }
            });
            self.len -= before - bucket.len();
            if bucket.is_empty() {
                self.bitmap &= !(1 << level);
            }
        }
        moved
    }

    pub fn contains(&self, thread: &Thread) -> bool {
        self.buckets[thread.priority().level()]
            .iter()
            .any(|t| t.id() == thread.id())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bitmap(&self) -> u32 {
        self.bitmap
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        RunQueue::new()
    }
}
