//! Inter-rank communication.
//!
//! Every collective is derived from one primitive, [`Communicator::all_to_all`]:
//! each rank hands in one buffer per destination rank and gets back one
//! buffer per source rank. Collectives block until every rank has joined and
//! must be entered by all ranks in the same order.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

/// Collective communication between the ranks of one job.
pub trait Communicator: Clone + Send + Sync + 'static {
    /// This rank, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Personalised exchange: `outgoing[to]` is delivered to rank `to`; the
    /// result holds at index `from` what rank `from` sent here.
    ///
    /// # Panics
    ///
    /// Panics if `outgoing.len() != size()`.
    fn all_to_all<T: Send + 'static>(&self, outgoing: Vec<Vec<T>>) -> Vec<Vec<T>>;

    /// Every rank's `value`, in rank order.
    fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Vec<T> {
        let outgoing = (0..self.size()).map(|_| vec![value.clone()]).collect();
        self.all_to_all(outgoing).into_iter().flatten().collect()
    }

    /// Sum over ranks. Summation runs in rank order, so every rank gets the
    /// bit-identical result.
    fn all_reduce_sum(&self, value: f64) -> f64 {
        self.all_gather(value).into_iter().sum()
    }

    /// Integer sum over ranks.
    fn all_reduce_sum_usize(&self, value: usize) -> usize {
        self.all_gather(value).into_iter().sum()
    }

    /// Whether `flag` is set on any rank.
    fn all_reduce_any(&self, flag: bool) -> bool {
        self.all_gather(flag).into_iter().any(|f| f)
    }

    /// Exclusive prefix sum of `value` over ranks, with the total appended:
    /// `[0, v0, v0+v1, ..., total]`.
    fn exclusive_sum(&self, value: usize) -> Vec<usize> {
        let all = self.all_gather(value);
        let mut offsets = Vec::with_capacity(all.len() + 1);
        offsets.push(0);
        let mut acc = 0;
        for v in all {
            acc += v;
            offsets.push(acc);
        }
        offsets
    }
}

// ---------------------------------------------------------------------------
// Single process
// ---------------------------------------------------------------------------

/// A one-rank world.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcessComm;

impl Communicator for SingleProcessComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_to_all<T: Send + 'static>(&self, outgoing: Vec<Vec<T>>) -> Vec<Vec<T>> {
        assert_eq!(outgoing.len(), 1, "all_to_all: expected one buffer per rank");
        outgoing
    }
}

// ---------------------------------------------------------------------------
// Threads as ranks
// ---------------------------------------------------------------------------

type Message = Box<dyn Any + Send>;

struct Mailbox {
    size: usize,
    barrier: Barrier,
    /// `slots[from * size + to]`.
    slots: Mutex<Vec<Option<Message>>>,
}

/// Ranks running as threads of one process.
///
/// A collective posts its buffers into a shared mailbox, waits on a barrier,
/// collects the buffers addressed to it, and waits again so the mailbox can
/// be reused by the next collective.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Mailbox>,
}

impl fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

impl ThreadComm {
    /// Communicators for every rank of a `size`-rank world. Hand one to each
    /// thread.
    ///
    /// # Panics
    ///
    /// Panics if `size == 0`.
    pub fn world(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "a world needs at least one rank");
        let shared = Arc::new(Mailbox {
            size,
            barrier: Barrier::new(size),
            slots: Mutex::new((0..size * size).map(|_| None).collect()),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Run `f` on every rank of a `size`-rank world, one scoped thread per
    /// rank, and return the results in rank order.
    ///
    /// A panic on any rank is resumed on the caller once all threads have
    /// finished.
    pub fn run<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(ThreadComm) -> R + Sync,
        R: Send,
    {
        let world = Self::world(size);
        std::thread::scope(|scope| {
            let f = &f;
            let handles: Vec<_> = world
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(v) => v,
                    Err(payload) => std::panic::resume_unwind(payload),
                })
                .collect()
        })
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_to_all<T: Send + 'static>(&self, outgoing: Vec<Vec<T>>) -> Vec<Vec<T>> {
        let size = self.shared.size;
        assert_eq!(outgoing.len(), size, "all_to_all: expected one buffer per rank");

        {
            let mut slots = self.shared.slots.lock();
            for (to, buf) in outgoing.into_iter().enumerate() {
                slots[self.rank * size + to] = Some(Box::new(buf) as Message);
            }
        }
        self.shared.barrier.wait();

        let incoming = {
            let mut slots = self.shared.slots.lock();
            (0..size)
                .map(|from| {
                    let Some(message) = slots[from * size + self.rank].take() else {
                        panic!("all_to_all: no message from rank {from}");
                    };
                    match message.downcast::<Vec<T>>() {
                        Ok(buf) => *buf,
                        Err(_) => panic!("all_to_all: rank {from} entered a different collective"),
                    }
                })
                .collect()
        };
        self.shared.barrier.wait();
        incoming
    }
}
