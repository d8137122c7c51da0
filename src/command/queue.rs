//! Command Queue
//!
//! One [`CommandQueue`] per hardware queue family. It owns:
//!
//! - a free queue of reusable [`CommandList`]s per level (a `flume` channel,
//!   so recording threads can take and return lists without a shared lock),
//! - a timeline counter that every [`submit`](CommandQueue::submit) signals
//!   with the next value, so any later code can `wait(value)` for exactly
//!   that submission,
//! - the in-flight lists, recycled once their timeline value is reached.
//!
//! ```text
//!   get_command_list ──▶ record ──▶ submit ──▶ in flight ──▶ retired
//!         ▲                                                     │
//!         └──────────────── free queue (reset on reuse) ◀───────┘
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::backend::{
    CommandBufferHandle, CommandBufferLevel, CommandPoolHandle, GpuDevice, QueueKind,
    RenderingInheritance, TimelineHandle, TimelineSignal,
};
use crate::errors::Result;

/// A native command pool with the one command buffer recorded from it.
///
/// Owned by exactly one recorder while in use. Secondary lists executed from
/// a primary are attached to it so they are recycled together once the
/// primary retires.
#[derive(Debug)]
pub struct CommandList {
    pool: CommandPoolHandle,
    buffer: CommandBufferHandle,
    level: CommandBufferLevel,
    secondaries: Vec<CommandList>,
}

impl CommandList {
    #[inline]
    #[must_use]
    pub fn buffer(&self) -> CommandBufferHandle {
        self.buffer
    }

    #[inline]
    #[must_use]
    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    /// Keeps `secondaries` alive until this list retires.
    pub fn attach_secondaries(&mut self, secondaries: impl IntoIterator<Item = CommandList>) {
        self.secondaries.extend(secondaries);
    }

    #[must_use]
    pub fn secondary_buffers(&self) -> SmallVec<[CommandBufferHandle; 8]> {
        self.secondaries.iter().map(|s| s.buffer).collect()
    }
}

struct FreeQueue {
    tx: flume::Sender<CommandList>,
    rx: flume::Receiver<CommandList>,
}

impl FreeQueue {
    fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }
}

pub struct CommandQueue {
    device: Arc<dyn GpuDevice>,
    kind: QueueKind,
    timeline: TimelineHandle,
    next_value: AtomicU64,
    primaries: FreeQueue,
    secondaries: FreeQueue,
    in_flight: Mutex<VecDeque<(u64, CommandList)>>,
    created: AtomicU64,
    timeout: Duration,
}

impl CommandQueue {
    pub fn new(device: Arc<dyn GpuDevice>, kind: QueueKind, timeout: Duration) -> Result<Self> {
        let timeline = device.create_timeline(0)?;
        Ok(Self {
            device,
            kind,
            timeline,
            next_value: AtomicU64::new(1),
            primaries: FreeQueue::new(),
            secondaries: FreeQueue::new(),
            in_flight: Mutex::new(VecDeque::new()),
            created: AtomicU64::new(0),
            timeout,
        })
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    fn free_queue(&self, level: CommandBufferLevel) -> &FreeQueue {
        match level {
            CommandBufferLevel::Primary => &self.primaries,
            CommandBufferLevel::Secondary => &self.secondaries,
        }
    }

    /// Pops a free list (resetting it) or creates a new one, and begins
    /// recording. Secondary lists need the `inheritance` of the pass they
    /// will be executed in.
    pub fn get_command_list(
        &self,
        level: CommandBufferLevel,
        inheritance: Option<&RenderingInheritance>,
    ) -> Result<CommandList> {
        self.reclaim()?;

        let list = match self.free_queue(level).rx.try_recv() {
            Ok(list) => {
                self.device.reset_command_pool(list.pool)?;
                list
            }
            Err(_) => {
                let pool = self.device.create_command_pool(self.kind)?;
                let buffer = match self.device.allocate_command_buffer(pool, level) {
                    Ok(buffer) => buffer,
                    Err(err) => {
                        self.device.destroy_command_pool(pool);
                        return Err(err);
                    }
                };
                let count = self.created.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("{:?} queue: new {level:?} command list ({count} total)", self.kind);
                CommandList {
                    pool,
                    buffer,
                    level,
                    secondaries: Vec::new(),
                }
            }
        };

        self.device.begin_command_buffer(list.buffer, inheritance)?;
        Ok(list)
    }

    /// Ends recording without submitting (for secondaries about to be
    /// executed from a primary).
    pub fn end_command_list(&self, list: &CommandList) -> Result<()> {
        self.device.end_command_buffer(list.buffer)
    }

    /// Returns a list that will not be submitted. Its attached secondaries
    /// go back too.
    pub fn free_command_list(&self, mut list: CommandList) {
        for secondary in list.secondaries.drain(..) {
            self.free_command_list(secondary);
        }
        // The receiver lives as long as `self`, so the send cannot fail.
        let _ = self.free_queue(list.level).tx.send(list);
    }

    /// Ends and submits `lists` in order. Returns the timeline value that
    /// signals their retirement.
    pub fn submit(&self, lists: Vec<CommandList>) -> Result<u64> {
        let buffers: SmallVec<[CommandBufferHandle; 4]> = lists.iter().map(|l| l.buffer).collect();
        for &buffer in &buffers {
            self.device.end_command_buffer(buffer)?;
        }

        // Value allocation and submission stay in one critical section so
        // the timeline only ever sees increasing values.
        let mut in_flight = self.in_flight.lock();
        let value = self.next_value.load(Ordering::SeqCst);
        let signal = TimelineSignal {
            timeline: self.timeline,
            value,
        };
        if let Err(err) = self.device.submit(self.kind, &buffers, signal) {
            drop(in_flight);
            for list in lists {
                self.free_command_list(list);
            }
            return Err(err);
        }
        self.next_value.store(value + 1, Ordering::SeqCst);
        in_flight.extend(lists.into_iter().map(|l| (value, l)));
        Ok(value)
    }

    /// Blocks until the submission that returned `value` has retired.
    pub fn wait(&self, value: u64) -> Result<()> {
        self.device.wait_timeline(self.timeline, value, self.timeout)?;
        self.reclaim()?;
        Ok(())
    }

    /// Blocks until everything submitted so far has retired.
    pub fn wait_idle(&self) -> Result<()> {
        let last = self.last_submitted_value();
        if last > 0 {
            self.wait(last)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn last_submitted_value(&self) -> u64 {
        self.next_value.load(Ordering::SeqCst) - 1
    }

    pub fn completed_value(&self) -> Result<u64> {
        self.device.timeline_value(self.timeline)
    }

    /// Moves retired lists to the free queues. Returns how many moved.
    pub fn reclaim(&self) -> Result<usize> {
        let completed = self.completed_value()?;
        let mut in_flight = self.in_flight.lock();
        let mut reclaimed = 0;
        while in_flight.front().is_some_and(|(value, _)| *value <= completed) {
            if let Some((_, list)) = in_flight.pop_front() {
                self.free_command_list(list);
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Lists waiting in the free queues.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.primaries.rx.len() + self.secondaries.rx.len()
    }

    /// Lists ever created by this queue.
    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    fn destroy_list(&self, mut list: CommandList) {
        for secondary in list.secondaries.drain(..) {
            self.destroy_list(secondary);
        }
        self.device.destroy_command_pool(list.pool);
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            log::error!("{:?} queue dropped while busy: {err}", self.kind);
        }
        let in_flight: Vec<_> = self.in_flight.lock().drain(..).collect();
        for (_, list) in in_flight {
            self.destroy_list(list);
        }
        for queue in [&self.primaries, &self.secondaries] {
            for list in queue.rx.try_iter() {
                self.destroy_list(list);
            }
        }
        self.device.destroy_timeline(self.timeline);
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("kind", &self.kind)
            .field("timeline", &self.timeline)
            .field("last_submitted", &self.last_submitted_value())
            .field("free", &self.free_count())
            .finish_non_exhaustive()
    }
}
