//! Double-Buffered Frame Scheduler
//!
//! Defines which frame slot the CPU is *building* (`work_frame`) and which
//! slot the GPU is *consuming* (`render_frame`). Every frame-scoped pool
//! writes into the work slot and reads from the render slot; that split is
//! the only thing keeping the CPU from overwriting data the GPU has not read
//! yet.
//!
//! ```text
//!   frame n          advance()          frame n+1
//! ┌──────────┐                        ┌──────────┐
//! │ work = 1 │ ── render = work ───▶  │ work = 2 │
//! │ render=0 │    work = (work+1)%N   │ render=1 │
//! └──────────┘    notify listeners    └──────────┘
//! ```
//!
//! Pools that want to hear about frame boundaries subscribe a callback
//! instead of being known to the scheduler.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Snapshot of the scheduler right after an advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Frames advanced since creation.
    pub frame_number: u64,
    pub work_frame: usize,
    pub render_frame: usize,
}

/// Handle returned by [`FrameScheduler::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type FrameListener = Box<dyn FnMut(&FrameInfo) + Send>;

// ─── Turn gates ──────────────────────────────────────────────────────────────

/// A binary gate: `acquire` blocks until the gate is open and closes it,
/// `release` opens it again.
///
/// A bypassed gate never blocks; single-threaded setups use that.
#[derive(Debug)]
pub struct TurnGate {
    open: Mutex<bool>,
    changed: Condvar,
    bypass: bool,
}

impl TurnGate {
    #[must_use]
    pub fn new(open: bool, bypass: bool) -> Self {
        Self {
            open: Mutex::new(open),
            changed: Condvar::new(),
            bypass,
        }
    }

    pub fn acquire(&self) {
        if self.bypass {
            return;
        }
        let mut open = self.open.lock();
        while !*open {
            self.changed.wait(&mut open);
        }
        *open = false;
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    /// Returns whether the gate was taken.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        if self.bypass {
            return true;
        }
        let mut open = self.open.lock();
        while !*open {
            if self.changed.wait_for(&mut open, timeout).timed_out() && !*open {
                return false;
            }
        }
        *open = false;
        true
    }

    pub fn release(&self) {
        if self.bypass {
            return;
        }
        *self.open.lock() = true;
        self.changed.notify_one();
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.bypass || *self.open.lock()
    }
}

/// The two gates handing a frame from the producer to the submitter.
///
/// Cloneable so a render thread can hold them without borrowing the
/// scheduler.
#[derive(Debug, Clone)]
pub struct FrameGates {
    main: Arc<TurnGate>,
    render: Arc<TurnGate>,
}

impl FrameGates {
    /// Producer: wait until the previous frame's CPU work was consumed.
    pub fn begin_main_turn(&self) {
        self.main.acquire();
    }

    /// Producer: hand the built frame to the submitter.
    pub fn end_main_turn(&self) {
        self.render.release();
    }

    /// Submitter: wait for a built frame.
    pub fn begin_render_turn(&self) {
        self.render.acquire();
    }

    /// Submitter: let the producer start the next frame.
    pub fn end_render_turn(&self) {
        self.main.release();
    }

    #[must_use]
    pub fn main(&self) -> &TurnGate {
        &self.main
    }

    #[must_use]
    pub fn render(&self) -> &TurnGate {
        &self.render
    }
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

pub struct FrameScheduler {
    frame_count: usize,
    work_frame: usize,
    render_frame: usize,
    frame_number: u64,
    listeners: Vec<(ListenerId, FrameListener)>,
    next_listener: u64,
    gates: FrameGates,
}

impl FrameScheduler {
    /// `threaded = false` bypasses both turn gates.
    #[must_use]
    pub fn new(frame_count: usize, threaded: bool) -> Self {
        assert!(frame_count > 0, "frame scheduler needs at least one frame slot");
        let bypass = !threaded;
        Self {
            frame_count,
            work_frame: 0,
            render_frame: 0,
            frame_number: 0,
            listeners: Vec::new(),
            next_listener: 0,
            gates: FrameGates {
                main: Arc::new(TurnGate::new(true, bypass)),
                render: Arc::new(TurnGate::new(false, bypass)),
            },
        }
    }

    /// The slot the CPU is currently writing.
    #[inline]
    #[must_use]
    pub fn work_frame(&self) -> usize {
        self.work_frame
    }

    /// The slot the GPU is currently reading.
    #[inline]
    #[must_use]
    pub fn render_frame(&self) -> usize {
        self.render_frame
    }

    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    #[inline]
    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    #[must_use]
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            frame_number: self.frame_number,
            work_frame: self.work_frame,
            render_frame: self.render_frame,
        }
    }

    #[must_use]
    pub fn gates(&self) -> FrameGates {
        self.gates.clone()
    }

    /// Registers a callback run after every [`advance`](Self::advance), in
    /// subscription order.
    pub fn subscribe(&mut self, listener: impl FnMut(&FrameInfo) + Send + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Returns whether a listener was removed.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _)| *l != id);
        self.listeners.len() != before
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Moves to the next frame: the slot just built becomes the render slot,
    /// the work slot moves on, then listeners run.
    pub fn advance(&mut self) -> FrameInfo {
        self.render_frame = self.work_frame;
        self.work_frame = (self.work_frame + 1) % self.frame_count;
        self.frame_number += 1;

        let info = self.info();
        log::trace!(
            "Frame {} (work slot {}, render slot {})",
            info.frame_number,
            info.work_frame,
            info.render_frame
        );
        for (_, listener) in &mut self.listeners {
            listener(&info);
        }
        info
    }
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("frame_count", &self.frame_count)
            .field("work_frame", &self.work_frame)
            .field("render_frame", &self.render_frame)
            .field("frame_number", &self.frame_number)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}
