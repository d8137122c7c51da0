//! Fork-Join Draw Recording
//!
//! Small batches are recorded inline into the primary command list. Batches
//! at or above the threshold are split into contiguous, evenly sized
//! partitions; each worker records its partition into its own secondary
//! list that inherits the pass's attachment formats and viewport. After all
//! workers join, the primary executes the secondaries in partition order with
//! a single call.
//!
//! ```text
//!  items: [ 0 .. 250 )        workers = 4
//!
//!  worker 0: [  0,  63) ─▶ secondary 0 ─┐
//!  worker 1: [ 63, 126) ─▶ secondary 1 ─┤
//!  worker 2: [126, 189) ─▶ secondary 2 ─┼─▶ primary: ExecuteSecondary[0,1,2,3]
//!  worker 3: [189, 250) ─▶ secondary 3 ─┘
//! ```
//!
//! Order inside a partition is program order. Each draw must carry all of
//! its own state; nothing set by a sibling partition is visible.

use smallvec::SmallVec;

use super::queue::{CommandList, CommandQueue};
use super::tracked::{CommandRecorder, TrackedCommandList};
use crate::backend::{Command, CommandBufferLevel, RenderingInfo};
use crate::errors::Result;
use crate::frame::FrameStats;

/// How a batch ended up being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    Inline,
    Parallel { partitions: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct ParallelRecorder {
    threshold: usize,
    workers: usize,
}

impl ParallelRecorder {
    #[must_use]
    pub fn new(threshold: usize, workers: usize) -> Self {
        Self {
            threshold,
            workers: workers.max(1),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Records one rendering pass over `items` into `primary`.
    ///
    /// `record` is called once per item with a recorder positioned inside the
    /// pass. It runs on worker threads when the batch is split.
    pub fn record_batch<T, F>(
        &self,
        queue: &CommandQueue,
        primary: &mut CommandList,
        pass: &RenderingInfo,
        items: &[T],
        stats: Option<&FrameStats>,
        record: F,
    ) -> Result<BatchMode>
    where
        T: Sync,
        F: Fn(&mut dyn CommandRecorder, &T) + Sync,
    {
        let device = queue.device().as_ref();

        if items.is_empty() || items.len() < self.threshold || self.workers == 1 {
            let mut info = pass.clone();
            info.secondary_contents = false;
            device.record(primary.buffer(), Command::BeginRendering(info));

            let mut list = TrackedCommandList::new(device, primary.buffer());
            if let Some(stats) = stats {
                list = list.with_stats(stats);
            }
            list.set_viewport(pass.viewport);
            list.set_scissor(pass.scissor);
            for item in items {
                record(&mut list, item);
            }
            list.record_raw(Command::EndRendering);
            return Ok(BatchMode::Inline);
        }

        let inheritance = pass.inheritance();
        let chunk_size = items.len().div_ceil(self.workers);

        let results: Vec<Result<CommandList>> = std::thread::scope(|scope| {
            let handles: Vec<_> = items
                .chunks(chunk_size)
                .map(|chunk| {
                    let inheritance = &inheritance;
                    let record = &record;
                    scope.spawn(move || -> Result<CommandList> {
                        let secondary =
                            queue.get_command_list(CommandBufferLevel::Secondary, Some(inheritance))?;
                        {
                            let mut list = TrackedCommandList::new(device, secondary.buffer());
                            if let Some(stats) = stats {
                                list = list.with_stats(stats);
                            }
                            list.set_viewport(inheritance.viewport);
                            list.set_scissor(inheritance.scissor);
                            for item in chunk {
                                record(&mut list, item);
                            }
                        }
                        if let Err(err) = queue.end_command_list(&secondary) {
                            queue.free_command_list(secondary);
                            return Err(err);
                        }
                        Ok(secondary)
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut secondaries = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(list) => secondaries.push(list),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            log::error!("Parallel recording failed: {err}");
            for list in secondaries {
                queue.free_command_list(list);
            }
            return Err(err);
        }

        let partitions = secondaries.len();
        log::debug!("Recorded {} draws across {partitions} secondary lists", items.len());

        let mut info = pass.clone();
        info.secondary_contents = true;
        device.record(primary.buffer(), Command::BeginRendering(info));
        let handles: SmallVec<[_; 8]> = secondaries.iter().map(CommandList::buffer).collect();
        device.record(primary.buffer(), Command::ExecuteSecondary(handles));
        device.record(primary.buffer(), Command::EndRendering);
        primary.attach_secondaries(secondaries);

        Ok(BatchMode::Parallel { partitions })
    }
}
