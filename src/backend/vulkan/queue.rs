//! Fence-driven completion for submitted command buffers.
//!
//! Command lists are recorded and submitted on the caller's thread, in index
//! order, under one lock. A waiter thread then blocks on each fence in the same
//! order, runs the completion handler, and only then marks the list retired.
//! The first failure marks the device lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::{Condvar, Mutex};

use super::conversion::vk_error;
use super::device::DeviceContext;
use super::recorder::{self, Recorded};
use crate::backend::{
    BackendError, BackendResult, CommandList, CompletionHandler, CompletionInfo, SubmissionIndex,
};

struct InFlight {
    index: u64,
    fence: vk::Fence,
    recorded: Recorded,
    commands: CommandList,
    on_complete: Option<CompletionHandler>,
    submitted_at: Instant,
}

#[derive(Default)]
struct Progress {
    retired: u64,
    failures: HashMap<u64, BackendError>,
    lost: bool,
}

#[derive(Default)]
struct Shared {
    progress: Mutex<Progress>,
    retired: Condvar,
}

pub struct Queue {
    context: Arc<DeviceContext>,
    sender: Mutex<Option<mpsc::Sender<InFlight>>>,
    shared: Arc<Shared>,
    submitted: AtomicU64,
    waiter: Mutex<Option<JoinHandle<()>>>,
    waiter_id: ThreadId,
}

impl Queue {
    pub fn new(context: Arc<DeviceContext>) -> BackendResult<Self> {
        let (sender, receiver) = mpsc::channel::<InFlight>();
        let shared = Arc::new(Shared::default());
        let waiter_shared = Arc::clone(&shared);
        let waiter_context = Arc::clone(&context);

        let waiter = thread::Builder::new()
            .name("vulkan-queue".into())
            .spawn(move || run(receiver, waiter_shared, waiter_context))
            .map_err(|e| {
                BackendError::InitializationFailed(format!("failed to spawn queue thread: {e}"))
            })?;
        let waiter_id = waiter.thread().id();

        Ok(Self {
            context,
            sender: Mutex::new(Some(sender)),
            shared,
            submitted: AtomicU64::new(0),
            waiter: Mutex::new(Some(waiter)),
            waiter_id,
        })
    }

    pub fn submit(
        &self,
        commands: CommandList,
        on_complete: Option<CompletionHandler>,
    ) -> BackendResult<SubmissionIndex> {
        if self.shared.progress.lock().lost {
            return Err(BackendError::DeviceLost);
        }
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(BackendError::DeviceLost)?;

        let recorded = recorder::record(&self.context, &commands)?;
        let fence = match unsafe { self.context.device.create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(fence) => fence,
            Err(e) => {
                recorded.release(&self.context);
                return Err(vk_error("create fence", e));
            }
        };

        let command_buffers = [recorded.command_buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
        let result = {
            let queue = self.context.queue.lock();
            unsafe { self.context.device.queue_submit(*queue, &[submit], fence) }
        };
        if let Err(e) = result {
            unsafe { self.context.device.destroy_fence(fence, None) };
            recorded.release(&self.context);
            return Err(vk_error("queue submit", e));
        }

        let index = self.submitted.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!(
            "VulkanBackend: submit #{} {:?} ({} commands)",
            index,
            commands.label(),
            commands.len()
        );
        sender
            .send(InFlight {
                index,
                fence,
                recorded,
                commands,
                on_complete,
                submitted_at: Instant::now(),
            })
            .map_err(|_| BackendError::DeviceLost)?;
        Ok(SubmissionIndex(index))
    }

    pub fn wait(&self, submission: SubmissionIndex) -> BackendResult<()> {
        self.ensure_not_waiter()?;
        let mut progress = self.shared.progress.lock();
        while progress.retired < submission.0 {
            self.shared.retired.wait(&mut progress);
        }
        match progress.failures.remove(&submission.0) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn wait_idle(&self) -> BackendResult<()> {
        self.ensure_not_waiter()?;
        let target = self.submitted.load(Ordering::Acquire);
        let mut progress = self.shared.progress.lock();
        while progress.retired < target {
            self.shared.retired.wait(&mut progress);
        }
        if progress.lost {
            return Err(BackendError::DeviceLost);
        }
        Ok(())
    }

    fn ensure_not_waiter(&self) -> BackendResult<()> {
        if thread::current().id() == self.waiter_id {
            return Err(BackendError::InvalidParameter(
                "cannot wait on the queue from a completion handler".into(),
            ));
        }
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.sender.lock().take();
        if thread::current().id() == self.waiter_id {
            return;
        }
        if let Some(waiter) = self.waiter.lock().take() {
            if waiter.join().is_err() {
                log::error!("VulkanBackend: queue thread panicked");
            }
        }
    }
}

/// Device time between the two timestamps of a retired command buffer.
fn gpu_time(context: &DeviceContext, pool: vk::QueryPool) -> Option<Duration> {
    let period = context.properties.timestamp_period?;
    let mut ticks = [0u64; 2];
    unsafe {
        context.device.get_query_pool_results(
            pool,
            0,
            &mut ticks,
            vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
        )
    }
    .ok()?;
    let nanos = ticks[1].saturating_sub(ticks[0]) as f64 * f64::from(period);
    Some(Duration::from_nanos(nanos as u64))
}

fn run(receiver: mpsc::Receiver<InFlight>, shared: Arc<Shared>, context: Arc<DeviceContext>) {
    for job in receiver {
        let result = unsafe { context.device.wait_for_fences(&[job.fence], true, u64::MAX) }
            .map_err(|e| vk_error("wait for fence", e));
        let elapsed = job.submitted_at.elapsed();

        if let Err(error) = &result {
            log::error!(
                "VulkanBackend: submission #{} {:?} failed: {}",
                job.index,
                job.commands.label(),
                error
            );
        }

        let gpu_time = match (&result, job.recorded.timestamps) {
            (Ok(()), Some(pool)) => gpu_time(&context, pool).unwrap_or(elapsed),
            _ => elapsed,
        };
        let info = CompletionInfo {
            submission: SubmissionIndex(job.index),
            gpu_time,
            error: result.as_ref().err().cloned(),
        };

        unsafe { context.device.destroy_fence(job.fence, None) };
        job.recorded.release(&context);
        drop(job.commands);
        if let Some(handler) = job.on_complete {
            handler(&info);
        }

        let mut progress = shared.progress.lock();
        progress.retired = job.index;
        if let Err(error) = result {
            progress.lost = true;
            progress.failures.insert(job.index, error);
        }
        drop(progress);
        shared.retired.notify_all();
    }
}
