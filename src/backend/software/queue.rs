//! In-order submission queue.
//!
//! A single worker thread drains command lists in submission order. Each list's
//! completion handler runs on the worker before the list is marked retired, so a
//! caller returning from [`Queue::wait`] observes the handler's side effects.
//! The first execution error marks the device lost; later lists are failed
//! without executing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::backend::{
    BackendError, BackendResult, CommandList, CompletionHandler, CompletionInfo, SubmissionIndex,
};

pub(crate) type Executor = Box<dyn Fn(&CommandList) -> BackendResult<()> + Send + 'static>;

struct Job {
    index: u64,
    commands: CommandList,
    on_complete: Option<CompletionHandler>,
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

pub(crate) struct Queue {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    shared: Arc<Shared>,
    submitted: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl Queue {
    pub fn new(executor: Executor) -> BackendResult<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);

        let worker = thread::Builder::new()
            .name("software-queue".into())
            .spawn(move || run(receiver, worker_shared, executor))
            .map_err(|e| {
                BackendError::InitializationFailed(format!("failed to spawn queue thread: {e}"))
            })?;
        let worker_id = worker.thread().id();

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            shared,
            submitted: AtomicU64::new(0),
            worker: Mutex::new(Some(worker)),
            worker_id,
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
        let index = self.submitted.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!(
            "SoftwareBackend: submit #{} {:?} ({} commands)",
            index,
            commands.label(),
            commands.len()
        );
        sender
            .send(Job {
                index,
                commands,
                on_complete,
            })
            .map_err(|_| BackendError::DeviceLost)?;
        Ok(SubmissionIndex(index))
    }

    pub fn wait(&self, submission: SubmissionIndex) -> BackendResult<()> {
        self.ensure_not_worker()?;
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
        self.ensure_not_worker()?;
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

    fn ensure_not_worker(&self) -> BackendResult<()> {
        if thread::current().id() == self.worker_id {
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
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("SoftwareBackend: queue thread panicked");
            }
        }
    }
}

fn run(receiver: mpsc::Receiver<Job>, shared: Arc<Shared>, executor: Executor) {
    for job in receiver {
        let lost = shared.progress.lock().lost;
        let start = Instant::now();
        let result = if lost {
            Err(BackendError::DeviceLost)
        } else {
            executor(&job.commands)
        };
        let gpu_time = start.elapsed();

        if let Err(error) = &result {
            log::error!(
                "SoftwareBackend: submission #{} {:?} failed: {}",
                job.index,
                job.commands.label(),
                error
            );
        }

        let info = CompletionInfo {
            submission: SubmissionIndex(job.index),
            gpu_time,
            error: result.as_ref().err().cloned(),
        };
        // Release resources held by the list before signalling completion.
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_queue(fail_on: Option<&'static str>) -> (Queue, Arc<AtomicUsize>) {
        let executed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executed);
        let queue = Queue::new(Box::new(move |list: &CommandList| {
            counter.fetch_add(1, Ordering::SeqCst);
            match (fail_on, list.label()) {
                (Some(fail), Some(label)) if fail == label => {
                    Err(BackendError::ExecutionFailed("boom".into()))
                }
                _ => Ok(()),
            }
        }))
        .unwrap();
        (queue, executed)
    }

    #[test]
    fn lists_retire_in_order_with_handlers() {
        let (queue, executed) = counting_queue(None);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut last = None;
        for i in 0..5u64 {
            let order = Arc::clone(&order);
            last = Some(
                queue
                    .submit(
                        CommandList::new(format!("list{i}")),
                        Some(Box::new(move |info: &CompletionInfo| {
                            assert!(info.error.is_none());
                            order.lock().push(info.submission.value());
                        })),
                    )
                    .unwrap(),
            );
        }
        queue.wait(last.unwrap()).unwrap();

        assert_eq!(*order.lock(), vec![1, 2, 3, 4, 5]);
        assert_eq!(executed.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn failure_loses_device() {
        let (queue, _) = counting_queue(Some("bad"));
        let bad = queue.submit(CommandList::new("bad"), None).unwrap();
        assert!(matches!(
            queue.wait(bad),
            Err(BackendError::ExecutionFailed(_))
        ));
        assert!(matches!(
            queue.submit(CommandList::new("next"), None),
            Err(BackendError::DeviceLost)
        ));
        assert!(matches!(queue.wait_idle(), Err(BackendError::DeviceLost)));
    }
}
