use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::thread::JoinHandle;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Serial thread that owns every native call of one engine.
pub(crate) struct NativeWorker {
    sender: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl NativeWorker {
    pub(crate) fn spawn(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = channel::<Job>();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!("native worker job panicked");
                    }
                }
                tracing::debug!("native worker exiting");
            })?;
        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    /// Queues `job`. Hands it back when the worker is gone.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    /// Drains queued jobs and joins the thread.
    pub(crate) fn shutdown(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("native worker thread panicked");
            }
        }
    }
}

impl Drop for NativeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_jobs_in_order_and_survives_panics() {
        let mut worker = NativeWorker::spawn("test-worker").expect("spawn");
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = Arc::clone(&seen);
            assert!(worker
                .submit(Box::new(move || seen.lock().unwrap().push(i)))
                .is_ok());
        }
        assert!(worker.submit(Box::new(|| panic!("boom"))).is_ok());
        let after = Arc::new(AtomicUsize::new(0));
        let marker = Arc::clone(&after);
        assert!(worker
            .submit(Box::new(move || {
                marker.fetch_add(1, Ordering::SeqCst);
            }))
            .is_ok());

        worker.shutdown();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert!(worker.submit(Box::new(|| {})).is_err());
    }
}
