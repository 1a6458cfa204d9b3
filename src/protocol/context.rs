use std::{
    io,
    thread::{self, JoinHandle},
};

use log::{debug, warn};
use tokio::{
    runtime::{Builder, Handle},
    sync::oneshot,
};

/// An event loop running on its own named thread.
///
/// The context owns a single-threaded tokio runtime. Components that need to schedule work
/// hold a cloned [`Handle`]; only the context itself can stop the loop and join the thread.
/// Stopping drops every task still on the runtime, which closes their sockets.
#[derive(Debug)]
pub struct IoContext {
    name: String,
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl IoContext {
    pub fn start(name: &str) -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (shutdown, stopped) = oneshot::channel::<()>();

        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!("{thread_name} running");
                runtime.block_on(async {
                    let _ = stopped.await;
                });
                debug!("{thread_name} stopped");
            })?;

        Ok(Self {
            name: name.to_string(),
            handle,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Runs `future` on the I/O thread and blocks the caller until it finishes.
    ///
    /// Returns `None` if the context stopped before the future completed. Must not be called
    /// from the I/O thread itself.
    pub fn run_blocking<F>(&self, future: F) -> Option<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.blocking_recv().ok()
    }

    /// Stops the event loop and joins the thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("{} panicked", self.name);
            }
        }
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use super::*;

    #[test]
    fn runs_work_on_named_thread() {
        let context = IoContext::start("test-io").unwrap();
        let name = context
            .run_blocking(async { thread::current().name().map(str::to_string) })
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-io"));
    }

    #[test]
    fn stop_drops_pending_tasks() {
        let mut context = IoContext::start("test-io").unwrap();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&finished);
        context.handle().spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.store(true, Ordering::SeqCst);
        });

        context.stop();
        assert!(!context.is_running());
        assert!(!finished.load(Ordering::SeqCst));

        // A second stop is a no-op.
        context.stop();
    }

    #[test]
    fn run_blocking_after_stop_returns_none() {
        let mut context = IoContext::start("test-io").unwrap();
        context.stop();
        assert_eq!(context.run_blocking(async { 1 }), None);
    }
}
