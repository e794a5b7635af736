//! Display Context
//!
//! A single tokio task owns the [`FrameRenderer`] and its surface. Producers
//! hand frames over through a one-slot mailbox whose buffer is reused while
//! the frame size is stable, then wake the task. The task never waits on the
//! mailbox lock: if a producer is mid-copy it skips and picks the frame up on
//! the wake-up that producer sends when it is done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use shutter_common::ConvertedFrame;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::{FrameRenderer, SurfaceStatus};

#[derive(Default)]
struct Mailbox {
    frame: ConvertedFrame,
    fresh: bool,
}

struct Shared {
    mailbox: Mutex<Mailbox>,
    wake: Notify,
    clear_requested: AtomicBool,
    closed: AtomicBool,
    status: watch::Sender<SurfaceStatus>,
}

impl Shared {
    fn try_mailbox(&self) -> Option<MutexGuard<'_, Mailbox>> {
        match self.mailbox.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// Cheap, cloneable handle used to marshal work onto the display context.
#[derive(Clone)]
pub struct DisplayHandle {
    shared: Arc<Shared>,
}

impl DisplayHandle {
    /// A handle with no display task behind it.
    ///
    /// Published frames land in the mailbox and are never rendered. Useful for
    /// headless capture.
    pub fn detached() -> Self {
        let (status, _) = watch::channel(SurfaceStatus::default());
        Self {
            shared: Arc::new(Shared {
                mailbox: Mutex::new(Mailbox::default()),
                wake: Notify::new(),
                clear_requested: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                status,
            }),
        }
    }

    /// Queue `frame` for rendering and wake the display task.
    ///
    /// Only the latest frame is kept; an unrendered frame is overwritten.
    pub fn publish(&self, frame: &ConvertedFrame) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }

        {
            let mut mailbox = self
                .shared
                .mailbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if mailbox.frame.has_size(frame.width, frame.height)
                && mailbox.frame.data.len() == frame.data.len()
            {
                mailbox.frame.data.copy_from_slice(&frame.data);
            } else {
                mailbox.frame = frame.clone();
            }
            mailbox.fresh = true;
        }

        self.shared.wake.notify_one();
    }

    /// Drop the current surface, e.g. after the reader was torn down.
    pub fn clear(&self) {
        self.shared.clear_requested.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    /// Latest published surface status.
    pub fn status(&self) -> SurfaceStatus {
        *self.shared.status.borrow()
    }

    /// Subscribe to surface status updates.
    pub fn subscribe(&self) -> watch::Receiver<SurfaceStatus> {
        self.shared.status.subscribe()
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }
}

/// The display-owning task.
pub struct DisplayContext {
    handle: DisplayHandle,
    task: JoinHandle<()>,
}

impl DisplayContext {
    /// Spawn the display task on the current tokio runtime.
    pub fn spawn() -> Self {
        let handle = DisplayHandle::detached();
        let task = tokio::spawn(run(Arc::clone(&handle.shared)));
        info!("Display context started");
        Self { handle, task }
    }

    pub fn handle(&self) -> DisplayHandle {
        self.handle.clone()
    }

    /// Stop the display task and wait for it to exit.
    pub async fn shutdown(self) {
        self.handle.close();
        if let Err(e) = self.task.await {
            debug!(error = %e, "Display task ended abnormally");
        }
        info!("Display context stopped");
    }
}

async fn run(shared: Arc<Shared>) {
    let mut renderer = FrameRenderer::new();

    loop {
        shared.wake.notified().await;
        if shared.closed.load(Ordering::Acquire) {
            break;
        }

        let mut changed = false;

        if shared.clear_requested.swap(false, Ordering::AcqRel) {
            renderer.clear();
            if let Some(mut mailbox) = shared.try_mailbox() {
                mailbox.fresh = false;
            }
            changed = true;
        }

        if let Some(mut mailbox) = shared.try_mailbox() {
            if mailbox.fresh {
                let outcome = renderer.render(&mailbox.frame);
                mailbox.fresh = false;
                trace!(?outcome, "Rendered preview frame");
                changed = true;
            }
        } else {
            trace!("Mailbox busy, waiting for the producer's wake-up");
        }

        if changed {
            shared.status.send_replace(renderer.status());
        }
    }
}
