//! Frame Reader Controller
//!
//! Owns the single active frame reader of a session and serializes its
//! replacement.
//!
//! The active reader lives in a slot shared with the frame callback. The
//! callback holds the slot lock for as long as it converts and publishes a
//! frame. Teardown only ever *tries* the lock: while a callback is publishing,
//! teardown returns [`TeardownOutcome::Contended`] and the caller retries.
//! Once the slot is claimed the reader is moved out and stopped with the lock
//! released, so a reader is stopped and released exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError, Weak};
use std::time::Duration;

use shutter_common::{FormatDescriptor, RawFrameBuffer, SessionState};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::convert::Nv12ToBgrConverter;
use super::device::{
    CaptureDevice, FrameCallback, FrameReader, FrameSource, ReaderStartStatus, SourceKind,
};
use super::CaptureError;
use crate::display::DisplayHandle;

/// Timing knobs of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Pause between teardown and the next start, lets in-flight frame
    /// callbacks drain.
    pub settle_delay: Duration,
    /// Extra teardown attempts when a frame callback holds the slot.
    pub teardown_retries: u32,
    /// Pause between contended teardown attempts.
    pub teardown_retry_interval: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(50),
            teardown_retries: 5,
            teardown_retry_interval: Duration::from_millis(10),
        }
    }
}

/// Result of a single teardown attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// The active reader was stopped and released.
    Released,
    /// There was no active reader; buffers were reset anyway.
    NoReader,
    /// A frame callback holds the slot. Nothing changed; retry later.
    Contended,
}

/// Frame counters since the controller was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    /// Frames converted and handed to the display.
    pub delivered: u64,
    /// Frames discarded (stale reader or unconvertible data).
    pub dropped: u64,
}

/// Preview frame size, unset until the first frame of a reader arrives.
#[derive(Debug, Default)]
pub(crate) struct PreviewDimensions(AtomicU64);

impl PreviewDimensions {
    /// Known, non-zero preview size.
    pub(crate) fn get(&self) -> Option<(u32, u32)> {
        let packed = self.0.load(Ordering::Acquire);
        let (width, height) = ((packed >> 32) as u32, packed as u32);
        (width != 0 && height != 0).then_some((width, height))
    }

    pub(crate) fn set(&self, width: u32, height: u32) {
        self.0
            .store((u64::from(width) << 32) | u64::from(height), Ordering::Release);
    }

    fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

struct ActiveReader {
    id: u64,
    source_id: String,
    format: FormatDescriptor,
    reader: Box<dyn FrameReader>,
}

struct ReaderSlot {
    active: Option<ActiveReader>,
    converter: Nv12ToBgrConverter,
}

enum Claim {
    Claimed(ActiveReader),
    Empty,
    Contended,
}

/// State shared between the controller and the frame callbacks.
struct Pipeline {
    slot: Mutex<ReaderSlot>,
    dimensions: Arc<PreviewDimensions>,
    display: DisplayHandle,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Pipeline {
    /// Arrival-context entry point. Holds the slot for the whole publish.
    fn on_frame(&self, reader_id: u64, raw: &RawFrameBuffer<'_>) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        if slot.active.as_ref().map(|active| active.id) != Some(reader_id) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match slot.converter.convert(raw) {
            Ok(frame) => {
                if self.dimensions.get() != Some((frame.width, frame.height)) {
                    debug!(
                        reader = reader_id,
                        width = frame.width,
                        height = frame.height,
                        "Preview dimensions set"
                    );
                    self.dimensions.set(frame.width, frame.height);
                }
                self.display.publish(frame);
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(reader = reader_id, error = %e, "Dropping unconvertible frame");
            }
        }
    }

    /// Move the active reader out of the slot without waiting for the lock.
    fn claim(&self) -> Claim {
        let mut slot = match self.slot.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Claim::Contended,
        };

        let active = slot.active.take();
        slot.converter.reset();
        self.dimensions.clear();

        match active {
            Some(active) => Claim::Claimed(active),
            None => Claim::Empty,
        }
    }

    /// Make `active` the current reader, returning whatever it displaced.
    fn install(&self, active: ActiveReader) -> Option<ActiveReader> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.active.replace(active)
    }

    fn active_format(&self) -> Option<FormatDescriptor> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.active.as_ref().map(|active| active.format.clone())
    }
}

fn frame_callback(pipeline: Weak<Pipeline>, reader_id: u64) -> FrameCallback {
    Arc::new(move |raw: &RawFrameBuffer<'_>| {
        if let Some(pipeline) = pipeline.upgrade() {
            pipeline.on_frame(reader_id, raw);
        }
    })
}

/// Clears the in-progress flag when dropped, whatever the restart outcome.
struct RestartGuard<'a>(&'a AtomicBool);

impl<'a> RestartGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum SourceAttempt {
    Started(Box<dyn FrameReader>),
    FormatRejected(CaptureError),
    CreateFailed(CaptureError),
    StartFailed(ReaderStartStatus),
}

/// Apply `format`, create a reader and start it. A reader that fails to
/// start is stopped and released before returning.
fn start_on_source(
    source: &dyn FrameSource,
    format: &FormatDescriptor,
    callback: FrameCallback,
) -> SourceAttempt {
    if let Err(e) = source.set_format(format) {
        return SourceAttempt::FormatRejected(e);
    }

    let mut reader = match source.create_reader(&format.subtype, callback) {
        Ok(reader) => reader,
        Err(e) => return SourceAttempt::CreateFailed(e),
    };

    let status = reader.start();
    if status.is_success() {
        return SourceAttempt::Started(reader);
    }

    reader.stop();
    drop(reader);
    SourceAttempt::StartFailed(status)
}

async fn release(reader: Box<dyn FrameReader>) {
    let mut reader = reader;
    let stopped = tokio::task::spawn_blocking(move || {
        reader.stop();
        drop(reader);
    })
    .await;

    if let Err(e) = stopped {
        error!(error = %e, "Frame reader panicked while stopping");
    }
}

/// Starts, stops and replaces the frame reader of one device.
pub struct FrameReaderController {
    device: Arc<dyn CaptureDevice>,
    pipeline: Arc<Pipeline>,
    config: ReaderConfig,
    restart_in_progress: AtomicBool,
    next_reader_id: AtomicU64,
    state: watch::Sender<SessionState>,
}

impl FrameReaderController {
    pub(crate) fn new(
        device: Arc<dyn CaptureDevice>,
        display: DisplayHandle,
        dimensions: Arc<PreviewDimensions>,
        config: ReaderConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            device,
            pipeline: Arc::new(Pipeline {
                slot: Mutex::new(ReaderSlot {
                    active: None,
                    converter: Nv12ToBgrConverter::new(),
                }),
                dimensions,
                display,
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            config,
            restart_in_progress: AtomicBool::new(false),
            next_reader_id: AtomicU64::new(1),
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether a preview restart is currently running.
    pub fn is_restarting(&self) -> bool {
        self.restart_in_progress.load(Ordering::Acquire)
    }

    /// Format of the active reader, if any.
    pub fn active_format(&self) -> Option<FormatDescriptor> {
        self.pipeline.active_format()
    }

    pub fn frame_counters(&self) -> FrameCounters {
        FrameCounters {
            delivered: self.pipeline.delivered.load(Ordering::Relaxed),
            dropped: self.pipeline.dropped.load(Ordering::Relaxed),
        }
    }

    /// Replace the active reader with one streaming `format`.
    ///
    /// Rejected with [`CaptureError::RestartRejected`] while another restart
    /// is running. On failure no reader is left active.
    #[tracing::instrument(skip(self, format), fields(format = %format))]
    pub async fn request_preview(&self, format: &FormatDescriptor) -> Result<(), CaptureError> {
        if self.state().is_terminal() {
            return Err(CaptureError::Disposed);
        }

        let Some(_guard) = RestartGuard::try_acquire(&self.restart_in_progress) else {
            warn!("Preview request rejected, restart already in progress");
            return Err(CaptureError::RestartRejected);
        };

        self.teardown_with_retry().await?;
        tokio::time::sleep(self.config.settle_delay).await;

        if self.state().is_terminal() {
            return Err(CaptureError::Disposed);
        }

        self.transition(SessionState::Negotiating);
        match self.negotiate(format).await {
            Ok(()) => {
                self.transition(SessionState::Previewing);
                Ok(())
            }
            Err(e) => {
                self.transition(SessionState::Idle);
                warn!(error = %e, "Preview negotiation failed");
                Err(e)
            }
        }
    }

    /// Stop the active reader. Rejected while a restart is running.
    #[tracing::instrument(skip(self))]
    pub async fn stop_preview(&self) -> Result<(), CaptureError> {
        if self.state().is_terminal() {
            return Err(CaptureError::Disposed);
        }

        let Some(_guard) = RestartGuard::try_acquire(&self.restart_in_progress) else {
            warn!("Stop rejected, restart in progress");
            return Err(CaptureError::RestartRejected);
        };

        self.teardown_with_retry().await.map(|_| ())
    }

    /// One teardown attempt.
    ///
    /// Returns [`TeardownOutcome::Contended`] without side effects when a
    /// frame callback is publishing; the caller is expected to retry.
    pub async fn teardown(&self) -> TeardownOutcome {
        match self.pipeline.claim() {
            Claim::Contended => {
                debug!("Frame callback in flight, teardown deferred");
                TeardownOutcome::Contended
            }
            Claim::Empty => TeardownOutcome::NoReader,
            Claim::Claimed(active) => {
                self.transition(SessionState::Restarting);
                info!(
                    reader = active.id,
                    source = %active.source_id,
                    format = %active.format,
                    "Stopping frame reader"
                );
                release(active.reader).await;
                self.pipeline.display.clear();
                self.transition(SessionState::Idle);
                TeardownOutcome::Released
            }
        }
    }

    /// Tear down unconditionally and move to `Disposed`.
    ///
    /// Returns `false` if the controller was already disposed.
    pub async fn dispose(&self) -> bool {
        let previous = self.state.send_replace(SessionState::Disposed);
        if previous.is_terminal() {
            return false;
        }

        info!(previous = %previous, "Disposing frame reader controller");
        self.teardown_until_claimed().await;
        self.pipeline.display.clear();
        true
    }

    async fn teardown_with_retry(&self) -> Result<TeardownOutcome, CaptureError> {
        for attempt in 0..=self.config.teardown_retries {
            match self.teardown().await {
                TeardownOutcome::Contended => {
                    debug!(attempt, "Teardown contended, retrying");
                    tokio::time::sleep(self.config.teardown_retry_interval).await;
                }
                outcome => return Ok(outcome),
            }
        }

        warn!(
            retries = self.config.teardown_retries,
            "Teardown still contended, giving up"
        );
        Err(CaptureError::TeardownContended)
    }

    async fn teardown_until_claimed(&self) {
        while self.teardown().await == TeardownOutcome::Contended {
            tokio::time::sleep(self.config.teardown_retry_interval).await;
        }
    }

    /// Try each colour source in order; the first one that starts wins.
    async fn negotiate(&self, format: &FormatDescriptor) -> Result<(), CaptureError> {
        let mut matched = false;

        for source in self.device.sources() {
            if source.kind() != SourceKind::Color {
                continue;
            }

            let Some(candidate) = source
                .supported_formats()
                .into_iter()
                .find(|supported| supported == format)
            else {
                continue;
            };
            matched = true;

            let reader_id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
            let callback = frame_callback(Arc::downgrade(&self.pipeline), reader_id);
            let attempt_source = Arc::clone(&source);
            let attempt_format = candidate.clone();

            let attempt = tokio::task::spawn_blocking(move || {
                start_on_source(attempt_source.as_ref(), &attempt_format, callback)
            })
            .await;

            let attempt = match attempt {
                Ok(attempt) => attempt,
                Err(e) => {
                    error!(source = %source.id(), error = %e, "Reader start panicked");
                    continue;
                }
            };

            match attempt {
                SourceAttempt::Started(reader) => {
                    let active = ActiveReader {
                        id: reader_id,
                        source_id: source.id().to_string(),
                        format: candidate,
                        reader,
                    };
                    if let Some(displaced) = self.pipeline.install(active) {
                        warn!(reader = displaced.id, "Replacing a reader that was never torn down");
                        release(displaced.reader).await;
                    }

                    if self.state().is_terminal() {
                        self.teardown_until_claimed().await;
                        return Err(CaptureError::Disposed);
                    }

                    info!(reader = reader_id, source = %source.id(), "Frame reader started");
                    return Ok(());
                }
                SourceAttempt::FormatRejected(e) => {
                    warn!(source = %source.id(), error = %e, "Source rejected format");
                }
                SourceAttempt::CreateFailed(e) => {
                    warn!(source = %source.id(), error = %e, "Failed to create frame reader");
                }
                SourceAttempt::StartFailed(status) => {
                    warn!(source = %source.id(), ?status, "Frame reader failed to start, released");
                }
            }
        }

        if matched {
            Err(CaptureError::ReaderStartFailed(format.to_string()))
        } else {
            Err(CaptureError::FormatUnsupported(format.to_string()))
        }
    }

    fn transition(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            debug!(from = %state, to = %next, "Session state transition");
            *state = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use shutter_common::nv12_len;

    use super::*;
    use crate::capture::synthetic::{SyntheticCamera, SyntheticSource};

    fn fast_config() -> ReaderConfig {
        ReaderConfig {
            settle_delay: Duration::from_millis(1),
            teardown_retries: 3,
            teardown_retry_interval: Duration::from_millis(1),
        }
    }

    fn controller(camera: &Arc<SyntheticCamera>, config: ReaderConfig) -> FrameReaderController {
        let device: Arc<dyn CaptureDevice> = camera.clone();
        FrameReaderController::new(
            device,
            DisplayHandle::detached(),
            Arc::new(PreviewDimensions::default()),
            config,
        )
    }

    fn vga_camera() -> Arc<SyntheticCamera> {
        Arc::new(SyntheticCamera::new("cam", "Camera").with_source(SyntheticSource::color(
            "color-0",
            vec![FormatDescriptor::nv12(640, 480, 30)],
        )))
    }

    fn gray_frame(width: u32, height: u32) -> Vec<u8> {
        vec![128u8; nv12_len(width, height)]
    }

    fn raw(data: &[u8], width: u32, height: u32) -> RawFrameBuffer<'_> {
        RawFrameBuffer {
            data,
            width,
            height,
            subtype: "NV12",
        }
    }

    #[tokio::test]
    async fn preview_starts_first_matching_colour_source() {
        let camera = Arc::new(
            SyntheticCamera::new("cam", "Camera")
                .with_source(SyntheticSource::new(
                    "depth",
                    SourceKind::Depth,
                    vec![FormatDescriptor::nv12(640, 480, 30)],
                ))
                .with_source(SyntheticSource::color(
                    "color-a",
                    vec![FormatDescriptor::nv12(640, 480, 30)],
                ))
                .with_source(SyntheticSource::color(
                    "color-b",
                    vec![FormatDescriptor::nv12(640, 480, 30)],
                )),
        );
        let controller = controller(&camera, fast_config());

        controller
            .request_preview(&FormatDescriptor::new(640, 480, 30, "nv12"))
            .await
            .unwrap();

        assert_eq!(controller.state(), SessionState::Previewing);
        assert_eq!(camera.running_sources(), vec!["color-a".to_string()]);
        assert_eq!(camera.stats().started, 1);
    }

    #[tokio::test]
    async fn negotiation_falls_through_failing_sources() {
        let camera = Arc::new(
            SyntheticCamera::new("cam", "Camera")
                .with_source(
                    SyntheticSource::color("rejects", vec![FormatDescriptor::nv12(640, 480, 30)])
                        .rejecting_formats(),
                )
                .with_source(
                    SyntheticSource::color("no-start", vec![FormatDescriptor::nv12(640, 480, 30)])
                        .failing_start(ReaderStartStatus::DeviceNotAvailable),
                )
                .with_source(SyntheticSource::color(
                    "works",
                    vec![FormatDescriptor::nv12(640, 480, 30)],
                )),
        );
        let controller = controller(&camera, fast_config());

        controller
            .request_preview(&FormatDescriptor::nv12(640, 480, 30))
            .await
            .unwrap();

        assert_eq!(camera.running_sources(), vec!["works".to_string()]);
        let stats = camera.stats();
        assert_eq!(stats.created, 2);
        // The reader that failed to start was stopped and released
        assert_eq!(stats.stop_calls, 1);
        assert_eq!(stats.released, 1);
    }

    #[tokio::test]
    async fn unknown_format_is_unsupported_and_leaves_idle() {
        let camera = vga_camera();
        let controller = controller(&camera, fast_config());

        let err = controller
            .request_preview(&FormatDescriptor::nv12(1920, 1080, 30))
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::FormatUnsupported(_)));
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(controller.active_format().is_none());
        assert_eq!(camera.stats().created, 0);
    }

    #[tokio::test]
    async fn all_sources_failing_releases_every_reader() {
        let camera = Arc::new(
            SyntheticCamera::new("cam", "Camera")
                .with_source(
                    SyntheticSource::color("a", vec![FormatDescriptor::nv12(640, 480, 30)])
                        .failing_start(ReaderStartStatus::UnknownFailure),
                )
                .with_source(
                    SyntheticSource::color("b", vec![FormatDescriptor::nv12(640, 480, 30)])
                        .failing_start(ReaderStartStatus::ExclusiveControlNotAvailable),
                ),
        );
        let controller = controller(&camera, fast_config());

        let err = controller
            .request_preview(&FormatDescriptor::nv12(640, 480, 30))
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::ReaderStartFailed(_)));
        assert_eq!(controller.state(), SessionState::Idle);
        let stats = camera.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.released, 2);
        assert!(camera.running_sources().is_empty());

        // The in-progress flag was cleared by the failed attempt
        assert!(!controller.is_restarting());
    }

    #[tokio::test]
    async fn second_request_during_restart_is_rejected() {
        let camera = vga_camera();
        let controller = Arc::new(controller(
            &camera,
            ReaderConfig {
                settle_delay: Duration::from_millis(200),
                ..fast_config()
            },
        ));

        let first = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .request_preview(&FormatDescriptor::nv12(640, 480, 30))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(controller.is_restarting());

        let second = controller
            .request_preview(&FormatDescriptor::nv12(640, 480, 30))
            .await;
        assert_eq!(second, Err(CaptureError::RestartRejected));
        assert_eq!(
            controller.stop_preview().await,
            Err(CaptureError::RestartRejected)
        );

        first.await.unwrap().unwrap();
        assert_eq!(controller.state(), SessionState::Previewing);
        assert_eq!(camera.stats().started, 1);
    }

    #[tokio::test]
    async fn restart_replaces_reader() {
        let camera = Arc::new(SyntheticCamera::new("cam", "Camera").with_source(
            SyntheticSource::color(
                "color-0",
                vec![
                    FormatDescriptor::nv12(640, 480, 30),
                    FormatDescriptor::nv12(1280, 720, 30),
                ],
            ),
        ));
        let controller = controller(&camera, fast_config());

        controller
            .request_preview(&FormatDescriptor::nv12(640, 480, 30))
            .await
            .unwrap();
        controller
            .request_preview(&FormatDescriptor::nv12(1280, 720, 30))
            .await
            .unwrap();

        assert_eq!(
            controller.active_format(),
            Some(FormatDescriptor::nv12(1280, 720, 30))
        );
        let stats = camera.stats();
        assert_eq!(stats.started, 2);
        assert_eq!(stats.stop_calls, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(camera.running_sources().len(), 1);
    }

    #[tokio::test]
    async fn teardown_defers_while_callback_publishes() {
        let camera = vga_camera();
        let controller = controller(&camera, fast_config());
        controller
            .request_preview(&FormatDescriptor::nv12(640, 480, 30))
            .await
            .unwrap();

        {
            // Simulate a frame callback in the middle of publishing
            let _publishing = controller.pipeline.slot.lock().unwrap();
            assert_eq!(controller.teardown().await, TeardownOutcome::Contended);
            assert_eq!(controller.state(), SessionState::Previewing);
            assert_eq!(camera.stats().stop_calls, 0);
        }

        assert_eq!(controller.teardown().await, TeardownOutcome::Released);
        assert_eq!(controller.teardown().await, TeardownOutcome::NoReader);
        assert_eq!(controller.state(), SessionState::Idle);

        let stats = camera.stats();
        assert_eq!(stats.stop_calls, 1);
        assert_eq!(stats.released, 1);
    }

    #[tokio::test]
    async fn contended_stop_gives_up_after_retries() {
        let camera = vga_camera();
        let controller = controller(&camera, fast_config());
        controller
            .request_preview(&FormatDescriptor::nv12(640, 480, 30))
            .await
            .unwrap();

        let publishing = controller.pipeline.slot.lock().unwrap();
        assert_eq!(
            controller.stop_preview().await,
            Err(CaptureError::TeardownContended)
        );
        drop(publishing);

        assert_eq!(controller.state(), SessionState::Previewing);
        assert!(!controller.is_restarting());
        controller.stop_preview().await.unwrap();
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn teardown_racing_frames_stops_reader_once() {
        let camera = vga_camera();
        let controller = controller(&camera, fast_config());
        controller
            .request_preview(&FormatDescriptor::nv12(640, 480, 30))
            .await
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let pump = {
            let camera = Arc::clone(&camera);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let data = gray_frame(640, 480);
                while !stop.load(Ordering::Relaxed) {
                    camera.inject(&raw(&data, 640, 480));
                }
            })
        };

        // Let a few frames through before racing the teardown
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut released = 0;
        for _ in 0..200 {
            if controller.teardown().await == TeardownOutcome::Released {
                released += 1;
            }
        }

        stop.store(true, Ordering::Relaxed);
        pump.join().unwrap();

        assert_eq!(released, 1);
        let stats = camera.stats();
        assert_eq!(stats.stop_calls, 1);
        assert_eq!(stats.released, 1);
        assert!(controller.pipeline.dimensions.get().is_none());
    }

    #[tokio::test]
    async fn frames_set_dimensions_until_teardown() {
        let camera = vga_camera();
        let dimensions = Arc::new(PreviewDimensions::default());
        let device: Arc<dyn CaptureDevice> = camera.clone();
        let controller = FrameReaderController::new(
            device,
            DisplayHandle::detached(),
            Arc::clone(&dimensions),
            fast_config(),
        );
        controller
            .request_preview(&FormatDescriptor::nv12(640, 480, 30))
            .await
            .unwrap();
        assert_eq!(dimensions.get(), None);

        let data = gray_frame(640, 480);
        assert_eq!(camera.inject(&raw(&data, 640, 480)), 1);
        assert_eq!(dimensions.get(), Some((640, 480)));
        assert_eq!(controller.frame_counters().delivered, 1);

        controller.stop_preview().await.unwrap();
        assert_eq!(dimensions.get(), None);
    }

    #[tokio::test]
    async fn bad_frames_are_dropped() {
        let camera = vga_camera();
        let controller = controller(&camera, fast_config());
        controller
            .request_preview(&FormatDescriptor::nv12(640, 480, 30))
            .await
            .unwrap();

        let short = vec![0u8; 16];
        camera.inject(&raw(&short, 640, 480));
        assert_eq!(
            controller.frame_counters(),
            FrameCounters {
                delivered: 0,
                dropped: 1
            }
        );
    }

    #[tokio::test]
    async fn dispose_is_terminal() {
        let camera = vga_camera();
        let controller = controller(&camera, fast_config());
        controller
            .request_preview(&FormatDescriptor::nv12(640, 480, 30))
            .await
            .unwrap();

        assert!(controller.dispose().await);
        assert!(!controller.dispose().await);
        assert_eq!(controller.state(), SessionState::Disposed);
        assert_eq!(camera.stats().released, 1);
        assert_eq!(
            controller
                .request_preview(&FormatDescriptor::nv12(640, 480, 30))
                .await,
            Err(CaptureError::Disposed)
        );
        assert_eq!(controller.stop_preview().await, Err(CaptureError::Disposed));
    }

    #[test]
    fn preview_dimensions_pack_and_clear() {
        let dimensions = PreviewDimensions::default();
        assert_eq!(dimensions.get(), None);
        dimensions.set(1920, 1080);
        assert_eq!(dimensions.get(), Some((1920, 1080)));
        dimensions.clear();
        assert_eq!(dimensions.get(), None);
    }

    #[test]
    fn preview_dimensions_with_a_zero_side_are_unknown() {
        let dimensions = PreviewDimensions::default();
        dimensions.set(0, 480);
        assert_eq!(dimensions.get(), None);
        dimensions.set(640, 0);
        assert_eq!(dimensions.get(), None);
    }

    #[tokio::test]
    async fn rejected_frames_leave_dimensions_unknown() {
        let camera = vga_camera();
        let controller = controller(&camera, fast_config());
        controller
            .request_preview(&FormatDescriptor::nv12(640, 480, 30))
            .await
            .unwrap();

        assert_eq!(camera.inject(&raw(&[], 0, 480)), 1);
        let short = vec![0u8; 16];
        assert_eq!(camera.inject(&raw(&short, 640, 480)), 1);

        assert_eq!(controller.pipeline.dimensions.get(), None);
        assert_eq!(
            controller.frame_counters(),
            FrameCounters {
                delivered: 0,
                dropped: 2
            }
        );
    }

    /// Collects every state the controller publishes.
    fn record_states(controller: &FrameReaderController) -> Arc<Mutex<Vec<SessionState>>> {
        let mut rx = controller.subscribe();
        let seen = Arc::new(Mutex::new(vec![*rx.borrow_and_update()]));
        let sink = Arc::clone(&seen);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                sink.lock().unwrap().push(state);
            }
        });
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_walks_the_session_states() {
        let latency = Duration::from_millis(40);
        let camera = Arc::new(
            SyntheticCamera::new("cam", "Camera")
                .with_source(
                    SyntheticSource::color("vga", vec![FormatDescriptor::nv12(640, 480, 30)])
                        .with_latency(latency),
                )
                .with_source(
                    SyntheticSource::color("hd", vec![FormatDescriptor::nv12(1280, 720, 30)])
                        .failing_start(ReaderStartStatus::DeviceNotAvailable)
                        .with_latency(latency),
                ),
        );
        let controller = controller(
            &camera,
            ReaderConfig {
                settle_delay: latency,
                ..fast_config()
            },
        );
        controller
            .request_preview(&FormatDescriptor::nv12(640, 480, 30))
            .await
            .unwrap();

        let seen = record_states(&controller);
        controller
            .request_preview(&FormatDescriptor::nv12(640, 480, 30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SessionState::Previewing,
                SessionState::Restarting,
                SessionState::Idle,
                SessionState::Negotiating,
                SessionState::Previewing,
            ]
        );

        let seen = record_states(&controller);
        let err = controller
            .request_preview(&FormatDescriptor::nv12(1280, 720, 30))
            .await
            .unwrap_err();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(err, CaptureError::ReaderStartFailed(_)));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SessionState::Previewing,
                SessionState::Restarting,
                SessionState::Idle,
                SessionState::Negotiating,
                SessionState::Idle,
            ]
        );
        assert_eq!(controller.state(), SessionState::Idle);
    }
}
