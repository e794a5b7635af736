//! Synthetic Camera
//!
//! An in-memory camera for tests and for running the driver without
//! hardware. Sources either stream a moving NV12 test pattern from their own
//! thread (`realtime`) or deliver only the frames pushed through
//! [`SyntheticCamera::inject`] on the caller's thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use shutter_common::{nv12_len, FormatDescriptor, RawFrameBuffer, PHOTO_CHANNELS, SUBTYPE_BGRA8};
use tracing::{debug, error, warn};

use super::device::{
    CaptureDevice, DeviceInfo, FrameCallback, FrameReader, FrameSource, LowLagPhotoCapture,
    OpenSettings, PhotoRequest, ReaderStartStatus, SharingMode, SourceKind, StillFrame,
};
use super::CaptureError;

/// Reader and photo counters of a synthetic camera.
#[derive(Debug, Default)]
struct Stats {
    created: AtomicUsize,
    started: AtomicUsize,
    stop_calls: AtomicUsize,
    released: AtomicUsize,
    photos_finished: AtomicUsize,
}

/// Point-in-time copy of a synthetic camera's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyntheticStats {
    /// Readers created.
    pub created: usize,
    /// Readers started successfully.
    pub started: usize,
    /// Calls to `FrameReader::stop`.
    pub stop_calls: usize,
    /// Readers dropped.
    pub released: usize,
    /// Prepared photo captures that were finished.
    pub photos_finished: usize,
}

/// A manual-pacing reader that is currently running.
struct LiveReader {
    id: usize,
    source_id: String,
    callback: FrameCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pacing {
    Manual,
    Realtime,
}

/// Registry shared by a camera and its sources.
#[derive(Default)]
struct Shared {
    stats: Stats,
    live: Mutex<Vec<LiveReader>>,
    next_reader: AtomicUsize,
}

/// Builder and runtime state of one synthetic frame source.
pub struct SyntheticSource {
    id: String,
    kind: SourceKind,
    formats: Vec<FormatDescriptor>,
    reject_formats: bool,
    start_status: ReaderStartStatus,
    pacing: Pacing,
    latency: Duration,
    current: Mutex<Option<FormatDescriptor>>,
    shared: Arc<Shared>,
}

impl SyntheticSource {
    pub fn new(id: impl Into<String>, kind: SourceKind, formats: Vec<FormatDescriptor>) -> Self {
        Self {
            id: id.into(),
            kind,
            formats,
            reject_formats: false,
            start_status: ReaderStartStatus::Success,
            pacing: Pacing::Manual,
            latency: Duration::ZERO,
            current: Mutex::new(None),
            shared: Arc::default(),
        }
    }

    /// A colour source.
    pub fn color(id: impl Into<String>, formats: Vec<FormatDescriptor>) -> Self {
        Self::new(id, SourceKind::Color, formats)
    }

    /// Fail every `set_format` call.
    #[must_use]
    pub fn rejecting_formats(mut self) -> Self {
        self.reject_formats = true;
        self
    }

    /// Make readers of this source fail to start with `status`.
    #[must_use]
    pub const fn failing_start(mut self, status: ReaderStartStatus) -> Self {
        self.start_status = status;
        self
    }

    /// Make every reader start and stop take `latency`, like a slow driver.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Stream a test pattern from a background thread at the format's rate.
    #[must_use]
    pub const fn realtime(mut self) -> Self {
        self.pacing = Pacing::Realtime;
        self
    }
}

impl FrameSource for SyntheticSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn supported_formats(&self) -> Vec<FormatDescriptor> {
        self.formats.clone()
    }

    fn set_format(&self, format: &FormatDescriptor) -> Result<(), CaptureError> {
        if self.reject_formats {
            return Err(CaptureError::Backend(format!(
                "source {} refused format {format}",
                self.id
            )));
        }
        if !self.formats.contains(format) {
            return Err(CaptureError::FormatUnsupported(format.to_string()));
        }

        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(format.clone());
        Ok(())
    }

    fn create_reader(
        &self,
        subtype: &str,
        callback: FrameCallback,
    ) -> Result<Box<dyn FrameReader>, CaptureError> {
        let format = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CaptureError::Backend(format!("source {} has no format set", self.id)))?;

        if !format.has_subtype(subtype) {
            return Err(CaptureError::FormatUnsupported(format!(
                "{subtype} reader on {} source",
                format.subtype
            )));
        }

        self.shared.stats.created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SyntheticReader {
            id: self.shared.next_reader.fetch_add(1, Ordering::Relaxed),
            source_id: self.id.clone(),
            format,
            callback,
            start_status: self.start_status,
            pacing: self.pacing,
            latency: self.latency,
            shared: Arc::clone(&self.shared),
            worker: None,
        }))
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct SyntheticReader {
    id: usize,
    source_id: String,
    format: FormatDescriptor,
    callback: FrameCallback,
    start_status: ReaderStartStatus,
    pacing: Pacing,
    latency: Duration,
    shared: Arc<Shared>,
    worker: Option<Worker>,
}

impl SyntheticReader {
    fn halt(&mut self) {
        self.shared
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|live| live.id != self.id);

        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            // A reader released from inside its own callback cannot join itself
            if worker.handle.thread().id() != thread::current().id() {
                if let Err(e) = worker.handle.join() {
                    error!(source = %self.source_id, error = ?e, "Pattern thread panicked");
                }
            }
        }
    }

    fn spawn_pattern(&self) -> std::io::Result<Worker> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let callback = Arc::clone(&self.callback);
        let format = self.format.clone();
        let interval = Duration::from_secs(1) / format.frame_rate_numerator.max(1);

        let handle = thread::Builder::new()
            .name(format!("synthetic-{}", self.source_id))
            .spawn(move || {
                let mut data = vec![0u8; nv12_len(format.width, format.height)];
                let mut tick: u32 = 0;
                while !flag.load(Ordering::Acquire) {
                    fill_test_pattern(&mut data, format.width, format.height, tick);
                    callback(&RawFrameBuffer {
                        data: &data,
                        width: format.width,
                        height: format.height,
                        subtype: &format.subtype,
                    });
                    tick = tick.wrapping_add(1);
                    thread::sleep(interval);
                }
            })?;

        Ok(Worker { stop, handle })
    }
}

impl FrameReader for SyntheticReader {
    fn start(&mut self) -> ReaderStartStatus {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if !self.start_status.is_success() {
            debug!(
                source = %self.source_id,
                status = ?self.start_status,
                "Synthetic reader refusing to start"
            );
            return self.start_status;
        }

        match self.pacing {
            Pacing::Manual => {
                self.shared
                    .live
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(LiveReader {
                        id: self.id,
                        source_id: self.source_id.clone(),
                        callback: Arc::clone(&self.callback),
                    });
            }
            Pacing::Realtime => match self.spawn_pattern() {
                Ok(worker) => self.worker = Some(worker),
                Err(e) => {
                    warn!(source = %self.source_id, error = %e, "Failed to spawn pattern thread");
                    return ReaderStartStatus::UnknownFailure;
                }
            },
        }

        self.shared.stats.started.fetch_add(1, Ordering::Relaxed);
        ReaderStartStatus::Success
    }

    fn stop(&mut self) {
        self.shared.stats.stop_calls.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        self.halt();
    }
}

impl Drop for SyntheticReader {
    fn drop(&mut self) {
        self.halt();
        self.shared.stats.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Luma gradient that scrolls with `tick`, neutral chroma.
fn fill_test_pattern(data: &mut [u8], width: u32, height: u32, tick: u32) {
    let w = width as usize;
    if w == 0 {
        return;
    }
    let luma_len = w * height as usize;
    let (luma, chroma) = data.split_at_mut(luma_len);

    for (row, line) in luma.chunks_exact_mut(w).enumerate() {
        for (col, y) in line.iter_mut().enumerate() {
            let v = (col + row + tick as usize) % 220;
            *y = 16 + v as u8;
        }
    }
    chroma.fill(128);
}

/// An in-memory camera device.
pub struct SyntheticCamera {
    info: DeviceInfo,
    sources: Vec<Arc<SyntheticSource>>,
    shared: Arc<Shared>,
    present: AtomicBool,
    open: AtomicBool,
    held_elsewhere: AtomicBool,
    fail_photos: AtomicBool,
    still_size: (u32, u32),
}

impl SyntheticCamera {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            info: DeviceInfo {
                id: id.into(),
                name: name.into(),
                description: "synthetic test camera".into(),
            },
            sources: Vec::new(),
            shared: Arc::default(),
            present: AtomicBool::new(true),
            open: AtomicBool::new(false),
            held_elsewhere: AtomicBool::new(false),
            fail_photos: AtomicBool::new(false),
            still_size: (1280, 720),
        }
    }

    /// A camera streaming a test pattern, used by `--test-source`.
    pub fn test_pattern() -> Self {
        Self::new("synthetic:0", "Synthetic Test Pattern")
            .with_source(
                SyntheticSource::color(
                    "synthetic:0:color",
                    vec![
                        FormatDescriptor::nv12(640, 480, 30),
                        FormatDescriptor::nv12(1280, 720, 30),
                        FormatDescriptor::nv12(320, 240, 15),
                        FormatDescriptor::new(640, 480, 30, "YUY2"),
                    ],
                )
                .realtime(),
            )
            .with_source(SyntheticSource::new(
                "synthetic:0:depth",
                SourceKind::Depth,
                vec![FormatDescriptor::new(640, 480, 30, "D16")],
            ))
    }

    /// Add a source. Sources are enumerated in insertion order.
    #[must_use]
    pub fn with_source(mut self, mut source: SyntheticSource) -> Self {
        source.shared = Arc::clone(&self.shared);
        self.sources.push(Arc::new(source));
        self
    }

    /// Size of the stills returned by the photo path.
    #[must_use]
    pub const fn with_still_size(mut self, width: u32, height: u32) -> Self {
        self.still_size = (width, height);
        self
    }

    /// Simulate the device being unplugged or plugged back in.
    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::Release);
    }

    /// Simulate another application holding the device exclusively.
    pub fn set_held_elsewhere(&self, held: bool) {
        self.held_elsewhere.store(held, Ordering::Release);
    }

    /// Make photo preparation fail as if the device were busy.
    pub fn set_fail_photos(&self, fail: bool) {
        self.fail_photos.store(fail, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SyntheticStats {
        let stats = &self.shared.stats;
        SyntheticStats {
            created: stats.created.load(Ordering::Relaxed),
            started: stats.started.load(Ordering::Relaxed),
            stop_calls: stats.stop_calls.load(Ordering::Relaxed),
            released: stats.released.load(Ordering::Relaxed),
            photos_finished: stats.photos_finished.load(Ordering::Relaxed),
        }
    }

    /// Ids of the sources whose manually paced readers are running.
    pub fn running_sources(&self) -> Vec<String> {
        self.shared
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|live| live.source_id.clone())
            .collect()
    }

    /// Deliver `frame` to every running manually paced reader, on the calling
    /// thread. Returns the number of readers reached.
    pub fn inject(&self, frame: &RawFrameBuffer<'_>) -> usize {
        let callbacks: Vec<FrameCallback> = self
            .shared
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|live| Arc::clone(&live.callback))
            .collect();

        for callback in &callbacks {
            callback(frame);
        }
        callbacks.len()
    }
}

impl CaptureDevice for SyntheticCamera {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn open(&self, settings: &OpenSettings) -> Result<(), CaptureError> {
        if !self.present.load(Ordering::Acquire) {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} is not present",
                self.info.id
            )));
        }
        if self.held_elsewhere.load(Ordering::Acquire) {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} is held exclusively by another application",
                self.info.id
            )));
        }
        let exclusive = settings.sharing == SharingMode::ExclusiveControl;
        if self.open.swap(true, Ordering::AcqRel) && exclusive {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} is already open",
                self.info.id
            )));
        }

        debug!(device = %self.info.id, ?settings, "Synthetic camera opened");
        Ok(())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!(device = %self.info.id, "Synthetic camera closed");
        }
    }

    fn sources(&self) -> Vec<Arc<dyn FrameSource>> {
        self.sources
            .iter()
            .map(|source| Arc::clone(source) as Arc<dyn FrameSource>)
            .collect()
    }

    fn prepare_low_lag_photo(
        &self,
        request: &PhotoRequest,
    ) -> Result<Box<dyn LowLagPhotoCapture>, CaptureError> {
        if !self.is_open() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} is not open",
                self.info.id
            )));
        }
        if self.fail_photos.load(Ordering::Acquire) {
            return Err(CaptureError::PhotoCaptureFailed("device busy".into()));
        }
        if !request.uncompressed || !request.subtype.eq_ignore_ascii_case(SUBTYPE_BGRA8) {
            return Err(CaptureError::PhotoCaptureFailed(format!(
                "unsupported photo request {request:?}"
            )));
        }

        Ok(Box::new(SyntheticPhoto {
            width: self.still_size.0,
            height: self.still_size.1,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct SyntheticPhoto {
    width: u32,
    height: u32,
    shared: Arc<Shared>,
}

impl LowLagPhotoCapture for SyntheticPhoto {
    fn capture(&mut self) -> Result<StillFrame, CaptureError> {
        let mut data = vec![0u8; self.width as usize * self.height as usize * PHOTO_CHANNELS];
        for (i, px) in data.chunks_exact_mut(PHOTO_CHANNELS).enumerate() {
            let x = (i % self.width as usize) as u8;
            px.copy_from_slice(&[x, 128, 255 - x, 255]);
        }
        Ok(StillFrame {
            width: self.width,
            height: self.height,
            data,
        })
    }

    fn finish(self: Box<Self>) -> Result<(), CaptureError> {
        self.shared
            .stats
            .photos_finished
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;

    fn counting_callback() -> (FrameCallback, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&count);
        let callback: FrameCallback = Arc::new(move |_raw: &RawFrameBuffer<'_>| {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        (callback, count)
    }

    #[test]
    fn exclusive_open_fails_twice() {
        let camera = SyntheticCamera::new("cam", "Camera");
        let settings = OpenSettings::exclusive_cpu_video();
        camera.open(&settings).unwrap();
        assert!(matches!(
            camera.open(&settings),
            Err(CaptureError::DeviceUnavailable(_))
        ));
        camera.close();
        camera.open(&settings).unwrap();
    }

    #[test]
    fn absent_or_held_device_is_unavailable() {
        let camera = SyntheticCamera::new("cam", "Camera");
        let settings = OpenSettings::exclusive_cpu_video();

        camera.set_present(false);
        assert!(camera.open(&settings).is_err());

        camera.set_present(true);
        camera.set_held_elsewhere(true);
        assert!(camera.open(&settings).is_err());
        assert!(!camera.is_open());
    }

    #[test]
    fn reader_requires_a_format() {
        let source = SyntheticSource::color("s", vec![FormatDescriptor::nv12(4, 4, 30)]);
        let (callback, _) = counting_callback();
        assert!(source.create_reader("NV12", callback).is_err());
    }

    #[test]
    fn manual_reader_receives_injected_frames_until_stopped() {
        let camera = SyntheticCamera::new("cam", "Camera").with_source(SyntheticSource::color(
            "s",
            vec![FormatDescriptor::nv12(4, 4, 30)],
        ));
        let source = camera.sources().remove(0);
        source.set_format(&FormatDescriptor::nv12(4, 4, 30)).unwrap();
        let (callback, count) = counting_callback();
        let mut reader = source.create_reader("nv12", callback).unwrap();

        let data = vec![0u8; nv12_len(4, 4)];
        let frame = RawFrameBuffer {
            data: &data,
            width: 4,
            height: 4,
            subtype: "NV12",
        };
        assert_eq!(camera.inject(&frame), 0);

        assert_eq!(reader.start(), ReaderStartStatus::Success);
        assert_eq!(camera.inject(&frame), 1);
        assert_eq!(count.load(Ordering::Relaxed), 1);

        reader.stop();
        drop(reader);
        assert_eq!(camera.inject(&frame), 0);
        assert_eq!(
            camera.stats(),
            SyntheticStats {
                created: 1,
                started: 1,
                stop_calls: 1,
                released: 1,
                photos_finished: 0,
            }
        );
    }

    #[test]
    fn realtime_reader_streams_pattern() {
        let camera = SyntheticCamera::new("cam", "Camera").with_source(
            SyntheticSource::color("s", vec![FormatDescriptor::nv12(16, 8, 100)]).realtime(),
        );
        let source = camera.sources().remove(0);
        source.set_format(&FormatDescriptor::nv12(16, 8, 100)).unwrap();
        let (callback, count) = counting_callback();
        let mut reader = source.create_reader("NV12", callback).unwrap();

        assert!(reader.start().is_success());
        thread::sleep(Duration::from_millis(100));
        reader.stop();
        let frames = count.load(Ordering::Relaxed);
        assert!(frames > 0);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::Relaxed), frames);
    }

    #[test]
    fn stop_survives_a_panicking_pattern_thread() {
        let camera = SyntheticCamera::new("cam", "Camera").with_source(
            SyntheticSource::color("s", vec![FormatDescriptor::nv12(4, 4, 100)]).realtime(),
        );
        let source = camera.sources().remove(0);
        source.set_format(&FormatDescriptor::nv12(4, 4, 100)).unwrap();
        let callback: FrameCallback = Arc::new(|_raw: &RawFrameBuffer<'_>| panic!("callback"));
        let mut reader = source.create_reader("NV12", callback).unwrap();

        assert!(reader.start().is_success());
        thread::sleep(Duration::from_millis(30));
        reader.stop();
        drop(reader);

        let stats = camera.stats();
        assert_eq!(stats.stop_calls, 1);
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn latency_delays_start_and_stop() {
        let camera = SyntheticCamera::new("cam", "Camera").with_source(
            SyntheticSource::color("s", vec![FormatDescriptor::nv12(4, 4, 30)])
                .with_latency(Duration::from_millis(30)),
        );
        let source = camera.sources().remove(0);
        source.set_format(&FormatDescriptor::nv12(4, 4, 30)).unwrap();
        let (callback, _) = counting_callback();
        let mut reader = source.create_reader("NV12", callback).unwrap();

        let started = std::time::Instant::now();
        assert!(reader.start().is_success());
        reader.stop();
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn photo_requires_open_device() {
        let camera = SyntheticCamera::new("cam", "Camera").with_still_size(4, 2);
        assert!(camera
            .prepare_low_lag_photo(&PhotoRequest::uncompressed_bgra8())
            .is_err());

        camera.open(&OpenSettings::exclusive_cpu_video()).unwrap();
        let mut photo = camera
            .prepare_low_lag_photo(&PhotoRequest::uncompressed_bgra8())
            .unwrap();
        let still = photo.capture().unwrap();
        photo.finish().unwrap();

        assert_eq!((still.width, still.height), (4, 2));
        assert_eq!(still.data.len(), still.capacity());
        assert_eq!(camera.stats().photos_finished, 1);
    }
}
