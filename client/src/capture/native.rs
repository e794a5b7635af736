//! Native Camera Backend
//!
//! Real cameras through `nokhwa`. `nokhwa::Camera` is `!Send`, so each opened
//! device is owned by a dedicated actor thread; the [`CaptureDevice`] side
//! only holds a command channel. While streaming, the actor delivers every
//! frame to the active reader's callback from that thread.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use shutter_common::{FormatDescriptor, RawFrameBuffer, PHOTO_CHANNELS, SUBTYPE_NV12};
use tracing::{debug, error, info, warn};

use super::device::{
    CaptureDevice, DeviceInfo, FrameCallback, FrameReader, FrameSource, LowLagPhotoCapture,
    OpenSettings, PhotoRequest, ReaderStartStatus, SourceKind, StillFrame,
};
use super::CaptureError;

/// How long the idle actor waits for a command before checking again.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Enumerate available cameras.
pub fn enumerate_devices() -> Result<Vec<DeviceInfo>, CaptureError> {
    let backend = nokhwa::native_api_backend()
        .ok_or_else(|| CaptureError::Backend("No camera backend available".into()))?;

    let cameras = nokhwa::query(backend)
        .map_err(|e| CaptureError::Backend(format!("Failed to query cameras: {e}")))?;

    Ok(cameras
        .into_iter()
        .map(|info| DeviceInfo {
            id: match info.index() {
                CameraIndex::Index(i) => i.to_string(),
                CameraIndex::String(s) => s.clone(),
            },
            name: info.human_name(),
            description: info.description().to_string(),
        })
        .collect())
}

fn subtype_of(format: FrameFormat) -> String {
    match format {
        FrameFormat::NV12 => SUBTYPE_NV12.to_string(),
        FrameFormat::YUYV => "YUY2".to_string(),
        FrameFormat::MJPEG => "MJPG".to_string(),
        other => other.to_string(),
    }
}

fn exact_request(format: CameraFormat) -> RequestedFormat<'static> {
    RequestedFormat::new::<RgbFormat>(RequestedFormatType::Exact(format))
}

fn descriptor_of(format: &CameraFormat) -> FormatDescriptor {
    let resolution = format.resolution();
    FormatDescriptor::new(
        resolution.width_x,
        resolution.height_y,
        format.frame_rate(),
        subtype_of(format.format()),
    )
}

type Reply<T> = Sender<Result<T, CaptureError>>;

enum Command {
    Formats(Reply<Vec<CameraFormat>>),
    SetFormat(CameraFormat, Reply<()>),
    Start(FrameCallback, Reply<()>),
    Stop(Reply<()>),
    Still(Reply<StillFrame>),
    Close,
}

/// Command side of a device actor.
#[derive(Clone)]
struct ActorHandle {
    commands: Sender<Command>,
    thread: ThreadId,
}

impl ActorHandle {
    fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, CaptureError> {
        if thread::current().id() == self.thread {
            return Err(CaptureError::Backend(
                "camera command issued from its own frame callback".into(),
            ));
        }

        let (tx, rx) = mpsc::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| CaptureError::DeviceUnavailable("camera thread has exited".into()))?;
        rx.recv()
            .map_err(|_| CaptureError::DeviceUnavailable("camera thread has exited".into()))?
    }
}

struct Actor {
    index: CameraIndex,
    camera: Camera,
    callback: Option<FrameCallback>,
}

impl Actor {
    fn open(index: CameraIndex) -> Result<Self, CaptureError> {
        let requested =
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
        let camera = Camera::new(index.clone(), requested)
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        Ok(Self {
            index,
            camera,
            callback: None,
        })
    }

    fn run(mut self, commands: &Receiver<Command>) {
        loop {
            let command = if self.callback.is_some() {
                match commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(mpsc::TryRecvError::Empty) => None,
                    Err(mpsc::TryRecvError::Disconnected) => break,
                }
            } else {
                match commands.recv_timeout(IDLE_POLL) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };

            match command {
                Some(Command::Close) => break,
                Some(command) => self.handle(command),
                None => self.deliver_frame(),
            }
        }

        self.stop_stream();
        info!(device = %self.index, "Camera thread stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Formats(reply) => {
                let formats = self
                    .camera
                    .compatible_camera_formats()
                    .map_err(|e| CaptureError::Backend(e.to_string()));
                let _ = reply.send(formats);
            }
            Command::SetFormat(format, reply) => {
                let _ = reply.send(self.set_format(format));
            }
            Command::Start(callback, reply) => {
                let result = self
                    .camera
                    .open_stream()
                    .map_err(|e| CaptureError::ReaderStartFailed(e.to_string()));
                if result.is_ok() {
                    self.callback = Some(callback);
                }
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                self.stop_stream();
                let _ = reply.send(Ok(()));
            }
            Command::Still(reply) => {
                let _ = reply.send(self.still());
            }
            Command::Close => {}
        }
    }

    /// Reformat the held camera. The device stays open; no second handle is
    /// created.
    fn set_format(&mut self, format: CameraFormat) -> Result<(), CaptureError> {
        self.stop_stream();
        let applied = self
            .camera
            .set_camera_requset(exact_request(format))
            .map_err(|e| CaptureError::FormatUnsupported(e.to_string()))?;
        debug!(device = %self.index, format = %descriptor_of(&applied), "Camera format set");
        Ok(())
    }

    fn deliver_frame(&mut self) {
        let Some(callback) = self.callback.as_ref() else {
            return;
        };

        match self.camera.frame() {
            Ok(buffer) => {
                let resolution = buffer.resolution();
                let subtype = subtype_of(buffer.source_frame_format());
                callback(&RawFrameBuffer {
                    data: buffer.buffer(),
                    width: resolution.width_x,
                    height: resolution.height_y,
                    subtype: &subtype,
                });
            }
            Err(e) => {
                warn!(error = %e, "Failed to capture camera frame");
                // Brief sleep before retrying on error
                thread::sleep(Duration::from_millis(50));
            }
        }
    }

    fn still(&mut self) -> Result<StillFrame, CaptureError> {
        let transient = !self.camera.is_stream_open();
        if transient {
            self.camera
                .open_stream()
                .map_err(|e| CaptureError::PhotoCaptureFailed(e.to_string()))?;
        }

        let frame = self
            .camera
            .frame()
            .map_err(|e| CaptureError::PhotoCaptureFailed(e.to_string()));
        if transient {
            self.stop_stream();
        }
        let frame = frame?;

        let resolution = frame.resolution();
        let rgb = frame
            .decode_image::<RgbFormat>()
            .map_err(|e| CaptureError::PhotoCaptureFailed(e.to_string()))?
            .into_raw();

        let data = rgb
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0], 255])
            .collect::<Vec<u8>>();
        debug_assert_eq!(
            data.len(),
            resolution.width_x as usize * resolution.height_y as usize * PHOTO_CHANNELS
        );

        Ok(StillFrame {
            width: resolution.width_x,
            height: resolution.height_y,
            data,
        })
    }

    fn stop_stream(&mut self) {
        self.callback = None;
        if self.camera.is_stream_open() {
            if let Err(e) = self.camera.stop_stream() {
                warn!(error = %e, "Error stopping camera stream");
            }
        }
    }
}

/// A `nokhwa` camera.
pub struct NativeCamera {
    info: DeviceInfo,
    index: CameraIndex,
    actor: Mutex<Option<ActorHandle>>,
    source: Mutex<Option<Arc<NativeSource>>>,
}

impl NativeCamera {
    pub fn new(info: DeviceInfo) -> Self {
        let index = info
            .id
            .parse::<u32>()
            .map_or_else(|_| CameraIndex::String(info.id.clone()), CameraIndex::Index);
        Self {
            info,
            index,
            actor: Mutex::new(None),
            source: Mutex::new(None),
        }
    }

    fn actor(&self) -> Result<ActorHandle, CaptureError> {
        self.actor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CaptureError::DeviceUnavailable(format!("{} is not open", self.info.id)))
    }
}

impl CaptureDevice for NativeCamera {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn open(&self, settings: &OpenSettings) -> Result<(), CaptureError> {
        let mut actor = self.actor.lock().unwrap_or_else(PoisonError::into_inner);
        if actor.is_some() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} is already open",
                self.info.id
            )));
        }

        let (commands, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let index = self.index.clone();
        let handle = thread::Builder::new()
            .name(format!("camera-{}", self.info.id))
            .spawn(move || match Actor::open(index) {
                Ok(actor) => {
                    let _ = ready_tx.send(Ok(()));
                    actor.run(&inbox);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| CaptureError::Backend(format!("Failed to spawn camera thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| CaptureError::DeviceUnavailable("camera thread exited".into()))??;

        let handle = ActorHandle {
            commands,
            thread: handle.thread().id(),
        };
        let formats = match handle.request(Command::Formats) {
            Ok(formats) => formats,
            Err(e) => {
                let _ = handle.commands.send(Command::Close);
                return Err(e);
            }
        };
        info!(device = %self.info.id, ?settings, formats = formats.len(), "Camera opened");

        *self.source.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(NativeSource {
            id: format!("{}:color", self.info.id),
            formats,
            actor: handle.clone(),
        }));
        *actor = Some(handle);
        Ok(())
    }

    fn close(&self) {
        if let Some(actor) = self.actor.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = actor.commands.send(Command::Close);
            self.source
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            debug!(device = %self.info.id, "Camera closed");
        }
    }

    fn sources(&self) -> Vec<Arc<dyn FrameSource>> {
        self.source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|source| Arc::clone(source) as Arc<dyn FrameSource>)
            .collect()
    }

    fn prepare_low_lag_photo(
        &self,
        request: &PhotoRequest,
    ) -> Result<Box<dyn LowLagPhotoCapture>, CaptureError> {
        if !request.uncompressed {
            return Err(CaptureError::PhotoCaptureFailed(
                "only uncompressed stills are supported".into(),
            ));
        }
        Ok(Box::new(NativePhoto {
            actor: self.actor()?,
        }))
    }
}

impl Drop for NativeCamera {
    fn drop(&mut self) {
        self.close();
    }
}

/// The colour stream of a native camera.
struct NativeSource {
    id: String,
    formats: Vec<CameraFormat>,
    actor: ActorHandle,
}

impl FrameSource for NativeSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Color
    }

    fn supported_formats(&self) -> Vec<FormatDescriptor> {
        self.formats.iter().map(descriptor_of).collect()
    }

    fn set_format(&self, format: &FormatDescriptor) -> Result<(), CaptureError> {
        let native = self
            .formats
            .iter()
            .find(|candidate| descriptor_of(candidate) == *format)
            .copied()
            .ok_or_else(|| CaptureError::FormatUnsupported(format.to_string()))?;
        self.actor.request(|reply| Command::SetFormat(native, reply))
    }

    fn create_reader(
        &self,
        subtype: &str,
        callback: FrameCallback,
    ) -> Result<Box<dyn FrameReader>, CaptureError> {
        if !self.formats.iter().any(|f| descriptor_of(f).has_subtype(subtype)) {
            return Err(CaptureError::FormatUnsupported(subtype.to_string()));
        }
        Ok(Box::new(NativeReader {
            actor: self.actor.clone(),
            callback,
            running: false,
        }))
    }
}

struct NativeReader {
    actor: ActorHandle,
    callback: FrameCallback,
    running: bool,
}

impl FrameReader for NativeReader {
    fn start(&mut self) -> ReaderStartStatus {
        let callback = Arc::clone(&self.callback);
        match self.actor.request(|reply| Command::Start(callback, reply)) {
            Ok(()) => {
                self.running = true;
                ReaderStartStatus::Success
            }
            Err(CaptureError::DeviceUnavailable(e)) => {
                warn!(error = %e, "Camera gone, reader not started");
                ReaderStartStatus::DeviceNotAvailable
            }
            Err(e) => {
                warn!(error = %e, "Failed to start camera stream");
                ReaderStartStatus::UnknownFailure
            }
        }
    }

    fn stop(&mut self) {
        if !std::mem::take(&mut self.running) {
            return;
        }
        if let Err(e) = self.actor.request(Command::Stop) {
            error!(error = %e, "Failed to stop camera stream");
        }
    }
}

impl Drop for NativeReader {
    fn drop(&mut self) {
        self.stop();
    }
}

struct NativePhoto {
    actor: ActorHandle,
}

impl LowLagPhotoCapture for NativePhoto {
    fn capture(&mut self) -> Result<StillFrame, CaptureError> {
        self.actor.request(Command::Still)
    }

    fn finish(self: Box<Self>) -> Result<(), CaptureError> {
        Ok(())
    }
}
