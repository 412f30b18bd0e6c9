// Perception feed handle
//
// Opens the camera, reports its frame size and keeps it open for a downstream
// consumer until shutdown. Frames are never processed here. The feed shares
// nothing mutable with the actuation path; it only shares the process lifetime.

use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::messages::TelemetryEvent;
use crate::shutdown::ShutdownSignal;
use crate::telemetry::TelemetrySink;

pub use v4l2::open_device as open_platform_device;

#[derive(Debug, thiserror::Error)]
#[error("Capture device {device_index} unavailable: {reason}")]
pub struct DeviceUnavailable {
    pub device_index: u32,
    pub reason: String,
}

/// An open video capture device
pub trait CaptureDevice: Send {
    /// Current frame size (width, height) in pixels
    fn dimensions(&self) -> (u32, u32);

    /// Release the underlying device. Called at most once by the handle.
    fn close(&mut self);
}

/// Opens a capture device by index
pub trait DeviceOpener {
    fn open(&self, device_index: u32) -> Result<Box<dyn CaptureDevice>, DeviceUnavailable>;
}

impl<F> DeviceOpener for F
where
    F: Fn(u32) -> Result<Box<dyn CaptureDevice>, DeviceUnavailable>,
{
    fn open(&self, device_index: u32) -> Result<Box<dyn CaptureDevice>, DeviceUnavailable> {
        self(device_index)
    }
}

/// Exclusively owned camera. Released on `release()` or drop, whichever is first.
pub struct PerceptionFeedHandle {
    device_index: u32,
    width: u32,
    height: u32,
    device: Option<Box<dyn CaptureDevice>>,
}

impl PerceptionFeedHandle {
    /// Open the platform camera at `device_index`
    pub fn acquire(device_index: u32) -> Result<Self, DeviceUnavailable> {
        Self::acquire_with(device_index, &v4l2::open_device)
    }

    pub fn acquire_with(
        device_index: u32,
        opener: &dyn DeviceOpener,
    ) -> Result<Self, DeviceUnavailable> {
        let device = opener.open(device_index)?;
        let (width, height) = device.dimensions();
        info!(device_index, width, height, "Capture device acquired");
        Ok(Self {
            device_index,
            width,
            height,
            device: Some(device),
        })
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Close the device. Safe to call any number of times.
    pub fn release(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.close();
            info!(device_index = self.device_index, "Capture device released");
        }
    }
}

impl Drop for PerceptionFeedHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquire the camera on its own thread, hold it until `stop` fires, then
/// release it. The join handle yields the frame size that was served.
pub fn spawn_feed(
    device_index: u32,
    opener: Box<dyn DeviceOpener + Send>,
    stop: ShutdownSignal,
    mut telemetry: Option<Box<dyn TelemetrySink>>,
) -> std::io::Result<JoinHandle<Result<(u32, u32), DeviceUnavailable>>> {
    thread::Builder::new()
        .name("perception-feed".into())
        .spawn(move || {
            let mut handle = match PerceptionFeedHandle::acquire_with(device_index, opener.as_ref())
            {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Perception feed not started: {}", e);
                    return Err(e);
                }
            };

            let (width, height) = handle.dimensions();
            if let Some(sink) = telemetry.as_mut() {
                sink.publish(&TelemetryEvent::FeedOpened {
                    device_index,
                    width,
                    height,
                });
            }

            stop.wait();
            debug!("Perception feed stop requested");
            handle.release();

            if let Some(sink) = telemetry.as_mut() {
                sink.publish(&TelemetryEvent::FeedReleased { device_index });
            }
            Ok((width, height))
        })
}

/// V4L2 backend: `/dev/video<N>`, frame size from VIDIOC_G_FMT
mod v4l2 {
    use super::{CaptureDevice, DeviceUnavailable};

    #[cfg(target_os = "linux")]
    pub fn open_device(device_index: u32) -> Result<Box<dyn CaptureDevice>, DeviceUnavailable> {
        linux::V4l2Camera::open(device_index).map(|cam| Box::new(cam) as Box<dyn CaptureDevice>)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open_device(device_index: u32) -> Result<Box<dyn CaptureDevice>, DeviceUnavailable> {
        Err(DeviceUnavailable {
            device_index,
            reason: "V4L2 capture is only available on Linux".to_string(),
        })
    }

    #[cfg(target_os = "linux")]
    mod linux {
        use super::{CaptureDevice, DeviceUnavailable};
        use std::fs::{File, OpenOptions};
        use std::mem;
        use std::os::fd::AsRawFd;

        const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;

        // Mirrors struct v4l2_pix_format
        #[allow(dead_code)]
        #[repr(C)]
        #[derive(Clone, Copy)]
        struct PixFormat {
            width: u32,
            height: u32,
            pixelformat: u32,
            field: u32,
            bytesperline: u32,
            sizeimage: u32,
            colorspace: u32,
            priv_: u32,
            flags: u32,
            ycbcr_enc: u32,
            quantization: u32,
            xfer_func: u32,
        }

        // The kernel union holds pointers (v4l2_window), hence pointer alignment
        #[allow(dead_code)]
        #[repr(C)]
        union FormatUnion {
            pix: PixFormat,
            raw_data: [u8; 200],
            _align: *mut libc::c_void,
        }

        // Mirrors struct v4l2_format
        #[allow(dead_code)]
        #[repr(C)]
        struct Format {
            type_: u32,
            fmt: FormatUnion,
        }

        // _IOWR('V', 4, struct v4l2_format)
        const VIDIOC_G_FMT: u64 = (3 << 30)
            | ((mem::size_of::<Format>() as u64) << 16)
            | ((b'V' as u64) << 8)
            | 4;

        pub struct V4l2Camera {
            file: Option<File>,
            width: u32,
            height: u32,
        }

        impl V4l2Camera {
            pub fn open(device_index: u32) -> Result<Self, DeviceUnavailable> {
                let path = format!("/dev/video{}", device_index);
                let unavailable = |reason: String| DeviceUnavailable {
                    device_index,
                    reason,
                };

                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| unavailable(format!("{}: {}", path, e)))?;

                let mut format = Format {
                    type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
                    fmt: FormatUnion { raw_data: [0; 200] },
                };
                // SAFETY: `format` is a correctly sized, writable v4l2_format and
                // the fd stays open for the duration of the call.
                let rc = unsafe {
                    libc::ioctl(
                        file.as_raw_fd(),
                        VIDIOC_G_FMT as _,
                        &mut format as *mut Format,
                    )
                };
                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    return Err(unavailable(format!("{}: VIDIOC_G_FMT failed: {}", path, err)));
                }

                // SAFETY: G_FMT on a capture buffer type fills the `pix` member
                let pix = unsafe { format.fmt.pix };
                Ok(Self {
                    file: Some(file),
                    width: pix.width,
                    height: pix.height,
                })
            }
        }

        impl CaptureDevice for V4l2Camera {
            fn dimensions(&self) -> (u32, u32) {
                (self.width, self.height)
            }

            fn close(&mut self) {
                self.file.take();
            }
        }

    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::tests::RecordingSink;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeCamera {
        closes: Arc<AtomicUsize>,
    }

    impl CaptureDevice for FakeCamera {
        fn dimensions(&self) -> (u32, u32) {
            (640, 480)
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake_opener(closes: Arc<AtomicUsize>) -> impl Fn(u32) -> Result<Box<dyn CaptureDevice>, DeviceUnavailable> {
        move |_| {
            Ok(Box::new(FakeCamera {
                closes: closes.clone(),
            }) as Box<dyn CaptureDevice>)
        }
    }

    fn failing_opener(index: u32) -> Result<Box<dyn CaptureDevice>, DeviceUnavailable> {
        Err(DeviceUnavailable {
            device_index: index,
            reason: "no such device".into(),
        })
    }

    #[test]
    fn test_release_is_idempotent() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut handle = PerceptionFeedHandle::acquire_with(0, &fake_opener(closes.clone())).unwrap();

        assert_eq!(handle.dimensions(), (640, 480));
        assert!(handle.is_open());

        handle.release();
        handle.release();
        assert!(!handle.is_open());
        drop(handle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_device() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let _handle = PerceptionFeedHandle::acquire_with(2, &fake_opener(closes.clone())).unwrap();
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acquire_failure_is_device_unavailable() {
        let err = PerceptionFeedHandle::acquire_with(7, &failing_opener).err().unwrap();
        assert_eq!(err.device_index, 7);
    }

    #[test]
    fn test_missing_video_device() {
        let err = PerceptionFeedHandle::acquire(9_999).err().unwrap();
        assert_eq!(err.device_index, 9_999);
    }

    #[test]
    fn test_feed_released_when_actuation_fails_concurrently() {
        let closes = Arc::new(AtomicUsize::new(0));
        let stop = ShutdownSignal::new();
        let sink = RecordingSink::default();

        let feed = spawn_feed(
            0,
            Box::new(fake_opener(closes.clone())),
            stop.clone(),
            Some(Box::new(sink.clone())),
        )
        .unwrap();

        // Actuation path blows up on another thread while the feed is open
        let actuation = std::thread::spawn(|| -> Result<(), String> {
            std::thread::sleep(Duration::from_millis(20));
            Err("link lost mid-maneuver".to_string())
        });
        assert!(actuation.join().unwrap().is_err());

        stop.trigger();
        let served = feed.join().unwrap().unwrap();

        assert_eq!(served, (640, 480));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        let events = sink.events.lock().unwrap();
        assert!(matches!(events.first(), Some(TelemetryEvent::FeedOpened { width: 640, .. })));
        assert!(matches!(events.last(), Some(TelemetryEvent::FeedReleased { device_index: 0 })));
    }

    #[test]
    fn test_feed_released_when_actuation_panics() {
        let closes = Arc::new(AtomicUsize::new(0));
        let stop = ShutdownSignal::new();
        let feed = spawn_feed(0, Box::new(fake_opener(closes.clone())), stop.clone(), None).unwrap();

        let trigger = stop.clone();
        let actuation = std::thread::spawn(move || {
            // Shutdown still fires from the unwinding path
            struct TriggerOnDrop(ShutdownSignal);
            impl Drop for TriggerOnDrop {
                fn drop(&mut self) {
                    self.0.trigger();
                }
            }
            let _guard = TriggerOnDrop(trigger);
            panic!("actuation fault");
        });
        assert!(actuation.join().is_err());

        feed.join().unwrap().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_feed_failure_is_reported_not_fatal() {
        let stop = ShutdownSignal::new();
        let feed = spawn_feed(3, Box::new(failing_opener), stop, None).unwrap();
        let err = feed.join().unwrap().unwrap_err();
        assert_eq!(err.device_index, 3);
    }
}
