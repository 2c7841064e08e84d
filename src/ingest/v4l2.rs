//! V4L2 capture device.
//!
//! Connects to a local device node (e.g., /dev/video0), negotiates a
//! grayscale-friendly pixel format and reads frames through an mmap stream
//! with a bounded wait.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::Duration;

use super::CaptureDevice;
use crate::frame::{PixelFormat, RawImage};

pub struct V4l2Device {
    path: String,
    width: u32,
    height: u32,
    fps: u32,
    state: Option<V4l2State>,
    active_width: u32,
    active_height: u32,
    active_format: PixelFormat,
    stream_timeout: Option<Duration>,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Device {
    pub fn new(path: &str, width: u32, height: u32, fps: u32) -> Self {
        Self {
            path: path.to_string(),
            width,
            height,
            fps,
            state: None,
            active_width: width,
            active_height: height,
            active_format: PixelFormat::Yuyv,
            stream_timeout: None,
        }
    }
}

fn pixel_format_for(fourcc: v4l::FourCC) -> Result<PixelFormat> {
    match &fourcc.repr {
        b"GREY" => Ok(PixelFormat::Grey),
        b"YUYV" => Ok(PixelFormat::Yuyv),
        b"RGB3" => Ok(PixelFormat::Rgb24),
        other => Err(anyhow!(
            "unsupported v4l2 pixel format {}",
            String::from_utf8_lossy(other)
        )),
    }
}

impl CaptureDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.path
    }

    fn open(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&self.path)
            .with_context(|| format!("open v4l2 device {}", self.path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.width;
        format.height = self.height;
        format.fourcc = v4l::FourCC::new(b"YUYV");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Device: failed to set format on {}: {}", self.path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        self.active_format = pixel_format_for(format.fourcc)?;

        if self.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Device: failed to set fps on {}: {}", self.path, err);
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.stream_timeout = None;

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Device: connected to {} ({}x{} {:?})",
            self.path,
            self.active_width,
            self.active_height,
            self.active_format
        );
        Ok(())
    }

    fn close(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Device: closed {}", self.path);
        }
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<RawImage>> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not open")?;
        if self.stream_timeout != Some(timeout) {
            state.with_stream_mut(|stream| stream.set_timeout(timeout));
            self.stream_timeout = Some(timeout);
        }
        let result = state.with_stream_mut(|stream| {
            stream.next().map(|(buf, meta)| {
                let used = (meta.bytesused as usize).min(buf.len());
                let used = if used == 0 { buf.len() } else { used };
                buf[..used].to_vec()
            })
        });
        match result {
            Ok(pixels) => Ok(Some(RawImage {
                pixels,
                width: self.active_width,
                height: self.active_height,
                format: self.active_format,
            })),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(err) => Err(anyhow::Error::new(err).context("capture v4l2 frame")),
        }
    }
}
