//! GStreamer-backed network and webcam readers.
//!
//! Pipelines always end in an RGB appsink that keeps one buffer and drops
//! the rest, so a slow consumer sees the freshest decoded frame.

use crate::error::CaptureError;

use super::FrameReader;

const APPSINK_TAIL: &str = "videoconvert ! video/x-raw,format=RGB ! \
     appsink name=appsink sync=false max-buffers=1 drop=true";

/// Pipeline for an `rtsp://` or `http(s)://` url.
pub fn network_pipeline(url: &str) -> String {
    if url.starts_with("rtsp://") {
        format!("rtspsrc location={url} latency=100 ! decodebin ! {APPSINK_TAIL}")
    } else {
        format!("uridecodebin uri=\"{url}\" ! {APPSINK_TAIL}")
    }
}

/// Pipeline for a V4L2 device path such as `/dev/video0`.
pub fn webcam_pipeline(device: &str) -> String {
    format!("v4l2src device={device} ! {APPSINK_TAIL}")
}

#[cfg(not(feature = "rtsp-gstreamer"))]
pub(super) fn open(pipeline: &str) -> Result<Box<dyn FrameReader>, CaptureError> {
    Err(CaptureError::Transport(format!(
        "'{pipeline}' requires the rtsp-gstreamer feature"
    )))
}

#[cfg(feature = "rtsp-gstreamer")]
pub(super) fn open(pipeline: &str) -> Result<Box<dyn FrameReader>, CaptureError> {
    let mut reader = backend::GstreamerReader::new(pipeline)?;
    reader.connect()?;
    Ok(Box::new(reader))
}

#[cfg(feature = "rtsp-gstreamer")]
mod backend {
    use std::time::Duration;

    use gstreamer::prelude::*;

    use super::FrameReader;
    use crate::error::CaptureError;
    use crate::ingest::RawImage;

    const PULL_TIMEOUT: Duration = Duration::from_millis(2_000);

    fn transport(context: &str, err: impl std::fmt::Display) -> CaptureError {
        CaptureError::Transport(format!("{context}: {err}"))
    }

    pub(super) struct GstreamerReader {
        pipeline: gstreamer::Pipeline,
        appsink: gstreamer_app::AppSink,
    }

    impl GstreamerReader {
        pub(super) fn new(description: &str) -> Result<Self, CaptureError> {
            gstreamer::init().map_err(|e| transport("initialize gstreamer", e))?;

            let pipeline = gstreamer::parse::launch(description)
                .map_err(|e| transport("build pipeline", e))?
                .downcast::<gstreamer::Pipeline>()
                .map_err(|_| CaptureError::Transport("pipeline is not a Pipeline".into()))?;

            let appsink = pipeline
                .by_name("appsink")
                .ok_or_else(|| CaptureError::Transport("appsink missing from pipeline".into()))?
                .downcast::<gstreamer_app::AppSink>()
                .map_err(|_| CaptureError::Transport("appsink has unexpected type".into()))?;

            let caps = gstreamer::Caps::builder("video/x-raw")
                .field("format", "RGB")
                .build();
            appsink.set_caps(Some(&caps));
            appsink.set_max_buffers(1);
            appsink.set_drop(true);
            appsink.set_sync(false);

            Ok(Self { pipeline, appsink })
        }

        pub(super) fn connect(&mut self) -> Result<(), CaptureError> {
            self.pipeline
                .set_state(gstreamer::State::Playing)
                .map_err(|e| transport("set pipeline to Playing", e))?;
            Ok(())
        }

        fn poll_bus(&self) -> Result<(), CaptureError> {
            let Some(bus) = self.pipeline.bus() else {
                return Ok(());
            };
            while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
                use gstreamer::MessageView;
                match message.view() {
                    MessageView::Error(err) => {
                        return Err(CaptureError::Transport(format!(
                            "gstreamer error from {:?}: {}",
                            err.src().map(|s| s.path_string()),
                            err.error()
                        )));
                    }
                    MessageView::Eos(..) => return Err(CaptureError::EndOfStream),
                    _ => {}
                }
            }
            Ok(())
        }
    }

    impl FrameReader for GstreamerReader {
        fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
            self.poll_bus()?;
            let timeout = gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64);
            let sample = self
                .appsink
                .try_pull_sample(timeout)
                .ok_or_else(|| CaptureError::Transport("stream stalled".into()))?;
            sample_to_image(&sample)
        }
    }

    impl Drop for GstreamerReader {
        fn drop(&mut self) {
            if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
                log::warn!("GstreamerReader: failed to stop pipeline: {e}");
            }
        }
    }

    fn sample_to_image(sample: &gstreamer::Sample) -> Result<RawImage, CaptureError> {
        let decode = |msg: &str| CaptureError::Decode(msg.to_string());
        let buffer = sample.buffer().ok_or_else(|| decode("sample missing buffer"))?;
        let caps = sample.caps().ok_or_else(|| decode("sample missing caps"))?;
        let info = gstreamer_video::VideoInfo::from_caps(caps)
            .map_err(|e| CaptureError::Decode(format!("parse caps: {e}")))?;

        let width = info.width();
        let height = info.height();
        let row_bytes = (width as usize) * 3;
        let stride = info.stride()[0] as usize;

        let map = buffer
            .map_readable()
            .map_err(|e| CaptureError::Decode(format!("map buffer: {e}")))?;
        let data = map.as_slice();

        if stride == row_bytes {
            return Ok(RawImage::rgb(width, height, data.to_vec()));
        }

        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .ok_or_else(|| decode("buffer row is out of bounds"))?,
            );
        }
        Ok(RawImage::rgb(width, height, pixels))
    }
}
