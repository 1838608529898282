//! Video file reader using FFmpeg. Rewinds at end of file when looping.

use std::path::Path;
use std::time::Duration;

use ffmpeg_next as ffmpeg;

use super::{FrameReader, IngestOptions, RawImage};
use crate::error::CaptureError;

fn transport(context: &str, err: impl std::fmt::Display) -> CaptureError {
    CaptureError::Transport(format!("{context}: {err}"))
}

fn decode(context: &str, err: impl std::fmt::Display) -> CaptureError {
    CaptureError::Decode(format!("{context}: {err}"))
}

pub(crate) struct FfmpegFileReader {
    path: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    interval: Duration,
    repeat: bool,
}

// The scaler holds a raw SwsContext pointer; the reader is only ever used by
// the one capture thread that owns it.
unsafe impl Send for FfmpegFileReader {}

impl FfmpegFileReader {
    pub(crate) fn open(path: &Path, options: &IngestOptions) -> Result<Self, CaptureError> {
        ffmpeg::init().map_err(|e| transport("initialize ffmpeg", e))?;
        let input = ffmpeg::format::input(&path)
            .map_err(|e| transport(&format!("open '{}'", path.display()), e))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| CaptureError::Transport("file has no video track".into()))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .map_err(|e| decode("load decoder parameters", e))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| decode("open video decoder", e))?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| decode("create scaler", e))?;

        log::info!("FfmpegFileReader: opened {}", path.display());
        Ok(Self {
            path: path.display().to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            interval: options.frame_interval(),
            repeat: options.loop_files,
        })
    }

    fn decode_next(&mut self) -> Result<Option<RawImage>, CaptureError> {
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .map_err(|e| decode("send packet", e))?;

            if self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .map_err(|e| decode("scale frame to RGB", e))?;
                return frame_to_image(&rgb_frame).map(Some);
            }
        }
        Ok(None)
    }

    fn rewind(&mut self) -> Result<(), CaptureError> {
        self.input
            .seek(0, ..)
            .map_err(|e| transport("rewind", e))?;
        self.decoder.flush();
        log::debug!("FfmpegFileReader: looping {}", self.path);
        Ok(())
    }
}

impl FrameReader for FfmpegFileReader {
    fn read_frame(&mut self) -> Result<RawImage, CaptureError> {
        if let Some(image) = self.decode_next()? {
            return Ok(image);
        }
        if !self.repeat {
            return Err(CaptureError::EndOfStream);
        }
        self.rewind()?;
        self.decode_next()?.ok_or(CaptureError::EndOfStream)
    }

    fn frame_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RawImage, CaptureError> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok(RawImage::rgb(width, height, data.to_vec()));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .ok_or_else(|| CaptureError::Decode("frame row is out of bounds".into()))?,
        );
    }
    Ok(RawImage::rgb(width, height, pixels))
}
