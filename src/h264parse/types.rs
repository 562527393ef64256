// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The narrow pipeline surface the element talks to: buffers in and out,
//! stream descriptions, events and the downstream sink.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use thiserror::Error;

use crate::Resolution;

/// A chunk of stream data with its timing. Timestamps and durations are in
/// nanoseconds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Buffer {
    pub data: Bytes,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub duration: Option<u64>,
    /// Data is not contiguous with the previous buffer.
    pub discont: bool,
    /// The buffer cannot be decoded on its own.
    pub delta_unit: bool,
}

impl Buffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_timestamps(mut self, pts: Option<u64>, dts: Option<u64>) -> Self {
        self.pts = pts;
        self.dts = dts;
        self
    }

    pub fn with_discont(mut self, discont: bool) -> Self {
        self.discont = discont;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum StreamFormat {
    /// Annex B, start code delimited.
    #[default]
    ByteStream,
    /// Length prefixed NAL units described by an `avcC` record.
    Avc,
}

impl FromStr for StreamFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "byte-stream" => Ok(StreamFormat::ByteStream),
            "avc" => Ok(StreamFormat::Avc),
            _ => Err("unrecognized stream format. Valid values: byte-stream, avc"),
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamFormat::ByteStream => write!(f, "byte-stream"),
            StreamFormat::Avc => write!(f, "avc"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Alignment {
    #[default]
    Nal,
    Au,
}

impl fmt::Display for Alignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alignment::Nal => write!(f, "nal"),
            Alignment::Au => write!(f, "au"),
        }
    }
}

/// Description of an H.264 stream, as negotiated on either side of the
/// element.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Caps {
    pub stream_format: StreamFormat,
    pub alignment: Alignment,
    /// The `avcC` record, for [`StreamFormat::Avc`].
    pub codec_data: Option<Bytes>,
    pub resolution: Option<Resolution>,
    /// Frames per second as a reduced fraction.
    pub framerate: Option<(u32, u32)>,
}

impl Caps {
    pub fn byte_stream() -> Self {
        Self::default()
    }

    pub fn avc(codec_data: impl Into<Bytes>) -> Self {
        Self {
            stream_format: StreamFormat::Avc,
            alignment: Alignment::Au,
            codec_data: Some(codec_data.into()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// End of a flush: all queued data and parsing state is dropped.
    FlushStop,
    /// No more data will come. Everything pending is pushed.
    Eos,
    /// A new segment. A negative rate selects reverse playback.
    Segment { rate: f64 },
}

/// Why downstream refused a buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("flushing")]
    Flushing,
    #[error("end of stream")]
    Eos,
    #[error("not linked")]
    NotLinked,
    #[error("not negotiated")]
    NotNegotiated,
    #[error("stream error: {0}")]
    Error(String),
}

pub type FlowResult = Result<(), FlowError>;

/// Where the element sends its output.
pub trait Downstream {
    /// Hands `buffer` over. An error stops the element's processing and is
    /// returned to the caller unchanged.
    fn push(&mut self, buffer: Buffer) -> FlowResult;

    /// Called before the first buffer and whenever the output description
    /// changes.
    fn set_caps(&mut self, _caps: &Caps) {}
}

impl Downstream for Vec<Buffer> {
    fn push(&mut self, buffer: Buffer) -> FlowResult {
        Vec::push(self, buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_format_names() {
        for format in [StreamFormat::ByteStream, StreamFormat::Avc] {
            assert_eq!(format.to_string().parse::<StreamFormat>(), Ok(format));
        }
        assert!("annexb".parse::<StreamFormat>().is_err());
    }

    #[test]
    fn vec_collects_buffers() {
        let mut sink = Vec::new();
        Downstream::push(&mut sink, Buffer::new(vec![1u8, 2, 3])).unwrap();
        Downstream::set_caps(&mut sink, &Caps::byte_stream());
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].len(), 3);
    }
}
