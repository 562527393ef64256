// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reverse playback. Upstream sends groups of pictures last to first, each in
//! decode order. Buffers are gathered until a discontinuity, then split into
//! units that are queued until a whole group can be sent on.

use std::collections::VecDeque;

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::codec::h264::nalu::rfind_start_code;
use crate::codec::h264::nalu::start_code_begin;
use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::parser::SliceType;
use crate::h264parse::assembler::NextHeader;
use crate::h264parse::converter::nal_positions;
use crate::h264parse::scanner::normalize_start_code;
use crate::h264parse::types::Buffer;

/// An entry of the decode queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeUnit {
    pub nal_type: u8,
    pub nal_ref_idc: u8,
    pub first_mb_in_slice: u32,
    pub slice_type: Option<SliceType>,
    pub is_slice: bool,
    pub is_i_frame: bool,
    pub buffer: Buffer,
}

impl DecodeUnit {
    /// Classifies `buffer` by its first slice, or by its first NAL unit when
    /// it holds no slice.
    pub fn classify(buffer: Buffer, packetized: bool, nal_length_size: usize) -> Self {
        let mut unit = DecodeUnit::default();

        for (i, pos) in nal_positions(&buffer.data, packetized, nal_length_size)
            .into_iter()
            .enumerate()
        {
            let nal = &buffer.data[pos.header..];
            let header = nal[0];
            let nal_type = header & 0x1f;
            let is_slice = matches!(nal_type, 1 | 2 | 5);

            if i == 0 || is_slice {
                unit.nal_type = nal_type;
                unit.nal_ref_idc = (header >> 5) & 0x3;
            }

            if is_slice {
                let mut r = NaluReader::new(&nal[1..]);
                unit.first_mb_in_slice = r.read_ue();
                unit.slice_type = u8::try_from(r.read_ue())
                    .ok()
                    .and_then(SliceType::from_slice_type);
                unit.is_slice = true;
                unit.is_i_frame =
                    nal_type == 5 || unit.slice_type.is_some_and(|t| t.is_intra());
                break;
            }
        }

        unit.buffer = buffer;
        unit
    }

    /// The header the access unit assembler would peek at.
    pub fn header(&self) -> NextHeader {
        NextHeader {
            nal_type: self.nal_type,
            first_mb_zero: self.is_slice && self.first_mb_in_slice == 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReversePlayback {
    /// Newest buffer first.
    gather: VecDeque<Buffer>,
    /// Filled with `push_front`, drained with `pop_front`.
    decode: VecDeque<DecodeUnit>,
    /// Start of the oldest buffer processed so far, before its first start
    /// code. It ends a unit of the next, older, buffer.
    prev: Option<Bytes>,
    have_i_frame: bool,
}

impl ReversePlayback {
    pub fn gather(&mut self, buffer: Buffer) {
        self.gather.push_front(buffer);
    }

    pub fn has_gathered(&self) -> bool {
        !self.gather.is_empty()
    }

    /// Splits the gathered buffers into units, newest first. Returns the
    /// units of every group completed along the way, in output order.
    pub fn process_gathered(&mut self, packetized: bool, nal_length_size: usize) -> Vec<DecodeUnit> {
        let mut out = vec![];

        while let Some(buffer) = self.gather.pop_front() {
            if packetized {
                let unit = DecodeUnit::classify(buffer, true, nal_length_size);
                self.queue(unit, &mut out);
            } else {
                self.scan_backwards(buffer, &mut out);
            }
        }

        out
    }

    fn scan_backwards(&mut self, buffer: Buffer, out: &mut Vec<DecodeUnit>) {
        let data = match self.prev.take() {
            Some(prev) => {
                let mut joined = BytesMut::with_capacity(buffer.len() + prev.len());
                joined.put_slice(&buffer.data);
                joined.put_slice(&prev);
                joined.freeze()
            }
            None => buffer.data.clone(),
        };

        let mut end = data.len();
        while let Some(sc) = rfind_start_code(&data, end) {
            let begin = start_code_begin(&data, sc);
            let mut unit = Buffer::new(normalize_start_code(data.slice(begin..end)));
            if begin == 0 {
                unit.pts = buffer.pts;
                unit.dts = buffer.dts;
            }

            // A start code with nothing behind it.
            if end > sc + 3 {
                self.queue(DecodeUnit::classify(unit, false, 4), out);
            }

            end = begin;
            if begin == 0 {
                break;
            }
        }

        if end > 0 {
            self.prev = Some(data.slice(..end));
        }
    }

    fn queue(&mut self, unit: DecodeUnit, out: &mut Vec<DecodeUnit>) {
        if self.have_i_frame && unit.is_slice && !unit.is_i_frame {
            self.flush_into(out);
        }

        if unit.is_i_frame {
            self.have_i_frame = true;
        }

        self.decode.push_front(unit);
    }

    fn flush_into(&mut self, out: &mut Vec<DecodeUnit>) {
        let mut first = true;

        while let Some(mut unit) = self.decode.pop_front() {
            unit.buffer.discont = first;
            unit.buffer.delta_unit = !unit.is_i_frame;
            first = false;
            out.push(unit);
        }

        self.have_i_frame = false;
    }

    /// Sends on everything queued.
    pub fn flush(&mut self) -> Vec<DecodeUnit> {
        let mut out = vec![];
        self.flush_into(&mut out);
        out
    }

    /// Processes the gathered buffers and flushes, for end of stream.
    pub fn drain(&mut self, packetized: bool, nal_length_size: usize) -> Vec<DecodeUnit> {
        let mut out = self.process_gathered(packetized, nal_length_size);
        out.extend(self.flush());

        if let Some(prev) = self.prev.take() {
            log::debug!("Dropping {} bytes before the first start code", prev.len());
        }

        out
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }
}
