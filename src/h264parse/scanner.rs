// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cuts the input into NAL units, from Annex B byte streams (start codes) or
//! from length prefixed buffers.

use std::collections::VecDeque;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::codec::h264::nalu::find_start_code;
use crate::codec::h264::nalu::start_code_begin;
use crate::codec::h264::nalu::start_code_len;
use crate::h264parse::assembler::NextHeader;
use crate::h264parse::types::Buffer;

/// Bytes kept when resyncing fails, as they may begin a start code.
const RESYNC_TAIL: usize = 2;
/// Bytes needed past the next start code before a NAL unit is emitted: the
/// header and the first byte of the payload.
const LOOKAHEAD: usize = 2;

/// A NAL unit cut out of the input. `data` still holds the prefix: a four
/// byte start code for byte streams, the length field otherwise.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScannedNal {
    pub data: Bytes,
    pub prefix_len: usize,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub discont: bool,
}

impl ScannedNal {
    /// The bare NAL unit, header byte included.
    pub fn nal(&self) -> &[u8] {
        &self.data[self.prefix_len.min(self.data.len())..]
    }

    pub fn nal_bytes(&self) -> Bytes {
        self.data.slice(self.prefix_len.min(self.data.len())..)
    }

    pub fn header(&self) -> Option<NextHeader> {
        NextHeader::parse(self.nal())
    }
}

/// Where an input buffer begins in the accumulated stream, and its timing.
#[derive(Debug)]
struct Mark {
    offset: u64,
    pts: Option<u64>,
    dts: Option<u64>,
    discont: bool,
}

/// Byte accumulator remembering which input buffer every byte came from.
#[derive(Debug, Default)]
struct Adapter {
    data: BytesMut,
    /// Stream offset of `data[0]`.
    base: u64,
    marks: VecDeque<Mark>,
}

impl Adapter {
    fn push(&mut self, buffer: Buffer) {
        self.marks.push_back(Mark {
            offset: self.base + self.data.len() as u64,
            pts: buffer.pts,
            dts: buffer.dts,
            discont: buffer.discont,
        });
        self.data.extend_from_slice(&buffer.data);
    }

    /// Drops all pending bytes along with their timing.
    fn clear(&mut self) {
        self.base += self.data.len() as u64;
        self.data.clear();
        self.marks.clear();
    }

    fn flush(&mut self, len: usize) {
        self.data.advance(len);
        self.base += len as u64;
    }

    /// Splits off the first `len` bytes. They get the timing of the buffer the
    /// first byte arrived in, unless an earlier unit already took it.
    fn take(&mut self, len: usize) -> (Bytes, Option<Mark>) {
        let mut mark = None;
        while self.marks.front().is_some_and(|m| m.offset <= self.base) {
            mark = self.marks.pop_front();
        }

        let data = self.data.split_to(len).freeze();
        self.base += len as u64;
        (data, mark)
    }
}

/// Prefixes a three byte start code with a zero byte. Four byte start codes
/// are left untouched.
pub(super) fn normalize_start_code(data: Bytes) -> Bytes {
    if start_code_len(&data) != Some(3) {
        return data;
    }

    let mut out = BytesMut::with_capacity(data.len() + 1);
    out.put_u8(0);
    out.put_slice(&data);
    out.freeze()
}

/// Annex B framer.
#[derive(Debug, Default)]
pub struct ByteStreamScanner {
    adapter: Adapter,
    synced: bool,
}

impl ByteStreamScanner {
    pub fn push(&mut self, buffer: Buffer) {
        if buffer.discont {
            if !self.adapter.data.is_empty() {
                log::debug!(
                    "Discontinuity, dropping {} pending bytes",
                    self.adapter.data.len()
                );
                self.adapter.clear();
            }
            self.synced = false;
        }

        self.adapter.push(buffer);
    }

    pub fn is_empty(&self) -> bool {
        self.adapter.data.is_empty()
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    /// Drops everything before the first start code. Returns whether one was
    /// found.
    fn resync(&mut self) -> bool {
        let data = &self.adapter.data;

        match find_start_code(data) {
            Some(offset) => {
                let begin = start_code_begin(data, offset);
                if begin > 0 {
                    log::debug!("Dropping {} bytes before start code", begin);
                    self.adapter.flush(begin);
                }
                self.synced = true;
                true
            }
            None => {
                let len = data.len();
                if len > RESYNC_TAIL {
                    log::debug!("No start code in {} bytes, dropping them", len - RESYNC_TAIL);
                    self.adapter.flush(len - RESYNC_TAIL);
                }
                false
            }
        }
    }

    /// Returns the next complete NAL unit, normalized to a four byte start
    /// code. Unless `draining`, a unit is only complete once the header of
    /// the following one has arrived.
    pub fn next_nal(&mut self, draining: bool) -> Option<ScannedNal> {
        loop {
            if !self.synced && !self.resync() {
                return None;
            }

            let data = &self.adapter.data[..];
            let Some(sc_len) = start_code_len(data) else {
                self.synced = false;
                if data.is_empty() {
                    return None;
                }
                continue;
            };

            let end = match find_start_code(&data[sc_len..]) {
                Some(rel) => {
                    let next = sc_len + rel;
                    if !draining && data.len() < next + 3 + LOOKAHEAD {
                        return None;
                    }
                    start_code_begin(data, next)
                }
                None if draining => data.len(),
                None => return None,
            };

            if end <= sc_len {
                // A start code with nothing after it.
                self.adapter.flush(end);
                continue;
            }

            let (data, mark) = self.adapter.take(end);
            let mut nal = ScannedNal {
                data: normalize_start_code(data),
                prefix_len: 4,
                ..Default::default()
            };
            if let Some(mark) = mark {
                nal.pts = mark.pts;
                nal.dts = mark.dts;
                nal.discont = mark.discont;
            }

            return Some(nal);
        }
    }

    /// Header of the unit following the last one returned by
    /// [`Self::next_nal`], if it is already buffered.
    pub fn peek_next_header(&self) -> Option<NextHeader> {
        let data = &self.adapter.data[..];
        let sc_len = start_code_len(data)?;
        NextHeader::parse(&data[sc_len..])
    }
}

/// Splits a length prefixed buffer into its NAL units. Implausible lengths
/// are clamped to the rest of the buffer. Only the first unit carries the
/// buffer's timing.
pub fn split_packetized(buffer: &Buffer, nal_length_size: usize) -> Vec<ScannedNal> {
    let data = &buffer.data;
    let mut nals = vec![];
    let mut offset = 0;

    while offset < data.len() {
        let remaining = data.len() - offset;
        if remaining <= nal_length_size {
            log::warn!(
                "Dropping {} trailing bytes, too short for a NAL unit",
                remaining
            );
            break;
        }

        let declared =
            BigEndian::read_uint(&data[offset..offset + nal_length_size], nal_length_size);
        let available = remaining - nal_length_size;
        let len = match usize::try_from(declared) {
            Ok(len) if len > 1 && len <= available => len,
            _ => {
                log::warn!(
                    "Invalid NAL unit length {} with {} bytes left, using the rest of the buffer",
                    declared,
                    available
                );
                available
            }
        };

        let first = nals.is_empty();
        nals.push(ScannedNal {
            data: data.slice(offset..offset + nal_length_size + len),
            prefix_len: nal_length_size,
            pts: if first { buffer.pts } else { None },
            dts: if first { buffer.dts } else { None },
            discont: first && buffer.discont,
        });
        offset += nal_length_size + len;
    }

    nals
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(scanner: &mut ByteStreamScanner, draining: bool) -> Vec<ScannedNal> {
        std::iter::from_fn(|| scanner.next_nal(draining)).collect()
    }

    #[test]
    fn splits_at_start_codes() {
        let mut scanner = ByteStreamScanner::default();
        scanner.push(Buffer::new(vec![
            0x00, 0x00, 0x00, 0x01, 0x67, 0xaa, 0xbb, 0x00, 0x00, 0x01, 0x68, 0xcc, 0x00, 0x00,
            0x00, 0x01, 0x65, 0x88, 0x84,
        ]));

        let nals = scan_all(&mut scanner, false);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0].data.as_ref(), &[0x00, 0x00, 0x00, 0x01, 0x67, 0xaa, 0xbb]);
        // The three byte start code is widened.
        assert_eq!(nals[1].data.as_ref(), &[0x00, 0x00, 0x00, 0x01, 0x68, 0xcc]);
        assert_eq!(nals[1].nal(), &[0x68, 0xcc]);

        let next = scanner.peek_next_header().unwrap();
        assert_eq!(next.nal_type, 5);
        assert!(next.first_mb_zero);

        let last = scanner.next_nal(true).unwrap();
        assert_eq!(last.data.as_ref(), &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84]);
        assert!(scanner.next_nal(true).is_none());
        assert!(scanner.peek_next_header().is_none());
    }

    #[test]
    fn waits_for_lookahead() {
        let mut scanner = ByteStreamScanner::default();
        scanner.push(Buffer::new(vec![
            0x00, 0x00, 0x00, 0x01, 0x09, 0xf0, 0x00, 0x00, 0x00, 0x01, 0x67,
        ]));
        // Only the next header byte is there.
        assert!(scanner.next_nal(false).is_none());

        scanner.push(Buffer::new(vec![0x42]));
        let nal = scanner.next_nal(false).unwrap();
        assert_eq!(nal.nal(), &[0x09, 0xf0]);
    }

    #[test]
    fn resyncs_on_garbage() {
        let mut scanner = ByteStreamScanner::default();
        scanner.push(Buffer::new(vec![0xaa, 0xbb, 0xcc, 0x00, 0x00]));
        assert!(scanner.next_nal(false).is_none());

        // The kept zeros complete a start code with the next buffer.
        scanner.push(Buffer::new(vec![
            0x01, 0x09, 0x10, 0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00,
        ]));
        let nal = scanner.next_nal(false).unwrap();
        assert_eq!(nal.data.as_ref(), &[0x00, 0x00, 0x00, 0x01, 0x09, 0x10]);
    }

    #[test]
    fn discont_forces_resync() {
        let mut scanner = ByteStreamScanner::default();
        scanner.push(Buffer::new(vec![0x00, 0x00, 0x01, 0x09, 0x10]));
        scanner.next_nal(true).unwrap();

        scanner.push(
            Buffer::new(vec![0x12, 0x34, 0x00, 0x00, 0x01, 0x09, 0x30]).with_discont(true),
        );
        let nal = scanner.next_nal(true).unwrap();
        assert_eq!(nal.nal(), &[0x09, 0x30]);
        assert!(nal.discont);
    }

    #[test]
    fn discont_drops_pending_unit() {
        let mut scanner = ByteStreamScanner::default();
        scanner.push(Buffer::new(vec![
            0x00, 0x00, 0x00, 0x01, 0x09, 0x10, 0x00, 0x00, 0x00, 0x01, 0x65, 0x88,
        ]));
        let aud = scanner.next_nal(false).unwrap();
        assert_eq!(aud.nal(), &[0x09, 0x10]);

        // The slice is cut short by the discontinuity and never completed.
        scanner.push(
            Buffer::new(vec![0xde, 0xad, 0x00, 0x00, 0x00, 0x01, 0x09, 0x30]).with_discont(true),
        );
        let nals = scan_all(&mut scanner, true);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].nal(), &[0x09, 0x30]);
        assert!(nals[0].discont);
    }

    #[test]
    fn timestamps_follow_the_first_byte() {
        let mut scanner = ByteStreamScanner::default();
        scanner.push(
            Buffer::new(vec![
                0x00, 0x00, 0x00, 0x01, 0x09, 0xf0, 0x00, 0x00, 0x00, 0x01, 0x67, 0x42,
            ])
            .with_timestamps(Some(1000), Some(900)),
        );
        scanner.push(
            Buffer::new(vec![
                0xc0, 0x1e, 0x00, 0x00, 0x00, 0x01, 0x68, 0xce, 0x3c, 0x80,
            ])
            .with_timestamps(Some(2000), Some(1900)),
        );

        let nals = scan_all(&mut scanner, true);
        assert_eq!(nals.len(), 3);
        assert_eq!((nals[0].pts, nals[0].dts), (Some(1000), Some(900)));
        // Starts in the first buffer, which already gave its timestamps away.
        assert_eq!(nals[1].nal(), &[0x67, 0x42, 0xc0, 0x1e]);
        assert_eq!((nals[1].pts, nals[1].dts), (None, None));
        assert_eq!((nals[2].pts, nals[2].dts), (Some(2000), Some(1900)));
    }

    #[test]
    fn empty_units_are_skipped() {
        let mut scanner = ByteStreamScanner::default();
        scanner.push(Buffer::new(vec![
            0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x09, 0x10, 0x00, 0x00, 0x01,
        ]));

        let nals = scan_all(&mut scanner, true);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].nal(), &[0x09, 0x10]);
        assert!(scanner.is_empty());
    }

    #[test]
    fn packetized_lengths() {
        let buffer = Buffer::new(vec![
            0x00, 0x02, 0x09, 0x10, // AUD
            0x00, 0x03, 0x65, 0x88, 0x80, // IDR
        ])
        .with_timestamps(Some(5), Some(5));

        let nals = split_packetized(&buffer, 2);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0].nal(), &[0x09, 0x10]);
        assert_eq!(nals[0].pts, Some(5));
        assert_eq!(nals[1].nal(), &[0x65, 0x88, 0x80]);
        assert_eq!(nals[1].pts, None);
        assert_eq!(nals[1].header().map(|h| h.nal_type), Some(5));
    }

    #[test]
    fn packetized_lengths_are_clamped() {
        // Declared 200 bytes, 3 available.
        let buffer = Buffer::new(vec![0x00, 0x00, 0x00, 0xc8, 0x65, 0x88, 0x80]);
        let nals = split_packetized(&buffer, 4);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].nal(), &[0x65, 0x88, 0x80]);

        // A length of one is not plausible either.
        let buffer = Buffer::new(vec![0x01, 0x65, 0x88, 0x80]);
        let nals = split_packetized(&buffer, 1);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].nal(), &[0x65, 0x88, 0x80]);

        // Not even room for a length field.
        let buffer = Buffer::new(vec![0x00, 0x02, 0x09, 0x10, 0x00]);
        let nals = split_packetized(&buffer, 2);
        assert_eq!(nals.len(), 1);
    }

    #[test]
    fn normalization_only_touches_short_start_codes() {
        let short = Bytes::from_static(&[0x00, 0x00, 0x01, 0x09]);
        assert_eq!(
            normalize_start_code(short).as_ref(),
            &[0x00, 0x00, 0x00, 0x01, 0x09]
        );

        let long = Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x09]);
        assert_eq!(normalize_start_code(long.clone()), long);
    }
}
