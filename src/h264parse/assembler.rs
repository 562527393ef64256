// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Access unit boundary detection and merging.

use bytes::Bytes;
use bytes::BytesMut;

use crate::codec::h264::nalu::NaluType;
use crate::h264parse::types::Buffer;

/// What the assembler needs to know about the NAL unit following the current
/// one: its type and whether `first_mb_in_slice` is 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextHeader {
    pub nal_type: u8,
    pub first_mb_zero: bool,
}

impl NextHeader {
    /// Reads the header from a bare NAL unit. `first_mb_in_slice` is 0 iff
    /// its ue(v) code is a single 1 bit, i.e. the top bit of the byte after
    /// the header.
    pub fn parse(nal: &[u8]) -> Option<Self> {
        let header = *nal.first()?;

        Some(Self {
            nal_type: header & 0x1f,
            first_mb_zero: nal.get(1).is_some_and(|b| b & 0x80 != 0),
        })
    }

    fn nalu_type(&self) -> Option<NaluType> {
        NaluType::n(self.nal_type)
    }

    pub fn is_picture_slice(&self) -> bool {
        self.nalu_type().is_some_and(NaluType::is_picture_slice)
    }

    fn starts_access_unit(&self) -> bool {
        self.nalu_type().is_some_and(NaluType::starts_access_unit)
    }
}

/// A buffer ready to leave the element.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub buffer: Buffer,
    /// Offset of the prefix of the first IDR NAL unit in `buffer`.
    pub idr_offset: Option<usize>,
    /// At least one slice is in the buffer.
    pub has_picture: bool,
    /// The buffer holds a whole access unit rather than one NAL unit.
    pub merged: bool,
}

#[derive(Debug, Default)]
pub struct AuAssembler {
    picture_start: bool,
    au: BytesMut,
    idr_offset: Option<usize>,
    has_picture: bool,
    pts: Option<u64>,
    dts: Option<u64>,
    duration: Option<u64>,
    discont: bool,
    delta_unit: bool,
}

impl AuAssembler {
    /// Latches the processing of a slice of type 1, 2 or 5. Returns whether
    /// the slice starts a picture.
    pub fn latch_slice(&mut self, first_mb_zero: bool) -> bool {
        self.picture_start = true;
        first_mb_zero
    }

    /// Whether the unit just processed is the last of its access unit, given
    /// the header of the following unit. `None` means nothing follows.
    pub fn is_complete(&mut self, next: Option<NextHeader>) -> bool {
        let complete = match next {
            None => true,
            Some(next) => {
                self.picture_start
                    && (next.starts_access_unit()
                        || (next.is_picture_slice() && next.first_mb_zero))
            }
        };

        if complete {
            self.picture_start = false;
        }

        complete
    }

    /// Appends a NAL unit, prefix included. The first unit's timing stands
    /// for the access unit until a picture start overrides it.
    pub fn append(
        &mut self,
        data: &[u8],
        pts: Option<u64>,
        dts: Option<u64>,
        discont: bool,
        is_idr: bool,
    ) {
        if self.au.is_empty() {
            self.pts = pts;
            self.dts = dts;
            self.discont = discont;
        }

        if is_idr && self.idr_offset.is_none() {
            self.idr_offset = Some(self.au.len());
        }

        self.au.extend_from_slice(data);
    }

    /// Gives the access unit the timing of its picture-start slice.
    pub fn mark_picture(
        &mut self,
        pts: Option<u64>,
        dts: Option<u64>,
        duration: Option<u64>,
        delta_unit: bool,
    ) {
        self.has_picture = true;
        self.pts = pts;
        self.dts = dts;
        self.duration = duration;
        self.delta_unit = delta_unit;
    }

    pub fn is_empty(&self) -> bool {
        self.au.is_empty()
    }

    /// Hands out the accumulated access unit, if any.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.au.is_empty() {
            return None;
        }

        let data: Bytes = self.au.split().freeze();
        let frame = Frame {
            buffer: Buffer {
                data,
                pts: self.pts.take(),
                dts: self.dts.take(),
                duration: self.duration.take(),
                discont: std::mem::take(&mut self.discont),
                delta_unit: std::mem::take(&mut self.delta_unit),
            },
            idr_offset: self.idr_offset.take(),
            has_picture: std::mem::take(&mut self.has_picture),
            merged: true,
        };

        log::trace!(
            "Access unit of {} bytes, pts {:?} dts {:?}",
            frame.buffer.len(),
            frame.buffer.pts,
            frame.buffer.dts
        );

        Some(frame)
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(nal_type: u8, first_mb_zero: bool) -> Option<NextHeader> {
        Some(NextHeader {
            nal_type,
            first_mb_zero,
        })
    }

    #[test]
    fn next_header_bits() {
        assert_eq!(NextHeader::parse(&[0x65, 0x88]), header(5, true));
        assert_eq!(NextHeader::parse(&[0x41, 0x40]), header(1, false));
        assert_eq!(NextHeader::parse(&[0x09]), header(9, false));
        assert_eq!(NextHeader::parse(&[]), None);
    }

    #[test]
    fn parameter_sets_do_not_end_anything_before_a_slice() {
        let mut assembler = AuAssembler::default();
        // SPS followed by PPS, and PPS followed by the IDR.
        assert!(!assembler.is_complete(header(8, false)));
        assert!(!assembler.is_complete(header(5, true)));
    }

    #[test]
    fn boundaries_after_a_slice() {
        let mut assembler = AuAssembler::default();

        assert!(assembler.latch_slice(true));
        // A second slice of the same picture.
        assert!(!assembler.is_complete(header(5, false)));
        assert!(!assembler.latch_slice(false));
        // Next picture.
        assert!(assembler.is_complete(header(1, true)));

        assembler.latch_slice(true);
        // SEI, AUD, prefix NAL and the reserved range all start a new unit.
        for nal_type in [6, 9, 14, 18] {
            let mut a = AuAssembler::default();
            a.latch_slice(true);
            assert!(a.is_complete(header(nal_type, false)), "type {}", nal_type);
        }
        // End of sequence does not.
        assert!(!assembler.is_complete(header(10, false)));
        // Data partitions B and C never open a picture.
        assert!(!assembler.is_complete(header(3, true)));
        assert!(assembler.is_complete(None));
        // The latch was cleared.
        assert!(!assembler.is_complete(header(7, false)));
    }

    #[test]
    fn merges_with_picture_timing() {
        let mut assembler = AuAssembler::default();
        assert!(assembler.finish().is_none());

        assembler.append(&[0, 0, 0, 1, 0x09, 0x10], Some(10), Some(5), true, false);
        assembler.append(&[0, 0, 0, 1, 0x65, 0x88], None, None, false, true);
        assembler.mark_picture(Some(10), Some(7), Some(40), false);
        assembler.append(&[0, 0, 0, 1, 0x65, 0x08], None, None, false, true);

        let frame = assembler.finish().unwrap();
        assert_eq!(frame.buffer.len(), 18);
        assert_eq!(frame.buffer.pts, Some(10));
        assert_eq!(frame.buffer.dts, Some(7));
        assert_eq!(frame.buffer.duration, Some(40));
        assert!(frame.buffer.discont);
        assert!(!frame.buffer.delta_unit);
        assert_eq!(frame.idr_offset, Some(6));
        assert!(frame.has_picture);
        assert!(frame.merged);

        assert!(assembler.is_empty());
        assembler.append(&[0, 0, 0, 1, 0x41, 0x9a], Some(50), None, false, false);
        let frame = assembler.finish().unwrap();
        assert_eq!(frame.buffer.pts, Some(50));
        assert!(!frame.buffer.discont);
        assert_eq!(frame.idr_offset, None);
        assert!(!frame.has_picture);
    }
}
