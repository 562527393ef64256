// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::anyhow;
use enumn::N;

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    Reserved17 = 17,
    Reserved18 = 18,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

impl NaluType {
    /// Slice NAL units whose header carries `first_mb_in_slice`: non-IDR,
    /// partition A and IDR.
    pub fn is_picture_slice(self) -> bool {
        matches!(self, NaluType::Slice | NaluType::SliceDpa | NaluType::SliceIdr)
    }

    /// Non-VCL units that can only appear before the first slice of an access
    /// unit, and therefore end the previous one.
    pub fn starts_access_unit(self) -> bool {
        matches!(
            self,
            NaluType::Sei
                | NaluType::Sps
                | NaluType::Pps
                | NaluType::AuDelimiter
                | NaluType::PrefixUnit
                | NaluType::SubsetSps
                | NaluType::DepthSps
                | NaluType::Reserved17
                | NaluType::Reserved18
        )
    }
}

/// The one byte NAL unit header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
}

impl NaluHeader {
    /// Length of the header in bytes.
    pub const LEN: usize = 1;

    pub fn parse(byte: u8) -> anyhow::Result<Self> {
        if byte & 0x80 != 0 {
            return Err(anyhow!("forbidden_zero_bit is set"));
        }

        let nal_unit_type = byte & 0x1f;
        let type_ = NaluType::n(nal_unit_type)
            .ok_or_else(|| anyhow!("Unsupported NAL unit type {}", nal_unit_type))?;

        Ok(Self {
            ref_idc: (byte >> 5) & 0x3,
            type_,
            idr_pic_flag: matches!(type_, NaluType::SliceIdr),
        })
    }
}

/// A NAL unit without its start code or length prefix.
#[derive(Debug, Clone, Copy)]
pub struct Nalu<'a> {
    pub header: NaluHeader,
    data: &'a [u8],
}

impl<'a> Nalu<'a> {
    /// Wraps a bare NAL unit, header byte included.
    pub fn from_bytes(data: &'a [u8]) -> anyhow::Result<Self> {
        let first = *data.first().ok_or_else(|| anyhow!("Empty NAL unit"))?;

        Ok(Self {
            header: NaluHeader::parse(first)?,
            data,
        })
    }

    /// The RBSP payload (still escaped) following the header.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[NaluHeader::LEN..]
    }
}

impl AsRef<[u8]> for Nalu<'_> {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}

/// Returns the offset of the first `00 00 01` sequence in `data`.
///
/// The bytes are fed through a 32-bit shift register, which is how a masked
/// `0xffffff00 == 0x00000100` scan reads when it is allowed to run to the last
/// byte.
pub fn find_start_code(data: &[u8]) -> Option<usize> {
    let mut state = 0xffff_ffffu32;

    for (i, byte) in data.iter().enumerate() {
        state = (state << 8) | u32::from(*byte);
        if state & 0x00ff_ffff == 0x0000_0001 {
            return Some(i - 2);
        }
    }

    None
}

/// Returns the offset of the last `00 00 01` sequence lying entirely within
/// `data[..end]`.
pub fn rfind_start_code(data: &[u8], end: usize) -> Option<usize> {
    let end = end.min(data.len());
    data[..end]
        .windows(3)
        .rposition(|window| window == [0x00, 0x00, 0x01])
}

/// Widens a `00 00 01` match at `offset` to cover the zero byte of a four byte
/// start code when there is one.
pub fn start_code_begin(data: &[u8], offset: usize) -> usize {
    if offset > 0 && data[offset - 1] == 0x00 {
        offset - 1
    } else {
        offset
    }
}

/// Length of the start code at the beginning of `data`, if any.
pub fn start_code_len(data: &[u8]) -> Option<usize> {
    if data.starts_with(&[0x00, 0x00, 0x01]) {
        Some(3)
    } else if data.starts_with(&[0x00, 0x00, 0x00, 0x01]) {
        Some(4)
    } else {
        None
    }
}
