// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15 5.2.4.1) carried as
//! `codec_data` by length-prefixed streams.

use bitreader::BitReader;
use bitreader::BitReaderError;
use byteorder::BigEndian;
use byteorder::ByteOrder;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use thiserror::Error;

/// Fixed header: version, profile, compatibility, level, length size and SPS
/// count bytes, plus at least the PPS count.
const MIN_RECORD_SIZE: usize = 7;
const HEADER_SIZE: usize = 6;
/// Largest count the 5 bit `numOfSequenceParameterSets` field can express.
const MAX_SPS_ENTRIES: usize = 31;

#[derive(Error, Debug)]
pub enum AvcCError {
    #[error("avcC record too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported avcC configuration version {0}")]
    UnsupportedVersion(u8),
    #[error("avcC parameter set entry at offset {0} is truncated")]
    Truncated(usize),
    #[error("avcC parameter set entry at offset {0} is too short")]
    InvalidEntry(usize),
    #[error("a SPS of at least 8 bytes is required")]
    MissingSps,
    #[error("at least one PPS is required")]
    MissingPps,
    #[error("too many parameter sets")]
    TooManyParameterSets,
    #[error("invalid NAL length size {0}")]
    InvalidNalLengthSize(usize),
    #[error(transparent)]
    BitReader(#[from] BitReaderError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AvcDecoderConfigurationRecord {
    pub profile_idc: u8,
    pub profile_compatibility: u8,
    pub level_idc: u8,
    /// Size in bytes of the NAL unit length prefix, 1 to 4.
    pub nal_length_size: usize,
    /// Bare SPS NAL units, header byte included.
    pub sps: Vec<Bytes>,
    /// Bare PPS NAL units, header byte included.
    pub pps: Vec<Bytes>,
}

impl AvcDecoderConfigurationRecord {
    /// Reads `count` length-prefixed entries starting at `offset`. Returns the
    /// entries and the offset following them.
    fn read_entries(
        data: &[u8],
        mut offset: usize,
        count: usize,
    ) -> Result<(Vec<Bytes>, usize), AvcCError> {
        let mut entries = Vec::with_capacity(count);

        for _ in 0..count {
            let len_bytes = data
                .get(offset..offset + 2)
                .ok_or(AvcCError::Truncated(offset))?;
            let len = usize::from(BigEndian::read_u16(len_bytes));

            if len == 0 {
                return Err(AvcCError::InvalidEntry(offset));
            }

            let entry = data
                .get(offset + 2..offset + 2 + len)
                .ok_or(AvcCError::Truncated(offset))?;
            entries.push(Bytes::copy_from_slice(entry));
            offset += 2 + len;
        }

        Ok((entries, offset))
    }

    pub fn parse(data: &[u8]) -> Result<Self, AvcCError> {
        if data.len() < MIN_RECORD_SIZE {
            return Err(AvcCError::TooShort(data.len()));
        }

        let mut r = BitReader::new(&data[..HEADER_SIZE]);

        let version = r.read_u8(8)?;
        if version != 1 {
            return Err(AvcCError::UnsupportedVersion(version));
        }

        let profile_idc = r.read_u8(8)?;
        let profile_compatibility = r.read_u8(8)?;
        let level_idc = r.read_u8(8)?;
        r.skip(6)?;
        let nal_length_size = usize::from(r.read_u8(2)?) + 1;
        r.skip(3)?;
        let num_sps = usize::from(r.read_u8(5)?);

        let (sps, offset) = Self::read_entries(data, HEADER_SIZE, num_sps)?;

        let num_pps = usize::from(*data.get(offset).ok_or(AvcCError::Truncated(offset))?);
        let (pps, _) = Self::read_entries(data, offset + 1, num_pps)?;

        log::debug!(
            "avcC: profile {} level {} nal_length_size {} {} SPS {} PPS",
            profile_idc,
            level_idc,
            nal_length_size,
            sps.len(),
            pps.len()
        );

        Ok(Self {
            profile_idc,
            profile_compatibility,
            level_idc,
            nal_length_size,
            sps,
            pps,
        })
    }

    /// Builds a record from stored parameter sets. Profile, compatibility and
    /// level are lifted from the first SPS long enough to carry them.
    pub fn from_parameter_sets(
        sps: Vec<Bytes>,
        pps: Vec<Bytes>,
        nal_length_size: usize,
    ) -> Result<Self, AvcCError> {
        if !(1..=4).contains(&nal_length_size) {
            return Err(AvcCError::InvalidNalLengthSize(nal_length_size));
        }

        let first = sps
            .iter()
            .find(|s| s.len() >= 8)
            .ok_or(AvcCError::MissingSps)?;
        if pps.is_empty() {
            return Err(AvcCError::MissingPps);
        }
        if sps.len() > MAX_SPS_ENTRIES || pps.len() > usize::from(u8::MAX) {
            return Err(AvcCError::TooManyParameterSets);
        }

        Ok(Self {
            profile_idc: first[1],
            profile_compatibility: first[2],
            level_idc: first[3],
            nal_length_size,
            sps,
            pps,
        })
    }

    /// Serializes the record. The 6 and 3 reserved bits are set to one.
    pub fn to_bytes(&self) -> Bytes {
        let size = MIN_RECORD_SIZE
            + self.sps.iter().map(|s| s.len() + 2).sum::<usize>()
            + self.pps.iter().map(|p| p.len() + 2).sum::<usize>();
        let mut out = BytesMut::with_capacity(size);

        out.put_u8(1);
        out.put_u8(self.profile_idc);
        out.put_u8(self.profile_compatibility);
        out.put_u8(self.level_idc);
        out.put_u8(0xfc | ((self.nal_length_size.saturating_sub(1) as u8) & 0x03));
        out.put_u8(0xe0 | (self.sps.len() as u8 & 0x1f));
        for sps in &self.sps {
            out.put_u16(sps.len() as u16);
            out.put_slice(sps);
        }

        out.put_u8(self.pps.len() as u8);
        for pps in &self.pps {
            out.put_u16(pps.len() as u16);
            out.put_slice(pps);
        }

        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SPS: [u8; 10] = [0x67, 0x42, 0xc0, 0x1e, 0xd9, 0x00, 0xb0, 0x4b, 0x10, 0x00];
    static PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];

    fn record() -> Vec<u8> {
        let mut data = vec![0x01, 0x42, 0xc0, 0x1e, 0xff, 0xe1, 0x00, SPS.len() as u8];
        data.extend_from_slice(&SPS);
        data.extend_from_slice(&[0x01, 0x00, PPS.len() as u8]);
        data.extend_from_slice(&PPS);
        data
    }

    #[test]
    fn parse_record() {
        let avcc = AvcDecoderConfigurationRecord::parse(&record()).unwrap();
        assert_eq!(avcc.profile_idc, 0x42);
        assert_eq!(avcc.profile_compatibility, 0xc0);
        assert_eq!(avcc.level_idc, 0x1e);
        assert_eq!(avcc.nal_length_size, 4);
        assert_eq!(avcc.sps, vec![Bytes::from_static(&SPS)]);
        assert_eq!(avcc.pps, vec![Bytes::from_static(&PPS)]);
    }

    #[test]
    fn serialization_matches_input() {
        let data = record();
        let avcc = AvcDecoderConfigurationRecord::parse(&data).unwrap();
        assert_eq!(avcc.to_bytes().as_ref(), &data[..]);

        let built = AvcDecoderConfigurationRecord::from_parameter_sets(
            vec![Bytes::from_static(&SPS)],
            vec![Bytes::from_static(&PPS)],
            4,
        )
        .unwrap();
        assert_eq!(built, avcc);
    }

    #[test]
    fn malformed_records() {
        assert!(matches!(
            AvcDecoderConfigurationRecord::parse(&[0x01, 0x42, 0xc0, 0x1e, 0xff, 0xe1]),
            Err(AvcCError::TooShort(6))
        ));

        let mut data = record();
        data[0] = 2;
        assert!(matches!(
            AvcDecoderConfigurationRecord::parse(&data),
            Err(AvcCError::UnsupportedVersion(2))
        ));

        let data = record();
        assert!(matches!(
            AvcDecoderConfigurationRecord::parse(&data[..data.len() - 1]),
            Err(AvcCError::Truncated(_))
        ));

        // An empty SPS entry.
        let data = [0x01, 0x42, 0xc0, 0x1e, 0xff, 0xe1, 0x00, 0x00, 0x00];
        assert!(matches!(
            AvcDecoderConfigurationRecord::parse(&data),
            Err(AvcCError::InvalidEntry(6))
        ));
    }

    #[test]
    fn one_byte_entries_are_kept() {
        let data = [0x01, 0x42, 0xc0, 0x1e, 0xff, 0xe1, 0x00, 0x01, 0x67, 0x00];
        let record = AvcDecoderConfigurationRecord::parse(&data).unwrap();
        assert_eq!(record.sps, vec![Bytes::from_static(&[0x67])]);
        assert!(record.pps.is_empty());
    }

    #[test]
    fn building_skips_short_sps() {
        let record = AvcDecoderConfigurationRecord::from_parameter_sets(
            vec![Bytes::from_static(&SPS[..4]), Bytes::from_static(&SPS)],
            vec![Bytes::from_static(&PPS)],
            4,
        )
        .unwrap();
        assert_eq!(record.profile_idc, 0x42);
        assert_eq!(record.profile_compatibility, 0xc0);
        assert_eq!(record.level_idc, 0x1e);
        assert_eq!(record.sps.len(), 2);
    }

    #[test]
    fn building_needs_parameter_sets() {
        assert!(matches!(
            AvcDecoderConfigurationRecord::from_parameter_sets(
                vec![Bytes::from_static(&SPS[..4])],
                vec![Bytes::from_static(&PPS)],
                4
            ),
            Err(AvcCError::MissingSps)
        ));
        assert!(matches!(
            AvcDecoderConfigurationRecord::from_parameter_sets(
                vec![Bytes::from_static(&SPS)],
                vec![],
                4
            ),
            Err(AvcCError::MissingPps)
        ));
        assert!(matches!(
            AvcDecoderConfigurationRecord::from_parameter_sets(
                vec![Bytes::from_static(&SPS)],
                vec![Bytes::from_static(&PPS)],
                0
            ),
            Err(AvcCError::InvalidNalLengthSize(0))
        ));
    }

    #[test]
    fn short_length_size_is_preserved() {
        let avcc = AvcDecoderConfigurationRecord::from_parameter_sets(
            vec![Bytes::from_static(&SPS)],
            vec![Bytes::from_static(&PPS)],
            2,
        )
        .unwrap();

        let bytes = avcc.to_bytes();
        assert_eq!(bytes[4], 0xfd);
        assert_eq!(
            AvcDecoderConfigurationRecord::parse(&bytes)
                .unwrap()
                .nal_length_size,
            2
        );
    }
}
