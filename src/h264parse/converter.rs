// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Rewrites NAL unit prefixes between Annex B start codes and big-endian
//! length fields.

use byteorder::BigEndian;
use byteorder::ByteOrder;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::codec::h264::nalu::find_start_code;
use crate::codec::h264::nalu::start_code_begin;

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Location of a NAL unit inside a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NalPosition {
    /// Offset of the start code or length field.
    pub offset: usize,
    /// Offset of the NAL header byte.
    pub header: usize,
}

/// Lists the NAL units of `data`, framed with start codes or with
/// `nal_length_size` byte lengths. Implausible lengths run to the end of the
/// buffer.
pub fn nal_positions(data: &[u8], packetized: bool, nal_length_size: usize) -> Vec<NalPosition> {
    let mut positions = vec![];

    if packetized {
        let mut offset = 0;
        while data.len() > offset + nal_length_size {
            let len = BigEndian::read_uint(&data[offset..], nal_length_size) as usize;
            positions.push(NalPosition {
                offset,
                header: offset + nal_length_size,
            });
            let available = data.len() - offset - nal_length_size;
            offset += nal_length_size + if len > 1 && len <= available { len } else { available };
        }
    } else {
        let mut search = 0;
        while let Some(rel) = find_start_code(&data[search..]) {
            let sc = search + rel;
            if sc + 3 < data.len() {
                positions.push(NalPosition {
                    offset: start_code_begin(data, sc),
                    header: sc + 3,
                });
            }
            search = sc + 3;
        }
    }

    positions
}

/// Output framing conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Converter {
    pub input_packetized: bool,
    pub output_packetized: bool,
    /// Length field size of packetized data, 4 for byte streams.
    pub nal_length_size: usize,
}

impl Default for Converter {
    fn default() -> Self {
        Self {
            input_packetized: false,
            output_packetized: false,
            nal_length_size: 4,
        }
    }
}

impl Converter {
    pub fn new(input_packetized: bool, output_packetized: bool, nal_length_size: usize) -> Self {
        Self {
            input_packetized,
            output_packetized,
            nal_length_size,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.input_packetized == self.output_packetized
    }

    /// Rewrites the prefixes of `data` for the output framing. Byte stream
    /// input is a single NAL unit behind a four byte start code; packetized
    /// input may hold several units.
    pub fn write_nal_prefix(&self, data: Bytes) -> Bytes {
        if self.is_passthrough() {
            return data;
        }

        if self.output_packetized {
            if data.len() < START_CODE.len() {
                return data;
            }

            let mut out = BytesMut::from(&data[..]);
            let len = (data.len() - START_CODE.len()) as u64;
            BigEndian::write_uint(&mut out[..START_CODE.len()], len, START_CODE.len());
            return out.freeze();
        }

        if self.nal_length_size == 4 {
            self.rewrite_lengths(data)
        } else {
            self.rechunk(&data)
        }
    }

    /// Replaces four byte lengths with start codes, in place.
    fn rewrite_lengths(&self, data: Bytes) -> Bytes {
        let mut out = BytesMut::from(&data[..]);
        let mut offset = 0;

        while out.len() >= offset + 4 {
            let len = BigEndian::read_u32(&out[offset..]) as usize;
            if len == 1 {
                // Already a start code.
                break;
            }

            out[offset..offset + 4].copy_from_slice(&START_CODE);
            offset += 4;

            if len > out.len() - offset {
                log::warn!(
                    "NAL unit length {} exceeds the {} bytes left",
                    len,
                    out.len() - offset
                );
                break;
            }
            offset += len;
        }

        out.freeze()
    }

    /// Copies every unit behind a start code, for length fields shorter than
    /// a start code.
    fn rechunk(&self, data: &[u8]) -> Bytes {
        let nls = self.nal_length_size;
        let mut out = BytesMut::with_capacity(data.len() + data.len() / 2);
        let mut offset = 0;

        while data.len() > offset + nls {
            let mut len = BigEndian::read_uint(&data[offset..], nls) as usize;
            let available = data.len() - offset - nls;
            if len > available {
                log::warn!(
                    "NAL unit length {} exceeds the {} bytes left, clamping",
                    len,
                    available
                );
                len = available;
            }

            out.put_slice(&START_CODE);
            out.put_slice(&data[offset + nls..offset + nls + len]);
            offset += nls + len;

            if len == 0 {
                break;
            }
        }

        out.freeze()
    }

    /// Prefixes a bare NAL unit for the output framing. Returns `None` when
    /// the unit is too large for the length field.
    pub fn make_nal(&self, nal: &[u8]) -> Option<Bytes> {
        if self.output_packetized {
            let len = nal.len() as u64;
            if len >> (8 * self.nal_length_size) != 0 {
                log::warn!(
                    "NAL unit of {} bytes does not fit a {} byte length, skipping",
                    len,
                    self.nal_length_size
                );
                return None;
            }

            let mut out = BytesMut::with_capacity(nal.len() + self.nal_length_size);
            out.put_uint(len, self.nal_length_size);
            out.put_slice(nal);
            Some(out.freeze())
        } else {
            let mut out = BytesMut::with_capacity(nal.len() + START_CODE.len());
            out.put_slice(&START_CODE);
            out.put_slice(nal);
            Some(out.freeze())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_keeps_buffers() {
        let data = Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x09, 0x10]);
        let converter = Converter::default();
        assert!(converter.is_passthrough());
        assert_eq!(converter.write_nal_prefix(data.clone()), data);
    }

    #[test]
    fn byte_stream_to_sample() {
        let converter = Converter::new(false, true, 4);
        let out = converter.write_nal_prefix(Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x80,
        ]));
        assert_eq!(out.as_ref(), &[0x00, 0x00, 0x00, 0x03, 0x65, 0x88, 0x80]);
    }

    #[test]
    fn sample_to_byte_stream_in_place() {
        let converter = Converter::new(true, false, 4);
        let out = converter.write_nal_prefix(Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x02, 0x09, 0x10, 0x00, 0x00, 0x00, 0x03, 0x65, 0x88, 0x80,
        ]));
        assert_eq!(
            out.as_ref(),
            &[0x00, 0x00, 0x00, 0x01, 0x09, 0x10, 0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x80]
        );

        // Oversize second length: the prefix is still replaced, then it stops.
        let out = converter.write_nal_prefix(Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x02, 0x09, 0x10, 0x00, 0x00, 0x01, 0x00, 0x65,
        ]));
        assert_eq!(
            out.as_ref(),
            &[0x00, 0x00, 0x00, 0x01, 0x09, 0x10, 0x00, 0x00, 0x00, 0x01, 0x65]
        );
    }

    #[test]
    fn existing_start_codes_stop_the_rewrite() {
        let converter = Converter::new(true, false, 4);
        let data = Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x09, 0x10]);
        assert_eq!(converter.write_nal_prefix(data.clone()), data);
    }

    #[test]
    fn short_lengths_are_rechunked() {
        let converter = Converter::new(true, false, 2);
        let out = converter.write_nal_prefix(Bytes::from_static(&[
            0x00, 0x02, 0x09, 0x10, 0x00, 0x09, 0x65, 0x88,
        ]));
        // The second length is clamped to the two bytes left.
        assert_eq!(
            out.as_ref(),
            &[0x00, 0x00, 0x00, 0x01, 0x09, 0x10, 0x00, 0x00, 0x00, 0x01, 0x65, 0x88]
        );
    }

    #[test]
    fn made_nals_follow_output_framing() {
        let nal = [0x68, 0xce, 0x3c, 0x80];

        let converter = Converter::new(true, true, 2);
        assert_eq!(
            converter.make_nal(&nal).unwrap().as_ref(),
            &[0x00, 0x04, 0x68, 0xce, 0x3c, 0x80]
        );

        let converter = Converter::new(true, false, 2);
        assert_eq!(
            converter.make_nal(&nal).unwrap().as_ref(),
            &[0x00, 0x00, 0x00, 0x01, 0x68, 0xce, 0x3c, 0x80]
        );
    }

    #[test]
    fn oversized_nals_are_not_prefixed() {
        let mut nal = vec![0x67];
        nal.resize(300, 0xaa);

        let converter = Converter::new(true, true, 1);
        assert_eq!(converter.make_nal(&nal), None);
        assert_eq!(converter.make_nal(&nal[..255]).unwrap()[0], 0xff);

        let converter = Converter::new(true, true, 2);
        let out = converter.make_nal(&nal).unwrap();
        assert_eq!(&out[..3], &[0x01, 0x2c, 0x67]);
        assert_eq!(out.len(), 302);

        // Start codes carry no length.
        let converter = Converter::new(false, false, 1);
        assert_eq!(converter.make_nal(&nal).unwrap().len(), 304);
    }

    #[test]
    fn positions_in_both_framings() {
        let data = [
            0x00, 0x00, 0x01, 0x09, 0x10, 0x00, 0x00, 0x00, 0x01, 0x65, 0x88,
        ];
        assert_eq!(
            nal_positions(&data, false, 4),
            vec![
                NalPosition {
                    offset: 0,
                    header: 3
                },
                NalPosition {
                    offset: 5,
                    header: 9
                },
            ]
        );

        let data = [0x02, 0x09, 0x10, 0x02, 0x65, 0x88];
        assert_eq!(
            nal_positions(&data, true, 1),
            vec![
                NalPosition {
                    offset: 0,
                    header: 1
                },
                NalPosition {
                    offset: 3,
                    header: 4
                },
            ]
        );
    }
}
