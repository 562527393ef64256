// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Supplemental enhancement information. Only the messages that drive
//! timestamping are decoded: buffering period (D.1.2) and picture timing
//! (D.1.3). Everything else is skipped over.

use anyhow::anyhow;
use anyhow::Context;
use enumn::N;

use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::parser::HrdParams;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::MAX_SPS_COUNT;

/// `time_offset_length` inferred when the SPS has no HRD parameters.
const DEFAULT_TIME_OFFSET_LENGTH: u8 = 24;

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeiPayloadType {
    BufferingPeriod = 0,
    PicTiming = 1,
}

/// Table D-1.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PicStruct {
    Frame = 0,
    TopField = 1,
    BottomField = 2,
    TopBottom = 3,
    BottomTop = 4,
    TopBottomTop = 5,
    BottomTopBottom = 6,
    FrameDoubling = 7,
    FrameTripling = 8,
}

impl PicStruct {
    /// `NumClockTS`.
    pub fn num_clock_ts(self) -> usize {
        match self {
            PicStruct::Frame | PicStruct::TopField | PicStruct::BottomField => 1,
            PicStruct::TopBottom | PicStruct::BottomTop | PicStruct::FrameDoubling => 2,
            PicStruct::TopBottomTop | PicStruct::BottomTopBottom | PicStruct::FrameTripling => 3,
        }
    }

    /// How long the picture is displayed, in fields.
    pub fn duration_in_fields(self) -> u32 {
        match self {
            PicStruct::TopField | PicStruct::BottomField => 1,
            PicStruct::Frame | PicStruct::TopBottom | PicStruct::BottomTop => 2,
            PicStruct::TopBottomTop | PicStruct::BottomTopBottom => 3,
            PicStruct::FrameDoubling => 4,
            PicStruct::FrameTripling => 6,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InitialCpbRemoval {
    pub delay: u32,
    pub offset: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferingPeriod {
    pub seq_parameter_set_id: u8,
    /// One entry per `SchedSelIdx` when NAL HRD parameters are present.
    pub nal: Vec<InitialCpbRemoval>,
    /// One entry per `SchedSelIdx` when VCL HRD parameters are present.
    pub vcl: Vec<InitialCpbRemoval>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClockTimestamp {
    pub ct_type: u8,
    pub nuit_field_based_flag: bool,
    pub counting_type: u8,
    pub full_timestamp_flag: bool,
    pub discontinuity_flag: bool,
    pub cnt_dropped_flag: bool,
    pub n_frames: u8,
    pub seconds_value: Option<u8>,
    pub minutes_value: Option<u8>,
    pub hours_value: Option<u8>,
    pub time_offset: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PicTiming {
    pub cpb_removal_delay: u32,
    pub dpb_output_delay: u32,
    /// Only present when the SPS sets `pic_struct_present_flag`.
    pub pic_struct: Option<PicStruct>,
    /// Bitmask of the `ct_type` values seen in this message.
    pub ct_type: u8,
    /// The clock timestamps whose `clock_timestamp_flag` was set.
    pub clock_timestamps: Vec<ClockTimestamp>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeiMessage {
    BufferingPeriod(BufferingPeriod),
    PicTiming(PicTiming),
    Unknown { payload_type: u32, payload_size: u32 },
}

impl Parser {
    /// Reads a payload type or size: a run of 0xff bytes plus a final byte,
    /// all summed.
    fn read_sei_value(r: &mut NaluReader) -> u32 {
        let mut value = 0u32;

        loop {
            let byte = r.read_bits(8);
            value = value.saturating_add(byte);
            if byte != 0xff {
                break value;
            }
        }
    }

    fn read_initial_cpb_removals(r: &mut NaluReader, hrd: &HrdParams) -> Vec<InitialCpbRemoval> {
        let len = usize::from(hrd.initial_cpb_removal_delay_length_minus1) + 1;

        (0..=hrd.cpb_cnt_minus1)
            .map(|_| InitialCpbRemoval {
                delay: r.read_bits(len),
                offset: r.read_bits(len),
            })
            .collect()
    }

    fn parse_buffering_period(&mut self, r: &mut NaluReader) -> anyhow::Result<BufferingPeriod> {
        let seq_parameter_set_id: u8 = r
            .read_ue_max(MAX_SPS_COUNT as u32 - 1)
            .context("Invalid seq_parameter_set_id")?;
        let sps = self.get_sps(seq_parameter_set_id).with_context(|| {
            format!(
                "Buffering period references unknown SPS {}",
                seq_parameter_set_id
            )
        })?;

        let mut bp = BufferingPeriod {
            seq_parameter_set_id,
            ..Default::default()
        };

        if sps.vui_parameters_present_flag {
            let vui = &sps.vui_parameters;
            if vui.nal_hrd_parameters_present_flag {
                bp.nal = Parser::read_initial_cpb_removals(r, &vui.nal_hrd_parameters);
            }
            if vui.vcl_hrd_parameters_present_flag {
                bp.vcl = Parser::read_initial_cpb_removals(r, &vui.vcl_hrd_parameters);
            }
        }

        self.activate_sps(seq_parameter_set_id);
        Ok(bp)
    }

    fn parse_clock_timestamp(r: &mut NaluReader, time_offset_length: u8) -> ClockTimestamp {
        let mut ts = ClockTimestamp {
            ct_type: r.read_bits(2) as u8,
            nuit_field_based_flag: r.read_bit(),
            counting_type: r.read_bits(5) as u8,
            full_timestamp_flag: r.read_bit(),
            discontinuity_flag: r.read_bit(),
            cnt_dropped_flag: r.read_bit(),
            n_frames: r.read_bits(8) as u8,
            ..Default::default()
        };

        if ts.full_timestamp_flag {
            ts.seconds_value = Some(r.read_bits(6) as u8);
            ts.minutes_value = Some(r.read_bits(6) as u8);
            ts.hours_value = Some(r.read_bits(5) as u8);
        } else if r.read_bit() {
            ts.seconds_value = Some(r.read_bits(6) as u8);
            if r.read_bit() {
                ts.minutes_value = Some(r.read_bits(6) as u8);
                if r.read_bit() {
                    ts.hours_value = Some(r.read_bits(5) as u8);
                }
            }
        }

        if time_offset_length > 0 {
            ts.time_offset = r.read_bits(usize::from(time_offset_length));
        }

        ts
    }

    fn parse_pic_timing(&self, r: &mut NaluReader) -> anyhow::Result<PicTiming> {
        let sps = self
            .current_sps()
            .ok_or(anyhow!("Picture timing SEI without an active SPS"))?;

        let mut pt = PicTiming::default();
        let hrd = sps.hrd();

        if let Some(hrd) = hrd {
            pt.cpb_removal_delay = r.read_bits(usize::from(hrd.cpb_removal_delay_length_minus1) + 1);
            pt.dpb_output_delay = r.read_bits(usize::from(hrd.dpb_output_delay_length_minus1) + 1);
        }

        if sps.pic_struct_present() {
            let value = r.read_bits(4) as u8;
            let pic_struct =
                PicStruct::n(value).ok_or(anyhow!("Invalid pic_struct {}", value))?;
            let time_offset_length = hrd.map_or(DEFAULT_TIME_OFFSET_LENGTH, |hrd| {
                hrd.time_offset_length
            });

            for _ in 0..pic_struct.num_clock_ts() {
                let clock_timestamp_flag = r.read_bit();
                if clock_timestamp_flag {
                    let ts = Parser::parse_clock_timestamp(r, time_offset_length);
                    pt.ct_type |= 1 << ts.ct_type;
                    pt.clock_timestamps.push(ts);
                }
            }

            pt.pic_struct = Some(pic_struct);
        }

        Ok(pt)
    }

    /// Parse every SEI message in `nalu`, in order.
    ///
    /// A buffering period makes its SPS the current one; picture timing is
    /// decoded against the current SPS.
    pub fn parse_sei(&mut self, nalu: &Nalu) -> anyhow::Result<Vec<SeiMessage>> {
        if !matches!(nalu.header.type_, NaluType::Sei) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Sei,
                nalu.header.type_
            ));
        }

        let mut r = NaluReader::new(nalu.payload());
        let mut messages = vec![];

        while r.has_more_rbsp_data() {
            let payload_type = Parser::read_sei_value(&mut r);
            let payload_size = Parser::read_sei_value(&mut r);
            let payload_start = r.position();

            let message = match SeiPayloadType::n(payload_type) {
                Some(SeiPayloadType::BufferingPeriod) => {
                    SeiMessage::BufferingPeriod(self.parse_buffering_period(&mut r)?)
                }
                Some(SeiPayloadType::PicTiming) => {
                    SeiMessage::PicTiming(self.parse_pic_timing(&mut r)?)
                }
                None => {
                    log::trace!(
                        "Skipping SEI payload type {} ({} bytes)",
                        payload_type,
                        payload_size
                    );
                    SeiMessage::Unknown {
                        payload_type,
                        payload_size,
                    }
                }
            };
            messages.push(message);

            let payload_end = payload_start + u64::from(payload_size) * 8;
            if r.position() < payload_end {
                r.skip_bits(payload_end - r.position());
            }
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::parser::Sps;
    use crate::codec::h264::parser::SpsBuilder;
    use crate::codec::h264::synthesizer::Synthesizer;

    fn hrd() -> HrdParams {
        HrdParams {
            cpb_cnt_minus1: 1,
            initial_cpb_removal_delay_length_minus1: 23,
            cpb_removal_delay_length_minus1: 15,
            dpb_output_delay_length_minus1: 5,
            time_offset_length: 0,
            ..Default::default()
        }
    }

    fn parser_with(sps: &Sps) -> Parser {
        let mut buf = Vec::new();
        Synthesizer::<Sps, &mut Vec<u8>>::synthesize(3, sps, &mut buf, true).unwrap();
        let mut parser = Parser::default();
        parser.parse_sps(&Nalu::from_bytes(&buf).unwrap()).unwrap();
        parser
    }

    fn sei_nalu(messages: &[SeiMessage], sps: &Sps) -> Vec<u8> {
        let mut buf = Vec::new();
        Synthesizer::<[SeiMessage], &mut Vec<u8>>::synthesize(messages, sps, &mut buf).unwrap();
        buf
    }

    #[test]
    fn buffering_period_reads_every_sched_sel_idx() {
        let sps = SpsBuilder::new()
            .seq_parameter_set_id(3)
            .timing_info(1, 50, true)
            .nal_hrd_parameters(hrd())
            .vcl_hrd_parameters(hrd())
            .build();
        let mut parser = parser_with(&sps);

        let bp = BufferingPeriod {
            seq_parameter_set_id: 3,
            nal: vec![
                InitialCpbRemoval {
                    delay: 90000,
                    offset: 1,
                },
                InitialCpbRemoval {
                    delay: 45000,
                    offset: 2,
                },
            ],
            vcl: vec![
                InitialCpbRemoval {
                    delay: 3,
                    offset: 4,
                },
                InitialCpbRemoval {
                    delay: 5,
                    offset: 6,
                },
            ],
        };
        let data = sei_nalu(&[SeiMessage::BufferingPeriod(bp.clone())], &sps);
        let messages = parser.parse_sei(&Nalu::from_bytes(&data).unwrap()).unwrap();
        assert_eq!(messages, vec![SeiMessage::BufferingPeriod(bp)]);
    }

    #[test]
    fn buffering_period_needs_its_sps() {
        let sps = SpsBuilder::new().nal_hrd_parameters(hrd()).build();
        let mut parser = Parser::default();

        let data = sei_nalu(
            &[SeiMessage::BufferingPeriod(BufferingPeriod::default())],
            &sps,
        );
        assert!(parser.parse_sei(&Nalu::from_bytes(&data).unwrap()).is_err());
    }

    #[test]
    fn pic_timing_with_clock_timestamps() {
        let sps = SpsBuilder::new()
            .timing_info(1001, 60000, true)
            .nal_hrd_parameters(HrdParams {
                time_offset_length: 10,
                ..hrd()
            })
            .pic_struct_present_flag(true)
            .build();
        let mut parser = parser_with(&sps);

        let pt = PicTiming {
            cpb_removal_delay: 12,
            dpb_output_delay: 4,
            pic_struct: Some(PicStruct::TopBottomTop),
            ct_type: (1 << 1) | (1 << 2),
            clock_timestamps: vec![
                ClockTimestamp {
                    ct_type: 1,
                    counting_type: 4,
                    full_timestamp_flag: true,
                    n_frames: 29,
                    seconds_value: Some(59),
                    minutes_value: Some(7),
                    hours_value: Some(23),
                    time_offset: 300,
                    ..Default::default()
                },
                ClockTimestamp {
                    ct_type: 2,
                    n_frames: 3,
                    seconds_value: Some(1),
                    minutes_value: Some(2),
                    time_offset: 5,
                    ..Default::default()
                },
            ],
        };

        let data = sei_nalu(&[SeiMessage::PicTiming(pt.clone())], &sps);
        let messages = parser.parse_sei(&Nalu::from_bytes(&data).unwrap()).unwrap();
        assert_eq!(messages, vec![SeiMessage::PicTiming(pt)]);
    }

    #[test]
    fn pic_timing_without_hrd() {
        let sps = SpsBuilder::new()
            .timing_info(1, 50, true)
            .pic_struct_present_flag(true)
            .build();
        let mut parser = parser_with(&sps);

        let pt = PicTiming {
            pic_struct: Some(PicStruct::FrameDoubling),
            ..Default::default()
        };
        let data = sei_nalu(&[SeiMessage::PicTiming(pt.clone())], &sps);
        let messages = parser.parse_sei(&Nalu::from_bytes(&data).unwrap()).unwrap();
        assert_eq!(messages, vec![SeiMessage::PicTiming(pt)]);
    }

    #[test]
    fn invalid_pic_struct_is_rejected() {
        let sps = SpsBuilder::new().pic_struct_present_flag(true).build();
        let mut parser = parser_with(&sps);

        // payload type 1, size 1, pic_struct 9 followed by one zero bit.
        let data = [0x06, 0x01, 0x01, 0b1001_0000, 0x80];
        assert!(parser.parse_sei(&Nalu::from_bytes(&data).unwrap()).is_err());
    }

    #[test]
    fn pic_timing_needs_an_active_sps() {
        let mut parser = Parser::default();
        let data = [0x06, 0x01, 0x01, 0x00, 0x80];
        assert!(parser.parse_sei(&Nalu::from_bytes(&data).unwrap()).is_err());
    }

    #[test]
    fn unknown_payloads_are_skipped() {
        let sps = SpsBuilder::new()
            .timing_info(1, 50, true)
            .pic_struct_present_flag(true)
            .build();
        let mut parser = parser_with(&sps);

        let pt = PicTiming {
            pic_struct: Some(PicStruct::BottomField),
            ..Default::default()
        };
        let messages = [
            SeiMessage::Unknown {
                payload_type: 5,
                payload_size: 300,
            },
            SeiMessage::PicTiming(pt.clone()),
        ];

        let data = sei_nalu(&messages, &sps);
        let parsed = parser.parse_sei(&Nalu::from_bytes(&data).unwrap()).unwrap();
        assert_eq!(parsed, messages.to_vec());
    }

    #[test]
    fn sei_values_chain_0xff_bytes() {
        let data = [0xff, 0xff, 0x04];
        let mut r = NaluReader::new(&data);
        assert_eq!(Parser::read_sei_value(&mut r), 514);
    }

    #[test]
    fn pic_struct_tables() {
        let durations: Vec<u32> = (0..=8)
            .map(|v| PicStruct::n(v as u8).unwrap().duration_in_fields())
            .collect();
        assert_eq!(durations, vec![2, 1, 1, 2, 2, 3, 3, 4, 6]);

        let clock_ts: Vec<usize> = (0..=8)
            .map(|v| PicStruct::n(v as u8).unwrap().num_clock_ts())
            .collect();
        assert_eq!(clock_ts, vec![1, 1, 1, 2, 2, 3, 3, 2, 3]);
        assert!(PicStruct::n(9u8).is_none());
    }
}
