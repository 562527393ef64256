// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.
use std::io::Write;

use thiserror::Error;

use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_writer::NaluWriter;
use crate::codec::h264::nalu_writer::NaluWriterError;
use crate::codec::h264::parser::HrdParams;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::parser::EXTENDED_SAR;
use crate::codec::h264::sei::BufferingPeriod;
use crate::codec::h264::sei::ClockTimestamp;
use crate::codec::h264::sei::PicTiming;
use crate::codec::h264::sei::SeiMessage;

mod private {
    pub trait NaluStruct {}
}

impl private::NaluStruct for Sps {}

impl private::NaluStruct for Pps {}

impl private::NaluStruct for SliceHeader {}

impl private::NaluStruct for [SeiMessage] {}

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings")]
    Unsupported,
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// `time_offset_length` when no HRD parameters are signalled.
const DEFAULT_TIME_OFFSET_LENGTH: usize = 24;

/// A helper to output typed NALUs to [`std::io::Write`] using [`NaluWriter`].
/// The output is a bare NAL unit: callers add the start code or length prefix
/// their framing needs.
pub struct Synthesizer<'n, N: private::NaluStruct + ?Sized, W: Write> {
    writer: NaluWriter<W>,
    nalu: &'n N,
}

impl<N: private::NaluStruct + ?Sized, W: Write> Synthesizer<'_, N, W> {
    fn u<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_u(bits, value)?;
        Ok(())
    }

    fn ue<T: Into<u32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_ue(value)?;
        Ok(())
    }

    fn se<T: Into<i32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_se(value)?;
        Ok(())
    }

    fn rbsp_trailing_bits(&mut self) -> SynthesizerResult<()> {
        self.writer.write_trailing_bits()?;
        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Sps, W> {
    pub fn synthesize(
        ref_idc: u8,
        sps: &'n Sps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: sps,
        };

        s.writer.write_header(ref_idc, NaluType::Sps as u8)?;
        s.seq_parameter_set_data()?;
        s.rbsp_trailing_bits()
    }

    fn hrd_parameters(&mut self, hrd_params: &HrdParams) -> SynthesizerResult<()> {
        if hrd_params.cpb_cnt_minus1 > 31 {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(hrd_params.cpb_cnt_minus1)?;
        self.u(4, hrd_params.bit_rate_scale)?;
        self.u(4, hrd_params.cpb_size_scale)?;

        for i in 0..=(hrd_params.cpb_cnt_minus1 as usize) {
            self.ue(hrd_params.bit_rate_value_minus1[i])?;
            self.ue(hrd_params.cpb_size_value_minus1[i])?;
            self.u(1, hrd_params.cbr_flag[i])?;
        }

        self.u(5, hrd_params.initial_cpb_removal_delay_length_minus1)?;
        self.u(5, hrd_params.cpb_removal_delay_length_minus1)?;
        self.u(5, hrd_params.dpb_output_delay_length_minus1)?;
        self.u(5, hrd_params.time_offset_length)?;

        Ok(())
    }

    fn vui_parameters(&mut self) -> SynthesizerResult<()> {
        // H.264 E.1.1
        let vui_params = &self.nalu.vui_parameters;

        self.u(1, vui_params.aspect_ratio_info_present_flag)?;
        if vui_params.aspect_ratio_info_present_flag {
            self.u(8, vui_params.aspect_ratio_idc)?;
            if vui_params.aspect_ratio_idc == EXTENDED_SAR {
                self.u(16, vui_params.sar_width)?;
                self.u(16, vui_params.sar_height)?;
            }
        }

        self.u(1, vui_params.overscan_info_present_flag)?;
        if vui_params.overscan_info_present_flag {
            self.u(1, vui_params.overscan_appropriate_flag)?;
        }

        self.u(1, vui_params.video_signal_type_present_flag)?;
        if vui_params.video_signal_type_present_flag {
            self.u(3, vui_params.video_format)?;
            self.u(1, vui_params.video_full_range_flag)?;

            self.u(1, vui_params.colour_description_present_flag)?;
            if vui_params.colour_description_present_flag {
                self.u(8, vui_params.colour_primaries)?;
                self.u(8, vui_params.transfer_characteristics)?;
                self.u(8, vui_params.matrix_coefficients)?;
            }
        }

        self.u(1, vui_params.chroma_loc_info_present_flag)?;
        if vui_params.chroma_loc_info_present_flag {
            self.ue(vui_params.chroma_sample_loc_type_top_field)?;
            self.ue(vui_params.chroma_sample_loc_type_bottom_field)?;
        }

        self.u(1, vui_params.timing_info_present_flag)?;
        if vui_params.timing_info_present_flag {
            self.u(32, vui_params.num_units_in_tick)?;
            self.u(32, vui_params.time_scale)?;
            self.u(1, vui_params.fixed_frame_rate_flag)?;
        }

        self.u(1, vui_params.nal_hrd_parameters_present_flag)?;
        if vui_params.nal_hrd_parameters_present_flag {
            self.hrd_parameters(&vui_params.nal_hrd_parameters)?;
        }
        self.u(1, vui_params.vcl_hrd_parameters_present_flag)?;
        if vui_params.vcl_hrd_parameters_present_flag {
            self.hrd_parameters(&vui_params.vcl_hrd_parameters)?;
        }

        if vui_params.nal_hrd_parameters_present_flag || vui_params.vcl_hrd_parameters_present_flag
        {
            self.u(1, vui_params.low_delay_hrd_flag)?;
        }

        self.u(1, vui_params.pic_struct_present_flag)?;
        self.u(1, /* bitstream_restriction_flag */ false)?;

        Ok(())
    }

    fn seq_parameter_set_data(&mut self) -> SynthesizerResult<()> {
        // H.264 7.3.2.1.1
        self.u(8, self.nalu.profile_idc)?;
        self.u(1, self.nalu.constraint_set0_flag)?;
        self.u(1, self.nalu.constraint_set1_flag)?;
        self.u(1, self.nalu.constraint_set2_flag)?;
        self.u(1, self.nalu.constraint_set3_flag)?;
        self.u(1, self.nalu.constraint_set4_flag)?;
        self.u(1, self.nalu.constraint_set5_flag)?;
        self.u(2, /* reserved_zero_2bits */ 0u32)?;
        self.u(8, self.nalu.level_idc)?;
        self.ue(self.nalu.seq_parameter_set_id)?;

        if matches!(self.nalu.profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86) {
            self.ue(self.nalu.chroma_format_idc)?;

            if self.nalu.chroma_format_idc == 3 {
                self.u(1, self.nalu.separate_colour_plane_flag)?;
            }

            self.ue(self.nalu.bit_depth_luma_minus8)?;
            self.ue(self.nalu.bit_depth_chroma_minus8)?;
            self.u(1, self.nalu.qpprime_y_zero_transform_bypass_flag)?;
            self.u(1, self.nalu.seq_scaling_matrix_present_flag)?;

            if self.nalu.seq_scaling_matrix_present_flag {
                let scaling_list_count = if self.nalu.chroma_format_idc != 3 {
                    8
                } else {
                    12
                };

                // The lists themselves are not kept, so every one of them is
                // signalled as absent (fall-back rule A).
                for _ in 0..scaling_list_count {
                    self.u(1, /* seq_scaling_list_present_flag */ false)?;
                }
            }
        } else if self.nalu.chroma_format_idc != 1 || self.nalu.separate_colour_plane_flag {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(self.nalu.log2_max_frame_num_minus4)?;
        self.ue(self.nalu.pic_order_cnt_type)?;

        if self.nalu.pic_order_cnt_type == 0 {
            self.ue(self.nalu.log2_max_pic_order_cnt_lsb_minus4)?;
        } else if self.nalu.pic_order_cnt_type == 1 {
            self.u(1, self.nalu.delta_pic_order_always_zero_flag)?;
            self.se(self.nalu.offset_for_non_ref_pic)?;
            self.se(self.nalu.offset_for_top_to_bottom_field)?;

            let num_ref_frames_in_pic_order_cnt_cycle =
                u32::try_from(self.nalu.offset_for_ref_frame.len())
                    .map_err(|_| SynthesizerError::Unsupported)?;
            self.ue(num_ref_frames_in_pic_order_cnt_cycle)?;

            for offset_for_ref_frame in &self.nalu.offset_for_ref_frame {
                self.se(*offset_for_ref_frame)?;
            }
        }

        self.ue(self.nalu.max_num_ref_frames)?;
        self.u(1, self.nalu.gaps_in_frame_num_value_allowed_flag)?;
        self.ue(self.nalu.pic_width_in_mbs_minus1)?;
        self.ue(self.nalu.pic_height_in_map_units_minus1)?;
        self.u(1, self.nalu.frame_mbs_only_flag)?;
        if !self.nalu.frame_mbs_only_flag {
            self.u(1, self.nalu.mb_adaptive_frame_field_flag)?;
        }
        self.u(1, self.nalu.direct_8x8_inference_flag)?;

        self.u(1, self.nalu.frame_cropping_flag)?;
        if self.nalu.frame_cropping_flag {
            self.ue(self.nalu.frame_crop_left_offset)?;
            self.ue(self.nalu.frame_crop_right_offset)?;
            self.ue(self.nalu.frame_crop_top_offset)?;
            self.ue(self.nalu.frame_crop_bottom_offset)?;
        }

        self.u(1, self.nalu.vui_parameters_present_flag)?;
        if self.nalu.vui_parameters_present_flag {
            self.vui_parameters()?;
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Pps, W> {
    /// Writes a PPS with the given ids. Every field that is not kept in
    /// [`Pps`] gets its neutral value: CAVLC, one slice group, no weighted
    /// prediction and zero QP offsets.
    pub fn synthesize(
        ref_idc: u8,
        pps: &'n Pps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: pps,
        };

        s.writer.write_header(ref_idc, NaluType::Pps as u8)?;
        s.pic_parameter_set_rbsp()?;
        s.rbsp_trailing_bits()
    }

    fn pic_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        self.ue(self.nalu.pic_parameter_set_id)?;
        self.ue(self.nalu.seq_parameter_set_id)?;
        self.u(1, /* entropy_coding_mode_flag */ false)?;
        self.u(1, /* bottom_field_pic_order_in_frame_present_flag */ false)?;
        self.ue(/* num_slice_groups_minus1 */ 0u32)?;
        self.ue(/* num_ref_idx_l0_default_active_minus1 */ 0u32)?;
        self.ue(/* num_ref_idx_l1_default_active_minus1 */ 0u32)?;
        self.u(1, /* weighted_pred_flag */ false)?;
        self.u(2, /* weighted_bipred_idc */ 0u32)?;
        self.se(/* pic_init_qp_minus26 */ 0)?;
        self.se(/* pic_init_qs_minus26 */ 0)?;
        self.se(/* chroma_qp_index_offset */ 0)?;
        self.u(1, /* deblocking_filter_control_present_flag */ true)?;
        self.u(1, /* constrained_intra_pred_flag */ false)?;
        self.u(1, /* redundant_pic_cnt_present_flag */ false)?;

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, SliceHeader, W> {
    /// Writes a slice NAL unit carrying `header`. Only the leading fields are
    /// meaningful: the rest of the slice is a stand-in payload.
    pub fn synthesize(
        ref_idc: u8,
        type_: NaluType,
        header: &'n SliceHeader,
        sps: &Sps,
        writer: W,
    ) -> SynthesizerResult<()> {
        if !type_.is_picture_slice() {
            return Err(SynthesizerError::Unsupported);
        }

        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, true),
            nalu: header,
        };

        s.writer.write_header(ref_idc, type_ as u8)?;
        s.slice_header(sps)?;
        s.rbsp_trailing_bits()
    }

    fn slice_header(&mut self, sps: &Sps) -> SynthesizerResult<()> {
        // H.264 7.3.3
        self.ue(self.nalu.first_mb_in_slice)?;
        self.ue(self.nalu.slice_type as u8)?;
        self.ue(self.nalu.pic_parameter_set_id)?;

        if sps.separate_colour_plane_flag {
            self.u(2, self.nalu.colour_plane_id)?;
        }

        self.u(
            usize::from(sps.log2_max_frame_num_minus4) + 4,
            self.nalu.frame_num,
        )?;

        if !sps.frame_mbs_only_flag {
            self.u(1, self.nalu.field_pic_flag)?;
            if self.nalu.field_pic_flag {
                self.u(1, self.nalu.bottom_field_flag)?;
            }
        }

        // Stand-in for the remaining header fields and slice data.
        self.u(16, 0xa5a5u32)?;

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, [SeiMessage], W> {
    /// Writes an SEI NAL unit with `messages` in order. Delay and timestamp
    /// field sizes come from `sps`.
    pub fn synthesize(messages: &'n [SeiMessage], sps: &Sps, writer: W) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, true),
            nalu: messages,
        };

        s.writer.write_header(0, NaluType::Sei as u8)?;

        for message in s.nalu {
            let (payload_type, payload) = Self::sei_payload(message, sps)?;
            let payload_size =
                u32::try_from(payload.len()).map_err(|_| SynthesizerError::Unsupported)?;

            s.sei_value(payload_type)?;
            s.sei_value(payload_size)?;
            for byte in payload {
                s.u(8, byte)?;
            }
        }

        s.rbsp_trailing_bits()
    }

    fn sei_value(&mut self, mut value: u32) -> SynthesizerResult<()> {
        while value >= 0xff {
            self.u(8, 0xffu32)?;
            value -= 0xff;
        }

        self.u(8, value)
    }

    /// Serializes one message body, byte aligned as D.1.1 requires.
    fn sei_payload(message: &SeiMessage, sps: &Sps) -> SynthesizerResult<(u32, Vec<u8>)> {
        let mut payload = Vec::new();

        let payload_type = {
            let mut w = NaluWriter::new(&mut payload, false);

            let payload_type = match message {
                SeiMessage::BufferingPeriod(bp) => {
                    Self::buffering_period(&mut w, bp, sps)?;
                    0
                }
                SeiMessage::PicTiming(pt) => {
                    Self::pic_timing(&mut w, pt, sps)?;
                    1
                }
                SeiMessage::Unknown {
                    payload_type,
                    payload_size,
                } => {
                    for _ in 0..*payload_size {
                        w.write_u(8, 0xa5u32)?;
                    }
                    *payload_type
                }
            };

            if !w.aligned() {
                w.write_trailing_bits()?;
            }

            payload_type
        };

        Ok((payload_type, payload))
    }

    fn buffering_period(
        w: &mut NaluWriter<&mut Vec<u8>>,
        bp: &BufferingPeriod,
        sps: &Sps,
    ) -> SynthesizerResult<()> {
        let vui = &sps.vui_parameters;
        w.write_ue(bp.seq_parameter_set_id)?;

        for (present, hrd, entries) in [
            (
                vui.nal_hrd_parameters_present_flag,
                &vui.nal_hrd_parameters,
                &bp.nal,
            ),
            (
                vui.vcl_hrd_parameters_present_flag,
                &vui.vcl_hrd_parameters,
                &bp.vcl,
            ),
        ] {
            if !(sps.vui_parameters_present_flag && present) {
                continue;
            }

            let len = usize::from(hrd.initial_cpb_removal_delay_length_minus1) + 1;
            for entry in entries {
                w.write_u(len, entry.delay)?;
                w.write_u(len, entry.offset)?;
            }
        }

        Ok(())
    }

    fn pic_timing(
        w: &mut NaluWriter<&mut Vec<u8>>,
        pt: &PicTiming,
        sps: &Sps,
    ) -> SynthesizerResult<()> {
        let hrd = sps.hrd();

        if let Some(hrd) = hrd {
            w.write_u(
                usize::from(hrd.cpb_removal_delay_length_minus1) + 1,
                pt.cpb_removal_delay,
            )?;
            w.write_u(
                usize::from(hrd.dpb_output_delay_length_minus1) + 1,
                pt.dpb_output_delay,
            )?;
        }

        if !sps.pic_struct_present() {
            return Ok(());
        }

        let pic_struct = pt.pic_struct.ok_or(SynthesizerError::Unsupported)?;
        let num_clock_ts = pic_struct.num_clock_ts();
        if pt.clock_timestamps.len() > num_clock_ts {
            return Err(SynthesizerError::Unsupported);
        }

        let time_offset_length = hrd.map_or(DEFAULT_TIME_OFFSET_LENGTH, |hrd| {
            usize::from(hrd.time_offset_length)
        });

        w.write_u(4, pic_struct as u8)?;
        for i in 0..num_clock_ts {
            match pt.clock_timestamps.get(i) {
                Some(ts) => {
                    w.write_u(1, true)?;
                    Self::clock_timestamp(w, ts, time_offset_length)?;
                }
                None => {
                    w.write_u(1, false)?;
                }
            }
        }

        Ok(())
    }

    fn clock_timestamp(
        w: &mut NaluWriter<&mut Vec<u8>>,
        ts: &ClockTimestamp,
        time_offset_length: usize,
    ) -> SynthesizerResult<()> {
        w.write_u(2, ts.ct_type)?;
        w.write_u(1, ts.nuit_field_based_flag)?;
        w.write_u(5, ts.counting_type)?;
        w.write_u(1, ts.full_timestamp_flag)?;
        w.write_u(1, ts.discontinuity_flag)?;
        w.write_u(1, ts.cnt_dropped_flag)?;
        w.write_u(8, ts.n_frames)?;

        if ts.full_timestamp_flag {
            w.write_u(6, ts.seconds_value.unwrap_or(0))?;
            w.write_u(6, ts.minutes_value.unwrap_or(0))?;
            w.write_u(5, ts.hours_value.unwrap_or(0))?;
        } else {
            w.write_u(1, ts.seconds_value.is_some())?;
            if let Some(seconds) = ts.seconds_value {
                w.write_u(6, seconds)?;
                w.write_u(1, ts.minutes_value.is_some())?;
                if let Some(minutes) = ts.minutes_value {
                    w.write_u(6, minutes)?;
                    w.write_u(1, ts.hours_value.is_some())?;
                    if let Some(hours) = ts.hours_value {
                        w.write_u(5, hours)?;
                    }
                }
            }
        }

        if time_offset_length > 0 {
            w.write_u(time_offset_length, ts.time_offset)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::nalu::Nalu;
    use crate::codec::h264::parser::Parser;
    use crate::codec::h264::parser::SliceType;
    use crate::codec::h264::parser::SpsBuilder;

    #[test]
    fn synthesize_sps() {
        let raw_sps_buf = [0x07, 0x00, 0x00, 0x0a, 0xfb, 0x88];

        let nalu = Nalu::from_bytes(&raw_sps_buf).unwrap();
        assert_eq!(nalu.header.type_, NaluType::Sps);

        let mut parser = Parser::default();
        let sps = parser.parse_sps(&nalu).unwrap();

        let mut buf = Vec::<u8>::new();
        Synthesizer::<'_, Sps, _>::synthesize(0, sps, &mut buf, false).unwrap();

        assert_eq!(buf, raw_sps_buf);
    }

    #[test]
    fn synthesize_pps() {
        let pps = Pps {
            pic_parameter_set_id: 200,
            seq_parameter_set_id: 31,
        };

        let mut buf = Vec::<u8>::new();
        Synthesizer::<'_, Pps, _>::synthesize(3, &pps, &mut buf, true).unwrap();
        assert_eq!(buf[0], 0x68);

        let mut parser = Parser::default();
        let parsed = parser.parse_pps(&Nalu::from_bytes(&buf).unwrap()).unwrap();
        assert_eq!(parsed, &pps);
    }

    #[test]
    fn scaling_matrix_is_signalled_absent() {
        let sps = SpsBuilder::new()
            .profile_idc(100)
            .resolution(1280, 720)
            .build();
        let sps = Sps {
            seq_scaling_matrix_present_flag: true,
            ..sps
        };

        let mut buf = Vec::<u8>::new();
        Synthesizer::<'_, Sps, _>::synthesize(3, &sps, &mut buf, true).unwrap();

        let mut parser = Parser::default();
        let parsed = parser.parse_sps(&Nalu::from_bytes(&buf).unwrap()).unwrap();
        assert_eq!(parsed, &sps);
    }

    #[test]
    fn baseline_sps_cannot_carry_chroma_format() {
        let sps = SpsBuilder::new().chroma_format_idc(3).build();

        let mut buf = Vec::<u8>::new();
        assert!(matches!(
            Synthesizer::<'_, Sps, _>::synthesize(3, &sps, &mut buf, true),
            Err(SynthesizerError::Unsupported)
        ));
    }

    #[test]
    fn slice_header_rejects_non_slice_types() {
        let sps = SpsBuilder::new().build();
        let header = SliceHeader {
            slice_type: SliceType::I,
            ..Default::default()
        };

        let mut buf = Vec::<u8>::new();
        assert!(Synthesizer::<'_, SliceHeader, _>::synthesize(
            3,
            NaluType::Sei,
            &header,
            &sps,
            &mut buf
        )
        .is_err());
    }

    #[test]
    fn long_sei_values_are_chained() {
        let sps = SpsBuilder::new().build();
        let messages = [SeiMessage::Unknown {
            payload_type: 256,
            payload_size: 2,
        }];

        let mut buf = Vec::<u8>::new();
        Synthesizer::<'_, [SeiMessage], _>::synthesize(&messages, &sps, &mut buf).unwrap();
        assert_eq!(buf, [0x06, 0xff, 0x01, 0x02, 0xa5, 0xa5, 0x80]);
    }
}
