// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::anyhow;
use anyhow::Context;
use enumn::N;

use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_reader::NaluReader;

pub const MAX_SPS_COUNT: usize = 32;
pub const MAX_PPS_COUNT: usize = 256;

/// Profiles whose SPS carries chroma format, bit depth and scaling matrices.
const HIGH_PROFILES: [u8; 7] = [100, 110, 122, 244, 44, 83, 86];

/// `SubWidthC` and `SubHeightC` indexed by `ChromaArrayType`. See table 6-1.
const SUB_WIDTH_C: [u32; 4] = [1, 2, 2, 1];
const SUB_HEIGHT_C: [u32; 4] = [1, 2, 1, 1];

/// Extended Sample Aspect Ratio - H.264 Table E-1
pub(super) const EXTENDED_SAR: u8 = 255;

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceType {
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    /// Maps a `slice_type` syntax element (0..=9) to its type.
    pub fn from_slice_type(slice_type: u8) -> Option<Self> {
        Self::n(slice_type % 5)
    }

    /// Whether this is a P slice.
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    /// Whether this is a B slice.
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    /// Whether this is an I slice.
    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    /// Whether this is a SP slice.
    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    /// Whether this is a SI slice.
    pub fn is_si(&self) -> bool {
        matches!(self, SliceType::Si)
    }

    /// Slices that can be decoded without reference to other pictures.
    pub fn is_intra(&self) -> bool {
        self.is_i() || self.is_si()
    }
}

impl Default for SliceType {
    fn default() -> Self {
        Self::P
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    /// Plus 1 specifies the number of alternative CPB specifications in the
    /// bitstream. The value of `cpb_cnt_minus1` shall be in the range of 0 to 31,
    /// inclusive
    pub cpb_cnt_minus1: u8,
    /// Together with `bit_rate_value_minus1[ SchedSelIdx ]` specifies the
    /// maximum input bit rate of the `SchedSelIdx`-th CPB.
    pub bit_rate_scale: u8,
    /// Together with `cpb_size_value_minus1[ SchedSelIdx ]` specifies the CPB
    /// size of the SchedSelIdx-th CPB.
    pub cpb_size_scale: u8,

    /// `[ SchedSelIdx ]` (together with bit_rate_scale) specifies the maximum
    /// input bit rate for the SchedSelIdx-th CPB.
    pub bit_rate_value_minus1: [u32; 32],
    /// `[ SchedSelIdx ]` is used together with cpb_size_scale to specify the
    /// SchedSelIdx-th CPB size.
    pub cpb_size_value_minus1: [u32; 32],
    /// `[ SchedSelIdx ]` selects constant (true) or intermittent (false) bit
    /// rate delivery for the SchedSelIdx-th CPB.
    pub cbr_flag: [bool; 32],

    /// Specifies the length in bits of the `initial_cpb_removal_delay[
    /// SchedSelIdx ]` and `initial_cpb_removal_delay_offset[ SchedSelIdx ]` syntax
    /// elements of the buffering period SEI message.
    pub initial_cpb_removal_delay_length_minus1: u8,
    /// Specifies the length in bits of the `cpb_removal_delay` syntax element.
    pub cpb_removal_delay_length_minus1: u8,
    /// Specifies the length in bits of the `dpb_output_delay` syntax element.
    pub dpb_output_delay_length_minus1: u8,
    /// If greater than 0, specifies the length in bits of the `time_offset`
    /// syntax element. `time_offset_length` equal to 0 specifies that the
    /// `time_offset` syntax element is not present
    pub time_offset_length: u8,
}

/// The VUI fields up to `pic_struct_present_flag`. Bitstream restrictions are
/// not parsed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    /* if aspect_ratio_idc == 255 */
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u32,
    pub chroma_sample_loc_type_bottom_field: u32,

    /// Cleared when the stream signals a zero `time_scale` or
    /// `num_units_in_tick`, in which case the timing fields are meaningless.
    pub timing_info_present_flag: bool,
    /// The number of time units of a clock operating at `time_scale` Hz that
    /// corresponds to one increment of a clock tick counter.
    pub num_units_in_tick: u32,
    /// The number of time units that pass in one second.
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    pub low_delay_hrd_flag: bool,

    /// Whether picture timing SEI messages carry `pic_struct`.
    pub pic_struct_present_flag: bool,
}

/// A H264 Sequence Parameter Set. A syntax structure containing syntax elements
/// that apply to zero or more entire coded video sequences as determined by the
/// content of a seq_parameter_set_id syntax element found in the picture
/// parameter set referred to by the pic_parameter_set_id syntax element found
/// in each slice header.
///
/// Only what framing and timestamping need is kept. Scaling matrices are
/// walked over but their values are dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    /// Identifies the sequence parameter set that is referred to by the picture
    /// parameter set
    pub seq_parameter_set_id: u8,

    /// Profile to which the coded video sequence conforms
    pub profile_idc: u8,

    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set0_flag: bool,
    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set1_flag: bool,
    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set2_flag: bool,
    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set3_flag: bool,
    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set4_flag: bool,
    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set5_flag: bool,

    /// Level to which the coded video sequence conforms
    pub level_idc: u8,

    /// Specifies the chroma sampling relative to the luma sampling
    pub chroma_format_idc: u8,
    /// If true, specifies that the three colour components of the 4:4:4 chroma
    /// format are coded separately.
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,
    pub seq_scaling_matrix_present_flag: bool,

    /// Specifies the value of the variable MaxFrameNum, i.e. the width in
    /// bits of `frame_num`, minus 4.
    pub log2_max_frame_num_minus4: u8,

    /// Specifies the method to decode picture order count (as specified in
    /// 8.2.1)
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offset_for_ref_frame: Vec<i32>,

    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,

    /// Plus 1 specifies the width of each decoded picture in units of
    /// macroblocks.
    pub pic_width_in_mbs_minus1: u32,
    /// Plus 1 specifies the height in slice group map units of a decoded frame
    /// or field.
    pub pic_height_in_map_units_minus1: u32,

    /// If true, specifies that every coded picture of the coded video sequence
    /// is a coded frame containing only frame macroblocks.
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    /// Returns the coded width of the stream.
    ///
    /// See 7-13 through 7-17 in the specification.
    pub const fn coded_width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 + 1) * 16
    }

    /// Returns the coded height of the stream.
    ///
    /// See 7-13 through 7-17 in the specification.
    pub const fn coded_height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 + 1) * 16 * (2 - self.frame_mbs_only_flag as u32)
    }

    /// Returns `ChromaArrayType`, as computed in the specification.
    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// Returns `CropUnitX` and `CropUnitY`.
    ///
    /// See 7-19 through 7-22 in the specification.
    fn crop_unit_x_y(&self) -> (u32, u32) {
        let chroma = usize::from(self.chroma_array_type()).min(3);
        (
            SUB_WIDTH_C[chroma],
            SUB_HEIGHT_C[chroma] * (2 - u32::from(self.frame_mbs_only_flag)),
        )
    }

    fn cropped_width(&self) -> Option<u32> {
        let (crop_unit_x, _) = self.crop_unit_x_y();
        self.frame_crop_left_offset
            .checked_add(self.frame_crop_right_offset)
            .and_then(|r| r.checked_mul(crop_unit_x))
            .and_then(|r| self.coded_width().checked_sub(r))
    }

    fn cropped_height(&self) -> Option<u32> {
        let (_, crop_unit_y) = self.crop_unit_x_y();
        self.frame_crop_top_offset
            .checked_add(self.frame_crop_bottom_offset)
            .and_then(|r| r.checked_mul(crop_unit_y))
            .and_then(|r| self.coded_height().checked_sub(r))
    }

    /// Returns the display width, i.e. the coded width minus the cropping
    /// rectangle.
    pub fn width(&self) -> u32 {
        self.cropped_width().unwrap_or(0)
    }

    /// Returns the display height, i.e. the coded height minus the cropping
    /// rectangle.
    pub fn height(&self) -> u32 {
        self.cropped_height().unwrap_or(0)
    }

    /// Whether the stream carries usable `num_units_in_tick`/`time_scale`.
    pub fn has_timing_info(&self) -> bool {
        self.vui_parameters_present_flag && self.vui_parameters.timing_info_present_flag
    }

    /// Whether either HRD block is present, in which case picture timing SEI
    /// messages carry CPB/DPB delays.
    pub fn has_hrd(&self) -> bool {
        self.vui_parameters_present_flag
            && (self.vui_parameters.nal_hrd_parameters_present_flag
                || self.vui_parameters.vcl_hrd_parameters_present_flag)
    }

    /// The HRD block that sizes the SEI delay fields, NAL first.
    pub fn hrd(&self) -> Option<&HrdParams> {
        let vui = &self.vui_parameters;
        if !self.vui_parameters_present_flag {
            None
        } else if vui.nal_hrd_parameters_present_flag {
            Some(&vui.nal_hrd_parameters)
        } else if vui.vcl_hrd_parameters_present_flag {
            Some(&vui.vcl_hrd_parameters)
        } else {
            None
        }
    }

    pub fn pic_struct_present(&self) -> bool {
        self.vui_parameters_present_flag && self.vui_parameters.pic_struct_present_flag
    }
}

#[derive(Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Self(Sps {
            profile_idc: 66,
            level_idc: 30,
            chroma_format_idc: 1,
            frame_mbs_only_flag: true,
            direct_8x8_inference_flag: true,
            max_num_ref_frames: 1,
            ..Default::default()
        })
    }

    pub fn seq_parameter_set_id(mut self, value: u8) -> Self {
        self.0.seq_parameter_set_id = value;
        self
    }

    pub fn profile_idc(mut self, value: u8) -> Self {
        self.0.profile_idc = value;
        self
    }

    pub fn level_idc(mut self, value: u8) -> Self {
        self.0.level_idc = value;
        self
    }

    pub fn frame_crop_offsets(mut self, top: u32, bottom: u32, left: u32, right: u32) -> Self {
        self.0.frame_cropping_flag = true;
        self.0.frame_crop_top_offset = top;
        self.0.frame_crop_bottom_offset = bottom;
        self.0.frame_crop_left_offset = left;
        self.0.frame_crop_right_offset = right;
        self
    }

    pub fn frame_crop(self, top: u32, bottom: u32, left: u32, right: u32) -> Self {
        let (crop_unit_x, crop_unit_y) = self.0.crop_unit_x_y();

        self.frame_crop_offsets(
            top / crop_unit_y,
            bottom / crop_unit_y,
            left / crop_unit_x,
            right / crop_unit_x,
        )
    }

    /// Sets the picture size in macroblocks, cropping down to `width` x
    /// `height` when they are not macroblock aligned.
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        const MB_SIZE: u32 = 16;

        let field_factor = 2 - u32::from(self.0.frame_mbs_only_flag);
        let mb_width = (width + MB_SIZE - 1) / MB_SIZE;
        let map_unit_height = MB_SIZE * field_factor;
        let map_units = (height + map_unit_height - 1) / map_unit_height;

        self.0.pic_width_in_mbs_minus1 = mb_width - 1;
        self.0.pic_height_in_map_units_minus1 = map_units - 1;

        let compressed_width = mb_width * MB_SIZE;
        let compressed_height = map_units * map_unit_height;

        if compressed_width != width || compressed_height != height {
            self = self.frame_crop(0, compressed_height - height, 0, compressed_width - width);
        }

        self
    }

    pub fn chroma_format_idc(mut self, value: u8) -> Self {
        self.0.chroma_format_idc = value;
        self
    }

    pub fn separate_colour_plane_flag(mut self, value: bool) -> Self {
        self.0.separate_colour_plane_flag = value;
        self
    }

    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    pub fn log2_max_frame_num_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_frame_num_minus4 = value;
        self
    }

    pub fn pic_order_cnt_type(mut self, value: u8) -> Self {
        self.0.pic_order_cnt_type = value;
        self
    }

    pub fn offset_for_ref_frame(mut self, offsets: &[i32]) -> Self {
        self.0.offset_for_ref_frame = offsets.to_vec();
        self
    }

    pub fn vui_parameters_present(mut self) -> Self {
        self.0.vui_parameters_present_flag = true;
        self
    }

    pub fn timing_info(
        mut self,
        num_units_in_tick: u32,
        time_scale: u32,
        fixed_frame_rate_flag: bool,
    ) -> Self {
        self = self.vui_parameters_present();
        self.0.vui_parameters.timing_info_present_flag = true;
        self.0.vui_parameters.num_units_in_tick = num_units_in_tick;
        self.0.vui_parameters.time_scale = time_scale;
        self.0.vui_parameters.fixed_frame_rate_flag = fixed_frame_rate_flag;
        self
    }

    pub fn nal_hrd_parameters(mut self, hrd: HrdParams) -> Self {
        self = self.vui_parameters_present();
        self.0.vui_parameters.nal_hrd_parameters_present_flag = true;
        self.0.vui_parameters.nal_hrd_parameters = hrd;
        self
    }

    pub fn vcl_hrd_parameters(mut self, hrd: HrdParams) -> Self {
        self = self.vui_parameters_present();
        self.0.vui_parameters.vcl_hrd_parameters_present_flag = true;
        self.0.vui_parameters.vcl_hrd_parameters = hrd;
        self
    }

    pub fn pic_struct_present_flag(mut self, value: bool) -> Self {
        self = self.vui_parameters_present();
        self.0.vui_parameters.pic_struct_present_flag = value;
        self
    }

    pub fn build(self) -> Sps {
        self.0
    }
}

/// A H264 Picture Parameter Set. Only the ids are parsed: nothing past them
/// influences framing or timing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    /// Identifies the picture parameter set that is referred to in the slice header.
    pub pic_parameter_set_id: u8,

    /// Refers to the active sequence parameter set.
    pub seq_parameter_set_id: u8,
}

/// The leading fields of a slice header, enough to tell pictures, frame types
/// and fields apart.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Specifies the address of the first macroblock in the slice.
    pub first_mb_in_slice: u32,
    /// Specifies the coding type of the slice according to Table 7-6.
    pub slice_type: SliceType,
    /// Specifies the picture parameter set in use
    pub pic_parameter_set_id: u8,
    /// Specifies the colour plane associated with the current slice RBSP when
    /// `separate_colour_plane_flag` is set.
    pub colour_plane_id: u8,
    /// Used as an identifier for pictures and shall be represented by
    /// `log2_max_frame_num_minus4 + 4` bits in the bitstream.
    pub frame_num: u16,
    /// If set, specifies that the slice is a slice of a coded field.
    pub field_pic_flag: bool,
    /// If set, specifies that the slice is part of a coded bottom field.
    pub bottom_field_flag: bool,
}

/// The parameter set store, with SPS and PPS slots indexed by id.
#[derive(Debug)]
pub struct Parser {
    spses: [Option<Sps>; MAX_SPS_COUNT],
    ppses: [Option<Pps>; MAX_PPS_COUNT],
    current_sps: Option<u8>,
    current_pps: Option<u8>,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            spses: std::array::from_fn(|_| None),
            ppses: std::array::from_fn(|_| None),
            current_sps: None,
            current_pps: None,
        }
    }
}

impl Parser {
    /// Walks one scaling list, see 7.3.2.1.1.1. The values are not kept.
    fn skip_scaling_list(r: &mut NaluReader, size: usize) {
        let mut last_scale = 8;
        let mut next_scale = 8;

        for _ in 0..size {
            if next_scale != 0 {
                let delta_scale = r.read_se();
                next_scale = (last_scale + delta_scale + 256) % 256;
            }

            if next_scale != 0 {
                last_scale = next_scale;
            }
        }
    }

    fn skip_sps_scaling_lists(r: &mut NaluReader, sps: &Sps) {
        let num_lists = if sps.chroma_format_idc == 3 { 12 } else { 8 };

        for i in 0..num_lists {
            let seq_scaling_list_present_flag = r.read_bit();
            if seq_scaling_list_present_flag {
                Parser::skip_scaling_list(r, if i < 6 { 16 } else { 64 });
            }
        }
    }

    fn parse_hrd(r: &mut NaluReader, hrd: &mut HrdParams) -> anyhow::Result<()> {
        hrd.cpb_cnt_minus1 = r.read_ue_max(31)?;
        hrd.bit_rate_scale = r.read_bits(4) as u8;
        hrd.cpb_size_scale = r.read_bits(4) as u8;

        for sched_sel_idx in 0..=usize::from(hrd.cpb_cnt_minus1) {
            hrd.bit_rate_value_minus1[sched_sel_idx] = r.read_ue();
            hrd.cpb_size_value_minus1[sched_sel_idx] = r.read_ue();
            hrd.cbr_flag[sched_sel_idx] = r.read_bit();
        }

        hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5) as u8;
        hrd.cpb_removal_delay_length_minus1 = r.read_bits(5) as u8;
        hrd.dpb_output_delay_length_minus1 = r.read_bits(5) as u8;
        hrd.time_offset_length = r.read_bits(5) as u8;
        Ok(())
    }

    fn parse_vui(r: &mut NaluReader, sps: &mut Sps) -> anyhow::Result<()> {
        let vui = &mut sps.vui_parameters;

        vui.aspect_ratio_info_present_flag = r.read_bit();
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8) as u8;
            if vui.aspect_ratio_idc == EXTENDED_SAR {
                vui.sar_width = r.read_bits(16) as u16;
                vui.sar_height = r.read_bits(16) as u16;
            }
        }

        vui.overscan_info_present_flag = r.read_bit();
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit();
        }

        vui.video_signal_type_present_flag = r.read_bit();
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3) as u8;
            vui.video_full_range_flag = r.read_bit();
            vui.colour_description_present_flag = r.read_bit();
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8) as u8;
                vui.transfer_characteristics = r.read_bits(8) as u8;
                vui.matrix_coefficients = r.read_bits(8) as u8;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit();
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue();
            vui.chroma_sample_loc_type_bottom_field = r.read_ue();
        }

        vui.timing_info_present_flag = r.read_bit();
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits(32);
            vui.time_scale = r.read_bits(32);
            vui.fixed_frame_rate_flag = r.read_bit();

            if vui.num_units_in_tick == 0 || vui.time_scale == 0 {
                log::warn!(
                    "Ignoring invalid timing info: num_units_in_tick {} time_scale {}",
                    vui.num_units_in_tick,
                    vui.time_scale
                );
                vui.timing_info_present_flag = false;
            }
        }

        vui.nal_hrd_parameters_present_flag = r.read_bit();
        if vui.nal_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.nal_hrd_parameters).context("NAL HRD parameters")?;
        }

        vui.vcl_hrd_parameters_present_flag = r.read_bit();
        if vui.vcl_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.vcl_hrd_parameters).context("VCL HRD parameters")?;
        }

        if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
            vui.low_delay_hrd_flag = r.read_bit();
        }

        vui.pic_struct_present_flag = r.read_bit();

        Ok(())
    }

    /// Parse a SPS, store it in its slot and make it the current one.
    ///
    /// Returns a reference to the new SPS.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> anyhow::Result<&Sps> {
        if !matches!(nalu.header.type_, NaluType::Sps) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Sps,
                nalu.header.type_
            ));
        }

        let mut r = NaluReader::new(nalu.payload());
        let mut sps = Sps {
            profile_idc: r.read_bits(8) as u8,
            constraint_set0_flag: r.read_bit(),
            constraint_set1_flag: r.read_bit(),
            constraint_set2_flag: r.read_bit(),
            constraint_set3_flag: r.read_bit(),
            constraint_set4_flag: r.read_bit(),
            constraint_set5_flag: r.read_bit(),
            ..Default::default()
        };

        // skip reserved_zero_2bits
        r.skip_bits(2);

        sps.level_idc = r.read_bits(8) as u8;
        sps.seq_parameter_set_id = r
            .read_ue_max(MAX_SPS_COUNT as u32 - 1)
            .context("Invalid seq_parameter_set_id")?;

        if HIGH_PROFILES.contains(&sps.profile_idc) {
            sps.chroma_format_idc = r.read_ue_max(3).context("Invalid chroma_format_idc")?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit();
            }

            sps.bit_depth_luma_minus8 = r.read_ue_max(6)?;
            sps.bit_depth_chroma_minus8 = r.read_ue_max(6)?;
            sps.qpprime_y_zero_transform_bypass_flag = r.read_bit();
            sps.seq_scaling_matrix_present_flag = r.read_bit();

            if sps.seq_scaling_matrix_present_flag {
                Parser::skip_sps_scaling_lists(&mut r, &sps);
            }
        } else {
            sps.chroma_format_idc = 1;
        }

        sps.log2_max_frame_num_minus4 = r
            .read_ue_max(12)
            .context("Invalid log2_max_frame_num_minus4")?;

        sps.pic_order_cnt_type = r.read_ue_max(2).context("Invalid pic_order_cnt_type")?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit();
            sps.offset_for_non_ref_pic = r.read_se();
            sps.offset_for_top_to_bottom_field = r.read_se();
            let num_ref_frames_in_pic_order_cnt_cycle: u32 = r.read_ue_max(255)?;

            sps.offset_for_ref_frame = (0..num_ref_frames_in_pic_order_cnt_cycle)
                .map(|_| r.read_se())
                .collect();
        }

        sps.max_num_ref_frames = r.read_ue();
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit();
        sps.pic_width_in_mbs_minus1 = r.read_ue();
        sps.pic_height_in_map_units_minus1 = r.read_ue();
        sps.frame_mbs_only_flag = r.read_bit();

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit();
        }

        sps.direct_8x8_inference_flag = r.read_bit();
        sps.frame_cropping_flag = r.read_bit();

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue();
            sps.frame_crop_right_offset = r.read_ue();
            sps.frame_crop_top_offset = r.read_ue();
            sps.frame_crop_bottom_offset = r.read_ue();

            // Validate that cropping info is valid.
            sps.cropped_width()
                .ok_or(anyhow!("Invalid frame crop width"))?;
            sps.cropped_height()
                .ok_or(anyhow!("Invalid frame crop height"))?;
        }

        sps.vui_parameters_present_flag = r.read_bit();
        if sps.vui_parameters_present_flag {
            Parser::parse_vui(&mut r, &mut sps)?;
        }

        log::debug!(
            "SPS {}: profile {} level {} {}x{}",
            sps.seq_parameter_set_id,
            sps.profile_idc,
            sps.level_idc,
            sps.width(),
            sps.height()
        );

        let key = sps.seq_parameter_set_id;
        self.current_sps = Some(key);
        Ok(self.spses[usize::from(key)].insert(sps))
    }

    pub fn parse_pps(&mut self, nalu: &Nalu) -> anyhow::Result<&Pps> {
        if !matches!(nalu.header.type_, NaluType::Pps) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Pps,
                nalu.header.type_
            ));
        }

        let mut r = NaluReader::new(nalu.payload());
        let pps = Pps {
            pic_parameter_set_id: r
                .read_ue_max(MAX_PPS_COUNT as u32 - 1)
                .context("Invalid pic_parameter_set_id")?,
            seq_parameter_set_id: r
                .read_ue_max(MAX_SPS_COUNT as u32 - 1)
                .context("Invalid seq_parameter_set_id")?,
        };

        log::debug!(
            "PPS {} references SPS {}",
            pps.pic_parameter_set_id,
            pps.seq_parameter_set_id
        );

        let key = usize::from(pps.pic_parameter_set_id);
        Ok(self.ppses[key].insert(pps))
    }

    /// Parse the start of a slice header, up to the field flags. The PPS it
    /// references and that PPS's SPS become the current ones.
    pub fn parse_slice_header(&mut self, nalu: &Nalu) -> anyhow::Result<SliceHeader> {
        if !nalu.header.type_.is_picture_slice() {
            return Err(anyhow!(
                "Invalid NALU type: {:?} is not a slice",
                nalu.header.type_
            ));
        }

        let mut r = NaluReader::new(nalu.payload());
        let first_mb_in_slice = r.read_ue();
        let slice_type: u8 = r.read_ue_max(9).context("Invalid slice_type")?;
        let slice_type = SliceType::from_slice_type(slice_type)
            .ok_or(anyhow!("Invalid slice type {}", slice_type))?;
        let pic_parameter_set_id: u8 = r
            .read_ue_max(MAX_PPS_COUNT as u32 - 1)
            .context("Invalid pic_parameter_set_id")?;

        let sps_id = self
            .get_pps(pic_parameter_set_id)
            .with_context(|| format!("Slice references unknown PPS {}", pic_parameter_set_id))?
            .seq_parameter_set_id;
        let sps = self
            .get_sps(sps_id)
            .with_context(|| format!("PPS references unknown SPS {}", sps_id))?;

        let mut header = SliceHeader {
            first_mb_in_slice,
            slice_type,
            pic_parameter_set_id,
            ..Default::default()
        };

        if sps.separate_colour_plane_flag {
            header.colour_plane_id = r.read_bits(2) as u8;
        }

        header.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num_minus4) + 4) as u16;

        if !sps.frame_mbs_only_flag {
            header.field_pic_flag = r.read_bit();
            if header.field_pic_flag {
                header.bottom_field_flag = r.read_bit();
            }
        }

        self.current_pps = Some(pic_parameter_set_id);
        self.current_sps = Some(sps_id);

        Ok(header)
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Sps> {
        self.spses.get(usize::from(sps_id))?.as_ref()
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Pps> {
        self.ppses.get(usize::from(pps_id))?.as_ref()
    }

    /// The SPS referenced by the latest slice, buffering period or SPS.
    pub fn current_sps(&self) -> Option<&Sps> {
        self.get_sps(self.current_sps?)
    }

    /// The PPS referenced by the latest slice.
    pub fn current_pps(&self) -> Option<&Pps> {
        self.get_pps(self.current_pps?)
    }

    pub(crate) fn activate_sps(&mut self, sps_id: u8) {
        self.current_sps = Some(sps_id);
    }
}
