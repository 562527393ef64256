// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The `h264parse` element. It takes an H.264 stream in Annex B or length
//! prefixed form, cuts it into NAL units or access units, converts between
//! the two framings and gives every picture a decode timestamp.
//!
//! The element is a plain value driven by its caller: input comes in through
//! [`H264Parse::set_caps`], [`H264Parse::chain`] and
//! [`H264Parse::handle_event`], and output leaves through a [`Downstream`].

pub mod assembler;
pub mod converter;
pub mod injector;
pub mod reverse;
pub mod scanner;
pub mod settings;
pub mod timestamp;
pub mod types;

use bytes::Bytes;
use thiserror::Error;

use crate::codec::h264::avcc::AvcCError;
use crate::codec::h264::avcc::AvcDecoderConfigurationRecord;
use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::sei::PicTiming;
use crate::codec::h264::sei::SeiMessage;
use crate::h264parse::assembler::AuAssembler;
use crate::h264parse::assembler::Frame;
use crate::h264parse::assembler::NextHeader;
use crate::h264parse::converter::nal_positions;
use crate::h264parse::converter::Converter;
use crate::h264parse::injector::splice_nals;
use crate::h264parse::injector::ConfigInjector;
use crate::h264parse::reverse::DecodeUnit;
use crate::h264parse::reverse::ReversePlayback;
use crate::h264parse::scanner::split_packetized;
use crate::h264parse::scanner::ByteStreamScanner;
use crate::h264parse::scanner::ScannedNal;
use crate::h264parse::settings::OutputFormat;
use crate::h264parse::settings::Settings;
use crate::h264parse::settings::SettingsError;
use crate::h264parse::timestamp::PictureTiming;
use crate::h264parse::timestamp::TimestampEngine;
use crate::h264parse::types::Alignment;
use crate::h264parse::types::Buffer;
use crate::h264parse::types::Caps;
use crate::h264parse::types::Downstream;
use crate::h264parse::types::Event;
use crate::h264parse::types::FlowResult;
use crate::h264parse::types::StreamFormat;
use crate::Resolution;

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("stream-format avc requires codec_data")]
    MissingCodecData,
    #[error("invalid codec_data: {0}")]
    AvcC(#[from] AvcCError),
}

/// What processing a NAL unit found out about it.
#[derive(Clone, Copy, Debug, Default)]
struct NalInfo {
    is_slice: bool,
    is_idr: bool,
    starts_picture: bool,
    delta_unit: bool,
    field_pic: bool,
}

/// Output timing of a unit.
#[derive(Clone, Copy, Debug, Default)]
struct UnitTiming {
    pts: Option<u64>,
    dts: Option<u64>,
    duration: Option<u64>,
}

/// Frames per second of a fixed frame rate stream, as a reduced fraction.
fn framerate(sps: &Sps) -> Option<(u32, u32)> {
    let vui = &sps.vui_parameters;
    if !sps.has_timing_info() || !vui.fixed_frame_rate_flag {
        return None;
    }

    let num = u64::from(vui.time_scale);
    let den = 2 * u64::from(vui.num_units_in_tick);
    let gcd = {
        let (mut a, mut b) = (num, den);
        while b != 0 {
            (a, b) = (b, a % b);
        }
        a
    };

    Some((
        u32::try_from(num / gcd).ok()?,
        u32::try_from(den / gcd).ok()?,
    ))
}

pub struct H264Parse {
    settings: Settings,
    parser: Parser,
    converter: Converter,
    /// The `avcC` record of the input caps, raw and parsed.
    codec_data: Option<Bytes>,
    codec_record: Option<AvcDecoderConfigurationRecord>,
    scanner: ByteStreamScanner,
    assembler: AuAssembler,
    timestamps: TimestampEngine,
    injector: ConfigInjector,
    reverse: ReversePlayback,
    rate: f64,
    /// Latest picture timing SEI, consumed by the next picture.
    pic_timing: Option<PicTiming>,
    /// Upstream timing of the units seen since the last picture started.
    pending_ts: UnitTiming,
    /// Parameter sets from `codec_data`, sent in band before the first
    /// picture of a byte stream output.
    pending_codec_nals: Vec<Bytes>,
    src_caps: Option<Caps>,
}

impl H264Parse {
    pub fn new(settings: Settings) -> Result<Self, SettingsError> {
        settings.validate()?;

        let mut parse = Self {
            settings,
            parser: Default::default(),
            converter: Default::default(),
            codec_data: None,
            codec_record: None,
            scanner: Default::default(),
            assembler: Default::default(),
            timestamps: Default::default(),
            injector: Default::default(),
            reverse: Default::default(),
            rate: 1.0,
            pic_timing: None,
            pending_ts: Default::default(),
            pending_codec_nals: vec![],
            src_caps: None,
        };
        parse.converter.output_packetized = parse.output_packetized();

        Ok(parse)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: Settings) -> Result<(), SettingsError> {
        settings.validate()?;
        self.settings = settings;

        let output_packetized = self.output_packetized();
        if output_packetized != self.converter.output_packetized {
            self.converter.output_packetized = output_packetized;
            self.refill_pending_codec_nals();
        }

        Ok(())
    }

    /// The parameter set store, as filled by the stream so far.
    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    /// The caps last sent downstream.
    pub fn src_caps(&self) -> Option<&Caps> {
        self.src_caps.as_ref()
    }

    fn output_packetized(&self) -> bool {
        match self.settings.output_format {
            OutputFormat::Sample => true,
            OutputFormat::ByteStream => false,
            OutputFormat::Input => self.converter.input_packetized,
        }
    }

    /// Negotiates the input format.
    pub fn set_caps(&mut self, caps: &Caps) -> Result<(), NegotiationError> {
        match caps.stream_format {
            StreamFormat::Avc => {
                let codec_data = caps
                    .codec_data
                    .clone()
                    .ok_or(NegotiationError::MissingCodecData)?;
                let record = AvcDecoderConfigurationRecord::parse(&codec_data)?;

                self.converter.input_packetized = true;
                self.converter.nal_length_size = record.nal_length_size;
                self.codec_data = Some(codec_data);
                self.codec_record = Some(record);
            }
            StreamFormat::ByteStream => {
                self.converter.input_packetized = false;
                self.converter.nal_length_size = 4;
                self.codec_data = None;
                self.codec_record = None;
            }
        }

        self.converter.output_packetized = self.output_packetized();
        log::debug!(
            "Input {} (nal_length_size {}), output {}",
            caps.stream_format,
            self.converter.nal_length_size,
            if self.converter.output_packetized {
                StreamFormat::Avc
            } else {
                StreamFormat::ByteStream
            }
        );

        self.seed_from_codec_data();
        self.src_caps = None;

        Ok(())
    }

    /// Feeds the parameter sets of the input `avcC` to the parser.
    fn seed_from_codec_data(&mut self) {
        let Some(record) = self.codec_record.take() else {
            return;
        };

        for nal in record.sps.iter().chain(record.pps.iter()) {
            self.parse_nal(nal, None);
        }

        self.codec_record = Some(record);
        self.refill_pending_codec_nals();
    }

    fn refill_pending_codec_nals(&mut self) {
        self.pending_codec_nals.clear();

        if let Some(record) = &self.codec_record {
            if !self.converter.output_packetized {
                self.pending_codec_nals
                    .extend(record.sps.iter().chain(record.pps.iter()).cloned());
            }
        }
    }

    /// The caps matching the current output.
    pub fn output_caps(&self) -> Caps {
        let packetized = self.converter.output_packetized;

        let codec_data = if !packetized {
            None
        } else if self.converter.input_packetized {
            self.codec_data.clone()
        } else {
            AvcDecoderConfigurationRecord::from_parameter_sets(
                self.injector.sps_nals().cloned().collect(),
                self.injector.pps_nals().cloned().collect(),
                self.converter.nal_length_size,
            )
            .map(|record| record.to_bytes())
            .map_err(|e| log::trace!("No codec_data yet: {}", e))
            .ok()
        };

        let alignment = if self.settings.access_unit
            || (self.converter.input_packetized && !self.settings.split_packetized)
        {
            Alignment::Au
        } else {
            Alignment::Nal
        };

        let sps = self.parser.current_sps();

        Caps {
            stream_format: if packetized {
                StreamFormat::Avc
            } else {
                StreamFormat::ByteStream
            },
            alignment,
            codec_data,
            resolution: sps.map(|sps| Resolution {
                width: sps.width(),
                height: sps.height(),
            }),
            framerate: sps.and_then(framerate),
        }
    }

    fn update_src_caps<D: Downstream>(&mut self, ds: &mut D) {
        let caps = self.output_caps();

        if self.src_caps.as_ref() != Some(&caps) {
            log::debug!("Output caps changed to {:?}", caps);
            ds.set_caps(&caps);
            self.src_caps = Some(caps);
        }
    }

    /// Updates the parsing state from a bare NAL unit. Parse failures are
    /// logged and leave the state untouched.
    fn parse_nal(&mut self, nal: &Bytes, dts: Option<u64>) -> NalInfo {
        let mut info = NalInfo::default();

        let nalu = match Nalu::from_bytes(nal) {
            Ok(nalu) => nalu,
            Err(e) => {
                log::debug!("Not parsing NAL unit: {:#}", e);
                return info;
            }
        };

        match nalu.header.type_ {
            NaluType::Sps => match self.parser.parse_sps(&nalu) {
                Ok(sps) => {
                    let id = sps.seq_parameter_set_id;
                    // Output caps follow on the next push.
                    if self.injector.store_sps(id, nal.clone()) {
                        log::debug!("SPS {} updated", id);
                    }
                }
                Err(e) => log::warn!("Failed to parse SPS: {:#}", e),
            },
            NaluType::Pps => match self.parser.parse_pps(&nalu) {
                Ok(pps) => {
                    let id = pps.pic_parameter_set_id;
                    if self.injector.store_pps(id, nal.clone()) {
                        log::debug!("PPS {} updated", id);
                    }
                }
                Err(e) => log::warn!("Failed to parse PPS: {:#}", e),
            },
            NaluType::Sei => match self.parser.parse_sei(&nalu) {
                Ok(messages) => {
                    for message in messages {
                        match message {
                            SeiMessage::BufferingPeriod(_) => self
                                .timestamps
                                .on_buffering_period(dts.or(self.pending_ts.dts)),
                            SeiMessage::PicTiming(pic_timing) => {
                                self.pic_timing = Some(pic_timing)
                            }
                            SeiMessage::Unknown { .. } => (),
                        }
                    }
                }
                Err(e) => log::warn!("Failed to parse SEI: {:#}", e),
            },
            type_ if type_.is_picture_slice() => {
                let first_mb_zero = NextHeader::parse(nal).is_some_and(|h| h.first_mb_zero);

                info.is_slice = true;
                info.is_idr = nalu.header.idr_pic_flag;
                info.delta_unit = !info.is_idr;
                info.starts_picture = self.assembler.latch_slice(first_mb_zero);

                match self.parser.parse_slice_header(&nalu) {
                    Ok(header) => {
                        info.delta_unit = !header.slice_type.is_intra();
                        info.field_pic = header.field_pic_flag;
                    }
                    Err(e) => log::debug!("Failed to parse slice header: {:#}", e),
                }
            }
            _ => (),
        }

        info
    }

    /// Timing of a unit starting a picture. Upstream timestamps seen since
    /// the previous picture apply to it.
    fn picture_timing(&mut self, info: &NalInfo, pts: Option<u64>, dts: Option<u64>) -> UnitTiming {
        let pending = std::mem::take(&mut self.pending_ts);
        let pts = pts.or(pending.pts);
        let dts = dts.or(pending.dts);
        let pic_timing = self.pic_timing.take();

        if self.rate < 0.0 {
            return UnitTiming {
                pts,
                dts,
                duration: None,
            };
        }

        let timing = PictureTiming {
            cpb_removal_delay: pic_timing.as_ref().map_or(0, |pt| pt.cpb_removal_delay),
            pic_struct: pic_timing.and_then(|pt| pt.pic_struct),
            field_pic: info.field_pic,
        };
        let out = self
            .timestamps
            .on_picture(self.parser.current_sps(), &timing, dts);

        UnitTiming {
            pts,
            dts: out.dts,
            duration: out.duration,
        }
    }

    /// Handles one NAL unit, `next` being the header of the following one.
    fn process_nal<D: Downstream>(
        &mut self,
        nal: ScannedNal,
        next: Option<NextHeader>,
        delta_override: Option<bool>,
        ds: &mut D,
    ) -> FlowResult {
        let info = self.parse_nal(&nal.nal_bytes(), nal.dts);

        let timing = if info.starts_picture {
            self.picture_timing(&info, nal.pts, nal.dts)
        } else {
            let pending = &mut self.pending_ts;
            if !info.is_slice && pending.pts.is_none() && pending.dts.is_none() {
                pending.pts = nal.pts;
                pending.dts = nal.dts;
            }
            UnitTiming {
                pts: nal.pts,
                dts: nal.dts,
                duration: None,
            }
        };

        let delta_unit = delta_override.unwrap_or(info.delta_unit);
        let data = self.converter.write_nal_prefix(nal.data);
        let complete = self.assembler.is_complete(next);

        if self.settings.access_unit {
            self.assembler
                .append(&data, timing.pts, timing.dts, nal.discont, info.is_idr);
            if info.starts_picture {
                self.assembler
                    .mark_picture(timing.pts, timing.dts, timing.duration, delta_unit);
            }

            if !complete {
                return Ok(());
            }

            return match self.assembler.finish() {
                Some(frame) => self.push_frame(frame, ds),
                None => Ok(()),
            };
        }

        let frame = Frame {
            buffer: Buffer {
                data,
                pts: timing.pts,
                dts: timing.dts,
                duration: timing.duration,
                discont: nal.discont,
                delta_unit,
            },
            idr_offset: info.is_idr.then_some(0),
            has_picture: info.is_slice,
            merged: false,
        };

        self.push_frame(frame, ds)
    }

    /// Handles a length prefixed buffer, either unit by unit or whole.
    fn process_packetized<D: Downstream>(
        &mut self,
        buffer: Buffer,
        delta_override: Option<bool>,
        ds: &mut D,
    ) -> FlowResult {
        let nals = split_packetized(&buffer, self.converter.nal_length_size);

        if self.settings.split_packetized {
            let mut nals = nals.into_iter().peekable();
            while let Some(nal) = nals.next() {
                let next = nals.peek().and_then(ScannedNal::header);
                self.process_nal(nal, next, delta_override, ds)?;
            }
            return Ok(());
        }

        let mut picture = None;
        let mut has_picture = false;
        for nal in &nals {
            let info = self.parse_nal(&nal.nal_bytes(), buffer.dts);
            if info.starts_picture && picture.is_none() {
                picture = Some((self.picture_timing(&info, buffer.pts, buffer.dts), info));
            }
            has_picture |= info.is_slice;
        }
        // The buffer is a whole access unit.
        self.assembler.is_complete(None);

        let data = self.converter.write_nal_prefix(buffer.data);
        let idr_offset = nal_positions(
            &data,
            self.converter.output_packetized,
            self.converter.nal_length_size,
        )
        .into_iter()
        .find(|pos| data[pos.header] & 0x1f == NaluType::SliceIdr as u8)
        .map(|pos| pos.offset);

        let (timing, delta_unit) = match picture {
            Some((timing, info)) => (timing, info.delta_unit),
            None => (
                UnitTiming {
                    pts: buffer.pts,
                    dts: buffer.dts,
                    duration: None,
                },
                false,
            ),
        };

        let frame = Frame {
            buffer: Buffer {
                data,
                pts: timing.pts,
                dts: timing.dts,
                duration: timing.duration,
                discont: buffer.discont,
                delta_unit: delta_override.unwrap_or(delta_unit),
            },
            idr_offset,
            has_picture,
            merged: true,
        };

        self.push_frame(frame, ds)
    }

    /// Sends `frame` downstream, preceded by the parameter sets it needs.
    fn push_frame<D: Downstream>(&mut self, mut frame: Frame, ds: &mut D) -> FlowResult {
        self.update_src_caps(ds);

        if frame.has_picture && !self.pending_codec_nals.is_empty() {
            let nals = std::mem::take(&mut self.pending_codec_nals);
            log::debug!("Sending {} parameter sets from codec_data", nals.len());

            if frame.merged {
                let offset = frame.idr_offset.unwrap_or(0);
                let len = frame.buffer.len();
                frame.buffer.data =
                    splice_nals(&self.converter, &frame.buffer.data, offset, nals.iter());
                let inserted = frame.buffer.len() - len;
                frame.idr_offset = frame.idr_offset.map(|offset| offset + inserted);
            } else {
                for data in nals.iter().filter_map(|nal| self.converter.make_nal(nal)) {
                    ds.push(Buffer {
                        data,
                        pts: frame.buffer.pts,
                        dts: frame.buffer.dts,
                        duration: Some(0),
                        ..Default::default()
                    })?;
                }
            }
        }

        if let Some(idr_offset) = frame.idr_offset {
            let ts = frame.buffer.pts.or(frame.buffer.dts);

            if self.injector.is_due(self.settings.config_interval, ts) && self.injector.has_config()
            {
                log::debug!("Inserting parameter sets before IDR at {:?}", ts);

                if frame.merged {
                    frame.buffer.data =
                        self.injector
                            .splice(&self.converter, &frame.buffer.data, idr_offset);
                } else {
                    for buffer in self.injector.config_buffers(&self.converter, &frame.buffer) {
                        ds.push(buffer)?;
                    }
                }

                self.injector.mark_injected(ts);
            }
        }

        ds.push(frame.buffer)
    }

    fn drain_scanner<D: Downstream>(&mut self, draining: bool, ds: &mut D) -> FlowResult {
        while let Some(nal) = self.scanner.next_nal(draining) {
            let next = self.scanner.peek_next_header();
            self.process_nal(nal, next, None, ds)?;
        }

        Ok(())
    }

    /// Sends on units released by reverse playback, in order.
    fn push_decode_units<D: Downstream>(&mut self, units: Vec<DecodeUnit>, ds: &mut D) -> FlowResult {
        let mut units = units.into_iter().peekable();

        while let Some(unit) = units.next() {
            let next = units.peek().map(DecodeUnit::header);
            let delta = Some(!unit.is_i_frame);

            if self.converter.input_packetized {
                self.process_packetized(unit.buffer, delta, ds)?;
            } else {
                let nal = ScannedNal {
                    data: unit.buffer.data,
                    prefix_len: 4,
                    pts: unit.buffer.pts,
                    dts: unit.buffer.dts,
                    discont: unit.buffer.discont,
                };
                self.process_nal(nal, next, delta, ds)?;
            }
        }

        Ok(())
    }

    /// Handles an input buffer.
    pub fn chain<D: Downstream>(&mut self, buffer: Buffer, ds: &mut D) -> FlowResult {
        if self.rate < 0.0 {
            if buffer.discont && self.reverse.has_gathered() {
                let units = self.reverse.process_gathered(
                    self.converter.input_packetized,
                    self.converter.nal_length_size,
                );
                self.push_decode_units(units, ds)?;
            }

            self.reverse.gather(buffer);
            return Ok(());
        }

        if self.converter.input_packetized {
            return self.process_packetized(buffer, None, ds);
        }

        self.scanner.push(buffer);
        self.drain_scanner(false, ds)
    }

    /// Pushes out everything still held.
    fn drain<D: Downstream>(&mut self, ds: &mut D) -> FlowResult {
        if self.rate < 0.0 {
            let units = self
                .reverse
                .drain(self.converter.input_packetized, self.converter.nal_length_size);
            self.push_decode_units(units, ds)?;
        } else if !self.converter.input_packetized {
            self.drain_scanner(true, ds)?;
        }

        match self.assembler.finish() {
            Some(frame) => self.push_frame(frame, ds),
            None => Ok(()),
        }
    }

    /// Drops all queued data and parsing state. Parameter sets from the input
    /// `codec_data` are fed in again.
    pub fn reset(&mut self) {
        self.parser = Default::default();
        self.scanner.reset();
        self.assembler.reset();
        self.timestamps.reset();
        self.injector.reset();
        self.reverse.reset();
        self.pic_timing = None;
        self.pending_ts = Default::default();
        self.seed_from_codec_data();
    }

    pub fn handle_event<D: Downstream>(&mut self, event: Event, ds: &mut D) -> FlowResult {
        match event {
            Event::FlushStop => {
                log::debug!("Flush");
                self.reset();
                Ok(())
            }
            Event::Eos => self.drain(ds),
            Event::Segment { rate } => {
                log::debug!("Segment with rate {}", rate);
                self.rate = rate;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::parser::Pps;
    use crate::codec::h264::parser::SliceHeader;
    use crate::codec::h264::parser::SliceType;
    use crate::codec::h264::parser::SpsBuilder;
    use crate::codec::h264::synthesizer::Synthesizer;
    use crate::h264parse::types::FlowError;

    const FRAME: u64 = 33_333_333;

    fn sps() -> Sps {
        SpsBuilder::new()
            .resolution(176, 144)
            .timing_info(1, 60, true)
            .build()
    }

    fn sps_nal() -> Vec<u8> {
        let mut buf = vec![];
        Synthesizer::<Sps, &mut Vec<u8>>::synthesize(3, &sps(), &mut buf, true).unwrap();
        buf
    }

    fn pps_nal() -> Vec<u8> {
        let mut buf = vec![];
        Synthesizer::<Pps, &mut Vec<u8>>::synthesize(3, &Pps::default(), &mut buf, true).unwrap();
        buf
    }

    fn slice_nal(type_: NaluType, slice_type: SliceType, first_mb_in_slice: u32) -> Vec<u8> {
        let header = SliceHeader {
            first_mb_in_slice,
            slice_type,
            ..Default::default()
        };
        let mut buf = vec![];
        Synthesizer::<SliceHeader, &mut Vec<u8>>::synthesize(
            if type_ == NaluType::SliceIdr { 3 } else { 2 },
            type_,
            &header,
            &sps(),
            &mut buf,
        )
        .unwrap();
        buf
    }

    fn idr() -> Vec<u8> {
        slice_nal(NaluType::SliceIdr, SliceType::I, 0)
    }

    fn p() -> Vec<u8> {
        slice_nal(NaluType::Slice, SliceType::P, 0)
    }

    fn annexb(nals: &[Vec<u8>]) -> Vec<u8> {
        nals.iter()
            .flat_map(|nal| [0u8, 0, 0, 1].into_iter().chain(nal.iter().copied()))
            .collect()
    }

    fn length_prefixed(nals: &[Vec<u8>]) -> Vec<u8> {
        nals.iter()
            .flat_map(|nal| (nal.len() as u32).to_be_bytes().into_iter().chain(nal.iter().copied()))
            .collect()
    }

    /// Collects buffers and caps.
    #[derive(Default)]
    struct Sink {
        buffers: Vec<Buffer>,
        caps: Vec<Caps>,
    }

    impl Downstream for Sink {
        fn push(&mut self, buffer: Buffer) -> FlowResult {
            self.buffers.push(buffer);
            Ok(())
        }

        fn set_caps(&mut self, caps: &Caps) {
            self.caps.push(caps.clone());
        }
    }

    fn nal_type(buffer: &Buffer) -> u8 {
        buffer.data[4] & 0x1f
    }

    #[test]
    fn access_units_are_merged() {
        let mut parse = H264Parse::new(Settings {
            access_unit: true,
            ..Default::default()
        })
        .unwrap();
        let mut sink = Sink::default();

        let stream = annexb(&[sps_nal(), pps_nal(), idr(), p()]);
        parse
            .chain(Buffer::new(stream.clone()).with_timestamps(Some(0), Some(0)), &mut sink)
            .unwrap();
        assert_eq!(sink.buffers.len(), 1);
        parse.handle_event(Event::Eos, &mut sink).unwrap();

        assert_eq!(sink.buffers.len(), 2);
        let split = stream.len() - p().len() - 4;
        assert_eq!(sink.buffers[0].data.as_ref(), &stream[..split]);
        assert_eq!(sink.buffers[1].data.as_ref(), &stream[split..]);

        assert_eq!(sink.buffers[0].dts, Some(0));
        assert_eq!(sink.buffers[0].duration, Some(FRAME));
        assert!(!sink.buffers[0].delta_unit);
        assert_eq!(sink.buffers[1].dts, Some(FRAME));
        assert!(sink.buffers[1].delta_unit);

        assert_eq!(
            sink.caps.last(),
            Some(&Caps {
                stream_format: StreamFormat::ByteStream,
                alignment: Alignment::Au,
                codec_data: None,
                resolution: Some(Resolution {
                    width: 176,
                    height: 144
                }),
                framerate: Some((30, 1)),
            })
        );
    }

    #[test]
    fn nal_alignment() {
        let mut parse = H264Parse::new(Default::default()).unwrap();
        let mut sink = Sink::default();

        parse
            .chain(
                Buffer::new(annexb(&[sps_nal(), pps_nal(), idr()])).with_timestamps(Some(0), None),
                &mut sink,
            )
            .unwrap();
        parse
            .chain(Buffer::new(annexb(&[p()])).with_timestamps(Some(FRAME), None), &mut sink)
            .unwrap();
        parse.handle_event(Event::Eos, &mut sink).unwrap();

        let types: Vec<_> = sink.buffers.iter().map(nal_type).collect();
        assert_eq!(types, vec![7, 8, 5, 1]);
        // The IDR takes the timestamp of its buffer, which went to the SPS.
        assert_eq!(sink.buffers[2].pts, Some(0));
        assert_eq!(sink.buffers[2].dts, Some(0));
        assert_eq!(sink.buffers[3].pts, Some(FRAME));
        assert_eq!(sink.buffers[3].dts, Some(FRAME));
        assert_eq!(sink.caps.len(), 1);
    }

    #[test]
    fn parameter_sets_are_repeated() {
        let mut parse = H264Parse::new(Settings {
            config_interval: 1,
            ..Default::default()
        })
        .unwrap();
        let mut sink = Sink::default();

        for (nals, pts) in [
            (vec![sps_nal(), pps_nal(), idr()], 0),
            (vec![p()], FRAME),
            (vec![idr()], 1_500_000_000),
        ] {
            parse
                .chain(Buffer::new(annexb(&nals)).with_timestamps(Some(pts), None), &mut sink)
                .unwrap();
        }
        parse.handle_event(Event::Eos, &mut sink).unwrap();

        let types: Vec<_> = sink.buffers.iter().map(nal_type).collect();
        assert_eq!(types, vec![7, 8, 5, 1, 7, 8, 5]);
        for injected in &sink.buffers[4..6] {
            assert_eq!(injected.pts, Some(1_500_000_000));
            assert_eq!(injected.duration, Some(0));
        }
    }

    #[test]
    fn byte_stream_to_sample() {
        let mut parse = H264Parse::new(Settings {
            access_unit: true,
            output_format: OutputFormat::Sample,
            ..Default::default()
        })
        .unwrap();
        parse.set_caps(&Caps::byte_stream()).unwrap();
        let mut sink = Sink::default();

        parse
            .chain(Buffer::new(annexb(&[sps_nal(), pps_nal(), idr()])), &mut sink)
            .unwrap();
        parse.handle_event(Event::Eos, &mut sink).unwrap();

        assert_eq!(sink.buffers.len(), 1);
        assert_eq!(
            sink.buffers[0].data.as_ref(),
            &length_prefixed(&[sps_nal(), pps_nal(), idr()])[..]
        );

        let caps = parse.src_caps().unwrap();
        assert_eq!(caps.stream_format, StreamFormat::Avc);
        let record =
            AvcDecoderConfigurationRecord::parse(caps.codec_data.as_ref().unwrap()).unwrap();
        assert_eq!(record.nal_length_size, 4);
        assert_eq!(record.sps, vec![Bytes::from(sps_nal())]);
        assert_eq!(record.pps, vec![Bytes::from(pps_nal())]);
    }

    #[test]
    fn avc_input_to_byte_stream() {
        let codec_data = AvcDecoderConfigurationRecord::from_parameter_sets(
            vec![Bytes::from(sps_nal())],
            vec![Bytes::from(pps_nal())],
            4,
        )
        .unwrap()
        .to_bytes();

        let mut parse = H264Parse::new(Settings {
            output_format: OutputFormat::ByteStream,
            ..Default::default()
        })
        .unwrap();
        parse.set_caps(&Caps::avc(codec_data)).unwrap();
        assert!(parse.parser().get_sps(0).is_some());
        assert!(parse.parser().get_pps(0).is_some());

        let mut sink = Sink::default();
        parse
            .chain(Buffer::new(length_prefixed(&[idr()])), &mut sink)
            .unwrap();
        parse
            .chain(Buffer::new(length_prefixed(&[p()])), &mut sink)
            .unwrap();

        assert_eq!(sink.buffers.len(), 2);
        // The parameter sets travel in band with the first picture.
        assert_eq!(
            sink.buffers[0].data.as_ref(),
            &annexb(&[sps_nal(), pps_nal(), idr()])[..]
        );
        assert_eq!(sink.buffers[1].data.as_ref(), &annexb(&[p()])[..]);
        assert_eq!(parse.src_caps().unwrap().alignment, Alignment::Au);
        assert_eq!(parse.src_caps().unwrap().codec_data, None);
    }

    #[test]
    fn avc_input_needs_codec_data() {
        let mut parse = H264Parse::new(Default::default()).unwrap();

        let caps = Caps {
            stream_format: StreamFormat::Avc,
            ..Default::default()
        };
        assert!(matches!(
            parse.set_caps(&caps),
            Err(NegotiationError::MissingCodecData)
        ));
        assert!(matches!(
            parse.set_caps(&Caps::avc(vec![0x02, 0x42, 0x00, 0x1e, 0xff, 0xe0, 0x00])),
            Err(NegotiationError::AvcC(AvcCError::UnsupportedVersion(2)))
        ));
    }

    #[test]
    fn flush_drops_everything() {
        let mut parse = H264Parse::new(Default::default()).unwrap();
        let mut sink = Sink::default();

        parse
            .chain(Buffer::new(annexb(&[sps_nal(), pps_nal()])), &mut sink)
            .unwrap();
        parse.handle_event(Event::FlushStop, &mut sink).unwrap();
        parse.handle_event(Event::Eos, &mut sink).unwrap();

        // Only the SPS had its successor in view.
        assert_eq!(sink.buffers.len(), 1);
        assert!(parse.parser().get_sps(0).is_none());
    }

    #[test]
    fn downstream_errors_stop_processing() {
        struct Refusing;

        impl Downstream for Refusing {
            fn push(&mut self, _buffer: Buffer) -> FlowResult {
                Err(FlowError::NotLinked)
            }
        }

        let mut parse = H264Parse::new(Default::default()).unwrap();
        assert_eq!(
            parse.chain(Buffer::new(annexb(&[sps_nal(), pps_nal(), idr()])), &mut Refusing),
            Err(FlowError::NotLinked)
        );
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = Settings {
            config_interval: 3601,
            ..Default::default()
        };
        assert!(H264Parse::new(settings.clone()).is_err());

        let mut parse = H264Parse::new(Default::default()).unwrap();
        assert!(parse.set_settings(settings).is_err());
        assert_eq!(parse.settings(), &Settings::default());
    }
}
