// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! h264parse, a small program running an H.264 stream through the parser
//! element. Reads a byte stream or length prefixed file in chunks and writes
//! the reframed stream out, printing one line per output buffer.
//!
//! Without an input file a short synthetic stream is used.

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;

use argh::FromArgs;
use bytes::Bytes;
use h264parse::codec::h264::avcc::AvcDecoderConfigurationRecord;
use h264parse::codec::h264::nalu::NaluType;
use h264parse::codec::h264::parser::Pps;
use h264parse::codec::h264::parser::SliceHeader;
use h264parse::codec::h264::parser::SliceType;
use h264parse::codec::h264::parser::Sps;
use h264parse::codec::h264::parser::SpsBuilder;
use h264parse::codec::h264::synthesizer::Synthesizer;
use h264parse::h264parse::settings::OutputFormat;
use h264parse::h264parse::settings::Settings;
use h264parse::h264parse::types::Buffer;
use h264parse::h264parse::types::Caps;
use h264parse::h264parse::types::Downstream;
use h264parse::h264parse::types::Event;
use h264parse::h264parse::types::FlowError;
use h264parse::h264parse::types::FlowResult;
use h264parse::h264parse::types::StreamFormat;
use h264parse::h264parse::H264Parse;

/// Run an H.264 stream through h264parse
#[derive(Debug, FromArgs)]
struct Args {
    /// input file. A synthetic stream is parsed if not given
    #[argh(positional)]
    input: Option<PathBuf>,

    /// output file to write the parsed stream to
    #[argh(option)]
    output: Option<PathBuf>,

    /// input stream format, byte-stream or avc. Default: byte-stream
    #[argh(option, default = "StreamFormat::ByteStream")]
    input_format: StreamFormat,

    /// file holding the avcC record of an avc input
    #[argh(option)]
    codec_data: Option<PathBuf>,

    /// output stream format: sample, byte-stream or input. Default: input
    #[argh(option, default = "OutputFormat::Input")]
    output_format: OutputFormat,

    /// merge NAL units into access units
    #[argh(switch)]
    access_unit: bool,

    /// emit each NAL unit of an avc input on its own
    #[argh(switch)]
    split_packetized: bool,

    /// seconds between SPS/PPS insertions in front of IDR pictures
    #[argh(option, default = "0")]
    config_interval: u32,

    /// size of the chunks the input is fed in. Default: 4096
    #[argh(option, default = "4096")]
    chunk_size: usize,
}

/// Writes buffers to an optional file and logs them.
struct Sink {
    output: Option<File>,
    count: usize,
}

impl Downstream for Sink {
    fn push(&mut self, buffer: Buffer) -> FlowResult {
        println!(
            "#{:<5} {:6} bytes pts {:?} dts {:?} duration {:?}{}{}",
            self.count,
            buffer.len(),
            buffer.pts,
            buffer.dts,
            buffer.duration,
            if buffer.discont { " discont" } else { "" },
            if buffer.delta_unit { "" } else { " key" },
        );
        self.count += 1;

        if let Some(output) = &mut self.output {
            output
                .write_all(&buffer.data)
                .map_err(|e| FlowError::Error(e.to_string()))?;
        }

        Ok(())
    }

    fn set_caps(&mut self, caps: &Caps) {
        println!(
            "caps: {} alignment {} resolution {:?} framerate {:?}",
            caps.stream_format, caps.alignment, caps.resolution, caps.framerate
        );
    }
}

/// One second of 30 fps video, an IDR then P pictures, in byte stream form.
fn synthetic_stream() -> Vec<u8> {
    let sps = SpsBuilder::new()
        .resolution(320, 240)
        .timing_info(1, 60, true)
        .build();

    let mut stream = vec![];
    let mut put = |nal: Vec<u8>| {
        stream.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        stream.extend_from_slice(&nal);
    };

    let mut nal = vec![];
    Synthesizer::<Sps, _>::synthesize(3, &sps, &mut nal, true).expect("failed to write SPS");
    put(nal);

    let mut nal = vec![];
    Synthesizer::<Pps, _>::synthesize(3, &Pps::default(), &mut nal, true)
        .expect("failed to write PPS");
    put(nal);

    for frame_num in 0..30u16 {
        let (type_, slice_type) = if frame_num == 0 {
            (NaluType::SliceIdr, SliceType::I)
        } else {
            (NaluType::Slice, SliceType::P)
        };
        let header = SliceHeader {
            slice_type,
            frame_num: frame_num % 16,
            ..Default::default()
        };

        let mut nal = vec![];
        Synthesizer::<SliceHeader, _>::synthesize(2, type_, &header, &sps, &mut nal)
            .expect("failed to write slice");
        put(nal);
    }

    stream
}

fn read_file(path: &PathBuf) -> Vec<u8> {
    let mut buf = Vec::new();
    File::open(path)
        .expect("error opening input file")
        .read_to_end(&mut buf)
        .expect("error reading input file");
    buf
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let input = match &args.input {
        Some(path) => read_file(path),
        None => synthetic_stream(),
    };

    let settings = Settings {
        split_packetized: args.split_packetized,
        access_unit: args.access_unit,
        output_format: args.output_format,
        config_interval: args.config_interval,
    };
    let mut parse = H264Parse::new(settings).expect("invalid settings");

    let caps = match args.input_format {
        StreamFormat::ByteStream => Caps::byte_stream(),
        StreamFormat::Avc => {
            let codec_data = args
                .codec_data
                .as_ref()
                .map(read_file)
                .expect("avc input needs --codec-data");
            let record = AvcDecoderConfigurationRecord::parse(&codec_data)
                .expect("invalid codec_data");
            log::info!(
                "avcC: profile {} level {}, {} SPS, {} PPS",
                record.profile_idc,
                record.level_idc,
                record.sps.len(),
                record.pps.len()
            );
            Caps::avc(Bytes::from(codec_data))
        }
    };
    parse.set_caps(&caps).expect("failed to negotiate input");

    let mut sink = Sink {
        output: args
            .output
            .as_ref()
            .map(|p| File::create(p).expect("error creating output file")),
        count: 0,
    };

    // Length prefixed input has to come in whole access units. Byte streams
    // can be cut anywhere.
    let chunks: Vec<Bytes> = match args.input_format {
        StreamFormat::ByteStream => input
            .chunks(args.chunk_size.max(1))
            .map(Bytes::copy_from_slice)
            .collect(),
        StreamFormat::Avc => vec![Bytes::from(input)],
    };

    for chunk in chunks {
        parse
            .chain(Buffer::new(chunk), &mut sink)
            .expect("downstream refused a buffer");
    }
    parse
        .handle_event(Event::Eos, &mut sink)
        .expect("downstream refused a buffer");

    println!("{} buffers", sink.count);
}
