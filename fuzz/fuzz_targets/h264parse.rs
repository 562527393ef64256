#![no_main]

use h264parse::h264parse::settings::Settings;
use h264parse::h264parse::types::Buffer;
use h264parse::h264parse::types::Event;
use h264parse::h264parse::H264Parse;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&flags, data)) = data.split_first() else {
        return;
    };

    let settings = Settings {
        access_unit: flags & 0x1 != 0,
        output_format: if flags & 0x2 != 0 {
            "sample".parse().unwrap()
        } else {
            Default::default()
        },
        config_interval: u32::from(flags >> 4),
        ..Default::default()
    };
    let mut parse = H264Parse::new(settings).unwrap();
    let mut out = Vec::new();

    // Odd chunk sizes so that start codes straddle buffers.
    for chunk in data.chunks(usize::from(flags >> 2 & 0x3) * 61 + 7) {
        let _ = parse.chain(Buffer::new(chunk.to_vec()), &mut out);
    }
    let _ = parse.handle_event(Event::Eos, &mut out);
});
