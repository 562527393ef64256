#![no_main]

use h264parse::h264parse::settings::Settings;
use h264parse::h264parse::types::Buffer;
use h264parse::h264parse::types::Caps;
use h264parse::h264parse::types::Event;
use h264parse::h264parse::H264Parse;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&split, data)) = data.split_first() else {
        return;
    };
    let (codec_data, samples) = data.split_at(usize::from(split).min(data.len()));

    let mut parse = H264Parse::new(Settings {
        split_packetized: split & 0x1 != 0,
        ..Default::default()
    })
    .unwrap();
    if parse.set_caps(&Caps::avc(codec_data.to_vec())).is_err() {
        return;
    }

    let mut out = Vec::new();
    let _ = parse.chain(Buffer::new(samples.to_vec()), &mut out);
    let _ = parse.handle_event(Event::Eos, &mut out);
});
