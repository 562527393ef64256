// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::codec::h264::parser::MAX_PPS_COUNT;
use crate::codec::h264::parser::MAX_SPS_COUNT;
use crate::h264parse::converter::Converter;
use crate::h264parse::types::Buffer;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Keeps the raw parameter sets seen in the stream and re-sends them in
/// front of IDR pictures every `config-interval` seconds.
#[derive(Debug)]
pub struct ConfigInjector {
    /// Timestamp of the last injection.
    last_report: Option<u64>,
    /// Bare SPS NAL units, by id.
    sps_nals: [Option<Bytes>; MAX_SPS_COUNT],
    /// Bare PPS NAL units, by id.
    pps_nals: [Option<Bytes>; MAX_PPS_COUNT],
}

impl Default for ConfigInjector {
    fn default() -> Self {
        Self {
            last_report: None,
            sps_nals: std::array::from_fn(|_| None),
            pps_nals: std::array::from_fn(|_| None),
        }
    }
}

impl ConfigInjector {
    fn store(slot: &mut Option<Bytes>, nal: Bytes) -> bool {
        let changed = slot.as_ref() != Some(&nal);
        *slot = Some(nal);
        changed
    }

    /// Stores a SPS. Returns whether it differs from the one it replaces.
    pub fn store_sps(&mut self, id: u8, nal: Bytes) -> bool {
        match self.sps_nals.get_mut(usize::from(id)) {
            Some(slot) => Self::store(slot, nal),
            None => false,
        }
    }

    /// Stores a PPS. Returns whether it differs from the one it replaces.
    pub fn store_pps(&mut self, id: u8, nal: Bytes) -> bool {
        Self::store(&mut self.pps_nals[usize::from(id)], nal)
    }

    pub fn sps_nals(&self) -> impl Iterator<Item = &Bytes> {
        self.sps_nals.iter().flatten()
    }

    pub fn pps_nals(&self) -> impl Iterator<Item = &Bytes> {
        self.pps_nals.iter().flatten()
    }

    fn config_nals(&self) -> impl Iterator<Item = &Bytes> {
        self.sps_nals().chain(self.pps_nals())
    }

    pub fn has_config(&self) -> bool {
        self.config_nals().next().is_some()
    }

    /// Whether at least `interval` seconds went by since the last injection.
    /// The first call only records `ts` as the reference.
    pub fn is_due(&mut self, interval: u32, ts: Option<u64>) -> bool {
        let Some(ts) = ts else {
            return false;
        };
        if interval == 0 {
            return false;
        }

        match self.last_report {
            None => {
                self.last_report = Some(ts);
                false
            }
            Some(last) => ts.saturating_sub(last) / NANOS_PER_SECOND >= u64::from(interval),
        }
    }

    pub fn mark_injected(&mut self, ts: Option<u64>) {
        if ts.is_some() {
            self.last_report = ts;
        }
    }

    /// Every stored SPS then PPS as its own buffer, timed like `idr`.
    pub fn config_buffers(&self, converter: &Converter, idr: &Buffer) -> Vec<Buffer> {
        self.config_nals()
            .filter_map(|nal| converter.make_nal(nal))
            .map(|data| Buffer {
                data,
                pts: idr.pts,
                dts: idr.dts,
                duration: Some(0),
                ..Default::default()
            })
            .collect()
    }

    /// Copies every stored SPS then PPS into `au`, right before the IDR NAL
    /// unit at `idr_offset`.
    pub fn splice(&self, converter: &Converter, au: &[u8], idr_offset: usize) -> Bytes {
        splice_nals(converter, au, idr_offset, self.config_nals())
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }
}

/// Inserts `nals`, prefixed for output, into `au` at `offset`.
pub fn splice_nals<'a>(
    converter: &Converter,
    au: &[u8],
    offset: usize,
    nals: impl Iterator<Item = &'a Bytes>,
) -> Bytes {
    let offset = offset.min(au.len());
    let mut out = BytesMut::with_capacity(au.len());

    out.put_slice(&au[..offset]);
    for nal in nals.filter_map(|nal| converter.make_nal(nal)) {
        out.put_slice(&nal);
    }
    out.put_slice(&au[offset..]);

    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    static SPS: [u8; 4] = [0x67, 0x42, 0xc0, 0x1e];
    static PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];

    fn injector() -> ConfigInjector {
        let mut injector = ConfigInjector::default();
        assert!(injector.store_sps(0, Bytes::from_static(&SPS)));
        assert!(injector.store_pps(0, Bytes::from_static(&PPS)));
        injector
    }

    #[test]
    fn storage_reports_changes() {
        let mut injector = injector();
        assert!(!injector.store_sps(0, Bytes::from_static(&SPS)));
        assert!(injector.store_pps(0, Bytes::from_static(&SPS)));
        assert!(!injector.store_sps(32, Bytes::from_static(&SPS)));
        assert_eq!(injector.sps_nals().count(), 1);

        injector.reset();
        assert!(!injector.has_config());
    }

    #[test]
    fn interval_in_whole_seconds() {
        let mut injector = injector();
        assert!(!injector.is_due(1, None));
        // The first IDR only sets the reference.
        assert!(!injector.is_due(1, Some(500_000_000)));
        assert!(!injector.is_due(1, Some(1_400_000_000)));
        assert!(injector.is_due(1, Some(1_500_000_000)));
        injector.mark_injected(Some(1_500_000_000));
        assert!(!injector.is_due(1, Some(2_000_000_000)));
        assert!(!injector.is_due(0, Some(9_000_000_000)));
    }

    #[test]
    fn separate_buffers() {
        let injector = injector();
        let converter = Converter::default();
        let idr = Buffer::new(vec![0x00, 0x00, 0x00, 0x01, 0x65]).with_timestamps(Some(7), Some(3));

        let buffers = injector.config_buffers(&converter, &idr);
        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers[0].data.as_ref(), &[0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0xc0, 0x1e]);
        assert_eq!(buffers[1].data[4], 0x68);
        for buffer in buffers {
            assert_eq!((buffer.pts, buffer.dts, buffer.duration), (Some(7), Some(3), Some(0)));
        }
    }

    #[test]
    fn spliced_before_the_idr() {
        let injector = injector();
        let converter = Converter::new(true, true, 2);
        let au = [0x00, 0x02, 0x09, 0x10, 0x00, 0x02, 0x65, 0x88];

        let out = injector.splice(&converter, &au, 4);
        assert_eq!(
            out.as_ref(),
            &[
                0x00, 0x02, 0x09, 0x10, // AUD
                0x00, 0x04, 0x67, 0x42, 0xc0, 0x1e, // SPS
                0x00, 0x04, 0x68, 0xce, 0x3c, 0x80, // PPS
                0x00, 0x02, 0x65, 0x88, // IDR
            ]
        );
    }
}
