// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode timestamp reconstruction from HRD timing or, lacking a buffering
//! period, from accumulated picture durations.

use crate::codec::h264::parser::Sps;
use crate::codec::h264::sei::PicStruct;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Converts `ticks` clock ticks of `num_units_in_tick / time_scale` seconds
/// to nanoseconds.
pub fn ticks_to_ns(ticks: u32, num_units_in_tick: u32, time_scale: u32) -> u64 {
    if time_scale == 0 {
        return 0;
    }

    let ns = u128::from(ticks) * u128::from(num_units_in_tick) * NANOS_PER_SECOND
        / u128::from(time_scale);
    u64::try_from(ns).unwrap_or(u64::MAX)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AnchorState {
    #[default]
    NoAnchor,
    /// A buffering period was seen. `ts_trn_nb` is the nominal removal time
    /// of its access unit.
    HrdAnchored { ts_trn_nb: u64 },
}

/// Per picture inputs, from the latest picture timing SEI and the slice
/// header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PictureTiming {
    pub cpb_removal_delay: u32,
    pub pic_struct: Option<PicStruct>,
    pub field_pic: bool,
}

/// Output timing of a picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PictureTimestamps {
    pub dts: Option<u64>,
    pub duration: Option<u64>,
}

#[derive(Debug, Default)]
pub struct TimestampEngine {
    state: AnchorState,
    last_dts: Option<u64>,
    /// Duration of the previous picture, in fields.
    prev_duration: Option<u32>,
}

impl TimestampEngine {
    pub fn state(&self) -> AnchorState {
        self.state
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    /// Drops an upstream DTS that does not move past the last output one.
    fn guard(&self, upstream_dts: Option<u64>) -> Option<u64> {
        match (upstream_dts, self.last_dts) {
            (Some(dts), Some(last)) if dts <= last => {
                log::trace!("Ignoring upstream dts {} <= {}", dts, last);
                None
            }
            (dts, _) => dts,
        }
    }

    /// A buffering period SEI anchors the HRD timeline at the current DTS.
    pub fn on_buffering_period(&mut self, upstream_dts: Option<u64>) {
        let ts_trn_nb = self.guard(upstream_dts).or(self.last_dts).unwrap_or(0);
        log::debug!("Buffering period, anchoring at {}", ts_trn_nb);
        self.state = AnchorState::HrdAnchored { ts_trn_nb };
    }

    /// Computes the DTS and duration of a picture starting now.
    pub fn on_picture(
        &mut self,
        sps: Option<&Sps>,
        timing: &PictureTiming,
        upstream_dts: Option<u64>,
    ) -> PictureTimestamps {
        let upstream = self.guard(upstream_dts);

        let fields = match timing.pic_struct {
            Some(pic_struct) if sps.is_some_and(Sps::pic_struct_present) => {
                pic_struct.duration_in_fields()
            }
            _ if timing.field_pic => 1,
            _ => 2,
        };

        let Some(vui) = sps
            .filter(|sps| sps.has_timing_info())
            .map(|sps| &sps.vui_parameters)
        else {
            if upstream.is_some() {
                self.last_dts = upstream;
            }
            self.prev_duration = Some(fields);
            return PictureTimestamps {
                dts: upstream,
                duration: None,
            };
        };

        let ticks = |n| ticks_to_ns(n, vui.num_units_in_tick, vui.time_scale);

        let dts = match self.state {
            AnchorState::HrdAnchored { ts_trn_nb } => {
                let offset = ticks(timing.cpb_removal_delay);
                match upstream {
                    Some(dts) => {
                        self.state = AnchorState::HrdAnchored {
                            ts_trn_nb: dts.saturating_sub(offset),
                        };
                        dts
                    }
                    None => ts_trn_nb.saturating_add(offset),
                }
            }
            AnchorState::NoAnchor => match (upstream, self.last_dts) {
                (Some(dts), _) => dts,
                (None, Some(last)) => {
                    last.saturating_add(ticks(self.prev_duration.unwrap_or(fields)))
                }
                (None, None) => 0,
            },
        };

        self.last_dts = Some(dts);
        self.prev_duration = Some(fields);

        PictureTimestamps {
            dts: Some(dts),
            duration: Some(ticks(fields)),
        }
    }
}
