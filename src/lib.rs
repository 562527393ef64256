// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 elementary stream parsing: bitstream readers and parameter set
//! parsers under [`codec::h264`], and the [`h264parse::H264Parse`] element that
//! frames a stream into NAL units or access units, converts between byte-stream
//! and length-prefixed layouts and timestamps its output.

pub mod codec;
pub mod h264parse;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}
