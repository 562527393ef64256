// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::anyhow;

/// A bit reader for h264 bitstreams. It properly handles emulation-prevention
/// bytes and stop bits.
///
/// Reads never fail: asking for more bits than the payload holds returns
/// whatever is left, so decoding a truncated unit yields a best-effort value.
/// Range checks are left to the `*_max`/`*_bounded` helpers.
#[derive(Clone)]
pub struct NaluReader<'a> {
    data: &'a [u8],
    /// Index of the next byte to move into `cache`.
    pos: usize,
    /// Bit cache. Only the lowest `head` bits are valid.
    cache: u64,
    /// Number of unread bits in `cache`.
    head: u32,
    /// The last two bytes taken from `data`, used in epb detection.
    prev_two_bytes: u32,
    /// Number of RBSP bits handed out so far.
    position: u64,
    /// Number of epbs (i.e. 0x000003) we found.
    num_epb: usize,
}

impl<'a> NaluReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            cache: 0xffff_ffff,
            head: 0,
            prev_two_bytes: 0xffff,
            position: 0,
            num_epb: 0,
        }
    }

    fn refill(&mut self, num_bits: u32) {
        while self.head < num_bits && self.pos < self.data.len() {
            let mut byte = self.data[self.pos];
            self.pos += 1;

            if (self.prev_two_bytes & 0xffff) == 0 && byte == 0x03 {
                self.num_epb += 1;
                // A trailing 0x03 is cabac_zero_word padding with nothing after it.
                let Some(next) = self.data.get(self.pos) else {
                    break;
                };
                self.pos += 1;
                byte = *next;
                // The byte following an epb is always data.
                self.prev_two_bytes = 0xffff;
            }

            self.prev_two_bytes = ((self.prev_two_bytes & 0xff) << 8) | u32::from(byte);
            self.cache = (self.cache << 8) | u64::from(byte);
            self.head += 8;
        }
    }

    /// Read up to 32 bits from the stream. If fewer bits are left, only those
    /// are returned.
    pub fn read_bits(&mut self, num_bits: usize) -> u32 {
        debug_assert!(num_bits <= 32);
        let wanted = num_bits.min(32) as u32;

        self.refill(wanted);
        let n = wanted.min(self.head);
        if n == 0 {
            return 0;
        }

        let mut value = (self.cache >> (self.head - n)) as u32;
        if n < 32 {
            value &= (1 << n) - 1;
        }

        self.head -= n;
        self.position += u64::from(n);
        value
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> bool {
        self.read_bits(1) == 1
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: u64) {
        while num_bits > 0 && !self.is_eos() {
            let n = std::cmp::min(num_bits, 32);
            self.read_bits(n as usize);
            num_bits -= n;
        }
    }

    /// Whether every bit of the payload has been consumed.
    pub fn is_eos(&self) -> bool {
        self.pos >= self.data.len() && self.head == 0
    }

    /// Number of RBSP bits (emulation-prevention bytes excluded) read so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns the number of emulation-prevention bytes read so far.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    /// Whether the stream still has RBSP data. Implements more_rbsp_data():
    /// the answer is false when the next set bit is the last one, i.e. the
    /// rbsp_stop_one_bit.
    pub fn has_more_rbsp_data(&self) -> bool {
        let mut ahead = self.clone();
        let mut offset = 0u64;
        let mut last_one = None;

        while !ahead.is_eos() {
            let before = ahead.position();
            let chunk = ahead.read_bits(8);
            let len = ahead.position() - before;
            if chunk != 0 {
                let trailing = u64::from(chunk.trailing_zeros());
                last_one = Some(offset + len - 1 - trailing);
            }
            offset += len;
        }

        matches!(last_one, Some(bit) if bit > 0)
    }

    /// Read an unsigned Exp-Golomb code. Corresponds to `ue(v)`.
    pub fn read_ue(&mut self) -> u32 {
        let mut leading_zeros = 0;
        while leading_zeros < 32 && !self.is_eos() && self.read_bits(1) == 0 {
            leading_zeros += 1;
        }

        let prefix = (1u64 << leading_zeros) - 1;
        prefix.wrapping_add(u64::from(self.read_bits(leading_zeros))) as u32
    }

    /// Read a signed Exp-Golomb code. Corresponds to `se(v)`: 1 maps to 1, 2
    /// to -1, 3 to 2 and so on.
    pub fn read_se(&mut self) -> i32 {
        let code_num = i64::from(self.read_ue());
        let value = (code_num + 1) / 2;

        if code_num % 2 == 1 {
            value as i32
        } else {
            (-value) as i32
        }
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(&mut self, min: u32, max: u32) -> anyhow::Result<U> {
        let ue = self.read_ue();
        if ue > max || ue < min {
            Err(anyhow!(
                "Value out of bounds: expected {} - {}, got {}",
                min,
                max,
                ue
            ))
        } else {
            U::try_from(ue).map_err(|_| anyhow!("Conversion error"))
        }
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> anyhow::Result<U> {
        self.read_ue_bounded(0, max)
    }
}
