// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Bitmine A1 chip protocol: command opcodes, register layouts and the
//! mining job frame.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use packed_struct::prelude::*;
use packed_struct_codegen::{PackedStruct, PrimitiveEnum_u8};

use crate::hal;

/// Command opcodes. A command is `[opcode, chip_address, payload...]`; the
/// chips repeat it down the chain and echo it back as the acknowledgement.
pub const BIST_START: u8 = 0x01;
pub const BIST_FIX: u8 = 0x03;
pub const RESET: u8 = 0x04;
pub const WRITE_JOB: u8 = 0x07;
pub const READ_RESULT: u8 = 0x08;
pub const WRITE_REG: u8 = 0x09;
pub const READ_REG: u8 = 0x0a;
pub const READ_REG_RESP: u8 = 0x1a;

/// Reset strategy aborting in-flight jobs while preserving the PLL setup
pub const RESET_ABORT_JOBS: u8 = 0xe5;

/// The WRITE_JOB command is the largest (2 bytes command, 56 bytes payload)
pub const WRITE_JOB_LENGTH: usize = 58;

/// Longest chain the protocol can address
pub const MAX_CHAIN_LENGTH: usize = 64;

/// For commands to traverse the chain, we need to issue dummy writes to
/// keep the SPI clock running. To reach the last chip in the chain, we need
/// to write the command, followed by chain-length words to pass it through
/// the chain and another chain-length words to get the ACK back to host.
pub const MAX_CMD_LENGTH: usize = WRITE_JOB_LENGTH + MAX_CHAIN_LENGTH * 2 * 2;

/// Chips reporting fewer cores than this run a reduced clock
pub const WEAK_CHIP_THRESHOLD: u8 = 30;
/// Chips reporting fewer cores than this are taken out of service
pub const BROKEN_CHIP_THRESHOLD: u8 = 26;

pub const WEAK_CHIP_SYS_CLK_KHZ: u32 = 600 * 1000;
pub const BROKEN_CHIP_SYS_CLK_KHZ: u32 = 400 * 1000;

/// Chip addressing on the chain wire
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChipAddress {
    All,
    /// 1-based position in the chain, 1 = closest to the host
    One(u8),
}

impl ChipAddress {
    pub fn is_broadcast(&self) -> bool {
        match self {
            ChipAddress::All => true,
            ChipAddress::One(_) => false,
        }
    }

    /// Return wire address or 0 for a broadcast
    pub fn to_wire(&self) -> u8 {
        match self {
            ChipAddress::All => 0,
            ChipAddress::One(x) => {
                assert!(
                    *x >= 1 && *x as usize <= MAX_CHAIN_LENGTH,
                    "chip address {} out of chain range",
                    x
                );
                *x
            }
        }
    }
}

/// State of the two-deep hardware job queue as reported by READ_REG
#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq)]
pub enum QueueState {
    /// Both buffers free, two jobs can be loaded
    Empty = 0,
    /// One buffer free
    OneFree = 1,
    /// Not a defined hardware state
    Invalid = 2,
    /// FIFO full, nothing to do
    Full = 3,
}

/// The 6-byte response body of READ_REG.
///
/// The first two bytes echo the last written PLL parameter word; the rest
/// reports PLL lock, job queue state and the number of good cores found
/// during BIST.
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "6", endian = "msb")]
pub struct ReadRegResp {
    #[packed_field(bits = "47:32")]
    pub pll_param: u16,
    #[packed_field(bits = "24")]
    pub pll_locked: bool,
    #[packed_field(bits = "17:16", ty = "enum")]
    pub queue_state: QueueState,
    /// Job id nibbles of the two jobs currently buffered by the chip
    #[packed_field(bits = "15:8")]
    pub queue_jobs: u8,
    #[packed_field(bits = "7:0")]
    pub num_cores: u8,
}

/// Structure representing settings of the chip PLL divider.
/// It can serialize itself right to the 6-byte register block.
///
/// The synthesized frequency is
/// `sys_clk = (ref_clk * fb_div) / (pre_div * 2^(post_div - 1))`
/// with a higher `post_div` being desired over a higher `pre_div`.
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "6", endian = "msb")]
pub struct PllReg {
    /// Range: 1..=3
    #[packed_field(bits = "47:46")]
    post_div: Integer<u8, packed_bits::Bits2>,
    /// Range: 1..=31
    #[packed_field(bits = "45:41")]
    pre_div: Integer<u8, packed_bits::Bits5>,
    /// Range: 1..=511
    #[packed_field(bits = "40:32")]
    fb_div: Integer<u16, packed_bits::Bits9>,
    /// Loop filter/bias setup, constant in the vendor init sequence
    #[packed_field(bits = "31:16")]
    setup: u16,
    #[packed_field(bits = "15:0")]
    _reserved: u16,
}

impl PllReg {
    const SETUP: u16 = 0x2184;

    pub fn new(pre_div: u8, post_div: u8, fb_div: u16) -> Self {
        Self {
            post_div: post_div.into(),
            pre_div: pre_div.into(),
            fb_div: fb_div.into(),
            setup: Self::SETUP,
            _reserved: 0,
        }
    }

    /// Derive divider settings approximating `sys_clk_khz` from `ref_clk_khz`
    pub fn from_freq(ref_clk_khz: u32, sys_clk_khz: u32) -> Self {
        // Euclidean search for GCD
        let mut a = ref_clk_khz;
        let mut b = sys_clk_khz;
        while b != 0 {
            let h = a % b;
            a = b;
            b = h;
        }
        let mut fb_div = sys_clk_khz / a;
        let mut n = ref_clk_khz / a;
        // approximate multiplier if not exactly matchable
        if fb_div > 511 {
            let f = fb_div / n;
            let m = if f < 32 {
                16
            } else if f < 64 {
                8
            } else if f < 128 {
                4
            } else {
                1
            };
            fb_div = (m * fb_div + n / 2) / n;
            if fb_div > 511 {
                fb_div = 511;
            }
            n = m;
        }
        // try to maximize the post divider
        let post_div = if n & 3 == 0 {
            3
        } else if n & 1 == 0 {
            2
        } else {
            1
        };
        // remainder goes to pre_div
        let mut pre_div = n >> (post_div - 1);
        // correct pre_div overflow
        if pre_div > 31 {
            fb_div = 31 * fb_div / pre_div;
            pre_div = 31;
        }
        Self::new(pre_div as u8, post_div as u8, fb_div as u16)
    }

    /// Simulate the divider and calculate the resulting frequency
    pub fn frequency_khz(&self, ref_clk_khz: u32) -> u32 {
        let pre_div = *self.pre_div as u64;
        let post_div = *self.post_div as u32;
        let fb_div = *self.fb_div as u64;
        (ref_clk_khz as u64 * fb_div / (pre_div << (post_div - 1))) as u32
    }

    pub fn divider(&self) -> (u8, u8, u16) {
        (*self.pre_div, *self.post_div, *self.fb_div)
    }

    /// The two parameter bytes as echoed back in `ReadRegResp::pll_param`
    pub fn param_word(&self) -> u16 {
        let bytes = self.pack();
        u16::from_be_bytes([bytes[0], bytes[1]])
    }
}

/// Assemble the 58-byte WRITE_JOB frame.
///
/// * `job_id` - wire job id, 1..=4
/// * `target` - compact difficulty target replacing the difficulty-1
///   default when a difficulty override is configured
pub fn make_job(
    chip_id: u8,
    job_id: u8,
    work: &hal::Work,
    target: Option<u32>,
) -> [u8; WRITE_JOB_LENGTH] {
    let mut job = [0u8; WRITE_JOB_LENGTH];
    job[0] = (job_id << 4) | WRITE_JOB;
    job[1] = chip_id;
    // midstate goes out byte-reversed as one 256-bit word
    for (dst, src) in job[2..34].iter_mut().zip(work.midstate.iter().rev()) {
        *dst = *src;
    }
    // remaining header data, each 32-bit word byte-reversed
    for i in 0..3 {
        let word = LittleEndian::read_u32(&work.header_tail[4 * i..]);
        BigEndian::write_u32(&mut job[34 + 4 * i..], word);
    }
    // start nonce stays zero
    // difficulty 1 unless overridden
    job[50..54].copy_from_slice(&[0xff, 0xff, 0x00, 0x1d]);
    if let Some(target) = target {
        LittleEndian::write_u32(&mut job[50..54], target);
    }
    // end nonce
    job[54..58].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
    job
}
