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

use std::collections::VecDeque;

use crate::error;
use crate::spi::Master;

/// Scripted SPI master. Every `transfer` pops the next canned reply and
/// copies it into the receive buffer (missing or short replies read as
/// zeros, which the command layer treats as a silent chain).
pub struct MockMaster {
    replies: VecDeque<Vec<u8>>,
    /// Transmit frames in issue order, for asserting on the wire traffic
    pub sent: Vec<Vec<u8>>,
    pub speed_log: Vec<u32>,
    speed_khz: u32,
}

impl MockMaster {
    pub fn new() -> Self {
        Self {
            replies: VecDeque::new(),
            sent: Vec::new(),
            speed_log: Vec::new(),
            speed_khz: 0,
        }
    }

    pub fn push_reply(&mut self, reply: Vec<u8>) {
        self.replies.push_back(reply);
    }

    /// Queue `count` all-zero replies (idle bus)
    pub fn push_silence(&mut self, count: usize) {
        for _ in 0..count {
            self.replies.push_back(Vec::new());
        }
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }
}

impl Master for MockMaster {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> error::Result<()> {
        self.sent.push(tx.to_vec());
        for byte in rx.iter_mut() {
            *byte = 0;
        }
        if let Some(reply) = self.replies.pop_front() {
            let n = reply.len().min(rx.len());
            rx[..n].copy_from_slice(&reply[..n]);
        }
        Ok(())
    }

    fn set_speed_khz(&mut self, speed_khz: u32) -> error::Result<()> {
        self.speed_khz = speed_khz;
        self.speed_log.push(speed_khz);
        Ok(())
    }

    fn speed_khz(&self) -> u32 {
        self.speed_khz
    }
}
