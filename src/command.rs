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

//! Command layer of the A1 chain.
//!
//! A command shifted into the chain travels chip to chip and its echo comes
//! back the same way, so after the command bytes the master must keep
//! clocking idle words: two words per chip to the target and two words back
//! per chip for the acknowledgement. `Context` owns the scratch buffers for
//! one chain and implements the typed command set on top of the raw
//! transfer.

use byteorder::{BigEndian, ByteOrder};
use packed_struct::{PackedStruct, PackedStructSlice};

use std::sync::{Arc, Mutex};

use crate::a1;
use crate::a1::ChipAddress;
use crate::error::{self, ErrorKind};
use crate::logging::macros::*;
use crate::spi;

/// Chain length assumed for broadcast polling before detection has run
const UNKNOWN_CHAIN_GUESS: usize = 8;

/// Number of zero bytes clocked out to drain chip state after an error
const FLUSH_LENGTH: usize = 64;

/// Number of idle bytes to clock after a command so that the ACK of
/// `resp_len` response bytes has fully returned to the host.
pub fn poll_length(chip: ChipAddress, chip_count: Option<usize>, resp_len: usize) -> usize {
    match chip {
        ChipAddress::All => match chip_count {
            Some(num_chips) => resp_len + 4 * num_chips,
            None => resp_len + 4 * UNKNOWN_CHAIN_GUESS,
        },
        ChipAddress::One(chip_id) => resp_len + 4 * chip_id as usize - 2,
    }
}

/// A nonce found by some chip on the chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonceResult {
    /// Wire job id, expected 1..=4
    pub job_id: u8,
    /// 1-based chip position
    pub chip_id: u8,
    /// Nonce in host byte order
    pub nonce: u32,
}

/// Command context of one chain. All commands round-trip through the two
/// scratch buffers; the per-chain lock in the driver serializes access.
pub struct Context<M> {
    chain_id: usize,
    master: Arc<Mutex<M>>,
    /// Number of chips on the chain, `None` until detection has run.
    /// Broadcast poll lengths depend on it.
    chip_count: Option<usize>,
    tx: [u8; a1::MAX_CMD_LENGTH],
    rx: [u8; a1::MAX_CMD_LENGTH],
}

impl<M> Context<M>
where
    M: spi::Master,
{
    pub fn new(chain_id: usize, master: Arc<Mutex<M>>) -> Self {
        Self {
            chain_id,
            master,
            chip_count: None,
            tx: [0; a1::MAX_CMD_LENGTH],
            rx: [0; a1::MAX_CMD_LENGTH],
        }
    }

    pub fn chain_id(&self) -> usize {
        self.chain_id
    }

    pub fn chip_count(&self) -> Option<usize> {
        self.chip_count
    }

    pub fn set_chip_count(&mut self, chip_count: usize) {
        self.chip_count = Some(chip_count);
    }

    pub fn set_speed_khz(&mut self, speed_khz: u32) -> error::Result<()> {
        let mut master = self.master.lock().expect("SPI master lock poisoned");
        master.set_speed_khz(speed_khz)
    }

    pub fn speed_khz(&self) -> u32 {
        let master = self.master.lock().expect("SPI master lock poisoned");
        master.speed_khz()
    }

    /// Clock out `tx_len` command bytes, capturing the echo
    fn transfer_out(&mut self, tx_len: usize) -> error::Result<()> {
        let mut master = self.master.lock().expect("SPI master lock poisoned");
        master.transfer(&self.tx[..tx_len], &mut self.rx[..tx_len])?;
        drop(master);
        debug!(
            "{}: send: TX: {}",
            self.chain_id,
            hex::encode(&self.tx[..tx_len])
        );
        debug!(
            "{}: send: RX: {}",
            self.chain_id,
            hex::encode(&self.rx[..tx_len])
        );
        Ok(())
    }

    /// Keep clocking `poll_len` idle bytes past the command
    fn transfer_poll(&mut self, rx_start: usize, poll_len: usize) -> error::Result<()> {
        let mut master = self.master.lock().expect("SPI master lock poisoned");
        master.transfer(&[], &mut self.rx[rx_start..rx_start + poll_len])?;
        drop(master);
        debug!(
            "{}: poll: RX: {}",
            self.chain_id,
            hex::encode(&self.rx[rx_start..rx_start + poll_len])
        );
        Ok(())
    }

    /// Issue one command and return the acknowledgement region
    fn exec_cmd(
        &mut self,
        cmd: u8,
        chip: ChipAddress,
        data: &[u8],
        resp_len: usize,
    ) -> error::Result<&[u8]> {
        let tx_len = 4 + data.len();
        for byte in self.tx[..tx_len].iter_mut() {
            *byte = 0;
        }
        self.tx[0] = cmd;
        self.tx[1] = chip.to_wire();
        self.tx[2..2 + data.len()].copy_from_slice(data);
        self.transfer_out(tx_len)?;

        let poll_len = poll_length(chip, self.chip_count, resp_len);
        self.transfer_poll(tx_len, poll_len)?;

        let ack_len = tx_len + resp_len;
        let ack_pos = tx_len + poll_len - ack_len;
        Ok(&self.rx[ack_pos..tx_len + poll_len])
    }

    /// Clock a run of zero bytes to drain half-shifted state from the chain
    pub fn flush(&mut self) -> error::Result<()> {
        for byte in self.tx[..FLUSH_LENGTH].iter_mut() {
            *byte = 0;
        }
        let mut master = self.master.lock().expect("SPI master lock poisoned");
        master.transfer(&self.tx[..FLUSH_LENGTH], &mut self.rx[..FLUSH_LENGTH])
    }

    /// Detect the chain length: broadcast RESET and count the idle words
    /// until its echo falls out of the last chip. Each chip adds two words
    /// of delay, so `num_chips = words / 2 + 1`.
    pub fn detect_chips(&mut self) -> error::Result<usize> {
        let tx_len = 6;
        for byte in self.tx[..tx_len].iter_mut() {
            *byte = 0;
        }
        self.tx[0] = a1::RESET;
        self.transfer_out(tx_len)?;

        let max_poll_words = a1::MAX_CHAIN_LENGTH * 2;
        for i in 1..max_poll_words {
            if self.rx[0] == a1::RESET && self.rx[1] == 0 {
                let num_chips = i / 2 + 1;
                self.chip_count = Some(num_chips);
                return Ok(num_chips);
            }
            self.transfer_poll(0, 2)?;
        }
        warn!("{}: no A1 chip-chain detected", self.chain_id);
        Ok(0)
    }

    pub fn bist_start(&mut self) -> error::Result<()> {
        let chain_id = self.chain_id;
        let ack = self.exec_cmd(a1::BIST_START, ChipAddress::All, &[0, 0], 0)?;
        if ack[0] != a1::BIST_START {
            Err(ErrorKind::Spi(format!(
                "chain {}: BIST_START failed",
                chain_id
            )))?
        }
        Ok(())
    }

    pub fn bist_fix(&mut self) -> error::Result<()> {
        let chain_id = self.chain_id;
        let ack = self.exec_cmd(a1::BIST_FIX, ChipAddress::All, &[], 0)?;
        if ack[0] != a1::BIST_FIX {
            Err(ErrorKind::Spi(format!("chain {}: BIST_FIX failed", chain_id)))?
        }
        Ok(())
    }

    /// Reset one chip or the whole chain. Before detection the chain length
    /// is unknown and a silent ACK is tolerated.
    pub fn reset(&mut self, chip: ChipAddress, strategy: u8) -> error::Result<()> {
        let chain_id = self.chain_id;
        let chips_known = self.chip_count.is_some();
        let ack = self.exec_cmd(a1::RESET, chip, &[strategy, strategy], 0)?;
        if ack[0] != a1::RESET && chips_known {
            Err(ErrorKind::Spi(format!(
                "chain {}: RESET {:?} failed",
                chain_id, chip
            )))?
        }
        Ok(())
    }

    pub fn write_reg(&mut self, chip: ChipAddress, reg: &a1::PllReg) -> error::Result<()> {
        let chain_id = self.chain_id;
        let bytes = reg.pack();
        let ack = self.exec_cmd(a1::WRITE_REG, chip, &bytes, 0)?;
        if ack[0] != a1::WRITE_REG {
            Err(ErrorKind::Spi(format!(
                "chain {}: WRITE_REG {:?} failed",
                chain_id, chip
            )))?
        }
        Ok(())
    }

    pub fn read_reg(&mut self, chip_id: u8) -> error::Result<a1::ReadRegResp> {
        let chain_id = self.chain_id;
        let ack = self.exec_cmd(a1::READ_REG, ChipAddress::One(chip_id), &[], 6)?;
        if ack[0] != a1::READ_REG_RESP || ack[1] != chip_id {
            Err(ErrorKind::Spi(format!(
                "chain {}: READ_REG chip {} failed",
                chain_id, chip_id
            )))?
        }
        let resp = a1::ReadRegResp::unpack_from_slice(&ack[2..8]).map_err(|e| {
            ErrorKind::Spi(format!(
                "chain {}: READ_REG chip {}: malformed response: {:?}",
                chain_id, chip_id, e
            ))
        })?;
        Ok(resp)
    }

    /// Push one 58-byte job into the chip's queue. The ACK here is just the
    /// echo of the first two job bytes.
    pub fn write_job(
        &mut self,
        chip_id: u8,
        job: &[u8; a1::WRITE_JOB_LENGTH],
    ) -> error::Result<()> {
        // two extra idle bytes push the frame into the last chip in chain
        let tx_len = a1::WRITE_JOB_LENGTH + 2;
        self.tx[..a1::WRITE_JOB_LENGTH].copy_from_slice(job);
        self.tx[a1::WRITE_JOB_LENGTH..tx_len]
            .iter_mut()
            .for_each(|byte| *byte = 0);
        self.transfer_out(tx_len)?;

        let poll_len = 4 * chip_id as usize - 2;
        self.transfer_poll(tx_len, poll_len)?;

        let ack_pos = poll_len;
        if self.rx[ack_pos] != self.tx[0] || self.rx[ack_pos + 1] != self.tx[1] {
            Err(ErrorKind::Spi(format!(
                "chain {}: WRITE_JOB chip {} failed: {:#04x}{:02x}/{:#04x}{:02x}",
                self.chain_id,
                chip_id,
                self.rx[ack_pos],
                self.rx[ack_pos + 1],
                self.tx[0],
                self.tx[1]
            )))?
        }
        Ok(())
    }

    /// Poll the output queues of the whole chain. `Ok(None)` means no chip
    /// has a pending result.
    pub fn read_result(&mut self) -> error::Result<Option<NonceResult>> {
        let tx_len = 8;
        for byte in self.tx[..tx_len].iter_mut() {
            *byte = 0;
        }
        self.tx[0] = a1::READ_RESULT;
        self.transfer_out(tx_len)?;

        let num_chips = self.chip_count.unwrap_or(UNKNOWN_CHAIN_GUESS);
        let poll_len = tx_len + 4 * num_chips;
        self.transfer_poll(tx_len, poll_len)?;

        // the result frame can surface on any word boundary; scan for the
        // opcode marker in the low nibble
        let mut i = 0;
        while i < poll_len {
            if self.rx[i] & 0x0f == a1::READ_RESULT {
                let job_id = self.rx[i] >> 4;
                let chip_id = self.rx[i + 1];
                if chip_id == 0 {
                    debug!("{}: output queue empty", self.chain_id);
                    return Ok(None);
                }
                let nonce = BigEndian::read_u32(&self.rx[i + 2..i + 6]);
                return Ok(Some(NonceResult {
                    job_id,
                    chip_id,
                    nonce,
                }));
            }
            i += 2;
        }
        warn!("{}: READ_RESULT: no response marker found", self.chain_id);
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spi::test_utils::MockMaster;

    fn test_context(chip_count: Option<usize>) -> (Context<MockMaster>, Arc<Mutex<MockMaster>>) {
        let master = Arc::new(Mutex::new(MockMaster::new()));
        let mut ctx = Context::new(0, master.clone());
        if let Some(n) = chip_count {
            ctx.set_chip_count(n);
        }
        (ctx, master)
    }

    /// Build the receive pattern of the poll transfer so that the ACK of
    /// `resp` payload bytes lands where the framer expects it.
    fn ack_reply(
        cmd: u8,
        chip: u8,
        payload: &[u8],
        tx_len: usize,
        poll_len: usize,
        resp_len: usize,
    ) -> Vec<u8> {
        let mut reply = vec![0u8; poll_len];
        let off = poll_len - resp_len - tx_len;
        reply[off] = cmd;
        reply[off + 1] = chip;
        reply[off + 2..off + 2 + payload.len()].copy_from_slice(payload);
        reply
    }

    #[test]
    fn test_poll_length() {
        // targeted: resp_len + 4 * chip_id - 2
        assert_eq!(poll_length(ChipAddress::One(1), Some(4), 0), 2);
        assert_eq!(poll_length(ChipAddress::One(3), Some(4), 6), 16);
        // broadcast: resp_len + 4 * num_chips
        assert_eq!(poll_length(ChipAddress::All, Some(4), 0), 16);
        assert_eq!(poll_length(ChipAddress::All, Some(8), 6), 38);
        // unknown chain assumes 8 chips
        assert_eq!(poll_length(ChipAddress::All, None, 0), 32);
    }

    #[test]
    fn test_bist_start_ack() {
        let (mut ctx, master) = test_context(Some(4));
        {
            let mut master = master.lock().unwrap();
            master.push_silence(1);
            master.push_reply(ack_reply(a1::BIST_START, 0, &[], 6, 16, 0));
        }
        ctx.bist_start().expect("BIST_START should succeed");
        let sent = &master.lock().unwrap().sent;
        assert_eq!(sent[0], vec![a1::BIST_START, 0, 0, 0, 0, 0]);

        // a silent chain fails the command
        let (mut ctx, _master) = test_context(Some(4));
        assert!(ctx.bist_start().is_err());
    }

    #[test]
    fn test_read_reg() {
        let (mut ctx, master) = test_context(Some(4));
        {
            let mut master = master.lock().unwrap();
            master.push_silence(1);
            // chip 2: tx_len 4, resp 6, poll 6 + 4*2 - 2 = 12
            master.push_reply(ack_reply(
                a1::READ_REG_RESP,
                2,
                &[0x42, 0x32, 0x01, 0x00, 0x00, 0x20],
                4,
                12,
                6,
            ));
        }
        let resp = ctx.read_reg(2).expect("READ_REG should succeed");
        assert_eq!(resp.num_cores, 32);
        assert!(resp.pll_locked);
        assert_eq!(resp.pll_param, 0x4232);

        // response for the wrong chip is an error
        let (mut ctx, master) = test_context(Some(4));
        {
            let mut master = master.lock().unwrap();
            master.push_silence(1);
            master.push_reply(ack_reply(a1::READ_REG_RESP, 3, &[0; 6], 4, 12, 6));
        }
        assert!(ctx.read_reg(2).is_err());
    }

    #[test]
    fn test_reset_tolerates_silence_before_detect() {
        let (mut ctx, _master) = test_context(None);
        ctx.reset(ChipAddress::All, a1::RESET_ABORT_JOBS)
            .expect("pre-detect RESET must tolerate a silent chain");

        let (mut ctx, _master) = test_context(Some(4));
        assert!(ctx.reset(ChipAddress::All, a1::RESET_ABORT_JOBS).is_err());
    }

    #[test]
    fn test_detect_chips() {
        let (mut ctx, master) = test_context(None);
        {
            let mut master = master.lock().unwrap();
            // initial 6-byte transfer plus five silent words, echo in the 6th
            master.push_silence(6);
            master.push_reply(vec![a1::RESET, 0x00]);
        }
        assert_eq!(ctx.detect_chips().expect("detect failed"), 4);
        assert_eq!(ctx.chip_count(), Some(4));

        // a dead bus scans out with no chain found
        let (mut ctx, _master) = test_context(None);
        assert_eq!(ctx.detect_chips().expect("detect failed"), 0);
    }

    #[test]
    fn test_write_job_ack() {
        let (mut ctx, master) = test_context(Some(4));
        let mut job = [0u8; a1::WRITE_JOB_LENGTH];
        job[0] = (1 << 4) | a1::WRITE_JOB;
        job[1] = 1;
        {
            let mut master = master.lock().unwrap();
            // chip 1: ack echo lands two bytes into the command echo region
            let mut echo = vec![0u8; 60];
            echo[2] = job[0];
            echo[3] = job[1];
            master.push_reply(echo);
            master.push_silence(1);
        }
        ctx.write_job(1, &job).expect("WRITE_JOB should succeed");

        let (mut ctx, _master) = test_context(Some(4));
        assert!(ctx.write_job(1, &job).is_err());
    }

    #[test]
    fn test_read_result() {
        // empty queue: the command echo itself is the empty marker
        let (mut ctx, master) = test_context(Some(4));
        master
            .lock()
            .unwrap()
            .push_reply(vec![a1::READ_RESULT, 0x00]);
        assert_eq!(ctx.read_result().expect("read_result failed"), None);

        // a real nonce from chip 2, job 3
        let (mut ctx, master) = test_context(Some(4));
        {
            let mut master = master.lock().unwrap();
            master.push_silence(1);
            let mut reply = vec![0u8; 24];
            reply[4] = (3 << 4) | a1::READ_RESULT;
            reply[5] = 2;
            reply[6..10].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
            master.push_reply(reply);
        }
        let result = ctx.read_result().expect("read_result failed");
        assert_eq!(
            result,
            Some(NonceResult {
                job_id: 3,
                chip_id: 2,
                nonce: 0xdeadbeef,
            })
        );
    }
}
