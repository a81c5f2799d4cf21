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

//! Chain driver core for Bitmine A1 (CoinCraft) SPI mining boards.
//!
//! Every board carries a daisy-chain of A1 chips on one SPI bus; several
//! boards multiplex onto the host SPI masters through an I2C-driven board
//! selector. The driver enumerates the chains, brings every chip's PLL to
//! the target clock, keeps the four-deep per-chip job queues fed while
//! draining nonces, and tunes each chip's clock against its observed error
//! rate. The hosting framework drives one thread per chain through
//! [`Chain::scanwork`], [`Chain::queue_full`] and [`Chain::flush_work`].

pub mod a1;
pub mod command;
pub mod config;
pub mod error;
pub mod hal;
pub mod i2c;
pub mod logging;
pub mod power;
pub mod selector;
pub mod spi;
pub mod stats;
pub mod tuner;
pub mod utils;


use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::a1::ChipAddress;
use crate::error::ErrorKind;
use crate::logging::macros::*;

/// If not cooled sufficiently, communication fails and the chip is
/// temporarily disabled. We leave it inactive for 30 seconds to cool down.
const COOLDOWN_MS: u64 = 30 * 1000;
/// If after this number of retries a chip is still inaccessible, disable it
const DISABLE_CHIP_FAIL_THRESHOLD: u32 = 3;

/// SPI clock used while a chain is being brought up
const BRINGUP_SPI_CLK_KHZ: u32 = 100;
/// Conservative chip clock for running the BIST
const BIST_SYS_CLK_KHZ: u32 = 200_000;

const MAX_PLL_WAIT_CYCLES: usize = 25;
const PLL_CYCLE_WAIT_TIME_MS: u64 = 40;

const TEMP_UPDATE_INT_MS: u64 = 2000;
const TEMP_THROTTLE_SLEEP_MS: u64 = 5000;
const IDLE_SLEEP_MS: u64 = 120;

/// Work items queued per active chip
const WORK_QUEUE_FACTOR: usize = 2;

/// Host paths of the two SPI masters and the backplane I2C bus
const SPI0_PATH: &str = "/dev/spidev0.0";
const SPI1_PATH: &str = "/dev/spidev0.1";
const I2C_BUS_PATH: &str = "/dev/i2c-0";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChipState {
    Active,
    /// Cooling off after an access failure
    Cooling { since_ms: u64 },
    /// Terminal for the session
    Disabled,
}

/// One A1 die on the chain
pub struct Chip {
    /// 1-based position, 1 = closest to the host
    pub chip_id: u8,
    /// Hash cores that passed BIST
    pub num_cores: u8,
    pub state: ChipState,
    /// Software mirror of the chip's four-deep hardware job FIFO
    work: [Option<Arc<hal::Work>>; 4],
    /// Next slot to fill, wire job id is `last_queued_id + 1`
    last_queued_id: usize,
    /// Consecutive access failures while cooling
    fail_count: u32,
    pub hw_errors: u64,
    pub stales: u64,
    pub nonces_found: u64,
    pub nonce_ranges_done: u64,
    tuner: tuner::Autotune,
}

impl Chip {
    fn new(chip_id: u8, sys_clk_khz: u32) -> Self {
        Self {
            chip_id,
            num_cores: 0,
            state: ChipState::Active,
            work: [None, None, None, None],
            last_queued_id: 0,
            fail_count: 0,
            hw_errors: 0,
            stales: 0,
            nonces_found: 0,
            nonce_ranges_done: 0,
            tuner: tuner::Autotune::new(sys_clk_khz),
        }
    }

    fn is_disabled(&self) -> bool {
        self.state != ChipState::Active
    }
}

/// Mutable half of a chain, guarded by the per-chain lock
struct ChainState<M> {
    ctx: command::Context<M>,
    chips: Vec<Chip>,
    num_chips: usize,
    num_active_chips: usize,
    num_cores: u32,
    work_queue: VecDeque<Arc<hal::Work>>,
    sys_clk_khz: u32,
    temp: u8,
    last_temp_ms: u64,
    cutoff_temp: u8,
    /// Completed nonce ranges minus difficulty penalties of invalid nonces
    nonce_ranges_processed: i64,
    limits: tuner::Limits,
    options: Arc<config::Options>,
    stats: Arc<Mutex<stats::Sink>>,
}

/// One chain of A1 chips, bound to an SPI master at detection
pub struct Chain<M> {
    chain_id: usize,
    selector: Arc<Mutex<Box<dyn selector::BoardSelector>>>,
    state: Mutex<ChainState<M>>,
}

impl<M> ChainState<M>
where
    M: spi::Master,
{
    fn new(
        chain_id: usize,
        master: Arc<Mutex<M>>,
        options: Arc<config::Options>,
        stats: Arc<Mutex<stats::Sink>>,
    ) -> Self {
        let limits = tuner::Limits {
            enable: options.enable_auto_tune,
            lower_ratio_pm: options.lower_ratio_pm,
            upper_ratio_pm: options.upper_ratio_pm,
            lower_clk_khz: options.lower_clk_khz,
            upper_clk_khz: options.upper_clk_khz,
        };
        Self {
            ctx: command::Context::new(chain_id, master),
            chips: Vec::new(),
            num_chips: 0,
            num_active_chips: 0,
            num_cores: 0,
            work_queue: VecDeque::new(),
            sys_clk_khz: options.sys_clk_khz,
            temp: 0,
            last_temp_ms: 0,
            cutoff_temp: 0,
            nonce_ranges_processed: 0,
            limits,
            options,
            stats,
        }
    }

    fn set_spi_clk(&mut self) -> error::Result<()> {
        let chain_id = self.ctx.chain_id();
        self.ctx
            .set_speed_khz(self.options.board_spi_clk_khz(chain_id))
    }

    /// Detect the chain and run the complete BIST bring-up. Returns false
    /// when no chips respond.
    fn bring_up(&mut self, now_ms: u64) -> error::Result<bool> {
        let cid = self.ctx.chain_id();

        let num_chips = self.ctx.detect_chips()?;
        if num_chips == 0 {
            return Ok(false);
        }
        self.num_chips = num_chips;
        info!("{}: detected {} chips", cid, num_chips);

        // the rest of the bring-up runs on a conservative SPI clock and a
        // safe chip clock until the PLLs have settled
        self.ctx.set_speed_khz(BRINGUP_SPI_CLK_KHZ)?;
        let bist_pll = a1::PllReg::from_freq(self.options.ref_clk_khz, BIST_SYS_CLK_KHZ);
        self.ctx.write_reg(ChipAddress::All, &bist_pll)?;
        self.ctx.bist_start()?;

        // clamp the chain if requested before PLL locks are verified
        self.num_active_chips = num_chips;
        if self.options.override_chip_num > 0 && num_chips > self.options.override_chip_num {
            self.num_active_chips = self.options.override_chip_num;
            warn!("{}: limiting chain to {} chips", cid, self.num_active_chips);
        }

        let sys_clk_khz = self.options.board_sys_clk_khz(cid);
        self.sys_clk_khz = sys_clk_khz;
        self.chips = (1..=self.num_active_chips)
            .map(|chip_id| Chip::new(chip_id as u8, sys_clk_khz))
            .collect();
        self.set_pll_config(ChipAddress::All, sys_clk_khz)?;

        self.set_spi_clk()?;
        info!("{}: spi_clk = {} kHz", cid, self.ctx.speed_khz());

        self.ctx.bist_fix()?;

        for i in 0..self.num_active_chips {
            self.check_chip(i, now_ms);
        }
        info!(
            "{}: found {} chips with total {} active cores",
            cid, self.num_active_chips, self.num_cores
        );
        Ok(true)
    }

    /// Write a PLL for `sys_clk_khz` and verify lock on every addressed chip
    fn set_pll_config(&mut self, chip: ChipAddress, sys_clk_khz: u32) -> error::Result<()> {
        let cid = self.ctx.chain_id();
        let pll = a1::PllReg::from_freq(self.options.ref_clk_khz, sys_clk_khz);
        let (pre_div, post_div, fb_div) = pll.divider();
        info!(
            "{}: setting PLL for {:?}: CLK_REF={}MHz SYS_CLK={}MHz (pre_div={} post_div={} fb_div={})",
            cid,
            chip,
            self.options.ref_clk_khz / 1000,
            sys_clk_khz / 1000,
            pre_div,
            post_div,
            fb_div
        );
        self.ctx.write_reg(chip, &pll)?;

        let chip_ids = match chip {
            ChipAddress::All => 1..=self.num_active_chips as u8,
            ChipAddress::One(chip_id) => chip_id..=chip_id,
        };
        for chip_id in chip_ids {
            if !self.check_pll_lock(chip_id, &pll) {
                error!("{:2}/{:2}: failed PLL lock", cid, chip_id);
                Err(ErrorKind::Pll(format!(
                    "chain {}: chip {}: no lock at {} kHz",
                    cid, chip_id, sys_clk_khz
                )))?
            }
        }
        Ok(())
    }

    fn check_pll_lock(&mut self, chip_id: u8, pll: &a1::PllReg) -> bool {
        for _ in 0..MAX_PLL_WAIT_CYCLES {
            if let Ok(resp) = self.ctx.read_reg(chip_id) {
                if resp.pll_locked {
                    // double check that we read back what we set before
                    return resp.pll_param == pll.param_word();
                }
            }
            thread::sleep(Duration::from_millis(PLL_CYCLE_WAIT_TIME_MS));
        }
        false
    }

    /// Read the BIST result of one chip and classify it
    fn check_chip(&mut self, i: usize, now_ms: u64) {
        let cid = self.ctx.chain_id();
        let chip_id = (i + 1) as u8;

        if self.options.chip_masked(cid, i) {
            warn!("{}: bypassing chip {}", cid, i);
            self.chips[i].num_cores = 0;
            self.chips[i].state = ChipState::Disabled;
            return;
        }

        let resp = match self.ctx.read_reg(chip_id) {
            Ok(resp) => resp,
            Err(_) => {
                warn!(
                    "{}: failed to read register for chip {} -> disabling",
                    cid, chip_id
                );
                self.chips[i].num_cores = 0;
                self.chips[i].state = ChipState::Disabled;
                return;
            }
        };
        let num_cores = resp.num_cores;
        self.chips[i].num_cores = num_cores;
        self.num_cores += num_cores as u32;
        info!(
            "{}: found chip {} with {} active cores",
            cid, chip_id, num_cores
        );

        if num_cores < a1::BROKEN_CHIP_THRESHOLD {
            warn!(
                "{}: broken chip {} with {} active cores (threshold = {})",
                cid,
                chip_id,
                num_cores,
                a1::BROKEN_CHIP_THRESHOLD
            );
            if let Err(e) =
                self.set_pll_config(ChipAddress::One(chip_id), a1::BROKEN_CHIP_SYS_CLK_KHZ)
            {
                warn!("{:2}/{:2}: {}", cid, chip_id, e);
            }
            self.chips[i].state = ChipState::Disabled;
            self.num_cores -= num_cores as u32;
            return;
        }

        if num_cores < a1::WEAK_CHIP_THRESHOLD {
            warn!(
                "{}: weak chip {} with {} active cores (threshold = {})",
                cid,
                chip_id,
                num_cores,
                a1::WEAK_CHIP_THRESHOLD
            );
            match self.set_pll_config(ChipAddress::One(chip_id), a1::WEAK_CHIP_SYS_CLK_KHZ) {
                Ok(()) => self.chips[i].tuner.commit_clk(a1::WEAK_CHIP_SYS_CLK_KHZ),
                Err(e) => {
                    // no lock on the reduced clock either, give up on it
                    warn!("{:2}/{:2}: {}", cid, chip_id, e);
                    self.chips[i].state = ChipState::Disabled;
                    self.num_cores -= num_cores as u32;
                    return;
                }
            }
        }

        // both window snapshots start out at the chip's operating point
        let chip = &mut self.chips[i];
        chip.tuner.reset_window(num_cores as u32, now_ms);
        chip.tuner.reset_window(num_cores as u32, now_ms);
    }

    /// Move a misbehaving chip into cooldown
    fn disable_chip(&mut self, chip_id: u8, now_ms: u64) {
        let _ = self.ctx.flush();
        let cid = self.ctx.chain_id();
        let chip = &mut self.chips[chip_id as usize - 1];
        if chip.is_disabled() {
            warn!("{:2}/{:2}: already disabled", cid, chip_id);
            return;
        }
        warn!("{:2}/{:2}: temporary disabling chip", cid, chip_id);
        chip.state = ChipState::Cooling { since_ms: now_ms };
    }

    /// Try to bring chips back that finished their cooldown
    fn check_disabled_chips(&mut self, now_ms: u64) {
        let cid = self.ctx.chain_id();
        for i in 0..self.num_active_chips {
            let chip_id = (i + 1) as u8;
            let since_ms = match self.chips[i].state {
                ChipState::Active | ChipState::Disabled => continue,
                ChipState::Cooling { since_ms } => since_ms,
            };
            if since_ms + COOLDOWN_MS > now_ms {
                continue;
            }
            if self.ctx.read_reg(chip_id).is_err() {
                let num_cores = self.chips[i].num_cores as u32;
                let chip = &mut self.chips[i];
                chip.fail_count += 1;
                warn!("{:2}/{:2}: not yet working - {}", cid, chip_id, chip.fail_count);
                if chip.fail_count > DISABLE_CHIP_FAIL_THRESHOLD {
                    warn!(
                        "{:2}/{:2}: completely disabling chip at {}",
                        cid, chip_id, chip.fail_count
                    );
                    chip.state = ChipState::Disabled;
                    self.num_cores -= num_cores;
                    continue;
                }
                // restart the cooldown period
                chip.state = ChipState::Cooling { since_ms: now_ms };
                continue;
            }
            info!("{:2}/{:2}: chip is working again", cid, chip_id);
            let chip = &mut self.chips[i];
            chip.state = ChipState::Active;
            chip.fail_count = 0;
        }
    }

    /// Complete all loaded work of one chip back to the framework
    fn flush_chip(&mut self, i: usize, fw: &mut dyn hal::Framework) {
        for slot in self.chips[i].work.iter_mut() {
            if let Some(work) = slot.take() {
                fw.work_completed(work);
            }
        }
        self.chips[i].last_queued_id = 0;
    }

    /// Abort the chip's current jobs and move it to a new system clock
    fn restart_chip(
        &mut self,
        i: usize,
        new_clk_khz: u32,
        fw: &mut dyn hal::Framework,
    ) -> error::Result<()> {
        let chip_id = self.chips[i].chip_id;
        self.ctx
            .reset(ChipAddress::One(chip_id), a1::RESET_ABORT_JOBS)?;
        self.flush_chip(i, fw);
        self.set_pll_config(ChipAddress::One(chip_id), new_clk_khz)
    }

    /// Execute a tuner decision. Returns true when a clock change went
    /// through (which implies the chip's slots were flushed).
    fn apply_tuner_outcome(
        &mut self,
        i: usize,
        outcome: tuner::Outcome,
        bad: bool,
        fw: &mut dyn hal::Framework,
        now_ms: u64,
    ) -> bool {
        let cid = self.ctx.chain_id();
        let chip_id = self.chips[i].chip_id;
        if let Some(sample) = outcome.sample.as_ref() {
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            stats.log_sample(cid, chip_id, sample, bad);
        }
        match outcome.action {
            tuner::Action::None => false,
            tuner::Action::LimitReached => {
                let sys_clk_khz = self.chips[i].tuner.current.sys_clk_khz;
                let mut stats = self.stats.lock().expect("stats lock poisoned");
                stats.log_limit(cid, chip_id, sys_clk_khz);
                false
            }
            tuner::Action::Change { new_clk_khz } => {
                if let Err(e) = self.restart_chip(i, new_clk_khz, fw) {
                    warn!("{:2}/{:2}: chip restart failed: {}", cid, chip_id, e);
                    self.disable_chip(chip_id, now_ms);
                    return false;
                }
                self.chips[i].tuner.commit_clk(new_clk_khz);
                if let Some(sample) = outcome.sample.as_ref() {
                    let mut stats = self.stats.lock().expect("stats lock poisoned");
                    stats.log_change(cid, chip_id, &self.chips[i].tuner, sample.ratio_pm);
                }
                true
            }
        }
    }

    fn add_nonce_bad(&mut self, i: usize, fw: &mut dyn hal::Framework, now_ms: u64) {
        self.chips[i].hw_errors += 1;
        let num_cores = self.chips[i].num_cores as u32;
        let limits = self.limits;
        let outcome = self.chips[i].tuner.bad_nonce(num_cores, &limits, now_ms);
        self.apply_tuner_outcome(i, outcome, true, fw, now_ms);
    }

    fn add_nonce_good(&mut self, i: usize, fw: &mut dyn hal::Framework, now_ms: u64) {
        self.chips[i].nonces_found += 1;
        let num_cores = self.chips[i].num_cores as u32;
        let limits = self.limits;
        let outcome = self.chips[i].tuner.good_nonce(num_cores, &limits, now_ms);
        self.apply_tuner_outcome(i, outcome, false, fw, now_ms);
    }

    /// Window-end up-tune check used by flush_work
    fn maybe_uptune(&mut self, i: usize, fw: &mut dyn hal::Framework, now_ms: u64) -> bool {
        if self.chips[i].is_disabled() {
            return false;
        }
        let num_cores = self.chips[i].num_cores as u32;
        let limits = self.limits;
        let outcome = self.chips[i].tuner.uptune(num_cores, &limits, now_ms);
        self.apply_tuner_outcome(i, outcome, false, fw, now_ms)
    }

    /// Load one work item into the chip's next queue slot. Returns
    /// (nonce range completed, work loaded).
    fn set_work(
        &mut self,
        chip_id: u8,
        work: Arc<hal::Work>,
        queue_jobs: u8,
        fw: &mut dyn hal::Framework,
        now_ms: u64,
    ) -> (bool, bool) {
        let cid = self.ctx.chain_id();
        let i = chip_id as usize - 1;
        let job_id = (self.chips[i].last_queued_id + 1) as u8;

        debug!(
            "{:2}/{:2}: queuing job_id {}, buffered=0x{:02x}",
            cid, chip_id, job_id, queue_jobs
        );
        if job_id == queue_jobs & 0x0f || job_id == queue_jobs >> 4 {
            warn!(
                "{:2}/{:2}: job overlap: {}, 0x{:02x}",
                cid, chip_id, job_id, queue_jobs
            );
        }

        let mut range_done = false;
        let slot = self.chips[i].last_queued_id;
        if let Some(old_work) = self.chips[i].work[slot].take() {
            fw.work_completed(old_work);
            range_done = true;
        }

        let target = self.options.job_target(work.device_diff);
        let job = a1::make_job(chip_id, job_id, &work, target);
        if let Err(e) = self.ctx.write_job(chip_id, &job) {
            // give back the work
            fw.work_completed(work);
            error!("{:2}/{:2}: failed to set work {}: {}", cid, chip_id, job_id, e);
            self.disable_chip(chip_id, now_ms);
            (range_done, false)
        } else {
            let chip = &mut self.chips[i];
            chip.work[slot] = Some(work);
            chip.last_queued_id = (chip.last_queued_id + 1) & 3;
            (range_done, true)
        }
    }

    /// Refill the chip's hardware FIFO according to its queue state
    fn advance_chip(&mut self, chip_id: u8, fw: &mut dyn hal::Framework) {
        let cid = self.ctx.chain_id();
        let i = chip_id as usize - 1;
        if self.chips[i].is_disabled() {
            return;
        }
        let now_ms = utils::now_ms();
        let resp = match self.ctx.read_reg(chip_id) {
            Ok(resp) => resp,
            Err(_) => {
                self.disable_chip(chip_id, now_ms);
                return;
            }
        };
        let loads = match resp.queue_state {
            a1::QueueState::Full => return,
            a1::QueueState::Invalid => {
                error!("{}: chip {}: invalid queue state", cid, chip_id);
                return;
            }
            a1::QueueState::Empty => 2,
            a1::QueueState::OneFree => 1,
        };
        for _ in 0..loads {
            let work = match self.work_queue.pop_front() {
                Some(work) => work,
                None => {
                    debug!("{}: chip {}: work underflow", cid, chip_id);
                    break;
                }
            };
            let (range_done, loaded) = self.set_work(chip_id, work, resp.queue_jobs, fw, now_ms);
            if range_done {
                self.chips[i].nonce_ranges_done += 1;
                self.nonce_ranges_processed += 1;
            }
            if !loaded {
                break;
            }
        }
        let chip = &self.chips[i];
        debug!(
            "{}: chip {}: {} ranges / {} nonces / {} hw errors / {} stale",
            cid, chip_id, chip.nonce_ranges_done, chip.nonces_found, chip.hw_errors, chip.stales
        );
    }

    /// Drain the chain's result queue. Returns false when the framework
    /// requested an abort.
    fn drain_nonces(&mut self, fw: &mut dyn hal::Framework) -> bool {
        let cid = self.ctx.chain_id();
        loop {
            if fw.work_restart() {
                return false;
            }
            let result = match self.ctx.read_result() {
                Ok(Some(result)) => result,
                Ok(None) => break,
                Err(e) => {
                    warn!("{}: result poll failed: {}", cid, e);
                    break;
                }
            };
            let command::NonceResult {
                job_id,
                chip_id,
                nonce,
            } = result;
            let now_ms = utils::now_ms();

            if chip_id < 1 || chip_id as usize > self.num_active_chips {
                warn!("{}: wrong chip_id {}", cid, chip_id);
                continue;
            }
            if job_id < 1 || job_id > 4 {
                warn!("{:2}/{:2}: wrong result job_id {}", cid, chip_id, job_id);
                let _ = self.ctx.flush();
                continue;
            }

            let i = chip_id as usize - 1;
            let work = match self.chips[i].work[job_id as usize - 1].clone() {
                Some(work) => work,
                None => {
                    // already been flushed => stale
                    warn!("{:2}/{:2}: stale nonce 0x{:08x}", cid, chip_id, nonce);
                    self.chips[i].stales += 1;
                    continue;
                }
            };
            if !fw.submit_nonce(&work, nonce) {
                let penalty = work.device_diff as i64;
                self.nonce_ranges_processed -= penalty;
                warn!(
                    "{:2}/{:2}: invalid nonce 0x{:08x}, penalty={} ({})",
                    cid, chip_id, nonce, penalty, self.nonce_ranges_processed
                );
                self.add_nonce_bad(i, fw, now_ms);
                continue;
            }
            debug!(
                "{}: chip {} / job_id {}: nonce 0x{:08x}",
                cid, chip_id, job_id, nonce
            );
            self.add_nonce_good(i, fw, now_ms);
        }
        true
    }
}

impl<M> Chain<M>
where
    M: spi::Master,
{
    /// Probe and bring up one chain. The caller must hold the board
    /// selector with this chain selected. `Ok(None)` means the chain is
    /// masked out or carries no chips.
    pub fn init(
        chain_id: usize,
        master: Arc<Mutex<M>>,
        selector: Arc<Mutex<Box<dyn selector::BoardSelector>>>,
        options: Arc<config::Options>,
        stats: Arc<Mutex<stats::Sink>>,
    ) -> error::Result<Option<Chain<M>>> {
        if options.board_masked(chain_id) {
            warn!("chain {}: masked -> bypassing", chain_id);
            return Ok(None);
        }
        debug!("{}: A1 init chain", chain_id);
        let mut state = ChainState::new(chain_id, master, options, stats);
        if !state.bring_up(utils::now_ms())? {
            return Ok(None);
        }
        Ok(Some(Chain {
            chain_id,
            selector,
            state: Mutex::new(state),
        }))
    }

    pub fn chain_id(&self) -> usize {
        self.chain_id
    }

    pub fn num_chips(&self) -> usize {
        self.state.lock().expect("chain lock poisoned").num_chips
    }

    pub fn num_cores(&self) -> u32 {
        self.state.lock().expect("chain lock poisoned").num_cores
    }

    /// Temperature above which scanwork throttles, 0 disables the check
    pub fn set_cutoff_temp(&self, cutoff_temp: u8) {
        self.state.lock().expect("chain lock poisoned").cutoff_temp = cutoff_temp;
    }

    /// One scan pass: drain nonces, feed chip queues, handle cooldowns.
    /// Returns the completed nonce ranges scaled to hashes (ranges << 32).
    pub fn scanwork(&self, fw: &mut dyn hal::Framework) -> i64 {
        if fw.work_restart() {
            return 0;
        }
        let mut sleep_ms = IDLE_SLEEP_MS;

        let mut sel = self.selector.lock().expect("board selector lock poisoned");
        if let Err(e) = sel.select(self.chain_id) {
            warn!("{}: board select failed: {}", self.chain_id, e);
            return 0;
        }
        let mut state = self.state.lock().expect("chain lock poisoned");

        if state.num_cores == 0 {
            debug!("{}: all chips disabled, nothing to scan", self.chain_id);
            sel.release();
            return 0;
        }
        let _ = state.set_spi_clk();

        debug!("{}: running scanwork", self.chain_id);
        let now_ms = utils::now_ms();
        if state.last_temp_ms + TEMP_UPDATE_INT_MS < now_ms {
            state.temp = sel.get_temp(0);
            state.last_temp_ms = now_ms;
        }

        let mut aborted = !state.drain_nonces(fw);

        if !aborted {
            if state.cutoff_temp > 0 && state.temp > state.cutoff_temp {
                warn!(
                    "{}: throttling at {} ({})",
                    self.chain_id, state.temp, state.cutoff_temp
                );
                sleep_ms = TEMP_THROTTLE_SLEEP_MS;
            } else {
                // check for completed work, last chip first
                for chip_id in (1..=state.num_active_chips as u8).rev() {
                    if fw.work_restart() {
                        aborted = true;
                        break;
                    }
                    state.advance_chip(chip_id, fw);
                }
                if !aborted {
                    state.check_disabled_chips(utils::now_ms());
                }
            }
        }

        let hashes_done = if aborted {
            0
        } else if state.nonce_ranges_processed < 0 {
            debug!(
                "{}: negative nonce ranges {}",
                self.chain_id, state.nonce_ranges_processed
            );
            0
        } else {
            let ranges = state.nonce_ranges_processed;
            state.nonce_ranges_processed = 0;
            ranges << 32
        };

        drop(state);
        sel.release();
        drop(sel);

        if !aborted {
            thread::sleep(Duration::from_millis(sleep_ms));
        }
        hashes_done
    }

    /// Backpressure for the framework's work generator: pull one item per
    /// call until two items per active chip are queued
    pub fn queue_full(&self, fw: &mut dyn hal::Framework) -> bool {
        let mut state = self.state.lock().expect("chain lock poisoned");
        debug!(
            "{}: queue_full: {}/{}",
            self.chain_id,
            state.work_queue.len(),
            state.num_active_chips
        );
        if state.work_queue.len() >= WORK_QUEUE_FACTOR * state.num_active_chips {
            return true;
        }
        if let Some(work) = fw.get_work() {
            state.work_queue.push_back(work);
        }
        false
    }

    /// Abort everything in flight: stop the chips hashing, hand all loaded
    /// and queued work back to the framework
    pub fn flush_work(&self, fw: &mut dyn hal::Framework) {
        let cid = self.chain_id;
        let mut sel = self.selector.lock().expect("board selector lock poisoned");
        if let Err(e) = sel.select(cid) {
            warn!("{}: board select failed: {}", cid, e);
            return;
        }
        let mut state = self.state.lock().expect("chain lock poisoned");
        let _ = state.set_spi_clk();
        debug!("{}: running flushwork", cid);

        // stop chips hashing current work
        if let Err(e) = state.ctx.reset(ChipAddress::All, a1::RESET_ABORT_JOBS) {
            error!("{}: failed to abort work in chip chain: {}", cid, e);
        }
        let now_ms = utils::now_ms();
        for i in 0..state.num_active_chips {
            // an up-tuned chip was just reset and flushed along the way
            if state.maybe_uptune(i, fw, now_ms) {
                continue;
            }
            state.flush_chip(i, fw);
        }
        debug!("{}: flushing queued work...", cid);
        while let Some(work) = state.work_queue.pop_front() {
            fw.work_completed(work);
        }

        drop(state);
        sel.release();
    }

    /// Status line for the framework's device display
    pub fn get_statline_before(&self) -> String {
        let state = self.state.lock().expect("chain lock poisoned");
        let temp = if state.temp != 0 {
            format!("{:2}C", state.temp)
        } else {
            "   ".to_string()
        };
        format!(
            " {:2}:{:2}/{:3} {}",
            self.chain_id, state.num_active_chips, state.num_cores, temp
        )
    }
}

/// How the trimpot is wired on a backplane
enum WiperStyle {
    /// No trimpot access
    None,
    /// One trimpot per board (CoinCraft Desk)
    PerBoard,
    /// One dual-channel trimpot per chain pair (CoinCraft Rig)
    SharedPair,
}

/// The process-wide driver: board selector, SPI masters, configuration and
/// every detected chain
pub struct Driver {
    options: Arc<config::Options>,
    selector: Arc<Mutex<Box<dyn selector::BoardSelector>>>,
    stats: Arc<Mutex<stats::Sink>>,
    chains: Vec<Arc<Chain<spi::SystemMaster>>>,
}

impl Driver {
    /// Probe all supported backplanes in preference order and register
    /// every responding chain. A driver without chains means nothing was
    /// detected.
    pub fn detect(options: config::Options, hotplug: bool) -> error::Result<Driver> {
        options.validate()?;
        let options = Arc::new(options);
        let stats = Arc::new(Mutex::new(stats::Sink::open(
            options.stats_path.as_ref().map(|path| path.as_str()),
        )));
        let empty = |options: Arc<config::Options>, stats| Driver {
            options,
            selector: Arc::new(Mutex::new(
                Box::new(selector::NoopSelector) as Box<dyn selector::BoardSelector>
            )),
            stats,
            chains: Vec::new(),
        };

        // no hotplug support for SPI
        if hotplug {
            return Ok(empty(options, stats));
        }

        let spi0 = match spi::SystemMaster::open(SPI0_PATH, options.spi_clk_khz) {
            Ok(master) => Arc::new(Mutex::new(master)),
            Err(e) => {
                warn!("A1: cannot open {}: {}", SPI0_PATH, e);
                return Ok(empty(options, stats));
            }
        };
        let spi1 = match spi::SystemMaster::open(SPI1_PATH, options.spi_clk_khz) {
            Ok(master) => Arc::new(Mutex::new(master)),
            Err(e) => {
                warn!("A1: cannot open {}: {}", SPI1_PATH, e);
                return Ok(empty(options, stats));
            }
        };
        let bus = match i2c::SystemBus::open(I2C_BUS_PATH) {
            Ok(bus) => Some(i2c::SharedBus::new(bus)),
            Err(e) => {
                info!("A1: no backplane I2C bus: {}", e);
                None
            }
        };

        if let Some(bus) = bus.as_ref() {
            // CoinCraft Desk: five single-chain boards on spi0
            if let Ok(sel) = selector::ExpanderSelector::ccd(bus.clone()) {
                let selector = shared_selector(Box::new(sel));
                let chains = probe_chains(
                    &selector,
                    &options,
                    &stats,
                    &spi0,
                    None,
                    Some(bus),
                    WiperStyle::PerBoard,
                );
                if !chains.is_empty() {
                    info!("Detected CoinCraft Desk with {} boards", chains.len());
                    return Ok(Driver {
                        options,
                        selector,
                        stats,
                        chains,
                    });
                }
            }
            // CoinCraft Blade: odd chains live on the second SPI master
            if let Ok(sel) = selector::ExpanderSelector::ccb(bus.clone()) {
                let selector = shared_selector(Box::new(sel));
                let chains = probe_chains(
                    &selector,
                    &options,
                    &stats,
                    &spi0,
                    Some(&spi1),
                    Some(bus),
                    WiperStyle::None,
                );
                if !chains.is_empty() {
                    info!("Detected CoinCraft Blade with {} boards", chains.len());
                    return Ok(Driver {
                        options,
                        selector,
                        stats,
                        chains,
                    });
                }
            }
            // CoinCraft Rig
            if let Ok(sel) = selector::ExpanderSelector::ccr(bus.clone()) {
                let selector = shared_selector(Box::new(sel));
                let chains = probe_chains(
                    &selector,
                    &options,
                    &stats,
                    &spi0,
                    None,
                    Some(bus),
                    WiperStyle::SharedPair,
                );
                if !chains.is_empty() {
                    info!("Detected CoinCraft Rig with {} chains", chains.len());
                    return Ok(Driver {
                        options,
                        selector,
                        stats,
                        chains,
                    });
                }
            }
        }

        // fall back to a single unmultiplexed chain
        info!("A1: checking single chain");
        let selector = shared_selector(Box::new(selector::NoopSelector));
        let chains = probe_chains(
            &selector,
            &options,
            &stats,
            &spi0,
            None,
            None,
            WiperStyle::None,
        );
        if !chains.is_empty() {
            info!(
                "Detected single A1 chain with {} chips",
                chains[0].num_chips()
            );
        }
        Ok(Driver {
            options,
            selector,
            stats,
            chains,
        })
    }

    pub fn chains(&self) -> &[Arc<Chain<spi::SystemMaster>>] {
        &self.chains
    }

    pub fn options(&self) -> &config::Options {
        &self.options
    }

    pub fn selector(&self) -> Arc<Mutex<Box<dyn selector::BoardSelector>>> {
        self.selector.clone()
    }

    /// Close the stats sink; the SPI and I2C handles close on drop
    pub fn shutdown(&self) {
        debug!("Closing A1 driver");
        self.stats.lock().expect("stats lock poisoned").close();
    }
}

fn shared_selector(
    sel: Box<dyn selector::BoardSelector>,
) -> Arc<Mutex<Box<dyn selector::BoardSelector>>> {
    Arc::new(Mutex::new(sel))
}

/// Walk all chain slots of one backplane and bring up whatever responds
fn probe_chains(
    selector: &Arc<Mutex<Box<dyn selector::BoardSelector>>>,
    options: &Arc<config::Options>,
    stats: &Arc<Mutex<stats::Sink>>,
    spi0: &Arc<Mutex<spi::SystemMaster>>,
    spi1: Option<&Arc<Mutex<spi::SystemMaster>>>,
    bus: Option<&i2c::SharedBus<i2c::SystemBus>>,
    wiper_style: WiperStyle,
) -> Vec<Arc<Chain<spi::SystemMaster>>> {
    let mut chains = Vec::new();
    let mut sel = selector.lock().expect("board selector lock poisoned");
    let _ = sel.reset_all();

    for board_id in 0..sel.chain_count() {
        if let (WiperStyle::PerBoard, Some(bus)) = (&wiper_style, bus) {
            let address = i2c::Address::new(power::CCD_TRIMPOT_ADDR[board_id]);
            let mut pot = match power::Mcp4x::probe(bus.clone(), address) {
                Ok(pot) => pot,
                Err(_) => continue,
            };
            let wiper = options.board_wiper(board_id);
            if wiper != 0 {
                info!("{}: setting wiper 0x{:02x}", board_id, wiper);
                if let Err(e) = pot.set_wiper(0, wiper) {
                    warn!("{}: cannot set wiper: {}", board_id, e);
                }
            }
        }

        info!("checking board {}...", board_id);
        if sel.select(board_id).is_err() {
            continue;
        }
        let master = match spi1 {
            Some(spi1) if board_id & 1 == 1 => spi1.clone(),
            _ => spi0.clone(),
        };
        let chain = Chain::init(
            board_id,
            master,
            selector.clone(),
            options.clone(),
            stats.clone(),
        );
        sel.release();

        match chain {
            Ok(Some(chain)) => {
                if let (WiperStyle::SharedPair, Some(bus)) = (&wiper_style, bus) {
                    if options.wiper != 0 && board_id & 1 == 0 {
                        let address = i2c::Address::new(power::CCR_TRIMPOT_ADDR);
                        match power::Mcp4x::probe(bus.clone(), address) {
                            Ok(mut pot) => {
                                let _ = pot.set_wiper(0, options.wiper);
                                let _ = pot.set_wiper(1, options.wiper);
                                info!("{}: set wiper to 0x{:02x}", board_id, options.wiper);
                            }
                            Err(e) => error!("{}: cannot access poti: {}", board_id, e),
                        }
                    }
                }
                chains.push(Arc::new(chain));
            }
            Ok(None) => {}
            Err(e) => warn!("chain {}: init failed: {}", board_id, e),
        }
    }
    chains
}
