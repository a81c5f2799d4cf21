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

//! Board selector backends. The CoinCraft backplanes multiplex several
//! chains onto the shared SPI master through an I2C GPIO expander that also
//! drives the per-board reset lines and gates the thermistor readout.
//!
//! The whole selector is shared process-wide as `Arc<Mutex<dyn
//! BoardSelector>>`; holding the mutex guard is what the C driver expressed
//! as the `select()`/`release()` critical section.

use std::thread;
use std::time::Duration;

use crate::error::{self, ErrorKind};
use crate::i2c;
use crate::logging::macros::*;

/// How long the reset line is asserted
pub const RESET_LOW_TIME_MS: u64 = 200;
/// Settle time after deasserting reset
pub const RESET_HI_TIME_MS: u64 = 100;

/// Capabilities the chain driver needs from a backplane
pub trait BoardSelector: Send {
    /// Number of chains this backplane can carry
    fn chain_count(&self) -> usize;

    /// Steer the chain's SPI lines and thermistor onto the shared masters
    fn select(&mut self, chain_id: usize) -> error::Result<()>;

    /// Counterpart of `select`; the exclusive window itself is the mutex
    /// guard the caller holds
    fn release(&mut self);

    /// Pulse the reset line of the selected chain
    fn reset(&mut self) -> error::Result<()>;

    /// Pulse the reset lines of all chains
    fn reset_all(&mut self) -> error::Result<()>;

    /// Read the thermistor routed to `sensor_id`, in whole degrees celsius.
    /// Returns 0 when no valid reading is available.
    fn get_temp(&mut self, sensor_id: usize) -> u8;
}

/// Single-chain boards have nothing to multiplex
pub struct NoopSelector;

impl BoardSelector for NoopSelector {
    fn chain_count(&self) -> usize {
        1
    }

    fn select(&mut self, chain_id: usize) -> error::Result<()> {
        if chain_id != 0 {
            Err(ErrorKind::I2c(format!(
                "single chain backplane has no chain {}",
                chain_id
            )))?
        }
        Ok(())
    }

    fn release(&mut self) {}

    fn reset(&mut self) -> error::Result<()> {
        Ok(())
    }

    fn reset_all(&mut self) -> error::Result<()> {
        Ok(())
    }

    fn get_temp(&mut self, _sensor_id: usize) -> u8 {
        0
    }
}

/// I2C address of the TCA9535 expander on the CoinCraft backplanes
const EXPANDER_ADDR: u8 = 0x27;

/// TCA9535 registers: output ports and direction config.
/// Port 0 drives the active-high reset lines, port 1 the active-low
/// chain-select lines.
const REG_OUT_RESET: u8 = 0x02;
const REG_OUT_SELECT: u8 = 0x03;
const REG_CFG_RESET: u8 = 0x06;
const REG_CFG_SELECT: u8 = 0x07;

/// Fixed per-backplane wiring
struct Layout {
    name: &'static str,
    chains: usize,
    /// Chain pairs share one thermistor; odd chains serve the cached
    /// reading of their even neighbour
    paired_sensor: bool,
    /// LM75 slave addresses, indexed by board
    temp_slaves: &'static [u8],
}

const CCD_LAYOUT: Layout = Layout {
    name: "CoinCraft Desk",
    chains: 5,
    paired_sensor: false,
    temp_slaves: &[0x48, 0x49, 0x4a, 0x4b, 0x4c],
};

const CCB_LAYOUT: Layout = Layout {
    name: "CoinCraft Blade",
    chains: 8,
    paired_sensor: true,
    temp_slaves: &[0x48, 0x49, 0x4a, 0x4b],
};

const CCR_LAYOUT: Layout = Layout {
    name: "CoinCraft Rig",
    chains: 8,
    paired_sensor: true,
    temp_slaves: &[0x48, 0x49, 0x4a, 0x4b],
};

/// Selector backend for the TCA9535-based backplanes (CCD, CCB, CCR)
pub struct ExpanderSelector<T> {
    layout: Layout,
    expander: i2c::Device<T>,
    bus: T,
    active_chain: Option<usize>,
    chain_mask: u8,
    last_temp: [u8; 8],
}

impl<T> ExpanderSelector<T>
where
    T: i2c::Bus + Clone + Send,
{
    pub fn ccd(bus: T) -> error::Result<Self> {
        Self::probe(bus, CCD_LAYOUT)
    }

    pub fn ccb(bus: T) -> error::Result<Self> {
        Self::probe(bus, CCB_LAYOUT)
    }

    pub fn ccr(bus: T) -> error::Result<Self> {
        Self::probe(bus, CCR_LAYOUT)
    }

    fn probe(bus: T, layout: Layout) -> error::Result<Self> {
        let mut expander = i2c::Device::new(bus.clone(), i2c::Address::new(EXPANDER_ADDR));
        // both ports are outputs; all chains deselected, all resets released
        expander.write(REG_CFG_SELECT, 0x00)?;
        expander.write(REG_OUT_SELECT, 0xff)?;
        expander.write(REG_CFG_RESET, 0x00)?;
        expander.write(REG_OUT_RESET, 0x00)?;
        info!("{} backplane detected", layout.name);
        Ok(Self {
            layout,
            expander,
            bus,
            active_chain: None,
            chain_mask: 0,
            last_temp: [0; 8],
        })
    }

    fn pulse_reset(&mut self, mask: u8) -> error::Result<()> {
        self.expander.write(REG_OUT_RESET, mask)?;
        thread::sleep(Duration::from_millis(RESET_LOW_TIME_MS));
        self.expander.write(REG_OUT_RESET, 0x00)?;
        thread::sleep(Duration::from_millis(RESET_HI_TIME_MS));
        Ok(())
    }

    /// Thermistor index serving the active chain
    fn sensor_board(&self, chain: usize) -> usize {
        if self.layout.paired_sensor {
            chain >> 1
        } else {
            chain
        }
    }
}

impl<T> BoardSelector for ExpanderSelector<T>
where
    T: i2c::Bus + Clone + Send,
{
    fn chain_count(&self) -> usize {
        self.layout.chains
    }

    fn select(&mut self, chain_id: usize) -> error::Result<()> {
        if chain_id >= self.layout.chains {
            Err(ErrorKind::I2c(format!(
                "{}: no chain {}",
                self.layout.name, chain_id
            )))?
        }
        if self.active_chain == Some(chain_id) {
            return Ok(());
        }
        self.active_chain = Some(chain_id);
        self.chain_mask = 1 << chain_id;
        self.expander.write(REG_OUT_SELECT, !self.chain_mask)
    }

    fn release(&mut self) {}

    fn reset(&mut self) -> error::Result<()> {
        let mask = self.chain_mask;
        self.pulse_reset(mask)
    }

    fn reset_all(&mut self) -> error::Result<()> {
        self.pulse_reset(0xff)
    }

    fn get_temp(&mut self, sensor_id: usize) -> u8 {
        if sensor_id != 0 {
            return 0;
        }
        let chain = match self.active_chain {
            Some(chain) => chain,
            None => return 0,
        };
        let board = self.sensor_board(chain);
        if self.layout.paired_sensor && chain & 1 == 1 {
            // the pair partner owns the sensor; serve the cached reading
            return self.last_temp[board];
        }
        let slave = self.layout.temp_slaves[board];
        let mut sensor = i2c::Device::new(self.bus.clone(), i2c::Address::new(slave));
        let mut temp = match sensor.read(0x00) {
            Ok(value) => value,
            Err(_) => return 0,
        };
        if temp & 0x80 != 0 {
            // known sensor glitch: a spurious sign bit rides on otherwise
            // sane readings
            temp &= 0x7f;
        }
        if temp == 0 || temp > 100 {
            warn!(
                "{}: chain {}: implausible temp reading {}",
                self.layout.name, chain, temp
            );
            return 0;
        }
        self.last_temp[board] = temp;
        temp
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::i2c::test_utils::FakeI2cBus;
    use crate::i2c::{Address, Device, SharedBus};

    /// Backplane bus with a live expander; `sensor_byte` is what the
    /// thermistor addresses answer with
    fn expander_bus(sensor_byte: u8) -> SharedBus<FakeI2cBus> {
        SharedBus::new(
            FakeI2cBus::new(Address::new(EXPANDER_ADDR))
                .with_fill(0)
                .with_foreign_byte(sensor_byte),
        )
    }

    #[test]
    fn test_probe_initializes_expander() {
        let bus = expander_bus(45);
        let _sel = ExpanderSelector::ccb(bus.clone()).expect("probe failed");
        let mut probe = Device::new(bus, Address::new(EXPANDER_ADDR));
        assert_eq!(probe.read(REG_CFG_SELECT).unwrap(), 0x00);
        assert_eq!(probe.read(REG_OUT_SELECT).unwrap(), 0xff);
        assert_eq!(probe.read(REG_CFG_RESET).unwrap(), 0x00);
        assert_eq!(probe.read(REG_OUT_RESET).unwrap(), 0x00);
    }

    #[test]
    fn test_probe_fails_without_expander() {
        // nothing ACKs at the expander address
        let bus = SharedBus::new(FakeI2cBus::new(Address::new(0x10)));
        assert!(ExpanderSelector::ccb(bus).is_err());
    }

    #[test]
    fn test_select_steers_chain() {
        let bus = expander_bus(45);
        let mut sel = ExpanderSelector::ccb(bus.clone()).expect("probe failed");
        sel.select(2).unwrap();
        let mut probe = Device::new(bus, Address::new(EXPANDER_ADDR));
        assert_eq!(probe.read(REG_OUT_SELECT).unwrap(), !(1 << 2));
        assert!(sel.select(8).is_err());
    }

    #[test]
    fn test_reset_releases_line() {
        let bus = expander_bus(45);
        let mut sel = ExpanderSelector::ccb(bus.clone()).expect("probe failed");
        sel.select(1).unwrap();
        sel.reset().unwrap();
        sel.reset_all().unwrap();
        let mut probe = Device::new(bus, Address::new(EXPANDER_ADDR));
        // the pulse always ends deasserted
        assert_eq!(probe.read(REG_OUT_RESET).unwrap(), 0x00);
    }

    #[test]
    fn test_temp_reading_and_pairing() {
        let bus = expander_bus(45);
        let mut sel = ExpanderSelector::ccb(bus).expect("probe failed");
        assert_eq!(sel.get_temp(0), 0, "no chain selected yet");
        sel.select(2).unwrap();
        assert_eq!(sel.get_temp(0), 45);
        assert_eq!(sel.get_temp(1), 0, "only sensor 0 is routed");
        // the odd pair partner serves the cached value of board 1
        sel.select(3).unwrap();
        assert_eq!(sel.get_temp(0), 45);

        // unpaired layout reads its own sensor on every chain
        let bus = expander_bus(51);
        let mut sel = ExpanderSelector::ccd(bus).expect("probe failed");
        assert_eq!(sel.chain_count(), 5);
        sel.select(3).unwrap();
        assert_eq!(sel.get_temp(0), 51);
    }

    #[test]
    fn test_temp_quirks() {
        // spurious sign bit is cleared and the value re-validated
        let bus = expander_bus(0x80 | 45);
        let mut sel = ExpanderSelector::ccb(bus).expect("probe failed");
        sel.select(0).unwrap();
        assert_eq!(sel.get_temp(0), 45);

        // readings above 100 degrees are discarded
        let bus = expander_bus(120);
        let mut sel = ExpanderSelector::ccb(bus).expect("probe failed");
        sel.select(0).unwrap();
        assert_eq!(sel.get_temp(0), 0);
    }

    #[test]
    fn test_noop_selector() {
        let mut sel = NoopSelector;
        assert_eq!(sel.chain_count(), 1);
        sel.select(0).unwrap();
        assert!(sel.select(1).is_err());
        assert_eq!(sel.get_temp(0), 0);
    }
}
