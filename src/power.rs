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

//! MCP4x digital potentiometer setting the core voltage on CoinCraft
//! boards. The wiper is programmed once while the boards are probed and
//! left alone afterwards.

use crate::error::{self, ErrorKind};
use crate::i2c;

/// Trimpot slave addresses on the CoinCraft Desk, indexed by board
pub const CCD_TRIMPOT_ADDR: [u8; 5] = [0x2c, 0x2b, 0x2a, 0x29, 0x28];

/// The CoinCraft Rig boards share one dual-channel trimpot per chain pair
pub const CCR_TRIMPOT_ADDR: u8 = 0x28;

pub struct Mcp4x<T> {
    dev: i2c::Device<T>,
}

impl<T> Mcp4x<T>
where
    T: i2c::Bus,
{
    /// Volatile wiper registers; the command byte carries the register
    /// address in its upper nibble
    const WIPER_REG: [u8; 2] = [0x00, 0x10];

    pub fn probe(bus: T, address: i2c::Address) -> error::Result<Self> {
        let mut dev = i2c::Device::new(bus, address);
        // reading the wiper back doubles as a presence check
        dev.read(Self::WIPER_REG[0])
            .map_err(|_| ErrorKind::Power(format!("no trimpot at {}", address)))?;
        Ok(Self { dev })
    }

    pub fn set_wiper(&mut self, channel: usize, value: u8) -> error::Result<()> {
        let reg = *Self::WIPER_REG
            .get(channel)
            .ok_or_else(|| ErrorKind::Power(format!("invalid wiper channel {}", channel)))?;
        self.dev.write(reg, value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::i2c::test_utils::FakeI2cBus;
    use crate::i2c::Address;

    #[test]
    fn test_set_wiper() {
        let bus = FakeI2cBus::new(Address::new(0x2c)).with_fill(0);
        let mut pot = Mcp4x::probe(bus, Address::new(0x2c)).expect("probe failed");
        pot.set_wiper(0, 0x64).unwrap();
        pot.set_wiper(1, 0x32).unwrap();
        assert!(pot.set_wiper(2, 1).is_err());
    }

    #[test]
    fn test_probe_missing_pot() {
        // the desk trimpot answers but the rig address is unpopulated
        let bus = FakeI2cBus::new(Address::new(0x2c)).with_fill(0);
        assert!(Mcp4x::probe(bus, Address::new(0x28)).is_err());
    }
}
