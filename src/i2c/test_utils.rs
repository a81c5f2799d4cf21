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

use std::collections::HashMap;

use crate::error::{self, ErrorKind};
use crate::i2c::{self, Address};

/// Bus double for the backplane peripherals.
///
/// It models exactly one register device (the GPIO expander, a thermistor,
/// the trimpot) and answers the rest of the address space with an optional
/// canned byte, so probe and selection logic can be driven against both
/// present and absent hardware.
#[derive(Clone)]
pub struct FakeI2cBus {
    device_addr: Address,
    regs: HashMap<u8, u8>,
    /// Served for device registers nobody seeded; `None` turns such
    /// accesses into bus errors
    fill: Option<u8>,
    /// Reply byte for every other address on the bus; `None` means
    /// nothing else ACKs
    foreign_byte: Option<u8>,
}

impl FakeI2cBus {
    pub fn new(device_addr: Address) -> Self {
        Self {
            device_addr,
            regs: HashMap::new(),
            fill: None,
            foreign_byte: None,
        }
    }

    /// Seed one device register
    pub fn with_register(mut self, reg: u8, val: u8) -> Self {
        self.regs.insert(reg, val);
        self
    }

    /// Make the whole device register space readable, defaulting to `val`
    pub fn with_fill(mut self, val: u8) -> Self {
        self.fill = Some(val);
        self
    }

    /// Let every other bus address answer reads with `val`
    pub fn with_foreign_byte(mut self, val: u8) -> Self {
        self.foreign_byte = Some(val);
        self
    }
}

impl i2c::Bus for FakeI2cBus {
    fn read(&mut self, addr: Address, reg: u8) -> error::Result<u8> {
        if addr != self.device_addr {
            return match self.foreign_byte {
                Some(val) => Ok(val),
                None => Err(ErrorKind::I2c(format!("no device ACKs at {}", addr)).into()),
            };
        }
        match self.regs.get(&reg) {
            Some(&val) => Ok(val),
            None => match self.fill {
                Some(val) => Ok(val),
                None => Err(ErrorKind::I2c(format!("register {:#04x} not backed", reg)).into()),
            },
        }
    }

    fn write(&mut self, addr: Address, reg: u8, val: u8) -> error::Result<()> {
        // a write is only legal where a read would be; foreign writes are
        // swallowed the way a write to the wrong-but-present slave is
        self.read(addr, reg)?;
        if addr == self.device_addr {
            self.regs.insert(reg, val);
        }
        Ok(())
    }
}
