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

//! Register-oriented I2C bus and device abstraction. The board selector,
//! thermistors and the trimpot all talk through this layer, which keeps them
//! testable against `test_utils::FakeI2cBus`.

#[cfg(test)]
pub mod test_utils;

use std::fmt;
use std::sync::{Arc, Mutex};

use embedded_hal::blocking::i2c::{Write, WriteRead};
use linux_embedded_hal::I2cdev;

use crate::error::{self, ErrorKind};

/// Struct representing a 7-bit I2C address
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Address(u8);

impl Address {
    pub fn new(address: u8) -> Self {
        assert!(address <= 0x7f, "I2C address out of 7-bit range");
        Self(address)
    }

    pub fn to_hw_addr(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// `Bus` represents register read/write ops on an I2C bus
pub trait Bus: Send {
    fn read(&mut self, addr: Address, reg: u8) -> error::Result<u8>;

    fn write(&mut self, addr: Address, reg: u8, val: u8) -> error::Result<()>;
}

/// We can make any bus shared by wrapping it in a lock
pub struct SharedBus<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> SharedBus<T>
where
    T: Bus,
{
    pub fn new(bus: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bus)),
        }
    }
}

impl<T> Clone for SharedBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Bus for SharedBus<T>
where
    T: Bus,
{
    fn read(&mut self, addr: Address, reg: u8) -> error::Result<u8> {
        let mut bus = self.inner.lock().expect("I2C bus lock poisoned");
        bus.read(addr, reg)
    }

    fn write(&mut self, addr: Address, reg: u8, val: u8) -> error::Result<()> {
        let mut bus = self.inner.lock().expect("I2C bus lock poisoned");
        bus.write(addr, reg, val)
    }
}

/// We can make a `Device` by tying together some kind of bus (T) and I2C address
pub struct Device<T> {
    bus: T,
    address: Address,
}

impl<T> Device<T>
where
    T: Bus,
{
    pub fn new(bus: T, address: Address) -> Self {
        Self { bus, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Read register
    pub fn read(&mut self, reg: u8) -> error::Result<u8> {
        self.bus.read(self.address, reg)
    }

    /// Write register
    pub fn write(&mut self, reg: u8, val: u8) -> error::Result<()> {
        self.bus.write(self.address, reg, val)
    }

    /// Write register and immediately read it back to check it was written correctly.
    /// * `reg` - address of register to write
    /// * `reg_read_back` - address of register to read! because it often is that those
    ///   two are different
    /// * `val` - value to write to the register
    pub fn write_readback(&mut self, reg: u8, reg_read_back: u8, val: u8) -> error::Result<()> {
        self.write(reg, val)?;
        let new_val = self.read(reg_read_back)?;
        if val != new_val {
            Err(ErrorKind::I2c(format!(
                "failed to read back register {:#x}/{:#x}: written {:#x} but read back {:#x}",
                reg, reg_read_back, val, new_val
            )))?
        }
        Ok(())
    }
}

/// Bus backend for the Linux I2C character device
pub struct SystemBus(I2cdev);

impl SystemBus {
    pub fn open(path: &str) -> error::Result<Self> {
        let dev = I2cdev::new(path)
            .map_err(|e| ErrorKind::I2c(format!("failed to open {}: {}", path, e)))?;
        Ok(Self(dev))
    }
}

impl Bus for SystemBus {
    fn read(&mut self, addr: Address, reg: u8) -> error::Result<u8> {
        let mut buf = [0u8; 1];
        self.0
            .write_read(addr.to_hw_addr(), &[reg], &mut buf)
            .map_err(|e| ErrorKind::I2c(format!("read {}/{:#x}: {:?}", addr, reg, e)))?;
        Ok(buf[0])
    }

    fn write(&mut self, addr: Address, reg: u8, val: u8) -> error::Result<()> {
        self.0
            .write(addr.to_hw_addr(), &[reg, val])
            .map_err(|e| ErrorKind::I2c(format!("write {}/{:#x}: {:?}", addr, reg, e)))?;
        Ok(())
    }
}
