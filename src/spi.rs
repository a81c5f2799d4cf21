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

//! SPI master interface. The A1 protocol needs full-duplex transfers where
//! the response trails the command by a chain-length dependent number of
//! words, so the master keeps clocking zeros after the command bytes run out.

#[cfg(test)]
pub mod test_utils;

use linux_embedded_hal::spidev::{Spidev, SpidevOptions, SpidevTransfer, SPI_MODE_1};

use crate::error::{self, ErrorKind};

/// `Master` represents one SPI bus master with a fixed chip-select.
///
/// `transfer` clocks out `tx` (zero-padded up to `rx.len()`) while capturing
/// the full-duplex response into `rx`.
pub trait Master: Send {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> error::Result<()>;

    fn set_speed_khz(&mut self, speed_khz: u32) -> error::Result<()>;

    fn speed_khz(&self) -> u32;
}

/// Master backend for the Linux spidev character device, mode 1
pub struct SystemMaster {
    spi: Spidev,
    path: String,
    speed_khz: u32,
}

impl SystemMaster {
    pub fn open(path: &str, speed_khz: u32) -> error::Result<Self> {
        let spi = Spidev::open(path)?;
        let mut master = Self {
            spi,
            path: path.to_string(),
            speed_khz: 0,
        };
        master.set_speed_khz(speed_khz)?;
        Ok(master)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Master for SystemMaster {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> error::Result<()> {
        assert!(tx.len() <= rx.len());
        let mut tx_buf = vec![0u8; rx.len()];
        tx_buf[..tx.len()].copy_from_slice(tx);
        let mut transfer = SpidevTransfer::read_write(&tx_buf, rx);
        self.spi
            .transfer(&mut transfer)
            .map_err(|e| ErrorKind::Spi(format!("{}: transfer failed: {}", self.path, e)))?;
        Ok(())
    }

    fn set_speed_khz(&mut self, speed_khz: u32) -> error::Result<()> {
        if speed_khz == self.speed_khz {
            return Ok(());
        }
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(speed_khz * 1000)
            .mode(SPI_MODE_1)
            .build();
        self.spi
            .configure(&options)
            .map_err(|e| ErrorKind::Spi(format!("{}: configure failed: {}", self.path, e)))?;
        self.speed_khz = speed_khz;
        Ok(())
    }

    fn speed_khz(&self) -> u32 {
        self.speed_khz
    }
}
