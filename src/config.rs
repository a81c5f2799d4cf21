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

//! Driver options and the option-string parser.
//!
//! The host framework hands the driver one colon-separated option string
//! `ref:sys:spi:override_chip_num:wiper:override_diff:board_mask_hex`,
//! optionally followed by four dash-separated per-board arrays (sys clock,
//! wiper, chip bitmask, SPI clock). Zero fields keep their defaults.

use crate::error::{self, ErrorKind};
use crate::utils;

/// Maximum number of boards a backplane can carry
pub const MAX_BOARDS: usize = 16;

pub const DEFAULT_REF_CLK_KHZ: u32 = 16_000;
pub const DEFAULT_SYS_CLK_KHZ: u32 = 800_000;
pub const DEFAULT_SPI_CLK_KHZ: u32 = 2_000;

/// Auto-tuner bounds
pub const DEFAULT_LOWER_CLK_KHZ: u32 = 400_000;
pub const DEFAULT_UPPER_CLK_KHZ: u32 = 1_100_000;
pub const DEFAULT_LOWER_RATIO_PM: u32 = 3;
pub const DEFAULT_UPPER_RATIO_PM: u32 = 20;

/// Everything below this system clock is considered a configuration error
const MIN_SYS_CLK_KHZ: u32 = 100_000;

#[derive(Debug, Clone)]
pub struct Options {
    pub ref_clk_khz: u32,
    pub sys_clk_khz: u32,
    pub spi_clk_khz: u32,
    /// Limit the chip chain to this number of chips, 0 = no limit
    pub override_chip_num: usize,
    /// Global trimpot wiper value, 0 = leave untouched
    pub wiper: u8,
    /// Difficulty override: 0 = fixed diff 1, -1 = follow the work
    /// difficulty, positive = clamp the work difficulty
    pub override_diff: i32,
    /// Bitmask of chains to skip during detection
    pub board_mask: u32,
    pub enable_auto_tune: bool,
    pub lower_ratio_pm: u32,
    pub upper_ratio_pm: u32,
    pub lower_clk_khz: u32,
    pub upper_clk_khz: u32,
    /// Tuning events are appended here when set
    pub stats_path: Option<String>,
    sys_clk_per_board: [u32; MAX_BOARDS],
    wiper_per_board: [u32; MAX_BOARDS],
    chip_bitmask_per_board: [u32; MAX_BOARDS],
    spi_clk_per_board: [u32; MAX_BOARDS],
}

impl Default for Options {
    fn default() -> Self {
        Self {
            ref_clk_khz: DEFAULT_REF_CLK_KHZ,
            sys_clk_khz: DEFAULT_SYS_CLK_KHZ,
            spi_clk_khz: DEFAULT_SPI_CLK_KHZ,
            override_chip_num: 0,
            wiper: 0,
            override_diff: 0,
            board_mask: 0,
            enable_auto_tune: false,
            lower_ratio_pm: DEFAULT_LOWER_RATIO_PM,
            upper_ratio_pm: DEFAULT_UPPER_RATIO_PM,
            lower_clk_khz: DEFAULT_LOWER_CLK_KHZ,
            upper_clk_khz: DEFAULT_UPPER_CLK_KHZ,
            stats_path: None,
            sys_clk_per_board: [0; MAX_BOARDS],
            wiper_per_board: [0; MAX_BOARDS],
            chip_bitmask_per_board: [0; MAX_BOARDS],
            spi_clk_per_board: [0; MAX_BOARDS],
        }
    }
}

fn parse_field(field: &str, radix: u32) -> error::Result<i64> {
    i64::from_str_radix(field, radix)
        .map_err(|_| ErrorKind::Config(format!("invalid number '{}'", field)).into())
}

/// Parse a dash-separated per-board array. Boards beyond the last given
/// entry inherit its value.
fn parse_array(opt: &str, radix: u32) -> error::Result<[u32; MAX_BOARDS]> {
    let mut values = [0u32; MAX_BOARDS];
    let mut last = 0u32;
    let mut count = 0;
    for field in opt.split('-').take(MAX_BOARDS) {
        last = parse_field(field, radix)? as u32;
        values[count] = last;
        count += 1;
    }
    for value in values[count..].iter_mut() {
        *value = last;
    }
    Ok(values)
}

impl Options {
    /// Parse the full option string. Empty string yields the defaults.
    pub fn parse(opt: &str) -> error::Result<Self> {
        let mut options = Self::default();
        let mut tokens = opt.split_whitespace();

        if let Some(scalars) = tokens.next() {
            let mut fields = scalars.split(':');
            let mut scan = |radix| -> error::Result<i64> {
                match fields.next() {
                    Some(field) if !field.is_empty() => parse_field(field, radix),
                    _ => Ok(0),
                }
            };
            let ref_clk = scan(10)?;
            let sys_clk = scan(10)?;
            let spi_clk = scan(10)?;
            let override_chip_num = scan(10)?;
            let wiper = scan(10)?;
            let override_diff = scan(10)?;
            let board_mask = scan(16)?;

            if ref_clk != 0 {
                options.ref_clk_khz = ref_clk as u32;
            }
            if sys_clk != 0 {
                options.sys_clk_khz = sys_clk as u32;
            }
            if spi_clk != 0 {
                options.spi_clk_khz = spi_clk as u32;
            }
            if override_chip_num != 0 {
                options.override_chip_num = override_chip_num as usize;
            }
            if wiper != 0 {
                options.wiper = wiper as u8;
            }
            if override_diff != 0 {
                options.override_diff = override_diff as i32;
            }
            if board_mask != 0 {
                options.board_mask = board_mask as u32;
            }
        }

        if let Some(array) = tokens.next() {
            options.sys_clk_per_board = parse_array(array, 10)?;
        }
        if let Some(array) = tokens.next() {
            options.wiper_per_board = parse_array(array, 16)?;
        }
        if let Some(array) = tokens.next() {
            options.chip_bitmask_per_board = parse_array(array, 16)?;
        }
        if let Some(array) = tokens.next() {
            options.spi_clk_per_board = parse_array(array, 10)?;
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> error::Result<()> {
        if self.sys_clk_khz < MIN_SYS_CLK_KHZ {
            Err(ErrorKind::Config(
                "system clock must be above 100MHz".to_string(),
            ))?
        }
        Ok(())
    }

    /// Whole chain excluded by the board mask?
    pub fn board_masked(&self, chain_id: usize) -> bool {
        self.board_mask & (1 << chain_id) != 0
    }

    /// Single chip excluded by the per-board chip bitmask?
    pub fn chip_masked(&self, chain_id: usize, chip_index: usize) -> bool {
        match self.chip_bitmask_per_board.get(chain_id) {
            Some(mask) => mask & (1 << chip_index) != 0,
            None => false,
        }
    }

    pub fn board_sys_clk_khz(&self, chain_id: usize) -> u32 {
        match self.sys_clk_per_board.get(chain_id) {
            Some(&clk) if clk != 0 => clk,
            _ => self.sys_clk_khz,
        }
    }

    pub fn board_spi_clk_khz(&self, chain_id: usize) -> u32 {
        match self.spi_clk_per_board.get(chain_id) {
            Some(&clk) if clk != 0 => clk,
            _ => self.spi_clk_khz,
        }
    }

    pub fn board_wiper(&self, chain_id: usize) -> u8 {
        match self.wiper_per_board.get(chain_id) {
            Some(&wiper) if wiper != 0 => wiper as u8,
            _ => self.wiper,
        }
    }

    /// Compact target for the job's difficulty field, `None` when the
    /// difficulty-1 default applies
    pub fn job_target(&self, device_diff: f64) -> Option<u32> {
        match self.override_diff {
            0 => None,
            -1 => Some(utils::target_from_diff(device_diff)),
            od => {
                let mut diff = device_diff;
                if f64::from(od) < diff {
                    diff = f64::from(od);
                }
                Some(utils::target_from_diff(diff))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::parse("").expect("parse failed");
        assert_eq!(options.ref_clk_khz, 16_000);
        assert_eq!(options.sys_clk_khz, 800_000);
        assert_eq!(options.spi_clk_khz, 2_000);
        assert_eq!(options.board_mask, 0);
        assert_eq!(options.override_diff, 0);
        assert_eq!(options.board_sys_clk_khz(3), 800_000);
    }

    #[test]
    fn test_scalar_fields() {
        let options = Options::parse("16000:900000:4000:2:128:-1:a").expect("parse failed");
        assert_eq!(options.sys_clk_khz, 900_000);
        assert_eq!(options.spi_clk_khz, 4_000);
        assert_eq!(options.override_chip_num, 2);
        // the scalar wiper field is decimal, only the board mask is hex
        assert_eq!(options.wiper, 128);
        assert_eq!(options.override_diff, -1);
        assert_eq!(options.board_mask, 0x0a);
        assert!(options.board_masked(1));
        assert!(options.board_masked(3));
        assert!(!options.board_masked(0));
    }

    #[test]
    fn test_zero_keeps_default() {
        let options = Options::parse("0:0:4000").expect("parse failed");
        assert_eq!(options.ref_clk_khz, 16_000);
        assert_eq!(options.sys_clk_khz, 800_000);
        assert_eq!(options.spi_clk_khz, 4_000);
    }

    #[test]
    fn test_per_board_arrays() {
        let options =
            Options::parse("0:0:0:0:0:0:0 800000-900000 60-70 3-0-1 2000-4000").expect("parse failed");
        assert_eq!(options.board_sys_clk_khz(0), 800_000);
        assert_eq!(options.board_sys_clk_khz(1), 900_000);
        // missing entries inherit the last value
        assert_eq!(options.board_sys_clk_khz(7), 900_000);
        assert_eq!(options.board_wiper(0), 0x60);
        assert_eq!(options.board_wiper(5), 0x70);
        assert!(options.chip_masked(0, 0));
        assert!(options.chip_masked(0, 1));
        assert!(!options.chip_masked(1, 0));
        assert!(options.chip_masked(2, 0));
        assert_eq!(options.board_spi_clk_khz(1), 4_000);
    }

    #[test]
    fn test_sys_clk_validation() {
        assert!(Options::parse("16000:90000").is_err());
    }

    #[test]
    fn test_malformed_number() {
        assert!(Options::parse("16000:foo").is_err());
    }

    #[test]
    fn test_job_target() {
        let mut options = Options::default();
        // 0 keeps the fixed difficulty-1 pattern in the job
        assert_eq!(options.job_target(64.0), None);

        // -1 follows the work difficulty
        options.override_diff = -1;
        assert_eq!(options.job_target(1.0), Some(0x1d00ffff));

        // positive values clamp the work difficulty
        options.override_diff = 2;
        assert_eq!(options.job_target(64.0), Some(0x1c7fff80));
        assert_eq!(options.job_target(1.0), Some(0x1d00ffff));
    }
}
