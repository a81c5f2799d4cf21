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

//! Optional line-oriented sink for tuning events. One line per sampled
//! ratio or clock change, flushed immediately so the file tails cleanly.

use std::fs::File;
use std::io::Write;

use chrono::Local;

use crate::logging::macros::*;
use crate::tuner;

pub struct Sink {
    file: Option<File>,
}

fn timestamp() -> String {
    Local::now().format(" [%Y-%m-%d %H:%M:%S] ").to_string()
}

impl Sink {
    /// Open the stats file if one is configured. Failure to open it only
    /// costs the statistics, never the driver.
    pub fn open(path: Option<&str>) -> Self {
        let file = match path {
            Some(path) => match File::create(path) {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!("Failed to open stats file {}: {}", path, e);
                    None
                }
            },
            None => None,
        };
        Self { file }
    }

    fn write_line(&mut self, line: String) {
        if let Some(file) = self.file.as_mut() {
            let _ = writeln!(file, "{}{}", timestamp(), line);
            let _ = file.flush();
        }
    }

    /// A sampled bad-nonce ratio of one chip
    pub fn log_sample(&mut self, chain_id: usize, chip_id: u8, sample: &tuner::Sample, bad: bool) {
        if self.file.is_none() {
            return;
        }
        self.write_line(format!(
            "{} {}/{}: {}/{}-{}, {} ({})",
            if bad { "---" } else { "+++" },
            chain_id,
            chip_id,
            sample.window.shares_nok,
            sample.window.shares_ok,
            sample.ratio_pm,
            sample.window.sys_clk_khz / 1000,
            sample.prev_clk_khz / 1000,
        ));
    }

    /// A committed clock change. The pre-change window now lives in
    /// `tuner.prev`.
    pub fn log_change(&mut self, chain_id: usize, chip_id: u8, tuner: &tuner::Autotune, ratio_pm: u32) {
        if self.file.is_none() {
            return;
        }
        self.write_line(format!(
            "{} CHANGE: {}/{}: {}/{}/{} {}->{}",
            if tuner.prev.sys_clk_khz < tuner.current.sys_clk_khz {
                "+++"
            } else {
                "---"
            },
            chain_id,
            chip_id,
            tuner.prev.shares_nok,
            tuner.prev.shares_ok,
            ratio_pm,
            tuner.prev.sys_clk_khz / 1000,
            tuner.current.sys_clk_khz / 1000,
        ));
    }

    /// Down-tune was wanted but the clock already sits at the bound
    pub fn log_limit(&mut self, chain_id: usize, chip_id: u8, sys_clk_khz: u32) {
        if self.file.is_none() {
            return;
        }
        self.write_line(format!(
            "{}/{}: limit reached: clk={}",
            chain_id, chip_id, sys_clk_khz
        ));
    }

    pub fn close(&mut self) {
        self.file = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_sink_writes_lines() {
        let dir = tempfile::tempdir().expect("no tempdir");
        let path = dir.path().join("a1-stats.log");
        let path_str = path.to_str().expect("path not utf-8");

        let mut sink = Sink::open(Some(path_str));
        let mut tuner = tuner::Autotune::new(800_000);
        tuner.current.shares_ok = 95;
        tuner.current.shares_nok = 5;
        let sample = tuner::Sample {
            window: tuner.current,
            prev_clk_khz: 0,
            ratio_pm: 50,
        };
        sink.log_sample(0, 3, &sample, true);

        tuner.reset_window(32, 0);
        tuner.commit_clk(796_000);
        sink.log_change(0, 3, &tuner, 50);
        sink.log_limit(0, 3, 400_000);
        sink.close();

        let mut content = String::new();
        File::open(&path)
            .expect("stats file missing")
            .read_to_string(&mut content)
            .expect("stats file unreadable");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("--- 0/3: 5/95-50, 800 (0)"));
        assert!(lines[1].contains("--- CHANGE: 0/3: 5/95/50 800->796"));
        assert!(lines[2].contains("0/3: limit reached: clk=400000"));
    }

    #[test]
    fn test_sink_without_file() {
        let mut sink = Sink::open(None);
        let sample = tuner::Sample {
            window: Default::default(),
            prev_clk_khz: 0,
            ratio_pm: 10,
        };
        // must be a no-op
        sink.log_sample(0, 1, &sample, false);
        sink.close();
    }
}
