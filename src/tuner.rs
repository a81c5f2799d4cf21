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

//! Per-chip frequency auto-tuner.
//!
//! The tuner samples good/bad nonces over a window sized to an expected
//! number of nonces, so the wall-clock length adapts to the chip's
//! throughput. A bad-nonce ratio above the upper bound steps the clock
//! down; a ratio below the lower bound after a full window steps it up.
//! The caller performs the actual chip restart and commits the new clock
//! once the chip accepted it.

/// Clock step applied per tuning decision
pub const CLOCK_DELTA_KHZ: i32 = 4 * 1000;

/// How many nonces one sampling window is sized for
pub const NONCE_INTERVAL_N: u64 = 200;

/// Minimum sample count for a meaningful ratio
pub const MIN_NUM_NONCES: u32 = 30;

/// Bad nonces to accumulate before the ratio is even considered
pub const BAD_NONCE_COUNT: u32 = 5;

/// Tuner bounds, lifted out of the driver options
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub enable: bool,
    pub lower_ratio_pm: u32,
    pub upper_ratio_pm: u32,
    pub lower_clk_khz: u32,
    pub upper_clk_khz: u32,
}

/// One sampling window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Window {
    pub shares_ok: u32,
    pub shares_nok: u32,
    pub start_ms: u64,
    pub end_ms: u64,
    pub sys_clk_khz: u32,
}

/// What the caller should do with the chip after a nonce was recorded
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    None,
    /// Restart the chip with this system clock, then `commit_clk`
    Change { new_clk_khz: u32 },
    /// Down-tune wanted but the clock already sits at the lower bound
    LimitReached,
}

/// A sampled ratio, snapshotted before the window rolls so that it can go
/// to the stats sink verbatim
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub window: Window,
    /// Clock of the previous window at sampling time
    pub prev_clk_khz: u32,
    pub ratio_pm: u32,
}

/// Result of recording one nonce. `sample` is set whenever a ratio was
/// computed, even with tuning disabled (diagnostics still want it).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub sample: Option<Sample>,
    pub action: Action,
}

impl Outcome {
    fn none() -> Self {
        Self {
            sample: None,
            action: Action::None,
        }
    }

    fn sampled(sample: Sample) -> Self {
        Self {
            sample: Some(sample),
            action: Action::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Autotune {
    pub current: Window,
    pub prev: Window,
}

impl Autotune {
    pub fn new(sys_clk_khz: u32) -> Self {
        let mut tuner = Self::default();
        tuner.current.sys_clk_khz = sys_clk_khz;
        tuner
    }

    /// Roll the sampling window. The window length is the expected time to
    /// see `NONCE_INTERVAL_N` nonces at the chip's current throughput.
    pub fn reset_window(&mut self, num_cores: u32, now_ms: u64) {
        self.prev = self.current;
        self.current.shares_ok = 0;
        self.current.shares_nok = 0;
        self.current.start_ms = now_ms;

        let nonces_per_sec =
            (num_cores as f64 * self.current.sys_clk_khz as f64) / 4_294_967.296;
        let window_ms = (NONCE_INTERVAL_N as f64 * 1000.0 / nonces_per_sec) as u64;
        self.current.end_ms = now_ms.saturating_add(window_ms);
    }

    /// Bad-nonce ratio of the current window in permille, `None` while the
    /// sample is too small to mean anything
    pub fn ratio_pm(&self) -> Option<u32> {
        let all = self.current.shares_ok + self.current.shares_nok;
        if all < MIN_NUM_NONCES {
            return None;
        }
        Some((self.current.shares_nok * 1000 + all / 2) / all)
    }

    fn snapshot(&self, ratio_pm: u32) -> Sample {
        Sample {
            window: self.current,
            prev_clk_khz: self.prev.sys_clk_khz,
            ratio_pm,
        }
    }

    /// Record an invalid nonce and decide whether to step the clock down
    pub fn bad_nonce(&mut self, num_cores: u32, limits: &Limits, now_ms: u64) -> Outcome {
        self.current.shares_nok += 1;
        if self.current.shares_nok < BAD_NONCE_COUNT {
            return Outcome::none();
        }
        let ratio = match self.ratio_pm() {
            Some(ratio) => ratio,
            None => return Outcome::none(),
        };
        let sample = self.snapshot(ratio);
        if !limits.enable {
            return Outcome::sampled(sample);
        }
        if ratio > limits.upper_ratio_pm {
            if self.current.sys_clk_khz > limits.lower_clk_khz {
                return self.adjust(-CLOCK_DELTA_KHZ, sample, num_cores, limits, now_ms);
            }
            self.reset_window(num_cores, now_ms);
            return Outcome {
                sample: Some(sample),
                action: Action::LimitReached,
            };
        }
        self.reset_window(num_cores, now_ms);
        Outcome::sampled(sample)
    }

    /// Record a valid nonce and decide whether to step the clock up
    pub fn good_nonce(&mut self, num_cores: u32, limits: &Limits, now_ms: u64) -> Outcome {
        self.current.shares_ok += 1;
        // don't keep raising past a proven regression point
        if self.current.sys_clk_khz < self.prev.sys_clk_khz {
            return Outcome::none();
        }
        self.uptune(num_cores, limits, now_ms)
    }

    /// Window-end up-tune check. Also run when work is flushed so that an
    /// idle chain still gets its chips tuned.
    pub fn uptune(&mut self, num_cores: u32, limits: &Limits, now_ms: u64) -> Outcome {
        if self.current.sys_clk_khz >= limits.upper_clk_khz {
            return Outcome::none();
        }
        if self.current.end_ms > now_ms {
            return Outcome::none();
        }
        let ratio = match self.ratio_pm() {
            Some(ratio) => ratio,
            None => return Outcome::none(),
        };
        let sample = self.snapshot(ratio);
        if !limits.enable {
            return Outcome::sampled(sample);
        }
        if ratio < limits.lower_ratio_pm {
            return self.adjust(CLOCK_DELTA_KHZ, sample, num_cores, limits, now_ms);
        }
        self.reset_window(num_cores, now_ms);
        Outcome::sampled(sample)
    }

    fn adjust(
        &mut self,
        delta_khz: i32,
        sample: Sample,
        num_cores: u32,
        limits: &Limits,
        now_ms: u64,
    ) -> Outcome {
        self.reset_window(num_cores, now_ms);
        let mut new_clk = self.current.sys_clk_khz as i64 + delta_khz as i64;
        if new_clk > limits.upper_clk_khz as i64 {
            new_clk = limits.upper_clk_khz as i64;
        } else if new_clk < limits.lower_clk_khz as i64 {
            new_clk = limits.lower_clk_khz as i64;
        }
        if new_clk == self.current.sys_clk_khz as i64 {
            return Outcome::sampled(sample);
        }
        Outcome {
            sample: Some(sample),
            action: Action::Change {
                new_clk_khz: new_clk as u32,
            },
        }
    }

    /// The chip accepted the new clock; start sampling at the new
    /// operating point
    pub fn commit_clk(&mut self, new_clk_khz: u32) {
        self.current.sys_clk_khz = new_clk_khz;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const LIMITS: Limits = Limits {
        enable: true,
        lower_ratio_pm: 3,
        upper_ratio_pm: 20,
        lower_clk_khz: 400_000,
        upper_clk_khz: 1_100_000,
    };

    fn tuned(sys_clk: u32, ok: u32, nok: u32) -> Autotune {
        let mut tuner = Autotune::new(sys_clk);
        tuner.current.shares_ok = ok;
        tuner.current.shares_nok = nok;
        tuner
    }

    fn ratio_of(outcome: &Outcome) -> Option<u32> {
        outcome.sample.map(|sample| sample.ratio_pm)
    }

    #[test]
    fn test_window_length() {
        let mut tuner = Autotune::new(800_000);
        // 32 cores at 800 MHz: ~5.96 nonce ranges per second, 200 nonces
        // take ~33.5 seconds
        tuner.reset_window(32, 1_000);
        assert_eq!(tuner.current.start_ms, 1_000);
        let window = tuner.current.end_ms - tuner.current.start_ms;
        assert!(window > 33_000 && window < 34_000, "window = {}", window);

        // half the clock doubles the window
        let mut slow = Autotune::new(400_000);
        slow.reset_window(32, 1_000);
        let slow_window = slow.current.end_ms - slow.current.start_ms;
        assert!(slow_window / window == 2, "{} vs {}", slow_window, window);
    }

    #[test]
    fn test_ratio_needs_samples() {
        let tuner = tuned(800_000, 20, 9);
        assert_eq!(tuner.ratio_pm(), None);
        let tuner = tuned(800_000, 21, 9);
        // 9 bad of 30, rounded half up
        assert_eq!(tuner.ratio_pm(), Some(300));
    }

    #[test]
    fn test_ratio_rounding() {
        let tuner = tuned(800_000, 95, 5);
        assert_eq!(tuner.ratio_pm(), Some(50));
        let tuner = tuned(800_000, 994, 6);
        assert_eq!(tuner.ratio_pm(), Some(6));
    }

    #[test]
    fn test_bad_nonce_needs_five() {
        let mut tuner = tuned(800_000, 95, 3);
        let outcome = tuner.bad_nonce(32, &LIMITS, 0);
        assert_eq!(outcome, Outcome::none());
    }

    #[test]
    fn test_bad_nonce_steps_down() {
        let mut tuner = tuned(800_000, 95, 4);
        let outcome = tuner.bad_nonce(32, &LIMITS, 0);
        // 5 bad of 100 = 50 permille, over the 20 permille bound
        assert_eq!(ratio_of(&outcome), Some(50));
        assert_eq!(
            outcome.action,
            Action::Change {
                new_clk_khz: 796_000
            }
        );
        // the sample still carries the pre-roll window
        let sample = outcome.sample.unwrap();
        assert_eq!(sample.window.shares_ok, 95);
        assert_eq!(sample.window.shares_nok, 5);
        // the window rolled; commit finishes the change
        assert_eq!(tuner.current.shares_nok, 0);
        assert_eq!(tuner.prev.shares_nok, 5);
        tuner.commit_clk(796_000);
        assert_eq!(tuner.current.sys_clk_khz, 796_000);
        assert_eq!(tuner.prev.sys_clk_khz, 800_000);
    }

    #[test]
    fn test_bad_nonce_at_lower_limit() {
        let mut tuner = tuned(400_000, 95, 4);
        let outcome = tuner.bad_nonce(32, &LIMITS, 0);
        assert_eq!(outcome.action, Action::LimitReached);
    }

    #[test]
    fn test_bad_nonce_disabled_tuning_still_samples() {
        let limits = Limits {
            enable: false,
            ..LIMITS
        };
        let mut tuner = tuned(800_000, 95, 4);
        let outcome = tuner.bad_nonce(32, &limits, 0);
        assert_eq!(ratio_of(&outcome), Some(50));
        assert_eq!(outcome.action, Action::None);
    }

    #[test]
    fn test_clock_never_leaves_bounds() {
        // stepping down from just above the lower bound clamps to it
        let mut tuner = tuned(402_000, 95, 4);
        let outcome = tuner.bad_nonce(32, &LIMITS, 0);
        assert_eq!(
            outcome.action,
            Action::Change {
                new_clk_khz: 400_000
            }
        );

        // stepping up from just below the upper bound clamps to it
        let mut tuner = tuned(1_098_000, 100, 0);
        tuner.current.end_ms = 0;
        let outcome = tuner.uptune(32, &LIMITS, 1);
        assert_eq!(
            outcome.action,
            Action::Change {
                new_clk_khz: 1_100_000
            }
        );
    }

    #[test]
    fn test_uptune_waits_for_window_end() {
        let mut tuner = tuned(800_000, 100, 0);
        tuner.current.end_ms = 10_000;
        let outcome = tuner.good_nonce(32, &LIMITS, 5_000);
        assert_eq!(outcome, Outcome::none());

        let outcome = tuner.good_nonce(32, &LIMITS, 10_001);
        assert_eq!(ratio_of(&outcome), Some(0));
        assert_eq!(
            outcome.action,
            Action::Change {
                new_clk_khz: 804_000
            }
        );
    }

    #[test]
    fn test_no_uptune_after_regression() {
        // a down-tuned chip must not creep back up on good nonces alone
        let mut tuner = tuned(796_000, 100, 0);
        tuner.prev.sys_clk_khz = 800_000;
        tuner.current.end_ms = 0;
        let outcome = tuner.good_nonce(32, &LIMITS, 1);
        assert_eq!(outcome, Outcome::none());
    }

    #[test]
    fn test_uptune_not_above_upper_clk() {
        let mut tuner = tuned(1_100_000, 100, 0);
        tuner.current.end_ms = 0;
        let outcome = tuner.uptune(32, &LIMITS, 1);
        assert_eq!(outcome, Outcome::none());
    }

    #[test]
    fn test_high_ratio_after_window_resets() {
        let mut tuner = tuned(800_000, 90, 10);
        tuner.current.end_ms = 0;
        // 100 permille is not below lower_ratio_pm, so no change
        let outcome = tuner.uptune(32, &LIMITS, 1);
        assert_eq!(ratio_of(&outcome), Some(100));
        assert_eq!(outcome.action, Action::None);
        assert_eq!(tuner.current.shares_ok, 0);
    }
}
