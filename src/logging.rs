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

//! Process-wide logger built from a terminal drain with `RUST_LOG`-style
//! filtering. The level macros below log through it so that call sites don't
//! have to thread a `Logger` around.

use lazy_static::lazy_static;
use slog::Drain;

lazy_static! {
    static ref LOGGER: slog::Logger = new_logger();
}

fn new_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

pub fn logger() -> &'static slog::Logger {
    &LOGGER
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => { ::slog::trace!($crate::logging::logger(), $($arg)+) };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => { ::slog::debug!($crate::logging::logger(), $($arg)+) };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => { ::slog::info!($crate::logging::logger(), $($arg)+) };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => { ::slog::warn!($crate::logging::logger(), $($arg)+) };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => { ::slog::error!($crate::logging::logger(), $($arg)+) };
}

pub mod macros {
    pub use crate::{debug, error, info, trace, warn};
}
