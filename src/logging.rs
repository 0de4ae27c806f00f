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

//! Global logger built once and shared by all tasks. Filtering is
//! controlled through the `RUST_LOG` environment variable.

use lazy_static::lazy_static;
use slog::{o, Drain, Logger};

const ASYNC_LOGGER_DRAIN_CHANNEL_SIZE: usize = 2048;

fn create_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let format = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(format);
    let drain = slog_async::Async::new(drain)
        .chan_size(ASYNC_LOGGER_DRAIN_CHANNEL_SIZE)
        .build()
        .fuse();
    Logger::root(drain, o!())
}

lazy_static! {
    pub static ref LOGGER: Logger = create_logger();
}

#[macro_export]
macro_rules! trace (
    ($($arg:tt)+) => { slog::trace!(&$crate::logging::LOGGER, $($arg)+) }
);
#[macro_export]
macro_rules! debug (
    ($($arg:tt)+) => { slog::debug!(&$crate::logging::LOGGER, $($arg)+) }
);
#[macro_export]
macro_rules! info (
    ($($arg:tt)+) => { slog::info!(&$crate::logging::LOGGER, $($arg)+) }
);
#[macro_export]
macro_rules! warn (
    ($($arg:tt)+) => { slog::warn!(&$crate::logging::LOGGER, $($arg)+) }
);
#[macro_export]
macro_rules! error (
    ($($arg:tt)+) => { slog::error!(&$crate::logging::LOGGER, $($arg)+) }
);
