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

//! Contract between the chain driver and the hosting mining framework.
//!
//! The framework owns work generation, share validation and accounting;
//! the driver only moves work items into chip queues and nonces back out.

use std::sync::Arc;

/// One unit of work: everything the chip needs to search a nonce range
#[derive(Debug, Clone, PartialEq)]
pub struct Work {
    /// Precomputed SHA-256 midstate of the first header block
    pub midstate: [u8; 32],
    /// Last 12 bytes of the block header (merkle tail, ntime, nbits)
    pub header_tail: [u8; 12],
    /// Difficulty the framework expects this device to filter at
    pub device_diff: f64,
}

/// Capabilities the hosting framework exposes to a chain thread.
///
/// Work items are owned by the chain's queue from `get_work` until they are
/// handed back through `work_completed`; a submitted nonce only borrows the
/// item.
pub trait Framework: Send {
    /// Pull the next queued work item, `None` when the framework has
    /// nothing ready
    fn get_work(&mut self) -> Option<Arc<Work>>;

    /// Validate a found nonce. Returns false for a hardware error (the
    /// nonce does not meet the work's target).
    fn submit_nonce(&mut self, work: &Arc<Work>, nonce: u32) -> bool;

    /// Return a work item whose nonce range is done or that got flushed
    fn work_completed(&mut self, work: Arc<Work>);

    /// Cooperative abort flag, polled inside the scanwork loops
    fn work_restart(&self) -> bool;
}
