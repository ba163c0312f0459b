use std::collections::VecDeque;

use tracing::{trace, warn};

use sdiohtc_bus::{RequestFlags, Transfer};

use crate::device::{Counters, Device};
use crate::error::Result;
use crate::unit::{ReceiveUnit, RxFlags};

impl Device {
    /// Fetch as many queued units as fit one bundle with a single transfer.
    ///
    /// Units are taken from the front of `queue` while the message count
    /// and the byte budget allow; the rest stay queued. Returns an empty
    /// list when nothing was fetched, in which case the caller falls back
    /// to single fetches.
    pub(crate) fn fetch_bundle(
        &self,
        address: u32,
        queue: &mut VecDeque<ReceiveUnit>,
        partial: &mut bool,
    ) -> Result<Vec<ReceiveUnit>> {
        let max_messages = self.config.bundle.max_messages;
        if queue.len() > max_messages {
            *partial = true;
            warn!(
                queued = queue.len(),
                max_messages, "more messages announced than one bundle holds"
            );
        }

        let budget = self.config.bundle.budget();
        let Some(mut scratch) = self.callbacks.alloc_bundle_buffer(budget) else {
            warn!(budget, "no bundle buffer, fetching singly");
            return Ok(Vec::new());
        };
        scratch.resize(scratch.capacity().max(budget), 0);

        let mut units = Vec::new();
        let mut offsets = Vec::new();
        let mut total = 0usize;
        while units.len() < max_messages {
            let Some(mut unit) = queue.pop_front() else {
                break;
            };
            let padded = self.mailbox_map().padded_length(unit.actual_length);
            if total + padded > budget || padded > unit.capacity() {
                queue.push_front(unit);
                break;
            }
            unit.flags |= RxFlags::PART_OF_BUNDLE;
            offsets.push((total, padded));
            total += padded;
            units.push(unit);
        }

        if units.is_empty() {
            return Ok(units);
        }
        if !queue.is_empty() {
            // Lookaheads announced this round no longer fit one bundle.
            *partial = true;
        }
        if *partial {
            // What follows was already announced or is left to the next
            // status read.
            for unit in &mut units {
                unit.flags |= RxFlags::IGNORE_LOOKAHEAD;
            }
        }

        let scratch = self.bus.submit_sync(Transfer::new(
            address,
            scratch,
            total,
            RequestFlags::READ_SYNC_BLOCK_FIX,
        ))?;

        for (unit, (offset, padded)) in units.iter_mut().zip(offsets) {
            unit.buffer[..padded].copy_from_slice(&scratch[offset..offset + padded]);
        }
        Counters::bump(&self.counters.rx_bundles);
        trace!(
            address,
            messages = units.len(),
            total,
            remaining = queue.len(),
            "bundle fetched"
        );
        Ok(units)
    }
}
