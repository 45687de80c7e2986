//! Pending-event delivery loop
//!
//! Runs on the receiving side with interrupts disabled. The loop takes the
//! upcall flag, scans pending-and-unmasked ports, and for each one clears
//! the pending bit, masks the port, runs the handler and unmasks it. A send
//! that lands while the scan is in progress sets the flag again, so the
//! outer loop goes round once more instead of returning. A send that lands
//! while the port is masked is picked up by the unmask re-check.

use mhv_abi::EVTCHN_WORDS;

use crate::shared::SharedInfo;
use crate::types::Port;

/// Drain every deliverable event of `shared`, calling `handler` once per
/// event. Returns the number of events delivered.
pub fn deliver_events<F: FnMut(Port)>(shared: &SharedInfo, mut handler: F) -> usize {
    let mut delivered = 0;
    while shared.take_upcall() {
        for w in 0..EVTCHN_WORDS {
            let mut bits = shared.deliverable_word(w);
            while bits != 0 {
                let b = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                let port = (w * 64 + b) as Port;

                if !shared.test_and_clear_pending(port) {
                    continue;
                }
                shared.set_mask(port);
                handler(port);
                delivered += 1;
                // Raised again while masked: the sender did not set the flag
                shared.unmask(port);
            }
        }
    }
    delivered
}
