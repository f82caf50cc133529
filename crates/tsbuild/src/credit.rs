//! The credit window.
//!
//! Per connection and direction, three cursors govern remote-write flow
//! control: `written` (producer), `acked` (consumer grant, trailing), and
//! `sent_update` (the last value the producer told the consumer). The
//! contract is strictly **one pointer-update message in flight per
//! direction** — `our_turn` is the producer's right to send the next one;
//! it is surrendered with every update and returned by the consumer's
//! acknowledgement. One-in-flight removes the need for sequence numbers.
//!
//! Locking: one mutex per direction (`wp` for the producer cursors, `ack`
//! for the consumer grant), never both at once. The producer blocks on the
//! ack condvar; the completion pump wakes it on every acknowledgement.

use crate::error::CreditError;
use log::{debug, trace};
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use tsipc::desc::BufferPosition;

/// Outcome of processing an inbound acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Normal acknowledgement, window advanced.
    Advanced,
    /// The consumer echoed the final sentinel; the connection is done.
    Final,
}

struct WpState {
    pos: BufferPosition,
    sent: BufferPosition,
    our_turn: bool,
    finalize: bool,
    final_sent: bool,
}

/// Producer-side credit window of one connection.
pub struct CreditWindow {
    data_capacity: u64,
    desc_capacity: u64,
    ack: Mutex<BufferPosition>,
    ack_cond: Condvar,
    wp: Mutex<WpState>,
}

/// Re-solicit cadence while blocked on credit.
const WAIT_RESOLICIT: Duration = Duration::from_millis(50);

impl CreditWindow {
    /// Creates a window over a remote buffer pair of the given capacities
    /// (data bytes, descriptor entries).
    pub fn new(data_capacity: u64, desc_capacity: u64) -> Self {
        Self {
            data_capacity,
            desc_capacity,
            ack: Mutex::new(BufferPosition::default()),
            ack_cond: Condvar::new(),
            wp: Mutex::new(WpState {
                pos: BufferPosition::default(),
                sent: BufferPosition::default(),
                our_turn: true,
                finalize: false,
                final_sent: false,
            }),
        }
    }

    /// Remote data capacity in bytes.
    pub fn data_capacity(&self) -> u64 {
        self.data_capacity
    }

    /// Remote descriptor capacity in entries.
    pub fn desc_capacity(&self) -> u64 {
        self.desc_capacity
    }

    /// Current producer write position.
    pub fn write_position(&self) -> BufferPosition {
        self.wp.lock().unwrap().pos
    }

    /// Last acknowledged position.
    pub fn acknowledged(&self) -> BufferPosition {
        *self.ack.lock().unwrap()
    }

    fn fits(&self, wp: BufferPosition, ack: BufferPosition, data: u64, desc: u64) -> bool {
        ack.data + self.data_capacity - wp.data >= data
            && ack.desc + self.desc_capacity - wp.desc >= desc
    }

    fn check_capacity(&self, data: u64, desc: u64) -> Result<(), CreditError> {
        if data > self.data_capacity || desc > self.desc_capacity {
            return Err(CreditError::CreditExhausted {
                data,
                desc,
                data_capacity: self.data_capacity,
                desc_capacity: self.desc_capacity,
            });
        }
        Ok(())
    }

    /// Producer advance: account `(data, desc)` written and, if it is our
    /// turn, publish the new write pointer through `send_update`.
    pub fn inc_write_pointers<F: FnMut(BufferPosition)>(
        &self,
        data: u64,
        desc: u64,
        mut send_update: F,
    ) {
        let mut wp = self.wp.lock().unwrap();
        wp.pos.data += data;
        wp.pos.desc += desc;
        if wp.our_turn {
            wp.our_turn = false;
            wp.sent = wp.pos;
            let update = wp.pos;
            drop(wp);
            send_update(update);
        }
    }

    /// Non-blocking space check.
    ///
    /// When space is missing and we hold the turn, a (possibly no-op)
    /// update is sent to solicit a fresh acknowledgement — otherwise a
    /// fully-written producer would wait for an ack that is never
    /// triggered.
    pub fn check_for_buffer_space<F: FnMut(BufferPosition)>(
        &self,
        data: u64,
        desc: u64,
        mut send_update: F,
    ) -> Result<bool, CreditError> {
        self.check_capacity(data, desc)?;
        let wp = self.write_position();
        let ack = self.acknowledged();
        if self.fits(wp, ack, data, desc) {
            return Ok(true);
        }
        self.solicit_ack(&mut send_update);
        Ok(false)
    }

    /// Blocking space wait: returns once
    /// `(acked + capacity) - written >= requested` on both axes.
    pub fn wait_for_buffer_space<F: FnMut(BufferPosition)>(
        &self,
        data: u64,
        desc: u64,
        mut send_update: F,
    ) -> Result<(), CreditError> {
        self.check_capacity(data, desc)?;
        let wp = self.write_position();
        loop {
            {
                let ack = self.ack.lock().unwrap();
                if self.fits(wp, *ack, data, desc) {
                    return Ok(());
                }
            }
            trace!(
                "credit wait: need ({data}, {desc}), wp=({}, {})",
                wp.data,
                wp.desc
            );
            self.solicit_ack(&mut send_update);
            let ack = self.ack.lock().unwrap();
            if !self.fits(wp, *ack, data, desc) {
                // bounded wait so a raced solicitation is retried
                let _ = self.ack_cond.wait_timeout(ack, WAIT_RESOLICIT).unwrap();
            }
        }
    }

    /// Sends an update soliciting an ack, if we hold the turn.
    fn solicit_ack<F: FnMut(BufferPosition)>(&self, send_update: &mut F) {
        let mut wp = self.wp.lock().unwrap();
        if wp.our_turn {
            wp.our_turn = false;
            wp.sent = wp.pos;
            let update = wp.pos;
            drop(wp);
            send_update(update);
        }
    }

    /// Periodic pointer sync: publish an outstanding write-pointer change
    /// (or the deferred final sentinel) when we hold the turn.
    pub fn try_sync<F: FnMut(BufferPosition)>(&self, mut send_update: F) {
        let mut wp = self.wp.lock().unwrap();
        if !wp.our_turn {
            return;
        }
        if wp.sent != wp.pos {
            wp.our_turn = false;
            wp.sent = wp.pos;
            let update = wp.pos;
            drop(wp);
            send_update(update);
        } else if wp.finalize && !wp.final_sent {
            wp.our_turn = false;
            wp.final_sent = true;
            drop(wp);
            send_update(BufferPosition::FINAL);
        }
    }

    /// Marks the window final: once every written byte has been announced,
    /// the final sentinel goes out (immediately if possible, otherwise on
    /// the next returned turn).
    pub fn finalize<F: FnMut(BufferPosition)>(&self, mut send_update: F) {
        let mut wp = self.wp.lock().unwrap();
        wp.finalize = true;
        if !wp.our_turn {
            return;
        }
        if wp.sent != wp.pos {
            wp.our_turn = false;
            wp.sent = wp.pos;
            let update = wp.pos;
            drop(wp);
            send_update(update);
        } else {
            wp.our_turn = false;
            wp.final_sent = true;
            drop(wp);
            debug!("sending final write pointer");
            send_update(BufferPosition::FINAL);
        }
    }

    /// Processes an inbound acknowledgement from the consumer.
    ///
    /// Advances the grant, wakes space waiters, and either sends the next
    /// pending update or takes the turn back.
    pub fn receive_ack<F: FnMut(BufferPosition)>(
        &self,
        pos: BufferPosition,
        mut send_update: F,
    ) -> Result<AckOutcome, CreditError> {
        if pos.is_final() {
            debug!("received final acknowledgement");
            return Ok(AckOutcome::Final);
        }
        {
            let mut ack = self.ack.lock().unwrap();
            // both cumulative cursors are monotone; a step back on either
            // axis is a peer bug
            if pos.desc < ack.desc || pos.data < ack.data {
                return Err(CreditError::AckRegression {
                    from_data: ack.data,
                    from_desc: ack.desc,
                    to_data: pos.data,
                    to_desc: pos.desc,
                });
            }
            *ack = pos;
            self.ack_cond.notify_all();
        }
        let mut wp = self.wp.lock().unwrap();
        if wp.sent != wp.pos {
            wp.sent = wp.pos;
            let update = wp.pos;
            drop(wp);
            send_update(update);
        } else if wp.finalize && !wp.final_sent {
            wp.final_sent = true;
            drop(wp);
            debug!("sending deferred final write pointer");
            send_update(BufferPosition::FINAL);
        } else {
            wp.our_turn = true;
        }
        Ok(AckOutcome::Advanced)
    }
}
