//! The input-side endpoint of one timeslice-building connection.
//!
//! Owns the credit window towards one compute node and turns each
//! timeslice component into a chained remote write: payload (unsignaled),
//! then the component descriptor as a fenced, signaled commit record whose
//! completion id carries the timeslice index.

use crate::credit::{AckOutcome, CreditWindow};
use crate::error::{CreditError, TransportError};
use crate::transport::{ComputeNodeInfo, Endpoint, GatherWrite};
use crate::wrid::{RequestId, Verb};
use log::{debug, error, trace};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use tsipc::desc::{as_bytes, BufferPosition, MicrosliceDescriptor, TimesliceComponentDescriptor};

/// The input-node endpoint of a single `(input, compute)` connection.
pub struct InputChannelConnection {
    index: u16,
    input_index: u64,
    credit: CreditWindow,
    endpoint: OnceLock<Endpoint>,
    remote_info: OnceLock<ComputeNodeInfo>,
    max_pending_write_requests: u32,
    pending_write_requests: AtomicU32,
    done: AtomicBool,
    total_bytes_sent: AtomicU64,
    content_bytes_sent: AtomicU64,
    send_requests: AtomicU64,
}

impl InputChannelConnection {
    /// Creates the connection state for compute node `index`.
    ///
    /// The capacities must match the remote arenas; they are checked
    /// against the handshake reply.
    pub fn new(
        index: u16,
        input_index: u64,
        cn_data_buffer_size_exp: u32,
        cn_desc_buffer_size_exp: u32,
        max_pending_write_requests: u32,
    ) -> Self {
        Self {
            index,
            input_index,
            credit: CreditWindow::new(
                1u64 << cn_data_buffer_size_exp,
                1u64 << cn_desc_buffer_size_exp,
            ),
            endpoint: OnceLock::new(),
            remote_info: OnceLock::new(),
            max_pending_write_requests,
            pending_write_requests: AtomicU32::new(0),
            done: AtomicBool::new(false),
            total_bytes_sent: AtomicU64::new(0),
            content_bytes_sent: AtomicU64::new(0),
            send_requests: AtomicU64::new(0),
        }
    }

    /// The connection index (= target compute node index).
    pub fn index(&self) -> u16 {
        self.index
    }

    /// True once the final acknowledgement arrived.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Total bytes posted on this connection.
    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent.load(Ordering::Relaxed)
    }

    /// Payload bytes posted on this connection (without pointer updates).
    pub fn content_bytes_sent(&self) -> u64 {
        self.content_bytes_sent.load(Ordering::Relaxed)
    }

    /// Send work requests posted on this connection.
    pub fn send_requests(&self) -> u64 {
        self.send_requests.load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------------
    // CONNECTION LIFE CYCLE
    // ---------------------------------------------------------------------

    /// Installs the endpoint and remote arena info after the handshake,
    /// and arms the first acknowledgement receive.
    pub fn on_established(&self, endpoint: Endpoint, reply_private_data: &[u8]) {
        match ComputeNodeInfo::decode(reply_private_data) {
            Some(info) => {
                debug!(
                    "[i{}] [{}] connection established, remote arenas 2^{} / 2^{}",
                    self.input_index, self.index, info.data_buffer_size_exp,
                    info.desc_buffer_size_exp
                );
                if 1u64 << info.data_buffer_size_exp != self.credit.data_capacity()
                    || 1u64 << info.desc_buffer_size_exp != self.credit.desc_capacity()
                {
                    error!(
                        "[i{}] [{}] remote arena geometry differs from configuration",
                        self.input_index, self.index
                    );
                }
                let _ = self.remote_info.set(info);
            }
            None => {
                error!(
                    "[i{}] [{}] malformed private data in connection reply",
                    self.input_index, self.index
                );
            }
        }
        endpoint.post_recv(RequestId::pack(Verb::ReceiveAck, self.index, 0));
        let _ = self.endpoint.set(endpoint);
    }

    /// Marks the window final; the sentinel goes out once all pointer
    /// updates are through.
    pub fn finalize(&self) {
        debug!("[i{}] [{}] finalize", self.input_index, self.index);
        self.credit.finalize(|pos| self.post_write_pointer(pos));
    }

    /// Initiates disconnection.
    pub fn disconnect(&self) {
        if let Some(endpoint) = self.endpoint.get() {
            endpoint.disconnect();
        }
    }

    // ---------------------------------------------------------------------
    // SEND PATH
    // ---------------------------------------------------------------------

    /// True while another write chain may be posted without overflowing
    /// the send queue.
    pub fn write_request_available(&self) -> bool {
        self.pending_write_requests.load(Ordering::Acquire) < self.max_pending_write_requests
    }

    /// Bytes needed to advance to the next arena start if `size` would
    /// cross the remote data-arena wrap; zero otherwise.
    pub fn skip_required(&self, size: u64) -> u64 {
        let wp = self.credit.write_position();
        let capacity = self.credit.data_capacity();
        let tail = capacity - (wp.data & (capacity - 1));
        if size > tail {
            tail
        } else {
            0
        }
    }

    /// Non-blocking credit check for `(data_size, desc_size)`.
    pub fn check_for_buffer_space(
        &self,
        data_size: u64,
        desc_size: u64,
    ) -> Result<bool, CreditError> {
        self.credit
            .check_for_buffer_space(data_size, desc_size, |pos| self.post_write_pointer(pos))
    }

    /// Blocking credit wait for `(data_size, desc_size)`.
    pub fn wait_for_buffer_space(
        &self,
        data_size: u64,
        desc_size: u64,
    ) -> Result<(), CreditError> {
        self.credit
            .wait_for_buffer_space(data_size, desc_size, |pos| self.post_write_pointer(pos))
    }

    /// Posts one timeslice component as a chained write.
    ///
    /// `data_segments` are the payload pieces, `desc_segments` the
    /// microslice-descriptor table pieces (both already split around the
    /// local ring wraps). The component lands contiguously at the remote
    /// write position advanced by `skip`.
    pub fn send_data(
        &self,
        data_segments: &[&[u8]],
        desc_segments: &[&[u8]],
        timeslice: u64,
        mc_length: u64,
        data_length: u64,
        skip: u64,
    ) -> Result<(), TransportError> {
        let endpoint = self.endpoint.get().ok_or(TransportError::Down)?;
        let info = self.remote_info.get().ok_or(TransportError::Down)?;

        let wp = self.credit.write_position();
        let data_capacity = self.credit.data_capacity();
        let desc_capacity = self.credit.desc_capacity();
        let target = wp.data + skip;

        let descriptor = TimesliceComponentDescriptor {
            ts_num: timeslice,
            offset: target,
            size: data_length + mc_length * std::mem::size_of::<MicrosliceDescriptor>() as u64,
            num_microslices: mc_length,
        };

        trace!(
            "[i{}] [{}] post write chain for timeslice {} ({} bytes at {})",
            self.input_index,
            self.index,
            timeslice,
            descriptor.size,
            target
        );

        // the component's gather list: payload first, then the microslice
        // descriptor table
        let mut gather: Vec<&[u8]> = Vec::with_capacity(4);
        gather.extend_from_slice(data_segments);
        gather.extend_from_slice(desc_segments);
        let total: u64 = gather.iter().map(|s| s.len() as u64).sum();
        debug_assert_eq!(total, descriptor.size);

        let mut chain: Vec<GatherWrite<'_>> = Vec::with_capacity(3);
        let tail = data_capacity - (target & (data_capacity - 1));
        if total <= tail {
            chain.push(GatherWrite {
                wr_id: RequestId::pack(Verb::WriteData, self.index, timeslice),
                region: info.data_handle,
                remote_offset: target & (data_capacity - 1),
                segments: gather,
                signaled: false,
                fence: false,
            });
        } else {
            // split around the remote wrap; unreachable while the skip
            // rule is in force, kept for the non-skipping layout
            let (head, wrap) = split_segments(&gather, tail);
            chain.push(GatherWrite {
                wr_id: RequestId::pack(Verb::WriteData, self.index, timeslice),
                region: info.data_handle,
                remote_offset: target & (data_capacity - 1),
                segments: head,
                signaled: false,
                fence: false,
            });
            chain.push(GatherWrite {
                wr_id: RequestId::pack(Verb::WriteDataWrap, self.index, timeslice),
                region: info.data_handle,
                remote_offset: 0,
                segments: wrap,
                signaled: false,
                fence: false,
            });
        }

        // the commit record: fenced so every payload byte is visible
        // before the descriptor, signaled so the completion identifies
        // the timeslice
        let descriptor_bytes = as_bytes(&descriptor);
        chain.push(GatherWrite {
            wr_id: RequestId::pack(Verb::WriteDesc, self.index, timeslice),
            region: info.desc_handle,
            remote_offset: (wp.desc & (desc_capacity - 1))
                * std::mem::size_of::<TimesliceComponentDescriptor>() as u64,
            segments: vec![descriptor_bytes],
            signaled: true,
            fence: true,
        });

        self.pending_write_requests.fetch_add(1, Ordering::AcqRel);
        endpoint.post_write_chain(&chain)?;

        self.send_requests
            .fetch_add(chain.len() as u64, Ordering::Relaxed);
        self.content_bytes_sent
            .fetch_add(data_length, Ordering::Relaxed);
        self.total_bytes_sent.fetch_add(
            descriptor.size + std::mem::size_of::<TimesliceComponentDescriptor>() as u64,
            Ordering::Relaxed,
        );
        Ok(())
    }

    /// Advances the credit window after a posted chain.
    pub fn inc_write_pointers(&self, data_size: u64, desc_size: u64) {
        self.credit
            .inc_write_pointers(data_size, desc_size, |pos| self.post_write_pointer(pos));
    }

    /// Publishes an outstanding pointer update, if any and it is our turn.
    pub fn try_sync_buffer_positions(&self) {
        self.credit.try_sync(|pos| self.post_write_pointer(pos));
    }

    // ---------------------------------------------------------------------
    // COMPLETION HANDLERS (called from the completion pump)
    // ---------------------------------------------------------------------

    /// A descriptor write completed.
    pub fn on_complete_write(&self) {
        self.pending_write_requests.fetch_sub(1, Ordering::AcqRel);
    }

    /// An acknowledgement arrived; returns true when this connection just
    /// transitioned to done.
    pub fn on_complete_recv(&self, payload: [u8; 16]) -> Result<bool, CreditError> {
        let pos = BufferPosition::from_bytes(&payload);
        if !pos.is_final() {
            // re-arm before processing, the peer may answer immediately
            if let Some(endpoint) = self.endpoint.get() {
                endpoint.post_recv(RequestId::pack(Verb::ReceiveAck, self.index, 0));
            }
        }
        match self
            .credit
            .receive_ack(pos, |update| self.post_write_pointer(update))?
        {
            AckOutcome::Final => {
                self.done.store(true, Ordering::Release);
                Ok(true)
            }
            AckOutcome::Advanced => Ok(false),
        }
    }

    fn post_write_pointer(&self, pos: BufferPosition) {
        if let Some(endpoint) = self.endpoint.get() {
            endpoint.post_send(
                RequestId::pack(Verb::SendWritePointer, self.index, 0),
                pos.to_bytes(),
                true,
            );
            self.send_requests.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Splits a gather list after `cut` bytes.
fn split_segments<'a>(segments: &[&'a [u8]], cut: u64) -> (Vec<&'a [u8]>, Vec<&'a [u8]>) {
    let mut head = Vec::with_capacity(segments.len());
    let mut wrap = Vec::with_capacity(segments.len());
    let mut remaining = cut as usize;
    for segment in segments {
        if remaining >= segment.len() {
            head.push(*segment);
            remaining -= segment.len();
        } else if remaining > 0 {
            head.push(&segment[..remaining]);
            wrap.push(&segment[remaining..]);
            remaining = 0;
        } else {
            wrap.push(*segment);
        }
    }
    (head, wrap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_required_boundaries() {
        // capacity 2^10 = 1024 bytes
        let conn = InputChannelConnection::new(0, 0, 10, 4, 8);
        // fresh connection: everything fits
        assert_eq!(conn.skip_required(1024), 0);

        // advance write position to 1000: 24 bytes of tail remain
        conn.inc_write_pointers(1000, 1);
        assert_eq!(conn.skip_required(24), 0); // exactly the tail: no skip
        assert_eq!(conn.skip_required(25), 24); // one byte more: skip the tail
        assert_eq!(conn.skip_required(1), 0);
    }

    #[test]
    fn test_split_segments() {
        let a = [1u8, 2, 3, 4];
        let b = [5u8, 6, 7];
        let (head, wrap) = split_segments(&[&a, &b], 5);
        assert_eq!(head, vec![&a[..], &b[..1]]);
        assert_eq!(wrap, vec![&b[1..]]);

        let (head, wrap) = split_segments(&[&a, &b], 4);
        assert_eq!(head, vec![&a[..]]);
        assert_eq!(wrap, vec![&b[..]]);
    }

    #[test]
    fn test_pending_write_request_accounting() {
        let conn = InputChannelConnection::new(0, 0, 10, 4, 2);
        assert!(conn.write_request_available());
        conn.pending_write_requests.store(2, Ordering::Relaxed);
        assert!(!conn.write_request_available());
        conn.on_complete_write();
        assert!(conn.write_request_available());
    }
}
