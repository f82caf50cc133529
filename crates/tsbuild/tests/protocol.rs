//! Protocol-level tests of a single `(input, compute)` connection pair:
//! the commit protocol (payload writes fenced by the descriptor write),
//! the pointer-update echo, and the finalize handshake.

#![cfg(unix)]

use crossbeam_channel::{unbounded, Receiver};
use tsbuild::compute::ComputeNodeConnection;
use tsbuild::input::InputChannelConnection;
use tsbuild::transport::{CmEvent, Completion, ComputeNodeInfo, InputNodeInfo, Network};
use tsbuild::wrid::{RequestId, Verb};
use tsipc::desc::{BufferPosition, TimesliceComponentDescriptor};
use wrapring::RingBufferView;

const DATA_EXP: u32 = 12; // 4 KiB data arena
const DESC_EXP: u32 = 4; // 16 descriptor entries

struct Rig {
    input_conn: InputChannelConnection,
    compute_conn: ComputeNodeConnection,
    input_cq: Receiver<Completion>,
    compute_cq: Receiver<Completion>,
    data_arena: Vec<u8>,
    desc_arena: Vec<TimesliceComponentDescriptor>,
}

/// Performs a full handshake between one input connection and one compute
/// connection over a fresh loopback fabric.
fn connect(port: u16) -> Rig {
    let network = Network::new();
    let (input_cq_tx, input_cq) = unbounded();
    let (input_cm_tx, input_cm) = unbounded();
    let (compute_cq_tx, compute_cq) = unbounded();
    let (compute_cm_tx, compute_cm) = unbounded();

    let mut data_arena = vec![0u8; 1 << DATA_EXP];
    let mut desc_arena = vec![TimesliceComponentDescriptor::default(); 1 << DESC_EXP];

    network.listen(port, compute_cm_tx.clone());

    let input_conn = InputChannelConnection::new(0, 0, DATA_EXP, DESC_EXP, 8);
    network.connect(
        port,
        0,
        InputNodeInfo { index: 0 }.encode(),
        input_cq_tx,
        input_cm_tx,
    );

    // accepting side
    let request = loop {
        match compute_cm.recv().unwrap() {
            CmEvent::ConnectRequest(request) => break request,
            _ => continue,
        }
    };
    let data_handle = network.register_region(data_arena.as_mut_ptr(), data_arena.len());
    let desc_handle = network.register_region(
        desc_arena.as_mut_ptr().cast::<u8>(),
        desc_arena.len() * std::mem::size_of::<TimesliceComponentDescriptor>(),
    );
    let reply = ComputeNodeInfo {
        index: 0,
        data_buffer_size_exp: DATA_EXP as u8,
        desc_buffer_size_exp: DESC_EXP as u8,
        data_handle,
        desc_handle,
    };
    let endpoint = request.accept(0, reply.encode(), compute_cq_tx, compute_cm_tx);
    let desc_view =
        unsafe { RingBufferView::new(desc_arena.as_mut_ptr(), DESC_EXP) }.unwrap();
    let compute_conn = ComputeNodeConnection::new(0, 0, endpoint, desc_view);

    // initiating side
    loop {
        match input_cm.recv().unwrap() {
            CmEvent::Established {
                private_data,
                endpoint: Some(endpoint),
                ..
            } => {
                input_conn.on_established(endpoint, &private_data);
                break;
            }
            _ => continue,
        }
    }

    Rig {
        input_conn,
        compute_conn,
        input_cq,
        compute_cq,
        data_arena,
        desc_arena,
    }
}

fn expect_verb(cq: &Receiver<Completion>, verb: Verb) -> Completion {
    let completion = cq.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
    let id = RequestId::unpack(completion.wr_id).unwrap();
    assert_eq!(id.verb, verb, "unexpected completion verb");
    completion
}

#[test]
fn test_commit_protocol_roundtrip() {
    let rig = connect(23001);

    // one component: 24 payload bytes + one 32-byte descriptor entry
    let payload_a = [0x11u8; 16];
    let payload_b = [0x22u8; 8];
    let table = [0x33u8; 32]; // stands in for the microslice table
    let total = 24 + 32;

    assert!(rig.input_conn.check_for_buffer_space(total, 1).unwrap());
    rig.input_conn
        .send_data(&[&payload_a, &payload_b], &[&table], 0, 1, 24, 0)
        .unwrap();
    rig.input_conn.inc_write_pointers(total, 1);

    // the commit record's completion identifies the timeslice
    let completion = expect_verb(&rig.input_cq, Verb::WriteDesc);
    assert_eq!(RequestId::unpack(completion.wr_id).unwrap().timeslice, 0);
    // pointer update was sent on the spot (fresh turn)
    expect_verb(&rig.input_cq, Verb::SendWritePointer);

    // payload and table landed back to back in the data arena
    assert_eq!(&rig.data_arena[..16], &payload_a);
    assert_eq!(&rig.data_arena[16..24], &payload_b);
    assert_eq!(&rig.data_arena[24..56], &table);
    // the commit record is in place
    let descriptor = rig.desc_arena[0];
    assert_eq!(descriptor.ts_num, 0);
    assert_eq!(descriptor.offset, 0);
    assert_eq!(descriptor.size, total);
    assert_eq!(descriptor.num_microslices, 1);

    // compute side observes the update and echoes its ack
    let completion = expect_verb(&rig.compute_cq, Verb::ReceiveWritePointer);
    rig.compute_conn
        .on_complete_recv(completion.recv_payload.unwrap());
    assert_eq!(
        rig.compute_conn.write_pointer(),
        BufferPosition {
            data: total,
            desc: 1
        }
    );
    expect_verb(&rig.compute_cq, Verb::SendAck);

    // the input processes the (zero) ack without a protocol error
    let completion = expect_verb(&rig.input_cq, Verb::ReceiveAck);
    let done = rig
        .input_conn
        .on_complete_recv(completion.recv_payload.unwrap())
        .unwrap();
    assert!(!done);
}

#[test]
fn test_finalize_with_zero_writes_yields_one_final_ack() {
    let rig = connect(23002);

    rig.input_conn.finalize();
    // nothing was written: the final sentinel goes out immediately
    expect_verb(&rig.input_cq, Verb::SendWritePointer);

    let completion = expect_verb(&rig.compute_cq, Verb::ReceiveWritePointer);
    let payload = completion.recv_payload.unwrap();
    assert!(BufferPosition::from_bytes(&payload).is_final());
    rig.compute_conn.on_complete_recv(payload);
    assert!(rig.compute_conn.final_received());

    // the node answers with exactly one final acknowledgement
    rig.compute_conn.send_final_ack();
    expect_verb(&rig.compute_cq, Verb::SendFinalize);
    rig.compute_conn.on_complete_send_finalize();
    assert!(rig.compute_conn.is_done());

    let completion = expect_verb(&rig.input_cq, Verb::ReceiveAck);
    let done = rig
        .input_conn
        .on_complete_recv(completion.recv_payload.unwrap())
        .unwrap();
    assert!(done);
    assert!(rig.input_conn.is_done());

    // no further acknowledgement follows
    assert!(rig
        .input_cq
        .recv_timeout(std::time::Duration::from_millis(100))
        .is_err());
}

#[test]
fn test_skip_places_component_at_arena_start() {
    let rig = connect(23003);

    // fill most of the arena so the next component would cross the wrap
    let filler = vec![0u8; (1 << DATA_EXP) - 64];
    let table = [0xAAu8; 32];
    let total = filler.len() as u64 + 32;
    rig.input_conn
        .send_data(&[filler.as_slice()], &[&table], 0, 1, filler.len() as u64, 0)
        .unwrap();
    rig.input_conn.inc_write_pointers(total, 1);
    expect_verb(&rig.input_cq, Verb::WriteDesc);

    // 32 bytes of tail remain; a 40-byte component needs a skip
    let skip = rig.input_conn.skip_required(40);
    assert_eq!(skip, 32);
    // a 32-byte component does not
    assert_eq!(rig.input_conn.skip_required(32), 0);

    let payload = [0xBBu8; 8];
    rig.input_conn
        .send_data(&[&payload], &[&table], 1, 1, 8, skip)
        .unwrap();
    rig.input_conn.inc_write_pointers(40 + skip, 1);

    // the second component starts at offset zero of the next pass
    assert_eq!(&rig.data_arena[..8], &payload);
    let descriptor = rig.desc_arena[1];
    assert_eq!(descriptor.ts_num, 1);
    assert_eq!(descriptor.offset & ((1 << DATA_EXP) - 1), 0);
    assert_eq!(descriptor.size, 40);
}
