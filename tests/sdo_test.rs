//! SDO server conformance: expedited, segmented and block transfers against
//! the object dictionary, abort responses and the inactivity timeout.

mod common;

use canopen_node::od::{EntryAttr, OdAccess, OdEntry};
use canopen_node::sdo_server::SdoServerState;
use canopen_node::util::crc16_canopen_with_lut;
use canopen_node::{CanFrame, Canopen, CanopenConfig, ErrorCode, Od};
use common::{booted_node, deliver, MockCan};

const NODE_ID: u8 = 127;
const REQUEST_COB_ID: u32 = 0x600 + NODE_ID as u32;
const RESPONSE_COB_ID: u32 = 0x580 + NODE_ID as u32;

fn request(node: &mut Canopen<MockCan>, data: [u8; 8]) {
    deliver(node, CanFrame::new_padded(REQUEST_COB_ID, &data).unwrap());
}

fn last_response(node: &Canopen<MockCan>) -> [u8; 8] {
    let frame = node.can().sent.last().expect("no response frame sent");
    assert_eq!(frame.cob_id(), RESPONSE_COB_ID);
    assert_eq!(frame.dlc(), 8);
    frame.payload()
}

#[test]
fn expedited_upload_u32() {
    common::init_logging();

    let mut node = booted_node(NODE_ID);

    // Upload identity object product code (1018h:2) = 0xDEADBEEF.
    request(&mut node, [0x40, 0x18, 0x10, 0x02, 0, 0, 0, 0]);

    assert_eq!(node.can().sent.len(), 1);
    assert_eq!(
        last_response(&node),
        [0x43, 0x18, 0x10, 0x02, 0xEF, 0xBE, 0xAD, 0xDE]
    );
}

#[test]
fn expedited_upload_u8() {
    let mut node = booted_node(NODE_ID);

    // 1018h:0 (highest sub-index supported) = 4, one data byte, n = 3.
    request(&mut node, [0x40, 0x18, 0x10, 0x00, 0, 0, 0, 0]);

    assert_eq!(
        last_response(&node),
        [0x4F, 0x18, 0x10, 0x00, 0x04, 0x00, 0x00, 0x00]
    );
}

#[test]
fn expedited_upload_of_empty_entry() {
    let mut node = booted_node(NODE_ID);

    // 2002h starts as a 0-byte octet string: a valid 0-byte expedited
    // response, not an abort.
    request(&mut node, [0x40, 0x02, 0x20, 0x00, 0, 0, 0, 0]);

    assert_eq!(
        last_response(&node),
        [0x53, 0x02, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00]
    );
}

#[test]
fn block_upload_of_empty_entry_aborts() {
    let mut node = booted_node(NODE_ID);

    request(&mut node, [0xA4, 0x02, 0x20, 0x00, 0x7F, 0, 0, 0]);

    // 0x08000024 - no data available.
    assert_eq!(
        last_response(&node),
        [0x80, 0x02, 0x20, 0x00, 0x24, 0x00, 0x00, 0x08]
    );
    assert_eq!(node.sdo_servers()[0].state(), SdoServerState::Idle);
}

#[test]
fn upload_of_missing_object_aborts() {
    let mut node = booted_node(NODE_ID);

    // 1004h is not present in the dictionary.
    request(&mut node, [0x40, 0x04, 0x10, 0x00, 0, 0, 0, 0]);

    assert_eq!(
        last_response(&node),
        [0x80, 0x04, 0x10, 0x00, 0x00, 0x00, 0x02, 0x06]
    );
}

#[test]
fn upload_of_missing_subindex_aborts() {
    let mut node = booted_node(NODE_ID);

    request(&mut node, [0x40, 0x18, 0x10, 0x09, 0, 0, 0, 0]);

    // 0x06090011 - sub-index does not exist.
    assert_eq!(
        last_response(&node),
        [0x80, 0x18, 0x10, 0x09, 0x11, 0x00, 0x09, 0x06]
    );
}

#[test]
fn expedited_download_u16() {
    let mut node = booted_node(NODE_ID);

    // Write 1000 ms to the producer heartbeat time (1017h:0): two data
    // bytes, n = 2.
    request(&mut node, [0x2B, 0x17, 0x10, 0x00, 0xE8, 0x03, 0, 0]);

    assert_eq!(
        last_response(&node),
        [0x60, 0x17, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00]
    );
    assert_eq!(node.od_mut().read_u16(0x1017, 0).unwrap(), 1000);
}

#[test]
fn download_to_read_only_entry_aborts() {
    let mut node = booted_node(NODE_ID);

    request(&mut node, [0x23, 0x18, 0x10, 0x02, 1, 2, 3, 4]);

    // 0x06010002 - attempt to write a read only object.
    assert_eq!(
        last_response(&node),
        [0x80, 0x18, 0x10, 0x02, 0x02, 0x00, 0x01, 0x06]
    );
    assert_eq!(node.od_mut().read_u32(0x1018, 2).unwrap(), 0xDEADBEEF);
}

#[test]
fn upload_of_write_only_entry_aborts() {
    let mut node = booted_node(NODE_ID);

    request(&mut node, [0x40, 0x24, 0x10, 0x00, 0, 0, 0, 0]);

    // 0x06010001 - attempt to read a write only object.
    assert_eq!(
        last_response(&node),
        [0x80, 0x24, 0x10, 0x00, 0x01, 0x00, 0x01, 0x06]
    );
}

#[test]
fn download_outside_value_range_aborts() {
    let mut node = booted_node(NODE_ID);

    // 2001h is bounded to 10..=1000.
    request(&mut node, [0x2B, 0x01, 0x20, 0x00, 0x05, 0x00, 0, 0]);
    assert_eq!(
        last_response(&node),
        [0x80, 0x01, 0x20, 0x00, 0x32, 0x00, 0x09, 0x06]
    );

    request(&mut node, [0x2B, 0x01, 0x20, 0x00, 0xE9, 0x03, 0, 0]);
    assert_eq!(
        last_response(&node),
        [0x80, 0x01, 0x20, 0x00, 0x31, 0x00, 0x09, 0x06]
    );
}

#[test]
fn segmented_upload_of_string() {
    common::init_logging();

    let mut node = booted_node(NODE_ID);

    // 1008h holds "canopen-node" (12 bytes): segmented with announced size.
    request(&mut node, [0x40, 0x08, 0x10, 0x00, 0, 0, 0, 0]);
    assert_eq!(
        last_response(&node),
        [0x41, 0x08, 0x10, 0x00, 12, 0, 0, 0]
    );

    // First segment, toggle 0: 7 bytes, more to follow.
    request(&mut node, [0x60, 0, 0, 0, 0, 0, 0, 0]);
    let response = last_response(&node);
    assert_eq!(response[0], 0x00);
    assert_eq!(&response[1..], b"canopen");

    // Second segment, toggle 1: 5 bytes, c = 1, n = 2.
    request(&mut node, [0x70, 0, 0, 0, 0, 0, 0, 0]);
    let response = last_response(&node);
    assert_eq!(response[0], 0x15);
    assert_eq!(&response[1..6], b"-node");

    assert_eq!(node.sdo_servers()[0].state(), SdoServerState::Idle);
}

#[test]
fn upload_segment_toggle_violation_aborts() {
    let mut node = booted_node(NODE_ID);

    request(&mut node, [0x40, 0x08, 0x10, 0x00, 0, 0, 0, 0]);

    // Toggle must start at 0; 0x70 carries toggle 1.
    request(&mut node, [0x70, 0, 0, 0, 0, 0, 0, 0]);

    // 0x05030000 - toggle bit not alternated, mux of the open transfer.
    assert_eq!(
        last_response(&node),
        [0x80, 0x08, 0x10, 0x00, 0x00, 0x00, 0x03, 0x05]
    );
    assert_eq!(node.sdo_servers()[0].state(), SdoServerState::Idle);
}

#[test]
fn segmented_download() {
    let mut node = booted_node(NODE_ID);

    let payload = b"0123456789";

    // Initiate: segmented (e = 0), size indicated = 10, to 2002h:0.
    request(&mut node, [0x21, 0x02, 0x20, 0x00, 10, 0, 0, 0]);
    assert_eq!(
        last_response(&node),
        [0x60, 0x02, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00]
    );

    // Segment 1, toggle 0: 7 bytes.
    let mut segment = [0u8; 8];
    segment[0] = 0x00;
    segment[1..].copy_from_slice(&payload[..7]);
    request(&mut node, segment);
    assert_eq!(last_response(&node)[0], 0x20);

    // Segment 2, toggle 1: 3 bytes, c = 1, n = 4.
    let mut segment = [0u8; 8];
    segment[0] = 0x10 | (4 << 1) | 0x01;
    segment[1..4].copy_from_slice(&payload[7..]);
    request(&mut node, segment);
    assert_eq!(last_response(&node)[0], 0x30);

    let mut buf = [0u8; 32];
    let n = node.od_mut().read(0x2002, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], payload);
}

#[test]
fn segmented_download_size_mismatch_aborts() {
    let mut node = booted_node(NODE_ID);

    // Announce 10 bytes but terminate after one 7-byte segment.
    request(&mut node, [0x21, 0x02, 0x20, 0x00, 10, 0, 0, 0]);

    let mut segment = [0u8; 8];
    segment[0] = 0x01; // toggle 0, c = 1, n = 0
    request(&mut node, segment);

    // 0x06070010 - length of service parameter does not match.
    assert_eq!(
        last_response(&node),
        [0x80, 0x02, 0x20, 0x00, 0x10, 0x00, 0x07, 0x06]
    );
}

#[test]
fn segment_request_without_transfer_aborts() {
    let mut node = booted_node(NODE_ID);

    // Upload segment in idle state.
    request(&mut node, [0x60, 0, 0, 0, 0, 0, 0, 0]);

    // 0x05040001 - command specifier not valid or unknown.
    assert_eq!(
        last_response(&node),
        [0x80, 0x00, 0x00, 0x00, 0x01, 0x00, 0x04, 0x05]
    );
}

#[test]
fn unknown_ccs_aborts() {
    let mut node = booted_node(NODE_ID);

    request(&mut node, [0xE0, 0x00, 0x10, 0x00, 0, 0, 0, 0]);

    assert_eq!(
        last_response(&node),
        [0x80, 0x00, 0x10, 0x00, 0x01, 0x00, 0x04, 0x05]
    );
}

#[test]
fn abort_request_resets_transfer_silently() {
    let mut node = booted_node(NODE_ID);

    request(&mut node, [0x21, 0x02, 0x20, 0x00, 10, 0, 0, 0]);
    assert_eq!(node.sdo_servers()[0].state(), SdoServerState::Download);
    let sent_before = node.can().sent.len();

    // Client abort: back to idle, no response.
    request(
        &mut node,
        [0x80, 0x02, 0x20, 0x00, 0x00, 0x00, 0x04, 0x05],
    );

    assert_eq!(node.sdo_servers()[0].state(), SdoServerState::Idle);
    assert_eq!(node.can().sent.len(), sent_before);
}

#[test]
fn abort_response_round_trips() {
    let mut node = booted_node(NODE_ID);

    request(&mut node, [0x40, 0x04, 0x10, 0x00, 0, 0, 0, 0]);
    let response = last_response(&node);

    assert_eq!(response[0], 0x80);
    let index = u16::from_le_bytes([response[1], response[2]]);
    let subindex = response[3];
    let code = u32::from_le_bytes([response[4], response[5], response[6], response[7]]);

    assert_eq!(index, 0x1004);
    assert_eq!(subindex, 0);
    assert_eq!(code, 0x06020000);
}

#[test]
fn block_download() {
    common::init_logging();

    let mut node = booted_node(NODE_ID);

    let payload = b"0123456789";
    let crc = crc16_canopen_with_lut(payload);

    // Initiate: ccs 6, CRC supported, size indicated = 10, to 2002h:0.
    request(&mut node, [0xC6, 0x02, 0x20, 0x00, 10, 0, 0, 0]);
    assert_eq!(
        last_response(&node),
        [0xA4, 0x02, 0x20, 0x00, 0x7F, 0x00, 0x00, 0x00]
    );

    // Segment 1 of 2.
    let mut segment = [0u8; 8];
    segment[0] = 0x01;
    segment[1..].copy_from_slice(&payload[..7]);
    let sent_before = node.can().sent.len();
    request(&mut node, segment);
    // Intermediate segments are not acknowledged.
    assert_eq!(node.can().sent.len(), sent_before);

    // Segment 2 of 2, last.
    let mut segment = [0u8; 8];
    segment[0] = 0x82;
    segment[1..4].copy_from_slice(&payload[7..]);
    request(&mut node, segment);
    assert_eq!(
        last_response(&node),
        [0xA2, 0x02, 0x7F, 0x00, 0x00, 0x00, 0x00, 0x00]
    );

    // End of transfer: n = 4 unused bytes in the last segment, CRC.
    let mut end = [0u8; 8];
    end[0] = 0xC0 | (4 << 2) | 0x01;
    end[1..3].copy_from_slice(&crc.to_le_bytes());
    request(&mut node, end);
    assert_eq!(
        last_response(&node),
        [0xA1, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
    );

    let mut buf = [0u8; 32];
    let n = node.od_mut().read(0x2002, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], payload);
    assert_eq!(node.sdo_servers()[0].state(), SdoServerState::Idle);
}

#[test]
fn block_download_bad_sequence_aborts() {
    let mut node = booted_node(NODE_ID);

    request(&mut node, [0xC6, 0x02, 0x20, 0x00, 10, 0, 0, 0]);

    // First segment must carry sequence number 1.
    let mut segment = [0u8; 8];
    segment[0] = 0x02;
    request(&mut node, segment);

    // 0x05040003 - invalid sequence number.
    assert_eq!(
        last_response(&node),
        [0x80, 0x02, 0x20, 0x00, 0x03, 0x00, 0x04, 0x05]
    );
    assert_eq!(node.sdo_servers()[0].state(), SdoServerState::Idle);
}

#[test]
fn block_download_crc_mismatch_aborts() {
    let mut node = booted_node(NODE_ID);

    request(&mut node, [0xC6, 0x02, 0x20, 0x00, 3, 0, 0, 0]);

    let mut segment = [0u8; 8];
    segment[0] = 0x81;
    segment[1..4].copy_from_slice(b"abc");
    request(&mut node, segment);

    let mut end = [0u8; 8];
    end[0] = 0xC0 | (4 << 2) | 0x01;
    end[1..3].copy_from_slice(&0xBEEFu16.to_le_bytes());
    request(&mut node, end);

    // 0x05040004 - CRC error.
    assert_eq!(
        last_response(&node),
        [0x80, 0x02, 0x20, 0x00, 0x04, 0x00, 0x04, 0x05]
    );
}

#[test]
fn block_upload() {
    common::init_logging();

    let mut node = booted_node(NODE_ID);

    let expected = b"canopen-node";
    let crc = crc16_canopen_with_lut(expected);

    // Initiate: ccs 5, cs 0, CRC supported, block size 0x7F.
    request(&mut node, [0xA4, 0x08, 0x10, 0x00, 0x7F, 0, 0, 0]);
    assert_eq!(
        last_response(&node),
        [0xC6, 0x08, 0x10, 0x00, 12, 0, 0, 0]
    );

    // Start upload: the server streams both segments.
    let sent_before = node.can().sent.len();
    request(&mut node, [0xA3, 0, 0, 0, 0, 0, 0, 0]);
    let segments = &node.can().sent[sent_before..];
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].payload()[0], 0x01);
    assert_eq!(&segments[0].payload()[1..], b"canopen");
    assert_eq!(segments[1].payload()[0], 0x82);
    assert_eq!(&segments[1].payload()[1..6], b"-node");

    // Acknowledge both segments: n = 2 unused bytes, CRC over the data.
    request(&mut node, [0xA2, 0x02, 0x7F, 0, 0, 0, 0, 0]);
    let response = last_response(&node);
    assert_eq!(response[0], 0xC1 | (2 << 2));
    assert_eq!(u16::from_le_bytes([response[1], response[2]]), crc);

    assert_eq!(node.sdo_servers()[0].state(), SdoServerState::Idle);
}

#[test]
fn block_upload_invalid_block_size_aborts() {
    let mut node = booted_node(NODE_ID);

    request(&mut node, [0xA4, 0x08, 0x10, 0x00, 0x80, 0, 0, 0]);

    // 0x05040002 - invalid block size.
    assert_eq!(
        last_response(&node),
        [0x80, 0x08, 0x10, 0x00, 0x02, 0x00, 0x04, 0x05]
    );
}

#[test]
fn transfer_timeout_aborts() {
    common::init_logging();

    let config = CanopenConfig {
        sdo_timeout_ticks: 3,
        ..CanopenConfig::default()
    };
    let mut node = Canopen::new(common::test_od(), MockCan::new(), NODE_ID, config).unwrap();
    node.enable().unwrap();
    node.poll();
    node.can_mut().sent.clear();

    request(&mut node, [0x21, 0x02, 0x20, 0x00, 10, 0, 0, 0]);
    assert_eq!(node.sdo_servers()[0].state(), SdoServerState::Download);

    node.tick();
    node.tick();
    assert_eq!(node.sdo_servers()[0].state(), SdoServerState::Download);

    node.tick();

    // 0x05040000 - SDO protocol timed out.
    assert_eq!(
        last_response(&node),
        [0x80, 0x02, 0x20, 0x00, 0x00, 0x00, 0x04, 0x05]
    );
    assert_eq!(node.sdo_servers()[0].state(), SdoServerState::Idle);
}

#[test]
fn second_sdo_server_from_od() {
    common::init_logging();

    let od = Od::builder()
        .object(
            0x1018,
            vec![
                OdEntry::unsigned8(0, 4, EntryAttr::constant()),
                OdEntry::unsigned32(1, 0, EntryAttr::read_only()),
                OdEntry::unsigned32(2, 0xdeadbeef, EntryAttr::read_only()),
                OdEntry::unsigned32(3, 42, EntryAttr::read_only()),
                OdEntry::unsigned32(4, 1331, EntryAttr::read_only()),
            ],
        )
        .object(
            0x1201,
            vec![
                OdEntry::unsigned8(0, 2, EntryAttr::constant()),
                OdEntry::unsigned32(1, 0x640, EntryAttr::constant()),
                OdEntry::unsigned32(2, 0x5C0, EntryAttr::read_only()),
            ],
        )
        .build()
        .unwrap();

    let config = CanopenConfig {
        num_sdo_servers: 2,
        ..CanopenConfig::default()
    };
    let mut node = Canopen::new(od, MockCan::new(), NODE_ID, config).unwrap();
    node.enable().unwrap();
    node.poll();
    node.can_mut().sent.clear();

    assert_eq!(node.sdo_servers()[1].request_cob_id(), 0x640);
    assert_eq!(node.sdo_servers()[1].response_cob_id(), 0x5C0);

    deliver(
        &mut node,
        CanFrame::new_padded(0x640, &[0x40, 0x18, 0x10, 0x02]).unwrap(),
    );

    let frame = node.can().sent.last().unwrap();
    assert_eq!(frame.cob_id(), 0x5C0);
    assert_eq!(
        frame.payload(),
        [0x43, 0x18, 0x10, 0x02, 0xEF, 0xBE, 0xAD, 0xDE]
    );
}

#[test]
fn reset_node_rederives_relative_cob_ids() {
    common::init_logging();

    let node_id = 0x10;
    let od = Od::builder()
        .object(
            0x1018,
            vec![
                OdEntry::unsigned8(0, 4, EntryAttr::constant()),
                OdEntry::unsigned32(1, 0, EntryAttr::read_only()),
                OdEntry::unsigned32(2, 0xdeadbeef, EntryAttr::read_only()),
                OdEntry::unsigned32(3, 42, EntryAttr::read_only()),
                OdEntry::unsigned32(4, 1331, EntryAttr::read_only()),
            ],
        )
        .object(
            0x1201,
            vec![
                OdEntry::unsigned8(0, 2, EntryAttr::constant()),
                OdEntry::unsigned32(
                    1,
                    0x620,
                    EntryAttr::read_write().with_relative(true),
                ),
                OdEntry::unsigned32(
                    2,
                    0x5A0,
                    EntryAttr::read_write().with_relative(true),
                ),
            ],
        )
        .build()
        .unwrap();

    let config = CanopenConfig {
        num_sdo_servers: 2,
        ..CanopenConfig::default()
    };
    let mut node = Canopen::new(od, MockCan::new(), node_id, config).unwrap();
    node.enable().unwrap();
    node.poll();
    node.can_mut().sent.clear();

    // Raw bases resolved against the node-ID at construction.
    assert_eq!(node.sdo_servers()[1].request_cob_id(), 0x630);
    assert_eq!(node.sdo_servers()[1].response_cob_id(), 0x5B0);

    // Redirect the channel through an object callback; callbacks survive
    // the reset services, so the fix-up walk sees the new raw bases.
    node.od_mut()
        .set_callback(
            0x1201,
            Box::new(|_, entry, access| {
                if let OdAccess::Read(buf) = access {
                    match entry.subindex() {
                        1 => buf.copy_from_slice(&0x640u32.to_le_bytes()),
                        2 => buf.copy_from_slice(&0x5C0u32.to_le_bytes()),
                        _ => {}
                    }
                }
                Ok(())
            }),
        )
        .unwrap();

    node.nmt_mut().reset_node().unwrap();
    node.poll();

    // Reset application re-derived the node-ID-relative COB-IDs.
    assert_eq!(node.sdo_servers()[1].request_cob_id(), 0x650);
    assert_eq!(node.sdo_servers()[1].response_cob_id(), 0x5D0);

    // The receive filter set was re-registered for the new request COB-ID.
    assert!(node.can().filters.iter().any(|filter| filter.id == 0x650));

    // And the server answers on the re-bound pair.
    node.can_mut().sent.clear();
    deliver(
        &mut node,
        CanFrame::new_padded(0x650, &[0x40, 0x18, 0x10, 0x02]).unwrap(),
    );

    let frame = node.can().sent.last().unwrap();
    assert_eq!(frame.cob_id(), 0x5D0);
    assert_eq!(
        frame.payload(),
        [0x43, 0x18, 0x10, 0x02, 0xEF, 0xBE, 0xAD, 0xDE]
    );
}

#[test]
fn second_sdo_server_requires_od_parameters() {
    let config = CanopenConfig {
        num_sdo_servers: 2,
        ..CanopenConfig::default()
    };

    let result = Canopen::new(common::test_od(), MockCan::new(), NODE_ID, config);
    assert_eq!(
        result.err(),
        Some(ErrorCode::ObjectNotFound { index: 0x1201 })
    );
}
