//! Shared test fixtures: a mock CAN driver with controllable transmit
//! completions and a small CiA 301-shaped object dictionary.

#![allow(dead_code)]

use std::collections::VecDeque;

use canopen_node::od::{EntryAttr, OdEntry};
use canopen_node::{
    CanFilter, CanFrame, CanInterface, Canopen, CanopenConfig, ErrorCode, Od, TxCompletion,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Mock CAN driver: records sent frames, serves injected frames to
/// `receive` and can withhold transmit completions to emulate a bus that
/// does not acknowledge.
#[derive(Default)]
pub struct MockCan {
    pub sent: Vec<CanFrame>,
    pub rx: VecDeque<CanFrame>,
    pub filters: Vec<CanFilter>,
    pub hold_completions: bool,
    pub fail_sends: bool,
    pending: Vec<TxCompletion>,
}

impl MockCan {
    pub fn new() -> Self {
        MockCan::default()
    }

    pub fn inject(&mut self, frame: CanFrame) {
        self.rx.push_back(frame);
    }

    /// Fire all withheld transmit completions with success.
    pub fn complete_pending(&mut self) {
        for callback in self.pending.drain(..) {
            callback(Ok(()));
        }
    }

    /// Fire all withheld transmit completions with an error.
    pub fn fail_pending(&mut self) {
        for callback in self.pending.drain(..) {
            callback(Err(ErrorCode::Transport));
        }
    }

    pub fn pending_completions(&self) -> usize {
        self.pending.len()
    }
}

impl CanInterface for MockCan {
    fn send(
        &mut self,
        frame: &CanFrame,
        on_complete: Option<TxCompletion>,
    ) -> Result<(), ErrorCode> {
        if self.fail_sends {
            return Err(ErrorCode::Transport);
        }

        self.sent.push(*frame);

        if let Some(callback) = on_complete {
            if self.hold_completions {
                self.pending.push(callback);
            } else {
                callback(Ok(()));
            }
        }

        Ok(())
    }

    fn receive(&mut self) -> nb::Result<CanFrame, ErrorCode> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn add_filter(&mut self, filter: &CanFilter) -> Result<(), ErrorCode> {
        self.filters.push(*filter);
        Ok(())
    }
}

/// A dictionary with the communication-profile objects the tests exercise.
pub fn test_od() -> Od {
    Od::builder()
        // 1000h - Device type
        .variable(0x1000, OdEntry::unsigned32(0, 0, EntryAttr::read_only()))
        // 1001h - Error register
        .variable(0x1001, OdEntry::unsigned8(0, 0, EntryAttr::read_only()))
        // 1008h - Manufacturer device name
        .variable(
            0x1008,
            OdEntry::visible_string(0, "canopen-node", 16, EntryAttr::constant()),
        )
        // 1017h - Producer heartbeat time
        .variable(
            0x1017,
            OdEntry::unsigned16(0, 0, EntryAttr::read_write()),
        )
        // 1018h - Identity object
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
        // 1024h - OS command mode
        .variable(0x1024, OdEntry::unsigned8(0, 0, EntryAttr::write_only()))
        // 1200h - SDO server parameter
        .object(
            0x1200,
            vec![
                OdEntry::unsigned8(0, 2, EntryAttr::constant()),
                OdEntry::unsigned32(
                    1,
                    0x600,
                    EntryAttr::constant().with_relative(true),
                ),
                OdEntry::unsigned32(
                    2,
                    0x580,
                    EntryAttr::read_only().with_relative(true),
                ),
            ],
        )
        // 2000h - Manufacturer scratch word
        .variable(
            0x2000,
            OdEntry::unsigned32(0, 0, EntryAttr::read_write()),
        )
        // 2001h - Bounded parameter
        .variable(
            0x2001,
            OdEntry::unsigned16(0, 100, EntryAttr::read_write())
                .with_min(10u16)
                .with_max(1000u16),
        )
        // 2002h - Manufacturer data buffer
        .variable(
            0x2002,
            OdEntry::octet_string(0, &[], 32, EntryAttr::read_write()),
        )
        .build()
        .unwrap()
}

pub fn test_node(node_id: u8) -> Canopen<MockCan> {
    Canopen::new(test_od(), MockCan::new(), node_id, CanopenConfig::default()).unwrap()
}

/// A node driven through its boot-up sequence into Pre-operational, with
/// the boot-up frame cleared from the transmit log.
pub fn booted_node(node_id: u8) -> Canopen<MockCan> {
    let mut node = test_node(node_id);
    node.enable().unwrap();
    node.poll();

    assert_eq!(node.nmt().state(), canopen_node::NmtState::PreOperational);
    node.can_mut().sent.clear();

    node
}

/// Inject a frame and run the receive dispatch plus the workers.
pub fn deliver(node: &mut Canopen<MockCan>, frame: CanFrame) {
    node.can_mut().inject(frame);
    node.process_one_frame();
    node.poll();
}
