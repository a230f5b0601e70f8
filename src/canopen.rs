//! CANopen protocol façade: one Object Dictionary, one NMT FSA and one or
//! more SDO servers bound to a single CAN interface.

use core::cell::Cell;

use crate::error::ErrorCode;
use crate::frame::{CanFrame, CanInterface, COB_ID_FRAME_FLAG, COB_ID_NMT_NODE_CONTROL};
use crate::nmt::{Nmt, NmtState, DEFAULT_EVENT_QUEUE_CAPACITY};
use crate::od::Od;
use crate::prelude::*;
use crate::sdo_server::{SdoServer, DEFAULT_REQUEST_QUEUE_CAPACITY, DEFAULT_TIMEOUT_TICKS};
use crate::{error, info};

/// Base index of the SDO server communication parameter objects.
const SDO_SERVER_PARAMETER_BASE: u16 = 0x1200;

/// Stack configuration. The defaults serve a single-SDO-server node.
#[derive(Debug, Clone, Copy)]
pub struct CanopenConfig {
    /// Number of SDO servers (1 to 128). Servers beyond the first require
    /// matching `0x1200 + (n - 1)` objects in the dictionary.
    pub num_sdo_servers: u8,
    /// NMT event queue capacity.
    pub nmt_event_queue_capacity: usize,
    /// SDO request queue capacity per server.
    pub sdo_request_queue_capacity: usize,
    /// SDO inactivity timeout in [`Canopen::tick`] periods.
    pub sdo_timeout_ticks: u32,
}

impl Default for CanopenConfig {
    fn default() -> Self {
        CanopenConfig {
            num_sdo_servers: 1,
            nmt_event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            sdo_request_queue_capacity: DEFAULT_REQUEST_QUEUE_CAPACITY,
            sdo_timeout_ticks: DEFAULT_TIMEOUT_TICKS,
        }
    }
}

/// The assembled protocol stack for one local node.
pub struct Canopen<CAN: CanInterface> {
    can: CAN,
    od: Od,
    nmt: Nmt,
    sdo_servers: Vec<SdoServer>,
    node_id: u8,
    /// Set by the NMT reset entry actions; consumed by `poll` to run the
    /// relative COB-ID fix-up.
    relative_fixup: Rc<Cell<bool>>,
}

impl<CAN: CanInterface> Canopen<CAN> {
    /// Initialise the stack: validates the node-ID, sets up the NMT FSA and
    /// the SDO servers (drawing COB-IDs for servers beyond the first from
    /// the dictionary) and registers the receive filters with the driver.
    pub fn new(
        mut od: Od,
        mut can: CAN,
        node_id: u8,
        config: CanopenConfig,
    ) -> Result<Self, ErrorCode> {
        let mut nmt = Nmt::new(node_id, config.nmt_event_queue_capacity)?;

        // The reset services restore OD defaults; flag every pass through
        // the reset states so poll() re-derives the COB-IDs that depend on
        // relative dictionary entries.
        let relative_fixup = Rc::new(Cell::new(false));
        let fixup = Rc::clone(&relative_fixup);
        nmt.add_state_callback(move |state, _| {
            if matches!(
                state,
                NmtState::ResetApplication | NmtState::ResetCommunication
            ) {
                fixup.set(true);
            }
        });

        let mut sdo_servers = Vec::with_capacity(config.num_sdo_servers as usize);
        for n in 1..=config.num_sdo_servers {
            let mut server = SdoServer::new(n, node_id)?;
            server.set_request_queue_capacity(config.sdo_request_queue_capacity);
            server.set_timeout_ticks(config.sdo_timeout_ticks);

            if n > 1 {
                let (request, response) = sdo_cob_ids_from_od(&mut od, node_id, n)?;
                server.set_cob_ids(request, response);
            }

            sdo_servers.push(server);
        }

        can.add_filter(&nmt.filter())?;
        for server in &sdo_servers {
            can.add_filter(&server.filter())?;
        }

        info!(
            "CANopen node {} initialised with {} SDO server(s)",
            node_id,
            sdo_servers.len()
        );

        Ok(Canopen {
            can,
            od,
            nmt,
            sdo_servers,
            node_id,
            relative_fixup,
        })
    }

    /// Start the boot-up sequence by posting the power-on event to the NMT
    /// FSA. Call [`Canopen::poll`] afterwards to drive it.
    pub fn enable(&mut self) -> Result<(), ErrorCode> {
        self.nmt.enable()
    }

    /// Fetch one received frame from the driver, if any, and dispatch it to
    /// the owning component's queue by COB-ID.
    pub fn process_one_frame(&mut self) {
        let frame = match self.can.receive() {
            Ok(frame) => frame,
            Err(nb::Error::WouldBlock) => return,
            Err(nb::Error::Other(err)) => {
                error!("failed to receive CAN frame ({:?})", err);
                return;
            }
        };

        self.dispatch(&frame);
    }

    /// Dispatch an already-received frame (for drivers delivering frames by
    /// callback rather than polling).
    pub fn dispatch(&mut self, frame: &CanFrame) {
        let cob_id = frame.cob_id();

        if cob_id == COB_ID_NMT_NODE_CONTROL {
            self.nmt.handle_node_control(frame);
            return;
        }

        for server in &mut self.sdo_servers {
            if cob_id == server.request_cob_id() {
                if let Err(err) = server.handle_request(frame) {
                    error!(
                        "SDO server {} dropped request ({:?})",
                        server.sdo_number(),
                        err
                    );
                }
                return;
            }
        }
    }

    /// Run every component's worker: drain the NMT event queue and each SDO
    /// server's request queue. A reset drained here triggers the relative
    /// COB-ID fix-up before the SDO servers run.
    pub fn poll(&mut self) {
        self.nmt.poll(&mut self.can, &mut self.od);

        if self.relative_fixup.take() {
            self.rebind_sdo_servers();
        }

        for server in &mut self.sdo_servers {
            server.poll(&mut self.can, &mut self.od);
        }
    }

    /// The reset entry actions restored OD defaults: walk the SDO servers,
    /// re-derive the COB-IDs drawn from relative dictionary entries and
    /// re-register the receive filters.
    fn rebind_sdo_servers(&mut self) {
        for server in &mut self.sdo_servers {
            let n = server.sdo_number();

            if n > 1 {
                match sdo_cob_ids_from_od(&mut self.od, self.node_id, n) {
                    Ok((request, response)) => server.set_cob_ids(request, response),
                    Err(err) => {
                        error!(
                            "failed to re-derive SDO server {} COB-IDs ({:?})",
                            n, err
                        );
                        continue;
                    }
                }
            }

            if let Err(err) = self.can.add_filter(&server.filter()) {
                error!("failed to re-register SDO server {} CAN filter ({:?})", n, err);
            }
        }
    }

    /// Drive the SDO inactivity timeouts. Call at a fixed period.
    pub fn tick(&mut self) {
        for server in &mut self.sdo_servers {
            server.tick(&mut self.can);
        }
    }

    pub fn od(&self) -> &Od {
        &self.od
    }

    pub fn od_mut(&mut self) -> &mut Od {
        &mut self.od
    }

    pub fn nmt(&self) -> &Nmt {
        &self.nmt
    }

    pub fn nmt_mut(&mut self) -> &mut Nmt {
        &mut self.nmt
    }

    pub fn sdo_servers(&self) -> &[SdoServer] {
        &self.sdo_servers
    }

    pub fn can(&self) -> &CAN {
        &self.can
    }

    pub fn can_mut(&mut self) -> &mut CAN {
        &mut self.can
    }
}

/// Resolve the COB-ID pair of SDO server `n` (n >= 2) from its communication
/// parameter object at `0x1200 + (n - 1)`: sub-index 1 is client-to-server,
/// sub-index 2 is server-to-client. Values flagged node-ID-relative in the
/// dictionary are resolved against the node-ID here, at the CAN layer.
fn sdo_cob_ids_from_od(od: &mut Od, node_id: u8, n: u8) -> Result<(u32, u32), ErrorCode> {
    let index = SDO_SERVER_PARAMETER_BASE + (n as u16 - 1);

    let request = read_cob_id(od, index, 1, node_id)?;
    let response = read_cob_id(od, index, 2, node_id)?;

    Ok((request, response))
}

fn read_cob_id(od: &mut Od, index: u16, subindex: u8, node_id: u8) -> Result<u32, ErrorCode> {
    let handle = od.find(index, subindex);
    let attr = od.get_attr(handle).map_err(|_| {
        error!(
            "missing SDO server parameter {:04x}h:{}",
            index, subindex
        );
        ErrorCode::ObjectNotFound { index }
    })?;

    let mut buf = [0u8; 4];
    od.read_by_handle(handle, &mut buf)?;
    let raw = u32::from_le_bytes(buf);

    Ok(if attr.relative() {
        // Relative COB-IDs store the base; the frame-format flag survives
        // the addition.
        let flags = raw & COB_ID_FRAME_FLAG;
        flags | ((raw & !COB_ID_FRAME_FLAG) + node_id as u32)
    } else {
        raw
    })
}
