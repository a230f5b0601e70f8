//! Network Management (NMT) finite-state automaton, CiA 301 section 7.3.2
//! (figures 48 and 49).
//!
//! The FSA is event driven: local API calls, remote node-control frames and
//! boot-up write completions all enqueue events into one bounded FIFO, and
//! [`Nmt::poll`] drains it in arrival order. Events that have no transition
//! in the current state are silently ignored; they are not errors.

use crate::error::ErrorCode;
use crate::frame::{
    cob_id_to_filter, CanFrame, CanInterface, TxCompletion, COB_ID_NMT_ERROR_CONTROL_BASE,
    COB_ID_NMT_NODE_CONTROL,
};
use crate::od::Od;
use crate::prelude::*;
use crate::{error, info, warn};

/// Minimum allowed CANopen node-ID.
pub const NODE_ID_MIN: u8 = 1;
/// Maximum allowed CANopen node-ID.
pub const NODE_ID_MAX: u8 = 127;

/// Default capacity of the NMT event queue.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 8;

/// NMT node control protocol framing.
const NODE_CONTROL_DLC: u8 = 2;
const NODE_CONTROL_NODE_ID_ALL: u8 = 0;

/// NMT node control command specifiers.
const CS_START: u8 = 1;
const CS_STOP: u8 = 2;
const CS_ENTER_PRE_OPERATIONAL: u8 = 128;
const CS_RESET_NODE: u8 = 129;
const CS_RESET_COMMUNICATION: u8 = 130;

/// OD index ranges restored to power-on values by the reset services.
const RESET_COMMUNICATION_RANGE: core::ops::RangeInclusive<u16> = 0x1000..=0x1FFF;
const RESET_APPLICATION_RANGE: core::ops::RangeInclusive<u16> = 0x2000..=0x9FFF;

/// NMT states. The first four states form the Initialisation tree and are
/// traversed automatically; `BootUpWrite` is the internal sub-state awaiting
/// the boot-up frame's transmit completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtState {
    Initialisation,
    Initialising,
    ResetApplication,
    ResetCommunication,
    /// Internal: boot-up frame sent, awaiting its CAN ACK.
    BootUpWrite,
    PreOperational,
    Operational,
    Stopped,
}

impl NmtState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            NmtState::Initialisation => "Initialisation",
            NmtState::Initialising => "Initialising",
            NmtState::ResetApplication => "Reset application",
            NmtState::ResetCommunication => "Reset communication",
            NmtState::BootUpWrite => "Boot-up write",
            NmtState::PreOperational => "Pre-operational",
            NmtState::Operational => "Operational",
            NmtState::Stopped => "Stopped",
        }
    }

    /// States belonging to the Initialisation parent state. The boot-up
    /// write sub-state is deliberately outside the tree: re-entering the
    /// reset chain from it runs the Initialisation entry again.
    const fn in_initialisation_tree(&self) -> bool {
        matches!(
            self,
            NmtState::Initialisation
                | NmtState::Initialising
                | NmtState::ResetApplication
                | NmtState::ResetCommunication
        )
    }
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// NMT events (CiA 301, figure 48).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NmtEvent {
    /// Power on or hardware reset, transition (1).
    PowerOn,
    /// NMT service start node indication, transitions (3),(6).
    Start,
    /// Boot-up write ACK received.
    BootUpWriteAck,
    /// Boot-up write failed.
    BootUpWriteError,
    /// NMT service enter pre-operational indication, transitions (4),(7).
    EnterPreOperational,
    /// NMT service stop node indication, transitions (5),(8).
    Stop,
    /// NMT service reset node indication, transitions (9),(10),(11).
    ResetNode,
    /// NMT service reset communication indication, transitions (12),(13),(14).
    ResetCommunication,
}

struct EventFifo {
    events: VecDeque<NmtEvent>,
    capacity: usize,
}

impl EventFifo {
    fn push(&mut self, event: NmtEvent) -> Result<(), ErrorCode> {
        if self.events.len() >= self.capacity {
            return Err(ErrorCode::EventQueueFull);
        }

        self.events.push_back(event);
        Ok(())
    }

    fn pop(&mut self) -> Option<NmtEvent> {
        self.events.pop_front()
    }
}

/// Identifies a registered state callback for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmtCallbackId(u32);

type StateCallback = Box<dyn FnMut(NmtState, u8)>;

/// The NMT object for one local node.
pub struct Nmt {
    node_id: u8,
    default_node_id: u8,
    state: NmtState,
    events: Rc<RefCell<EventFifo>>,
    callbacks: Vec<(NmtCallbackId, StateCallback)>,
    next_callback_id: u32,
}

impl Nmt {
    /// Create an NMT object. `node_id` must be within 1..=127.
    pub fn new(node_id: u8, event_queue_capacity: usize) -> Result<Self, ErrorCode> {
        if !(NODE_ID_MIN..=NODE_ID_MAX).contains(&node_id) {
            error!("invalid node-ID {}", node_id);
            return Err(ErrorCode::InvalidNodeId { node_id });
        }

        Ok(Nmt {
            node_id,
            default_node_id: node_id,
            state: NmtState::Initialisation,
            events: Rc::new(RefCell::new(EventFifo {
                events: VecDeque::with_capacity(event_queue_capacity),
                capacity: event_queue_capacity,
            })),
            callbacks: Vec::new(),
            next_callback_id: 0,
        })
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    /// The receive filter this FSA depends on.
    pub fn filter(&self) -> crate::frame::CanFilter {
        cob_id_to_filter(COB_ID_NMT_NODE_CONTROL)
    }

    /// Kick off the boot-up sequence (CiA 301, figure 48, transition (1)).
    pub fn enable(&mut self) -> Result<(), ErrorCode> {
        self.enqueue(NmtEvent::PowerOn)
    }

    /// Request the Operational state.
    pub fn start(&mut self) -> Result<(), ErrorCode> {
        self.enqueue(NmtEvent::Start)
    }

    /// Request the Stopped state.
    pub fn stop(&mut self) -> Result<(), ErrorCode> {
        self.enqueue(NmtEvent::Stop)
    }

    /// Request the Pre-operational state.
    pub fn enter_pre_operational(&mut self) -> Result<(), ErrorCode> {
        self.enqueue(NmtEvent::EnterPreOperational)
    }

    /// Request a full application reset.
    pub fn reset_node(&mut self) -> Result<(), ErrorCode> {
        self.enqueue(NmtEvent::ResetNode)
    }

    /// Request a communication reset.
    pub fn reset_communication(&mut self) -> Result<(), ErrorCode> {
        self.enqueue(NmtEvent::ResetCommunication)
    }

    /// Register a state-change callback, fired synchronously on every state
    /// entry with the new state and the node-ID, in registration order.
    /// Callbacks must not block; they may enqueue further NMT events.
    pub fn add_state_callback(
        &mut self,
        callback: impl FnMut(NmtState, u8) + 'static,
    ) -> NmtCallbackId {
        let id = NmtCallbackId(self.next_callback_id);
        self.next_callback_id += 1;
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    pub fn remove_state_callback(&mut self, id: NmtCallbackId) -> Result<(), ErrorCode> {
        let before = self.callbacks.len();
        self.callbacks.retain(|(cb_id, _)| *cb_id != id);

        if self.callbacks.len() == before {
            return Err(ErrorCode::CallbackNotFound);
        }

        Ok(())
    }

    /// Handle an NMT node control frame (COB-ID 0x000). Frames with a wrong
    /// DLC, a non-matching node-ID or an unknown command specifier are
    /// silently dropped.
    pub fn handle_node_control(&mut self, frame: &CanFrame) {
        if frame.dlc() != NODE_CONTROL_DLC {
            return;
        }

        let cs = frame.data()[0];
        let target = frame.data()[1];

        if target != NODE_CONTROL_NODE_ID_ALL && target != self.node_id {
            return;
        }

        let result = match cs {
            CS_START => self.start(),
            CS_STOP => self.stop(),
            CS_ENTER_PRE_OPERATIONAL => self.enter_pre_operational(),
            CS_RESET_NODE => self.reset_node(),
            CS_RESET_COMMUNICATION => self.reset_communication(),
            _ => return,
        };

        if let Err(err) = result {
            error!(
                "failed to enqueue remote node control command specifier {} ({:?})",
                cs, err
            );
        }
    }

    /// Drain the event queue, stepping the FSA one event at a time. Events
    /// enqueued while processing (including boot-up completions delivered
    /// synchronously by the driver) are processed in the same call.
    pub fn poll<CAN: CanInterface>(&mut self, can: &mut CAN, od: &mut Od) {
        loop {
            let event = self.events.borrow_mut().pop();
            let Some(event) = event else {
                break;
            };

            self.dispatch(event, can, od);
        }
    }

    fn enqueue(&mut self, event: NmtEvent) -> Result<(), ErrorCode> {
        self.events.borrow_mut().push(event).map_err(|err| {
            error!("failed to enqueue event {:?} ({:?})", event, err);
            err
        })
    }

    fn dispatch<CAN: CanInterface>(&mut self, event: NmtEvent, can: &mut CAN, od: &mut Od) {
        use NmtState::*;

        match (self.state, event) {
            (_, NmtEvent::PowerOn) => self.enter(Initialisation, can, od),

            // CiA 301, figure 49, transition (2), part 2 of 2.
            (BootUpWrite, NmtEvent::BootUpWriteAck) => self.enter(PreOperational, can, od),
            (BootUpWrite, NmtEvent::BootUpWriteError) => {
                // No automatic retry; a local reset restarts the write.
                warn!("boot-up write failed, awaiting node control");
            }
            // Allow aborting a pending boot-up write ACK by local node control.
            (BootUpWrite, NmtEvent::ResetNode) => self.enter(ResetApplication, can, od),
            (BootUpWrite, NmtEvent::ResetCommunication) => {
                self.enter(ResetCommunication, can, od)
            }

            // CiA 301, figure 48, transitions (3),(5),(11),(14).
            (PreOperational, NmtEvent::Start) => self.enter(Operational, can, od),
            (PreOperational, NmtEvent::Stop) => self.enter(Stopped, can, od),
            (PreOperational, NmtEvent::ResetNode) => self.enter(ResetApplication, can, od),
            (PreOperational, NmtEvent::ResetCommunication) => {
                self.enter(ResetCommunication, can, od)
            }

            // CiA 301, figure 48, transitions (4),(8),(9),(12).
            (Operational, NmtEvent::EnterPreOperational) => self.enter(PreOperational, can, od),
            (Operational, NmtEvent::Stop) => self.enter(Stopped, can, od),
            (Operational, NmtEvent::ResetNode) => self.enter(ResetApplication, can, od),
            (Operational, NmtEvent::ResetCommunication) => {
                self.enter(ResetCommunication, can, od)
            }

            // CiA 301, figure 48, transitions (6),(7),(10),(13).
            (Stopped, NmtEvent::Start) => self.enter(Operational, can, od),
            (Stopped, NmtEvent::EnterPreOperational) => self.enter(PreOperational, can, od),
            (Stopped, NmtEvent::ResetNode) => self.enter(ResetApplication, can, od),
            (Stopped, NmtEvent::ResetCommunication) => self.enter(ResetCommunication, can, od),

            // Self-directed and out-of-table events are not errors.
            (state, event) => {
                info!("ignoring event {:?} in state {}", event, state);
            }
        }
    }

    /// Enter a state, running its entry action. Initialisation sub-states
    /// entered from outside the tree run the parent entry first; the
    /// automatic transitions of figure 49 chain from here.
    fn enter<CAN: CanInterface>(&mut self, state: NmtState, can: &mut CAN, od: &mut Od) {
        use NmtState::*;

        if matches!(state, Initialising | ResetApplication | ResetCommunication)
            && !self.state.in_initialisation_tree()
        {
            self.state = Initialisation;
            self.fire_state_callbacks(Initialisation);
        }

        self.state = state;

        match state {
            Initialisation => {
                self.fire_state_callbacks(Initialisation);
                // CiA 301, figure 49, transition (15).
                self.enter(Initialising, can, od);
            }
            Initialising => {
                self.fire_state_callbacks(Initialising);
                self.enter(ResetApplication, can, od);
            }
            ResetApplication => {
                // Manufacturer-specific and device-profile areas back to
                // power-on values; node-ID back to its power-on value. The
                // state callbacks carry the relative COB-ID fix-up to the
                // CAN layer, which re-derives its bindings once the reset
                // chain has drained.
                od.reset_range(RESET_APPLICATION_RANGE);
                self.node_id = self.default_node_id;

                self.fire_state_callbacks(ResetApplication);
                // CiA 301, figure 49, transition (16).
                self.enter(ResetCommunication, can, od);
            }
            ResetCommunication => {
                // Communication profile area back to power-on values.
                od.reset_range(RESET_COMMUNICATION_RANGE);

                self.fire_state_callbacks(ResetCommunication);

                if let Err(err) = can.add_filter(&self.filter()) {
                    error!("failed to re-configure NMT CAN filter ({:?})", err);
                }

                // CiA 301, figure 49, transition (2), part 1 of 2.
                self.enter(BootUpWrite, can, od);
            }
            BootUpWrite => self.boot_up_write(can),
            PreOperational => self.fire_state_callbacks(PreOperational),
            Operational => self.fire_state_callbacks(Operational),
            Stopped => self.fire_state_callbacks(Stopped),
        }
    }

    fn boot_up_write<CAN: CanInterface>(&mut self, can: &mut CAN) {
        let cob_id = COB_ID_NMT_ERROR_CONTROL_BASE + self.node_id as u32;

        let frame = match CanFrame::new(cob_id, &[0x00]) {
            Ok(frame) => frame,
            Err(err) => {
                error!("failed to build boot-up CAN frame ({:?})", err);
                return;
            }
        };

        let events = Rc::clone(&self.events);
        let completion: TxCompletion = Box::new(move |result| {
            let event = match result {
                Ok(()) => NmtEvent::BootUpWriteAck,
                Err(err) => {
                    warn!("failed to perform boot-up write ({:?})", err);
                    NmtEvent::BootUpWriteError
                }
            };

            if let Err(err) = events.borrow_mut().push(event) {
                error!("failed to enqueue boot-up completion ({:?})", err);
            }
        });

        if let Err(err) = can.send(&frame, Some(completion)) {
            error!("failed to enqueue boot-up CAN frame ({:?})", err);
        }
    }

    fn fire_state_callbacks(&mut self, state: NmtState) {
        let node_id = self.node_id;

        for (_, callback) in self.callbacks.iter_mut() {
            callback(state, node_id);
        }
    }
}
