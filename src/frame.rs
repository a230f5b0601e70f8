use embedded_can::{ExtendedId, Id, StandardId};

use crate::error::ErrorCode;
use crate::prelude::*;

/// NMT node control protocol COB-ID.
pub const COB_ID_NMT_NODE_CONTROL: u32 = 0x000;
/// Base COB-ID for the NMT error control (and boot-up) protocol.
pub const COB_ID_NMT_ERROR_CONTROL_BASE: u32 = 0x700;
/// Base COB-ID for SDO requests (client to server, SDO server #1).
pub const COB_ID_SDO_REQUEST_BASE: u32 = 0x600;
/// Base COB-ID for SDO responses (server to client, SDO server #1).
pub const COB_ID_SDO_RESPONSE_BASE: u32 = 0x580;

/// Bit 29 of a COB-ID stored in the object dictionary flags an extended
/// (29-bit) frame.
pub const COB_ID_FRAME_FLAG: u32 = 1 << 29;

/// A classic CAN 2.0 data frame: identifier, DLC and up to 8 data bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: Id,
    dlc: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Build a frame for the given COB-ID. Bit 29 of `cob_id` selects an
    /// extended identifier; otherwise the value must fit in 11 bits.
    pub fn new(cob_id: u32, data: &[u8]) -> Result<Self, ErrorCode> {
        if data.len() > 8 {
            return Err(ErrorCode::FrameCreationFailed);
        }

        let id = if cob_id & COB_ID_FRAME_FLAG != 0 {
            Id::Extended(
                ExtendedId::new(cob_id & ExtendedId::MAX.as_raw())
                    .ok_or(ErrorCode::InvalidCobId { cob_id })?,
            )
        } else {
            Id::Standard(
                u16::try_from(cob_id)
                    .ok()
                    .and_then(StandardId::new)
                    .ok_or(ErrorCode::InvalidCobId { cob_id })?,
            )
        };

        let mut bytes = [0u8; 8];
        bytes[..data.len()].copy_from_slice(data);

        Ok(CanFrame {
            id,
            dlc: data.len() as u8,
            data: bytes,
        })
    }

    /// Build a frame zero-padded to a DLC of 8 (SDO frames are always full
    /// length).
    pub fn new_padded(cob_id: u32, data: &[u8]) -> Result<Self, ErrorCode> {
        if data.len() > 8 {
            return Err(ErrorCode::FrameCreationFailed);
        }

        let mut bytes = [0u8; 8];
        bytes[..data.len()].copy_from_slice(data);

        let mut frame = CanFrame::new(cob_id, &bytes)?;
        frame.dlc = 8;
        Ok(frame)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// The COB-ID encoding of the identifier: the raw value, with bit 29 set
    /// for extended frames.
    pub fn cob_id(&self) -> u32 {
        match self.id {
            Id::Standard(sid) => sid.as_raw() as u32,
            Id::Extended(eid) => eid.as_raw() | COB_ID_FRAME_FLAG,
        }
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// The full 8-byte payload, zero-padded past the DLC. SDO parsing always
    /// works on this fixed-size view.
    pub fn payload(&self) -> [u8; 8] {
        self.data
    }
}

impl Debug for CanFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CanFrame {{ id: {:03x}, dlc: {}, data: {:02x?} }}",
               self.cob_id(), self.dlc, self.data())
    }
}

impl embedded_can::Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }

        let mut bytes = [0u8; 8];
        bytes[..data.len()].copy_from_slice(data);

        Some(CanFrame {
            id: id.into(),
            dlc: data.len() as u8,
            data: bytes,
        })
    }

    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        // Remote frames are not used by any CANopen protocol in this stack.
        None
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        CanFrame::data(self)
    }
}

/// Acceptance filter for a receive path. `mask` bits set to 1 must match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanFilter {
    pub id: u32,
    pub mask: u32,
    pub extended: bool,
}

/// Fill in a [`CanFilter`] matching exactly one CANopen COB-ID, honoring the
/// frame-format flag in bit 29.
pub fn cob_id_to_filter(cob_id: u32) -> CanFilter {
    if cob_id & COB_ID_FRAME_FLAG != 0 {
        CanFilter {
            id: cob_id & ExtendedId::MAX.as_raw(),
            mask: ExtendedId::MAX.as_raw(),
            extended: true,
        }
    } else {
        CanFilter {
            id: cob_id & StandardId::MAX.as_raw() as u32,
            mask: StandardId::MAX.as_raw() as u32,
            extended: false,
        }
    }
}

/// Completion callback for a transmitted frame, invoked exactly once per
/// accepted send with the transmission result.
pub type TxCompletion = Box<dyn FnOnce(Result<(), ErrorCode>)>;

/// The narrow port to the CAN controller.
///
/// `send` is fire-and-forget from the caller's perspective: the driver
/// queues the frame and reports the outcome through `on_complete` (when
/// provided) once the frame has been acknowledged on the bus or failed.
/// `receive` is non-blocking; drivers return [`nb::Error::WouldBlock`] when
/// no frame passed the acceptance filters.
pub trait CanInterface {
    fn send(
        &mut self,
        frame: &CanFrame,
        on_complete: Option<TxCompletion>,
    ) -> Result<(), ErrorCode>;

    fn receive(&mut self) -> nb::Result<CanFrame, ErrorCode>;

    fn add_filter(&mut self, filter: &CanFilter) -> Result<(), ErrorCode>;
}
