//! SDO server: the confirmed read/write protocol against the Object
//! Dictionary (CiA 301, section 7.2.4).
//!
//! Each server consumes 8-byte request frames from a bounded queue and
//! answers on its response COB-ID. Expedited, segmented and block transfers
//! are supported; every OD failure is answered with the standard abort frame
//! carrying the CiA 301 abort code.

use crate::cmd_header::{
    SdoBlockDownloadInitiateCmd, SdoBlockUploadCmd, SdoDownloadInitiateCmd, SdoDownloadSegmentCmd,
    SdoEndBlockDownloadCmd, SdoInitBlockUploadCmd,
};
use crate::error::{AbortCode, ErrorCode};
use crate::frame::{
    cob_id_to_filter, CanFilter, CanFrame, CanInterface, COB_ID_SDO_REQUEST_BASE,
    COB_ID_SDO_RESPONSE_BASE,
};
use crate::od::Od;
use crate::prelude::*;
use crate::util::{crc16_canopen_with_lut, u32_from_le};
use crate::{debug, error, info};

/// Minimum allowed SDO number.
pub const SDO_NUMBER_MIN: u8 = 1;
/// Maximum allowed SDO number.
pub const SDO_NUMBER_MAX: u8 = 128;

/// Default capacity of the request queue.
pub const DEFAULT_REQUEST_QUEUE_CAPACITY: usize = 8;

/// Default inactivity timeout, in [`SdoServer::tick`] periods.
pub const DEFAULT_TIMEOUT_TICKS: u32 = 100;

/// Largest number of segments per block the server announces.
const DEFAULT_BLOCK_SIZE: u8 = 0x7F;

/// Client command specifiers (top three bits of request byte 0).
const CCS_DOWNLOAD_SEGMENT: u8 = 0;
const CCS_INITIATE_DOWNLOAD: u8 = 1;
const CCS_INITIATE_UPLOAD: u8 = 2;
const CCS_UPLOAD_SEGMENT: u8 = 3;
const CS_ABORT: u8 = 4;
const CCS_BLOCK_UPLOAD: u8 = 5;
const CCS_BLOCK_DOWNLOAD: u8 = 6;

/// Abort frame command byte (cs 4 in the top three bits).
const CMD_ABORT: u8 = 0x80;

/// SDO server transfer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoServerState {
    Idle,
    /// Segmented download in progress.
    Download,
    /// Segmented upload in progress.
    Upload,
    /// Block download: receiving segments, then the end-of-transfer request.
    BlockDownload { ending: bool },
    /// Block upload: awaiting the client's start, then its acknowledgement.
    BlockUpload { confirming: bool },
}

/// One SDO server instance bound to a request/response COB-ID pair.
pub struct SdoServer {
    sdo_number: u8,
    request_cob_id: u32,
    response_cob_id: u32,
    state: SdoServerState,
    requests: VecDeque<[u8; 8]>,
    queue_capacity: usize,

    // Per-transfer scratch.
    index: u16,
    subindex: u8,
    read_buf: Vec<u8>,
    read_pos: usize,
    next_toggle: u8,
    write_buf: Vec<u8>,
    write_size: usize,
    need_crc: bool,
    block_size: u8,
    seqno: u8,

    idle_ticks: u32,
    timeout_ticks: u32,
}

impl SdoServer {
    /// Create SDO server number `sdo_number` (1 to 128) for the given
    /// node-ID. Server #1 uses the default COB-ID pair `0x600 + node_id` /
    /// `0x580 + node_id`; additional servers must be re-bound with
    /// [`SdoServer::set_cob_ids`] from their OD communication parameters.
    pub fn new(sdo_number: u8, node_id: u8) -> Result<Self, ErrorCode> {
        if !(SDO_NUMBER_MIN..=SDO_NUMBER_MAX).contains(&sdo_number) {
            error!("invalid SDO number {}", sdo_number);
            return Err(ErrorCode::InvalidSdoNumber { sdo_number });
        }

        Ok(SdoServer {
            sdo_number,
            request_cob_id: COB_ID_SDO_REQUEST_BASE + node_id as u32,
            response_cob_id: COB_ID_SDO_RESPONSE_BASE + node_id as u32,
            state: SdoServerState::Idle,
            requests: VecDeque::new(),
            queue_capacity: DEFAULT_REQUEST_QUEUE_CAPACITY,
            index: 0,
            subindex: 0,
            read_buf: Vec::new(),
            read_pos: 0,
            next_toggle: 0,
            write_buf: Vec::new(),
            write_size: 0,
            need_crc: false,
            block_size: DEFAULT_BLOCK_SIZE,
            seqno: 0,
            idle_ticks: 0,
            timeout_ticks: DEFAULT_TIMEOUT_TICKS,
        })
    }

    pub fn sdo_number(&self) -> u8 {
        self.sdo_number
    }

    pub fn state(&self) -> SdoServerState {
        self.state
    }

    pub fn request_cob_id(&self) -> u32 {
        self.request_cob_id
    }

    pub fn response_cob_id(&self) -> u32 {
        self.response_cob_id
    }

    /// Re-bind the server to another COB-ID pair (servers other than #1 draw
    /// theirs from OD `0x1200 + (n - 1)`).
    pub fn set_cob_ids(&mut self, request: u32, response: u32) {
        self.request_cob_id = request;
        self.response_cob_id = response;
    }

    pub fn set_request_queue_capacity(&mut self, capacity: usize) {
        self.queue_capacity = capacity;
    }

    pub fn set_timeout_ticks(&mut self, ticks: u32) {
        self.timeout_ticks = ticks;
    }

    /// The receive filter this server depends on.
    pub fn filter(&self) -> CanFilter {
        cob_id_to_filter(self.request_cob_id)
    }

    /// Enqueue a request frame. Frames for other COB-IDs are ignored; a full
    /// queue is reported to the caller and the frame dropped.
    pub fn handle_request(&mut self, frame: &CanFrame) -> Result<(), ErrorCode> {
        if frame.cob_id() != self.request_cob_id {
            return Ok(());
        }

        if self.requests.len() >= self.queue_capacity {
            error!("SDO server {} request queue full", self.sdo_number);
            return Err(ErrorCode::RequestQueueFull);
        }

        self.requests.push_back(frame.payload());
        Ok(())
    }

    /// Drain the request queue, stepping the transfer state machine and
    /// sending responses. Each request is processed to completion before the
    /// next is dequeued.
    pub fn poll<CAN: CanInterface>(&mut self, can: &mut CAN, od: &mut Od) {
        while let Some(request) = self.requests.pop_front() {
            self.idle_ticks = 0;

            match self.process_request(&request, od) {
                Ok(responses) => {
                    for response in responses {
                        debug!("SDO response: {:?}", response);
                        self.transmit(can, &response);
                    }
                }
                Err(code) => {
                    // The request mux is only authoritative before a
                    // transfer has latched its target.
                    let (index, subindex) = match self.state {
                        SdoServerState::Idle => {
                            (u16::from_le_bytes([request[1], request[2]]), request[3])
                        }
                        _ => (self.index, self.subindex),
                    };

                    info!(
                        "SDO abort {:04x}h:{} ({})",
                        index,
                        subindex,
                        code.description()
                    );

                    self.reset_transfer();
                    if let Some(abort) = self.abort_frame(index, subindex, code) {
                        self.transmit(can, &abort);
                    }
                }
            }
        }
    }

    /// Advance the inactivity timeout. A transfer that sits in a non-idle
    /// state for longer than the configured number of ticks is aborted.
    pub fn tick<CAN: CanInterface>(&mut self, can: &mut CAN) {
        if self.state == SdoServerState::Idle {
            return;
        }

        self.idle_ticks += 1;
        if self.idle_ticks < self.timeout_ticks {
            return;
        }

        info!(
            "SDO server {} transfer timed out in {:?}",
            self.sdo_number, self.state
        );

        let (index, subindex) = (self.index, self.subindex);
        self.reset_transfer();
        if let Some(abort) = self.abort_frame(index, subindex, AbortCode::SdoProtocolTimedOut) {
            self.transmit(can, &abort);
        }
    }

    fn transmit<CAN: CanInterface>(&mut self, can: &mut CAN, frame: &CanFrame) {
        if let Err(err) = can.send(frame, None) {
            error!("failed to send SDO frame {:?} ({:?})", frame, err);
        }
    }

    fn process_request(
        &mut self,
        request: &[u8; 8],
        od: &mut Od,
    ) -> Result<Vec<CanFrame>, AbortCode> {
        // Block download segments carry a sequence number in byte 0, not a
        // command specifier.
        if self.state == (SdoServerState::BlockDownload { ending: false }) {
            return self.block_download_segment(request);
        }

        let cmd = request[0];
        let ccs = cmd >> 5;

        if ccs == CS_ABORT {
            debug!(
                "SDO transfer aborted by client (code {:08x}h)",
                u32_from_le(&request[4..8]).unwrap_or(0)
            );
            self.reset_transfer();
            return Ok(vec![]);
        }

        let index = u16::from_le_bytes([request[1], request[2]]);
        let subindex = request[3];

        match self.state {
            SdoServerState::Idle => match ccs {
                CCS_INITIATE_DOWNLOAD => self.initiate_download(index, subindex, request, od),
                CCS_INITIATE_UPLOAD => self.initiate_upload(index, subindex, od),
                CCS_BLOCK_DOWNLOAD => self.init_block_download(index, subindex, request),
                CCS_BLOCK_UPLOAD => self.init_block_upload(index, subindex, request, od),
                // Segment requests outside a transfer, or unknown specifiers.
                _ => Err(AbortCode::CommandSpecifierNotValid),
            },
            SdoServerState::Download => self.download_segment(request, od),
            SdoServerState::Upload => self.upload_segment(cmd),
            SdoServerState::BlockDownload { ending: true } => {
                self.end_block_download(request, od)
            }
            SdoServerState::BlockDownload { ending: false } => self.block_download_segment(request),
            SdoServerState::BlockUpload { confirming: false } => self.start_block_upload(request),
            SdoServerState::BlockUpload { confirming: true } => self.confirm_block_upload(request),
        }
    }

    fn read_entry(
        &mut self,
        index: u16,
        subindex: u8,
        od: &mut Od,
    ) -> Result<Vec<u8>, AbortCode> {
        let handle = od.find(index, subindex);
        let size = od.get_size(handle).unwrap_or(0);

        let mut buf = vec![0u8; size];
        let n = od
            .read_by_handle(handle, &mut buf)
            .map_err(ErrorCode::to_abort)?;
        buf.truncate(n);

        // An empty variable-length entry is a valid 0-byte value; missing
        // objects and sub-indices already aborted above.
        Ok(buf)
    }

    fn initiate_upload(
        &mut self,
        index: u16,
        subindex: u8,
        od: &mut Od,
    ) -> Result<Vec<CanFrame>, AbortCode> {
        let data = self.read_entry(index, subindex, od)?;

        if data.len() <= 4 {
            // Expedited: scs 2, e = 1, s = 1, n = unused bytes of data[4..8].
            let cmd = 0x43 | (((4 - data.len()) as u8) << 2);
            return Ok(vec![self.response(cmd, index, subindex, &data)?]);
        }

        // Segmented: announce the size, then serve upload segment requests.
        self.read_buf = data;
        self.read_pos = 0;
        self.next_toggle = 0;
        self.index = index;
        self.subindex = subindex;
        self.state = SdoServerState::Upload;

        let size = (self.read_buf.len() as u32).to_le_bytes();
        Ok(vec![self.response(0x41, index, subindex, &size)?])
    }

    fn upload_segment(&mut self, cmd: u8) -> Result<Vec<CanFrame>, AbortCode> {
        if cmd >> 5 != CCS_UPLOAD_SEGMENT {
            return Err(AbortCode::CommandSpecifierNotValid);
        }

        let toggle = (cmd >> 4) & 0x1;
        if toggle != self.next_toggle {
            return Err(AbortCode::ToggleBitNotAlternated);
        }
        self.next_toggle ^= 1;

        let remaining = &self.read_buf[self.read_pos..];

        if remaining.len() > 7 {
            let mut data = [0u8; 8];
            data[0] = toggle << 4;
            data[1..].copy_from_slice(&remaining[..7]);
            self.read_pos += 7;
            return Ok(vec![self.segment_response(&data)?]);
        }

        // Last segment: c = 1, n = number of unused bytes.
        let n = (7 - remaining.len()) as u8;
        let mut data = vec![0x01 | (toggle << 4) | (n << 1)];
        data.extend_from_slice(remaining);
        let response = self.segment_response(&data)?;

        self.reset_transfer();
        Ok(vec![response])
    }

    fn initiate_download(
        &mut self,
        index: u16,
        subindex: u8,
        request: &[u8; 8],
        od: &mut Od,
    ) -> Result<Vec<CanFrame>, AbortCode> {
        let cmd = SdoDownloadInitiateCmd::from(request[0]);

        if cmd.e() {
            // Expedited: 4 - n data bytes inline.
            let len = if cmd.s() { 4 - cmd.n() as usize } else { 4 };
            od.write(index, subindex, &request[4..4 + len])
                .map_err(ErrorCode::to_abort)?;

            return Ok(vec![self.response(0x60, index, subindex, &[])?]);
        }

        // Segmented download.
        self.write_buf.clear();
        self.write_size = if cmd.s() {
            u32_from_le(&request[4..8]).ok_or(AbortCode::GeneralError)? as usize
        } else {
            0
        };
        self.index = index;
        self.subindex = subindex;
        self.next_toggle = 0;
        self.state = SdoServerState::Download;

        Ok(vec![self.response(0x60, index, subindex, &[])?])
    }

    fn download_segment(
        &mut self,
        request: &[u8; 8],
        od: &mut Od,
    ) -> Result<Vec<CanFrame>, AbortCode> {
        let cmd = SdoDownloadSegmentCmd::from(request[0]);

        if cmd.ccs() != CCS_DOWNLOAD_SEGMENT {
            return Err(AbortCode::CommandSpecifierNotValid);
        }

        if cmd.t() != self.next_toggle {
            return Err(AbortCode::ToggleBitNotAlternated);
        }
        self.next_toggle ^= 1;

        let len = if cmd.c() { 7 - cmd.n() as usize } else { 7 };
        self.write_buf.extend_from_slice(&request[1..1 + len]);

        let response_cmd = 0x20 | (cmd.t() << 4);

        if cmd.c() {
            if self.write_size > 0 && self.write_size != self.write_buf.len() {
                return Err(AbortCode::LengthMismatch);
            }

            let (index, subindex) = (self.index, self.subindex);
            let data = core::mem::take(&mut self.write_buf);
            od.write(index, subindex, &data)
                .map_err(ErrorCode::to_abort)?;

            self.reset_transfer();
        }

        Ok(vec![self.segment_response(&[response_cmd])?])
    }

    fn init_block_download(
        &mut self,
        index: u16,
        subindex: u8,
        request: &[u8; 8],
    ) -> Result<Vec<CanFrame>, AbortCode> {
        let cmd = SdoBlockDownloadInitiateCmd::from(request[0]);

        if cmd.cs() {
            return Err(AbortCode::CommandSpecifierNotValid);
        }

        self.need_crc = cmd.cc();
        self.write_size = if cmd.s() {
            u32_from_le(&request[4..8]).ok_or(AbortCode::GeneralError)? as usize
        } else {
            0
        };

        self.write_buf.clear();
        self.seqno = 0;
        self.index = index;
        self.subindex = subindex;
        self.block_size = DEFAULT_BLOCK_SIZE;
        self.state = SdoServerState::BlockDownload { ending: false };

        // scs 5, sc = 1: CRC supported.
        let payload = [self.block_size, 0, 0, 0];
        Ok(vec![self.response(0xA4, index, subindex, &payload)?])
    }

    fn block_download_segment(
        &mut self,
        request: &[u8; 8],
    ) -> Result<Vec<CanFrame>, AbortCode> {
        let seqno = request[0] & 0x7F;
        let last = request[0] & 0x80 != 0;

        if seqno != self.seqno + 1 {
            return Err(AbortCode::InvalidSequenceNumber);
        }
        self.seqno = seqno;

        self.write_buf.extend_from_slice(&request[1..8]);

        if last {
            // Acknowledge the block; the end-of-transfer request follows.
            let response = self.segment_response(&[0xA2, self.seqno, self.block_size])?;
            self.seqno = 0;
            self.state = SdoServerState::BlockDownload { ending: true };
            return Ok(vec![response]);
        }

        if seqno == self.block_size {
            // Block complete, more data to follow in the next block.
            let response = self.segment_response(&[0xA2, self.seqno, self.block_size])?;
            self.seqno = 0;
            return Ok(vec![response]);
        }

        Ok(vec![])
    }

    fn end_block_download(
        &mut self,
        request: &[u8; 8],
        od: &mut Od,
    ) -> Result<Vec<CanFrame>, AbortCode> {
        let cmd = SdoEndBlockDownloadCmd::from(request[0]);

        if cmd.ccs() != CCS_BLOCK_DOWNLOAD || !cmd.cs() {
            return Err(AbortCode::CommandSpecifierNotValid);
        }

        let unused = cmd.n() as usize;
        if unused > self.write_buf.len() {
            return Err(AbortCode::GeneralError);
        }
        self.write_buf.truncate(self.write_buf.len() - unused);

        if self.write_size > 0 && self.write_buf.len() != self.write_size {
            return Err(AbortCode::LengthMismatch);
        }

        if self.need_crc {
            let received = u16::from_le_bytes([request[1], request[2]]);
            let computed = crc16_canopen_with_lut(&self.write_buf);
            if received != computed {
                return Err(AbortCode::CrcError);
            }
        }

        let (index, subindex) = (self.index, self.subindex);
        let data = core::mem::take(&mut self.write_buf);
        od.write(index, subindex, &data)
            .map_err(ErrorCode::to_abort)?;

        self.reset_transfer();
        Ok(vec![self.segment_response(&[0xA1])?])
    }

    fn init_block_upload(
        &mut self,
        index: u16,
        subindex: u8,
        request: &[u8; 8],
        od: &mut Od,
    ) -> Result<Vec<CanFrame>, AbortCode> {
        let cmd = SdoInitBlockUploadCmd::from(request[0]);

        if cmd.cs() != 0 {
            return Err(AbortCode::CommandSpecifierNotValid);
        }

        let block_size = request[4];
        if block_size == 0 || block_size >= 0x80 {
            return Err(AbortCode::InvalidBlockSize);
        }

        let data = self.read_entry(index, subindex, od)?;
        if data.is_empty() {
            // Block transfer has no 0-byte framing; expedited upload covers
            // empty values.
            return Err(AbortCode::NoDataAvailable);
        }

        self.need_crc = cmd.cc();
        self.block_size = block_size;
        self.read_buf = data;
        self.read_pos = 0;
        self.index = index;
        self.subindex = subindex;
        self.state = SdoServerState::BlockUpload { confirming: false };

        // scs 6, sc = 1, s = 1: CRC supported, size indicated.
        let size = (self.read_buf.len() as u32).to_le_bytes();
        Ok(vec![self.response(0xC6, index, subindex, &size)?])
    }

    fn start_block_upload(&mut self, request: &[u8; 8]) -> Result<Vec<CanFrame>, AbortCode> {
        let cmd = SdoBlockUploadCmd::from(request[0]);

        if cmd.ccs() != CCS_BLOCK_UPLOAD || cmd.cs() != 3 {
            return Err(AbortCode::CommandSpecifierNotValid);
        }

        let total = (self.read_buf.len() - 1) / 7 + 1;
        let mut frames = Vec::with_capacity(total);

        for seq in 0..total {
            let start = seq * 7;
            let end = (start + 7).min(self.read_buf.len());

            let mut data = [0u8; 8];
            data[0] = (seq + 1) as u8;
            if seq + 1 == total {
                data[0] |= 0x80;
            }
            data[1..1 + (end - start)].copy_from_slice(&self.read_buf[start..end]);

            frames.push(self.segment_response(&data)?);
        }

        self.state = SdoServerState::BlockUpload { confirming: true };
        Ok(frames)
    }

    fn confirm_block_upload(&mut self, request: &[u8; 8]) -> Result<Vec<CanFrame>, AbortCode> {
        let cmd = SdoBlockUploadCmd::from(request[0]);

        if cmd.ccs() != CCS_BLOCK_UPLOAD || cmd.cs() != 2 {
            return Err(AbortCode::CommandSpecifierNotValid);
        }

        let ackseq = request[1] as usize;
        if ackseq != (self.read_buf.len() - 1) / 7 + 1 {
            return Err(AbortCode::InvalidSequenceNumber);
        }

        // scs 6, cs = 1: end block upload, n = unused bytes in the last
        // segment.
        let n = ((7 - self.read_buf.len() % 7) % 7) as u8;
        let response_cmd = 0xC1 | (n << 2);

        let crc = if self.need_crc {
            crc16_canopen_with_lut(&self.read_buf)
        } else {
            0
        };

        let mut data = vec![response_cmd];
        data.extend_from_slice(&crc.to_le_bytes());

        let response = self.segment_response(&data)?;
        self.reset_transfer();
        Ok(vec![response])
    }

    fn reset_transfer(&mut self) {
        self.state = SdoServerState::Idle;
        self.read_buf = Vec::new();
        self.read_pos = 0;
        self.next_toggle = 0;
        self.write_buf = Vec::new();
        self.write_size = 0;
        self.need_crc = false;
        self.seqno = 0;
        self.idle_ticks = 0;
    }

    /// 8-byte response carrying the multiplexer (index/sub-index) in bytes
    /// 1..4.
    fn response(
        &self,
        cmd: u8,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<CanFrame, AbortCode> {
        let mut bytes = vec![cmd];
        bytes.extend_from_slice(&index.to_le_bytes());
        bytes.push(subindex);
        bytes.extend_from_slice(data);

        self.frame(&bytes)
    }

    /// 8-byte response without a multiplexer (segment protocols).
    fn segment_response(&self, data: &[u8]) -> Result<CanFrame, AbortCode> {
        self.frame(data)
    }

    fn abort_frame(&self, index: u16, subindex: u8, code: AbortCode) -> Option<CanFrame> {
        let mut bytes = vec![CMD_ABORT];
        bytes.extend_from_slice(&index.to_le_bytes());
        bytes.push(subindex);
        bytes.extend_from_slice(&code.code().to_le_bytes());

        self.frame(&bytes).ok()
    }

    fn frame(&self, data: &[u8]) -> Result<CanFrame, AbortCode> {
        CanFrame::new_padded(self.response_cob_id, data).map_err(|err| {
            error!(
                "failed to build SDO frame on {:03x}h ({:?})",
                self.response_cob_id, err
            );
            AbortCode::GeneralError
        })
    }
}
