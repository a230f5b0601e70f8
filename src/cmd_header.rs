//! SDO command bytes (byte 0 of each request/response), CiA 301 section
//! 7.2.4.3. Bitfields are MSB-first: the client command specifier occupies
//! the top three bits.

use bitfield_struct::bitfield;

/// Initiate SDO download request command byte.
#[bitfield(u8, order = Msb)]
pub struct SdoDownloadInitiateCmd {
    #[bits(3)]
    pub ccs: u8,

    #[bits(1)]
    _reserved_0: u8,

    /// Number of bytes in data[4..8] that do not contain data (expedited
    /// transfers, valid when `s` is set).
    #[bits(2)]
    pub n: u8,

    /// Expedited transfer.
    #[bits(1)]
    pub e: bool,

    /// Data set size indicated (`n` for expedited, bytes 4..8 for segmented).
    #[bits(1)]
    pub s: bool,
}

/// Download SDO segment request command byte.
#[bitfield(u8, order = Msb)]
pub struct SdoDownloadSegmentCmd {
    #[bits(3)]
    pub ccs: u8,

    /// Toggle bit, alternates on each segment.
    #[bits(1)]
    pub t: u8,

    /// Number of trailing bytes of the 7-byte segment without data.
    #[bits(3)]
    pub n: u8,

    /// No more segments to follow.
    #[bits(1)]
    pub c: bool,
}

/// Initiate SDO block download request command byte.
#[bitfield(u8, order = Msb)]
pub struct SdoBlockDownloadInitiateCmd {
    #[bits(3)]
    pub ccs: u8,

    #[bits(2)]
    _reserved_0: u8,

    /// Client supports CRC generation.
    #[bits(1)]
    pub cc: bool,

    /// Data set size indicated in bytes 4..8.
    #[bits(1)]
    pub s: bool,

    /// Client subcommand (0 = initiate).
    #[bits(1)]
    pub cs: bool,
}

/// End SDO block download request command byte.
#[bitfield(u8, order = Msb)]
pub struct SdoEndBlockDownloadCmd {
    #[bits(3)]
    pub ccs: u8,

    /// Unused bytes in the last segment of the last block.
    #[bits(3)]
    pub n: u8,

    #[bits(1)]
    _reserved_0: bool,

    /// Client subcommand (1 = end).
    #[bits(1)]
    pub cs: bool,
}

/// Initiate SDO block upload request command byte.
#[bitfield(u8, order = Msb)]
pub struct SdoInitBlockUploadCmd {
    #[bits(3)]
    pub ccs: u8,

    #[bits(2)]
    _reserved: u8,

    /// Client supports CRC checking.
    #[bits(1)]
    pub cc: bool,

    /// Client subcommand (0 = initiate, 3 = start upload).
    #[bits(2)]
    pub cs: u8,
}

/// SDO block upload sub-command byte (start / acknowledge).
#[bitfield(u8, order = Msb)]
pub struct SdoBlockUploadCmd {
    #[bits(3)]
    pub ccs: u8,

    #[bits(3)]
    _reserved: u8,

    #[bits(2)]
    pub cs: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_initiate_expedited() {
        // 0x2F = initiate download, expedited, size indicated, n = 3.
        let cmd = SdoDownloadInitiateCmd::from(0x2F);
        assert_eq!(cmd.ccs(), 1);
        assert!(cmd.e());
        assert!(cmd.s());
        assert_eq!(cmd.n(), 3);
    }

    #[test]
    fn download_segment_toggle_and_end() {
        let cmd = SdoDownloadSegmentCmd::from(0x1D);
        assert_eq!(cmd.ccs(), 0);
        assert_eq!(cmd.t(), 1);
        assert_eq!(cmd.n(), 6);
        assert!(cmd.c());
    }

    #[test]
    fn block_download_initiate() {
        // ccs = 6, cc = 1, s = 1, cs = 0.
        let cmd = SdoBlockDownloadInitiateCmd::from(0xC6);
        assert_eq!(cmd.ccs(), 6);
        assert!(cmd.cc());
        assert!(cmd.s());
        assert!(!cmd.cs());
    }

    #[test]
    fn block_upload_subcommands() {
        let start = SdoBlockUploadCmd::from(0xA3);
        assert_eq!(start.ccs(), 5);
        assert_eq!(start.cs(), 3);

        let ack = SdoBlockUploadCmd::from(0xA2);
        assert_eq!(ack.cs(), 2);
    }
}
