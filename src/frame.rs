//! # Transfer frame inspection
//!
//! The return services do not decode the frames they deliver. They only need the fields
//! which select a frame: the Global Virtual Channel Identifier (GVCID) of the TM
//! ([CCSDS 132.0-B-3](https://public.ccsds.org/Pubs/132x0b3.pdf)) and AOS
//! ([CCSDS 732.0-B-4](https://public.ccsds.org/Pubs/732x0b4.pdf)) primary headers, and the
//! Operational Control Field (OCF) in the frame trailer.
use crate::ByteConversionError;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use zerocopy::FromBytes;

/// Transfer frame version number of TM frames.
pub const TM_FRAME_VERSION: u8 = 0b00;
/// Transfer frame version number of AOS frames.
pub const AOS_FRAME_VERSION: u8 = 0b01;
pub const PRIMARY_HEADER_LEN: usize = 6;
pub const OCF_LEN: usize = 4;

pub const MAX_TM_SCID: u16 = 2u16.pow(10) - 1;
pub const MAX_TM_VCID: u8 = 2u8.pow(3) - 1;
pub const MAX_AOS_SCID: u16 = 2u16.pow(8) - 1;
pub const MAX_AOS_VCID: u8 = 2u8.pow(6) - 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("byte conversion error: {0}")]
    ByteConversion(#[from] ByteConversionError),
    #[error("unsupported transfer frame version {0}")]
    UnsupportedVersion(u8),
}

/// Quality of a received frame as determined by the frame synchronizer.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum FrameQuality {
    Good = 0,
    Erred = 1,
    Undetermined = 2,
}

/// Global Virtual Channel Identifier.
///
/// A missing virtual channel ID selects the master channel, i.e. all virtual channels of the
/// spacecraft.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvcid {
    pub spacecraft_id: u16,
    pub transfer_frame_version: u8,
    pub virtual_channel_id: Option<u8>,
}

impl Gvcid {
    pub const fn new(
        spacecraft_id: u16,
        transfer_frame_version: u8,
        virtual_channel_id: Option<u8>,
    ) -> Self {
        Self {
            spacecraft_id,
            transfer_frame_version,
            virtual_channel_id,
        }
    }

    pub const fn master_channel(spacecraft_id: u16, transfer_frame_version: u8) -> Self {
        Self::new(spacecraft_id, transfer_frame_version, None)
    }

    /// Check the identifier against the field widths of its frame version. Only TM and AOS
    /// frames are supported.
    pub fn is_valid(&self) -> bool {
        let (max_scid, max_vcid) = match self.transfer_frame_version {
            TM_FRAME_VERSION => (MAX_TM_SCID, MAX_TM_VCID),
            AOS_FRAME_VERSION => (MAX_AOS_SCID, MAX_AOS_VCID),
            _ => return false,
        };
        self.spacecraft_id <= max_scid && self.virtual_channel_id.unwrap_or(0) <= max_vcid
    }

    /// Does the frame with the given header belong to this (master or virtual) channel?
    pub fn matches(&self, header: &TransferFrameHeader) -> bool {
        if self.transfer_frame_version != header.frame_version()
            || self.spacecraft_id != header.spacecraft_id()
        {
            return false;
        }
        match self.virtual_channel_id {
            Some(vcid) => vcid == header.virtual_channel_id(),
            None => true,
        }
    }
}

pub mod zc {
    use zerocopy::byteorder::NetworkEndian;
    use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned, U16};

    #[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Debug)]
    #[repr(C)]
    pub struct TmPrimaryHeader {
        pub(crate) id: U16<NetworkEndian>,
        pub(crate) mc_frame_count: u8,
        pub(crate) vc_frame_count: u8,
        pub(crate) data_field_status: U16<NetworkEndian>,
    }

    #[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Debug)]
    #[repr(C)]
    pub struct AosPrimaryHeader {
        pub(crate) id: U16<NetworkEndian>,
        pub(crate) vc_frame_count: [u8; 3],
        pub(crate) signalling_field: u8,
    }
}

/// Selection relevant fields of a TM or AOS transfer frame primary header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransferFrameHeader {
    frame_version: u8,
    spacecraft_id: u16,
    virtual_channel_id: u8,
    vc_frame_count: u32,
    ocf_flag: Option<bool>,
}

impl TransferFrameHeader {
    /// Parse the primary header at the start of a raw frame.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < PRIMARY_HEADER_LEN {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: PRIMARY_HEADER_LEN,
            }
            .into());
        }
        let frame_version = (buf[0] >> 6) & 0b11;
        match frame_version {
            TM_FRAME_VERSION => {
                let zc_header = zc::TmPrimaryHeader::read_from_prefix(buf)
                    .ok_or(ByteConversionError::ZeroCopyFromError)?;
                let id = zc_header.id.get();
                Ok(Self {
                    frame_version,
                    spacecraft_id: (id >> 4) & MAX_TM_SCID,
                    virtual_channel_id: ((id >> 1) & MAX_TM_VCID as u16) as u8,
                    vc_frame_count: zc_header.vc_frame_count as u32,
                    ocf_flag: Some(id & 0b1 == 1),
                })
            }
            AOS_FRAME_VERSION => {
                let zc_header = zc::AosPrimaryHeader::read_from_prefix(buf)
                    .ok_or(ByteConversionError::ZeroCopyFromError)?;
                let id = zc_header.id.get();
                let count = zc_header.vc_frame_count;
                Ok(Self {
                    frame_version,
                    spacecraft_id: (id >> 6) & MAX_AOS_SCID,
                    virtual_channel_id: (id & MAX_AOS_VCID as u16) as u8,
                    vc_frame_count: u32::from_be_bytes([0, count[0], count[1], count[2]]),
                    ocf_flag: None,
                })
            }
            version => Err(FrameError::UnsupportedVersion(version)),
        }
    }

    #[inline]
    pub fn frame_version(&self) -> u8 {
        self.frame_version
    }

    #[inline]
    pub fn spacecraft_id(&self) -> u16 {
        self.spacecraft_id
    }

    #[inline]
    pub fn virtual_channel_id(&self) -> u8 {
        self.virtual_channel_id
    }

    #[inline]
    pub fn vc_frame_count(&self) -> u32 {
        self.vc_frame_count
    }

    /// OCF flag of TM frames. AOS frames do not signal the OCF presence in the primary header,
    /// it is a managed parameter of the physical channel. [None] is returned for them.
    #[inline]
    pub fn ocf_flag(&self) -> Option<bool> {
        self.ocf_flag
    }

    /// Virtual channel identifier of this frame.
    pub fn gvcid(&self) -> Gvcid {
        Gvcid::new(
            self.spacecraft_id,
            self.frame_version,
            Some(self.virtual_channel_id),
        )
    }
}

/// Operational Control Field.
///
/// The field is taken from the last four octets of a frame. A control word type bit of zero
/// identifies a Communications Link Control Word (CLCW, Type-1-Report).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ocf(pub u32);

impl Ocf {
    /// Extract the OCF from a raw frame. Returns [None] if the frame cannot hold one.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        if frame.len() < PRIMARY_HEADER_LEN + OCF_LEN {
            return None;
        }
        let start = frame.len() - OCF_LEN;
        Some(Self(u32::from_be_bytes([
            frame[start],
            frame[start + 1],
            frame[start + 2],
            frame[start + 3],
        ])))
    }

    #[inline]
    pub fn is_clcw(&self) -> bool {
        (self.0 >> 31) & 0b1 == 0
    }

    /// Virtual channel of the telecommand link this CLCW reports on.
    pub fn clcw_virtual_channel_id(&self) -> Option<u8> {
        if !self.is_clcw() {
            return None;
        }
        Some(((self.0 >> 18) & 0b111111) as u8)
    }

    #[inline]
    pub fn to_be_bytes(&self) -> [u8; OCF_LEN] {
        self.0.to_be_bytes()
    }
}

/// Build a raw TM primary header. Mostly useful to generate test frames.
pub fn tm_primary_header(gvcid: Gvcid, ocf_flag: bool, vc_frame_count: u8) -> [u8; 6] {
    let id: u16 = ((gvcid.spacecraft_id & MAX_TM_SCID) << 4)
        | ((gvcid.virtual_channel_id.unwrap_or(0) as u16 & MAX_TM_VCID as u16) << 1)
        | ocf_flag as u16;
    let id = id.to_be_bytes();
    [id[0], id[1], 0, vc_frame_count, 0x18, 0x00]
}
