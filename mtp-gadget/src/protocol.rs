//! PTP/MTP wire constants and the bulk container header.
//!
//! Everything on the wire is little-endian. Containers are framed as a
//! 12-byte header followed by up to five u32 parameters (command/response)
//! or an arbitrary payload (data phase).

/// Bulk container types (header `type` field).
pub const CONTAINER_COMMAND: u16 = 1;
pub const CONTAINER_DATA: u16 = 2;
pub const CONTAINER_RESPONSE: u16 = 3;
pub const CONTAINER_EVENT: u16 = 4;

/// Operation codes (PTP core set).
pub const OP_GET_DEVICE_INFO: u16 = 0x1001;
pub const OP_OPEN_SESSION: u16 = 0x1002;
pub const OP_CLOSE_SESSION: u16 = 0x1003;
pub const OP_GET_STORAGE_IDS: u16 = 0x1004;
pub const OP_GET_STORAGE_INFO: u16 = 0x1005;
pub const OP_GET_OBJECT_HANDLES: u16 = 0x1007;
pub const OP_GET_OBJECT_INFO: u16 = 0x1008;
pub const OP_GET_OBJECT: u16 = 0x1009;
pub const OP_DELETE_OBJECT: u16 = 0x100B;
pub const OP_SEND_OBJECT_INFO: u16 = 0x100C;
pub const OP_SEND_OBJECT: u16 = 0x100D;

/// Operation codes (MTP object-property extension).
pub const OP_GET_OBJECT_PROPS_SUPPORTED: u16 = 0x9801;
pub const OP_GET_OBJECT_PROP_DESC: u16 = 0x9802;
pub const OP_GET_OBJECT_PROP_VALUE: u16 = 0x9803;
pub const OP_SET_OBJECT_PROP_VALUE: u16 = 0x9804;
pub const OP_GET_OBJECT_PROP_LIST: u16 = 0x9805;
pub const OP_SEND_OBJECT_PROP_LIST: u16 = 0x9808;

/// Response codes.
pub const RSP_OK: u16 = 0x2001;
pub const RSP_GENERAL_ERROR: u16 = 0x2002;
pub const RSP_SESSION_NOT_OPEN: u16 = 0x2003;
pub const RSP_OPERATION_NOT_SUPPORTED: u16 = 0x2005;
pub const RSP_INVALID_STORAGE_ID: u16 = 0x2008;
pub const RSP_INVALID_OBJECT_HANDLE: u16 = 0x2009;
pub const RSP_INVALID_PARAMETER: u16 = 0x201D;
pub const RSP_INVALID_OBJECT_PROP_CODE: u16 = 0xA801;
pub const RSP_INVALID_OBJECT_PROP_VALUE: u16 = 0xA803;
pub const RSP_GROUP_NOT_SUPPORTED: u16 = 0xA807;
pub const RSP_DEPTH_NOT_SUPPORTED: u16 = 0xA808;

/// Object format codes.
pub const FMT_UNDEFINED: u16 = 0x3000;
pub const FMT_ASSOCIATION: u16 = 0x3001;

/// Association types.
pub const ASSOC_UNDEFINED: u16 = 0x0000;
pub const ASSOC_GENERIC_FOLDER: u16 = 0x0001;

/// Object property codes.
pub const PROP_STORAGE_ID: u16 = 0xDC01;
pub const PROP_OBJECT_FORMAT: u16 = 0xDC02;
pub const PROP_OBJECT_SIZE: u16 = 0xDC04;
pub const PROP_OBJECT_FILE_NAME: u16 = 0xDC07;
pub const PROP_PARENT_OBJECT: u16 = 0xDC0B;
pub const PROP_PERSISTENT_UNIQUE_OBJECT_IDENTIFIER: u16 = 0xDC41;

/// Property value data-type codes.
pub const TYPE_U16: u16 = 0x0004;
pub const TYPE_U32: u16 = 0x0006;
pub const TYPE_U64: u16 = 0x0008;
pub const TYPE_U128: u16 = 0x000A;
pub const TYPE_STRING: u16 = 0xFFFF;

/// Property get/set flags.
pub const PROP_GET: u8 = 0x00;
pub const PROP_GET_SET: u8 = 0x01;

/// Property group code accepted in GetObjectPropList/GetObjectPropDesc.
pub const PROP_GROUP_DEFAULT: u32 = 0x0000_0000;
/// Property form flag (none).
pub const PROP_FORM_NONE: u8 = 0x00;

/// Storage info constants.
pub const STORAGE_TYPE_FIXED_MEDIA: u16 = 0x0003;
pub const FILESYSTEM_GENERIC_HIERARCHICAL: u16 = 0x0002;
pub const ACCESS_READ_WRITE: u16 = 0x0000;

/// Sentinel storage id meaning "all storages" in GetObjectHandles.
pub const ALL_STORAGE: u32 = 0xFFFF_FFFF;
/// Sentinel parent handle meaning "children of the storage root".
pub const ROOT_PARENT: u32 = 0xFFFF_FFFF;

/// Device info fields.
pub const MTP_STANDARD_VERSION: u16 = 100;
pub const MTP_VENDOR_EXTENSION_ID: u32 = 0x0000_0006;
pub const MTP_VENDOR_EXTENSION_DESC: &str = "microsoft.com: 1.0;";
pub const MTP_FUNCTIONAL_MODE: u16 = 0x0000;

/// Directory entries fetched per backend read while enumerating.
pub const DIRECTORY_READ_SIZE: usize = 32;

/// The properties this responder reports and serves, in report order.
pub const SUPPORTED_OBJECT_PROPERTIES: [u16; 6] = [
    PROP_PERSISTENT_UNIQUE_OBJECT_IDENTIFIER,
    PROP_OBJECT_SIZE,
    PROP_STORAGE_ID,
    PROP_PARENT_OBJECT,
    PROP_OBJECT_FORMAT,
    PROP_OBJECT_FILE_NAME,
];

/// Operations advertised by GetDeviceInfo, in report order.
pub const SUPPORTED_OPERATIONS: [u16; 17] = [
    OP_GET_DEVICE_INFO,
    OP_OPEN_SESSION,
    OP_CLOSE_SESSION,
    OP_GET_STORAGE_IDS,
    OP_GET_STORAGE_INFO,
    OP_GET_OBJECT_HANDLES,
    OP_GET_OBJECT_INFO,
    OP_GET_OBJECT,
    OP_DELETE_OBJECT,
    OP_SEND_OBJECT_INFO,
    OP_SEND_OBJECT,
    OP_GET_OBJECT_PROPS_SUPPORTED,
    OP_GET_OBJECT_PROP_DESC,
    OP_GET_OBJECT_PROP_VALUE,
    OP_SET_OBJECT_PROP_VALUE,
    OP_GET_OBJECT_PROP_LIST,
    OP_SEND_OBJECT_PROP_LIST,
];

/// Playback formats advertised by GetDeviceInfo.
pub const SUPPORTED_PLAYBACK_FORMATS: [u16; 2] = [FMT_UNDEFINED, FMT_ASSOCIATION];

pub const CONTAINER_HEADER_SIZE: usize = 12;

/// The 12-byte bulk container header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerHeader {
    pub length: u32,
    pub kind: u16,
    pub code: u16,
    pub trans_id: u32,
}

impl ContainerHeader {
    pub fn new(kind: u16, code: u16, trans_id: u32, payload_len: u32) -> Self {
        ContainerHeader {
            length: CONTAINER_HEADER_SIZE as u32 + payload_len,
            kind,
            code,
            trans_id,
        }
    }

    /// Parse from the first 12 bytes of `buf`. Returns `None` if short.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        Some(ContainerHeader {
            length: read_u32_le(buf, 0)?,
            kind: read_u16_le(buf, 4)?,
            code: read_u16_le(buf, 6)?,
            trans_id: read_u32_le(buf, 8)?,
        })
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(&self.code.to_le_bytes());
        out.extend_from_slice(&self.trans_id.to_le_bytes());
    }
}

// ---------------------------------------------------------------------------
// Wire serialization helpers (all little-endian)
// ---------------------------------------------------------------------------

#[inline]
pub fn read_u16_le(buf: &[u8], offset: usize) -> Option<u16> {
    let b = buf.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

#[inline]
pub fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let b = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline]
pub fn read_u64_le(buf: &[u8], offset: usize) -> Option<u64> {
    let b = buf.get(offset..offset + 8)?;
    Some(u64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_header_roundtrip() {
        let hdr = ContainerHeader::new(CONTAINER_COMMAND, OP_OPEN_SESSION, 7, 4);
        let mut buf = Vec::new();
        hdr.emit(&mut buf);
        assert_eq!(buf.len(), CONTAINER_HEADER_SIZE);
        assert_eq!(hdr.length, 16);
        let parsed = ContainerHeader::parse(&buf).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn short_header_rejected() {
        assert!(ContainerHeader::parse(&[0u8; 11]).is_none());
    }
}
