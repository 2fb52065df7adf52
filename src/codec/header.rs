use crate::error::{Result, SdError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SomeIpHeader {
    pub service_id: u16,
    pub method_id: u16,
    pub length: u32,
    pub client_id: u16,
    pub session_id: u16,
    pub protocol_version: u8,
    pub interface_version: u8,
    pub message_type: u8,
    pub return_code: u8,
}

impl SomeIpHeader {
    pub const HEADER_LENGTH: usize = 16;
    pub const SOMEIP_PROTOCOL_VERSION: u8 = 0x01;

    /// Service id reserved for service discovery.
    pub const SD_SERVICE_ID: u16 = 0xFFFF;
    /// Method id of SD messages.
    pub const SD_METHOD_ID: u16 = 0x8100;
    pub const MESSAGE_TYPE_NOTIFICATION: u8 = 0x02;

    pub fn new(service_id: u16, method_id: u16, client_id: u16, session_id: u16, message_type: u8, payload_len: u32) -> Self {
        SomeIpHeader {
            service_id,
            method_id,
            // Request ID (4) + versions/type/return code (4) precede the payload
            length: payload_len + 8,
            client_id,
            session_id,
            protocol_version: Self::SOMEIP_PROTOCOL_VERSION,
            interface_version: 0x01,
            message_type,
            return_code: 0x00,
        }
    }

    /// Header of an SD message carrying `payload_len` bytes of SD payload.
    pub fn sd(session_id: u16, payload_len: u32) -> Self {
        Self::new(
            Self::SD_SERVICE_ID,
            Self::SD_METHOD_ID,
            0x0000,
            session_id,
            Self::MESSAGE_TYPE_NOTIFICATION,
            payload_len,
        )
    }

    pub fn is_sd(&self) -> bool {
        self.service_id == Self::SD_SERVICE_ID && self.method_id == Self::SD_METHOD_ID
    }

    /// Number of payload bytes following the 16 byte header.
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(8)
    }

    pub fn serialize(&self) -> [u8; 16] {
        let mut buffer = [0u8; 16];

        buffer[0..2].copy_from_slice(&self.service_id.to_be_bytes());
        buffer[2..4].copy_from_slice(&self.method_id.to_be_bytes());
        buffer[4..8].copy_from_slice(&self.length.to_be_bytes());
        buffer[8..10].copy_from_slice(&self.client_id.to_be_bytes());
        buffer[10..12].copy_from_slice(&self.session_id.to_be_bytes());
        buffer[12] = self.protocol_version;
        buffer[13] = self.interface_version;
        buffer[14] = self.message_type;
        buffer[15] = self.return_code;

        buffer
    }

    pub fn deserialize(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < Self::HEADER_LENGTH {
            return Err(SdError::Malformed("buffer too small for SOME/IP header"));
        }
        let b = buffer;
        let header = SomeIpHeader {
            service_id: u16::from_be_bytes([b[0], b[1]]),
            method_id: u16::from_be_bytes([b[2], b[3]]),
            length: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
            client_id: u16::from_be_bytes([b[8], b[9]]),
            session_id: u16::from_be_bytes([b[10], b[11]]),
            protocol_version: b[12],
            interface_version: b[13],
            message_type: b[14],
            return_code: b[15],
        };
        if header.length < 8 {
            return Err(SdError::Malformed("SOME/IP length field below minimum"));
        }
        Ok(header)
    }
}
