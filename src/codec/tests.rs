#[cfg(test)]
mod tests {
    use crate::codec::header::SomeIpHeader;
    use crate::codec::traits::{SomeIpSerialize, SomeIpDeserialize};
    use std::io::Cursor;

    #[test]
    fn test_header_serialization() {
        let header = SomeIpHeader::new(0x1234, 0x5678, 0x0001, 0x0002, 0x00, 100);
        let bytes = header.serialize();

        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 0x12);
        assert_eq!(bytes[1], 0x34);
        assert_eq!(bytes[4], 0x00);
        assert_eq!(bytes[7], 108); // 100 + 8
    }

    #[test]
    fn test_sd_header_layout() {
        let header = SomeIpHeader::sd(0x0102, 28);
        let bytes = header.serialize();

        assert_eq!(bytes[0..4], [0xFF, 0xFF, 0x81, 0x00]);
        assert_eq!(bytes[4..8], [0, 0, 0, 36]);
        assert_eq!(bytes[8..10], [0, 0]); // client id
        assert_eq!(bytes[10..12], [0x01, 0x02]);
        assert_eq!(bytes[12], 0x01); // protocol version
        assert_eq!(bytes[13], 0x01); // interface version
        assert_eq!(bytes[14], 0x02); // notification
        assert_eq!(bytes[15], 0x00);
        assert!(header.is_sd());
        assert_eq!(header.payload_len(), 28);
    }

    #[test]
    fn test_header_deserialize_rejects_short_buffer() {
        assert!(SomeIpHeader::deserialize(&[0xFF; 15]).is_err());
    }

    #[test]
    fn test_header_deserialize_rejects_bad_length() {
        let mut bytes = SomeIpHeader::sd(1, 0).serialize();
        bytes[7] = 4;
        assert!(SomeIpHeader::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_header_parse_back() {
        let header = SomeIpHeader::sd(0xBEEF, 40);
        let parsed = SomeIpHeader::deserialize(&header.serialize()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_primitive_serialization() {
        let val: u32 = 0xDEADBEEF;
        let mut buf = Vec::new();
        val.serialize(&mut buf).unwrap();
        assert_eq!(buf, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        let mut reader = Cursor::new(buf);
        let decoded = u32::deserialize(&mut reader).unwrap();
        assert_eq!(decoded, 0xDEADBEEF);
    }

    #[test]
    fn test_primitive_short_read() {
        let mut reader = Cursor::new(vec![0x12]);
        assert!(u16::deserialize(&mut reader).is_err());
    }
}
