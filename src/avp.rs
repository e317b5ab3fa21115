//! Diameter AVP (Attribute-Value Pair) encoding and decoding
//!
//! AVP format (RFC 6733):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           AVP Code                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V M P r r r r r|                  AVP Length                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Vendor-ID (opt)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Data ...
//! +-+-+-+-+-+-+-+-+
//! ```
//!
//! Decoding is dictionary-driven: the (application, code, vendor) triple is
//! resolved to a definition and the payload typed accordingly. An AVP the
//! dictionary does not know decodes as `AvpData::Unknown` instead of failing
//! the message, which keeps undocumented vendor AVPs forward compatible.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::datatype::AvpData;
use crate::dict::Dictionary;
use crate::error::{DiameterError, DiameterResult};

/// AVP flags
pub mod avp_flags {
    /// Vendor-Specific bit
    pub const VENDOR: u8 = 0x80;
    /// Mandatory bit
    pub const MANDATORY: u8 = 0x40;
    /// Protected bit (encryption)
    pub const PROTECTED: u8 = 0x20;
}

/// AVP header size without vendor ID
pub const AVP_HEADER_SIZE: usize = 8;
/// AVP header size with vendor ID
pub const AVP_HEADER_SIZE_VENDOR: usize = 12;

/// Diameter AVP
#[derive(Debug, Clone, PartialEq)]
pub struct Avp {
    /// AVP code
    pub code: u32,
    /// AVP flags
    pub flags: u8,
    /// Vendor ID (if vendor-specific)
    pub vendor_id: Option<u32>,
    /// AVP data
    pub data: AvpData,
}

impl Avp {
    /// Create a new AVP
    pub fn new(code: u32, flags: u8, vendor_id: Option<u32>, data: AvpData) -> Self {
        Self {
            code,
            flags,
            vendor_id,
            data,
        }
    }

    /// Create a mandatory AVP
    pub fn mandatory(code: u32, data: AvpData) -> Self {
        Self::new(code, avp_flags::MANDATORY, None, data)
    }

    /// Create a vendor-specific mandatory AVP
    pub fn vendor_mandatory(code: u32, vendor_id: u32, data: AvpData) -> Self {
        Self::new(
            code,
            avp_flags::VENDOR | avp_flags::MANDATORY,
            Some(vendor_id),
            data,
        )
    }

    /// Check if AVP is vendor-specific
    pub fn is_vendor_specific(&self) -> bool {
        self.flags & avp_flags::VENDOR != 0
    }

    /// Check if AVP is mandatory
    pub fn is_mandatory(&self) -> bool {
        self.flags & avp_flags::MANDATORY != 0
    }

    /// Vendor id for lookup purposes (0 when the V bit is clear)
    pub fn vendor_key(&self) -> u32 {
        self.vendor_id.unwrap_or(0)
    }

    /// Get the encoded length of this AVP (including padding)
    pub fn encoded_len(&self) -> usize {
        let header_len = if self.is_vendor_specific() {
            AVP_HEADER_SIZE_VENDOR
        } else {
            AVP_HEADER_SIZE
        };
        let data_len = self.data.encoded_len();
        let total = header_len + data_len;
        // Pad to 4-byte boundary
        (total + 3) & !3
    }

    /// Encode AVP to bytes.
    ///
    /// The length field is always recomputed from the actual payload size;
    /// padding is appended but never counted in the length field.
    pub fn encode(&self, buf: &mut BytesMut) {
        let header_len = if self.is_vendor_specific() {
            AVP_HEADER_SIZE_VENDOR
        } else {
            AVP_HEADER_SIZE
        };
        let data_len = self.data.encoded_len();
        let avp_len = header_len + data_len;

        // AVP Code
        buf.put_u32(self.code);

        // Flags and Length
        buf.put_u8(self.flags);
        buf.put_u8(((avp_len >> 16) & 0xFF) as u8);
        buf.put_u16((avp_len & 0xFFFF) as u16);

        // Vendor ID (if present)
        if let Some(vendor_id) = self.vendor_id {
            buf.put_u32(vendor_id);
        }

        // Data
        self.data.encode(buf);

        // Padding
        let padding = (4 - (data_len % 4)) % 4;
        for _ in 0..padding {
            buf.put_u8(0);
        }
    }

    /// Decode one AVP, typing the payload through the dictionary.
    pub fn decode(buf: &mut Bytes, app_id: u32, dict: &Dictionary) -> DiameterResult<Self> {
        Self::decode_at_depth(buf, app_id, dict, 0)
    }

    pub(crate) fn decode_at_depth(
        buf: &mut Bytes,
        app_id: u32,
        dict: &Dictionary,
        depth: usize,
    ) -> DiameterResult<Self> {
        if buf.remaining() < AVP_HEADER_SIZE {
            return Err(DiameterError::BufferTooSmall {
                needed: AVP_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let code = buf.get_u32();
        let flags = buf.get_u8();
        let len_high = buf.get_u8() as usize;
        let len_low = buf.get_u16() as usize;
        let avp_len = (len_high << 16) | len_low;

        let is_vendor = flags & avp_flags::VENDOR != 0;
        let header_len = if is_vendor {
            AVP_HEADER_SIZE_VENDOR
        } else {
            AVP_HEADER_SIZE
        };

        if avp_len < header_len {
            return Err(DiameterError::InvalidAvp(format!(
                "AVP {} length {} is less than header size {}",
                code, avp_len, header_len
            )));
        }

        let vendor_id = if is_vendor {
            if buf.remaining() < 4 {
                return Err(DiameterError::BufferTooSmall {
                    needed: 4,
                    available: buf.remaining(),
                });
            }
            Some(buf.get_u32())
        } else {
            None
        };

        let data_len = avp_len - header_len;
        if buf.remaining() < data_len {
            return Err(DiameterError::BufferTooSmall {
                needed: data_len,
                available: buf.remaining(),
            });
        }
        let data_bytes = buf.copy_to_bytes(data_len);

        // Padding belongs to the AVP and must be present.
        let padding = (4 - (data_len % 4)) % 4;
        if buf.remaining() < padding {
            return Err(DiameterError::InvalidAvp(format!(
                "AVP {} is truncated inside its padding",
                code
            )));
        }
        buf.advance(padding);

        let def = dict.find_avp(app_id, code, vendor_id.unwrap_or(0));
        let data = AvpData::decode(def.data, data_bytes, app_id, dict, depth)?;

        Ok(Self {
            code,
            flags,
            vendor_id,
            data,
        })
    }

    /// Get data as OctetString
    pub fn as_octet_string(&self) -> Option<&Bytes> {
        match &self.data {
            AvpData::OctetString(b) | AvpData::Unknown(b) => Some(b),
            _ => None,
        }
    }

    /// Get data as Unsigned32
    pub fn as_u32(&self) -> Option<u32> {
        match &self.data {
            AvpData::Unsigned32(v) => Some(*v),
            AvpData::Enumerated(v) => Some(*v as u32),
            _ => None,
        }
    }

    /// Get data as Unsigned64
    pub fn as_u64(&self) -> Option<u64> {
        match &self.data {
            AvpData::Unsigned64(v) => Some(*v),
            _ => None,
        }
    }

    /// Get data as Integer32
    pub fn as_i32(&self) -> Option<i32> {
        match &self.data {
            AvpData::Integer32(v) | AvpData::Enumerated(v) => Some(*v),
            _ => None,
        }
    }

    /// Get data as a string, for the UTF-8 backed types
    pub fn as_utf8_string(&self) -> Option<&str> {
        match &self.data {
            AvpData::Utf8String(s) | AvpData::DiameterIdentity(s) | AvpData::DiameterUri(s) => {
                Some(s)
            }
            _ => None,
        }
    }

    /// Get data as grouped AVPs
    pub fn as_grouped(&self) -> Option<&[Avp]> {
        match &self.data {
            AvpData::Grouped(avps) => Some(avps),
            _ => None,
        }
    }

    /// Get data as Address
    pub fn as_address(&self) -> Option<std::net::IpAddr> {
        match &self.data {
            AvpData::Address(addr) => Some(*addr),
            _ => None,
        }
    }
}

/// Helper to find an AVP by code in a list
pub fn find_avp(avps: &[Avp], code: u32) -> Option<&Avp> {
    avps.iter().find(|a| a.code == code)
}

/// Helper to find an AVP by code and vendor ID in a list
pub fn find_vendor_avp(avps: &[Avp], code: u32, vendor_id: u32) -> Option<&Avp> {
    avps.iter()
        .find(|a| a.code == code && a.vendor_id == Some(vendor_id))
}

/// Helper to find all AVPs with a given code
pub fn find_all_avps(avps: &[Avp], code: u32) -> Vec<&Avp> {
    avps.iter().filter(|a| a.code == code).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::Dictionary;

    fn base_dict() -> Dictionary {
        Dictionary::base().unwrap()
    }

    fn roundtrip(dict: &Dictionary, avp: &Avp) -> Avp {
        let mut buf = BytesMut::new();
        avp.encode(&mut buf);
        assert_eq!(buf.len(), avp.encoded_len());
        let mut bytes = buf.freeze();
        let decoded = Avp::decode(&mut bytes, 0, dict).unwrap();
        assert_eq!(bytes.remaining(), 0);
        decoded
    }

    #[test]
    fn test_avp_roundtrip_u32() {
        let dict = base_dict();
        let avp = Avp::mandatory(268, AvpData::Unsigned32(2001));
        let decoded = roundtrip(&dict, &avp);
        assert_eq!(decoded, avp);
        assert_eq!(decoded.as_u32(), Some(2001));
    }

    #[test]
    fn test_avp_roundtrip_identity_with_padding() {
        let dict = base_dict();
        // 5 byte payload, 3 bytes of padding
        let avp = Avp::mandatory(264, AvpData::DiameterIdentity("mme.x".to_string()));
        let mut buf = BytesMut::new();
        avp.encode(&mut buf);
        // header 8 + data 5 padded to 8
        assert_eq!(buf.len(), 16);
        // length field counts header + data, not padding
        let length = u32::from_be_bytes([0, buf[5], buf[6], buf[7]]);
        assert_eq!(length, 13);
        let decoded = roundtrip(&dict, &avp);
        assert_eq!(decoded.as_utf8_string(), Some("mme.x"));
    }

    #[test]
    fn test_avp_unknown_code_decodes_opaque() {
        let dict = base_dict();
        let avp = Avp::new(
            991_123,
            0,
            None,
            AvpData::Unknown(Bytes::from_static(b"\x01\x02\x03\x04")),
        );
        let decoded = roundtrip(&dict, &avp);
        assert_eq!(
            decoded.data,
            AvpData::Unknown(Bytes::from_static(b"\x01\x02\x03\x04"))
        );
    }

    #[test]
    fn test_avp_vendor_specific_header() {
        let dict = base_dict();
        let avp = Avp::vendor_mandatory(1032, crate::VENDOR_ID_3GPP, AvpData::Unknown(Bytes::new()));
        assert!(avp.is_vendor_specific());
        assert!(avp.is_mandatory());
        let decoded = roundtrip(&dict, &avp);
        assert_eq!(decoded.vendor_id, Some(crate::VENDOR_ID_3GPP));
    }

    #[test]
    fn test_grouped_roundtrip_nested() {
        let dict = base_dict();
        // Vendor-Specific-Application-Id { Vendor-Id, Auth-Application-Id }
        let inner = vec![
            Avp::mandatory(266, AvpData::Unsigned32(crate::VENDOR_ID_3GPP)),
            Avp::mandatory(258, AvpData::Unsigned32(16_777_251)),
        ];
        let avp = Avp::mandatory(260, AvpData::Grouped(inner));
        let decoded = roundtrip(&dict, &avp);
        assert_eq!(decoded, avp);
        let children = decoded.as_grouped().unwrap();
        assert_eq!(children[0].as_u32(), Some(crate::VENDOR_ID_3GPP));
    }

    #[test]
    fn test_grouped_depth_limit() {
        let dict = base_dict();
        // Failed-AVP is Grouped; nest it past the depth limit.
        let mut avp = Avp::mandatory(279, AvpData::Grouped(Vec::new()));
        for _ in 0..crate::datatype::MAX_GROUPED_DEPTH + 1 {
            avp = Avp::mandatory(279, AvpData::Grouped(vec![avp]));
        }
        let mut buf = BytesMut::new();
        avp.encode(&mut buf);
        let mut bytes = buf.freeze();
        let err = Avp::decode(&mut bytes, 0, &dict).unwrap_err();
        assert!(matches!(err, DiameterError::GroupedTooDeep(_)));
    }

    #[test]
    fn test_avp_length_shorter_than_header() {
        let dict = base_dict();
        // code=268, flags=0, length=4 (< 8)
        let raw: &[u8] = &[0, 0, 1, 12, 0, 0, 0, 4];
        let mut bytes = Bytes::from_static(raw);
        assert!(Avp::decode(&mut bytes, 0, &dict).is_err());
    }

    #[test]
    fn test_avp_payload_overrun() {
        let dict = base_dict();
        // Result-Code with declared length 16 but only 4 payload bytes present
        let raw: &[u8] = &[0, 0, 1, 12, 0x40, 0, 0, 16, 0, 0, 7, 209];
        let mut bytes = Bytes::from_static(raw);
        let err = Avp::decode(&mut bytes, 0, &dict).unwrap_err();
        assert!(matches!(err, DiameterError::BufferTooSmall { .. }));
    }

    #[test]
    fn test_find_helpers() {
        let avps = vec![
            Avp::mandatory(268, AvpData::Unsigned32(2001)),
            Avp::vendor_mandatory(628, crate::VENDOR_ID_3GPP, AvpData::Unsigned32(1)),
            Avp::mandatory(268, AvpData::Unsigned32(5012)),
        ];
        assert_eq!(find_avp(&avps, 268).and_then(Avp::as_u32), Some(2001));
        assert!(find_vendor_avp(&avps, 628, crate::VENDOR_ID_3GPP).is_some());
        assert_eq!(find_all_avps(&avps, 268).len(), 2);
    }
}
