//! Diameter data types (RFC 6733 section 4.2 and 4.3)
//!
//! Every AVP payload is one of a closed set of wire-representable types.
//! `DataType` is the dictionary-side tag for a type; `AvpData` is a decoded
//! value. Payloads whose AVP code the dictionary cannot resolve stay opaque
//! as `AvpData::Unknown` so they can never be mistaken for typed data.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::avp::Avp;
use crate::dict::Dictionary;
use crate::error::{DiameterError, DiameterResult};

/// Offset between the NTP epoch (1900-01-01) used by the Time type and the
/// Unix epoch (1970-01-01), in seconds.
pub const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// Maximum nesting depth accepted when decoding Grouped AVPs.
///
/// The wire format itself imposes no limit; this bound keeps adversarial
/// input from exhausting the stack.
pub const MAX_GROUPED_DEPTH: usize = 32;

/// Dictionary-declared AVP data type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    OctetString,
    Integer32,
    Integer64,
    Unsigned32,
    Unsigned64,
    Float32,
    Float64,
    Address,
    Time,
    #[serde(rename = "UTF8String")]
    Utf8String,
    DiameterIdentity,
    #[serde(rename = "DiameterURI")]
    DiameterUri,
    Enumerated,
    /// Carried as raw octets; rule syntax is not interpreted here
    #[serde(rename = "IPFilterRule")]
    IpFilterRule,
    Grouped,
    Unknown,
}

/// A DiameterIdentity value (FQDN or realm)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Identity(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Identity(s)
    }
}

/// Decoded AVP payload
#[derive(Debug, Clone, PartialEq)]
pub enum AvpData {
    /// OctetString
    OctetString(Bytes),
    /// Integer32
    Integer32(i32),
    /// Integer64
    Integer64(i64),
    /// Unsigned32
    Unsigned32(u32),
    /// Unsigned64
    Unsigned64(u64),
    /// Float32
    Float32(f32),
    /// Float64
    Float64(f64),
    /// Address (IPv4 or IPv6, carried with a 2-byte address family)
    Address(IpAddr),
    /// Time (seconds since the NTP epoch on the wire)
    Time(SystemTime),
    /// UTF8String
    Utf8String(String),
    /// DiameterIdentity (FQDN or realm)
    DiameterIdentity(String),
    /// DiameterURI
    DiameterUri(String),
    /// Enumerated (wire-identical to Integer32)
    Enumerated(i32),
    /// Grouped AVP (contains other AVPs)
    Grouped(Vec<Avp>),
    /// Opaque payload of an AVP the dictionary does not know
    Unknown(Bytes),
}

impl AvpData {
    /// Get the encoded length of this data, excluding padding
    pub fn encoded_len(&self) -> usize {
        match self {
            AvpData::OctetString(b) | AvpData::Unknown(b) => b.len(),
            AvpData::Integer32(_) | AvpData::Unsigned32(_) | AvpData::Enumerated(_) => 4,
            AvpData::Integer64(_) | AvpData::Unsigned64(_) => 8,
            AvpData::Float32(_) | AvpData::Time(_) => 4,
            AvpData::Float64(_) => 8,
            AvpData::Address(addr) => match addr {
                IpAddr::V4(_) => 6,  // 2 bytes family + 4 bytes address
                IpAddr::V6(_) => 18, // 2 bytes family + 16 bytes address
            },
            AvpData::Utf8String(s) | AvpData::DiameterIdentity(s) | AvpData::DiameterUri(s) => {
                s.len()
            }
            AvpData::Grouped(avps) => avps.iter().map(|a| a.encoded_len()).sum(),
        }
    }

    /// The type tag this value carries
    pub fn data_type(&self) -> DataType {
        match self {
            AvpData::OctetString(_) => DataType::OctetString,
            AvpData::Integer32(_) => DataType::Integer32,
            AvpData::Integer64(_) => DataType::Integer64,
            AvpData::Unsigned32(_) => DataType::Unsigned32,
            AvpData::Unsigned64(_) => DataType::Unsigned64,
            AvpData::Float32(_) => DataType::Float32,
            AvpData::Float64(_) => DataType::Float64,
            AvpData::Address(_) => DataType::Address,
            AvpData::Time(_) => DataType::Time,
            AvpData::Utf8String(_) => DataType::Utf8String,
            AvpData::DiameterIdentity(_) => DataType::DiameterIdentity,
            AvpData::DiameterUri(_) => DataType::DiameterUri,
            AvpData::Enumerated(_) => DataType::Enumerated,
            AvpData::Grouped(_) => DataType::Grouped,
            AvpData::Unknown(_) => DataType::Unknown,
        }
    }

    /// Encode data to bytes (without padding; the AVP layer pads)
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            AvpData::OctetString(b) | AvpData::Unknown(b) => buf.put_slice(b),
            AvpData::Integer32(v) | AvpData::Enumerated(v) => buf.put_i32(*v),
            AvpData::Integer64(v) => buf.put_i64(*v),
            AvpData::Unsigned32(v) => buf.put_u32(*v),
            AvpData::Unsigned64(v) => buf.put_u64(*v),
            AvpData::Float32(v) => buf.put_f32(*v),
            AvpData::Float64(v) => buf.put_f64(*v),
            AvpData::Time(t) => {
                let unix = t
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                // Seconds wrap modulo 2^32 into the next NTP era in 2036,
                // per the RFC 5905 era convention.
                buf.put_u32(((unix + NTP_EPOCH_OFFSET) & 0xFFFF_FFFF) as u32);
            }
            AvpData::Address(addr) => match addr {
                IpAddr::V4(v4) => {
                    buf.put_u16(1); // AddressFamily: IPv4
                    buf.put_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    buf.put_u16(2); // AddressFamily: IPv6
                    buf.put_slice(&v6.octets());
                }
            },
            AvpData::Utf8String(s) | AvpData::DiameterIdentity(s) | AvpData::DiameterUri(s) => {
                buf.put_slice(s.as_bytes())
            }
            AvpData::Grouped(avps) => {
                for avp in avps {
                    avp.encode(buf);
                }
            }
        }
    }

    /// Decode a payload of the given dictionary type.
    ///
    /// `app_id` and `dict` are needed to type the children of Grouped
    /// payloads; `depth` is the current Grouped nesting level.
    pub fn decode(
        ty: DataType,
        mut data: Bytes,
        app_id: u32,
        dict: &Dictionary,
        depth: usize,
    ) -> DiameterResult<Self> {
        match ty {
            DataType::OctetString | DataType::IpFilterRule => Ok(AvpData::OctetString(data)),
            DataType::Unknown => Ok(AvpData::Unknown(data)),
            DataType::Integer32 => {
                check_len(&data, 4)?;
                Ok(AvpData::Integer32(data.get_i32()))
            }
            DataType::Integer64 => {
                check_len(&data, 8)?;
                Ok(AvpData::Integer64(data.get_i64()))
            }
            DataType::Unsigned32 => {
                check_len(&data, 4)?;
                Ok(AvpData::Unsigned32(data.get_u32()))
            }
            DataType::Unsigned64 => {
                check_len(&data, 8)?;
                Ok(AvpData::Unsigned64(data.get_u64()))
            }
            DataType::Float32 => {
                check_len(&data, 4)?;
                Ok(AvpData::Float32(data.get_f32()))
            }
            DataType::Float64 => {
                check_len(&data, 8)?;
                Ok(AvpData::Float64(data.get_f64()))
            }
            DataType::Enumerated => {
                check_len(&data, 4)?;
                Ok(AvpData::Enumerated(data.get_i32()))
            }
            DataType::Time => {
                check_len(&data, 4)?;
                let secs = data.get_u32() as u64;
                let unix = secs.saturating_sub(NTP_EPOCH_OFFSET);
                Ok(AvpData::Time(UNIX_EPOCH + Duration::from_secs(unix)))
            }
            DataType::Address => {
                if data.len() < 2 {
                    return Err(DiameterError::InvalidAvpValue(format!(
                        "Address payload of {} bytes is too short",
                        data.len()
                    )));
                }
                let family = data.get_u16();
                match family {
                    1 if data.len() == 4 => {
                        let mut octets = [0u8; 4];
                        data.copy_to_slice(&mut octets);
                        Ok(AvpData::Address(IpAddr::V4(Ipv4Addr::from(octets))))
                    }
                    2 if data.len() == 16 => {
                        let mut octets = [0u8; 16];
                        data.copy_to_slice(&mut octets);
                        Ok(AvpData::Address(IpAddr::V6(Ipv6Addr::from(octets))))
                    }
                    _ => Err(DiameterError::InvalidAvpValue(format!(
                        "unsupported address family {} with {} payload bytes",
                        family,
                        data.len()
                    ))),
                }
            }
            DataType::Utf8String => Ok(AvpData::Utf8String(decode_utf8(data)?)),
            DataType::DiameterIdentity => Ok(AvpData::DiameterIdentity(decode_utf8(data)?)),
            DataType::DiameterUri => Ok(AvpData::DiameterUri(decode_utf8(data)?)),
            DataType::Grouped => {
                if depth >= MAX_GROUPED_DEPTH {
                    return Err(DiameterError::GroupedTooDeep(MAX_GROUPED_DEPTH));
                }
                let mut avps = Vec::new();
                while data.has_remaining() {
                    avps.push(Avp::decode_at_depth(&mut data, app_id, dict, depth + 1)?);
                }
                Ok(AvpData::Grouped(avps))
            }
        }
    }
}

fn check_len(data: &Bytes, want: usize) -> DiameterResult<()> {
    if data.len() != want {
        return Err(DiameterError::InvalidAvpValue(format!(
            "expected {} payload bytes, have {}",
            want,
            data.len()
        )));
    }
    Ok(())
}

fn decode_utf8(data: Bytes) -> DiameterResult<String> {
    String::from_utf8(data.to_vec())
        .map_err(|e| DiameterError::InvalidAvpValue(format!("invalid UTF-8 payload: {e}")))
}
