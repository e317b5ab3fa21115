//! Declarative marshaling between Rust structs and AVP trees
//!
//! A message shape is declared once with [`diameter_struct!`], naming the
//! dictionary AVP each field binds to and how often it may occur:
//!
//! ```ignore
//! diameter_struct! {
//!     pub struct Dwr {
//!         "Origin-Host" => origin_host: one Identity,
//!         "Origin-Realm" => origin_realm: one Identity,
//!         "Origin-State-Id" => origin_state_id: opt u32,
//!     }
//! }
//! ```
//!
//! `one` fields always emit and take their default when absent on decode
//! (presence checking belongs to message-level sanity checks), `opt` fields
//! are `Option<T>` and emit nothing when `None`, `many` fields are `Vec<T>`.
//!
//! Name-to-definition resolution happens once per (shape, application) pair
//! and is cached in the dictionary; after the first call marshaling touches
//! no name strings.

use std::net::IpAddr;
use std::time::SystemTime;

use bytes::Bytes;

use crate::avp::{avp_flags, Avp};
use crate::datatype::{AvpData, DataType, Identity};
use crate::dict::{AvpDef, Dictionary};
use crate::error::{DiameterError, DiameterResult};
use crate::message::DiameterMessage;

/// A value that can occupy a single AVP payload.
///
/// Implemented for the scalar payload types; [`diameter_struct!`] also
/// implements it for every declared shape, which occupies a Grouped
/// payload.
pub trait AvpEncode: Sized {
    fn encode_avp(&self, def: &AvpDef, app_id: u32, dict: &Dictionary) -> DiameterResult<AvpData>;
    fn decode_avp(avp: &Avp, def: &AvpDef, app_id: u32, dict: &Dictionary) -> DiameterResult<Self>;
}

fn mismatch(def: &AvpDef) -> DiameterError {
    DiameterError::TypeMismatch {
        avp: def.name.clone(),
        expected: def.data,
    }
}

impl AvpEncode for u32 {
    fn encode_avp(&self, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<AvpData> {
        match def.data {
            DataType::Unsigned32 => Ok(AvpData::Unsigned32(*self)),
            _ => Err(mismatch(def)),
        }
    }

    fn decode_avp(avp: &Avp, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<Self> {
        avp.as_u32().ok_or_else(|| mismatch(def))
    }
}

impl AvpEncode for u64 {
    fn encode_avp(&self, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<AvpData> {
        match def.data {
            DataType::Unsigned64 => Ok(AvpData::Unsigned64(*self)),
            _ => Err(mismatch(def)),
        }
    }

    fn decode_avp(avp: &Avp, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<Self> {
        avp.as_u64().ok_or_else(|| mismatch(def))
    }
}

impl AvpEncode for i32 {
    fn encode_avp(&self, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<AvpData> {
        match def.data {
            DataType::Integer32 => Ok(AvpData::Integer32(*self)),
            DataType::Enumerated => Ok(AvpData::Enumerated(*self)),
            _ => Err(mismatch(def)),
        }
    }

    fn decode_avp(avp: &Avp, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<Self> {
        avp.as_i32().ok_or_else(|| mismatch(def))
    }
}

impl AvpEncode for i64 {
    fn encode_avp(&self, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<AvpData> {
        match def.data {
            DataType::Integer64 => Ok(AvpData::Integer64(*self)),
            _ => Err(mismatch(def)),
        }
    }

    fn decode_avp(avp: &Avp, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<Self> {
        match &avp.data {
            AvpData::Integer64(v) => Ok(*v),
            _ => Err(mismatch(def)),
        }
    }
}

impl AvpEncode for f32 {
    fn encode_avp(&self, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<AvpData> {
        match def.data {
            DataType::Float32 => Ok(AvpData::Float32(*self)),
            _ => Err(mismatch(def)),
        }
    }

    fn decode_avp(avp: &Avp, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<Self> {
        match &avp.data {
            AvpData::Float32(v) => Ok(*v),
            _ => Err(mismatch(def)),
        }
    }
}

impl AvpEncode for f64 {
    fn encode_avp(&self, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<AvpData> {
        match def.data {
            DataType::Float64 => Ok(AvpData::Float64(*self)),
            _ => Err(mismatch(def)),
        }
    }

    fn decode_avp(avp: &Avp, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<Self> {
        match &avp.data {
            AvpData::Float64(v) => Ok(*v),
            _ => Err(mismatch(def)),
        }
    }
}

impl AvpEncode for String {
    fn encode_avp(&self, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<AvpData> {
        match def.data {
            DataType::Utf8String => Ok(AvpData::Utf8String(self.clone())),
            DataType::DiameterIdentity => Ok(AvpData::DiameterIdentity(self.clone())),
            DataType::DiameterUri => Ok(AvpData::DiameterUri(self.clone())),
            _ => Err(mismatch(def)),
        }
    }

    fn decode_avp(avp: &Avp, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<Self> {
        avp.as_utf8_string()
            .map(str::to_string)
            .ok_or_else(|| mismatch(def))
    }
}

impl AvpEncode for Identity {
    fn encode_avp(&self, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<AvpData> {
        match def.data {
            DataType::DiameterIdentity => Ok(AvpData::DiameterIdentity(self.0.clone())),
            _ => Err(mismatch(def)),
        }
    }

    fn decode_avp(avp: &Avp, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<Self> {
        match &avp.data {
            AvpData::DiameterIdentity(s) => Ok(Identity(s.clone())),
            _ => Err(mismatch(def)),
        }
    }
}

impl AvpEncode for Bytes {
    fn encode_avp(&self, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<AvpData> {
        match def.data {
            DataType::OctetString => Ok(AvpData::OctetString(self.clone())),
            _ => Err(mismatch(def)),
        }
    }

    fn decode_avp(avp: &Avp, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<Self> {
        avp.as_octet_string().cloned().ok_or_else(|| mismatch(def))
    }
}

impl AvpEncode for IpAddr {
    fn encode_avp(&self, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<AvpData> {
        match def.data {
            DataType::Address => Ok(AvpData::Address(*self)),
            _ => Err(mismatch(def)),
        }
    }

    fn decode_avp(avp: &Avp, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<Self> {
        avp.as_address().ok_or_else(|| mismatch(def))
    }
}

impl AvpEncode for SystemTime {
    fn encode_avp(&self, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<AvpData> {
        match def.data {
            DataType::Time => Ok(AvpData::Time(*self)),
            _ => Err(mismatch(def)),
        }
    }

    fn decode_avp(avp: &Avp, def: &AvpDef, _: u32, _: &Dictionary) -> DiameterResult<Self> {
        match &avp.data {
            AvpData::Time(t) => Ok(*t),
            _ => Err(mismatch(def)),
        }
    }
}

/// A struct bound to a set of AVPs, declared with [`diameter_struct!`].
pub trait DiameterStruct: Sized + 'static {
    /// Dictionary AVP names, in field order
    const AVP_NAMES: &'static [&'static str];

    /// Marshal the fields into AVPs under the given application
    fn to_avps(&self, app_id: u32, dict: &Dictionary) -> DiameterResult<Vec<Avp>>;

    /// Unmarshal the fields from a flat AVP list
    fn from_avps(avps: &[Avp], app_id: u32, dict: &Dictionary) -> DiameterResult<Self>;

    /// Marshal the fields into a message, after any AVPs already present
    fn marshal(&self, msg: &mut DiameterMessage, dict: &Dictionary) -> DiameterResult<()> {
        for avp in self.to_avps(msg.header.application_id, dict)? {
            msg.add_avp(avp);
        }
        Ok(())
    }

    /// Unmarshal the fields from a message
    fn unmarshal(msg: &DiameterMessage, dict: &Dictionary) -> DiameterResult<Self> {
        Self::from_avps(&msg.avps, msg.header.application_id, dict)
    }
}

/// The error a declared shape reports when its AVP is not Grouped.
/// Used by the [`diameter_struct!`] expansion.
pub fn grouped_mismatch(def: &AvpDef) -> DiameterError {
    mismatch(def)
}

/// Build an AVP carrying `data` with the flags the definition prescribes.
pub fn avp_from_def(def: &AvpDef, data: AvpData) -> Avp {
    let mut flags = 0u8;
    if def.mandatory {
        flags |= avp_flags::MANDATORY;
    }
    if def.protected {
        flags |= avp_flags::PROTECTED;
    }
    let vendor_id = if def.vendor_id != 0 {
        flags |= avp_flags::VENDOR;
        Some(def.vendor_id)
    } else {
        None
    };
    Avp::new(def.code, flags, vendor_id, data)
}

fn matches_def(avp: &Avp, def: &AvpDef) -> bool {
    avp.code == def.code && avp.vendor_key() == def.vendor_id
}

pub fn emit_one<T: AvpEncode>(
    out: &mut Vec<Avp>,
    value: &T,
    def: &AvpDef,
    app_id: u32,
    dict: &Dictionary,
) -> DiameterResult<()> {
    let data = value.encode_avp(def, app_id, dict)?;
    out.push(avp_from_def(def, data));
    Ok(())
}

pub fn emit_opt<T: AvpEncode>(
    out: &mut Vec<Avp>,
    value: &Option<T>,
    def: &AvpDef,
    app_id: u32,
    dict: &Dictionary,
) -> DiameterResult<()> {
    if let Some(value) = value {
        emit_one(out, value, def, app_id, dict)?;
    }
    Ok(())
}

pub fn emit_many<T: AvpEncode>(
    out: &mut Vec<Avp>,
    values: &[T],
    def: &AvpDef,
    app_id: u32,
    dict: &Dictionary,
) -> DiameterResult<()> {
    for value in values {
        emit_one(out, value, def, app_id, dict)?;
    }
    Ok(())
}

pub fn extract_one<T: AvpEncode + Default>(
    avps: &[Avp],
    def: &AvpDef,
    app_id: u32,
    dict: &Dictionary,
) -> DiameterResult<T> {
    match avps.iter().find(|a| matches_def(a, def)) {
        Some(avp) => T::decode_avp(avp, def, app_id, dict),
        None => Ok(T::default()),
    }
}

pub fn extract_opt<T: AvpEncode>(
    avps: &[Avp],
    def: &AvpDef,
    app_id: u32,
    dict: &Dictionary,
) -> DiameterResult<Option<T>> {
    match avps.iter().find(|a| matches_def(a, def)) {
        Some(avp) => Ok(Some(T::decode_avp(avp, def, app_id, dict)?)),
        None => Ok(None),
    }
}

pub fn extract_many<T: AvpEncode>(
    avps: &[Avp],
    def: &AvpDef,
    app_id: u32,
    dict: &Dictionary,
) -> DiameterResult<Vec<T>> {
    let mut out = Vec::new();
    for avp in avps.iter().filter(|a| matches_def(a, def)) {
        out.push(T::decode_avp(avp, def, app_id, dict)?);
    }
    Ok(out)
}

/// Declare a struct bound to a set of dictionary AVPs.
///
/// Each field line reads `"Avp-Name" => field: kind Type` where kind is
/// `one`, `opt` or `many`. The struct derives `Debug`, `Clone`, `Default`
/// and `PartialEq` and implements [`DiameterStruct`].
#[macro_export]
macro_rules! diameter_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $avp:literal => $field:ident : $kind:ident $ty:ty ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            $( pub $field: $crate::diameter_struct!(@fieldty $kind $ty), )+
        }

        impl $crate::marshal::DiameterStruct for $name {
            const AVP_NAMES: &'static [&'static str] = &[ $( $avp ),+ ];

            fn to_avps(
                &self,
                app_id: u32,
                dict: &$crate::dict::Dictionary,
            ) -> $crate::error::DiameterResult<::std::vec::Vec<$crate::avp::Avp>> {
                let binding = dict.binding_for(
                    ::std::any::TypeId::of::<Self>(),
                    app_id,
                    Self::AVP_NAMES,
                )?;
                let mut out = ::std::vec::Vec::new();
                let mut idx = 0usize;
                $(
                    $crate::diameter_struct!(
                        @emit $kind, out, self.$field, &binding.defs[idx], app_id, dict
                    );
                    idx += 1;
                )+
                let _ = idx;
                ::std::result::Result::Ok(out)
            }

            fn from_avps(
                avps: &[$crate::avp::Avp],
                app_id: u32,
                dict: &$crate::dict::Dictionary,
            ) -> $crate::error::DiameterResult<Self> {
                let binding = dict.binding_for(
                    ::std::any::TypeId::of::<Self>(),
                    app_id,
                    Self::AVP_NAMES,
                )?;
                let mut idx = 0usize;
                $(
                    let $field = $crate::diameter_struct!(
                        @extract $kind, avps, &binding.defs[idx], app_id, dict
                    )?;
                    idx += 1;
                )+
                let _ = idx;
                ::std::result::Result::Ok(Self { $( $field ),+ })
            }
        }

        // A declared shape can also occupy a Grouped payload, which is
        // what makes nested grouped fields work.
        impl $crate::marshal::AvpEncode for $name {
            fn encode_avp(
                &self,
                def: &$crate::dict::AvpDef,
                app_id: u32,
                dict: &$crate::dict::Dictionary,
            ) -> $crate::error::DiameterResult<$crate::datatype::AvpData> {
                if def.data != $crate::datatype::DataType::Grouped {
                    return ::std::result::Result::Err($crate::marshal::grouped_mismatch(def));
                }
                ::std::result::Result::Ok($crate::datatype::AvpData::Grouped(
                    <Self as $crate::marshal::DiameterStruct>::to_avps(self, app_id, dict)?,
                ))
            }

            fn decode_avp(
                avp: &$crate::avp::Avp,
                def: &$crate::dict::AvpDef,
                app_id: u32,
                dict: &$crate::dict::Dictionary,
            ) -> $crate::error::DiameterResult<Self> {
                match avp.as_grouped() {
                    ::std::option::Option::Some(children) => {
                        <Self as $crate::marshal::DiameterStruct>::from_avps(children, app_id, dict)
                    }
                    ::std::option::Option::None => {
                        ::std::result::Result::Err($crate::marshal::grouped_mismatch(def))
                    }
                }
            }
        }
    };

    (@fieldty one $ty:ty) => { $ty };
    (@fieldty opt $ty:ty) => { ::std::option::Option<$ty> };
    (@fieldty many $ty:ty) => { ::std::vec::Vec<$ty> };

    (@emit one, $out:ident, $value:expr, $def:expr, $app:expr, $dict:expr) => {
        $crate::marshal::emit_one(&mut $out, &$value, $def, $app, $dict)?
    };
    (@emit opt, $out:ident, $value:expr, $def:expr, $app:expr, $dict:expr) => {
        $crate::marshal::emit_opt(&mut $out, &$value, $def, $app, $dict)?
    };
    (@emit many, $out:ident, $value:expr, $def:expr, $app:expr, $dict:expr) => {
        $crate::marshal::emit_many(&mut $out, &$value, $def, $app, $dict)?
    };

    (@extract one, $avps:expr, $def:expr, $app:expr, $dict:expr) => {
        $crate::marshal::extract_one($avps, $def, $app, $dict)
    };
    (@extract opt, $avps:expr, $def:expr, $app:expr, $dict:expr) => {
        $crate::marshal::extract_opt($avps, $def, $app, $dict)
    };
    (@extract many, $avps:expr, $def:expr, $app:expr, $dict:expr) => {
        $crate::marshal::extract_many($avps, $def, $app, $dict)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::avp_code;
    use bytes::BytesMut;

    diameter_struct! {
        struct AppId {
            "Vendor-Id" => vendor_id: one u32,
            "Auth-Application-Id" => auth_application_id: opt u32,
            "Acct-Application-Id" => acct_application_id: opt u32,
        }
    }

    diameter_struct! {
        struct Probe {
            "Session-Id" => session_id: one String,
            "Origin-Host" => origin_host: one Identity,
            "Host-IP-Address" => host_ip_address: many IpAddr,
            "Vendor-Specific-Application-Id" => vsai: many AppId,
            "Firmware-Revision" => firmware_revision: opt u32,
            "Event-Timestamp" => event_timestamp: opt SystemTime,
        }
    }

    fn base_dict() -> Dictionary {
        Dictionary::base().unwrap()
    }

    fn sample() -> Probe {
        Probe {
            session_id: "hss.example.org;1;2".to_string(),
            origin_host: Identity::from("hss.example.org"),
            host_ip_address: vec!["10.0.0.1".parse().unwrap(), "2001:db8::1".parse().unwrap()],
            vsai: vec![
                AppId {
                    vendor_id: crate::VENDOR_ID_3GPP,
                    auth_application_id: Some(16_777_251),
                    acct_application_id: None,
                },
                AppId {
                    vendor_id: crate::VENDOR_ID_3GPP,
                    auth_application_id: Some(16_777_216),
                    acct_application_id: None,
                },
            ],
            firmware_revision: None,
            event_timestamp: None,
        }
    }

    #[test]
    fn test_marshal_unmarshal_symmetry() {
        let dict = base_dict();
        let probe = sample();
        let mut msg = DiameterMessage::new_request(257, 0);
        probe.marshal(&mut msg, &dict).unwrap();

        let decoded = Probe::unmarshal(&msg, &dict).unwrap();
        assert_eq!(decoded, probe);
    }

    #[test]
    fn test_marshal_survives_the_wire() {
        let dict = base_dict();
        let probe = sample();
        let mut msg = DiameterMessage::new_request(257, 0);
        probe.marshal(&mut msg, &dict).unwrap();

        let mut bytes = msg.encode().freeze();
        let parsed = DiameterMessage::decode(&mut bytes, &dict).unwrap();
        let decoded = Probe::unmarshal(&parsed, &dict).unwrap();
        assert_eq!(decoded, probe);
    }

    #[test]
    fn test_opt_none_emits_nothing() {
        let dict = base_dict();
        let probe = sample();
        let avps = probe.to_avps(0, &dict).unwrap();
        assert!(!avps
            .iter()
            .any(|a| a.code == avp_code::FIRMWARE_REVISION));
        // 1 Session-Id + 1 Origin-Host + 2 addresses + 2 groups
        assert_eq!(avps.len(), 6);
    }

    #[test]
    fn test_opt_some_roundtrips() {
        let dict = base_dict();
        let mut probe = sample();
        probe.firmware_revision = Some(42);
        let avps = probe.to_avps(0, &dict).unwrap();
        let decoded = Probe::from_avps(&avps, 0, &dict).unwrap();
        assert_eq!(decoded.firmware_revision, Some(42));
    }

    #[test]
    fn test_one_defaults_when_absent() {
        let dict = base_dict();
        let decoded = Probe::from_avps(&[], 0, &dict).unwrap();
        assert_eq!(decoded.session_id, "");
        assert!(decoded.origin_host.is_empty());
        assert!(decoded.vsai.is_empty());
    }

    #[test]
    fn test_flags_follow_definition() {
        let dict = base_dict();
        let probe = sample();
        let avps = probe.to_avps(0, &dict).unwrap();
        // Origin-Host is mandatory in the base dictionary
        let oh = crate::avp::find_avp(&avps, avp_code::ORIGIN_HOST).unwrap();
        assert!(oh.is_mandatory());
        // Firmware-Revision must not carry the M flag
        let mut probe = probe;
        probe.firmware_revision = Some(1);
        let avps = probe.to_avps(0, &dict).unwrap();
        let fw = crate::avp::find_avp(&avps, avp_code::FIRMWARE_REVISION).unwrap();
        assert!(!fw.is_mandatory());
    }

    #[test]
    fn test_unknown_avp_name_fails() {
        diameter_struct! {
            struct Bogus {
                "No-Such-AVP-Name" => x: one u32,
            }
        }
        let dict = base_dict();
        let err = Bogus { x: 1 }.to_avps(0, &dict).unwrap_err();
        assert!(matches!(err, DiameterError::UnknownAvpName { .. }));
    }

    #[test]
    fn test_type_mismatch_on_decode() {
        diameter_struct! {
            struct WrongType {
                "Origin-Host" => origin_host: one u32,
            }
        }
        let dict = base_dict();
        // A well-typed Origin-Host on the wire cannot decode into a u32 field.
        let avps = vec![Avp::mandatory(
            avp_code::ORIGIN_HOST,
            AvpData::DiameterIdentity("peer.example.org".to_string()),
        )];
        let err = WrongType::from_avps(&avps, 0, &dict).unwrap_err();
        assert!(matches!(err, DiameterError::TypeMismatch { .. }));
        // And the field cannot encode into an identity-typed AVP either.
        let err = WrongType { origin_host: 7 }.to_avps(0, &dict).unwrap_err();
        assert!(matches!(err, DiameterError::TypeMismatch { .. }));
    }

    #[test]
    fn test_unmarshal_ignores_foreign_avps() {
        let dict = base_dict();
        let mut avps = sample().to_avps(0, &dict).unwrap();
        avps.push(Avp::mandatory(
            avp_code::ORIGIN_STATE_ID,
            AvpData::Unsigned32(99),
        ));
        let decoded = Probe::from_avps(&avps, 0, &dict).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_binding_reused_across_calls() {
        let dict = base_dict();
        let probe = sample();
        // Second call hits the cached binding; behavior must be identical.
        let a = probe.to_avps(0, &dict).unwrap();
        let b = probe.to_avps(0, &dict).unwrap();
        assert_eq!(a, b);
        let mut buf = BytesMut::new();
        for avp in &a {
            avp.encode(&mut buf);
        }
        assert!(!buf.is_empty());
    }
}
