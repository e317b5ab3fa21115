//! Base protocol message shapes and handshake validation
//!
//! The capabilities exchange, watchdog and disconnect commands are declared
//! with [`diameter_struct!`] and carry `parse` constructors that check the
//! message-level requirements the field kinds alone cannot express: which
//! identities must be present, whether the peers share an application, and
//! whether the advertised security modes are compatible. Each failure cause
//! is a distinct error variant so the caller can answer with the matching
//! Result-Code.

use crate::avp::Avp;
use crate::datatype::{AvpData, Identity};
use crate::dict::{avp_code, Dictionary};
use crate::diameter_struct;
use crate::error::{is_success_code, DiameterError, DiameterResult, ResultCode};
use crate::marshal::{avp_from_def, DiameterStruct};
use crate::message::DiameterMessage;
use crate::RELAY_APPLICATION_ID;

use std::net::IpAddr;

/// Inband-Security-Id values (RFC 6733)
pub const NO_INBAND_SECURITY: u32 = 0;
pub const TLS_INBAND_SECURITY: u32 = 1;

/// Disconnect-Cause values (RFC 6733)
pub mod disconnect_cause {
    pub const REBOOTING: i32 = 0;
    pub const BUSY: i32 = 1;
    pub const DO_NOT_WANT_TO_TALK_TO_YOU: i32 = 2;
}

diameter_struct! {
    /// Vendor-Specific-Application-Id grouped AVP
    pub struct VendorSpecificApplicationId {
        "Vendor-Id" => vendor_id: one u32,
        "Auth-Application-Id" => auth_application_id: opt u32,
        "Acct-Application-Id" => acct_application_id: opt u32,
    }
}

impl VendorSpecificApplicationId {
    /// The application id this group advertises, if any
    pub fn application_id(&self) -> Option<u32> {
        self.auth_application_id.or(self.acct_application_id)
    }
}

diameter_struct! {
    /// Capabilities-Exchange-Request
    pub struct Cer {
        "Origin-Host" => origin_host: one Identity,
        "Origin-Realm" => origin_realm: one Identity,
        "Host-IP-Address" => host_ip_address: many IpAddr,
        "Vendor-Id" => vendor_id: one u32,
        "Product-Name" => product_name: one String,
        "Origin-State-Id" => origin_state_id: opt u32,
        "Supported-Vendor-Id" => supported_vendor_id: many u32,
        "Auth-Application-Id" => auth_application_id: many u32,
        "Inband-Security-Id" => inband_security_id: many u32,
        "Acct-Application-Id" => acct_application_id: many u32,
        "Vendor-Specific-Application-Id" => vendor_specific_application_id: many VendorSpecificApplicationId,
        "Firmware-Revision" => firmware_revision: opt u32,
    }
}

diameter_struct! {
    /// Capabilities-Exchange-Answer
    pub struct Cea {
        "Result-Code" => result_code: one u32,
        "Origin-Host" => origin_host: one Identity,
        "Origin-Realm" => origin_realm: one Identity,
        "Host-IP-Address" => host_ip_address: many IpAddr,
        "Vendor-Id" => vendor_id: one u32,
        "Product-Name" => product_name: one String,
        "Origin-State-Id" => origin_state_id: opt u32,
        "Error-Message" => error_message: opt String,
        "Supported-Vendor-Id" => supported_vendor_id: many u32,
        "Auth-Application-Id" => auth_application_id: many u32,
        "Inband-Security-Id" => inband_security_id: many u32,
        "Acct-Application-Id" => acct_application_id: many u32,
        "Vendor-Specific-Application-Id" => vendor_specific_application_id: many VendorSpecificApplicationId,
        "Firmware-Revision" => firmware_revision: opt u32,
    }
}

diameter_struct! {
    /// Device-Watchdog-Request
    pub struct Dwr {
        "Origin-Host" => origin_host: one Identity,
        "Origin-Realm" => origin_realm: one Identity,
        "Origin-State-Id" => origin_state_id: opt u32,
    }
}

diameter_struct! {
    /// Device-Watchdog-Answer
    pub struct Dwa {
        "Result-Code" => result_code: one u32,
        "Origin-Host" => origin_host: one Identity,
        "Origin-Realm" => origin_realm: one Identity,
        "Error-Message" => error_message: opt String,
        "Origin-State-Id" => origin_state_id: opt u32,
    }
}

diameter_struct! {
    /// Disconnect-Peer-Request
    pub struct Dpr {
        "Origin-Host" => origin_host: one Identity,
        "Origin-Realm" => origin_realm: one Identity,
        "Disconnect-Cause" => disconnect_cause: one i32,
    }
}

diameter_struct! {
    /// Disconnect-Peer-Answer
    pub struct Dpa {
        "Result-Code" => result_code: one u32,
        "Origin-Host" => origin_host: one Identity,
        "Origin-Realm" => origin_realm: one Identity,
        "Error-Message" => error_message: opt String,
    }
}

fn require_identities(origin_host: &Identity, origin_realm: &Identity) -> DiameterResult<()> {
    if origin_host.is_empty() {
        return Err(DiameterError::MissingOriginHost);
    }
    if origin_realm.is_empty() {
        return Err(DiameterError::MissingOriginRealm);
    }
    Ok(())
}

impl Cer {
    /// Unmarshal and sanity-check a CER
    pub fn parse(msg: &DiameterMessage, dict: &Dictionary) -> DiameterResult<Self> {
        let cer = Self::unmarshal(msg, dict)?;
        require_identities(&cer.origin_host, &cer.origin_realm)?;
        if cer.advertised_applications().is_empty() {
            return Err(DiameterError::MissingApplication);
        }
        Ok(cer)
    }

    /// Every application id the peer advertises, in AVP order
    pub fn advertised_applications(&self) -> Vec<u32> {
        collect_applications(
            &self.auth_application_id,
            &self.acct_application_id,
            &self.vendor_specific_application_id,
        )
    }

    /// Check the advertised security modes.
    ///
    /// Absence means no inband security, which is always acceptable. An
    /// Inband-Security-Id list that offers neither plain transport nor TLS
    /// has nothing in common with us.
    pub fn validate_security(&self) -> DiameterResult<()> {
        validate_security(&self.inband_security_id)
    }

    /// Intersect the advertised applications with what the dictionary
    /// serves. Failure carries a Failed-AVP group holding the advertised
    /// application AVPs, ready to attach to the CEA.
    pub fn validate_applications(&self, dict: &Dictionary) -> DiameterResult<Vec<u32>> {
        let advertised = self.advertised_applications();
        let common: Vec<u32> = advertised
            .iter()
            .copied()
            .filter(|&id| dict.supports_application(id))
            .collect();
        if common.is_empty() {
            return Err(DiameterError::NoCommonApplication {
                failed_avp: failed_application_avp(&advertised, dict),
            });
        }
        Ok(common)
    }
}

impl Cea {
    /// Unmarshal and sanity-check a CEA.
    ///
    /// A non-success Result-Code is reported as
    /// [`DiameterError::FailedResultCode`] since the election is over at
    /// that point; identity checks come first so a malformed success answer
    /// is still rejected as malformed.
    pub fn parse(msg: &DiameterMessage, dict: &Dictionary) -> DiameterResult<Self> {
        let cea = Self::unmarshal(msg, dict)?;
        require_identities(&cea.origin_host, &cea.origin_realm)?;
        if !is_success_code(cea.result_code) {
            return Err(DiameterError::FailedResultCode(cea.result_code));
        }
        if cea.advertised_applications().is_empty() {
            return Err(DiameterError::MissingApplication);
        }
        Ok(cea)
    }

    /// Every application id the peer advertises, in AVP order
    pub fn advertised_applications(&self) -> Vec<u32> {
        collect_applications(
            &self.auth_application_id,
            &self.acct_application_id,
            &self.vendor_specific_application_id,
        )
    }
}

impl Dwr {
    /// Unmarshal and sanity-check a DWR
    pub fn parse(msg: &DiameterMessage, dict: &Dictionary) -> DiameterResult<Self> {
        let dwr = Self::unmarshal(msg, dict)?;
        require_identities(&dwr.origin_host, &dwr.origin_realm)?;
        Ok(dwr)
    }
}

impl Dwa {
    /// Unmarshal and sanity-check a DWA
    pub fn parse(msg: &DiameterMessage, dict: &Dictionary) -> DiameterResult<Self> {
        let dwa = Self::unmarshal(msg, dict)?;
        require_identities(&dwa.origin_host, &dwa.origin_realm)?;
        Ok(dwa)
    }
}

impl Dpr {
    /// Unmarshal and sanity-check a DPR
    pub fn parse(msg: &DiameterMessage, dict: &Dictionary) -> DiameterResult<Self> {
        let dpr = Self::unmarshal(msg, dict)?;
        require_identities(&dpr.origin_host, &dpr.origin_realm)?;
        Ok(dpr)
    }
}

fn collect_applications(
    auth: &[u32],
    acct: &[u32],
    vsai: &[VendorSpecificApplicationId],
) -> Vec<u32> {
    let mut apps = Vec::new();
    let mut push = |id: u32| {
        if !apps.contains(&id) {
            apps.push(id);
        }
    };
    for &id in auth {
        push(id);
    }
    for &id in acct {
        push(id);
    }
    for group in vsai {
        if let Some(id) = group.application_id() {
            push(id);
        }
    }
    apps
}

fn validate_security(inband_security_id: &[u32]) -> DiameterResult<()> {
    if inband_security_id.is_empty() {
        return Ok(());
    }
    if inband_security_id
        .iter()
        .any(|&id| id == NO_INBAND_SECURITY || id == TLS_INBAND_SECURITY)
    {
        return Ok(());
    }
    Err(DiameterError::NoCommonSecurity)
}

/// Intersect a peer's advertised applications with our own.
///
/// A relay on either side makes every advertised application common. An
/// empty intersection fails with a Failed-AVP ready to attach to the CEA.
pub fn common_applications(
    advertised: &[u32],
    local: &[u32],
    dict: &Dictionary,
) -> DiameterResult<Vec<u32>> {
    let local_relay = local.contains(&RELAY_APPLICATION_ID);
    let common: Vec<u32> = advertised
        .iter()
        .copied()
        .filter(|&id| id == RELAY_APPLICATION_ID || local_relay || local.contains(&id))
        .collect();
    if common.is_empty() {
        return Err(DiameterError::NoCommonApplication {
            failed_avp: failed_application_avp(advertised, dict),
        });
    }
    Ok(common)
}

/// Build a Failed-AVP group holding the peer's advertised application AVPs.
fn failed_application_avp(advertised: &[u32], dict: &Dictionary) -> Avp {
    let inner: Vec<Avp> = advertised
        .iter()
        .map(|&id| Avp::mandatory(avp_code::AUTH_APPLICATION_ID, AvpData::Unsigned32(id)))
        .collect();
    let def = dict.find_avp(0, avp_code::FAILED_AVP, 0);
    avp_from_def(&def, AvpData::Grouped(inner))
}

/// Build an answer carrying a failure Result-Code and our identities.
///
/// The E flag is set only for the protocol error class; permanent failures
/// such as DIAMETER_NO_COMMON_APPLICATION ride a plain answer.
pub fn failure_answer(
    request: &DiameterMessage,
    result_code: ResultCode,
    origin_host: &Identity,
    origin_realm: &Identity,
    failed_avp: Option<Avp>,
) -> DiameterMessage {
    let mut answer = DiameterMessage::new_answer(request);
    if result_code.is_protocol_error() {
        answer.header.set_error();
    }
    answer.add_avp(Avp::mandatory(
        avp_code::RESULT_CODE,
        AvpData::Unsigned32(result_code as u32),
    ));
    answer.add_avp(Avp::mandatory(
        avp_code::ORIGIN_HOST,
        AvpData::DiameterIdentity(origin_host.0.clone()),
    ));
    answer.add_avp(Avp::mandatory(
        avp_code::ORIGIN_REALM,
        AvpData::DiameterIdentity(origin_realm.0.clone()),
    ));
    if let Some(avp) = failed_avp {
        answer.add_avp(avp);
    }
    answer
}
