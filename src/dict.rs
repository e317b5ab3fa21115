//! Dictionary resolver
//!
//! The dictionary is the load-time-built schema index: applications,
//! commands, AVP definitions with enumerated values and grouping rules,
//! keyed for lookup by (application, code, vendor) and by
//! (application, name, vendor).
//!
//! Lookup misses walk a declared parent-application graph: the requested
//! application first, then its declared parent, then the base application
//! (id 0). A numeric code that is still unresolved yields a synthesized
//! "Unknown" definition tagged with the original application id, so unknown
//! AVPs stay attributable to their true source. Name lookups report
//! not-found instead.
//!
//! Loading takes `&mut self` and therefore can never run concurrently with
//! lookups; once built, a `Dictionary` (usually behind `Arc`) is safe for
//! unlimited concurrent lookups.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::datatype::DataType;
use crate::error::{DiameterError, DiameterResult};
use crate::{BASE_APPLICATION_ID, RELAY_APPLICATION_ID};

/// Base protocol AVP codes (RFC 6733)
pub mod avp_code {
    pub const USER_NAME: u32 = 1;
    pub const PROXY_STATE: u32 = 33;
    pub const EVENT_TIMESTAMP: u32 = 55;
    pub const HOST_IP_ADDRESS: u32 = 257;
    pub const AUTH_APPLICATION_ID: u32 = 258;
    pub const ACCT_APPLICATION_ID: u32 = 259;
    pub const VENDOR_SPECIFIC_APPLICATION_ID: u32 = 260;
    pub const SESSION_ID: u32 = 263;
    pub const ORIGIN_HOST: u32 = 264;
    pub const SUPPORTED_VENDOR_ID: u32 = 265;
    pub const VENDOR_ID: u32 = 266;
    pub const FIRMWARE_REVISION: u32 = 267;
    pub const RESULT_CODE: u32 = 268;
    pub const PRODUCT_NAME: u32 = 269;
    pub const DISCONNECT_CAUSE: u32 = 273;
    pub const ORIGIN_STATE_ID: u32 = 278;
    pub const FAILED_AVP: u32 = 279;
    pub const PROXY_HOST: u32 = 280;
    pub const ERROR_MESSAGE: u32 = 281;
    pub const ROUTE_RECORD: u32 = 282;
    pub const DESTINATION_REALM: u32 = 283;
    pub const PROXY_INFO: u32 = 284;
    pub const REDIRECT_HOST: u32 = 292;
    pub const DESTINATION_HOST: u32 = 293;
    pub const ERROR_REPORTING_HOST: u32 = 294;
    pub const ORIGIN_REALM: u32 = 296;
    pub const EXPERIMENTAL_RESULT: u32 = 297;
    pub const EXPERIMENTAL_RESULT_CODE: u32 = 298;
    pub const INBAND_SECURITY_ID: u32 = 299;
}

/// Application type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Auth,
    Acct,
}

/// A vendor declared by an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: u32,
    #[serde(default)]
    pub name: String,
}

/// A command definition: request/answer pair identified by code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDef {
    pub code: u32,
    /// Short name, e.g. "CE" for Capabilities-Exchange
    pub short: String,
    #[serde(default)]
    pub name: String,
}

/// One enumerated value of an Enumerated AVP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumItem {
    pub code: i32,
    pub name: String,
}

/// One permitted child of a Grouped AVP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDef {
    /// Child AVP name
    pub avp: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub min: u32,
    #[serde(default)]
    pub max: Option<u32>,
}

/// An AVP definition as resolved from the dictionary
#[derive(Debug, Clone, PartialEq)]
pub struct AvpDef {
    pub name: String,
    pub code: u32,
    /// Vendor scope; 0 means no vendor
    pub vendor_id: u32,
    /// Whether the M flag is set when this AVP is emitted
    pub mandatory: bool,
    pub protected: bool,
    pub data: DataType,
    pub enum_items: Vec<EnumItem>,
    pub rules: Vec<RuleDef>,
    /// Application the definition belongs to. For synthesized Unknown
    /// definitions this is the application originally queried, not the
    /// fallback application.
    pub app_id: u32,
}

impl AvpDef {
    pub fn is_unknown(&self) -> bool {
        self.data == DataType::Unknown
    }
}

/// An application entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub id: u32,
    pub app_type: Option<AppType>,
    pub name: String,
    pub vendors: Vec<Vendor>,
}

/// Declarative dictionary document, the parsed shape of a schema file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DictionaryDoc {
    #[serde(default)]
    pub applications: Vec<ApplicationDoc>,
    /// Child application id -> parent application id
    #[serde(default)]
    pub parents: HashMap<u32, u32>,
}

/// One application in a dictionary document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationDoc {
    pub id: u32,
    #[serde(rename = "type", default)]
    pub app_type: Option<AppType>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vendors: Vec<Vendor>,
    #[serde(default)]
    pub commands: Vec<CommandDef>,
    #[serde(default)]
    pub avps: Vec<AvpDoc>,
}

/// One AVP in a dictionary document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvpDoc {
    pub name: String,
    pub code: u32,
    #[serde(default)]
    pub vendor_id: u32,
    #[serde(default = "default_true")]
    pub mandatory: bool,
    #[serde(default)]
    pub protected: bool,
    #[serde(rename = "type")]
    pub data: DataType,
    #[serde(default, rename = "enum")]
    pub enum_items: Vec<EnumItem>,
    #[serde(default)]
    pub rules: Vec<RuleDef>,
}

fn default_true() -> bool {
    true
}

/// Resolved field bindings for one marshalable struct shape under one
/// application, cached by the marshaling engine.
#[derive(Debug)]
pub struct Binding {
    pub defs: Vec<Arc<AvpDef>>,
}

type CodeKey = (u32, u32, u32); // (app, code, vendor)
type NameKey = (u32, String, u32); // (app, name, vendor)

/// The dictionary: an immutable-after-load schema index.
#[derive(Default)]
pub struct Dictionary {
    apps: Vec<Application>,
    avp_by_code: HashMap<CodeKey, Arc<AvpDef>>,
    avp_by_name: HashMap<NameKey, Arc<AvpDef>>,
    commands: HashMap<(u32, u32), Arc<CommandDef>>,
    parents: HashMap<u32, u32>,
    bindings: RwLock<HashMap<(TypeId, u32), Arc<Binding>>>,
}

impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dictionary")
            .field("applications", &self.apps.len())
            .field("avps", &self.avp_by_code.len())
            .field("commands", &self.commands.len())
            .finish()
    }
}

impl Dictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the embedded base protocol dictionary (RFC 6733)
    pub fn base() -> DiameterResult<Self> {
        let mut dict = Self::new();
        dict.load_yaml(include_str!("base_dict.yaml"))?;
        Ok(dict)
    }

    /// Load a YAML dictionary document, merging into what is already loaded
    pub fn load_yaml(&mut self, src: &str) -> DiameterResult<()> {
        let doc: DictionaryDoc = serde_yaml::from_str(src)
            .map_err(|e| DiameterError::Dictionary(format!("YAML parse error: {e}")))?;
        self.merge(doc)
    }

    /// Merge a parsed dictionary document into this dictionary.
    ///
    /// Later definitions with the same (application, code, vendor) key
    /// replace earlier ones, which is how incremental loads refine a base.
    pub fn merge(&mut self, doc: DictionaryDoc) -> DiameterResult<()> {
        for app in doc.applications {
            if !self.apps.iter().any(|a| a.id == app.id) {
                self.apps.push(Application {
                    id: app.id,
                    app_type: app.app_type,
                    name: app.name.clone(),
                    vendors: app.vendors.clone(),
                });
            }
            for cmd in app.commands {
                self.commands.insert((app.id, cmd.code), Arc::new(cmd));
            }
            for avp in app.avps {
                let def = Arc::new(AvpDef {
                    name: avp.name,
                    code: avp.code,
                    vendor_id: avp.vendor_id,
                    mandatory: avp.mandatory,
                    protected: avp.protected,
                    data: avp.data,
                    enum_items: avp.enum_items,
                    rules: avp.rules,
                    app_id: app.id,
                });
                self.avp_by_code
                    .insert((app.id, def.code, def.vendor_id), def.clone());
                self.avp_by_name
                    .insert((app.id, def.name.clone(), def.vendor_id), def.clone());
                // A vendor-scoped AVP is also reachable with the
                // undefined-vendor wildcard, unless a true vendorless
                // definition already claims that key.
                if def.vendor_id != 0 {
                    self.avp_by_code
                        .entry((app.id, def.code, 0))
                        .or_insert_with(|| def.clone());
                    self.avp_by_name
                        .entry((app.id, def.name.clone(), 0))
                        .or_insert_with(|| def.clone());
                }
            }
        }
        self.parents.extend(doc.parents);
        self.validate_parents()
    }

    /// Reject cyclic parent declarations at load time so lookups never
    /// need cycle handling.
    fn validate_parents(&self) -> DiameterResult<()> {
        for &start in self.parents.keys() {
            let mut cur = start;
            for _ in 0..=self.parents.len() {
                match self.parents.get(&cur) {
                    Some(&next) => cur = next,
                    None => break,
                }
                if cur == start {
                    return Err(DiameterError::Dictionary(format!(
                        "cyclic parent-application graph at application {start}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// All loaded applications, in load order
    pub fn apps(&self) -> &[Application] {
        &self.apps
    }

    /// Look up an application by id
    pub fn app(&self, id: u32) -> DiameterResult<&Application> {
        self.apps
            .iter()
            .find(|a| a.id == id)
            .ok_or(DiameterError::UnknownApplication(id))
    }

    /// Whether this dictionary can serve the given application id.
    /// The relay application is always considered supported.
    pub fn supports_application(&self, id: u32) -> bool {
        id == RELAY_APPLICATION_ID || self.apps.iter().any(|a| a.id == id)
    }

    /// Find an AVP definition by code.
    ///
    /// The lookup walks the requested application, then its declared
    /// parent, then the base application. A code unknown everywhere yields
    /// a synthesized Unknown definition tagged with the application that
    /// was originally queried.
    pub fn find_avp(&self, app_id: u32, code: u32, vendor_id: u32) -> Arc<AvpDef> {
        let mut cur = app_id;
        loop {
            if let Some(def) = self.avp_by_code.get(&(cur, code, vendor_id)) {
                return def.clone();
            }
            if cur == BASE_APPLICATION_ID {
                return Arc::new(make_unknown(app_id, code, vendor_id));
            }
            cur = self
                .parents
                .get(&cur)
                .copied()
                .unwrap_or(BASE_APPLICATION_ID);
        }
    }

    /// Find an AVP definition by name, with the same fallback chain as
    /// [`Dictionary::find_avp`]. A name has no numeric code to synthesize
    /// from, so an exhausted chain reports not-found.
    pub fn find_avp_by_name(
        &self,
        app_id: u32,
        name: &str,
        vendor_id: u32,
    ) -> DiameterResult<Arc<AvpDef>> {
        let mut cur = app_id;
        loop {
            if let Some(def) = self
                .avp_by_name
                .get(&(cur, name.to_string(), vendor_id))
            {
                return Ok(def.clone());
            }
            if cur == BASE_APPLICATION_ID {
                return Err(DiameterError::UnknownAvpName {
                    name: name.to_string(),
                    app_id,
                });
            }
            cur = self
                .parents
                .get(&cur)
                .copied()
                .unwrap_or(BASE_APPLICATION_ID);
        }
    }

    /// Find a command definition, falling back to the base application
    pub fn find_command(&self, app_id: u32, code: u32) -> DiameterResult<Arc<CommandDef>> {
        if let Some(cmd) = self.commands.get(&(app_id, code)) {
            return Ok(cmd.clone());
        }
        if let Some(cmd) = self.commands.get(&(BASE_APPLICATION_ID, code)) {
            return Ok(cmd.clone());
        }
        Err(DiameterError::UnknownCommand(code))
    }

    /// Look up one enumerated value of an Enumerated AVP
    pub fn enum_item(&self, app_id: u32, code: u32, n: i32) -> DiameterResult<EnumItem> {
        let def = self.find_avp(app_id, code, 0);
        if def.data != DataType::Enumerated {
            return Err(DiameterError::Dictionary(format!(
                "AVP {} ({}) is not Enumerated",
                def.name, def.code
            )));
        }
        def.enum_items
            .iter()
            .find(|item| item.code == n)
            .cloned()
            .ok_or_else(|| {
                DiameterError::Dictionary(format!(
                    "no enumerated value {} for AVP {} ({})",
                    n, def.name, def.code
                ))
            })
    }

    /// Look up the grouping rule for one child of a Grouped AVP
    pub fn rule(&self, app_id: u32, code: u32, child: &str) -> DiameterResult<RuleDef> {
        let def = self.find_avp(app_id, code, 0);
        if def.data != DataType::Grouped {
            return Err(DiameterError::Dictionary(format!(
                "AVP {} ({}) is not Grouped",
                def.name, def.code
            )));
        }
        def.rules
            .iter()
            .find(|r| r.avp == child)
            .cloned()
            .ok_or_else(|| {
                DiameterError::Dictionary(format!(
                    "no rule for {} in AVP {} ({})",
                    child, def.name, def.code
                ))
            })
    }

    /// Scan every loaded AVP for the given code, ignoring the application.
    ///
    /// This is a linear scan, orders of magnitude slower than
    /// [`Dictionary::find_avp`]. Diagnostic use only; never call it on a
    /// hot path.
    pub fn scan_avp(&self, code: u32) -> Option<Arc<AvpDef>> {
        self.avp_by_code
            .iter()
            .find(|((_, c, _), _)| *c == code)
            .map(|(_, def)| def.clone())
    }

    /// Scan every loaded AVP for the given name, ignoring the application.
    /// Same caveat as [`Dictionary::scan_avp`].
    pub fn scan_avp_by_name(&self, name: &str) -> Option<Arc<AvpDef>> {
        self.avp_by_name
            .iter()
            .find(|((_, n, _), _)| n == name)
            .map(|(_, def)| def.clone())
    }

    /// Resolved field bindings for a marshalable shape, computed once per
    /// (shape, application) and cached.
    pub fn binding_for(
        &self,
        shape: TypeId,
        app_id: u32,
        avp_names: &[&'static str],
    ) -> DiameterResult<Arc<Binding>> {
        {
            let cache = self
                .bindings
                .read()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(binding) = cache.get(&(shape, app_id)) {
                return Ok(binding.clone());
            }
        }
        let mut defs = Vec::with_capacity(avp_names.len());
        for name in avp_names {
            defs.push(self.find_avp_by_name(app_id, name, 0)?);
        }
        let binding = Arc::new(Binding { defs });
        let mut cache = self
            .bindings
            .write()
            .unwrap_or_else(|e| e.into_inner());
        Ok(cache
            .entry((shape, app_id))
            .or_insert(binding)
            .clone())
    }
}

/// Programmatic dictionary construction, for schemas not worth a YAML file
#[derive(Debug, Default)]
pub struct DictionaryBuilder {
    doc: DictionaryDoc,
}

impl DictionaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn application(mut self, app: ApplicationDoc) -> Self {
        self.doc.applications.push(app);
        self
    }

    pub fn parent(mut self, child: u32, parent: u32) -> Self {
        self.doc.parents.insert(child, parent);
        self
    }

    /// Build on top of the embedded base dictionary
    pub fn build(self) -> DiameterResult<Dictionary> {
        let mut dict = Dictionary::base()?;
        dict.merge(self.doc)?;
        Ok(dict)
    }

    /// Build without the base dictionary
    pub fn build_bare(self) -> DiameterResult<Dictionary> {
        let mut dict = Dictionary::new();
        dict.merge(self.doc)?;
        Ok(dict)
    }
}

fn make_unknown(app_id: u32, code: u32, vendor_id: u32) -> AvpDef {
    AvpDef {
        name: format!("Unknown-{code}-{vendor_id}"),
        code,
        vendor_id,
        mandatory: false,
        protected: false,
        data: DataType::Unknown,
        enum_items: Vec::new(),
        rules: Vec::new(),
        app_id,
    }
}
