//! Diameter base protocol stack (RFC 6733)
//!
//! The stack is layered bottom-up:
//!
//! - [`message`] and [`avp`] carry the binary wire codec, with payload
//!   typing in [`datatype`]
//! - [`dict`] resolves AVP and command definitions through a
//!   parent-application fallback chain
//! - [`marshal`] binds declared Rust structs to AVP trees, with the base
//!   protocol shapes in [`handshake`]
//! - [`transport`] frames messages over TCP or TLS, and [`peer`] runs the
//!   connection state machine: capabilities exchange, watchdog probing and
//!   the disconnect handshake
//!
//! A dictionary is built explicitly and shared by `Arc`; nothing in the
//! crate holds global state.
//!
//! ```no_run
//! use std::sync::Arc;
//! use diameter_stack::config::NodeConfig;
//! use diameter_stack::dict::Dictionary;
//! use diameter_stack::peer::establish;
//! use diameter_stack::transport::DiameterTransport;
//!
//! # async fn connect() -> diameter_stack::error::DiameterResult<()> {
//! let dict = Arc::new(Dictionary::base()?);
//! let mut config = NodeConfig::new("client.example.org", "example.org");
//! config.auth_application_ids = vec![0];
//! let transport =
//!     DiameterTransport::connect("192.0.2.1:3868".parse().unwrap(), dict).await?;
//! let (transport, peer) = establish(transport, &config).await?;
//! # let _ = (transport, peer);
//! # Ok(())
//! # }
//! ```

pub mod avp;
pub mod config;
pub mod datatype;
pub mod dict;
pub mod error;
pub mod handshake;
pub mod marshal;
pub mod message;
pub mod peer;
pub mod transport;

pub use avp::Avp;
pub use datatype::{AvpData, DataType, Identity};
pub use dict::Dictionary;
pub use error::{DiameterError, DiameterResult, ResultCode};
pub use message::{DiameterHeader, DiameterMessage};

/// Diameter protocol version
pub const DIAMETER_VERSION: u8 = 1;

/// Default Diameter port
pub const DIAMETER_PORT: u16 = 3868;

/// Default Diameter TLS port
pub const DIAMETER_TLS_PORT: u16 = 5658;

/// Base protocol application id
pub const BASE_APPLICATION_ID: u32 = 0;

/// Relay application id
pub const RELAY_APPLICATION_ID: u32 = 0xFFFF_FFFF;

/// 3GPP vendor id
pub const VENDOR_ID_3GPP: u32 = 10415;
