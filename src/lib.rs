//! AgentX master agent (RFC 2741).
//!
//! This crate provides the master side of AgentX: it accepts subagent
//! connections, keeps the registration directory of who serves which part
//! of the MIB, and turns SNMP management requests into AgentX sub-requests.
//!
//! # Usage
//!
//! Run the daemon on the standard TCP port and a Unix socket:
//! ```bash
//! agentxd --tcp-addr 127.0.0.1:705 --unix-socket /var/agentx/master
//! ```
//!
//! Embedding code drives requests through [`master::Master::process`].

/// Collaborator traits: access control, peer filtering, notifications, persistence.
pub mod access;
/// AgentX agent capabilities directory.
pub mod capabilities;
/// AgentX wire encoding and decoding.
pub mod codec;
/// Command-line configuration and validation.
pub mod configuration;
/// Outstanding sub-requests and response correlation.
pub mod dispatch;
/// Index allocation directory.
pub mod index;
/// Locally served MIB stores.
pub mod local;
/// Listeners, peer tasks and administrative PDU handling.
pub mod master;
/// Object identifiers.
pub mod oid;
/// AgentX PDU model.
pub mod pdu;
/// Registration regions.
pub mod region;
/// Registration directory.
pub mod registry;
/// Session and peer management.
pub mod session;
/// Status reporting.
pub mod status;
/// Management request processing.
pub mod transaction;
