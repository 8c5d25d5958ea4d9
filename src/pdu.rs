//! AgentX PDU model per RFC 2741.
//!
//! In-memory representation of every PDU the master sends or receives. Wire
//! translation lives in [`crate::codec`].

use std::fmt;

use serde::Serialize;

use crate::oid::Oid;

// --- PDU type constants (RFC 2741 §6.1) ---

pub const AGENTX_OPEN_PDU: u8 = 1;
pub const AGENTX_CLOSE_PDU: u8 = 2;
pub const AGENTX_REGISTER_PDU: u8 = 3;
pub const AGENTX_UNREGISTER_PDU: u8 = 4;
pub const AGENTX_GET_PDU: u8 = 5;
pub const AGENTX_GETNEXT_PDU: u8 = 6;
pub const AGENTX_GETBULK_PDU: u8 = 7;
pub const AGENTX_TESTSET_PDU: u8 = 8;
pub const AGENTX_COMMITSET_PDU: u8 = 9;
pub const AGENTX_UNDOSET_PDU: u8 = 10;
pub const AGENTX_CLEANUPSET_PDU: u8 = 11;
pub const AGENTX_NOTIFY_PDU: u8 = 12;
pub const AGENTX_PING_PDU: u8 = 13;
pub const AGENTX_INDEXALLOCATE_PDU: u8 = 14;
pub const AGENTX_INDEXDEALLOCATE_PDU: u8 = 15;
pub const AGENTX_ADDAGENTCAPS_PDU: u8 = 16;
pub const AGENTX_REMOVEAGENTCAPS_PDU: u8 = 17;
pub const AGENTX_RESPONSE_PDU: u8 = 18;

/// AgentX protocol version.
pub const AGENTX_VERSION: u8 = 1;

/// PDU header size in bytes.
pub const PDU_HEADER_SIZE: usize = 20;

// --- Header flags (RFC 2741 §6.1) ---

pub const FLAG_INSTANCE_REGISTRATION: u8 = 0x01;
pub const FLAG_NEW_INDEX: u8 = 0x02;
pub const FLAG_ANY_INDEX: u8 = 0x04;
pub const FLAG_NON_DEFAULT_CONTEXT: u8 = 0x08;
pub const FLAG_NETWORK_BYTE_ORDER: u8 = 0x10;

/// Default registration priority (RFC 2741 §6.2.3).
pub const DEFAULT_PRIORITY: u8 = 127;

// --- VarBind type constants (RFC 2741 §5.4) ---

pub const VARBIND_INTEGER: u16 = 2;
pub const VARBIND_OCTET_STRING: u16 = 4;
pub const VARBIND_NULL: u16 = 5;
pub const VARBIND_OBJECT_IDENTIFIER: u16 = 6;
pub const VARBIND_SEQUENCE: u16 = 48;
pub const VARBIND_IP_ADDRESS: u16 = 64;
pub const VARBIND_COUNTER32: u16 = 65;
pub const VARBIND_GAUGE32: u16 = 66;
pub const VARBIND_TIMETICKS: u16 = 67;
pub const VARBIND_OPAQUE: u16 = 68;
pub const VARBIND_COUNTER64: u16 = 70;
pub const VARBIND_NO_SUCH_OBJECT: u16 = 128;
pub const VARBIND_NO_SUCH_INSTANCE: u16 = 129;
pub const VARBIND_END_OF_MIB_VIEW: u16 = 130;

/// Byte order of the multi-byte integers inside one PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ByteOrder {
    /// Network byte order; the NETWORK_BYTE_ORDER flag is set.
    #[default]
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    pub fn from_flags(flags: u8) -> Self {
        if flags & FLAG_NETWORK_BYTE_ORDER != 0 {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        }
    }

    pub fn flag(self) -> u8 {
        match self {
            ByteOrder::BigEndian => FLAG_NETWORK_BYTE_ORDER,
            ByteOrder::LittleEndian => 0,
        }
    }
}

/// AgentX PDU types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PduType {
    Open,
    Close,
    Register,
    Unregister,
    Get,
    GetNext,
    GetBulk,
    TestSet,
    CommitSet,
    UndoSet,
    CleanupSet,
    Notify,
    Ping,
    IndexAllocate,
    IndexDeallocate,
    AddAgentCaps,
    RemoveAgentCaps,
    Response,
}

impl PduType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let pdu_type = match value {
            AGENTX_OPEN_PDU => PduType::Open,
            AGENTX_CLOSE_PDU => PduType::Close,
            AGENTX_REGISTER_PDU => PduType::Register,
            AGENTX_UNREGISTER_PDU => PduType::Unregister,
            AGENTX_GET_PDU => PduType::Get,
            AGENTX_GETNEXT_PDU => PduType::GetNext,
            AGENTX_GETBULK_PDU => PduType::GetBulk,
            AGENTX_TESTSET_PDU => PduType::TestSet,
            AGENTX_COMMITSET_PDU => PduType::CommitSet,
            AGENTX_UNDOSET_PDU => PduType::UndoSet,
            AGENTX_CLEANUPSET_PDU => PduType::CleanupSet,
            AGENTX_NOTIFY_PDU => PduType::Notify,
            AGENTX_PING_PDU => PduType::Ping,
            AGENTX_INDEXALLOCATE_PDU => PduType::IndexAllocate,
            AGENTX_INDEXDEALLOCATE_PDU => PduType::IndexDeallocate,
            AGENTX_ADDAGENTCAPS_PDU => PduType::AddAgentCaps,
            AGENTX_REMOVEAGENTCAPS_PDU => PduType::RemoveAgentCaps,
            AGENTX_RESPONSE_PDU => PduType::Response,
            _ => return None,
        };
        Some(pdu_type)
    }

    pub fn as_u8(self) -> u8 {
        match self {
            PduType::Open => AGENTX_OPEN_PDU,
            PduType::Close => AGENTX_CLOSE_PDU,
            PduType::Register => AGENTX_REGISTER_PDU,
            PduType::Unregister => AGENTX_UNREGISTER_PDU,
            PduType::Get => AGENTX_GET_PDU,
            PduType::GetNext => AGENTX_GETNEXT_PDU,
            PduType::GetBulk => AGENTX_GETBULK_PDU,
            PduType::TestSet => AGENTX_TESTSET_PDU,
            PduType::CommitSet => AGENTX_COMMITSET_PDU,
            PduType::UndoSet => AGENTX_UNDOSET_PDU,
            PduType::CleanupSet => AGENTX_CLEANUPSET_PDU,
            PduType::Notify => AGENTX_NOTIFY_PDU,
            PduType::Ping => AGENTX_PING_PDU,
            PduType::IndexAllocate => AGENTX_INDEXALLOCATE_PDU,
            PduType::IndexDeallocate => AGENTX_INDEXDEALLOCATE_PDU,
            PduType::AddAgentCaps => AGENTX_ADDAGENTCAPS_PDU,
            PduType::RemoveAgentCaps => AGENTX_REMOVEAGENTCAPS_PDU,
            PduType::Response => AGENTX_RESPONSE_PDU,
        }
    }
}

/// Close reasons (RFC 2741 §6.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    Other,
    ParseError,
    ProtocolError,
    Timeouts,
    Shutdown,
    ByManager,
}

impl CloseReason {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(CloseReason::Other),
            2 => Some(CloseReason::ParseError),
            3 => Some(CloseReason::ProtocolError),
            4 => Some(CloseReason::Timeouts),
            5 => Some(CloseReason::Shutdown),
            6 => Some(CloseReason::ByManager),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            CloseReason::Other => 1,
            CloseReason::ParseError => 2,
            CloseReason::ProtocolError => 3,
            CloseReason::Timeouts => 4,
            CloseReason::Shutdown => 5,
            CloseReason::ByManager => 6,
        }
    }
}

/// Error status carried in Response PDUs.
///
/// Values 0-18 are the SNMP error statuses (RFC 3416); 256 and above are
/// AgentX administrative errors (RFC 2741 §6.2.16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorStatus {
    NoError,
    TooBig,
    NoSuchName,
    BadValue,
    ReadOnly,
    GenErr,
    NoAccess,
    WrongType,
    WrongLength,
    WrongEncoding,
    WrongValue,
    NoCreation,
    InconsistentValue,
    ResourceUnavailable,
    CommitFailed,
    UndoFailed,
    AuthorizationError,
    NotWritable,
    InconsistentName,
    OpenFailed,
    NotOpen,
    IndexWrongType,
    IndexAlreadyAllocated,
    IndexNoneAvailable,
    IndexNotAllocated,
    UnsupportedContext,
    DuplicateRegistration,
    UnknownRegistration,
    UnknownAgentCaps,
    ParseError,
    RequestDenied,
    ProcessingError,
    Other(u16),
}

impl ErrorStatus {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => ErrorStatus::NoError,
            1 => ErrorStatus::TooBig,
            2 => ErrorStatus::NoSuchName,
            3 => ErrorStatus::BadValue,
            4 => ErrorStatus::ReadOnly,
            5 => ErrorStatus::GenErr,
            6 => ErrorStatus::NoAccess,
            7 => ErrorStatus::WrongType,
            8 => ErrorStatus::WrongLength,
            9 => ErrorStatus::WrongEncoding,
            10 => ErrorStatus::WrongValue,
            11 => ErrorStatus::NoCreation,
            12 => ErrorStatus::InconsistentValue,
            13 => ErrorStatus::ResourceUnavailable,
            14 => ErrorStatus::CommitFailed,
            15 => ErrorStatus::UndoFailed,
            16 => ErrorStatus::AuthorizationError,
            17 => ErrorStatus::NotWritable,
            18 => ErrorStatus::InconsistentName,
            256 => ErrorStatus::OpenFailed,
            257 => ErrorStatus::NotOpen,
            258 => ErrorStatus::IndexWrongType,
            259 => ErrorStatus::IndexAlreadyAllocated,
            260 => ErrorStatus::IndexNoneAvailable,
            261 => ErrorStatus::IndexNotAllocated,
            262 => ErrorStatus::UnsupportedContext,
            263 => ErrorStatus::DuplicateRegistration,
            264 => ErrorStatus::UnknownRegistration,
            265 => ErrorStatus::UnknownAgentCaps,
            266 => ErrorStatus::ParseError,
            267 => ErrorStatus::RequestDenied,
            268 => ErrorStatus::ProcessingError,
            other => ErrorStatus::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            ErrorStatus::NoError => 0,
            ErrorStatus::TooBig => 1,
            ErrorStatus::NoSuchName => 2,
            ErrorStatus::BadValue => 3,
            ErrorStatus::ReadOnly => 4,
            ErrorStatus::GenErr => 5,
            ErrorStatus::NoAccess => 6,
            ErrorStatus::WrongType => 7,
            ErrorStatus::WrongLength => 8,
            ErrorStatus::WrongEncoding => 9,
            ErrorStatus::WrongValue => 10,
            ErrorStatus::NoCreation => 11,
            ErrorStatus::InconsistentValue => 12,
            ErrorStatus::ResourceUnavailable => 13,
            ErrorStatus::CommitFailed => 14,
            ErrorStatus::UndoFailed => 15,
            ErrorStatus::AuthorizationError => 16,
            ErrorStatus::NotWritable => 17,
            ErrorStatus::InconsistentName => 18,
            ErrorStatus::OpenFailed => 256,
            ErrorStatus::NotOpen => 257,
            ErrorStatus::IndexWrongType => 258,
            ErrorStatus::IndexAlreadyAllocated => 259,
            ErrorStatus::IndexNoneAvailable => 260,
            ErrorStatus::IndexNotAllocated => 261,
            ErrorStatus::UnsupportedContext => 262,
            ErrorStatus::DuplicateRegistration => 263,
            ErrorStatus::UnknownRegistration => 264,
            ErrorStatus::UnknownAgentCaps => 265,
            ErrorStatus::ParseError => 266,
            ErrorStatus::RequestDenied => 267,
            ErrorStatus::ProcessingError => 268,
            ErrorStatus::Other(code) => code,
        }
    }

    pub fn is_error(self) -> bool {
        self != ErrorStatus::NoError
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStatus::Other(code) => write!(f, "error({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// An SNMP variable binding value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum VarBindValue {
    Integer(i32),
    OctetString(Vec<u8>),
    Null,
    ObjectIdentifier(Oid),
    IpAddress([u8; 4]),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Opaque(Vec<u8>),
    Counter64(u64),
    /// Constructed-type marker; carries no payload on the AgentX wire.
    Sequence,
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
}

impl VarBindValue {
    pub fn type_tag(&self) -> u16 {
        match self {
            VarBindValue::Integer(_) => VARBIND_INTEGER,
            VarBindValue::OctetString(_) => VARBIND_OCTET_STRING,
            VarBindValue::Null => VARBIND_NULL,
            VarBindValue::ObjectIdentifier(_) => VARBIND_OBJECT_IDENTIFIER,
            VarBindValue::IpAddress(_) => VARBIND_IP_ADDRESS,
            VarBindValue::Counter32(_) => VARBIND_COUNTER32,
            VarBindValue::Gauge32(_) => VARBIND_GAUGE32,
            VarBindValue::TimeTicks(_) => VARBIND_TIMETICKS,
            VarBindValue::Opaque(_) => VARBIND_OPAQUE,
            VarBindValue::Counter64(_) => VARBIND_COUNTER64,
            VarBindValue::Sequence => VARBIND_SEQUENCE,
            VarBindValue::NoSuchObject => VARBIND_NO_SUCH_OBJECT,
            VarBindValue::NoSuchInstance => VARBIND_NO_SUCH_INSTANCE,
            VarBindValue::EndOfMibView => VARBIND_END_OF_MIB_VIEW,
        }
    }

    /// True for noSuchObject, noSuchInstance and endOfMibView.
    pub fn is_exception(&self) -> bool {
        matches!(
            self,
            VarBindValue::NoSuchObject | VarBindValue::NoSuchInstance | VarBindValue::EndOfMibView
        )
    }
}

/// A variable binding (OID + value).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VarBind {
    pub oid: Oid,
    pub value: VarBindValue,
}

impl VarBind {
    pub fn new(oid: Oid, value: VarBindValue) -> Self {
        VarBind { oid, value }
    }

    pub fn null(oid: Oid) -> Self {
        VarBind {
            oid,
            value: VarBindValue::Null,
        }
    }
}

/// A SearchRange (RFC 2741 §5.2). A null `end` means "no upper bound".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchRange {
    pub start: Oid,
    pub end: Oid,
    pub include: bool,
}

impl SearchRange {
    pub fn new(start: Oid, end: Option<Oid>, include: bool) -> Self {
        SearchRange {
            start,
            end: end.unwrap_or_default(),
            include,
        }
    }

    /// Returns true if `oid` satisfies the range's lower and upper bound.
    pub fn admits(&self, oid: &Oid) -> bool {
        let above_start = if self.include {
            *oid >= self.start
        } else {
            *oid > self.start
        };
        above_start && (self.end.is_empty() || *oid < self.end)
    }
}

/// PDU-type specific payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Open {
        timeout: u8,
        id: Oid,
        description: Vec<u8>,
    },
    Close {
        reason: CloseReason,
    },
    Register {
        context: Option<Vec<u8>>,
        timeout: u8,
        priority: u8,
        range_subid: u8,
        subtree: Oid,
        upper_bound: Option<u32>,
        instance: bool,
    },
    Unregister {
        context: Option<Vec<u8>>,
        priority: u8,
        range_subid: u8,
        subtree: Oid,
        upper_bound: Option<u32>,
    },
    Get {
        context: Option<Vec<u8>>,
        ranges: Vec<SearchRange>,
    },
    GetNext {
        context: Option<Vec<u8>>,
        ranges: Vec<SearchRange>,
    },
    GetBulk {
        context: Option<Vec<u8>>,
        non_repeaters: u16,
        max_repetitions: u16,
        ranges: Vec<SearchRange>,
    },
    TestSet {
        context: Option<Vec<u8>>,
        varbinds: Vec<VarBind>,
    },
    CommitSet,
    UndoSet,
    CleanupSet,
    Notify {
        context: Option<Vec<u8>>,
        varbinds: Vec<VarBind>,
    },
    Ping {
        context: Option<Vec<u8>>,
    },
    IndexAllocate {
        context: Option<Vec<u8>>,
        new_index: bool,
        any_index: bool,
        varbinds: Vec<VarBind>,
    },
    IndexDeallocate {
        context: Option<Vec<u8>>,
        varbinds: Vec<VarBind>,
    },
    AddAgentCaps {
        context: Option<Vec<u8>>,
        id: Oid,
        description: Vec<u8>,
    },
    RemoveAgentCaps {
        context: Option<Vec<u8>>,
        id: Oid,
    },
    Response {
        sys_uptime: u32,
        error: ErrorStatus,
        index: u16,
        varbinds: Vec<VarBind>,
    },
}

impl Payload {
    pub fn pdu_type(&self) -> PduType {
        match self {
            Payload::Open { .. } => PduType::Open,
            Payload::Close { .. } => PduType::Close,
            Payload::Register { .. } => PduType::Register,
            Payload::Unregister { .. } => PduType::Unregister,
            Payload::Get { .. } => PduType::Get,
            Payload::GetNext { .. } => PduType::GetNext,
            Payload::GetBulk { .. } => PduType::GetBulk,
            Payload::TestSet { .. } => PduType::TestSet,
            Payload::CommitSet => PduType::CommitSet,
            Payload::UndoSet => PduType::UndoSet,
            Payload::CleanupSet => PduType::CleanupSet,
            Payload::Notify { .. } => PduType::Notify,
            Payload::Ping { .. } => PduType::Ping,
            Payload::IndexAllocate { .. } => PduType::IndexAllocate,
            Payload::IndexDeallocate { .. } => PduType::IndexDeallocate,
            Payload::AddAgentCaps { .. } => PduType::AddAgentCaps,
            Payload::RemoveAgentCaps { .. } => PduType::RemoveAgentCaps,
            Payload::Response { .. } => PduType::Response,
        }
    }

    /// The non-default context named by the payload, if any.
    pub fn context(&self) -> Option<&[u8]> {
        match self {
            Payload::Register { context, .. }
            | Payload::Unregister { context, .. }
            | Payload::Get { context, .. }
            | Payload::GetNext { context, .. }
            | Payload::GetBulk { context, .. }
            | Payload::TestSet { context, .. }
            | Payload::Notify { context, .. }
            | Payload::Ping { context }
            | Payload::IndexAllocate { context, .. }
            | Payload::IndexDeallocate { context, .. }
            | Payload::AddAgentCaps { context, .. }
            | Payload::RemoveAgentCaps { context, .. } => context.as_deref(),
            _ => None,
        }
    }
}

/// A complete AgentX PDU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pdu {
    pub session_id: u32,
    pub transaction_id: u32,
    pub packet_id: u32,
    pub byte_order: ByteOrder,
    pub payload: Payload,
}

impl Pdu {
    pub fn new(session_id: u32, transaction_id: u32, packet_id: u32, payload: Payload) -> Self {
        Pdu {
            session_id,
            transaction_id,
            packet_id,
            byte_order: ByteOrder::BigEndian,
            payload,
        }
    }

    pub fn pdu_type(&self) -> PduType {
        self.payload.pdu_type()
    }

    /// Builds the Response PDU answering `self`, echoing its identifiers and
    /// byte order.
    pub fn response(
        &self,
        sys_uptime: u32,
        error: ErrorStatus,
        index: u16,
        varbinds: Vec<VarBind>,
    ) -> Pdu {
        Pdu {
            session_id: self.session_id,
            transaction_id: self.transaction_id,
            packet_id: self.packet_id,
            byte_order: self.byte_order,
            payload: Payload::Response {
                sys_uptime,
                error,
                index,
                varbinds,
            },
        }
    }
}

/// Decoded AgentX PDU header (20 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    pub version: u8,
    pub pdu_type: u8,
    pub flags: u8,
    pub session_id: u32,
    pub transaction_id: u32,
    pub packet_id: u32,
    pub payload_length: u32,
}

impl PduHeader {
    pub fn byte_order(&self) -> ByteOrder {
        ByteOrder::from_flags(self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_type_codes_roundtrip() {
        for code in 1..=18u8 {
            let pdu_type = PduType::from_u8(code).unwrap();
            assert_eq!(pdu_type.as_u8(), code);
        }
        assert!(PduType::from_u8(0).is_none());
        assert!(PduType::from_u8(19).is_none());
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(ErrorStatus::from_u16(263), ErrorStatus::DuplicateRegistration);
        assert_eq!(ErrorStatus::CommitFailed.as_u16(), 14);
        assert_eq!(ErrorStatus::from_u16(999), ErrorStatus::Other(999));
        assert_eq!(ErrorStatus::Other(999).as_u16(), 999);
        assert!(!ErrorStatus::NoError.is_error());
    }

    #[test]
    fn test_byte_order_flag() {
        assert_eq!(ByteOrder::from_flags(0x10), ByteOrder::BigEndian);
        assert_eq!(ByteOrder::from_flags(0x08), ByteOrder::LittleEndian);
        assert_eq!(ByteOrder::BigEndian.flag(), FLAG_NETWORK_BYTE_ORDER);
    }

    #[test]
    fn test_search_range_admits() {
        let range = SearchRange::new(
            Oid::from_slice(&[1, 3, 6, 1, 2]),
            Some(Oid::from_slice(&[1, 3, 6, 1, 3])),
            false,
        );
        assert!(!range.admits(&Oid::from_slice(&[1, 3, 6, 1, 2])));
        assert!(range.admits(&Oid::from_slice(&[1, 3, 6, 1, 2, 1])));
        assert!(!range.admits(&Oid::from_slice(&[1, 3, 6, 1, 3])));

        let inclusive = SearchRange::new(Oid::from_slice(&[1, 3]), None, true);
        assert!(inclusive.admits(&Oid::from_slice(&[1, 3])));
        assert!(inclusive.admits(&Oid::from_slice(&[9])));
    }
}
