use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::nat::port_forwarding::MappingProtocol;

/// Error taxonomy for port mapping operations
#[derive(Debug, Clone, Error)]
pub enum NatError {
    /// No response within the bound. The only retryable failure.
    #[error("{message} (timed out after {after:?})")]
    Timeout { message: String, after: Duration },

    /// Explicit protocol-level refusal from the gateway
    #[error("{protocol} rejected the request: {reason}")]
    Rejected {
        protocol: MappingProtocol,
        reason: String,
    },

    /// Response failed to decode
    #[error("malformed {protocol} response: {reason}")]
    Malformed {
        protocol: MappingProtocol,
        reason: String,
    },

    /// Protocol or version mismatch; disables the protocol for the session
    #[error("{protocol} is not supported by the gateway: {reason}")]
    Unsupported {
        protocol: MappingProtocol,
        reason: String,
    },

    /// Probing exhausted every candidate gateway and protocol
    #[error("no gateway answered any port mapping protocol")]
    NoGatewayFound,

    /// A request for the same port and protocol is already in flight
    #[error("a {protocol} request for internal port {port} is already in progress")]
    InProgress {
        port: u16,
        protocol: MappingProtocol,
    },

    /// The port is already mapped with this protocol
    #[error("internal port {port} is already mapped via {protocol}")]
    AlreadyMapped {
        port: u16,
        protocol: MappingProtocol,
    },

    /// Frame construction errors
    #[error("frame codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Caller asked for something no gateway can grant
    #[error("invalid mapping request: {0}")]
    InvalidRequest(String),
}

impl NatError {
    pub fn timeout(message: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            message: message.into(),
            after,
        }
    }

    pub fn rejected(protocol: MappingProtocol, reason: impl Into<String>) -> Self {
        Self::Rejected {
            protocol,
            reason: reason.into(),
        }
    }

    pub fn malformed(protocol: MappingProtocol, reason: impl Into<String>) -> Self {
        Self::Malformed {
            protocol,
            reason: reason.into(),
        }
    }

    pub fn unsupported(protocol: MappingProtocol, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            protocol,
            reason: reason.into(),
        }
    }

    /// Translate a transport failure at the protocol client boundary
    pub fn transport(protocol: MappingProtocol, context: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout {
                message: format!("{} {}: {}", protocol, context, err),
                after: Duration::ZERO,
            },
            _ => Self::Rejected {
                protocol,
                reason: format!("transport failure during {}: {}", context, err),
            },
        }
    }

    /// Only timeouts are worth repeating with the same parameters
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Explicit refusal or undecodable answer; either way the gateway did respond
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::Malformed { .. })
    }

    pub fn disables_protocol(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

/// Frame codec errors. These indicate programming errors in frame layouts
/// or truncated input when decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unsupported field width {0} bits (expected 8, 16 or 32)")]
    InvalidWidth(u8),

    #[error("field of {len} bytes at offset {offset} exceeds frame of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("value {value} does not fit in {bits} bits")]
    ValueOverflow { value: u32, bits: u8 },
}

/// NAT-PMP result codes (RFC 6886 section 3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NatPmpResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    NotAuthorized = 2,
    NetworkFailure = 3,
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

impl NatPmpResultCode {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::UnsupportedVersion),
            2 => Some(Self::NotAuthorized),
            3 => Some(Self::NetworkFailure),
            4 => Some(Self::OutOfResources),
            5 => Some(Self::UnsupportedOpcode),
            _ => None,
        }
    }

    /// Map a nonzero result code onto the error taxonomy
    pub fn into_error(code: u16) -> NatError {
        match Self::from_code(code) {
            Some(Self::UnsupportedVersion) => {
                NatError::unsupported(MappingProtocol::NatPmp, Self::UnsupportedVersion.to_string())
            }
            Some(known) => NatError::rejected(MappingProtocol::NatPmp, known.to_string()),
            None => NatError::rejected(
                MappingProtocol::NatPmp,
                format!("unknown result code {}", code),
            ),
        }
    }
}

impl fmt::Display for NatPmpResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::UnsupportedVersion => write!(f, "Unsupported Version"),
            Self::NotAuthorized => write!(f, "Not Authorized/Refused"),
            Self::NetworkFailure => write!(f, "Network Failure"),
            Self::OutOfResources => write!(f, "Out of Resources"),
            Self::UnsupportedOpcode => write!(f, "Unsupported Opcode"),
        }
    }
}

/// PCP result codes (RFC 6887 section 7.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PcpResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    NotAuthorized = 2,
    MalformedRequest = 3,
    UnsupportedOpcode = 4,
    UnsupportedOption = 5,
    MalformedOption = 6,
    NetworkFailure = 7,
    NoResources = 8,
    UnsupportedProtocol = 9,
    UserExceededQuota = 10,
    CannotProvideExternal = 11,
    AddressMismatch = 12,
    ExcessiveRemotePeers = 13,
}

impl PcpResultCode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::UnsupportedVersion),
            2 => Some(Self::NotAuthorized),
            3 => Some(Self::MalformedRequest),
            4 => Some(Self::UnsupportedOpcode),
            5 => Some(Self::UnsupportedOption),
            6 => Some(Self::MalformedOption),
            7 => Some(Self::NetworkFailure),
            8 => Some(Self::NoResources),
            9 => Some(Self::UnsupportedProtocol),
            10 => Some(Self::UserExceededQuota),
            11 => Some(Self::CannotProvideExternal),
            12 => Some(Self::AddressMismatch),
            13 => Some(Self::ExcessiveRemotePeers),
            _ => None,
        }
    }

    pub fn into_error(code: u8) -> NatError {
        match Self::from_code(code) {
            Some(Self::UnsupportedVersion) => {
                NatError::unsupported(MappingProtocol::Pcp, Self::UnsupportedVersion.to_string())
            }
            Some(known) => NatError::rejected(MappingProtocol::Pcp, known.to_string()),
            None => NatError::rejected(MappingProtocol::Pcp, format!("unknown result code {}", code)),
        }
    }
}

impl fmt::Display for PcpResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::UnsupportedVersion => write!(f, "Unsupported Version"),
            Self::NotAuthorized => write!(f, "Not Authorized"),
            Self::MalformedRequest => write!(f, "Malformed Request"),
            Self::UnsupportedOpcode => write!(f, "Unsupported Opcode"),
            Self::UnsupportedOption => write!(f, "Unsupported Option"),
            Self::MalformedOption => write!(f, "Malformed Option"),
            Self::NetworkFailure => write!(f, "Network Failure"),
            Self::NoResources => write!(f, "No Resources"),
            Self::UnsupportedProtocol => write!(f, "Unsupported Protocol"),
            Self::UserExceededQuota => write!(f, "User Exceeded Quota"),
            Self::CannotProvideExternal => write!(f, "Cannot Provide External"),
            Self::AddressMismatch => write!(f, "Address Mismatch"),
            Self::ExcessiveRemotePeers => write!(f, "Excessive Remote Peers"),
        }
    }
}

/// UPnP IGD error codes carried in SOAP faults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum UpnpErrorCode {
    InvalidAction = 401,
    InvalidArgs = 402,
    ActionFailed = 501,
    ArgumentValueInvalid = 600,
    ArgumentValueOutOfRange = 601,
    OptionalActionNotImplemented = 602,
    OutOfMemory = 603,
    HumanInterventionRequired = 604,
    ActionNotAuthorized = 606,
    PortMappingNotFound = 714,
    WildCardNotPermittedInSrcIp = 715,
    WildCardNotPermittedInExtPort = 716,
    ConflictInMappingEntry = 718,
    SamePortValuesRequired = 724,
    OnlyPermanentLeaseSupported = 725,
    RemoteHostOnlySupportsWildcard = 726,
    ExternalPortOnlySupportsWildcard = 727,
    NoPortMapsAvailable = 728,
    ConflictWithOtherMechanism = 729,
}

impl fmt::Display for UpnpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAction => write!(f, "Invalid Action"),
            Self::InvalidArgs => write!(f, "Invalid Arguments"),
            Self::ActionFailed => write!(f, "Action Failed"),
            Self::ArgumentValueInvalid => write!(f, "Argument Value Invalid"),
            Self::ArgumentValueOutOfRange => write!(f, "Argument Value Out of Range"),
            Self::OptionalActionNotImplemented => write!(f, "Optional Action Not Implemented"),
            Self::OutOfMemory => write!(f, "Out of Memory"),
            Self::HumanInterventionRequired => write!(f, "Human Intervention Required"),
            Self::ActionNotAuthorized => write!(f, "Action Not Authorized"),
            Self::PortMappingNotFound => write!(f, "Port Mapping Not Found"),
            Self::WildCardNotPermittedInSrcIp => write!(f, "Wildcard Not Permitted in Source IP"),
            Self::WildCardNotPermittedInExtPort => write!(f, "Wildcard Not Permitted in External Port"),
            Self::ConflictInMappingEntry => write!(f, "Conflict in Mapping Entry"),
            Self::SamePortValuesRequired => write!(f, "Same Port Values Required"),
            Self::OnlyPermanentLeaseSupported => write!(f, "Only Permanent Lease Supported"),
            Self::RemoteHostOnlySupportsWildcard => write!(f, "Remote Host Only Supports Wildcard"),
            Self::ExternalPortOnlySupportsWildcard => write!(f, "External Port Only Supports Wildcard"),
            Self::NoPortMapsAvailable => write!(f, "No Port Maps Available"),
            Self::ConflictWithOtherMechanism => write!(f, "Conflict with Other Mechanism"),
        }
    }
}

impl UpnpErrorCode {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            401 => Some(Self::InvalidAction),
            402 => Some(Self::InvalidArgs),
            501 => Some(Self::ActionFailed),
            600 => Some(Self::ArgumentValueInvalid),
            601 => Some(Self::ArgumentValueOutOfRange),
            602 => Some(Self::OptionalActionNotImplemented),
            603 => Some(Self::OutOfMemory),
            604 => Some(Self::HumanInterventionRequired),
            606 => Some(Self::ActionNotAuthorized),
            714 => Some(Self::PortMappingNotFound),
            715 => Some(Self::WildCardNotPermittedInSrcIp),
            716 => Some(Self::WildCardNotPermittedInExtPort),
            718 => Some(Self::ConflictInMappingEntry),
            724 => Some(Self::SamePortValuesRequired),
            725 => Some(Self::OnlyPermanentLeaseSupported),
            726 => Some(Self::RemoteHostOnlySupportsWildcard),
            727 => Some(Self::ExternalPortOnlySupportsWildcard),
            728 => Some(Self::NoPortMapsAvailable),
            729 => Some(Self::ConflictWithOtherMechanism),
            _ => None,
        }
    }

    /// Faults that a different external port may get around
    pub fn is_port_conflict(&self) -> bool {
        matches!(
            self,
            Self::ConflictInMappingEntry | Self::ConflictWithOtherMechanism
        )
    }
}

/// Result type for port mapping operations
pub type NatResult<T> = Result<T, NatError>;
