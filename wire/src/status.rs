//! gRPC status codes.

use std::fmt;

/// The canonical gRPC status code set, as carried in the `grpc-status`
/// trailer. The seventeen values and their numbers are fixed by the
/// protocol and must survive the wire unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    /// Success.
    Ok = 0,
    /// The caller abandoned the call.
    Cancelled = 1,
    /// An error that fits nowhere else in the taxonomy.
    Unknown = 2,
    /// The request itself was malformed, independent of system state.
    InvalidArgument = 3,
    /// The call outlived its deadline.
    DeadlineExceeded = 4,
    /// The addressed entity does not exist.
    NotFound = 5,
    /// The entity being created is already there.
    AlreadyExists = 6,
    /// The caller is known but not allowed to do this.
    PermissionDenied = 7,
    /// Quota, memory, or some other resource ran out.
    ResourceExhausted = 8,
    /// The system is not in a state this operation requires.
    FailedPrecondition = 9,
    /// Dropped over a concurrency conflict; retry at a higher level.
    Aborted = 10,
    /// An argument walked past its valid range.
    OutOfRange = 11,
    /// The method exists in the schema but not in this server.
    Unimplemented = 12,
    /// An invariant the backend relies on did not hold.
    Internal = 13,
    /// Transient failure; retrying the call may succeed.
    Unavailable = 14,
    /// Bytes were lost or corrupted beyond recovery.
    DataLoss = 15,
    /// Credentials are missing or invalid.
    Unauthenticated = 16,
}

/// Codes ordered by wire value, for numeric round trips.
const CODES: [Code; 17] = [
    Code::Ok,
    Code::Cancelled,
    Code::Unknown,
    Code::InvalidArgument,
    Code::DeadlineExceeded,
    Code::NotFound,
    Code::AlreadyExists,
    Code::PermissionDenied,
    Code::ResourceExhausted,
    Code::FailedPrecondition,
    Code::Aborted,
    Code::OutOfRange,
    Code::Unimplemented,
    Code::Internal,
    Code::Unavailable,
    Code::DataLoss,
    Code::Unauthenticated,
];

/// Canonical names, indexed by wire value.
const NAMES: [&str; 17] = [
    "OK",
    "CANCELLED",
    "UNKNOWN",
    "INVALID_ARGUMENT",
    "DEADLINE_EXCEEDED",
    "NOT_FOUND",
    "ALREADY_EXISTS",
    "PERMISSION_DENIED",
    "RESOURCE_EXHAUSTED",
    "FAILED_PRECONDITION",
    "ABORTED",
    "OUT_OF_RANGE",
    "UNIMPLEMENTED",
    "INTERNAL",
    "UNAVAILABLE",
    "DATA_LOSS",
    "UNAUTHENTICATED",
];

impl Code {
    /// Map a wire value back to a code. Values past the table collapse
    /// to `Unknown`, the protocol's forward-compatibility rule.
    pub fn from_u32(value: u32) -> Self {
        usize::try_from(value)
            .ok()
            .and_then(|index| CODES.get(index))
            .copied()
            .unwrap_or(Code::Unknown)
    }

    /// The wire value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// The canonical SCREAMING_SNAKE_CASE name, e.g. `DEADLINE_EXCEEDED`.
    pub fn name(self) -> &'static str {
        NAMES[self as usize]
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Code::Ok)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Terminal status of an RPC: a code plus an optional human-readable
/// detail message.
#[derive(Debug, Clone)]
pub struct Status {
    code: Code,
    message: Option<String>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self { code, message: Some(message.into()) }
    }

    /// An OK status with no message.
    pub fn ok() -> Self {
        Self::from_code(Code::Ok)
    }

    /// A bare status carrying only a code.
    pub fn from_code(code: Code) -> Self {
        Self { code, message: None }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Create a cancelled status.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    /// Create an invalid argument status.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// Create a deadline exceeded status.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    /// Create a failed precondition status.
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    /// Create an aborted status.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(Code::Aborted, message)
    }

    /// Create a resource exhausted status.
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    /// Create an unimplemented status.
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    /// Create an internal error status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Create an unavailable status.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code.name(), message),
            None => f.write_str(self.code.name()),
        }
    }
}

impl std::error::Error for Status {}
