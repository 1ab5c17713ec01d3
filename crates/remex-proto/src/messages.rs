// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SSZ message types for the remote execution protocol

// Strings travel as Vec<u8>; exit codes travel as u32 (two's complement of the
// process exit status) so they fit SSZ's unsigned integers.
use ssz_derive::{Decode, Encode};

/// Request union - each variant carries one call (or one step of a
/// client-streamed call)
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum Request {
    Handshake(HandshakeRequest),
    RunProcess(BuildRequest),
    PinBulk(PinBulkRequest),
    /// One message of a StoreFile stream: the header first, then chunks
    StoreFile(StoreFileRequest),
    /// Ends the StoreFile stream opened on this connection
    StoreFileComplete(RequestHeader),
}

/// Response union - one response per unary call, one per completed stream
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum Response {
    Handshake(HandshakeResponse),
    RunProcess(BuildResponse),
    PinBulk(PinBulkResponse),
    StoreFile(StoreFileResponse),
    Error(ErrorResponse),
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct HandshakeRequest {
    /// Protocol version (e.g., "1")
    pub version: Vec<u8>,
    /// Free-form client identification, logged by the agent
    pub client: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct HandshakeResponse {
    pub success: bool,
    pub version: Vec<u8>,
    pub error_message: Option<Vec<u8>>,
}

/// Dispatch-level failure. `code` is a [`DispatchErrorCode`].
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct ErrorResponse {
    pub error: Vec<u8>,
    pub code: u32,
}

/// One node of a transmitted path table. `name` is a single segment, never
/// a full path; root entries have `parent == 0`.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct AbsolutePath {
    pub id: u32,
    pub parent: u32,
    pub name: Vec<u8>,
}

/// Self-contained path namespace for one transmission, parents before
/// children.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct PathTable {
    pub paths: Vec<AbsolutePath>,
    pub next_local_path_id: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct FileArtifact {
    pub path_id: u32,
    pub rewrite_count: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct FileArtifactWithAttributes {
    pub path_id: u32,
    pub rewrite_count: u32,
    /// 0 = required, 1 = temporary, 2 = optional
    pub file_existence: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct DirectoryArtifact {
    pub path_id: u32,
    pub partial_seal_id: u32,
    pub is_shared: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct ContentHashAndHashTypeData {
    pub hash_type: u32,
    pub content_hash: Vec<u8>,
}

/// Piece of a rendered argument or environment value
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum PipFragment {
    Literal(Vec<u8>),
    /// Wire path id, expanded to an absolute path on the receiving side
    Path(u32),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct PipData {
    pub fragments: Vec<PipFragment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct EnvironmentVariable {
    pub name: Vec<u8>,
    pub is_pass_through: bool,
    /// Ignored when `is_pass_through` is set
    pub value: PipData,
}

/// Wire form of a process pip.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Process {
    pub semi_stable_hash: u64,
    pub executable: FileArtifact,
    /// One entry per argv element
    pub arguments: Vec<PipData>,
    pub working_directory: u32,
    pub dependencies: Vec<FileArtifact>,
    pub directory_dependencies: Vec<DirectoryArtifact>,
    pub file_outputs: Vec<FileArtifactWithAttributes>,
    pub directory_outputs: Vec<DirectoryArtifact>,
    pub environment_variables: Vec<EnvironmentVariable>,
    /// Milliseconds, 0 = use the agent default
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct RequestHeader {
    pub trace_id: Vec<u8>,
    pub session_id: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct ResponseHeader {
    pub succeeded: bool,
    /// A [`PinResultCode`] for pin results, 0 otherwise
    pub result: u32,
    pub diagnostics: Vec<u8>,
    pub error_message: Vec<u8>,
    /// Milliseconds since the Unix epoch at which the server received the call
    pub server_receipt_time_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct PinBulkRequest {
    pub header: RequestHeader,
    pub hashes: Vec<ContentHashAndHashTypeData>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct IndexedResponseHeader {
    /// Position of the hash in the originating [`PinBulkRequest`]
    pub index: u32,
    pub header: ResponseHeader,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct PinBulkResponse {
    pub results: Vec<IndexedResponseHeader>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct StoreFileHeader {
    pub header: RequestHeader,
    pub content_hash: ContentHashAndHashTypeData,
    /// Client-side path of the content, used to name the staged file
    pub path: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct FileChunk {
    pub content: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum StoreFileRequest {
    Header(StoreFileHeader),
    Chunk(FileChunk),
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct StoreFileResponse {
    pub header: ResponseHeader,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BuildRequest {
    pub header: RequestHeader,
    pub path_table: PathTable,
    pub process: Process,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct OutputFile {
    pub file: FileArtifact,
    pub content_hash: ContentHashAndHashTypeData,
    pub length: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BuildResponse {
    pub exit_code: u32,
    /// A [`BuildStatus`]
    pub status: u8,
    pub output_file: Vec<OutputFile>,
    pub path_table: PathTable,
    pub standard_output: Vec<u8>,
    pub standard_error: Vec<u8>,
    pub execution_time_ms: u64,
}

/// Per-hash outcome carried in [`ResponseHeader::result`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PinResultCode {
    Success = 0,
    Error = 1,
    ContentNotFound = 2,
}

impl PinResultCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::Error),
            2 => Some(Self::ContentNotFound),
            _ => None,
        }
    }
}

/// How a dispatched process finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BuildStatus {
    /// Exited with code 0
    Succeeded = 0,
    /// Exited with a non-zero code
    ExecutionFailed = 1,
    /// Killed after exceeding its timeout
    TimedOut = 2,
}

impl BuildStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Succeeded),
            1 => Some(Self::ExecutionFailed),
            2 => Some(Self::TimedOut),
            _ => None,
        }
    }
}

/// Code carried in [`ErrorResponse::code`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DispatchErrorCode {
    ProtocolViolation = 1,
    UntrackedContentDeclared = 2,
    ContentUnavailable = 3,
    SandboxInfrastructureFailure = 4,
    Cancelled = 5,
    Internal = 6,
}

impl DispatchErrorCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::ProtocolViolation),
            2 => Some(Self::UntrackedContentDeclared),
            3 => Some(Self::ContentUnavailable),
            4 => Some(Self::SandboxInfrastructureFailure),
            5 => Some(Self::Cancelled),
            6 => Some(Self::Internal),
            _ => None,
        }
    }
}

// Constructors for SSZ union variants (convert String to Vec<u8>)
impl Request {
    pub fn handshake(client: &str) -> Self {
        Self::Handshake(HandshakeRequest {
            version: crate::PROTOCOL_VERSION.to_vec(),
            client: client.as_bytes().to_vec(),
        })
    }

    pub fn store_file_header(
        header: RequestHeader,
        content_hash: ContentHashAndHashTypeData,
        path: &str,
    ) -> Self {
        Self::StoreFile(StoreFileRequest::Header(StoreFileHeader {
            header,
            content_hash,
            path: path.as_bytes().to_vec(),
        }))
    }

    pub fn store_file_chunk(content: Vec<u8>) -> Self {
        Self::StoreFile(StoreFileRequest::Chunk(FileChunk { content }))
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Handshake(_) => "handshake",
            Request::RunProcess(_) => "run_process",
            Request::PinBulk(_) => "pin_bulk",
            Request::StoreFile(_) => "store_file",
            Request::StoreFileComplete(_) => "store_file_complete",
        }
    }
}

impl Response {
    pub fn handshake_ok() -> Self {
        Self::Handshake(HandshakeResponse {
            success: true,
            version: crate::PROTOCOL_VERSION.to_vec(),
            error_message: None,
        })
    }

    pub fn handshake_rejected(message: String) -> Self {
        Self::Handshake(HandshakeResponse {
            success: false,
            version: crate::PROTOCOL_VERSION.to_vec(),
            error_message: Some(message.into_bytes()),
        })
    }

    pub fn error(message: String, code: DispatchErrorCode) -> Self {
        Self::Error(ErrorResponse {
            error: message.into_bytes(),
            code: code as u32,
        })
    }
}

impl RequestHeader {
    pub fn new(trace_id: &str) -> Self {
        Self {
            trace_id: trace_id.as_bytes().to_vec(),
            session_id: crate::DEFAULT_SESSION_ID,
        }
    }

    pub fn trace_id_lossy(&self) -> String {
        String::from_utf8_lossy(&self.trace_id).into_owned()
    }
}

impl ResponseHeader {
    pub fn success(receipt_time_ms: u64) -> Self {
        Self {
            succeeded: true,
            result: PinResultCode::Success as u32,
            server_receipt_time_ms: receipt_time_ms,
            ..Default::default()
        }
    }

    pub fn failure(code: PinResultCode, message: String, receipt_time_ms: u64) -> Self {
        Self {
            succeeded: false,
            result: code as u32,
            diagnostics: Vec::new(),
            error_message: message.into_bytes(),
            server_receipt_time_ms: receipt_time_ms,
        }
    }

    pub fn error_message_lossy(&self) -> String {
        String::from_utf8_lossy(&self.error_message).into_owned()
    }
}

impl ErrorResponse {
    pub fn message_lossy(&self) -> String {
        String::from_utf8_lossy(&self.error).into_owned()
    }
}

/// Converts a process exit status to its wire form.
pub fn exit_code_to_wire(code: i32) -> u32 {
    code as u32
}

pub fn exit_code_from_wire(code: u32) -> i32 {
    code as i32
}
