//! Error Handling Module
//!
//! Every manager operation returns a [`DeviceError`]. Failures coming from the
//! control facility or the zeroizer are passed through as their source, wrapped
//! with the volume id of the call that hit them. Nothing here is retried.

use crate::clear::ClearError;
use crate::ndctl::NdctlError;
use thiserror::Error;

/// Coarse classification of a [`DeviceError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Control facility unreachable or its filesystem surface read-only
    InitializationFailure,
    /// Create on a volume id that is already active
    AlreadyExists,
    /// Operation on a volume id that is not active
    NotFound,
    /// Namespace creation refused by the facility
    AllocationFailure,
    /// Clearing device contents failed
    ZeroizeFailure,
    /// Namespace destruction refused by the facility
    DestroyFailure,
    /// Listing or looking up namespaces or regions failed
    Enumeration,
    /// Malformed request (for example an unknown mode)
    InvalidArgument,
    /// Namespace exists but is not a fsdax or sector block device
    Unmanaged,
}

impl ErrorKind {
    /// Returns a short identifier, stable for logs and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InitializationFailure => "initialization",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AllocationFailure => "allocation",
            ErrorKind::ZeroizeFailure => "zeroize",
            ErrorKind::DestroyFailure => "destroy",
            ErrorKind::Enumeration => "enumeration",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Unmanaged => "unmanaged",
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("namespace {0} already exists")]
    AlreadyExists(String),

    #[error("namespace {0} not found")]
    NotFound(String),

    #[error("creating namespace {volume_id} failed: {source}")]
    Allocation {
        volume_id: String,
        #[source]
        source: NdctlError,
    },

    /// The namespace exists but its head could not be cleared. Creating the
    /// same id again reports `AlreadyExists`; the namespace has to be deleted.
    #[error("namespace {volume_id} was created but could not be cleared, delete it before retrying: {source}")]
    CreatedUncleared {
        volume_id: String,
        #[source]
        source: ClearError,
    },

    #[error("clearing namespace {volume_id} failed: {source}")]
    Zeroize {
        volume_id: String,
        #[source]
        source: ClearError,
    },

    #[error("destroying namespace {volume_id} failed: {source}")]
    Destroy {
        volume_id: String,
        #[source]
        source: NdctlError,
    },

    /// Active under this id but without a block device in a managed mode,
    /// for example a devdax namespace. It can still be deleted.
    #[error("namespace {volume_id} ({dev}) has no block device or is in an unmanaged mode")]
    Unmanaged { volume_id: String, dev: String },

    #[error("namespace enumeration failed: {0}")]
    Enumeration(#[source] NdctlError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Initialization(_) => ErrorKind::InitializationFailure,
            DeviceError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            DeviceError::NotFound(_) => ErrorKind::NotFound,
            DeviceError::Allocation { .. } => ErrorKind::AllocationFailure,
            DeviceError::CreatedUncleared { .. } | DeviceError::Zeroize { .. } => {
                ErrorKind::ZeroizeFailure
            }
            DeviceError::Destroy { .. } => ErrorKind::DestroyFailure,
            DeviceError::Enumeration(_) => ErrorKind::Enumeration,
            DeviceError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            DeviceError::Unmanaged { .. } => ErrorKind::Unmanaged,
        }
    }

    /// True when a create left an allocated but uncleared namespace behind.
    pub fn is_partial_create(&self) -> bool {
        matches!(self, DeviceError::CreatedUncleared { .. })
    }
}

/// Result type alias for device manager operations
pub type Result<T> = std::result::Result<T, DeviceError>;
