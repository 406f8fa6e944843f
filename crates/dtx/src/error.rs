//! Error type shared by every fallible operation in the crate.

use std::fmt;

/// Which capacity bound an operation ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Rows of the each-mesh tables (one per geometry bucket of a mesh).
    MeshRows,
    Vertices,
    Primitives,
    EdgePrimitives,
    /// Rows of a single data texture.
    TableRows,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Resource::MeshRows => "mesh rows",
            Resource::Vertices => "vertices",
            Resource::Primitives => "primitives",
            Resource::EdgePrimitives => "edge primitives",
            Resource::TableRows => "table rows",
        };

        f.write_str(s)
    }
}

/// Structured payload of a capacity failure so callers can re-partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityExceeded {
    pub resource: Resource,
    /// Total the operation would have reached.
    pub requested: u64,
    pub limit: u64,
}

impl fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} would reach {} (limit {})",
            self.resource, self.requested, self.limit
        )
    }
}

/// Coarse error categories callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CapacityExceeded,
    MalformedGeometry,
    StatePrecondition,
    Backend,
    Io,
}

#[derive(thiserror::Error, Debug)]
pub enum DtxError {
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(CapacityExceeded),

    #[error("malformed geometry `{geometry_id}`: {reason}")]
    MalformedGeometry { geometry_id: String, reason: String },

    #[error("state precondition violated: {0}")]
    StatePrecondition(String),

    #[error("unknown geometry `{0}`")]
    UnknownGeometry(String),

    #[error("unknown mesh `{0}`")]
    UnknownMesh(String),

    #[error("duplicate id `{0}`")]
    DuplicateId(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DtxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DtxError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            DtxError::MalformedGeometry { .. } => ErrorKind::MalformedGeometry,
            DtxError::StatePrecondition(_)
            | DtxError::UnknownGeometry(_)
            | DtxError::UnknownMesh(_)
            | DtxError::DuplicateId(_) => ErrorKind::StatePrecondition,
            DtxError::Backend(_) => ErrorKind::Backend,
            DtxError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn capacity(resource: Resource, requested: u64, limit: u64) -> Self {
        DtxError::CapacityExceeded(CapacityExceeded {
            resource,
            requested,
            limit,
        })
    }

    pub fn malformed<I: ToString, R: ToString>(geometry_id: I, reason: R) -> Self {
        DtxError::MalformedGeometry {
            geometry_id: geometry_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn state<T: ToString>(msg: T) -> Self {
        DtxError::StatePrecondition(msg.to_string())
    }

    pub fn backend<T: ToString>(msg: T) -> Self {
        DtxError::Backend(msg.to_string())
    }
}

pub type Result<T, E = DtxError> = std::result::Result<T, E>;
