//! dtx: compressed geometry, GPU data-texture packing and render-pass
//! scheduling for very large BIM/CAD scenes.
//!
//! Flow: `GeometryRecord`s are compressed into bucketed, quantized
//! `GeometryCompressedParams`; a `SceneModel` routes meshes into
//! capacity-bounded `Layer`s, each packing its meshes into one
//! `DataTextureSet`; `finalize` uploads the tables through a `TextureSink`,
//! and the scheduler draws each layer pass by pass through a `DrawBackend`,
//! skipping passes its `MeshCounts` rule out.

pub mod capacity;
pub mod config;
pub mod error;
pub mod flags;
pub mod geometry;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod layer;
pub mod model;
pub mod persist;
pub mod planner;
pub mod scheduler;
pub mod sink;
pub mod tables;

pub use capacity::{LayerKey, LayerLimits, LayerUsage};
pub use config::{DtxConfig, LayerCapacity, MatrixPrecision, PRIMITIVE_ALIGNMENT, TEXTURE_MAX_ROWS, TEXTURE_ROW_WIDTH};
pub use error::{CapacityExceeded, DtxError, ErrorKind, Resource, Result};
pub use flags::{MeshCounts, RenderFlags};
pub use geometry::{
    compress_all, compress_geometry, GeometryBucket, GeometryCompressedParams, GeometryRecord, IndexArray, IndexWidth,
    PrimitiveFamily, PrimitiveKind,
};
pub use layer::{Layer, LayerId, LayerState, MeshEntry, MeshPlacement, RowEntry};
pub use model::{MeshParams, MeshRef, ModelState, SceneModel};
pub use planner::{PlannedLayer, StreamCapacityPlanner, StreamManifest};
pub use scheduler::{
    DrawBackend, DrawCall, PassRenderer, PassStats, ProgramDesc, ProgramKind, RecordedDraw, RecordingBackend,
    RenderPass, ViewConfig,
};
pub use sink::{MemorySink, TableKind, TexelFormat, TexelRegion, TextureDesc, TextureHandle, TextureSink};
pub use tables::DataTextureSet;
