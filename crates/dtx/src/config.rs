//! Engine configuration and the fixed data-texture geometry.

use serde::{Deserialize, Serialize};

/// Texels per data-texture row. Every table uses the same width.
pub const TEXTURE_ROW_WIDTH: u32 = 1024;

/// Maximum rows of any data texture.
pub const TEXTURE_MAX_ROWS: u32 = 16384;

/// Primitives covered by one entry of a primitive->mesh lookup table.
/// Each mesh row's primitive range is padded to a multiple of this.
pub const PRIMITIVE_ALIGNMENT: u32 = 8;

/// Hard capacity of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerCapacity {
    /// Rows of the each-mesh tables; one per geometry bucket of a mesh.
    pub max_meshes: u32,
    /// Vertices in the positions table.
    pub max_vertices: u32,
    /// Primitives per index bit-width table, stored and drawn.
    pub max_primitives: u32,
}

impl Default for LayerCapacity {
    fn default() -> Self {
        Self {
            max_meshes: 500_000,
            max_vertices: 4096 * 4096,
            max_primitives: 4096 * 4096,
        }
    }
}

/// Storage precision of the each-mesh-matrices table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixPrecision {
    /// RGBA16F texels.
    #[default]
    Half,
    /// RGBA32F texels.
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtxConfig {
    /// Size of the RTC origin grid. Geometry origins and layer origins snap to it.
    pub rtc_cell_size: f64,
    /// Dihedral angle above which a shared triangle edge becomes a wireframe edge.
    pub edge_threshold_deg: f64,
    /// Largest distinct-vertex count of one geometry bucket.
    pub max_bucket_vertices: u32,
    /// Merge vertices whose quantized position, uv and colour coincide.
    pub merge_duplicate_vertices: bool,
    pub capacity: LayerCapacity,
    pub matrix_precision: MatrixPrecision,
}

impl Default for DtxConfig {
    fn default() -> Self {
        Self {
            rtc_cell_size: 200.0,
            edge_threshold_deg: 10.0,
            max_bucket_vertices: 1 << 16,
            merge_duplicate_vertices: true,
            capacity: LayerCapacity::default(),
            matrix_precision: MatrixPrecision::Half,
        }
    }
}
