//! Layer keys and capacity accounting, shared by the allocator and the
//! stream planner so both split a scene at exactly the same meshes.

use crate::config::{LayerCapacity, PRIMITIVE_ALIGNMENT, TEXTURE_MAX_ROWS, TEXTURE_ROW_WIDTH};
use crate::error::{DtxError, Resource, Result};
use crate::geometry::{GeometryCompressedParams, PrimitiveFamily};
use crate::tables::column;
use glam::{DMat4, DVec3};
use serde::Serialize;

/// Identity of a layer family: meshes with equal keys may share a layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LayerKey {
    pub family: PrimitiveFamily,
    pub texture_set: Option<String>,
    /// RTC cell of the layer origin.
    pub tile: [i64; 3],
}

impl LayerKey {
    /// Key of a mesh placing `geometry` with `matrix`.
    pub fn for_mesh(
        geometry: &GeometryCompressedParams,
        texture_set: Option<&str>,
        matrix: &DMat4,
        cell_size: f64,
    ) -> Self {
        let world = matrix.transform_point3(geometry.origin);
        let tile = if cell_size > 0.0 {
            let t = (world / cell_size).round();
            [t.x as i64, t.y as i64, t.z as i64]
        } else {
            [0; 3]
        };

        Self {
            family: geometry.primitive.family(),
            texture_set: texture_set.map(str::to_owned),
            tile,
        }
    }

    /// World-space RTC origin of layers with this key.
    pub fn origin(&self, cell_size: f64) -> DVec3 {
        if cell_size > 0.0 {
            DVec3::new(self.tile[0] as f64, self.tile[1] as f64, self.tile[2] as f64) * cell_size
        } else {
            DVec3::ZERO
        }
    }
}

/// Rounds a primitive count up to whole lookup entries.
#[inline]
pub fn aligned(n: usize) -> u64 {
    (n as u64).div_ceil(PRIMITIVE_ALIGNMENT as u64) * PRIMITIVE_ALIGNMENT as u64
}

/// Effective limits: the configured capacity clamped to what the tables can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LayerLimits {
    pub rows: u64,
    pub vertices: u64,
    pub primitives: u64,
}

impl From<&LayerCapacity> for LayerLimits {
    fn from(cap: &LayerCapacity) -> Self {
        let texels = TEXTURE_ROW_WIDTH as u64 * TEXTURE_MAX_ROWS as u64;
        Self {
            rows: (cap.max_meshes as u64).min(texels / column::COUNT as u64),
            vertices: (cap.max_vertices as u64).min(texels),
            primitives: (cap.max_primitives as u64).min(texels),
        }
    }
}

/// What a layer holds, or what one mesh would add to it.
///
/// Stored primitives count each geometry once per layer; stream primitives
/// count every placed mesh. Both are padded per bucket to
/// `PRIMITIVE_ALIGNMENT` and indexed by index width slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LayerUsage {
    pub meshes: u64,
    pub rows: u64,
    pub vertices: u64,
    pub primitives: [u64; 3],
    pub edges: [u64; 3],
    pub stream_primitives: [u64; 3],
    pub stream_edges: [u64; 3],
    /// Unpadded index values stored (primitives * arity + edges * 2).
    pub indices: u64,
}

impl LayerUsage {
    /// Footprint of one mesh of `geometry`. When the geometry is already in
    /// the layer only its rows and stream ranges are new.
    pub fn of_mesh(geometry: &GeometryCompressedParams, already_placed: bool) -> Self {
        let arity = geometry.primitive.arity();
        let mut u = LayerUsage {
            meshes: 1,
            rows: geometry.buckets.len() as u64,
            ..Default::default()
        };

        for bucket in &geometry.buckets {
            let w = bucket.index_width().slot();
            let prims = bucket.num_primitives(arity);
            u.stream_primitives[w] += aligned(prims);

            let edge_slot = bucket.edge_width().map(|ew| ew.slot());
            if let Some(ew) = edge_slot {
                u.stream_edges[ew] += aligned(bucket.num_edges());
            }

            if !already_placed {
                u.vertices += bucket.num_vertices() as u64;
                u.primitives[w] += aligned(prims);
                u.indices += (prims * arity + bucket.num_edges() * 2) as u64;
                if let Some(ew) = edge_slot {
                    u.edges[ew] += aligned(bucket.num_edges());
                }
            }
        }

        u
    }

    pub fn add(&mut self, other: &LayerUsage) {
        self.meshes += other.meshes;
        self.rows += other.rows;
        self.vertices += other.vertices;
        self.indices += other.indices;
        for w in 0..3 {
            self.primitives[w] += other.primitives[w];
            self.edges[w] += other.edges[w];
            self.stream_primitives[w] += other.stream_primitives[w];
            self.stream_edges[w] += other.stream_edges[w];
        }
    }

    pub fn plus(&self, other: &LayerUsage) -> LayerUsage {
        let mut out = *self;
        out.add(other);
        out
    }

    /// First limit this usage breaks, if any.
    pub fn check(&self, limits: &LayerLimits) -> Result<()> {
        if self.rows > limits.rows {
            return Err(DtxError::capacity(Resource::MeshRows, self.rows, limits.rows));
        }
        if self.vertices > limits.vertices {
            return Err(DtxError::capacity(Resource::Vertices, self.vertices, limits.vertices));
        }

        let prims = self.primitives.iter().chain(&self.stream_primitives).copied().max().unwrap_or(0);
        if prims > limits.primitives {
            return Err(DtxError::capacity(Resource::Primitives, prims, limits.primitives));
        }

        let edges = self.edges.iter().chain(&self.stream_edges).copied().max().unwrap_or(0);
        if edges > limits.primitives {
            return Err(DtxError::capacity(Resource::EdgePrimitives, edges, limits.primitives));
        }

        Ok(())
    }

    pub fn fits(&self, limits: &LayerLimits) -> bool {
        self.check(limits).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DtxConfig;
    use crate::geometry::compress::tests::cube_record;
    use crate::geometry::compress_geometry;
    use crate::ErrorKind;

    #[test]
    fn repeated_geometry_only_adds_rows_and_stream() {
        let cube = compress_geometry(&cube_record("c"), &DtxConfig::default()).unwrap();
        let first = LayerUsage::of_mesh(&cube, false);
        let again = LayerUsage::of_mesh(&cube, true);

        assert_eq!(first.vertices, 8);
        assert_eq!(first.primitives[0], 16);
        assert_eq!(first.edges[0], 16);
        assert_eq!(first.indices, 36 + 24);

        assert_eq!(again.vertices, 0);
        assert_eq!(again.primitives, [0; 3]);
        assert_eq!(again.stream_primitives[0], 16);
        assert_eq!(again.rows, 1);
    }

    #[test]
    fn check_names_the_first_exceeded_resource() {
        let limits = LayerLimits::from(&LayerCapacity {
            max_meshes: 10,
            max_vertices: 100,
            max_primitives: 1000,
        });
        let usage = LayerUsage {
            rows: 5,
            vertices: 101,
            ..Default::default()
        };

        let err = usage.check(&limits).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        match err {
            DtxError::CapacityExceeded(c) => {
                assert_eq!(c.resource, Resource::Vertices);
                assert_eq!((c.requested, c.limit), (101, 100));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn limits_are_clamped_to_table_size() {
        let limits = LayerLimits::from(&LayerCapacity {
            max_meshes: u32::MAX,
            max_vertices: u32::MAX,
            max_primitives: 7,
        });
        assert_eq!(limits.rows, 1024 * 16384 / 8);
        assert_eq!(limits.vertices, 1024 * 16384);
        assert_eq!(limits.primitives, 7);
    }

    #[test]
    fn key_tiles_follow_the_placed_origin() {
        let cube = compress_geometry(&cube_record("c"), &DtxConfig::default()).unwrap();
        let here = LayerKey::for_mesh(&cube, None, &DMat4::IDENTITY, 200.0);
        let there = LayerKey::for_mesh(
            &cube,
            None,
            &DMat4::from_translation(DVec3::new(1000.0, 0.0, 0.0)),
            200.0,
        );

        assert_eq!(here.tile, [0, 0, 0]);
        assert_eq!(there.tile, [5, 0, 0]);
        assert_eq!(there.origin(200.0), DVec3::new(1000.0, 0.0, 0.0));
        assert_ne!(here, LayerKey::for_mesh(&cube, Some("bricks"), &DMat4::IDENTITY, 200.0));
    }
}
