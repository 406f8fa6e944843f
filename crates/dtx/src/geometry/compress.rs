use super::buckets::Bucketer;
use super::edges::build_edge_indices;
use super::quantize::{
    compress_colors, compress_uvs, positions_decompress_matrix, quantize_positions, snap_origin,
    Aabb,
};
use super::{
    GeometryBucket, GeometryCompressedParams, GeometryRecord, IndexArray, IndexWidth,
    PrimitiveFamily, PrimitiveKind,
};
use crate::config::DtxConfig;
use crate::error::{DtxError, Result};
use hashbrown::HashMap;
use rayon::prelude::*;
use std::sync::Arc;

fn validate_record(record: &GeometryRecord) -> Result<usize> {
    let id = record.id.as_str();
    let arity = record.primitive.arity();

    if record.positions.is_empty() {
        return Err(DtxError::malformed(id, "no positions"));
    }

    if record.positions.len() % 3 != 0 {
        return Err(DtxError::malformed(
            id,
            format!("{} position values is not a multiple of 3", record.positions.len()),
        ));
    }

    if record.positions.iter().any(|v| !v.is_finite()) {
        return Err(DtxError::malformed(id, "non-finite position"));
    }

    let verts = record.positions.len() / 3;
    if verts > u32::MAX as usize {
        return Err(DtxError::malformed(id, "too many vertices"));
    }

    if let Some(uvs) = record.uvs.as_ref() {
        if uvs.len() != verts * 2 {
            return Err(DtxError::malformed(id, format!("{} uv values for {verts} vertices", uvs.len())));
        }
    }

    if let Some(colors) = record.colors.as_ref() {
        if colors.len() != verts * 4 {
            return Err(DtxError::malformed(id, format!("{} color values for {verts} vertices", colors.len())));
        }
    }

    let check_range = |what: &str, indices: &[u32]| -> Result<()> {
        match indices.iter().find(|&&i| i as usize >= verts) {
            Some(i) => Err(DtxError::malformed(
                id,
                format!("{what} {i} out of range ({verts} vertices)"),
            )),
            None => Ok(()),
        }
    };

    match record.indices.as_ref() {
        Some(indices) => {
            if indices.len() % arity != 0 {
                return Err(DtxError::malformed(
                    id,
                    format!("{} indices is not a multiple of {arity}", indices.len()),
                ));
            }
            check_range("index", indices)?;
        }
        None if verts % arity != 0 => {
            return Err(DtxError::malformed(
                id,
                format!("{verts} unindexed vertices is not a multiple of {arity}"),
            ));
        }
        None => {}
    }

    if let Some(edges) = record.edge_indices.as_ref() {
        if record.primitive.family() != PrimitiveFamily::Triangles {
            return Err(DtxError::malformed(id, "edge indices on a non-triangle geometry"));
        }
        if edges.len() % 2 != 0 {
            return Err(DtxError::malformed(id, "odd edge index count"));
        }
        check_range("edge index", edges)?;
    }

    Ok(verts)
}

/// Compresses one geometry record into quantized, index-width-optimal buckets.
pub fn compress_geometry(record: &GeometryRecord, config: &DtxConfig) -> Result<GeometryCompressedParams> {
    let verts = validate_record(record)?;
    let arity = record.primitive.arity();

    // RTC origin and origin-relative positions.
    let world = Aabb::from_flat(&record.positions);
    let origin = snap_origin(world.center(), config.rtc_cell_size);
    let relative: Vec<f64> = record
        .positions
        .chunks_exact(3)
        .flat_map(|p| [p[0] - origin.x, p[1] - origin.y, p[2] - origin.z])
        .collect();

    let bounds = Aabb {
        min: world.min - origin,
        max: world.max - origin,
    };
    let positions_q = quantize_positions(&relative, bounds.min, bounds.max);
    let decompress = positions_decompress_matrix(bounds.min, bounds.max);

    let uvs = record.uvs.as_deref().map(compress_uvs);
    let colors = record.colors.as_deref().map(compress_colors);

    let indices: Vec<u32> = match record.indices.as_ref() {
        Some(indices) => indices.clone(),
        None => (0..verts as u32).collect(),
    };

    // Position-only weld for edge detection; full-attribute weld for storage.
    let weld_positions = weld(verts, |v| key3(&positions_q, v));
    let canonical: Vec<u32> = if config.merge_duplicate_vertices {
        weld(verts, |v| VertexKey {
            position: key3(&positions_q, v),
            uv: uvs.as_ref().map(|(q, _)| [q[v * 2], q[v * 2 + 1]]),
            color: colors.as_ref().map(|c| [c[v * 4], c[v * 4 + 1], c[v * 4 + 2], c[v * 4 + 3]]),
        })
    } else {
        (0..verts as u32).collect()
    };

    let indices: Vec<u32> = indices.iter().map(|&i| canonical[i as usize]).collect();

    let mut bucketer = Bucketer::new(config.max_bucket_vertices);
    bucketer.add_primitives(&indices, arity);

    match record.edge_indices.as_ref() {
        Some(edges) => {
            for pair in edges.chunks_exact(2) {
                let (a, b) = (canonical[pair[0] as usize], canonical[pair[1] as usize]);
                bucketer.add_edge(a, b);
            }
        }
        None if record.primitive.family() == PrimitiveFamily::Triangles => {
            let derived = build_edge_indices(
                &relative,
                &indices,
                &weld_positions,
                config.edge_threshold_deg,
            );
            for edge in derived {
                bucketer.add_edge_of_primitive(edge.triangle, edge.a, edge.b);
            }
        }
        None => {}
    }

    let builds = bucketer.finish();
    let is_triangles = record.primitive.family() == PrimitiveFamily::Triangles;

    let buckets: Vec<GeometryBucket> = builds
        .iter()
        .map(|build| {
            let width = IndexWidth::for_vertex_count(build.vertices.len());

            let positions_compressed = build
                .vertices
                .iter()
                .flat_map(|&v| key3(&positions_q, v as usize))
                .collect();

            let uvs_compressed = uvs.as_ref().map(|(q, _)| {
                build
                    .vertices
                    .iter()
                    .flat_map(|&v| [q[v as usize * 2], q[v as usize * 2 + 1]])
                    .collect()
            });

            let colors_compressed = colors.as_ref().map(|c| {
                build
                    .vertices
                    .iter()
                    .flat_map(|&v| {
                        let v = v as usize * 4;
                        [c[v], c[v + 1], c[v + 2], c[v + 3]]
                    })
                    .collect()
            });

            let edge_indices = (is_triangles && !build.edges.is_empty())
                .then(|| IndexArray::with_width(&build.edges, width));

            GeometryBucket {
                positions_compressed,
                uvs_compressed,
                colors_compressed,
                indices: Some(IndexArray::with_width(&build.indices, width)),
                edge_indices,
            }
        })
        .collect();

    let primitive = if record.primitive == PrimitiveKind::Solid && buckets.len() > 1 {
        log::debug!(
            "geometry `{}`: solid split over {} buckets, downgraded to surface",
            record.id,
            buckets.len()
        );
        PrimitiveKind::Surface
    } else {
        record.primitive
    };

    log::debug!(
        "geometry `{}`: {} vertices -> {} bucket(s), origin ({:.1}, {:.1}, {:.1})",
        record.id,
        verts,
        buckets.len(),
        origin.x,
        origin.y,
        origin.z
    );

    Ok(GeometryCompressedParams {
        id: record.id.clone(),
        primitive,
        origin,
        positions_decompress_matrix: decompress,
        uv_decompress_matrix: uvs.map(|(_, m)| m),
        buckets,
    })
}

/// Compresses many records on the rayon pool. Output order matches input.
pub fn compress_all(
    records: &[GeometryRecord],
    config: &DtxConfig,
) -> Vec<Result<Arc<GeometryCompressedParams>>> {
    records
        .par_iter()
        .map(|record| compress_geometry(record, config).map(Arc::new))
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct VertexKey {
    position: [u16; 3],
    uv: Option<[u16; 2]>,
    color: Option<[u8; 4]>,
}

#[inline]
fn key3(q: &[u16], v: usize) -> [u16; 3] {
    [q[v * 3], q[v * 3 + 1], q[v * 3 + 2]]
}

/// Maps each vertex to the first vertex with an equal key.
fn weld<K: Eq + std::hash::Hash, F: Fn(usize) -> K>(verts: usize, key: F) -> Vec<u32> {
    let mut first: HashMap<K, u32> = HashMap::with_capacity(verts);
    (0..verts)
        .map(|v| *first.entry(key(v)).or_insert(v as u32))
        .collect()
}
