//! Conversion between a `SceneModel` and a DTXB container.

use crate::config::DtxConfig;
use crate::error::{DtxError, Result};
use crate::flags::RenderFlags;
use crate::geometry::{GeometryBucket, GeometryCompressedParams, IndexArray, PrimitiveKind};
use crate::model::{MeshParams, SceneModel};
use dtxb::{DtxbBucket, DtxbGeometry, DtxbMesh, DtxbModel, IndexData};
use glam::{DVec3, Mat3, Mat4, Vec3};
use std::path::Path;

fn index_data(a: &IndexArray) -> IndexData {
    match a {
        IndexArray::U8(v) => IndexData::U8(v.clone()),
        IndexArray::U16(v) => IndexData::U16(v.clone()),
        IndexArray::U32(v) => IndexData::U32(v.clone()),
    }
}

fn index_array(d: IndexData) -> IndexArray {
    match d {
        IndexData::U8(v) => IndexArray::U8(v),
        IndexData::U16(v) => IndexArray::U16(v),
        IndexData::U32(v) => IndexArray::U32(v),
    }
}

pub fn geometry_to_dtxb(g: &GeometryCompressedParams) -> DtxbGeometry {
    DtxbGeometry {
        id: g.id.clone(),
        primitive: g.primitive.code(),
        origin: g.origin.to_array(),
        positions_decompress_matrix: g.positions_decompress_matrix.to_cols_array(),
        uv_decompress_matrix: g.uv_decompress_matrix.map(|m| m.to_cols_array()),
        buckets: g
            .buckets
            .iter()
            .map(|b| DtxbBucket {
                positions: b.positions_compressed.clone(),
                uvs: b.uvs_compressed.clone(),
                colors: b.colors_compressed.clone(),
                indices: b.indices.as_ref().map(index_data),
                edge_indices: b.edge_indices.as_ref().map(index_data),
            })
            .collect(),
    }
}

/// Rebuilds compressed geometry and checks every bucket invariant.
pub fn geometry_from_dtxb(g: DtxbGeometry) -> Result<GeometryCompressedParams> {
    let primitive = PrimitiveKind::from_code(g.primitive)
        .ok_or_else(|| DtxError::malformed(&g.id, format!("unknown primitive code {}", g.primitive)))?;

    let params = GeometryCompressedParams {
        id: g.id,
        primitive,
        origin: DVec3::from_array(g.origin),
        positions_decompress_matrix: Mat4::from_cols_array(&g.positions_decompress_matrix),
        uv_decompress_matrix: g.uv_decompress_matrix.map(|m| Mat3::from_cols_array(&m)),
        buckets: g
            .buckets
            .into_iter()
            .map(|b| GeometryBucket {
                positions_compressed: b.positions,
                uvs_compressed: b.uvs,
                colors_compressed: b.colors,
                indices: b.indices.map(index_array),
                edge_indices: b.edge_indices.map(index_array),
            })
            .collect(),
    };

    params.validate()?;
    Ok(params)
}

/// Snapshot of `model`: geometries sorted by id, meshes in creation order.
pub fn to_dtxb(model: &SceneModel) -> DtxbModel {
    let mut geometries: Vec<DtxbGeometry> = model.geometries().map(|g| geometry_to_dtxb(g)).collect();
    geometries.sort_by(|a, b| a.id.cmp(&b.id));

    let meshes = model
        .meshes()
        .map(|m| DtxbMesh {
            id: m.id.clone(),
            geometry_id: m.geometry.id.clone(),
            texture_set_id: m.texture_set.clone(),
            matrix: m.matrix.to_cols_array(),
            color: m.color,
            flags: m.flags.bits(),
            offset: m.offset.to_array(),
        })
        .collect();

    DtxbModel {
        id: model.id().to_owned(),
        geometries,
        meshes,
    }
}

/// Loads a container into a fresh, not yet finalized model. All geometry is
/// validated before the first mesh is placed.
pub fn from_dtxb(data: DtxbModel, config: DtxConfig) -> Result<SceneModel> {
    let geometries = data
        .geometries
        .into_iter()
        .map(geometry_from_dtxb)
        .collect::<Result<Vec<_>>>()?;

    let mut model = SceneModel::new(data.id, config);
    for g in geometries {
        model.create_geometry_compressed(g)?;
    }

    for m in data.meshes {
        let [r, g, b, a] = m.color;
        model.create_mesh(&MeshParams {
            id: m.id.clone(),
            geometry_id: m.geometry_id,
            texture_set_id: m.texture_set_id,
            matrix: Some(m.matrix),
            color: [r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0],
            opacity: a as f32 / 255.0,
            flags: RenderFlags::from_bits_truncate(m.flags),
        })?;

        let offset = Vec3::from_array(m.offset);
        if offset != Vec3::ZERO {
            model.set_mesh_offset(&m.id, offset)?;
        }
    }

    log::debug!(
        "loaded model `{}`: {} meshes, {} layer(s)",
        model.id(),
        model.num_meshes(),
        model.num_layers()
    );
    Ok(model)
}

pub fn save<P: AsRef<Path>>(model: &SceneModel, path: P, deflate: bool) -> Result<()> {
    dtxb::write_file(path, &to_dtxb(model), deflate)?;
    Ok(())
}

pub fn load<P: AsRef<Path>>(path: P, config: DtxConfig) -> Result<SceneModel> {
    from_dtxb(dtxb::read_file(path)?, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::compress::tests::cube_record;
    use crate::ErrorKind;
    use glam::DMat4;

    fn model() -> SceneModel {
        let mut model = SceneModel::new("house", DtxConfig::default());
        model.create_geometry(&cube_record("cube")).unwrap();

        let mut wall = MeshParams::new("wall", "cube");
        wall.matrix = Some(DMat4::from_translation(DVec3::new(3.0, 0.0, 1.0)).to_cols_array());
        wall.color = [0.2, 0.4, 0.6];
        model.create_mesh(&wall).unwrap();

        let mut glass = MeshParams::new("glass", "cube");
        glass.opacity = 0.4;
        glass.flags |= RenderFlags::EDGES;
        model.create_mesh(&glass).unwrap();
        model
    }

    #[test]
    fn model_survives_a_container_round_trip() {
        let original = model();
        let mut bytes = Vec::new();
        dtxb::write_dtxb(&mut bytes, &to_dtxb(&original), true).unwrap();

        let parsed = dtxb::parse_dtxb_bytes(&bytes).unwrap();
        let restored = from_dtxb(parsed, DtxConfig::default()).unwrap();

        assert_eq!(restored.id(), "house");
        assert_eq!(restored.geometry("cube").unwrap().as_ref(), original.geometry("cube").unwrap().as_ref());

        for (a, b) in original.meshes().zip(restored.meshes()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.matrix, b.matrix);
            assert_eq!(a.color, b.color);
            assert_eq!(a.flags, b.flags);
        }
        assert_eq!(restored.mesh_counts(), original.mesh_counts());
    }

    #[test]
    fn mesh_offset_is_saved_and_reapplied() {
        let mut original = model();
        original.set_mesh_offset("wall", Vec3::new(0.0, 1.5, -2.0)).unwrap();

        let data = to_dtxb(&original);
        assert_eq!(data.meshes[0].offset, [0.0, 1.5, -2.0]);
        assert_eq!(data.meshes[1].offset, [0.0; 3]);

        let mut bytes = Vec::new();
        dtxb::write_dtxb(&mut bytes, &data, false).unwrap();
        let restored = from_dtxb(dtxb::parse_dtxb_bytes(&bytes).unwrap(), DtxConfig::default()).unwrap();

        assert_eq!(restored.mesh("wall").unwrap().offset, Vec3::new(0.0, 1.5, -2.0));
        assert_eq!(restored.mesh("glass").unwrap().offset, Vec3::ZERO);

        let (layer, index) = restored.mesh_location("wall").unwrap();
        let layer = restored.layer(layer).unwrap();
        let row = layer.mesh(index).unwrap().first_row;
        assert_eq!(layer.tables().offsets.read::<f32>(row, 0, 1), &[0.0, 1.5, -2.0, 0.0]);
    }

    #[test]
    fn bad_index_fails_before_any_layer_exists() {
        let mut data = to_dtxb(&model());
        data.geometries[0].buckets[0].indices = Some(IndexData::U8(vec![0, 1, 200]));

        let err = from_dtxb(data, DtxConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedGeometry);
    }

    #[test]
    fn unknown_primitive_code_is_malformed() {
        let mut data = to_dtxb(&model());
        data.geometries[0].primitive = 9;
        let err = from_dtxb(data, DtxConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedGeometry);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load("/nonexistent/model.dtxb", DtxConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
