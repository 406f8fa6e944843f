use dtx::scheduler::RenderPass;
use dtx::tables::column;
use dtx::{
    DtxConfig, ErrorKind, GeometryBucket, GeometryCompressedParams, GeometryRecord, IndexArray, IndexWidth,
    LayerCapacity, MemorySink, MeshCounts, MeshParams, PassRenderer, PrimitiveKind, RecordingBackend, RenderFlags,
    SceneModel, StreamCapacityPlanner,
};
use glam::{DMat4, DVec3, Mat4};

fn cube(id: &str) -> GeometryRecord {
    GeometryRecord {
        id: id.into(),
        primitive: PrimitiveKind::Solid,
        positions: vec![
            0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0,
        ],
        uvs: None,
        colors: None,
        indices: Some(vec![
            0, 2, 1, 0, 3, 2, 4, 5, 6, 4, 6, 7, 0, 1, 5, 0, 5, 4, //
            3, 7, 6, 3, 6, 2, 0, 4, 7, 0, 7, 3, 1, 2, 6, 1, 6, 5,
        ]),
        edge_indices: None,
    }
}

/// Already-compressed single triangle with three vertices of its own.
fn triangle(id: String) -> GeometryCompressedParams {
    GeometryCompressedParams {
        id,
        primitive: PrimitiveKind::Triangles,
        origin: DVec3::ZERO,
        positions_decompress_matrix: Mat4::IDENTITY,
        uv_decompress_matrix: None,
        buckets: vec![GeometryBucket {
            positions_compressed: vec![0, 0, 0, 1, 0, 0, 0, 1, 0],
            uvs_compressed: None,
            colors_compressed: None,
            indices: Some(IndexArray::U8(vec![0, 1, 2])),
            edge_indices: None,
        }],
    }
}

fn rescan(model: &SceneModel) -> MeshCounts {
    MeshCounts::from_flags(model.meshes().map(|m| m.flags))
}

#[test]
fn highlighted_cube_draws_only_its_silhouette() {
    let mut model = SceneModel::new("cube", DtxConfig::default());
    let geometry = model.create_geometry(&cube("cube")).unwrap();
    assert_eq!(geometry.num_vertices(), 8);
    assert_eq!(geometry.num_primitives(), 12);
    assert_eq!(geometry.buckets.len(), 1);
    assert_eq!(geometry.buckets[0].index_width(), IndexWidth::U8);

    let mut params = MeshParams::new("box", "cube");
    params.color = [1.0, 0.0, 0.0];
    model.create_mesh(&params).unwrap();

    let mut sink = MemorySink::new();
    model.finalize(&mut sink).unwrap();
    model.set_mesh_highlighted("box", true).unwrap();
    model.prepare_frame(&mut sink).unwrap();
    assert_eq!(model.mesh_counts().num_highlighted, 1);

    let layer = &model.layers()[0];
    let mut r = PassRenderer::new(RecordingBackend::new());
    assert!(layer.draw_silhouette_highlighted(&mut r).unwrap());
    assert!(!layer.draw_silhouette_selected(&mut r).unwrap());

    let backend = r.backend();
    assert_eq!(backend.draws_of(RenderPass::SilhouetteHighlighted), 1);
    assert_eq!(backend.draws_of(RenderPass::SilhouetteSelected), 0);
    assert_eq!(backend.compiled.len(), 1);
}

#[test]
fn six_hundred_thousand_triangles_open_a_second_layer() {
    let config = DtxConfig {
        capacity: LayerCapacity {
            max_vertices: 1_200_000,
            ..LayerCapacity::default()
        },
        ..DtxConfig::default()
    };
    let limit = config.capacity.max_vertices as u64;
    let mut model = SceneModel::new("many", config);

    for i in 0..600_000 {
        let id = format!("t{i}");
        model.create_geometry_compressed(triangle(id.clone())).unwrap();
        model.create_mesh(&MeshParams::new(id.clone(), id)).unwrap();
    }

    assert_eq!(model.num_layers(), 2);
    let first = &model.layers()[0];
    let second = &model.layers()[1];
    assert_eq!(first.key(), second.key());

    // The first layer stopped at the last mesh that still fit.
    assert_eq!(first.num_meshes(), 400_000);
    assert_eq!(first.usage().vertices, limit);
    assert!(first.usage().vertices + 3 > limit);
    assert_eq!(second.num_meshes(), 200_000);
    assert_eq!(model.mesh_location("t400000").map(|(l, i)| (l.0, i)), Some((1, 0)));
}

#[test]
fn solid_split_over_buckets_becomes_surface() {
    let mut positions = Vec::new();
    for i in 0..4 {
        let x = i as f64 * 2.0;
        positions.extend_from_slice(&[x, 0.0, 0.0, x + 1.0, 0.0, 0.0, x, 1.0, 0.0]);
    }
    let record = GeometryRecord {
        id: "strip".into(),
        primitive: PrimitiveKind::Solid,
        positions,
        uvs: None,
        colors: None,
        indices: None,
        edge_indices: None,
    };

    let config = DtxConfig {
        max_bucket_vertices: 6,
        ..DtxConfig::default()
    };
    let mut model = SceneModel::new("split", config);
    let geometry = model.create_geometry(&record).unwrap();
    assert_eq!(geometry.buckets.len(), 2);
    assert_eq!(geometry.primitive, PrimitiveKind::Surface);

    model.create_mesh(&MeshParams::new("m", "strip")).unwrap();
    let layer = &model.layers()[0];
    let mesh = layer.mesh(0).unwrap();
    assert_eq!(mesh.num_rows, 2);
    for row in mesh.rows() {
        assert_eq!(layer.tables().attributes.read::<u8>(row, column::SOLID, 1)[0], 0);
    }
}

#[test]
fn hidden_layer_invokes_no_program() {
    let mut model = SceneModel::new("hidden", DtxConfig::default());
    model.create_geometry(&cube("cube")).unwrap();
    for i in 0..3 {
        let mut p = MeshParams::new(format!("m{i}"), "cube");
        p.flags |= RenderFlags::EDGES | RenderFlags::SELECTED;
        model.create_mesh(&p).unwrap();
    }

    let mut sink = MemorySink::new();
    model.finalize(&mut sink).unwrap();
    for i in 0..3 {
        model.set_mesh_visible(&format!("m{i}"), false).unwrap();
    }
    model.prepare_frame(&mut sink).unwrap();
    assert_eq!(model.mesh_counts().num_visible, 0);

    let mut r = PassRenderer::new(RecordingBackend::new());
    assert_eq!(model.draw_passes(&RenderPass::ALL, &mut r).unwrap(), 0);
    assert!(r.backend().compiled.is_empty());
    assert!(r.backend().draws.is_empty());
}

#[test]
fn counters_match_a_rescan_after_mutations() {
    let mut model = SceneModel::new("counts", DtxConfig::default());
    model.create_geometry(&cube("cube")).unwrap();
    for i in 0..20 {
        model.create_mesh(&MeshParams::new(format!("m{i}"), "cube")).unwrap();
    }
    let mut sink = MemorySink::new();
    model.finalize(&mut sink).unwrap();

    // Deterministic pseudo-random walk over meshes and setters.
    let mut seed = 0x2545_f491_u32;
    for step in 0..500 {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        let id = format!("m{}", seed % 20);
        let on = (seed >> 8) & 1 == 1;

        match (seed >> 9) % 9 {
            0 => model.set_mesh_visible(&id, on),
            1 => model.set_mesh_highlighted(&id, on),
            2 => model.set_mesh_xrayed(&id, on),
            3 => model.set_mesh_selected(&id, on),
            4 => model.set_mesh_culled(&id, on),
            5 => model.set_mesh_pickable(&id, on),
            6 => model.set_mesh_edges(&id, on),
            7 => model.set_mesh_opacity(&id, if on { 0.5 } else { 1.0 }),
            _ => model.set_mesh_collidable(&id, on),
        }
        .unwrap();

        if step % 50 == 0 {
            model.prepare_frame(&mut sink).unwrap();
        }
        assert_eq!(model.mesh_counts(), rescan(&model), "after step {step}");
    }
}

#[test]
fn capacity_failure_leaves_the_model_untouched() {
    let config = DtxConfig {
        capacity: LayerCapacity {
            max_vertices: 7,
            ..LayerCapacity::default()
        },
        ..DtxConfig::default()
    };
    let mut model = SceneModel::new("tiny", config);
    model.create_geometry(&cube("cube")).unwrap();

    let err = model.create_mesh(&MeshParams::new("m", "cube")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    assert_eq!(model.num_layers(), 0);
    assert_eq!(model.num_meshes(), 0);
    assert!(model.mesh("m").is_none());
}

#[test]
fn planner_agrees_with_allocator() {
    let config = DtxConfig {
        capacity: LayerCapacity {
            max_meshes: 5,
            max_vertices: 30,
            ..LayerCapacity::default()
        },
        ..DtxConfig::default()
    };
    let mut model = SceneModel::new("plan", config.clone());
    for g in ["a", "b", "c"] {
        model.create_geometry(&cube(g)).unwrap();
    }

    let meshes: Vec<MeshParams> = (0..17)
        .map(|i| {
            let mut p = MeshParams::new(format!("m{i}"), ["a", "b", "c"][i % 3]);
            if i % 4 == 0 {
                p.matrix = Some(DMat4::from_translation(DVec3::new(1000.0, 0.0, 0.0)).to_cols_array());
            }
            if i % 5 == 0 {
                p.texture_set_id = Some("wood".into());
            }
            p
        })
        .collect();

    let manifest =
        StreamCapacityPlanner::plan(&config, "plan", &meshes, |id| model.geometry(id).map(|g| g.as_ref())).unwrap();

    for p in &meshes {
        model.create_mesh(p).unwrap();
    }

    assert_eq!(manifest.layers.len(), model.num_layers());
    for (planned, layer) in manifest.layers.iter().zip(model.layers()) {
        assert_eq!(&planned.key, layer.key());
        assert_eq!(planned.usage, *layer.usage());
        let ids: Vec<&str> = layer.meshes().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(planned.mesh_ids, ids);
    }
}

#[test]
fn saved_model_loads_back() {
    let mut model = SceneModel::new("saved", DtxConfig::default());
    model.create_geometry(&cube("cube")).unwrap();
    for i in 0..4 {
        let mut p = MeshParams::new(format!("m{i}"), "cube");
        p.matrix = Some(DMat4::from_translation(DVec3::new(i as f64 * 2.0, 0.0, 0.0)).to_cols_array());
        model.create_mesh(&p).unwrap();
    }

    let path = std::env::temp_dir().join(format!("dtx-scenario-{}.dtxb", std::process::id()));
    dtx::persist::save(&model, &path, true).unwrap();
    let loaded = dtx::persist::load(&path, DtxConfig::default()).unwrap();
    let _ = std::fs::remove_file(&path);

    assert_eq!(loaded.num_meshes(), 4);
    assert_eq!(loaded.num_layers(), model.num_layers());
    assert_eq!(loaded.mesh("m3").unwrap().matrix, model.mesh("m3").unwrap().matrix);
}
