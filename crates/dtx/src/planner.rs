//! Offline layer planning: groups meshes into prospective layers with the
//! allocator's key and capacity rules, without touching any table, so a
//! streaming loader can size its chunks up front.

use crate::capacity::{LayerKey, LayerLimits, LayerUsage};
use crate::config::DtxConfig;
use crate::error::{DtxError, Result};
use crate::geometry::GeometryCompressedParams;
use crate::model::MeshParams;
use glam::DMat4;
use hashbrown::{HashMap, HashSet};
use serde::Serialize;

/// One prospective layer.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedLayer {
    pub key: LayerKey,
    pub num_meshes: u64,
    pub num_rows: u64,
    pub num_vertices: u64,
    pub num_indices: u64,
    pub usage: LayerUsage,
    pub mesh_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamManifest {
    pub model_id: String,
    pub layers: Vec<PlannedLayer>,
}

impl StreamManifest {
    pub fn num_meshes(&self) -> u64 {
        self.layers.iter().map(|l| l.num_meshes).sum()
    }

    pub fn num_vertices(&self) -> u64 {
        self.layers.iter().map(|l| l.num_vertices).sum()
    }

    pub fn num_indices(&self) -> u64 {
        self.layers.iter().map(|l| l.num_indices).sum()
    }
}

#[derive(Debug)]
struct Pending {
    key: LayerKey,
    usage: LayerUsage,
    placed: HashSet<String>,
    mesh_ids: Vec<String>,
}

impl Pending {
    fn finish(self) -> PlannedLayer {
        PlannedLayer {
            key: self.key,
            num_meshes: self.usage.meshes,
            num_rows: self.usage.rows,
            num_vertices: self.usage.vertices,
            num_indices: self.usage.indices,
            usage: self.usage,
            mesh_ids: self.mesh_ids,
        }
    }
}

#[derive(Debug)]
pub struct StreamCapacityPlanner {
    cell_size: f64,
    limits: LayerLimits,
    layers: Vec<Pending>,
    open: HashMap<LayerKey, usize>,
}

impl StreamCapacityPlanner {
    pub fn new(config: &DtxConfig) -> Self {
        Self {
            cell_size: config.rtc_cell_size,
            limits: LayerLimits::from(&config.capacity),
            layers: Vec::new(),
            open: HashMap::new(),
        }
    }

    /// Assigns a mesh to a prospective layer and returns that layer's
    /// position in the manifest. Meshes too big for an empty layer are
    /// rejected, never split.
    pub fn add_mesh(
        &mut self,
        mesh_id: &str,
        geometry: &GeometryCompressedParams,
        texture_set: Option<&str>,
        matrix: &DMat4,
    ) -> Result<usize> {
        LayerUsage::of_mesh(geometry, false).check(&self.limits)?;

        let key = LayerKey::for_mesh(geometry, texture_set, matrix, self.cell_size);

        let fits = |p: &Pending| {
            let placed = p.placed.contains(&geometry.id);
            p.usage.plus(&LayerUsage::of_mesh(geometry, placed)).fits(&self.limits)
        };

        let slot = match self.open.get(&key).copied() {
            Some(slot) if fits(&self.layers[slot]) => slot,
            _ => {
                self.layers.push(Pending {
                    key: key.clone(),
                    usage: LayerUsage::default(),
                    placed: HashSet::new(),
                    mesh_ids: Vec::new(),
                });
                let slot = self.layers.len() - 1;
                self.open.insert(key, slot);
                slot
            }
        };

        let layer = &mut self.layers[slot];
        let placed = !layer.placed.insert(geometry.id.clone());
        layer.usage.add(&LayerUsage::of_mesh(geometry, placed));
        layer.mesh_ids.push(mesh_id.to_owned());
        Ok(slot)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn finish(self, model_id: &str) -> StreamManifest {
        StreamManifest {
            model_id: model_id.to_owned(),
            layers: self.layers.into_iter().map(Pending::finish).collect(),
        }
    }

    /// Plans `meshes` in order, resolving geometry ids through `lookup`.
    pub fn plan<'g, F>(config: &DtxConfig, model_id: &str, meshes: &[MeshParams], lookup: F) -> Result<StreamManifest>
    where
        F: Fn(&str) -> Option<&'g GeometryCompressedParams>,
    {
        let mut planner = Self::new(config);
        for mesh in meshes {
            let geometry =
                lookup(&mesh.geometry_id).ok_or_else(|| DtxError::UnknownGeometry(mesh.geometry_id.clone()))?;
            planner.add_mesh(&mesh.id, geometry, mesh.texture_set_id.as_deref(), &mesh.matrix())?;
        }

        let manifest = planner.finish(model_id);
        log::debug!(
            "planned {} meshes into {} layer(s)",
            manifest.num_meshes(),
            manifest.layers.len()
        );
        Ok(manifest)
    }
}
