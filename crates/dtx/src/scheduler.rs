//! Render-pass scheduling: per-layer guards over `MeshCounts`, lazily
//! compiled program variants, and the draw calls issued against a layer's
//! tables.
//!
//! Every pass compares one byte of each row's `flags` texel with a per-pass
//! value in the vertex stage; rows that do not match collapse to a
//! degenerate position. A pass whose guard says no row can match is skipped
//! before any program is touched.

use crate::error::{DtxError, Result};
use crate::flags::{pass_value, FlagChannel, MeshCounts};
use crate::geometry::{IndexWidth, PrimitiveFamily};
use crate::layer::{Layer, LayerId, LayerState};
use crate::sink::{TableKind, TextureHandle};
use glam::DVec3;
use hashbrown::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderPass {
    ColorOpaque,
    ColorTransparent,
    Depth,
    Normals,
    SilhouetteXrayed,
    SilhouetteHighlighted,
    SilhouetteSelected,
    EdgesColorOpaque,
    EdgesColorTransparent,
    EdgesHighlighted,
    EdgesSelected,
    EdgesXrayed,
    Occlusion,
    Shadow,
    PickMesh,
    PickDepth,
    PickNormals,
    SnapInit,
    Snap,
}

/// Colour frame order: opaque before transparent, each silhouette or edge
/// pass after the colour pass it overlays.
pub const COLOR_FRAME: [RenderPass; 10] = [
    RenderPass::ColorOpaque,
    RenderPass::EdgesColorOpaque,
    RenderPass::ColorTransparent,
    RenderPass::EdgesColorTransparent,
    RenderPass::SilhouetteXrayed,
    RenderPass::EdgesXrayed,
    RenderPass::SilhouetteHighlighted,
    RenderPass::EdgesHighlighted,
    RenderPass::SilhouetteSelected,
    RenderPass::EdgesSelected,
];

pub const PICK_FRAME: [RenderPass; 3] = [RenderPass::PickMesh, RenderPass::PickDepth, RenderPass::PickNormals];

pub const SNAP_FRAME: [RenderPass; 2] = [RenderPass::SnapInit, RenderPass::Snap];

/// Program family a pass runs; passes that differ only in their flag value
/// share a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Color,
    Depth,
    Normals,
    Silhouette,
    Edges,
    Occlusion,
    Shadow,
    PickMesh,
    PickDepth,
    PickNormals,
    SnapInit,
    Snap,
}

impl RenderPass {
    pub const ALL: [RenderPass; 19] = [
        RenderPass::ColorOpaque,
        RenderPass::ColorTransparent,
        RenderPass::Depth,
        RenderPass::Normals,
        RenderPass::SilhouetteXrayed,
        RenderPass::SilhouetteHighlighted,
        RenderPass::SilhouetteSelected,
        RenderPass::EdgesColorOpaque,
        RenderPass::EdgesColorTransparent,
        RenderPass::EdgesHighlighted,
        RenderPass::EdgesSelected,
        RenderPass::EdgesXrayed,
        RenderPass::Occlusion,
        RenderPass::Shadow,
        RenderPass::PickMesh,
        RenderPass::PickDepth,
        RenderPass::PickNormals,
        RenderPass::SnapInit,
        RenderPass::Snap,
    ];

    pub fn program_kind(self) -> ProgramKind {
        use RenderPass::*;
        match self {
            ColorOpaque | ColorTransparent => ProgramKind::Color,
            Depth => ProgramKind::Depth,
            Normals => ProgramKind::Normals,
            SilhouetteXrayed | SilhouetteHighlighted | SilhouetteSelected => ProgramKind::Silhouette,
            EdgesColorOpaque | EdgesColorTransparent | EdgesHighlighted | EdgesSelected | EdgesXrayed => {
                ProgramKind::Edges
            }
            Occlusion => ProgramKind::Occlusion,
            Shadow => ProgramKind::Shadow,
            PickMesh => ProgramKind::PickMesh,
            PickDepth => ProgramKind::PickDepth,
            PickNormals => ProgramKind::PickNormals,
            SnapInit => ProgramKind::SnapInit,
            Snap => ProgramKind::Snap,
        }
    }

    /// Flag byte and the value a row must hold there to be drawn.
    pub fn flag_test(self) -> (FlagChannel, u8) {
        use pass_value::*;
        use RenderPass::*;
        match self {
            ColorOpaque | Depth | Normals | Occlusion | Shadow => (FlagChannel::Color, COLOR_OPAQUE),
            ColorTransparent => (FlagChannel::Color, COLOR_TRANSPARENT),
            SilhouetteXrayed => (FlagChannel::Silhouette, SILHOUETTE_XRAYED),
            SilhouetteHighlighted => (FlagChannel::Silhouette, SILHOUETTE_HIGHLIGHTED),
            SilhouetteSelected => (FlagChannel::Silhouette, SILHOUETTE_SELECTED),
            EdgesColorOpaque => (FlagChannel::Edges, EDGES_COLOR_OPAQUE),
            EdgesColorTransparent => (FlagChannel::Edges, EDGES_COLOR_TRANSPARENT),
            EdgesHighlighted => (FlagChannel::Edges, EDGES_HIGHLIGHTED),
            EdgesSelected => (FlagChannel::Edges, EDGES_SELECTED),
            EdgesXrayed => (FlagChannel::Edges, EDGES_XRAYED),
            PickMesh | PickDepth | PickNormals | SnapInit | Snap => (FlagChannel::Pick, PICK),
        }
    }

    /// Draws the edge stream instead of the primitive stream.
    pub fn draws_edges(self) -> bool {
        self.program_kind() == ProgramKind::Edges
    }

    /// False when `counts` guarantee that no row passes the flag test.
    pub fn should_draw(self, c: &MeshCounts, has_edges: bool) -> bool {
        use RenderPass::*;

        let n = c.num_meshes;
        if n == 0 || c.num_culled == n || c.num_visible == 0 {
            return false;
        }

        let all_transparent = c.num_transparent == n;
        let all_xrayed = c.num_xrayed == n;
        let no_edges = c.num_edges == 0 || !has_edges;

        match self {
            ColorOpaque | Depth | Normals | Occlusion | Shadow => !(all_transparent || all_xrayed),
            ColorTransparent => c.num_transparent > 0 && !all_xrayed,
            SilhouetteXrayed => c.num_xrayed > 0,
            SilhouetteHighlighted => c.num_highlighted > 0,
            SilhouetteSelected => c.num_selected > 0,
            EdgesColorOpaque => !no_edges,
            EdgesColorTransparent => !no_edges && c.num_transparent > 0,
            EdgesHighlighted => !no_edges && c.num_highlighted > 0,
            EdgesSelected => !no_edges && c.num_selected > 0,
            EdgesXrayed => !no_edges && c.num_xrayed > 0,
            PickMesh | PickDepth | PickNormals | SnapInit | Snap => c.num_pickable > 0,
        }
    }
}

/// View state that changes generated program text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ViewConfig {
    pub num_section_planes: u32,
    pub log_depth: bool,
    pub clipping: bool,
}

/// Identity of one program variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramDesc {
    pub family: PrimitiveFamily,
    pub kind: ProgramKind,
    pub view: ViewConfig,
    pub hash: u64,
}

impl ProgramDesc {
    pub fn new(family: PrimitiveFamily, kind: ProgramKind, view: ViewConfig) -> Self {
        let mut hasher = DefaultHasher::new();
        family.hash(&mut hasher);
        kind.hash(&mut hasher);
        view.hash(&mut hasher);

        Self {
            family,
            kind,
            view,
            hash: hasher.finish(),
        }
    }
}

/// One draw over the stream of one index width.
#[derive(Debug, Clone)]
pub struct DrawCall<'a> {
    pub layer: LayerId,
    pub pass: RenderPass,
    pub channel: FlagChannel,
    pub pass_value: u8,
    pub family: PrimitiveFamily,
    pub width: IndexWidth,
    /// Draws the edge stream.
    pub edges: bool,
    /// Stream primitives; a multiple of `PRIMITIVE_ALIGNMENT`.
    pub primitives: u32,
    pub vertices_per_primitive: u32,
    /// Layer RTC origin, subtracted from the eye position on the CPU side.
    pub origin: DVec3,
    pub textures: &'a [(TableKind, TextureHandle)],
}

/// The embedding renderer: compiles program variants and executes draws.
pub trait DrawBackend {
    type Program;

    fn compile_program(&mut self, desc: &ProgramDesc) -> Result<Self::Program>;
    fn draw(&mut self, program: &Self::Program, call: &DrawCall<'_>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub draws: u64,
    pub skipped: u64,
    pub compiled: u64,
}

/// Backend plus its program cache.
pub struct PassRenderer<B: DrawBackend> {
    backend: B,
    view: ViewConfig,
    programs: HashMap<u64, B::Program>,
    stats: PassStats,
}

impl<B: DrawBackend> PassRenderer<B> {
    pub fn new(backend: B) -> Self {
        Self::with_view(backend, ViewConfig::default())
    }

    pub fn with_view(backend: B, view: ViewConfig) -> Self {
        Self {
            backend,
            view,
            programs: HashMap::new(),
            stats: PassStats::default(),
        }
    }

    /// Later draws use variants for `view`; earlier variants stay cached.
    pub fn set_view(&mut self, view: ViewConfig) {
        self.view = view;
    }

    pub fn view(&self) -> ViewConfig {
        self.view
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn num_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn stats(&self) -> PassStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = PassStats::default();
    }

    fn skip(&mut self) {
        self.stats.skipped += 1;
    }

    fn run(&mut self, family: PrimitiveFamily, kind: ProgramKind, calls: &[DrawCall<'_>]) -> Result<()> {
        let desc = ProgramDesc::new(family, kind, self.view);

        if !self.programs.contains_key(&desc.hash) {
            let program = self.backend.compile_program(&desc)?;
            log::debug!("compiled {kind:?} program for {family:?} ({:?})", self.view);
            self.programs.insert(desc.hash, program);
            self.stats.compiled += 1;
        }

        let program = self
            .programs
            .get(&desc.hash)
            .ok_or_else(|| DtxError::backend("program cache miss"))?;

        for call in calls {
            self.backend.draw(program, call)?;
            self.stats.draws += 1;
        }
        Ok(())
    }
}

impl Layer {
    /// Draws `pass` if its guard allows; returns whether anything was drawn.
    pub fn draw_pass<B: DrawBackend>(&self, pass: RenderPass, r: &mut PassRenderer<B>) -> Result<bool> {
        if self.state() != LayerState::Built {
            return Err(DtxError::state(format!(
                "{}: cannot draw a {:?} layer",
                self.id(),
                self.state()
            )));
        }

        if !pass.should_draw(self.counts(), self.has_edges()) {
            r.skip();
            return Ok(false);
        }

        let family = self.key().family;
        let edges = pass.draws_edges();
        let (channel, value) = pass.flag_test();

        let calls: Vec<DrawCall<'_>> = IndexWidth::ALL
            .into_iter()
            .filter_map(|width| {
                let primitives = if edges {
                    self.edge_stream_len(width)
                } else {
                    self.stream_len(width)
                };
                (primitives > 0).then(|| DrawCall {
                    layer: self.id(),
                    pass,
                    channel,
                    pass_value: value,
                    family,
                    width,
                    edges,
                    primitives,
                    vertices_per_primitive: if edges { 2 } else { family.arity() as u32 },
                    origin: self.origin(),
                    textures: self.textures(),
                })
            })
            .collect();

        if calls.is_empty() {
            r.skip();
            return Ok(false);
        }

        r.run(family, pass.program_kind(), &calls)?;
        Ok(true)
    }

    pub fn draw_color_opaque<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::ColorOpaque, r)
    }

    pub fn draw_color_transparent<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::ColorTransparent, r)
    }

    pub fn draw_depth<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::Depth, r)
    }

    pub fn draw_normals<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::Normals, r)
    }

    pub fn draw_silhouette_xrayed<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::SilhouetteXrayed, r)
    }

    pub fn draw_silhouette_highlighted<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::SilhouetteHighlighted, r)
    }

    pub fn draw_silhouette_selected<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::SilhouetteSelected, r)
    }

    pub fn draw_edges_color_opaque<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::EdgesColorOpaque, r)
    }

    pub fn draw_edges_color_transparent<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::EdgesColorTransparent, r)
    }

    pub fn draw_edges_highlighted<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::EdgesHighlighted, r)
    }

    pub fn draw_edges_selected<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::EdgesSelected, r)
    }

    pub fn draw_edges_xrayed<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::EdgesXrayed, r)
    }

    pub fn draw_occlusion<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::Occlusion, r)
    }

    pub fn draw_shadow<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::Shadow, r)
    }

    pub fn draw_pick_mesh<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::PickMesh, r)
    }

    pub fn draw_pick_depths<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::PickDepth, r)
    }

    pub fn draw_pick_normals<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::PickNormals, r)
    }

    pub fn draw_snap_init<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::SnapInit, r)
    }

    pub fn draw_snap<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<bool> {
        self.draw_pass(RenderPass::Snap, r)
    }
}

/// A draw as seen by `RecordingBackend`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDraw {
    pub layer: LayerId,
    pub pass: RenderPass,
    pub program: u64,
    pub width: IndexWidth,
    pub edges: bool,
    pub primitives: u32,
    pub vertices_per_primitive: u32,
}

/// Backend that compiles nothing and remembers every call. Used for headless
/// runs and tests.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub compiled: Vec<ProgramDesc>,
    pub draws: Vec<RecordedDraw>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draws_of(&self, pass: RenderPass) -> usize {
        self.draws.iter().filter(|d| d.pass == pass).count()
    }
}

impl DrawBackend for RecordingBackend {
    type Program = u64;

    fn compile_program(&mut self, desc: &ProgramDesc) -> Result<u64> {
        self.compiled.push(*desc);
        Ok(desc.hash)
    }

    fn draw(&mut self, program: &u64, call: &DrawCall<'_>) -> Result<()> {
        self.draws.push(RecordedDraw {
            layer: call.layer,
            pass: call.pass,
            program: *program,
            width: call.width,
            edges: call.edges,
            primitives: call.primitives,
            vertices_per_primitive: call.vertices_per_primitive,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::LayerKey;
    use crate::config::DtxConfig;
    use crate::flags::RenderFlags;
    use crate::geometry::{compress_geometry, GeometryRecord, PrimitiveKind};
    use crate::layer::tests::{cube, placement};
    use crate::sink::MemorySink;
    use crate::ErrorKind;
    use glam::DMat4;
    use std::sync::Arc;

    fn built_layer(meshes: usize, flags: RenderFlags) -> Layer {
        let cube = cube();
        let config = DtxConfig::default();
        let key = LayerKey::for_mesh(&cube, None, &DMat4::IDENTITY, config.rtc_cell_size);
        let mut layer = Layer::new(LayerId(7), key, &config);
        for i in 0..meshes {
            let mut p = placement(&format!("m{i}"), &cube);
            p.flags = flags;
            layer.create_mesh(p).unwrap();
        }
        layer.build(&mut MemorySink::new()).unwrap();
        layer
    }

    #[test]
    fn invisible_layer_skips_every_pass() {
        let layer = built_layer(3, RenderFlags::DEFAULT - RenderFlags::VISIBLE);
        let mut r = PassRenderer::new(RecordingBackend::new());

        for pass in RenderPass::ALL {
            assert!(!layer.draw_pass(pass, &mut r).unwrap(), "{pass:?} drew");
        }
        assert_eq!(r.num_programs(), 0);
        assert!(r.backend().draws.is_empty());
        assert_eq!(r.stats().skipped, 19);
    }

    #[test]
    fn highlight_enables_only_its_silhouette() {
        let mut layer = built_layer(1, RenderFlags::DEFAULT);
        let mut r = PassRenderer::new(RecordingBackend::new());

        assert!(!layer.draw_silhouette_highlighted(&mut r).unwrap());
        layer.set_mesh_highlighted(0, true, false).unwrap();

        assert!(layer.draw_silhouette_highlighted(&mut r).unwrap());
        assert!(!layer.draw_silhouette_selected(&mut r).unwrap());
        assert!(layer.draw_color_opaque(&mut r).unwrap());
        assert!(!layer.draw_color_transparent(&mut r).unwrap());
        // Edge flag is off.
        assert!(!layer.draw_edges_highlighted(&mut r).unwrap());

        let draws = &r.backend().draws;
        assert_eq!(draws.len(), 2);
        assert_eq!(draws[0].pass, RenderPass::SilhouetteHighlighted);
        assert_eq!(draws[0].width, IndexWidth::U8);
        assert_eq!(draws[0].primitives, 16);
    }

    #[test]
    fn guards_follow_counts() {
        let mut c = MeshCounts {
            num_meshes: 4,
            num_visible: 4,
            num_pickable: 4,
            ..Default::default()
        };
        assert!(RenderPass::ColorOpaque.should_draw(&c, true));
        assert!(!RenderPass::ColorTransparent.should_draw(&c, true));
        assert!(!RenderPass::EdgesColorOpaque.should_draw(&c, true));

        c.num_transparent = 4;
        assert!(!RenderPass::ColorOpaque.should_draw(&c, true));
        assert!(!RenderPass::Depth.should_draw(&c, true));
        assert!(RenderPass::ColorTransparent.should_draw(&c, true));

        c.num_edges = 1;
        assert!(RenderPass::EdgesColorTransparent.should_draw(&c, true));
        assert!(!RenderPass::EdgesColorTransparent.should_draw(&c, false));

        c.num_xrayed = 4;
        assert!(!RenderPass::ColorTransparent.should_draw(&c, true));
        assert!(RenderPass::SilhouetteXrayed.should_draw(&c, true));

        c.num_culled = 4;
        assert!(!RenderPass::Occlusion.should_draw(&c, true));
        assert!(!RenderPass::PickMesh.should_draw(&c, true));
    }

    fn built_single(record: GeometryRecord) -> Layer {
        let config = DtxConfig::default();
        let geometry = Arc::new(compress_geometry(&record, &config).unwrap());
        let key = LayerKey::for_mesh(&geometry, None, &DMat4::IDENTITY, config.rtc_cell_size);
        let mut layer = Layer::new(LayerId(3), key, &config);
        layer.create_mesh(placement("m", &geometry)).unwrap();
        layer.build(&mut MemorySink::new()).unwrap();
        layer
    }

    fn polyline(primitive: PrimitiveKind, indices: Option<Vec<u32>>) -> GeometryRecord {
        GeometryRecord {
            id: "poly".into(),
            primitive,
            positions: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0],
            uvs: None,
            colors: None,
            indices,
            edge_indices: None,
        }
    }

    #[test]
    fn lines_draw_pairs_and_skip_edge_passes() {
        let layer = built_single(polyline(PrimitiveKind::Lines, Some(vec![0, 1, 1, 2, 2, 3])));
        assert_eq!(layer.key().family, PrimitiveFamily::Lines);
        assert!(!layer.has_edges());

        let mut r = PassRenderer::new(RecordingBackend::new());
        assert!(layer.draw_color_opaque(&mut r).unwrap());
        // The mesh has its edge flag set but the layer holds no edge stream.
        assert!(!layer.draw_edges_color_opaque(&mut r).unwrap());

        let draws = &r.backend().draws;
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].vertices_per_primitive, 2);
        assert_eq!(draws[0].width, IndexWidth::U8);
        assert_eq!(draws[0].primitives, 8);
        assert!(!draws[0].edges);
        assert_eq!(r.backend().compiled[0].family, PrimitiveFamily::Lines);
    }

    #[test]
    fn points_draw_single_vertices() {
        let layer = built_single(polyline(PrimitiveKind::Points, None));
        assert_eq!(layer.key().family, PrimitiveFamily::Points);

        let mut r = PassRenderer::new(RecordingBackend::new());
        assert!(layer.draw_color_opaque(&mut r).unwrap());
        assert!(!layer.draw_edges_color_opaque(&mut r).unwrap());
        assert_eq!(r.backend().draws[0].vertices_per_primitive, 1);
    }

    #[test]
    fn occlusion_and_shadow_skip_fully_transparent_layers() {
        let mut layer = built_layer(2, RenderFlags::DEFAULT);
        let mut r = PassRenderer::new(RecordingBackend::new());
        assert!(layer.draw_occlusion(&mut r).unwrap());
        assert!(layer.draw_shadow(&mut r).unwrap());

        for i in 0..2 {
            layer.set_mesh_transparent(i, true).unwrap();
        }
        assert!(!layer.draw_occlusion(&mut r).unwrap());
        assert!(!layer.draw_shadow(&mut r).unwrap());

        let c = MeshCounts {
            num_meshes: 2,
            num_visible: 2,
            num_xrayed: 2,
            ..Default::default()
        };
        assert!(!RenderPass::Occlusion.should_draw(&c, true));
        assert!(!RenderPass::Shadow.should_draw(&c, true));
    }

    #[test]
    fn programs_are_cached_per_view() {
        let layer = built_layer(2, RenderFlags::DEFAULT | RenderFlags::EDGES);
        let mut r = PassRenderer::new(RecordingBackend::new());

        layer.draw_color_opaque(&mut r).unwrap();
        layer.draw_color_opaque(&mut r).unwrap();
        layer.draw_edges_color_opaque(&mut r).unwrap();
        assert_eq!(r.num_programs(), 2);

        r.set_view(ViewConfig {
            num_section_planes: 2,
            ..ViewConfig::default()
        });
        layer.draw_color_opaque(&mut r).unwrap();
        assert_eq!(r.num_programs(), 3);
        assert_eq!(r.stats().compiled, 3);
        assert_eq!(r.stats().draws, 4);

        let edge_draw = r
            .backend()
            .draws
            .iter()
            .find(|d| d.pass == RenderPass::EdgesColorOpaque)
            .unwrap();
        assert_eq!(edge_draw.primitives, 32);
    }

    #[test]
    fn unbuilt_layer_cannot_draw() {
        let cube = cube();
        let config = DtxConfig::default();
        let key = LayerKey::for_mesh(&cube, None, &DMat4::IDENTITY, config.rtc_cell_size);
        let layer = Layer::new(LayerId(1), key, &config);

        let mut r = PassRenderer::new(RecordingBackend::new());
        let err = layer.draw_color_opaque(&mut r).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StatePrecondition);
    }

    #[test]
    fn frame_order_puts_overlays_after_their_color_pass() {
        let at = |p: RenderPass| COLOR_FRAME.iter().position(|&q| q == p).unwrap();
        assert!(at(RenderPass::ColorOpaque) < at(RenderPass::ColorTransparent));
        assert!(at(RenderPass::ColorOpaque) < at(RenderPass::EdgesColorOpaque));
        assert!(at(RenderPass::EdgesColorOpaque) < at(RenderPass::ColorTransparent));
        assert!(at(RenderPass::ColorTransparent) < at(RenderPass::EdgesColorTransparent));
        assert!(at(RenderPass::ColorTransparent) < at(RenderPass::SilhouetteHighlighted));
    }
}
