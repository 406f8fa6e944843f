//! Per-mesh render flags, their packed GPU form, and per-layer aggregate counts.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// State of one placed mesh.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct RenderFlags: u32 {
        const VISIBLE = 1 << 0;
        const CULLED = 1 << 1;
        const XRAYED = 1 << 2;
        const HIGHLIGHTED = 1 << 3;
        const SELECTED = 1 << 4;
        const EDGES = 1 << 5;
        const CLIPPABLE = 1 << 6;
        const PICKABLE = 1 << 7;
        const COLLIDABLE = 1 << 8;
        const TRANSPARENT = 1 << 9;
        /// Flags of a freshly created, ordinary mesh.
        const DEFAULT = Self::VISIBLE.bits()
            | Self::CLIPPABLE.bits()
            | Self::PICKABLE.bits()
            | Self::COLLIDABLE.bits();
    }
}

impl RenderFlags {
    /// Visible and not culled: eligible for any pass at all.
    #[inline]
    pub fn renderable(self) -> bool {
        self.contains(RenderFlags::VISIBLE) && !self.contains(RenderFlags::CULLED)
    }
}

/// Render-pass discriminants written into a row's flag texel and compared
/// against the per-pass uniform in the vertex stage.
pub mod pass_value {
    pub const NOT_RENDERED: u8 = 0;
    pub const COLOR_OPAQUE: u8 = 1;
    pub const COLOR_TRANSPARENT: u8 = 2;
    pub const SILHOUETTE_HIGHLIGHTED: u8 = 3;
    pub const SILHOUETTE_SELECTED: u8 = 4;
    pub const SILHOUETTE_XRAYED: u8 = 5;
    pub const EDGES_COLOR_OPAQUE: u8 = 6;
    pub const EDGES_COLOR_TRANSPARENT: u8 = 7;
    pub const EDGES_HIGHLIGHTED: u8 = 8;
    pub const EDGES_SELECTED: u8 = 9;
    pub const EDGES_XRAYED: u8 = 10;
    pub const PICK: u8 = 11;
}

/// Which byte of the `flags` texel a pass compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagChannel {
    Color = 0,
    Silhouette = 1,
    Edges = 2,
    Pick = 3,
}

/// Packs `flags` into the four render-pass bytes of the `flags` column.
pub fn pack_flags(flags: RenderFlags) -> [u8; 4] {
    use pass_value::*;

    let renderable = flags.renderable();
    let transparent = flags.contains(RenderFlags::TRANSPARENT);
    let xrayed = flags.contains(RenderFlags::XRAYED);
    let highlighted = flags.contains(RenderFlags::HIGHLIGHTED);
    let selected = flags.contains(RenderFlags::SELECTED);

    let color = if !renderable || xrayed {
        NOT_RENDERED
    } else if transparent {
        COLOR_TRANSPARENT
    } else {
        COLOR_OPAQUE
    };

    let silhouette = if !renderable {
        NOT_RENDERED
    } else if selected {
        SILHOUETTE_SELECTED
    } else if highlighted {
        SILHOUETTE_HIGHLIGHTED
    } else if xrayed {
        SILHOUETTE_XRAYED
    } else {
        NOT_RENDERED
    };

    let edges = if !renderable || !flags.contains(RenderFlags::EDGES) {
        NOT_RENDERED
    } else if highlighted {
        EDGES_HIGHLIGHTED
    } else if selected {
        EDGES_SELECTED
    } else if xrayed {
        EDGES_XRAYED
    } else if transparent {
        EDGES_COLOR_TRANSPARENT
    } else {
        EDGES_COLOR_OPAQUE
    };

    let pick = if renderable && flags.contains(RenderFlags::PICKABLE) {
        PICK
    } else {
        NOT_RENDERED
    };

    [color, silhouette, edges, pick]
}

/// Packs the secondary `flags2` column: clippable, collidable.
pub fn pack_flags2(flags: RenderFlags) -> [u8; 4] {
    let bit = |f: RenderFlags| if flags.contains(f) { 255 } else { 0 };
    [bit(RenderFlags::CLIPPABLE), bit(RenderFlags::COLLIDABLE), 0, 0]
}

/// Aggregate counters of one layer, kept in step with every flag change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MeshCounts {
    pub num_meshes: u32,
    pub num_visible: u32,
    pub num_culled: u32,
    pub num_transparent: u32,
    pub num_xrayed: u32,
    pub num_highlighted: u32,
    pub num_selected: u32,
    pub num_edges: u32,
    pub num_clippable: u32,
    pub num_pickable: u32,
    pub num_collidable: u32,
}

impl MeshCounts {
    /// Full rescan.
    pub fn from_flags<I: IntoIterator<Item = RenderFlags>>(flags: I) -> Self {
        let mut counts = Self::default();
        for f in flags {
            counts.add(f);
        }
        counts
    }

    pub fn add(&mut self, flags: RenderFlags) {
        self.num_meshes += 1;
        self.apply(RenderFlags::empty(), flags);
    }

    pub fn remove(&mut self, flags: RenderFlags) {
        self.apply(flags, RenderFlags::empty());
        self.num_meshes -= 1;
    }

    /// Adjusts counters for one mesh going from `old` to `new`.
    pub fn apply(&mut self, old: RenderFlags, new: RenderFlags) {
        let changed = old ^ new;
        if changed.is_empty() {
            return;
        }

        let bump = |flag: RenderFlags, counter: &mut u32| {
            if changed.contains(flag) {
                if new.contains(flag) {
                    *counter += 1;
                } else {
                    *counter -= 1;
                }
            }
        };

        bump(RenderFlags::VISIBLE, &mut self.num_visible);
        bump(RenderFlags::CULLED, &mut self.num_culled);
        bump(RenderFlags::TRANSPARENT, &mut self.num_transparent);
        bump(RenderFlags::XRAYED, &mut self.num_xrayed);
        bump(RenderFlags::HIGHLIGHTED, &mut self.num_highlighted);
        bump(RenderFlags::SELECTED, &mut self.num_selected);
        bump(RenderFlags::EDGES, &mut self.num_edges);
        bump(RenderFlags::CLIPPABLE, &mut self.num_clippable);
        bump(RenderFlags::PICKABLE, &mut self.num_pickable);
        bump(RenderFlags::COLLIDABLE, &mut self.num_collidable);
    }

    /// Field-wise sum, used for model-level totals.
    pub fn merge(&mut self, other: &MeshCounts) {
        self.num_meshes += other.num_meshes;
        self.num_visible += other.num_visible;
        self.num_culled += other.num_culled;
        self.num_transparent += other.num_transparent;
        self.num_xrayed += other.num_xrayed;
        self.num_highlighted += other.num_highlighted;
        self.num_selected += other.num_selected;
        self.num_edges += other.num_edges;
        self.num_clippable += other.num_clippable;
        self.num_pickable += other.num_pickable;
        self.num_collidable += other.num_collidable;
    }
}
