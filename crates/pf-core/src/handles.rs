use std::fmt;

use serde::{Deserialize, Serialize};

/// Dense node handle. Index 0 is a reserved sentinel and is never issued by
/// the allocator — see `pf_engine::NodeIndexAllocator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIndex(i32);

impl NodeIndex {
    /// The reserved "no node" sentinel.
    pub const NONE: NodeIndex = NodeIndex(0);

    /// Wrap a raw index. Callers outside the allocator should only ever see
    /// indices already known to be valid (>= 1), but we don't panic here —
    /// `is_none` lets callers treat 0 as "absent" uniformly.
    pub const fn new(raw: i32) -> Self {
        NodeIndex(raw)
    }

    pub const fn get(self) -> i32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connected-component identifier assigned by flood fill. `0` means
/// unwalkable / not yet assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct AreaId(pub u32);

impl AreaId {
    pub const NONE: AreaId = AreaId(0);
}

/// 16-bit rolling path identifier. `0` is the reserved "invalid/sentinel" id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PathId(pub u16);

impl PathId {
    pub const NONE: PathId = PathId(0);
}

/// A position in the graph's coordinate space. Kept deliberately minimal —
/// the nearest-neighbour spatial index itself is out of scope (spec.md §1).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    pub const ZERO: Point3 = Point3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Point3 { x, y, z }
    }

    pub fn distance(self, other: Point3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}
