#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared types for the pathfinding engine: node/path/area handles, the
//! `Graph` and `PathSearch` external-collaborator traits, and the error
//! taxonomy the engine surfaces to callers.
//!
//! Nothing in this crate runs a search or owns a thread; that's `pf-engine`.

mod error;
mod graph;
mod handles;
mod path;
mod search;

pub use error::EngineError;
pub use graph::{Graph, GraphUpdate, NearestInfo, Node, ThreadingClass, UpdateTarget};
pub use handles::{AreaId, NodeIndex, PathId, Point3};
pub use path::{Path, PathOutcome, PathState};
pub use search::{NodeSearchState, PathHandler, PathSearch};
