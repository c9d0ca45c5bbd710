#![deny(unreachable_pub)]

//! Concurrency and scheduling machinery around the `pf-core` traits: the
//! blocking path queue, worker threads, return pipeline, graph-update
//! scheduler, flood filler, and the top-level `Engine` that wires them
//! together.
//!
//! No concrete graph or search algorithm lives here — those are `pf-demo`'s
//! job. This crate only ever calls through the `Graph`/`PathSearch` seams.

mod api;
mod engine;
mod flood_fill;
mod graph_update;
mod node_alloc;
mod path_id;
mod queue;
mod return_pipeline;
mod work_items;
mod worker;

pub use api::{EngineConfig, EngineEvent, StatusSnapshot, WorkerCountHint};
pub use engine::Engine;
pub use flood_fill::NoSmallComponentAvailable;
pub use work_items::WorkItem;
pub use worker::TickBudget;
