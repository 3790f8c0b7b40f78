//! Facet-based synthesis imaging with direction-dependent corrections.

pub mod args;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod facets;
pub mod geom;
pub mod gridder;
pub mod jones;
pub mod kernel;
pub mod plot;
pub mod simulate;
pub mod solutions;
pub mod store;
pub mod tessellation;
pub mod utils;
pub mod vis;
