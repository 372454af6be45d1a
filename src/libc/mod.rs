//! Replacement C library entry points.
//!
//! Every function here is registered with `#[interpose(..)]` and only takes
//! effect once its registry is installed by the patch engine.
//!
//! # Modules
//!
//! * [`loader`] - File-control and mapping calls made by the dynamic loader
//! * [`spawn`] - Process creation and wait calls made by guest code

pub mod loader;
pub mod spawn;
