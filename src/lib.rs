//! Parser and relocator for NSO, NRO and KIP executable containers.
//!
//! The library turns raw container bytes into a fully linked, inspectable
//! memory image. It is organized into several modules:
//! - `cursor`: bounds-checked positioned byte reader.
//! - `compress`: KIP back-reference and NSO LZ4 segment decompression.
//! - `layout`: segment/section modelling and the flattened section list.
//! - `container`: per-format header parsing and image flattening.
//! - `dynamic`: MOD0 descriptor, dynamic tags, symbols, relocation tables.
//! - `relocate`: relocation application and PLT/GOT discovery.
//! - `recover`: best-effort boundary and function-start heuristics.
//! - `loader`: the `NxoFile` aggregate orchestrating the pipeline.

pub mod compress;
pub mod config;
pub mod container;
pub mod cursor;
pub mod dynamic;
pub mod error;
pub mod layout;
pub mod loader;
pub mod recover;
pub mod relocate;
pub mod utils;

pub use error::{NxoError, Result};
pub use loader::NxoFile;
