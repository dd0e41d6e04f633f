//! Raw, CPU side asset data handed over by the importer.
//!
//! Everything in here is plain-old-data. The GPU side counterpart lives in
//! `cinder_render::cache`, which uploads these assets once and hands out stable
//! positional indices.

pub mod assets;
pub mod store;

pub use assets::*;
pub use store::{AssetError, AssetStore, H, Store, StoreType};
