//! Resource collaborators
//!
//! Meshes, CPU textures and the texture cache. They own handles, never device
//! objects, and take the RHI as an explicit argument.

mod mesh;
mod texture;
mod texture_map;

pub use mesh::*;
pub use texture::*;
pub use texture_map::*;
