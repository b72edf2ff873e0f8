//! Renderer-facing GPU resource wrappers
//!
//! Each wrapper pairs the descriptor it was created from with the backend
//! handle. Resources are shared as `Arc`s between the renderer and recorded
//! command lists; the backend handle is released when the last reference drops.

mod acceleration_structure;
mod buffer;
mod function_table;
mod pipeline;
mod texture;

pub use acceleration_structure::AccelerationStructure;
pub use buffer::Buffer;
pub use function_table::IntersectionFunctionTable;
pub use pipeline::ComputePipeline;
pub use texture::Texture;
