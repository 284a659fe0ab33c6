//! VMDK stream-optimized sparse extent codec.
//!
//! Submodules split along the on-disk format's own layering: little-endian
//! primitives, the 512-byte header, the grain directory/table model, the
//! descriptor text, the sparse reader and stream-optimized writer built on
//! top of them, the flat backend for raw disk images, and the abstract
//! block I/O trait both backends implement.

pub mod block;
pub mod descriptor;
pub mod flat;
pub mod gdgt;
pub mod header;
pub mod le;
pub mod sparse;
pub mod stream;

pub use block::BlockIo;
pub use descriptor::{make_descriptor, parse_descriptor, DescriptorConfig, Extent, ExtentType, VmdkDescriptor};
pub use flat::FlatBackend;
pub use sparse::SparseReader;
pub use stream::StreamWriter;
