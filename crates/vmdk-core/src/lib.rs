//! VMDK Core Library
//!
//! This crate implements a codec for the VMware Virtual Machine Disk
//! (VMDK) format, focused on the stream-optimized sparse extent: a
//! self-describing, DEFLATE-compressed, sparse container mapping a flat
//! virtual disk address space onto a sequential on-disk byte stream.
//!
//! # Modules
//!
//! - `error` - Error types and Result alias
//! - `vmdk` - header/descriptor codec, grain directory/table model, sparse
//!   reader, stream-optimized writer, and the flat backend
//! - `copy` - the single-threaded copy driver that streams allocated
//!   regions from a source into a destination
//! - `parallel` - an optional multithreaded read-ahead extension of the
//!   copy driver for sources that are safely `pread`-able concurrently

pub mod copy;
pub mod error;
pub mod parallel;
pub mod vmdk;

pub use error::{Error, Result};
pub use vmdk::{
    block::BlockIo,
    descriptor::{
        make_descriptor, parse_descriptor, DescriptorConfig, Extent, ExtentType, VmdkDescriptor,
    },
    flat::FlatBackend,
    sparse::SparseReader,
    stream::StreamWriter,
};
