//! Read-ahead parallel copy for backends that tolerate concurrent reads.
//!
//! The ordinary [`crate::copy::copy_data`] loop is strictly sequential:
//! one `pread` then one `pwrite`, back to back. For a flat source that
//! leaves the destination's DEFLATE pass waiting on disk I/O it could have
//! overlapped. This module splits the allocated ranges into the same
//! fixed-size chunks, reads them across a pool of worker threads, and
//! feeds them to a single writer thread in original order.
//!
//! Only a [`FlatBackend`] source is safe here: its `pread` is a plain
//! positional read with no shared mutable state, so many threads can call
//! it at once. [`crate::vmdk::sparse::SparseReader`] keeps inflate state
//! per read and is deliberately not given this treatment.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::bounded;

use crate::error::{Error, Result};
use crate::vmdk::block::BlockIo;
use crate::vmdk::flat::FlatBackend;
use crate::vmdk::stream::StreamWriter;

const CHUNK_SIZE: usize = 65536;
const READ_AHEAD_DEPTH: usize = 8;

struct Chunk {
    index: u64,
    offset: u64,
    data: Vec<u8>,
}

/// Copies every allocated range of `src` into `dst`, reading chunks
/// concurrently and writing them back in order.
pub fn parallel_copy_flat(src: &FlatBackend, dst: &mut StreamWriter) -> Result<()> {
    let mut plan = Vec::new();
    let mut cursor = 0u64;
    while let Some((pos, len)) = src.next_data(cursor)? {
        let mut offset = pos;
        let mut remaining = len;
        while remaining > 0 {
            let chunk_len = std::cmp::min(remaining, CHUNK_SIZE as u64) as usize;
            plan.push((offset, chunk_len));
            offset += chunk_len as u64;
            remaining -= chunk_len as u64;
        }
        cursor = pos + len;
    }

    if plan.is_empty() {
        return Ok(());
    }

    let next_index = AtomicU64::new(0);
    let (tx, rx) = bounded::<Result<Chunk>>(READ_AHEAD_DEPTH);
    let worker_count = rayon::current_num_threads().min(plan.len()).max(1);

    std::thread::scope(|scope| -> Result<()> {
        for _ in 0..worker_count {
            let tx = tx.clone();
            let plan = &plan;
            let next_index = &next_index;
            scope.spawn(move || loop {
                let i = next_index.fetch_add(1, Ordering::SeqCst);
                if i as usize >= plan.len() {
                    return;
                }
                let (offset, len) = plan[i as usize];
                let mut data = vec![0u8; len];
                let result = src.pread(&mut data, offset).map(|()| Chunk { index: i, offset, data });
                if tx.send(result).is_err() {
                    return;
                }
            });
        }
        drop(tx);

        let mut pending = BTreeMap::new();
        let mut next_write = 0u64;
        for received in rx.iter() {
            let chunk = received?;
            pending.insert(chunk.index, (chunk.offset, chunk.data));
            while let Some((offset, data)) = pending.remove(&next_write) {
                dst.pwrite(&data, offset)?;
                next_write += 1;
            }
        }

        if next_write as usize != plan.len() {
            return Err(Error::corruption(
                "parallel copy terminated before all chunks were delivered",
            ));
        }
        Ok(())
    })
}
