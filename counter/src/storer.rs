//! The storer: single thread appending flushed bin parts to temp bins.

use crate::bins::BinTable;
use crate::error::Result;
use crate::progress::Progress;
use crate::queues::BinPartQueue;

pub fn storer_loop(queue: &BinPartQueue, table: &BinTable, progress: &Progress) -> Result<()> {
    let mut stored: u64 = 0;
    while let Some(part) = queue.pop() {
        table.append(part.bin_id, part.data.filled(), part.expander_parts)?;
        stored += 1;
        if stored % 256 == 0 {
            progress.tick(format!("Stored bin parts: {}", stored));
        }
        // part.data drops here, returning the block to the pool
    }
    Ok(())
}
