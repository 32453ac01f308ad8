//! Stage-2 bin reader: loads temporary bins into the arena.
//!
//! Bins are visited in decreasing estimated span size. A bin that cannot
//! fit the arena (strict mode) goes to the too-large queue for the sub-bin
//! pipeline, and the completer is told to skip it in phase 1.

use crate::arena::{ArenaSlot, SortArena};
use crate::bins::{BinSizes, BinTable};
use crate::error::Result;
use crate::progress::Progress;
use crate::queues::{BinJob, CompletedBin, KmerQueue, TooLargeBinsQueue};
use crate::sorters::SortersManager;

#[allow(clippy::too_many_arguments)]
pub fn bin_reader_loop(
    sorted_bins: &[(u32, BinSizes)],
    table: &BinTable,
    arena: &SortArena,
    manager: &SortersManager,
    kmer_queue: &KmerQueue,
    too_large: &TooLargeBinsQueue,
    progress: &Progress,
) -> Result<()> {
    for &(bin_id, sizes) in sorted_bins {
        let stats = table.stats(bin_id);
        if !arena.init(bin_id, sizes.required as usize) {
            too_large.insert(bin_id);
            kmer_queue.push(CompletedBin::diverted(bin_id));
            continue;
        }
        let mut data = arena.alloc(bin_id, ArenaSlot::InputFile, sizes.file_size as usize)?;
        table.read_and_remove(bin_id, &mut data)?;
        manager.push_job(
            BinJob {
                bin_id,
                data: Some(data),
                size: sizes.file_size,
                n_rec: stats.n_rec,
                n_plus_x_recs: stats.n_plus_x_recs,
            },
            sizes.required,
        );
        progress.notify(stats.n_rec);
    }
    manager.notify_queue_completed();
    Ok(())
}
