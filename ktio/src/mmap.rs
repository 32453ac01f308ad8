use crate::SeqError;
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::Path;

/// Read-only map of a finished temporary bin file, so the sorting stage can
/// stream super-k-mers without a second copy in userspace buffers.
pub fn mmap_file_ro(path: &Path) -> Result<Mmap, SeqError> {
    let file = File::open(path).map_err(|e| SeqError::io(path.display().to_string(), e))?;
    unsafe {
        MmapOptions::new()
            .map(&file)
            .map_err(|e| SeqError::io(path.display().to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmap_file_ro_test() {
        let path = std::env::temp_dir().join("ktio_mmap_test.bin");
        std::fs::write(&path, b"mapped bytes").unwrap();
        let map = mmap_file_ro(&path).unwrap();
        assert_eq!(&map[..], b"mapped bytes");
        drop(map);
        crate::fops::delete_file_if_exists(&path).unwrap();
    }
}
