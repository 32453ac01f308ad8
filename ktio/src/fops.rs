use std::{fs, io, path::Path, path::PathBuf};

pub fn delete_file_if_exists<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    let path = path.as_ref();
    if path.exists() {
        fs::remove_file(path)?; // Attempt to delete the file
    }
    Ok(())
}

pub fn create_directory<P: AsRef<Path>>(path: P) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Temporary bin file path inside the working directory.
pub fn bin_file_path(working_dir: &Path, bin_id: u32) -> PathBuf {
    working_dir.join(format!("diskmer_{:05}.bin", bin_id))
}

/// Sub-bin file path used by the strict-memory stage.
pub fn sub_bin_file_path(working_dir: &Path, bin_id: u32, sub_bin_id: u32) -> PathBuf {
    working_dir.join(format!("diskmer_{:05}.sub_{:03}.bin", bin_id, sub_bin_id))
}

/// Expand an `@listfile` argument into the paths it names.
pub fn read_input_list<P: AsRef<Path>>(path: P) -> io::Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_file_if_exists_test() {
        assert!(delete_file_if_exists("../test_data/doesnotexist.txt").is_ok());
    }

    #[test]
    fn bin_file_path_test() {
        let p = bin_file_path(Path::new("/tmp/work"), 7);
        assert_eq!(p, PathBuf::from("/tmp/work/diskmer_00007.bin"));
    }

    #[test]
    fn read_input_list_test() {
        let dir = std::env::temp_dir().join("ktio_list_test");
        create_directory(&dir).unwrap();
        let list = dir.join("inputs.lst");
        fs::write(&list, "a.fq\n\n  b.fa.gz \n").unwrap();
        assert_eq!(read_input_list(&list).unwrap(), vec!["a.fq", "b.fa.gz"]);
        delete_file_if_exists(&list).unwrap();
    }
}
