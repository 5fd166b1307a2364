//! Tar packing of an assembled build context

use std::collections::BTreeMap;
use std::io;

/// Pack `files` into an uncompressed tar stream.
///
/// Entries are written in path order with a fixed mode and mtime, so the
/// same inputs always produce the same bytes.
pub fn pack(files: &BTreeMap<String, String>) -> io::Result<Vec<u8>> {
    let mut tar = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        tar.append_data(&mut header, path, content.as_bytes())?;
    }
    tar.into_inner()
}
