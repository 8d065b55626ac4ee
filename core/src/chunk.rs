use std::path::{Path, PathBuf};

/// One byte range of a parallel download. Bounds are inclusive, matching the
/// `Range: bytes=start-end` request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        if self.end >= self.start {
            self.end - self.start + 1
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split `total` bytes into up to `threads` contiguous chunks of
/// ceil(total/threads) bytes each. Chunks that would start past the end are
/// omitted, so fewer chunks than threads come back for tiny files.
pub fn build_chunks(total: u64, threads: u32) -> Vec<Chunk> {
    if total == 0 || threads == 0 {
        return Vec::new();
    }
    let threads = threads as u64;
    let chunk_size = total.div_ceil(threads);
    let mut chunks = Vec::new();
    for index in 0..threads {
        let start = index * chunk_size;
        if start > total - 1 {
            break;
        }
        let end = ((index + 1) * chunk_size - 1).min(total - 1);
        chunks.push(Chunk {
            index: index as u32,
            start,
            end,
        });
    }
    chunks
}

/// Sibling temporary file holding the bytes of one chunk until merge.
pub fn part_path(dest: &Path, index: u32) -> PathBuf {
    PathBuf::from(format!("{}.part{}", dest.display(), index))
}

/// Prefix shared by every part file of `dest`, used by the abort sweep.
pub fn part_prefix(dest: &Path) -> Option<String> {
    dest.file_name()
        .map(|name| format!("{}.part", name.to_string_lossy()))
}
