//! File transfer: split outgoing files into part frames, stream incoming parts to disk and
//! reassemble them.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::protocol::Frame;
use crate::wire::DecodeError;

/// Split `total_len` bytes into ranges of at most `part_size`.
pub fn split_into_parts(total_len: usize, part_size: usize) -> Vec<Range<usize>> {
    let size = part_size.max(1);
    let mut out = Vec::new();
    let mut start = 0;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(start..end);
        start = end;
    }
    out
}

/// Wire name of part `index` of `name`.
pub fn part_name(name: &str, index: usize) -> String {
    format!("{name}{index}")
}

/// `base` with `index` appended to its file name.
pub fn indexed_path(base: &Path, index: i32) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(index.to_string());
    PathBuf::from(s)
}

/// Frames that carry `data` as file `name`: one whole-file frame if it fits in
/// `part_size`, numbered parts otherwise.
pub fn file_frames(name: &str, data: &[u8], part_size: usize) -> Vec<Frame> {
    if data.len() <= part_size {
        return vec![Frame::FileWhole {
            name: name.to_string(),
            data: data.to_vec(),
        }];
    }
    let parts = split_into_parts(data.len(), part_size);
    let total_parts = parts.len() as i32;
    parts
        .into_iter()
        .enumerate()
        .map(|(i, range)| Frame::FilePart {
            total_parts,
            name: part_name(name, i),
            data: data[range].to_vec(),
        })
        .collect()
}

/// Copy `len` bytes from `src` to a new file at `path`, `chunk_size` bytes at a time.
///
/// The bytes are always consumed so the stream stays in frame. If the file cannot be
/// written the rest is discarded and `Ok(false)` is returned.
pub fn receive_to_file<R: Read + ?Sized>(
    src: &mut R,
    path: Option<&Path>,
    len: usize,
    chunk_size: usize,
) -> Result<bool, DecodeError> {
    let mut out = match path {
        Some(p) => match File::create(p) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(path = %p.display(), error = %e, "cannot create file, discarding bytes");
                None
            }
        },
        None => None,
    };
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut left = len;
    while left > 0 {
        let n = left.min(buf.len());
        src.read_exact(&mut buf[..n])?;
        let failed = match out.as_mut() {
            Some(f) => f.write_all(&buf[..n]).err(),
            None => None,
        };
        if let Some(e) = failed {
            warn!(error = %e, "file write failed, discarding remaining bytes");
            out = None;
        }
        left -= n;
    }
    match out {
        Some(mut f) => Ok(f.flush().is_ok()),
        None => Ok(false),
    }
}

/// Concatenate `base0 .. base{count-1}` into `base` and delete the parts.
/// Missing parts are skipped with a warning.
pub fn reassemble(base: &Path, count: i32) -> io::Result<()> {
    let mut out = File::create(base)?;
    for j in 0..count.max(0) {
        let part = indexed_path(base, j);
        match File::open(&part) {
            Ok(mut input) => {
                io::copy(&mut input, &mut out)?;
                drop(input);
                if let Err(e) = fs::remove_file(&part) {
                    warn!(path = %part.display(), error = %e, "cannot delete file part");
                }
            }
            Err(e) => warn!(path = %part.display(), error = %e, "file part missing"),
        }
    }
    out.flush()
}

/// A multi-part file being received.
#[derive(Debug)]
pub struct IncomingFile {
    base_name: String,
    /// Where the reassembled file goes; `None` if the name was refused.
    base_path: Option<PathBuf>,
    total_parts: i32,
    remaining: i32,
}

impl IncomingFile {
    pub fn begin(base_name: String, base_path: Option<PathBuf>, total_parts: i32) -> Self {
        Self {
            base_name,
            base_path,
            total_parts,
            remaining: total_parts,
        }
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn total_parts(&self) -> i32 {
        self.total_parts
    }

    pub fn remaining(&self) -> i32 {
        self.remaining
    }

    /// Index of the next expected part.
    pub fn next_index(&self) -> i32 {
        self.total_parts - self.remaining
    }

    /// Apply a part count announced by a later part. A changed total moves the remaining
    /// count by the same difference.
    pub fn announce(&mut self, total_parts: i32) {
        if total_parts != self.total_parts {
            let diff = self.total_parts - total_parts;
            self.total_parts = total_parts;
            self.remaining -= diff;
        }
    }

    pub fn part_path(&self, index: i32) -> Option<PathBuf> {
        self.base_path.as_deref().map(|b| indexed_path(b, index))
    }

    /// Count one received part. True once every part is in.
    pub fn record_part(&mut self) -> bool {
        self.remaining -= 1;
        self.remaining <= 0
    }

    /// Reassemble the parts. Returns the stored path, or `None` if nothing could be stored.
    pub fn finish(self) -> Option<PathBuf> {
        let base = self.base_path?;
        match reassemble(&base, self.total_parts) {
            Ok(()) => Some(base),
            Err(e) => {
                warn!(path = %base.display(), error = %e, "file reassembly failed");
                None
            }
        }
    }

    /// Reassemble whatever arrived before the stream ended. A part cut off mid-way is
    /// deleted.
    pub fn salvage(mut self) -> Option<PathBuf> {
        if let Some(partial) = self.part_path(self.next_index()) {
            if partial.exists() {
                if let Err(e) = fs::remove_file(&partial) {
                    warn!(path = %partial.display(), error = %e, "cannot delete partial file part");
                }
            }
        }
        self.total_parts -= self.remaining;
        self.remaining = 0;
        if self.total_parts <= 0 {
            return None;
        }
        self.finish()
    }
}
