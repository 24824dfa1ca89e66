//! Content-addressed, lock-coordinated on-disk cache of four artifact
//! classes (spec.md §4.3, §6 "On-disk cache record tags").
//!
//! Grounded directly on the original `search/cache.c`: the tag vocabulary,
//! the SHA1 key tuples per artifact, the subdirectory-mask substitution
//! rules, and the fcntl byte-range lock retry loop (`iSrchCacheLockCacheFile`)
//! are all carried over verbatim; only the container (Rust structs instead
//! of `wchar_t*` parameter lists) changed.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};

use crate::error::CacheError;

pub const FILENAME_EXT: &str = ".cah";
const INDEX_NAME_SYMBOL: &str = "{Index}";
const LAST_UPDATE_TIME_SYMBOL: &str = "{LastUpdateTime}";

/// `SRCH_CACHE_EXCLUSIVE_LOCK_SLEEP` / `_TIMEOUT` in the original, in
/// microseconds.
const EXCLUSIVE_LOCK_SLEEP_US: u64 = 100;
const EXCLUSIVE_LOCK_TIMEOUT_US: u64 = 500;
/// `SRCH_CACHE_SHARED_LOCK_SLEEP` / `_TIMEOUT`: shared-lock callers do not
/// retry at all in the original (both constants are zero).
const SHARED_LOCK_SLEEP_US: u64 = 0;
const SHARED_LOCK_TIMEOUT_US: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Off,
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockKind {
    Shared,
    Exclusive,
}

/// Tag bytes, one per field, `SRCH_CACHE_*_TAG` in the original (spec.md §6).
mod tag {
    pub const MAX_SORT_KEY: u8 = b'W';
    pub const TOTAL_RESULTS: u8 = b'S';
    pub const SHORT_RESULTS_ARRAY: u8 = b'H';
    pub const SEARCH_TEXT: u8 = b'T';
    pub const POSITIVE_FEEDBACK: u8 = b'P';
    pub const NEGATIVE_FEEDBACK: u8 = b'N';
    pub const TERM_TYPE: u8 = b'G';
    pub const TERM_COUNT: u8 = b'E';
    pub const DOCUMENT_COUNT: u8 = b'Y';
    pub const REQUIRED: u8 = b'U';
    pub const POSTINGS_ARRAY: u8 = b'O';
    pub const TERM: u8 = b'A';
    pub const FIELD_NAME: u8 = b'C';
    pub const ARRAY_LENGTH: u8 = b'Z';
    pub const RAW_ARRAY: u8 = b'F';
    pub const REPORT_SNIPPET: u8 = b'R';
    pub const INDEX_NAME: u8 = b'D';
    pub const LAST_UPDATE_TIME: u8 = b'L';
}

// --- Compressed-numeric primitives -----------------------------------------
//
// "Compressed" here means a standard LEB128 varint, matching the original's
// byte-oriented variable-length integer encoding used throughout
// `cache.c`'s array length prefixes and scalar fields.

fn write_varint<W: Write>(w: &mut W, mut value: u64) -> std::io::Result<()> {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        w.write_all(&[byte])?;
        if value == 0 {
            break;
        }
    }
    Ok(())
}

fn read_varint<R: Read>(r: &mut R) -> std::io::Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        value |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(value)
}

fn write_double<W: Write>(w: &mut W, value: f64) -> std::io::Result<()> {
    write_varint(w, value.to_bits())
}

fn read_double<R: Read>(r: &mut R) -> std::io::Result<f64> {
    Ok(f64::from_bits(read_varint(r)?))
}

fn write_cstring<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    w.write_all(s.as_bytes())?;
    w.write_all(&[0])
}

fn read_cstring<R: Read>(r: &mut R) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn hex_digest(inputs: &[&[u8]]) -> String {
    let mut hasher = Sha1::new();
    for part in inputs {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// One `(doc_id, sort_key)` row of a short-results artifact. The sort key's
/// shape depends on the search's `sort_type` (spec.md §6 "H" field), so each
/// row carries its own one-byte shape tag ahead of the value.
#[derive(Debug, Clone, PartialEq)]
pub enum ShortResultSortKey {
    None,
    Uint(u64),
    Double(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShortResultRow {
    pub document_id: u64,
    pub sort_key: ShortResultSortKey,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShortResultsArtifact {
    pub max_sort_key: Option<f64>,
    pub total_results: u64,
    pub rows: Vec<ShortResultRow>,
    pub search_text: Option<String>,
    pub positive_feedback: Option<String>,
    pub negative_feedback: Option<String>,
    pub report_snippet: Option<String>,
    pub index_name: String,
    pub last_update_time: u64,
}

impl ShortResultsArtifact {
    fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        if let Some(max) = self.max_sort_key {
            w.write_all(&[tag::MAX_SORT_KEY])?;
            write_double(w, max)?;
        }
        w.write_all(&[tag::TOTAL_RESULTS])?;
        write_varint(w, self.total_results)?;

        w.write_all(&[tag::SHORT_RESULTS_ARRAY])?;
        write_varint(w, self.rows.len() as u64)?;
        for row in &self.rows {
            write_varint(w, row.document_id)?;
            match row.sort_key {
                ShortResultSortKey::None => w.write_all(&[0])?,
                ShortResultSortKey::Uint(v) => {
                    w.write_all(&[1])?;
                    write_varint(w, v)?;
                }
                ShortResultSortKey::Double(v) => {
                    w.write_all(&[2])?;
                    write_double(w, v)?;
                }
            }
        }

        if let Some(t) = &self.search_text {
            w.write_all(&[tag::SEARCH_TEXT])?;
            write_cstring(w, t)?;
        }
        if let Some(t) = &self.positive_feedback {
            w.write_all(&[tag::POSITIVE_FEEDBACK])?;
            write_cstring(w, t)?;
        }
        if let Some(t) = &self.negative_feedback {
            w.write_all(&[tag::NEGATIVE_FEEDBACK])?;
            write_cstring(w, t)?;
        }
        if let Some(t) = &self.report_snippet {
            w.write_all(&[tag::REPORT_SNIPPET])?;
            write_cstring(w, t)?;
        }
        w.write_all(&[tag::INDEX_NAME])?;
        write_cstring(w, &self.index_name)?;
        w.write_all(&[tag::LAST_UPDATE_TIME])?;
        write_varint(w, self.last_update_time)?;
        Ok(())
    }

    fn read(r: &mut impl Read) -> std::io::Result<Self> {
        let mut artifact = ShortResultsArtifact::default();
        loop {
            let mut tag_byte = [0u8; 1];
            match r.read(&mut tag_byte)? {
                0 => break,
                _ => {}
            }
            match tag_byte[0] {
                tag::MAX_SORT_KEY => artifact.max_sort_key = Some(read_double(r)?),
                tag::TOTAL_RESULTS => artifact.total_results = read_varint(r)?,
                tag::SHORT_RESULTS_ARRAY => {
                    let count = read_varint(r)?;
                    let mut rows = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let document_id = read_varint(r)?;
                        let mut shape = [0u8; 1];
                        r.read_exact(&mut shape)?;
                        let sort_key = match shape[0] {
                            1 => ShortResultSortKey::Uint(read_varint(r)?),
                            2 => ShortResultSortKey::Double(read_double(r)?),
                            _ => ShortResultSortKey::None,
                        };
                        rows.push(ShortResultRow { document_id, sort_key });
                    }
                    artifact.rows = rows;
                }
                tag::SEARCH_TEXT => artifact.search_text = Some(read_cstring(r)?),
                tag::POSITIVE_FEEDBACK => artifact.positive_feedback = Some(read_cstring(r)?),
                tag::NEGATIVE_FEEDBACK => artifact.negative_feedback = Some(read_cstring(r)?),
                tag::REPORT_SNIPPET => artifact.report_snippet = Some(read_cstring(r)?),
                tag::INDEX_NAME => artifact.index_name = read_cstring(r)?,
                tag::LAST_UPDATE_TIME => artifact.last_update_time = read_varint(r)?,
                // Unknown tag: best-effort, skip the byte we already consumed
                // and keep going (spec.md §4.3 "unknown tags terminate
                // parsing of the containing payload").
                _ => continue,
            }
        }
        Ok(artifact)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostingsRow {
    pub document_id: u64,
    pub term_position: u64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PostingsArtifact {
    pub term_type: u64,
    pub term_count: u64,
    pub document_count: u64,
    pub required: bool,
    pub postings: Vec<PostingsRow>,
    pub term: String,
    pub field_name: Option<String>,
    pub index_name: String,
    pub last_update_time: u64,
}

impl PostingsArtifact {
    fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(&[tag::TERM_TYPE])?;
        write_varint(w, self.term_type)?;
        w.write_all(&[tag::TERM_COUNT])?;
        write_varint(w, self.term_count)?;
        w.write_all(&[tag::DOCUMENT_COUNT])?;
        write_varint(w, self.document_count)?;
        w.write_all(&[tag::REQUIRED])?;
        write_varint(w, self.required as u64)?;

        w.write_all(&[tag::POSTINGS_ARRAY])?;
        write_varint(w, self.postings.len() as u64)?;
        for row in &self.postings {
            write_varint(w, row.document_id)?;
            write_varint(w, row.term_position)?;
            write_double(w, row.weight)?;
        }

        w.write_all(&[tag::TERM])?;
        write_cstring(w, &self.term)?;
        if let Some(field) = &self.field_name {
            w.write_all(&[tag::FIELD_NAME])?;
            write_cstring(w, field)?;
        }
        w.write_all(&[tag::INDEX_NAME])?;
        write_cstring(w, &self.index_name)?;
        w.write_all(&[tag::LAST_UPDATE_TIME])?;
        write_varint(w, self.last_update_time)?;
        Ok(())
    }

    fn read(r: &mut impl Read) -> std::io::Result<Self> {
        let mut artifact = PostingsArtifact::default();
        loop {
            let mut tag_byte = [0u8; 1];
            if r.read(&mut tag_byte)? == 0 {
                break;
            }
            match tag_byte[0] {
                tag::TERM_TYPE => artifact.term_type = read_varint(r)?,
                tag::TERM_COUNT => artifact.term_count = read_varint(r)?,
                tag::DOCUMENT_COUNT => artifact.document_count = read_varint(r)?,
                tag::REQUIRED => artifact.required = read_varint(r)? != 0,
                tag::POSTINGS_ARRAY => {
                    let count = read_varint(r)?;
                    let mut rows = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let document_id = read_varint(r)?;
                        let term_position = read_varint(r)?;
                        let weight = read_double(r)?;
                        rows.push(PostingsRow { document_id, term_position, weight });
                    }
                    artifact.postings = rows;
                }
                tag::TERM => artifact.term = read_cstring(r)?,
                tag::FIELD_NAME => artifact.field_name = Some(read_cstring(r)?),
                tag::INDEX_NAME => artifact.index_name = read_cstring(r)?,
                tag::LAST_UPDATE_TIME => artifact.last_update_time = read_varint(r)?,
                _ => continue,
            }
        }
        Ok(artifact)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeightsArtifact {
    pub weights: Vec<f32>,
    pub index_name: String,
    pub last_update_time: u64,
}

impl WeightsArtifact {
    fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(&[tag::ARRAY_LENGTH])?;
        write_varint(w, self.weights.len() as u64)?;
        w.write_all(&[tag::RAW_ARRAY])?;
        for value in &self.weights {
            w.write_all(&value.to_le_bytes())?;
        }
        w.write_all(&[tag::INDEX_NAME])?;
        write_cstring(w, &self.index_name)?;
        w.write_all(&[tag::LAST_UPDATE_TIME])?;
        write_varint(w, self.last_update_time)?;
        Ok(())
    }

    fn read(r: &mut impl Read) -> std::io::Result<Self> {
        let mut artifact = WeightsArtifact::default();
        let mut pending_len: Option<u64> = None;
        loop {
            let mut tag_byte = [0u8; 1];
            if r.read(&mut tag_byte)? == 0 {
                break;
            }
            match tag_byte[0] {
                tag::ARRAY_LENGTH => pending_len = Some(read_varint(r)?),
                tag::RAW_ARRAY => {
                    let count = pending_len.take().unwrap_or(0);
                    let mut weights = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let mut bytes = [0u8; 4];
                        r.read_exact(&mut bytes)?;
                        weights.push(f32::from_le_bytes(bytes));
                    }
                    artifact.weights = weights;
                }
                tag::INDEX_NAME => artifact.index_name = read_cstring(r)?,
                tag::LAST_UPDATE_TIME => artifact.last_update_time = read_varint(r)?,
                _ => continue,
            }
        }
        Ok(artifact)
    }
}

/// A document bitmap. The tag vocabulary in spec.md §6 has no field
/// dedicated to bitmap payloads; this reuses the generic "length + raw
/// array" shape ('Z'/'F') that the weights artifact already establishes,
/// since both are just a length-prefixed flat buffer (see DESIGN.md).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BitmapArtifact {
    pub data: Vec<u8>,
    pub index_name: String,
    pub last_update_time: u64,
}

impl BitmapArtifact {
    fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(&[tag::ARRAY_LENGTH])?;
        write_varint(w, self.data.len() as u64)?;
        w.write_all(&[tag::RAW_ARRAY])?;
        w.write_all(&self.data)?;
        w.write_all(&[tag::INDEX_NAME])?;
        write_cstring(w, &self.index_name)?;
        w.write_all(&[tag::LAST_UPDATE_TIME])?;
        write_varint(w, self.last_update_time)?;
        Ok(())
    }

    fn read(r: &mut impl Read) -> std::io::Result<Self> {
        let mut artifact = BitmapArtifact::default();
        let mut pending_len: Option<u64> = None;
        loop {
            let mut tag_byte = [0u8; 1];
            if r.read(&mut tag_byte)? == 0 {
                break;
            }
            match tag_byte[0] {
                tag::ARRAY_LENGTH => pending_len = Some(read_varint(r)?),
                tag::RAW_ARRAY => {
                    let count = pending_len.take().unwrap_or(0) as usize;
                    let mut data = vec![0u8; count];
                    r.read_exact(&mut data)?;
                    artifact.data = data;
                }
                tag::INDEX_NAME => artifact.index_name = read_cstring(r)?,
                tag::LAST_UPDATE_TIME => artifact.last_update_time = read_varint(r)?,
                _ => continue,
            }
        }
        Ok(artifact)
    }
}

/// Byte-range advisory lock over the whole file via `fcntl(F_SETLK)`,
/// matching `iSrchCacheLockCacheFile`'s `l_start = 0, l_len = 0` (lock to
/// EOF). Exclusive-lock callers retry for `EXCLUSIVE_LOCK_TIMEOUT_US`;
/// shared-lock callers do not retry at all (both original constants are 0).
struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn acquire(file: &'a File, kind: LockKind) -> Result<Self, CacheError> {
        let (l_type, sleep_us, timeout_us) = match kind {
            LockKind::Shared => (libc::F_RDLCK, SHARED_LOCK_SLEEP_US, SHARED_LOCK_TIMEOUT_US),
            LockKind::Exclusive => (libc::F_WRLCK, EXCLUSIVE_LOCK_SLEEP_US, EXCLUSIVE_LOCK_TIMEOUT_US),
        };

        let mut flock_struct: libc::flock = unsafe { std::mem::zeroed() };
        flock_struct.l_type = l_type as libc::c_short;
        flock_struct.l_whence = libc::SEEK_SET as libc::c_short;
        flock_struct.l_start = 0;
        flock_struct.l_len = 0;

        let start = Instant::now();
        loop {
            let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &flock_struct) };
            if rc != -1 {
                return Ok(FileLock { file });
            }
            if start.elapsed() >= Duration::from_micros(timeout_us) {
                return Err(CacheError::LockFailed);
            }
            if sleep_us > 0 {
                std::thread::sleep(Duration::from_micros(sleep_us));
            }
        }
    }
}

impl<'a> Drop for FileLock<'a> {
    fn drop(&mut self) {
        let mut flock_struct: libc::flock = unsafe { std::mem::zeroed() };
        flock_struct.l_type = libc::F_UNLCK as libc::c_short;
        flock_struct.l_whence = libc::SEEK_SET as libc::c_short;
        flock_struct.l_start = 0;
        flock_struct.l_len = 0;
        unsafe {
            libc::fcntl(self.file.as_raw_fd(), libc::F_SETLK, &flock_struct);
        }
    }
}

/// The on-disk search cache root (spec.md §3 "Search cache (on-disk)").
pub struct SearchCache {
    pub mode: CacheMode,
    pub directory: PathBuf,
    pub subdirectory_mask: Option<String>,
}

impl SearchCache {
    pub fn new(mode: CacheMode, directory: impl Into<PathBuf>, subdirectory_mask: Option<String>) -> Self {
        SearchCache {
            mode,
            directory: directory.into(),
            subdirectory_mask,
        }
    }

    /// spec.md §3: "a directory derived from ... an optional subdirectory
    /// mask in which ASCII digits are substituted by the hex digest
    /// character at that offset, and literal tokens `{Index}` /
    /// `{LastUpdateTime}` are substituted." Grounded on
    /// `iSrchCacheGetCacheFilePath` in the original.
    fn file_path(&self, sha1_hex: &str, index_name: &str, last_update_time: u64) -> PathBuf {
        let filename = format!("{}{}", sha1_hex, FILENAME_EXT);

        let mask = match &self.subdirectory_mask {
            Some(m) if !m.is_empty() => m,
            _ => return self.directory.join(filename),
        };

        let mut subdir: String = mask
            .chars()
            .map(|c| match c.to_digit(10) {
                Some(offset) => sha1_hex
                    .as_bytes()
                    .get(offset as usize)
                    .map(|b| *b as char)
                    .unwrap_or(c),
                None => c,
            })
            .collect();
        subdir = subdir.replace(INDEX_NAME_SYMBOL, index_name);
        subdir = subdir.replace(LAST_UPDATE_TIME_SYMBOL, &last_update_time.to_string());

        self.directory.join(subdir).join(filename)
    }

    fn ensure_parent_dir(&self, path: &Path) -> Result<(), CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::CreateDirFailed(format!("{:?}: {}", parent, e))
            })?;
            // 0755, matching the original's S_IRUSR|S_IWUSR|S_IXUSR|S_IRGRP|S_IXGRP|S_IROTH|S_IXOTH
            let _ = std::fs::set_permissions(parent, std::os::unix::fs::PermissionsExt::from_mode(0o755));
        }
        Ok(())
    }

    fn save_bytes(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        if self.mode != CacheMode::ReadWrite {
            return Err(CacheError::InvalidMode);
        }
        self.ensure_parent_dir(path)?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| CacheError::SaveFailed(format!("{:?}: {}", path, e)))?;

        let _lock = match FileLock::acquire(&file, LockKind::Exclusive) {
            Ok(lock) => lock,
            Err(_) => {
                let _ = std::fs::remove_file(path);
                return Err(CacheError::LockFailed);
            }
        };

        let mut file_for_write = &file;
        if let Err(e) = file_for_write.write_all(bytes) {
            drop(_lock);
            let _ = std::fs::remove_file(path);
            return Err(CacheError::SaveFailed(e.to_string()));
        }

        Ok(())
    }

    fn load_bytes(&self, path: &Path) -> Result<Vec<u8>, CacheError> {
        if self.mode == CacheMode::Off {
            return Err(CacheError::InvalidMode);
        }

        let file = File::open(path).map_err(|_| CacheError::GetFailed("not found".into()))?;
        let _lock = FileLock::acquire(&file, LockKind::Shared)?;

        // Memory-map read-only and copy out; avoids a second syscall-heavy
        // read path for large postings/bitmap artifacts (spec.md §4.3
        // "memory-map the file read-only").
        let mmap = unsafe {
            memmap2::Mmap::map(&file).map_err(|e| CacheError::GetFailed(e.to_string()))?
        };
        Ok(mmap.to_vec())
    }

    #[cfg(feature = "cache-touch-on-read")]
    fn touch(&self, path: &Path) {
        let now = filetime::FileTime::now();
        let _ = filetime::set_file_times(path, now, now);
    }

    #[cfg(not(feature = "cache-touch-on-read"))]
    fn touch(&self, _path: &Path) {}

    // --- Short results -----------------------------------------------------

    #[cfg(feature = "cache-short-results")]
    pub fn short_results_key(
        index_name: &str,
        last_update_time: u64,
        search_text: Option<&str>,
        positive_feedback: Option<&str>,
        negative_feedback: Option<&str>,
    ) -> String {
        hex_digest(&[
            index_name.as_bytes(),
            last_update_time.to_string().as_bytes(),
            search_text.unwrap_or("").as_bytes(),
            positive_feedback.unwrap_or("").as_bytes(),
            negative_feedback.unwrap_or("").as_bytes(),
        ])
    }

    #[cfg(feature = "cache-short-results")]
    pub fn save_short_results(&self, key: &str, artifact: &ShortResultsArtifact) -> Result<(), CacheError> {
        let mut buf = Vec::new();
        artifact
            .write(&mut buf)
            .map_err(|e| CacheError::SaveFailed(e.to_string()))?;
        let path = self.file_path(key, &artifact.index_name, artifact.last_update_time);
        self.save_bytes(&path, &buf)
    }

    #[cfg(feature = "cache-short-results")]
    pub fn get_short_results(
        &self,
        key: &str,
        index_name: &str,
        last_update_time: u64,
    ) -> Result<ShortResultsArtifact, CacheError> {
        let path = self.file_path(key, index_name, last_update_time);
        let bytes = self.load_bytes(&path)?;
        let artifact = ShortResultsArtifact::read(&mut &bytes[..])
            .map_err(|e| CacheError::GetFailed(e.to_string()))?;
        self.touch(&path);
        Ok(artifact)
    }

    // --- Postings lists ------------------------------------------------------

    #[cfg(feature = "cache-postings")]
    #[allow(clippy::too_many_arguments)]
    pub fn postings_key(
        index_name: &str,
        last_update_time: u64,
        language_id: u32,
        term: &str,
        field_name: Option<&str>,
        function_id: u32,
        range_id: u32,
        wildcard: bool,
        term_weight: f64,
        required: bool,
    ) -> String {
        hex_digest(&[
            index_name.as_bytes(),
            last_update_time.to_string().as_bytes(),
            language_id.to_string().as_bytes(),
            term.as_bytes(),
            field_name.unwrap_or("").as_bytes(),
            function_id.to_string().as_bytes(),
            range_id.to_string().as_bytes(),
            (wildcard as u32).to_string().as_bytes(),
            format!("{:8.2}", term_weight).as_bytes(),
            (required as u32).to_string().as_bytes(),
        ])
    }

    #[cfg(feature = "cache-postings")]
    pub fn save_postings(&self, key: &str, artifact: &PostingsArtifact) -> Result<(), CacheError> {
        let mut buf = Vec::new();
        artifact
            .write(&mut buf)
            .map_err(|e| CacheError::SaveFailed(e.to_string()))?;
        let path = self.file_path(key, &artifact.index_name, artifact.last_update_time);
        self.save_bytes(&path, &buf)
    }

    #[cfg(feature = "cache-postings")]
    pub fn get_postings(
        &self,
        key: &str,
        index_name: &str,
        last_update_time: u64,
    ) -> Result<PostingsArtifact, CacheError> {
        let path = self.file_path(key, index_name, last_update_time);
        let bytes = self.load_bytes(&path)?;
        let artifact =
            PostingsArtifact::read(&mut &bytes[..]).map_err(|e| CacheError::GetFailed(e.to_string()))?;
        self.touch(&path);
        Ok(artifact)
    }

    // --- Term-weight vectors -------------------------------------------------

    #[cfg(feature = "cache-weights")]
    pub fn weights_key(index_name: &str, last_update_time: u64, weight_name: &str) -> String {
        hex_digest(&[
            index_name.as_bytes(),
            last_update_time.to_string().as_bytes(),
            weight_name.as_bytes(),
        ])
    }

    #[cfg(feature = "cache-weights")]
    pub fn save_weights(&self, key: &str, artifact: &WeightsArtifact) -> Result<(), CacheError> {
        let mut buf = Vec::new();
        artifact
            .write(&mut buf)
            .map_err(|e| CacheError::SaveFailed(e.to_string()))?;
        let path = self.file_path(key, &artifact.index_name, artifact.last_update_time);
        self.save_bytes(&path, &buf)
    }

    #[cfg(feature = "cache-weights")]
    pub fn get_weights(
        &self,
        key: &str,
        index_name: &str,
        last_update_time: u64,
    ) -> Result<WeightsArtifact, CacheError> {
        let path = self.file_path(key, index_name, last_update_time);
        let bytes = self.load_bytes(&path)?;
        let artifact =
            WeightsArtifact::read(&mut &bytes[..]).map_err(|e| CacheError::GetFailed(e.to_string()))?;
        self.touch(&path);
        Ok(artifact)
    }

    // --- Document bitmaps ------------------------------------------------------

    #[cfg(feature = "cache-bitmaps")]
    pub fn bitmap_key(
        index_name: &str,
        last_update_time: u64,
        bitmap_name: &str,
        bitmap_last_update: u64,
    ) -> String {
        hex_digest(&[
            index_name.as_bytes(),
            last_update_time.to_string().as_bytes(),
            bitmap_name.as_bytes(),
            bitmap_last_update.to_string().as_bytes(),
        ])
    }

    #[cfg(feature = "cache-bitmaps")]
    pub fn save_bitmap(&self, key: &str, artifact: &BitmapArtifact) -> Result<(), CacheError> {
        let mut buf = Vec::new();
        artifact
            .write(&mut buf)
            .map_err(|e| CacheError::SaveFailed(e.to_string()))?;
        let path = self.file_path(key, &artifact.index_name, artifact.last_update_time);
        self.save_bytes(&path, &buf)
    }

    #[cfg(feature = "cache-bitmaps")]
    pub fn get_bitmap(
        &self,
        key: &str,
        index_name: &str,
        last_update_time: u64,
    ) -> Result<BitmapArtifact, CacheError> {
        let path = self.file_path(key, index_name, last_update_time);
        let bytes = self.load_bytes(&path)?;
        let artifact =
            BitmapArtifact::read(&mut &bytes[..]).map_err(|e| CacheError::GetFailed(e.to_string()))?;
        self.touch(&path);
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn subdirectory_mask_substitutes_digits_and_symbols() {
        let dir = tempdir().unwrap();
        let cache = SearchCache::new(
            CacheMode::ReadWrite,
            dir.path(),
            Some("01/{Index}/{LastUpdateTime}".to_string()),
        );
        let path = cache.file_path("abcdef0123456789", "foo", 42);
        assert_eq!(
            path,
            dir.path().join("ab").join("foo").join("42").join("abcdef0123456789.cah")
        );
    }

    #[test]
    fn no_mask_uses_flat_directory() {
        let dir = tempdir().unwrap();
        let cache = SearchCache::new(CacheMode::ReadWrite, dir.path(), None);
        let path = cache.file_path("deadbeef", "foo", 1);
        assert_eq!(path, dir.path().join("deadbeef.cah"));
    }

    /// Invariant 3 / Scenario S5: save then get round-trips byte-for-byte.
    #[test]
    fn scenario_s5_short_results_round_trip() {
        let dir = tempdir().unwrap();
        let cache = SearchCache::new(CacheMode::ReadWrite, dir.path(), None);

        let artifact = ShortResultsArtifact {
            max_sort_key: Some(2.5),
            total_results: 1234,
            rows: vec![
                ShortResultRow { document_id: 42, sort_key: ShortResultSortKey::Double(1.9) },
                ShortResultRow { document_id: 7, sort_key: ShortResultSortKey::Double(0.1) },
            ],
            search_text: Some("hello world".to_string()),
            positive_feedback: None,
            negative_feedback: None,
            report_snippet: None,
            index_name: "foo".to_string(),
            last_update_time: 99,
        };

        let key = SearchCache::short_results_key("foo", 99, Some("hello world"), None, None);
        cache.save_short_results(&key, &artifact).unwrap();

        let got = cache.get_short_results(&key, "foo", 99).unwrap();
        assert_eq!(got, artifact);
        assert_eq!(got.index_name, "foo");
        assert_eq!(got.last_update_time, 99);
    }

    #[test]
    fn postings_round_trip_preserves_all_fields() {
        let dir = tempdir().unwrap();
        let cache = SearchCache::new(CacheMode::ReadWrite, dir.path(), None);

        let artifact = PostingsArtifact {
            term_type: 1,
            term_count: 3,
            document_count: 10,
            required: true,
            postings: vec![
                PostingsRow { document_id: 1, term_position: 0, weight: 0.5 },
                PostingsRow { document_id: 2, term_position: 4, weight: 1.25 },
            ],
            term: "rust".to_string(),
            field_name: Some("body".to_string()),
            index_name: "foo".to_string(),
            last_update_time: 7,
        };

        let key = SearchCache::postings_key("foo", 7, 1, "rust", Some("body"), 0, 0, false, 1.0, true);
        cache.save_postings(&key, &artifact).unwrap();
        let got = cache.get_postings(&key, "foo", 7).unwrap();
        assert_eq!(got, artifact);
    }

    #[test]
    fn weights_round_trip() {
        let dir = tempdir().unwrap();
        let cache = SearchCache::new(CacheMode::ReadWrite, dir.path(), None);
        let artifact = WeightsArtifact {
            weights: vec![0.1, 0.2, 0.3],
            index_name: "foo".to_string(),
            last_update_time: 3,
        };
        let key = SearchCache::weights_key("foo", 3, "w1");
        cache.save_weights(&key, &artifact).unwrap();
        let got = cache.get_weights(&key, "foo", 3).unwrap();
        assert_eq!(got, artifact);
    }

    #[test]
    fn bitmap_round_trip() {
        let dir = tempdir().unwrap();
        let cache = SearchCache::new(CacheMode::ReadWrite, dir.path(), None);
        let artifact = BitmapArtifact {
            data: vec![1, 2, 3, 4, 5],
            index_name: "foo".to_string(),
            last_update_time: 5,
        };
        let key = SearchCache::bitmap_key("foo", 5, "recent", 123);
        cache.save_bitmap(&key, &artifact).unwrap();
        let got = cache.get_bitmap(&key, "foo", 5).unwrap();
        assert_eq!(got, artifact);
    }

    #[test]
    fn read_only_mode_forbids_save() {
        let dir = tempdir().unwrap();
        let cache = SearchCache::new(CacheMode::ReadOnly, dir.path(), None);
        let artifact = ShortResultsArtifact {
            index_name: "foo".into(),
            last_update_time: 1,
            ..Default::default()
        };
        let err = cache.save_short_results("k", &artifact).unwrap_err();
        assert!(matches!(err, CacheError::InvalidMode));
    }

    #[test]
    fn off_mode_forbids_get() {
        let dir = tempdir().unwrap();
        let cache = SearchCache::new(CacheMode::Off, dir.path(), None);
        let err = cache.get_short_results("missing", "foo", 1).unwrap_err();
        assert!(matches!(err, CacheError::InvalidMode));
    }

    #[test]
    fn missing_file_is_a_cache_miss_not_a_panic() {
        let dir = tempdir().unwrap();
        let cache = SearchCache::new(CacheMode::ReadWrite, dir.path(), None);
        let err = cache.get_short_results("missing", "foo", 1).unwrap_err();
        assert!(matches!(err, CacheError::GetFailed(_)));
    }

    /// Invariant 7: hashing the same inputs twice is deterministic;
    /// perturbing any input changes the digest.
    #[test]
    fn cache_key_determinism() {
        let a = SearchCache::short_results_key("foo", 1, Some("hello"), None, None);
        let b = SearchCache::short_results_key("foo", 1, Some("hello"), None, None);
        assert_eq!(a, b);
        let c = SearchCache::short_results_key("foo", 1, Some("hello!"), None, None);
        assert_ne!(a, c);
    }
}
