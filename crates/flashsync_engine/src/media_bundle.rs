//! Zip bundles exchanged by the media protocol.
//!
//! Uploads carry numbered entries plus a `_meta` list of `[fname, entry]`
//! pairs, where an empty entry marks a deletion. Downloads carry a `_meta`
//! map of `{entry: fname}`.

use crate::checksum::HashingReader;
use crate::error::{SyncError, SyncResult};
use crate::store::MediaStore;
use flashsync_protocol::{DownloadManifest, UploadManifest, ZIP_META_ENTRY};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// A zip of local media changes ready to upload.
#[derive(Debug)]
pub struct UploadBundle {
    /// The zip, rewound to the start.
    pub file: File,
    /// File names in manifest order.
    pub fnames: Vec<String>,
    /// Uncompressed bytes of file entries.
    pub bytes: u64,
}

/// Limits for one upload zip.
#[derive(Debug, Clone, Copy)]
pub struct BundleLimits {
    /// Maximum number of manifest entries.
    pub max_files: usize,
    /// Uncompressed bytes after which no further file is added.
    pub max_bytes: u64,
}

/// Builds the next upload zip from dirty records, or `None` if nothing is dirty.
///
/// Dirty files whose bytes are gone are recorded as deletions.
pub fn build_upload<S: MediaStore + ?Sized>(
    store: &mut S,
    limits: BundleLimits,
    scratch_dir: Option<&Path>,
) -> SyncResult<Option<UploadBundle>> {
    let dirty = store.dirty_records(limits.max_files)?;
    if dirty.is_empty() {
        return Ok(None);
    }

    let scratch = match scratch_dir {
        Some(dir) => tempfile::tempfile_in(dir)?,
        None => tempfile::tempfile()?,
    };
    let mut zip = ZipWriter::new(scratch);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut manifest: UploadManifest = Vec::with_capacity(dirty.len());
    let mut missing = Vec::new();
    let mut bytes = 0u64;

    for record in dirty {
        if bytes > limits.max_bytes {
            break;
        }
        let entry = if record.checksum.is_some() {
            match store.open_file(&record.fname)? {
                Some(mut reader) => {
                    let name = manifest.len().to_string();
                    zip.start_file(name.as_str(), options)?;
                    bytes += io::copy(&mut reader, &mut zip)?;
                    name
                }
                None => {
                    warn!(fname = %record.fname, "dirty media file vanished, sending deletion");
                    missing.push(record.fname.clone());
                    String::new()
                }
            }
        } else {
            String::new()
        };
        manifest.push((record.fname, entry));
    }

    for fname in &missing {
        store.mark_missing(fname)?;
    }

    zip.start_file(ZIP_META_ENTRY, options)?;
    zip.write_all(&serde_json::to_vec(&manifest)?)?;
    let mut file = zip.finish()?;
    file.seek(SeekFrom::Start(0))?;

    debug!(entries = manifest.len(), bytes, "media upload bundle built");
    Ok(Some(UploadBundle {
        file,
        fnames: manifest.into_iter().map(|(fname, _)| fname).collect(),
        bytes,
    }))
}

/// Writes every file of a downloaded zip into the store, recording each as
/// clean with the checksum of the bytes written. Returns the file count.
pub fn extract_download<R, S>(zip: R, store: &mut S) -> SyncResult<usize>
where
    R: Read + Seek,
    S: MediaStore + ?Sized,
{
    let mut archive = ZipArchive::new(zip)?;
    let manifest: DownloadManifest = {
        let mut meta = archive.by_name(ZIP_META_ENTRY)?;
        let mut text = String::new();
        meta.read_to_string(&mut text)?;
        serde_json::from_str(&text)?
    };

    let mut count = 0;
    for (entry, fname) in &manifest {
        if fname.contains('/') || fname.contains('\\') {
            return Err(SyncError::Protocol(format!(
                "refusing media file name {fname:?}"
            )));
        }
        let file = archive.by_name(entry)?;
        let mut hashing = HashingReader::new(file);
        store.write_file(fname, &mut hashing)?;
        let checksum = hashing.finish();
        store.add_synced(fname, &checksum)?;
        count += 1;
    }
    debug!(count, "media files extracted");
    Ok(count)
}

/// Builds a download zip from `(fname, bytes)` pairs.
pub fn write_download<W: Write + Seek>(out: W, files: &[(String, Vec<u8>)]) -> SyncResult<W> {
    let mut zip = ZipWriter::new(out);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut manifest = DownloadManifest::new();
    for (index, (fname, data)) in files.iter().enumerate() {
        let entry = index.to_string();
        zip.start_file(entry.as_str(), options)?;
        zip.write_all(data)?;
        manifest.insert(entry, fname.clone());
    }
    zip.start_file(ZIP_META_ENTRY, options)?;
    zip.write_all(&serde_json::to_vec(&manifest)?)?;
    Ok(zip.finish()?)
}

/// A parsed upload zip: `(fname, Some(bytes))` for additions, `(fname, None)`
/// for deletions, in manifest order.
pub fn read_upload<R: Read + Seek>(zip: R) -> SyncResult<Vec<(String, Option<Vec<u8>>)>> {
    let mut archive = ZipArchive::new(zip)?;
    let manifest: UploadManifest = {
        let mut meta = archive.by_name(ZIP_META_ENTRY)?;
        let mut text = String::new();
        meta.read_to_string(&mut text)?;
        serde_json::from_str(&text)?
    };
    let mut entries = Vec::with_capacity(manifest.len());
    for (fname, entry) in manifest {
        if entry.is_empty() {
            entries.push((fname, None));
        } else {
            let mut data = Vec::new();
            archive.by_name(&entry)?.read_to_end(&mut data)?;
            entries.push((fname, Some(data)));
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum;
    use crate::memory::MemoryMedia;

    const LIMITS: BundleLimits = BundleLimits {
        max_files: 25,
        max_bytes: 2_621_440,
    };

    #[test]
    fn upload_bundle_lists_additions_and_deletions() {
        let mut media = MemoryMedia::new();
        media.add_local("a.png", b"aaaa".to_vec());
        media.remove_local("b.png");

        let bundle = build_upload(&mut media, LIMITS, None).unwrap().unwrap();
        assert_eq!(bundle.fnames, vec!["a.png", "b.png"]);
        assert_eq!(bundle.bytes, 4);

        let entries = read_upload(bundle.file).unwrap();
        assert_eq!(entries[0], ("a.png".to_string(), Some(b"aaaa".to_vec())));
        assert_eq!(entries[1], ("b.png".to_string(), None));
    }

    #[test]
    fn vanished_files_become_deletions() {
        let mut media = MemoryMedia::new();
        media.add_local("gone.png", b"x".to_vec());
        media.lose_file("gone.png");

        let bundle = build_upload(&mut media, LIMITS, None).unwrap().unwrap();
        let entries = read_upload(bundle.file).unwrap();
        assert_eq!(entries, vec![("gone.png".to_string(), None)]);
        assert_eq!(media.record("gone.png").unwrap().unwrap().checksum, None);
    }

    #[test]
    fn byte_cap_stops_after_crossing() {
        let mut media = MemoryMedia::new();
        media.add_local("a", vec![0u8; 60]);
        media.add_local("b", vec![0u8; 60]);
        media.add_local("c", vec![0u8; 60]);
        let limits = BundleLimits {
            max_files: 25,
            max_bytes: 100,
        };
        let bundle = build_upload(&mut media, limits, None).unwrap().unwrap();
        assert_eq!(bundle.fnames, vec!["a", "b"]);
    }

    #[test]
    fn file_cap_limits_entries() {
        let mut media = MemoryMedia::new();
        for i in 0..5 {
            media.add_local(&format!("{i}.txt"), vec![1u8]);
        }
        let limits = BundleLimits {
            max_files: 2,
            max_bytes: 1000,
        };
        let bundle = build_upload(&mut media, limits, None).unwrap().unwrap();
        assert_eq!(bundle.fnames.len(), 2);
    }

    #[test]
    fn nothing_dirty_builds_nothing() {
        let mut media = MemoryMedia::new();
        assert!(build_upload(&mut media, LIMITS, None).unwrap().is_none());
    }

    #[test]
    fn download_extracts_with_checksums() {
        let files = vec![
            ("x.mp3".to_string(), b"sound".to_vec()),
            ("y.jpg".to_string(), b"image".to_vec()),
        ];
        let zip = write_download(io::Cursor::new(Vec::new()), &files).unwrap();
        let mut media = MemoryMedia::new();
        let count = extract_download(io::Cursor::new(zip.into_inner()), &mut media).unwrap();
        assert_eq!(count, 2);
        assert_eq!(media.file("x.mp3"), Some(&b"sound"[..]));
        let record = media.record("y.jpg").unwrap().unwrap();
        assert_eq!(record.checksum.as_deref(), Some(checksum(b"image").as_str()));
        assert!(!record.dirty);
    }

    #[test]
    fn download_rejects_paths() {
        let files = vec![("../evil".to_string(), b"x".to_vec())];
        let zip = write_download(io::Cursor::new(Vec::new()), &files).unwrap();
        let mut media = MemoryMedia::new();
        let err = extract_download(io::Cursor::new(zip.into_inner()), &mut media).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}
