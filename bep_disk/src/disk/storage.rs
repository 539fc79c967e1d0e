use std::cmp;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::hash::DigestKind;
use crate::disk::fs::FileSystem;
use crate::disk::FileFlags;
use crate::error::{TorrentError, TorrentErrorKind, TorrentResult};

use bep_util::bt::InfoHash;

/// One file backing a torrent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageFile {
    /// Path of the file, relative to the torrent directory.
    pub path: PathBuf,
    /// Length of the file in bytes.
    pub length: u64,
}

/// Layout of the files backing a torrent.
///
/// This is the flattened form of a metainfo dictionary; parsing the
/// dictionary itself is the caller's concern.
#[derive(Clone, Debug)]
pub struct StorageLayout {
    info_hash: InfoHash,
    piece_length: u64,
    files: Vec<StorageFile>,
    digest_kind: DigestKind,
}

impl StorageLayout {
    /// Create a new StorageLayout with the v1 piece digest.
    pub fn new(info_hash: InfoHash, piece_length: u64, files: Vec<StorageFile>) -> StorageLayout {
        StorageLayout { info_hash, piece_length, files, digest_kind: DigestKind::Sha1 }
    }

    /// Use a different piece digest, v2 torrents hash with SHA-256.
    pub fn with_digest_kind(mut self, digest_kind: DigestKind) -> StorageLayout {
        self.digest_kind = digest_kind;
        self
    }

    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    pub fn digest_kind(&self) -> DigestKind {
        self.digest_kind
    }

    /// Number of 16 KiB blocks in the given piece.
    pub fn blocks_in_piece(&self, piece: u64) -> usize {
        (self.piece_size(piece) + crate::BLOCK_SIZE - 1) / crate::BLOCK_SIZE
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn files(&self) -> &[StorageFile] {
        &self.files
    }

    /// Total length of all files in the layout.
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|file| file.length).sum()
    }

    /// Number of pieces in the layout.
    pub fn num_pieces(&self) -> u64 {
        let total = self.total_length();

        (total + self.piece_length - 1) / self.piece_length
    }

    /// Length in bytes of the given piece, the last piece may be short.
    pub fn piece_size(&self, piece: u64) -> usize {
        let total = self.total_length();
        let start = piece * self.piece_length;

        cmp::min(self.piece_length, total - start) as usize
    }
}

//----------------------------------------------------------------------------//

/// Status of a fastresume check against the files on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FastresumeStatus {
    /// Files on disk are consistent with the resume data.
    Valid,
    /// A file size did not match the resume data.
    Rejected { file_index: usize },
}

/// Flattened resume state for a torrent.
///
/// The piece bitfield is opaque to the disk layer; it is carried for the
/// layer above which owns piece verification state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResumeData {
    pub file_sizes: Vec<u64>,
    pub pieces: Vec<u8>,
}

//----------------------------------------------------------------------------//

/// Piece addressed view over the files of a single torrent.
///
/// Translates (piece, offset, length) spans into per file regions and
/// performs scatter/gather I/O against the wrapped `FileSystem`.
pub struct TorrentStorage<F> {
    layout: StorageLayout,
    fs: Arc<F>,
    directory: PathBuf,
    priorities: Vec<u8>,
}

impl<F> TorrentStorage<F>
where
    F: FileSystem,
{
    /// Create a new TorrentStorage rooted at the given directory.
    pub fn new(layout: StorageLayout, fs: Arc<F>, directory: PathBuf) -> TorrentStorage<F> {
        let num_files = layout.files().len();

        TorrentStorage {
            layout,
            fs,
            directory,
            priorities: vec![1u8; num_files],
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn priorities(&self) -> &[u8] {
        &self.priorities
    }

    fn file_path(&self, file: &StorageFile) -> PathBuf {
        build_path(&self.directory, &file.path)
    }

    /// Read a (piece, offset) span into the given scatter list.
    ///
    /// Every buffer in the list is filled completely; the span length is the
    /// sum of the buffer lengths.
    pub fn readv(&self, bufs: &mut [&mut [u8]], piece: u64, offset: u64, _flags: FileFlags) -> io::Result<usize> {
        let length: usize = bufs.iter().map(|buf| buf.len()).sum();
        let regions = self.collect_file_regions(piece, offset, length)?;

        for (path, file_offset, begin, end) in regions {
            let mut file = self.fs.open_file(path)?;

            let mut logical = 0;
            for buf in bufs.iter_mut() {
                let (buf_begin, buf_end) = (logical, logical + buf.len());
                logical = buf_end;

                if buf_end <= begin || buf_begin >= end {
                    continue;
                }
                let chunk_begin = cmp::max(begin, buf_begin) - buf_begin;
                let chunk_end = cmp::min(end, buf_end) - buf_begin;
                let read_offset = file_offset + (buf_begin + chunk_begin - begin) as u64;

                let chunk = &mut buf[chunk_begin..chunk_end];
                let bytes_read = self.fs.read_file(&mut file, read_offset, chunk)?;
                if bytes_read != chunk.len() {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Short Read From Storage File"));
                }
            }
        }

        Ok(length)
    }

    /// Write the given scatter list to a (piece, offset) span.
    pub fn writev(&self, bufs: &[&[u8]], piece: u64, offset: u64, _flags: FileFlags) -> io::Result<usize> {
        let length: usize = bufs.iter().map(|buf| buf.len()).sum();
        let regions = self.collect_file_regions(piece, offset, length)?;

        for (path, file_offset, begin, end) in regions {
            let mut file = self.fs.open_file(path)?;

            let mut logical = 0;
            for buf in bufs.iter() {
                let (buf_begin, buf_end) = (logical, logical + buf.len());
                logical = buf_end;

                if buf_end <= begin || buf_begin >= end {
                    continue;
                }
                let chunk_begin = cmp::max(begin, buf_begin) - buf_begin;
                let chunk_end = cmp::min(end, buf_end) - buf_begin;
                let write_offset = file_offset + (buf_begin + chunk_begin - begin) as u64;

                let chunk = &buf[chunk_begin..chunk_end];
                let bytes_written = self.fs.write_file(&mut file, write_offset, chunk)?;
                if bytes_written != chunk.len() {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "Short Write To Storage File"));
                }
            }
        }

        Ok(length)
    }

    /// Move every file of the torrent under the new directory.
    pub fn move_storage(&mut self, new_dir: PathBuf) -> TorrentResult<()> {
        for file in self.layout.files() {
            let from = build_path(&self.directory, &file.path);
            let to = build_path(&new_dir, &file.path);

            self.fs.rename_file(from, to)?;
        }
        self.directory = new_dir;

        Ok(())
    }

    /// Rename a single file of the torrent.
    pub fn rename_file(&mut self, index: usize, new_name: PathBuf) -> TorrentResult<()> {
        if index >= self.layout.files.len() {
            return Err(TorrentError::from_kind(TorrentErrorKind::InvalidFileIndex { index }));
        }
        let from = self.file_path(&self.layout.files[index]);
        let to = build_path(&self.directory, &new_name);

        self.fs.rename_file(from, to)?;
        self.layout.files[index].path = new_name;

        Ok(())
    }

    /// Delete every file of the torrent.
    ///
    /// Deletion is attempted for every file even if an earlier one fails;
    /// the first error is reported.
    pub fn delete_files(&self) -> TorrentResult<()> {
        let mut first_error = None;

        for file in self.layout.files() {
            let result = self.fs.remove_file(self.file_path(file));

            if let (Err(err), None) = (result, first_error.as_ref()) {
                first_error = Some(err);
            }
        }

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Drop process held resources for every file of the torrent.
    pub fn release_files(&self) {
        for file in self.layout.files() {
            self.fs.release_file(self.file_path(file));
        }
    }

    /// Validate the files on disk against the given resume data.
    ///
    /// Files that do not exist yet are created and zero filled like a fresh
    /// add; a file that exists with an unexpected size rejects the resume.
    pub fn check_fastresume(&self, resume: &ResumeData) -> TorrentResult<FastresumeStatus> {
        if resume.file_sizes.len() != self.layout.files.len() {
            return Ok(FastresumeStatus::Rejected { file_index: 0 });
        }

        for (index, file) in self.layout.files().iter().enumerate() {
            let fs_file = self.fs.open_file(self.file_path(file))?;
            let actual_size = self.fs.file_size(&fs_file)?;

            if actual_size != 0 && actual_size != resume.file_sizes[index] {
                return Ok(FastresumeStatus::Rejected { file_index: index });
            }
        }

        Ok(FastresumeStatus::Valid)
    }

    /// Snapshot the current on disk state as resume data.
    ///
    /// The piece bitfield is left empty; verification state lives above the
    /// disk layer and is merged in by the caller.
    pub fn write_resume_data(&self) -> TorrentResult<ResumeData> {
        let mut file_sizes = Vec::with_capacity(self.layout.files.len());

        for file in self.layout.files() {
            let fs_file = self.fs.open_file(self.file_path(file))?;

            file_sizes.push(self.fs.file_size(&fs_file)?);
        }

        Ok(ResumeData { file_sizes, pieces: Vec::new() })
    }

    /// Validate the file sizes for the torrent, zero filling fresh files.
    ///
    /// This function will, if the file does not exist, or exists and is zero
    /// size, fill the file with zeroes. Otherwise, if the file exists and it
    /// is of the correct size, it will be left alone. If it is of the wrong
    /// size, an error will be thrown as we do not want to overwrite an
    /// existing file that maybe just had the same name as a file in our
    /// layout.
    pub fn validate_file_sizes(&self) -> TorrentResult<()> {
        for file in self.layout.files() {
            let file_path = self.file_path(file);
            let expected_size = file.length;

            let mut fs_file = self.fs.open_file(file_path.clone())?;
            let actual_size = self.fs.file_size(&fs_file)?;

            let size_matches = actual_size == expected_size;
            let size_is_zero = actual_size == 0;

            if !size_matches && size_is_zero && expected_size > 0 {
                self.fs.write_file(&mut fs_file, expected_size - 1, &[0])?;
            } else if !size_matches && !size_is_zero {
                return Err(TorrentError::from_kind(TorrentErrorKind::ExistingFileSizeCheck {
                    file_path,
                    expected_size,
                    actual_size,
                }));
            }
        }

        Ok(())
    }

    /// Record new download priorities for the torrent's files.
    pub fn set_file_priority(&mut self, priorities: Vec<u8>) -> TorrentResult<()> {
        if priorities.len() != self.layout.files.len() {
            return Err(TorrentError::from_kind(TorrentErrorKind::InvalidFileIndex {
                index: priorities.len(),
            }));
        }
        self.priorities = priorities;

        Ok(())
    }

    /// Flush and drop resources for a finished file.
    pub fn finalize_file(&self, index: usize) -> TorrentResult<()> {
        if index >= self.layout.files.len() {
            return Err(TorrentError::from_kind(TorrentErrorKind::InvalidFileIndex { index }));
        }
        let path = self.file_path(&self.layout.files[index]);

        self.fs.sync_file(path.clone())?;
        self.fs.release_file(path);

        Ok(())
    }

    /// Give the storage a chance to do periodic work.
    ///
    /// Returns true if the storage wants another tick.
    pub fn tick(&mut self) -> bool {
        false
    }

    /// Collect the file regions covering the span (piece, offset, length).
    ///
    /// Each region is (file path, file offset, span begin, span end) where
    /// begin (inclusive) and end (exclusive) index the logical span bytes.
    fn collect_file_regions(&self, piece: u64, offset: u64, length: usize) -> io::Result<Vec<(PathBuf, u64, usize, usize)>> {
        let mut regions = Vec::new();

        let mut total_bytes_to_skip = (piece * self.layout.piece_length) + offset;
        let mut total_bytes_accessed = 0u64;
        let total_span_length = length as u64;

        for file in self.layout.files() {
            let total_file_size = file.length;

            let mut bytes_to_access = total_file_size;
            let min_bytes_to_skip = cmp::min(total_bytes_to_skip, bytes_to_access);

            total_bytes_to_skip -= min_bytes_to_skip;
            bytes_to_access -= min_bytes_to_skip;

            if bytes_to_access > 0 && total_bytes_accessed < total_span_length {
                let file_path = self.file_path(file);

                let total_max_bytes_to_access = total_span_length - total_bytes_accessed;
                let actual_bytes_to_access = cmp::min(total_max_bytes_to_access, bytes_to_access);
                let file_offset = total_file_size - bytes_to_access;

                let (begin, end) = (
                    total_bytes_accessed as usize,
                    (total_bytes_accessed + actual_bytes_to_access) as usize,
                );
                regions.push((file_path, file_offset, begin, end));
                total_bytes_accessed += actual_bytes_to_access;
            }
        }

        if total_bytes_accessed != total_span_length {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Span Extends Past The Torrent Files"));
        }

        Ok(regions)
    }
}

/// Create a path from the base directory and a relative file path.
fn build_path(directory: &Path, file_path: &Path) -> PathBuf {
    let mut full_path = directory.to_path_buf();

    for file_path_piece in file_path.iter() {
        full_path.push(file_path_piece);
    }

    full_path
}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use super::{FastresumeStatus, ResumeData, StorageFile, StorageLayout, TorrentStorage};
    use crate::disk::fs::FileSystem;
    use crate::disk::FileFlags;

    #[derive(Clone, Default)]
    struct MemoryFileSystem {
        files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
    }

    struct MemoryFile {
        path: PathBuf,
    }

    impl MemoryFileSystem {
        fn with_files<C, R>(&self, call: C) -> R
        where
            C: FnOnce(&mut HashMap<PathBuf, Vec<u8>>) -> R,
        {
            call(&mut *self.files.lock().unwrap())
        }
    }

    impl FileSystem for MemoryFileSystem {
        type File = MemoryFile;

        fn open_file<P>(&self, path: P) -> io::Result<Self::File>
        where
            P: AsRef<Path> + Send + 'static,
        {
            let file_path = path.as_ref().to_path_buf();
            self.with_files(|files| {
                files.entry(file_path.clone()).or_insert_with(Vec::new);
            });

            Ok(MemoryFile { path: file_path })
        }

        fn sync_file<P>(&self, _path: P) -> io::Result<()>
        where
            P: AsRef<Path> + Send + 'static,
        {
            Ok(())
        }

        fn remove_file<P>(&self, path: P) -> io::Result<()>
        where
            P: AsRef<Path> + Send + 'static,
        {
            self.with_files(|files| {
                files
                    .remove(path.as_ref())
                    .map(|_| ())
                    .ok_or(io::Error::new(io::ErrorKind::NotFound, "File Not Found"))
            })
        }

        fn rename_file<P, Q>(&self, from: P, to: Q) -> io::Result<()>
        where
            P: AsRef<Path> + Send + 'static,
            Q: AsRef<Path> + Send + 'static,
        {
            self.with_files(|files| {
                let contents = files
                    .remove(from.as_ref())
                    .ok_or(io::Error::new(io::ErrorKind::NotFound, "File Not Found"))?;
                files.insert(to.as_ref().to_path_buf(), contents);

                Ok(())
            })
        }

        fn file_size(&self, file: &Self::File) -> io::Result<u64> {
            self.with_files(|files| {
                files
                    .get(&file.path)
                    .map(|contents| contents.len() as u64)
                    .ok_or(io::Error::new(io::ErrorKind::NotFound, "File Not Found"))
            })
        }

        fn read_file(&self, file: &mut Self::File, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
            self.with_files(|files| {
                let contents = files
                    .get(&file.path)
                    .ok_or(io::Error::new(io::ErrorKind::NotFound, "File Not Found"))?;

                let offset = offset as usize;
                let available = contents.len().saturating_sub(offset);
                let count = std::cmp::min(available, buffer.len());
                buffer[..count].copy_from_slice(&contents[offset..offset + count]);

                Ok(count)
            })
        }

        fn write_file(&self, file: &mut Self::File, offset: u64, buffer: &[u8]) -> io::Result<usize> {
            self.with_files(|files| {
                let contents = files
                    .get_mut(&file.path)
                    .ok_or(io::Error::new(io::ErrorKind::NotFound, "File Not Found"))?;

                let offset = offset as usize;
                if offset + buffer.len() > contents.len() {
                    contents.resize(offset + buffer.len(), 0);
                }
                contents[offset..offset + buffer.len()].copy_from_slice(buffer);

                Ok(buffer.len())
            })
        }
    }

    /// Two files of 3000 and 5000 bytes under 2048 byte pieces.
    fn two_file_storage() -> TorrentStorage<MemoryFileSystem> {
        let layout = StorageLayout::new(
            [7u8; 20].into(),
            2048,
            vec![
                StorageFile { path: "a.bin".into(), length: 3000 },
                StorageFile { path: "b.bin".into(), length: 5000 },
            ],
        );

        let storage = TorrentStorage::new(layout, Arc::new(MemoryFileSystem::default()), PathBuf::new());
        storage.validate_file_sizes().unwrap();

        storage
    }

    #[test]
    fn positive_layout_geometry() {
        let layout = StorageLayout::new([1u8; 20].into(), 2048, vec![
            StorageFile { path: "a.bin".into(), length: 3000 },
            StorageFile { path: "b.bin".into(), length: 5000 },
        ]);

        assert_eq!(8000, layout.total_length());
        assert_eq!(4, layout.num_pieces());
        assert_eq!(2048, layout.piece_size(0));
        // The final piece only covers the remainder.
        assert_eq!(8000 - 3 * 2048, layout.piece_size(3));
        assert_eq!(1, layout.blocks_in_piece(0));
    }

    #[test]
    fn positive_writev_readv_across_file_boundary() {
        let storage = two_file_storage();

        // Piece one spans bytes 2048..4096, crossing the 3000 byte seam.
        let data: Vec<u8> = (0..2048u32).map(|index| index as u8).collect();
        let written = storage.writev(&[&data[..1000], &data[1000..]], 1, 0, FileFlags::empty()).unwrap();
        assert_eq!(2048, written);

        let mut first = vec![0u8; 500];
        let mut second = vec![0u8; 1548];
        {
            let mut bufs = [&mut first[..], &mut second[..]];
            let read = storage.readv(&mut bufs, 1, 0, FileFlags::empty()).unwrap();
            assert_eq!(2048, read);
        }

        let mut round_trip = first;
        round_trip.extend_from_slice(&second);
        assert_eq!(data, round_trip);
    }

    #[test]
    fn positive_move_storage_relocates_files() {
        let mut storage = two_file_storage();
        let fs = storage.fs.clone();

        storage.move_storage(PathBuf::from("elsewhere")).unwrap();

        fs.with_files(|files| {
            assert!(files.contains_key(&PathBuf::from("elsewhere/a.bin")));
            assert!(files.contains_key(&PathBuf::from("elsewhere/b.bin")));
            assert!(!files.contains_key(&PathBuf::from("a.bin")));
        });
    }

    #[test]
    fn positive_rename_and_delete() {
        let mut storage = two_file_storage();
        let fs = storage.fs.clone();

        storage.rename_file(0, PathBuf::from("renamed.bin")).unwrap();
        fs.with_files(|files| {
            assert!(files.contains_key(&PathBuf::from("renamed.bin")));
        });

        storage.delete_files().unwrap();
        fs.with_files(|files| assert!(files.is_empty()));
    }

    #[test]
    fn negative_rename_bad_index() {
        let mut storage = two_file_storage();

        assert!(storage.rename_file(5, PathBuf::from("nope.bin")).is_err());
    }

    #[test]
    fn positive_fastresume_round_trip() {
        let storage = two_file_storage();

        let resume = storage.write_resume_data().unwrap();
        assert_eq!(vec![3000, 5000], resume.file_sizes);

        assert_eq!(FastresumeStatus::Valid, storage.check_fastresume(&resume).unwrap());

        let stale = ResumeData { file_sizes: vec![3000, 4000], pieces: Vec::new() };
        assert_eq!(
            FastresumeStatus::Rejected { file_index: 1 },
            storage.check_fastresume(&stale).unwrap()
        );
    }

    #[test]
    fn positive_finalize_file_and_priorities() {
        let mut storage = two_file_storage();

        storage.finalize_file(1).unwrap();
        assert!(storage.finalize_file(9).is_err());

        storage.set_file_priority(vec![0, 4]).unwrap();
        assert_eq!(&[0, 4], storage.priorities());
        assert!(storage.set_file_priority(vec![1]).is_err());
    }
}
