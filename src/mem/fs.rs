//! littlefs session over the external flash.
//!
//! A littlefs2 [`Filesystem`] borrows its storage for as long as it is
//! mounted, so [`FlashFs`] owns the block device and mounts it for the
//! duration of each call. Open files are kept here as a path and a position
//! and reopened per operation. Writes collect in a per-file buffer that is
//! committed a block at a time and on `sync`/`close`.

use alloc::vec::Vec;
use core::fmt::Write as _;

use bitflags::bitflags;
use heapless::String;
use littlefs2::driver::Storage;
use littlefs2::fs::{DirEntry as LfsDirEntry, Filesystem};
use littlefs2::io::{
    Error as LfsError, Read as _, Result as LfsResult, Seek as _, SeekFrom as LfsSeekFrom,
    Write as _,
};
use littlefs2::path::PathBuf;
use log::{debug, error, info, warn};

use crate::cfg::fs_cfg::{NAME_MAX, PATH_MAX, UPLOADS_DIR, WRITE_BUFFER, WWW_DIR};

pub const MAX_OPEN_FILES: usize = 4;

/// littlefs error codes, kept as integers in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("input/output error")]
    Io,
    #[error("corrupted filesystem")]
    Corrupt,
    #[error("no such file or directory")]
    NoEntry,
    #[error("entry already exists")]
    Exists,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("bad file handle")]
    BadFd,
    #[error("file too large")]
    TooBig,
    #[error("invalid argument")]
    Invalid,
    #[error("no space left on device")]
    NoSpace,
    #[error("out of memory")]
    NoMemory,
    #[error("name too long")]
    NameTooLong,
    #[error("too many open files")]
    NoFileSlots,
}

impl FsError {
    pub fn code(self) -> i32 {
        match self {
            FsError::Io => -5,
            FsError::Corrupt => -84,
            FsError::NoEntry => -2,
            FsError::Exists => -17,
            FsError::NotDir => -20,
            FsError::IsDir => -21,
            FsError::NotEmpty => -39,
            FsError::BadFd => -9,
            FsError::TooBig => -27,
            FsError::Invalid => -22,
            FsError::NoSpace => -28,
            FsError::NoMemory => -12,
            FsError::NameTooLong => -36,
            FsError::NoFileSlots => -24,
        }
    }
}

impl From<LfsError> for FsError {
    fn from(e: LfsError) -> Self {
        const CODES: [(LfsError, FsError); 13] = [
            (LfsError::IO, FsError::Io),
            (LfsError::CORRUPTION, FsError::Corrupt),
            (LfsError::NO_SUCH_ENTRY, FsError::NoEntry),
            (LfsError::ENTRY_ALREADY_EXISTED, FsError::Exists),
            (LfsError::PATH_NOT_DIR, FsError::NotDir),
            (LfsError::PATH_IS_DIR, FsError::IsDir),
            (LfsError::DIR_NOT_EMPTY, FsError::NotEmpty),
            (LfsError::BAD_FILE_DESCRIPTOR, FsError::BadFd),
            (LfsError::FILE_TOO_BIG, FsError::TooBig),
            (LfsError::INVALID, FsError::Invalid),
            (LfsError::NO_SPACE, FsError::NoSpace),
            (LfsError::NO_MEMORY, FsError::NoMemory),
            (LfsError::FILENAME_TOO_LONG, FsError::NameTooLong),
        ];
        match CODES.iter().find(|(lfs, _)| *lfs == e) {
            Some((_, fs)) => *fs,
            None => {
                warn!("[FS] Unexpected littlefs error {e:?}");
                FsError::Io
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("filesystem not mounted")]
    NotMounted,
    /// Mount failed again after a recovery format; not retried.
    #[error("filesystem unavailable: {0}")]
    Unavailable(FsError),
    #[error(transparent)]
    Fs(#[from] FsError),
}

impl StorageError {
    /// littlefs error code, `-5` (I/O) for conditions without one.
    pub fn code(self) -> i32 {
        match self {
            StorageError::NotMounted => FsError::Io.code(),
            StorageError::Unavailable(e) | StorageError::Fs(e) => e.code(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub kind: FileKind,
    pub size: u32,
}

impl From<littlefs2::fs::Metadata> for Metadata {
    fn from(meta: littlefs2::fs::Metadata) -> Self {
        Self {
            kind: if meta.is_dir() {
                FileKind::Dir
            } else {
                FileKind::File
            },
            size: meta.len() as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String<NAME_MAX>,
    pub kind: FileKind,
    pub size: u32,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u8 {
        const READ = 0x01;
        /// Read-write access.
        const WRITE = 0x02;
        const CREATE = 0x04;
        const TRUNC = 0x08;
        const APPEND = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u32),
    End(i32),
    Current(i32),
}

#[derive(Debug)]
struct OpenFile {
    path: PathBuf,
    generation: u32,
    flags: OpenFlags,
    pos: usize,
    /// Bytes written but not yet handed to littlefs, destined for `pending_at..`.
    pending: Vec<u8>,
    pending_at: usize,
}

/// An open file on a [`FlashFs`] session.
///
/// Not `Clone`; `close` consumes it. After an unmount or format every
/// operation on it fails with `BadFd`.
#[derive(Debug)]
pub struct FileHandle {
    slot: u8,
    generation: u32,
    after_reformat: bool,
}

impl FileHandle {
    /// The whole volume was formatted to obtain this handle, so nothing
    /// previously stored survives.
    pub fn after_reformat(&self) -> bool {
        self.after_reformat
    }
}

/// Owner of the external flash filesystem.
///
/// There is one session per device; it is not `Clone` and tasks share it
/// behind a mutex. Data still buffered in open files is lost if the session
/// is dropped without closing them, as with a power cut.
pub struct FlashFs<S: Storage> {
    storage: S,
    mounted: bool,
    files: [Option<OpenFile>; MAX_OPEN_FILES],
    generation: u32,
}

fn with_fs<S: Storage, R>(
    storage: &mut S,
    f: impl FnOnce(&Filesystem<'_, S>) -> LfsResult<R>,
) -> Result<R, FsError> {
    Ok(Filesystem::mount_and_then(storage, f)?)
}

fn lfs_path(path: &str) -> Result<PathBuf, FsError> {
    for part in path.split('/') {
        if part == ".." {
            return Err(FsError::Invalid);
        }
        if part.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
    }
    if path.len() > PATH_MAX {
        return Err(FsError::NameTooLong);
    }
    PathBuf::try_from(path).map_err(|_| FsError::Invalid)
}

fn entry(raw: LfsDirEntry) -> LfsResult<Option<DirEntry>> {
    let name = raw.file_name().as_str();
    if name == "." || name == ".." {
        return Ok(None);
    }
    let meta = Metadata::from(raw.metadata());
    Ok(Some(DirEntry {
        name: String::try_from(name).map_err(|_| LfsError::FILENAME_TOO_LONG)?,
        kind: meta.kind,
        size: meta.size,
    }))
}

fn open_in_place<S: Storage>(storage: &mut S, path: &PathBuf, flags: OpenFlags) -> Result<(), FsError> {
    let write = flags.intersects(OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNC);
    with_fs(storage, |fs| {
        fs.open_file_with_options_and_then(
            |o| {
                o.read(true)
                    .write(write)
                    .create(flags.contains(OpenFlags::CREATE))
                    .truncate(flags.contains(OpenFlags::TRUNC))
            },
            path,
            |_| Ok(()),
        )
    })
}

/// Hand buffered bytes to littlefs and commit them.
fn flush<S: Storage>(storage: &mut S, file: &mut OpenFile) -> Result<(), FsError> {
    if file.pending.is_empty() {
        return Ok(());
    }
    let at = file.pending_at as u32;
    let pending = core::mem::take(&mut file.pending);
    with_fs(storage, |fs| {
        fs.open_file_with_options_and_then(
            |o| o.write(true),
            &file.path,
            |f| {
                f.seek(LfsSeekFrom::Start(at))?;
                let mut rest = &pending[..];
                while !rest.is_empty() {
                    match f.write(rest)? {
                        0 => return Err(LfsError::NO_SPACE),
                        n => rest = &rest[n..],
                    }
                }
                Ok(())
            },
        )
    })
    .inspect_err(|e| error!("[FS] Lost {} bytes for {}: {e}", pending.len(), file.path.as_str()))?;
    debug!("[FS] Committed {} bytes to {}", pending.len(), file.path.as_str());
    Ok(())
}

/// Committed length plus anything still buffered past it.
fn length<S: Storage>(storage: &mut S, file: &OpenFile) -> Result<usize, FsError> {
    let committed = with_fs(storage, |fs| fs.metadata(&file.path))?.len();
    let buffered = match file.pending.len() {
        0 => 0,
        n => file.pending_at + n,
    };
    Ok(committed.max(buffered))
}

fn file_mut<'f>(
    files: &'f mut [Option<OpenFile>; MAX_OPEN_FILES],
    handle: &FileHandle,
) -> Result<&'f mut OpenFile, FsError> {
    files
        .get_mut(handle.slot as usize)
        .and_then(Option::as_mut)
        .filter(|file| file.generation == handle.generation)
        .ok_or(FsError::BadFd)
}

impl<S: Storage> FlashFs<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            mounted: false,
            files: Default::default(),
            generation: 0,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    fn ensure_mounted(&self) -> StorageResult<()> {
        if self.mounted {
            Ok(())
        } else {
            Err(StorageError::NotMounted)
        }
    }

    /// Mount, formatting and retrying once if the image is unusable.
    pub fn mount(&mut self) -> StorageResult<()> {
        if self.mounted {
            return Ok(());
        }
        if let Err(e) = with_fs(&mut self.storage, |_| Ok(())) {
            warn!("[FS] Mount failed ({e}), formatting");
            Filesystem::format(&mut self.storage).map_err(|e| {
                let e = FsError::from(e);
                error!("[FS] Format failed: {e}");
                StorageError::Unavailable(e)
            })?;
            with_fs(&mut self.storage, |_| Ok(())).map_err(|e| {
                error!("[FS] Mount failed after format: {e}");
                StorageError::Unavailable(e)
            })?;
        }
        self.mounted = true;
        self.bootstrap()?;
        info!("[FS] Filesystem mounted");
        Ok(())
    }

    fn bootstrap(&mut self) -> StorageResult<()> {
        for dir in [UPLOADS_DIR, WWW_DIR] {
            let path = lfs_path(dir)?;
            match with_fs(&mut self.storage, |fs| fs.create_dir(&path)) {
                Ok(()) => info!("[FS] Created {dir}"),
                Err(FsError::Exists) => {}
                Err(e) => {
                    error!("[FS] Failed to create {dir}: {e}");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Commit buffered writes, invalidate every handle and detach.
    /// A no-op when not mounted.
    pub fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        for slot in self.files.iter_mut() {
            if let Some(mut file) = slot.take() {
                // flush logs what it could not commit
                let _ = flush(&mut self.storage, &mut file);
            }
        }
        self.mounted = false;
        info!("[FS] Filesystem unmounted");
    }

    /// Erase the volume. Leaves the session unmounted.
    pub fn format(&mut self) -> StorageResult<()> {
        self.unmount();
        Filesystem::format(&mut self.storage).map_err(|e| {
            let e = FsError::from(e);
            error!("[FS] Format failed: {e}");
            StorageError::Fs(e)
        })?;
        info!("[FS] Filesystem formatted");
        Ok(())
    }

    pub fn format_and_mount(&mut self) -> StorageResult<()> {
        self.format()?;
        self.mount()
    }

    /// Unmount and hand back the block device.
    pub fn release(mut self) -> S {
        self.unmount();
        self.storage
    }

    /// Open `path`. A corrupt volume costs a full reformat, reported through
    /// [`FileHandle::after_reformat`].
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> StorageResult<FileHandle> {
        self.ensure_mounted()?;
        let lfs = lfs_path(path)?;
        let slot = self
            .files
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::NoFileSlots)?;

        let after_reformat = match open_in_place(&mut self.storage, &lfs, flags) {
            Ok(()) => false,
            Err(FsError::Corrupt) => {
                error!("[FS] {path} is corrupt, reformatting the volume");
                self.format_and_mount()?;
                open_in_place(&mut self.storage, &lfs, flags)?;
                true
            }
            Err(e) => return Err(e.into()),
        };

        self.generation = self.generation.wrapping_add(1);
        self.files[slot] = Some(OpenFile {
            path: lfs,
            generation: self.generation,
            flags,
            pos: 0,
            pending: Vec::new(),
            pending_at: 0,
        });
        Ok(FileHandle {
            slot: slot as u8,
            generation: self.generation,
            after_reformat,
        })
    }

    /// Commit and release the handle. The slot is freed even if the commit fails.
    pub fn close(&mut self, handle: FileHandle) -> StorageResult<()> {
        self.ensure_mounted()?;
        let mut file = match self.files.get_mut(handle.slot as usize) {
            Some(slot) if slot.as_ref().is_some_and(|f| f.generation == handle.generation) => {
                slot.take()
            }
            _ => None,
        }
        .ok_or(FsError::BadFd)?;
        Ok(flush(&mut self.storage, &mut file)?)
    }

    pub fn read(&mut self, handle: &FileHandle, buf: &mut [u8]) -> StorageResult<usize> {
        self.ensure_mounted()?;
        let file = file_mut(&mut self.files, handle)?;
        flush(&mut self.storage, file)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let pos = file.pos as u32;
        let n = with_fs(&mut self.storage, |fs| {
            fs.open_file_with_options_and_then(
                |o| o.read(true),
                &file.path,
                |f| {
                    f.seek(LfsSeekFrom::Start(pos))?;
                    f.read(buf)
                },
            )
        })?;
        file.pos += n;
        Ok(n)
    }

    /// Read up to `buf.len() - 1` bytes and terminate them with a zero.
    /// Returns the byte count, 0 at end of data.
    pub fn read_as_string(&mut self, handle: &FileHandle, buf: &mut [u8]) -> StorageResult<usize> {
        let Some(last) = buf.len().checked_sub(1) else {
            return Err(FsError::Invalid.into());
        };
        let n = self.read(handle, &mut buf[..last])?;
        buf[n] = 0;
        Ok(n)
    }

    pub fn write(&mut self, handle: &FileHandle, data: &[u8]) -> StorageResult<usize> {
        self.ensure_mounted()?;
        let file = file_mut(&mut self.files, handle)?;
        if !file.flags.contains(OpenFlags::WRITE) {
            return Err(FsError::BadFd.into());
        }
        if file.flags.contains(OpenFlags::APPEND) && file.pending.is_empty() {
            file.pos = length(&mut self.storage, file)?;
        }
        if !file.pending.is_empty() && file.pending_at + file.pending.len() != file.pos {
            flush(&mut self.storage, file)?;
        }
        if file.pending.is_empty() {
            file.pending_at = file.pos;
        }
        file.pending.extend_from_slice(data);
        file.pos += data.len();
        if file.pending.len() >= WRITE_BUFFER {
            flush(&mut self.storage, file)?;
        }
        Ok(data.len())
    }

    pub fn seek(&mut self, handle: &FileHandle, pos: SeekFrom) -> StorageResult<u32> {
        self.ensure_mounted()?;
        let file = file_mut(&mut self.files, handle)?;
        let target = match pos {
            SeekFrom::Start(n) => Some(n as usize),
            SeekFrom::Current(delta) => file.pos.checked_add_signed(delta as isize),
            SeekFrom::End(delta) => {
                length(&mut self.storage, file)?.checked_add_signed(delta as isize)
            }
        };
        let target = target
            .filter(|&t| t <= u32::MAX as usize)
            .ok_or(FsError::Invalid)?;
        file.pos = target;
        Ok(target as u32)
    }

    pub fn size(&mut self, handle: &FileHandle) -> StorageResult<u32> {
        self.ensure_mounted()?;
        let file = file_mut(&mut self.files, handle)?;
        Ok(length(&mut self.storage, file)? as u32)
    }

    pub fn sync(&mut self, handle: &FileHandle) -> StorageResult<()> {
        self.ensure_mounted()?;
        let file = file_mut(&mut self.files, handle)?;
        Ok(flush(&mut self.storage, file)?)
    }

    pub fn mkdir(&mut self, path: &str) -> StorageResult<()> {
        self.ensure_mounted()?;
        let path = lfs_path(path)?;
        Ok(with_fs(&mut self.storage, |fs| fs.create_dir(&path))?)
    }

    /// Remove a file or an empty directory.
    pub fn remove(&mut self, path: &str) -> StorageResult<()> {
        self.ensure_mounted()?;
        let path = lfs_path(path)?;
        Ok(with_fs(&mut self.storage, |fs| fs.remove(&path))?)
    }

    /// Move `from` to `to`, replacing a file or empty directory at `to`.
    pub fn rename(&mut self, from: &str, to: &str) -> StorageResult<()> {
        self.ensure_mounted()?;
        let (from, to) = (lfs_path(from)?, lfs_path(to)?);
        Ok(with_fs(&mut self.storage, |fs| fs.rename(&from, &to))?)
    }

    pub fn stat(&mut self, path: &str) -> StorageResult<Metadata> {
        self.ensure_mounted()?;
        let path = lfs_path(path)?;
        Ok(with_fs(&mut self.storage, |fs| fs.metadata(&path))?.into())
    }

    pub fn exists(&mut self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    /// Visit the entries of `path` in storage order, skipping `.` and `..`.
    pub fn read_dir<F>(&mut self, path: &str, mut visit: F) -> StorageResult<()>
    where
        F: FnMut(&DirEntry),
    {
        self.ensure_mounted()?;
        let path = lfs_path(path)?;
        with_fs(&mut self.storage, |fs| {
            fs.read_dir_and_then(&path, |dir| {
                for raw in dir {
                    if let Some(entry) = entry(raw?)? {
                        visit(&entry);
                    }
                }
                Ok(())
            })
        })?;
        Ok(())
    }

    /// Blocks in use.
    pub fn fs_size(&mut self) -> StorageResult<u32> {
        self.ensure_mounted()?;
        let free = with_fs(&mut self.storage, |fs| fs.available_blocks())?;
        Ok(S::BLOCK_COUNT.saturating_sub(free) as u32)
    }

    /// Walk the root and each top-level directory one level down, calling
    /// `visit(depth, entry)` in storage order.
    pub fn list_tree<F>(&mut self, mut visit: F) -> StorageResult<()>
    where
        F: FnMut(usize, &DirEntry),
    {
        self.ensure_mounted()?;
        let root = lfs_path("/")?;
        with_fs(&mut self.storage, |fs| {
            fs.read_dir_and_then(&root, |top| {
                for raw in top {
                    let Some(dir) = entry(raw?)? else { continue };
                    visit(0, &dir);
                    if dir.kind != FileKind::Dir {
                        continue;
                    }
                    let mut child: String<PATH_MAX> = String::new();
                    write!(child, "/{}", dir.name).map_err(|_| LfsError::FILENAME_TOO_LONG)?;
                    let child = PathBuf::try_from(child.as_str()).map_err(|_| LfsError::INVALID)?;
                    fs.read_dir_and_then(&child, |inner| {
                        for raw in inner {
                            if let Some(e) = entry(raw?)? {
                                visit(1, &e);
                            }
                        }
                        Ok(())
                    })?;
                }
                Ok(())
            })
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::block_device::FlashBlockDevice;
    use crate::mem::ex_flash::{FLASH_CAPACITY, W25Q128};
    use crate::mem::sim::SimFlash;
    use embedded_hal_mock::eh1::delay::NoopDelay;

    type Session = FlashFs<FlashBlockDevice<SimFlash, NoopDelay>>;

    fn session(sim: &SimFlash) -> Session {
        let flash = W25Q128::new(sim.clone(), NoopDelay::new());
        FlashFs::new(FlashBlockDevice::new(flash).unwrap())
    }

    fn mounted() -> (SimFlash, Session) {
        let sim = SimFlash::new(FLASH_CAPACITY);
        let mut fs = session(&sim);
        fs.mount().unwrap();
        (sim, fs)
    }

    fn contents(fs: &mut Session, path: &str) -> Vec<u8> {
        let h = fs.open(path, OpenFlags::READ).unwrap();
        let mut out = vec![0u8; fs.size(&h).unwrap() as usize];
        assert_eq!(fs.read(&h, &mut out).unwrap(), out.len());
        fs.close(h).unwrap();
        out
    }

    #[test]
    fn operations_need_a_mount() {
        let sim = SimFlash::new(FLASH_CAPACITY);
        let mut fs = session(&sim);
        assert!(!fs.is_mounted());
        assert_eq!(fs.mkdir("/x"), Err(StorageError::NotMounted));
        assert_eq!(
            fs.open("/x", OpenFlags::READ).map(|_| ()),
            Err(StorageError::NotMounted)
        );
    }

    #[test]
    fn mount_bootstraps_directories_once() {
        let (_sim, mut fs) = mounted();
        fs.unmount();
        fs.mount().unwrap();

        let mut seen = Vec::new();
        fs.list_tree(|depth, e| seen.push((depth, e.name.as_str().to_owned(), e.kind)))
            .unwrap();
        assert_eq!(
            seen,
            vec![
                (0, "uploads".to_owned(), FileKind::Dir),
                (0, "www".to_owned(), FileKind::Dir),
            ]
        );
    }

    #[test]
    fn broken_flash_is_unavailable_after_one_retry() {
        let sim = SimFlash::new(FLASH_CAPACITY);
        let mut fs = session(&sim);
        sim.set_ignore_write_enable(true);
        assert_eq!(fs.mount(), Err(StorageError::Unavailable(FsError::Io)));
        assert!(!fs.is_mounted());
    }

    #[test]
    fn read_as_string_terminates_and_rejects_empty_buffers() {
        let (_sim, mut fs) = mounted();
        let h = fs
            .open("/uploads/t.txt", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.write(&h, b"abcdef").unwrap();
        fs.close(h).unwrap();

        let h = fs.open("/uploads/t.txt", OpenFlags::READ).unwrap();
        assert_eq!(
            fs.read_as_string(&h, &mut []),
            Err(StorageError::Fs(FsError::Invalid))
        );
        let mut buf = [0xAAu8; 5];
        assert_eq!(fs.read_as_string(&h, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd\0");
        assert_eq!(fs.read_as_string(&h, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..3], b"ef\0");
        assert_eq!(fs.read_as_string(&h, &mut buf).unwrap(), 0);
        assert_eq!(buf[0], 0);
        fs.close(h).unwrap();
    }

    #[test]
    fn handles_do_not_survive_a_format() {
        let (_sim, mut fs) = mounted();
        let h = fs
            .open("/www/a", OpenFlags::READ | OpenFlags::CREATE)
            .unwrap();
        fs.format_and_mount().unwrap();
        assert_eq!(
            fs.read(&h, &mut [0u8; 4]),
            Err(StorageError::Fs(FsError::BadFd))
        );
        assert_eq!(fs.close(h), Err(StorageError::Fs(FsError::BadFd)));
    }

    #[test]
    fn release_returns_the_device_unmounted() {
        let (_sim, fs) = mounted();
        let mut dev = fs.release();
        let www = lfs_path("/www").unwrap();
        let meta = Filesystem::mount_and_then(&mut dev, |fs| fs.metadata(&www)).unwrap();
        assert!(meta.is_dir());
    }

    #[test]
    fn many_files_with_long_names_fit() {
        let (_sim, mut fs) = mounted();
        for i in 0..100 {
            let path = format!("/uploads/f{i}.txt");
            let h = fs
                .open(&path, OpenFlags::WRITE | OpenFlags::CREATE)
                .unwrap_or_else(|e| panic!("create #{i} failed: {e:?}"));
            fs.write(&h, path.as_bytes()).unwrap();
            fs.close(h).unwrap();
        }
        let long = "/uploads/holiday-photo-2026-10-18-evening.jpg";
        let h = fs.open(long, OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        fs.close(h).unwrap();
        let longest = format!("/www/{}", "n".repeat(200));
        let h = fs.open(&longest, OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        fs.close(h).unwrap();

        let mut names = 0;
        fs.read_dir("/uploads", |_| names += 1).unwrap();
        assert_eq!(names, 101);
        assert_eq!(contents(&mut fs, "/uploads/f42.txt"), b"/uploads/f42.txt");
        assert!(fs.fs_size().unwrap() < 64);
    }

    #[test]
    fn paths_are_checked_before_reaching_littlefs() {
        let (_sim, mut fs) = mounted();
        assert_eq!(
            fs.open("/www/../uploads/x", OpenFlags::READ).map(|_| ()),
            Err(StorageError::Fs(FsError::Invalid))
        );
        let too_long = format!("/www/{}", "n".repeat(NAME_MAX + 1));
        assert_eq!(fs.mkdir(&too_long), Err(StorageError::Fs(FsError::NameTooLong)));
        assert_eq!(
            fs.open("/uploads/none", OpenFlags::READ).map(|_| ()),
            Err(StorageError::Fs(FsError::NoEntry))
        );
    }

    #[test]
    fn buffered_writes_cross_block_boundaries() {
        let (_sim, mut fs) = mounted();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7) as u8).collect();
        let h = fs
            .open("/uploads/big.bin", OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNC)
            .unwrap();
        for chunk in data.chunks(512) {
            assert_eq!(fs.write(&h, chunk).unwrap(), chunk.len());
        }
        assert_eq!(fs.size(&h).unwrap(), 10_000);
        fs.close(h).unwrap();

        assert_eq!(fs.stat("/uploads/big.bin").unwrap().size, 10_000);
        assert_eq!(contents(&mut fs, "/uploads/big.bin"), data);
    }

    #[test]
    fn seek_overwrite_and_append() {
        let (_sim, mut fs) = mounted();
        let h = fs
            .open("/uploads/s.txt", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.write(&h, b"hello world").unwrap();
        assert_eq!(fs.seek(&h, SeekFrom::Start(6)).unwrap(), 6);
        fs.write(&h, b"WORLD").unwrap();
        assert_eq!(fs.seek(&h, SeekFrom::End(-5)).unwrap(), 6);
        let mut tail = [0u8; 8];
        assert_eq!(fs.read(&h, &mut tail).unwrap(), 5);
        assert_eq!(&tail[..5], b"WORLD");
        assert_eq!(
            fs.seek(&h, SeekFrom::Current(-100)),
            Err(StorageError::Fs(FsError::Invalid))
        );
        fs.close(h).unwrap();

        let h = fs
            .open("/uploads/s.txt", OpenFlags::WRITE | OpenFlags::APPEND)
            .unwrap();
        fs.write(&h, b"!").unwrap();
        fs.close(h).unwrap();
        assert_eq!(contents(&mut fs, "/uploads/s.txt"), b"hello WORLD!");
    }

    #[test]
    fn read_only_handles_refuse_writes() {
        let (_sim, mut fs) = mounted();
        let h = fs
            .open("/uploads/r.txt", OpenFlags::READ | OpenFlags::CREATE)
            .unwrap();
        assert_eq!(fs.write(&h, b"x"), Err(StorageError::Fs(FsError::BadFd)));
        fs.close(h).unwrap();
    }

    #[test]
    fn slots_run_out_and_come_back() {
        let (_sim, mut fs) = mounted();
        let handles: Vec<_> = (0..MAX_OPEN_FILES)
            .map(|i| {
                fs.open(&format!("/uploads/{i}"), OpenFlags::WRITE | OpenFlags::CREATE)
                    .unwrap()
            })
            .collect();
        assert_eq!(
            fs.open("/uploads/extra", OpenFlags::WRITE | OpenFlags::CREATE)
                .map(|_| ()),
            Err(StorageError::Fs(FsError::NoFileSlots))
        );
        for h in handles {
            fs.close(h).unwrap();
        }
        let h = fs
            .open("/uploads/extra", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.close(h).unwrap();
    }

    #[test]
    fn unclosed_writes_leave_committed_contents() {
        let sim = SimFlash::new(FLASH_CAPACITY);
        {
            let mut fs = session(&sim);
            fs.mount().unwrap();
            let h = fs
                .open("/www/page.html", OpenFlags::WRITE | OpenFlags::CREATE)
                .unwrap();
            fs.write(&h, b"old").unwrap();
            fs.close(h).unwrap();

            let h = fs.open("/www/page.html", OpenFlags::WRITE).unwrap();
            fs.write(&h, b"new!").unwrap();
            // session dropped with the handle still open
        }
        let mut fs = session(&sim);
        fs.mount().unwrap();
        assert_eq!(contents(&mut fs, "/www/page.html"), b"old");
    }

    #[test]
    fn rename_replaces_and_remove_needs_empty_dirs() {
        let (_sim, mut fs) = mounted();
        for (path, data) in [("/uploads/a", &b"new"[..]), ("/www/a", &b"old"[..])] {
            let h = fs.open(path, OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
            fs.write(&h, data).unwrap();
            fs.close(h).unwrap();
        }
        fs.rename("/uploads/a", "/www/a").unwrap();
        assert!(!fs.exists("/uploads/a"));
        assert_eq!(contents(&mut fs, "/www/a"), b"new");

        assert_eq!(fs.remove("/www"), Err(StorageError::Fs(FsError::NotEmpty)));
        fs.remove("/www/a").unwrap();
        fs.remove("/www").unwrap();
        assert!(!fs.exists("/www"));
    }
}
