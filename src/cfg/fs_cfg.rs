// littlefs geometry. Changing any of these invalidates existing flash images.
pub const READ_SIZE: usize = 1;
pub const PROG_SIZE: usize = 1;
pub const BLOCK_SIZE: usize = 4096; // one W25Q128 sector
pub const BLOCK_COUNT: usize = 4096; // 16 MiB / 4 KiB
pub const BLOCK_CYCLES: isize = 500;
// Cache and lookahead sizes (16 bytes each) are type-level, see `mem::block_device`

// littlefs limits: 255-byte file names, 255-byte paths
pub const NAME_MAX: usize = 255;
pub const PATH_MAX: usize = 255;

// Write-behind buffer per open file, flushed a block at a time
pub const WRITE_BUFFER: usize = BLOCK_SIZE;

// Directories the HTTP layer relies on
pub const UPLOADS_DIR: &str = "/uploads";
pub const WWW_DIR: &str = "/www";
pub const INDEX_PATH: &str = "/www/index.html";
