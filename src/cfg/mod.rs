pub mod board_cfg;
pub mod fs_cfg;
pub mod net_cfg;
