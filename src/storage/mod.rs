//! Storage layer: temporary filesystem entries and link management
//!
//! # Features
//!
//! - **Temporary directories**: collision-free names under concurrent callers
//! - **AutoDelete**: scoped deletion with optional freed-space reporting
//! - **Symlinks**: atomic replacement via rename

pub mod filesystem;
pub mod temp;

pub use filesystem::{create_dirs, create_symlink, replace_symlink};
pub use temp::{
    create_temp_dir, create_temp_file, delete_path, delete_path_counting, AutoDelete, DeleteStats,
    TempDirOptions,
};
