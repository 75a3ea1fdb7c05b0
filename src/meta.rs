//! File metadata model, store contracts and the POSIX operation engine.

mod file;
mod memory;
mod ops;
mod readdir;
mod store;

pub use file::*;
pub use memory::*;
pub use ops::*;
pub use readdir::*;
pub use store::*;
