//! Identity, share access control and the permission engine.
//!
//! Every POSIX metadata operation funnels through this module: the share
//! access decision yields an [`AuthContext`], and the permission engine
//! evaluates Unix modes or NFSv4 ACLs against it.

mod acl;
mod identity;
mod permissions;
mod share;

pub use acl::*;
pub use identity::*;
pub use permissions::*;
pub use share::*;
