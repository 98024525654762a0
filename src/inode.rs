//! The inode number type (§4.6, §6): a process-lifetime handle onto a point
//! in the forest, reserved for `ROOT_INO` and otherwise assigned the first
//! time a name is looked up (see [`crate::forest::Forest::lookup`]/`bind`).

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ino(pub u64);

/// The root directory is always inode 1, matching the POSIX convention a
/// façade layer expects.
pub const ROOT_INO: Ino = Ino(1);
