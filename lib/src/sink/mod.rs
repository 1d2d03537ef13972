//! Pipeline sinks: where image elements end up.

pub mod daemon;
pub mod directory;
pub mod registry;
pub mod tarball;

pub use daemon::Daemon;
pub use directory::{Directory, Mounts, OciBundle};
pub use registry::Registry;
pub use tarball::Tarball;
