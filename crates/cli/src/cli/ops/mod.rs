mod hash;
mod init;
mod publish;
mod version;

pub use hash::Hash;
pub use init::Init;
pub use publish::Publish;
pub use version::Version;
