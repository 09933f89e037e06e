//! Where packet bytes live: the content-addressed file store and the
//! human-browsable archive tree.

mod archive;
mod file_store;

pub use archive::Archive;
pub use file_store::FileStore;
