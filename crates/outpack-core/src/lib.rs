#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::cast_precision_loss,
    clippy::module_name_repetitions
)]

//! Repository engine for outpack: content-addressed storage, the metadata
//! index, packet creation, queries and transfer between locations.

mod fs;
pub mod index;
pub mod location;
pub mod packet;
pub mod root;
pub mod search;
pub mod store;

pub use index::{Index, IndexData};
pub use location::{
    build_pull_plan, find_all_dependencies, location_add, location_list, location_remove,
    location_rename, open_driver, pull_files, pull_metadata, pull_packet, push, HttpDriver,
    LocationDriver, PathDriver, PullMetadataSummary, PullPlan, PushSummary, ScopedStore,
};
pub use packet::Packet;
pub use root::{root_open, InitOptions, IntoRoot, Root, OUTPACK_DIR};
pub use search::{search, search_unique, SearchOptions};
pub use store::{Archive, FileStore};

pub use outpack_domain as domain;
