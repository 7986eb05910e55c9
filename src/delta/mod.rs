//! Delta storage for DiskRowSets: an in-memory DeltaMemStore plus immutable
//! delta files, owned by a per-rowset [`DeltaTracker`].

mod delta_file;
mod delta_mem;
mod tracker;

pub use delta_file::DeltaFile;
pub use delta_mem::DeltaMemStore;
pub use tracker::{delta_file_name, list_delta_files, DeltaTracker};
