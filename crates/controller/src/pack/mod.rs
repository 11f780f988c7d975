//! Plant/pack knowledge base: on-disk records, the versioned store, the
//! built-in catalog, and the two client-facing protocols that move plant
//! data across the link (chunked pack transfer and list streaming).

pub mod atomic;
pub mod catalog;
pub mod codec;
pub mod record;
pub mod store;
pub mod streamer;
pub mod transfer;

pub use catalog::Catalog;
pub use record::{FixedStr, PackRecord, PlantListEntry, PlantRecord, PlantSource};
pub use store::{InstallOutcome, PackStore};
