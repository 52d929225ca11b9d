pub mod store;

pub use store::{CirrusStore, ObjectVersion};
