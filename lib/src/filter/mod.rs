//! Concrete filters: `normalize-timestamps`, `exclude`, `search`, `inspect`.
//! See [`crate::pipeline::Filter`] for the trait they implement.

mod retar;

pub mod exclude;
pub mod inspect;
pub mod normalize_timestamps;
pub mod search;

pub use exclude::Exclude;
pub use inspect::Inspect;
pub use normalize_timestamps::NormalizeTimestamps;
pub use search::Search;
