pub mod containerizer;
pub mod plan;
mod steps;

pub use containerizer::{Containerizer, FibContainer, ImageTarget};
pub use plan::{FibContainerBuilder, FileEntriesLayer};
