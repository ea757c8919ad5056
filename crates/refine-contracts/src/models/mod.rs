mod registry;
mod selectors;

pub use registry::{Capability, ImageParams, ModelRegistry, ModelSpec};
pub use selectors::{ModelSelection, ModelSelector};
