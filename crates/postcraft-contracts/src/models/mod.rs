mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, CAPABILITY_IMAGE, CAPABILITY_TEXT, CAPABILITY_VIDEO};
pub use selectors::{ModelSelection, ModelSelector};
