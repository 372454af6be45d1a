pub mod dyld;
pub mod xnu;

pub use dyld::{loaded_images, main_image};
pub use xnu::{is_debugged, write_protected};
