//! Enumeration of the images dyld has loaded into this process.

use crate::image::{Image, MachImage};
use std::ffi::CStr;
use tracing::debug;

/// Every image currently registered with dyld, in load order.
pub fn loaded_images() -> Vec<Box<dyn Image>> {
    let count = unsafe { libc::_dyld_image_count() };
    (0..count).filter_map(image_at).collect()
}

/// The main executable, always dyld's image 0.
pub fn main_image() -> Option<Box<dyn Image>> {
    image_at(0)
}

fn image_at(index: u32) -> Option<Box<dyn Image>> {
    let header = unsafe { libc::_dyld_get_image_header(index) };
    if header.is_null() {
        return None;
    }
    let slide = unsafe { libc::_dyld_get_image_vmaddr_slide(index) };
    let name = unsafe { libc::_dyld_get_image_name(index) };
    let name = if name.is_null() {
        format!("<image {index}>")
    } else {
        unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
    };
    match unsafe { MachImage::from_raw(header as *const u8, slide, name) } {
        Ok(image) => Some(Box::new(image)),
        Err(err) => {
            debug!("skipping image {index}: {err}");
            None
        }
    }
}
