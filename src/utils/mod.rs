mod string;

pub use string::{clip, clip_with_marker};
