//! Host metric sampling and threshold evaluation

pub mod collector;
pub mod resources;
pub mod window;
