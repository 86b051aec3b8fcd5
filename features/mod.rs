pub mod sampling;
pub mod window;
