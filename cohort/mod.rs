pub mod data;
pub mod scale;
pub mod split;
