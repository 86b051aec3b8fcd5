#![deny(unused_variables)]
#![deny(unused_imports)]

#[path = "../cohort/mod.rs"]
pub mod cohort;

#[path = "../features/mod.rs"]
pub mod features;

#[path = "../learn/mod.rs"]
pub mod learn;

#[path = "../shared/files.rs"]
pub mod files;

pub mod config;
pub mod pipeline;
