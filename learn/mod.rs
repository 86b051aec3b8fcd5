pub mod balance;
pub mod estimate;
pub mod explain;
pub mod forest;
pub mod logistic;
pub mod metrics;
pub mod model;
