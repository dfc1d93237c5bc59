pub mod controller;

pub use controller::{Herald, RunnerKind, Slice, find_config_file};
