//! Path safety helpers shared by the permission checker and sandbox.

pub mod path_policy;

pub use path_policy::{absolutize, is_under_any, is_under_root, normalize_path};
