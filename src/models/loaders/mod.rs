pub mod toml_loader;

pub use toml_loader::{list_submission_files, load_guide};
