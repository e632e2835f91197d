//! Architecture-specific translation table formats

pub mod arm64;
