pub mod analyzer;
pub mod cache;
pub mod compression;
pub mod config;
pub mod db;
pub mod location;
pub mod notify;
pub mod query;
pub mod scanner;
pub mod scheduler;
pub mod waveform;

pub use cache::{CacheEngine, CacheError};
pub use location::Location;
pub use query::{Query, QueryHandle, Urgency};
pub use waveform::Waveform;

/// Audio file extensions the bundled symphonia decoder handles
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "oga", "wav", "aif", "aiff",
];

/// Application name for XDG paths
pub const APP_NAME: &str = "wavecache";
