//! Local library layout: path derivation, track fetching and cleanup

pub mod clean;
pub mod fetcher;
pub mod path;

pub use fetcher::{FetchError, FetchOptions, fetch_track};
pub use path::{UNKNOWN_ALBUM, UNKNOWN_ARTIST, sanitize_filename, track_path};
