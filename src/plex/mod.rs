//! Plex Media Server API client

pub mod client;
pub mod models;

pub use client::PlexClient;
