#![forbid(unsafe_code)]

//! Library behind the viral shorts harvester.
//!
//! A run takes a list of channels, pulls recent shorts for each one, ranks
//! them by a viral score and downloads the best few at a deliberately slow
//! pace. The binaries in `src/bin/` are thin wrappers around
//! [`coordinator::ChannelRunCoordinator`].

pub mod channel;
pub mod channels_file;
pub mod config;
pub mod coordinator;
pub mod downloader;
pub mod error;
pub mod fetcher;
pub mod metadata;
pub mod pacing;
pub mod process;
pub mod progress;
pub mod scorer;
