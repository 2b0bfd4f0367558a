//! Local mirror and cache layer for YouTube video metadata.

pub mod cache;
pub mod clock;
pub mod config;
pub mod duration;
pub mod error;
pub mod metadata;
pub mod remote;
pub mod search;
pub mod security;
pub mod sync;
pub mod youtube;
