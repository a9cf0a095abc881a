//! Sequential media viewer for live attachment groups.
//!
//! A push channel keeps the group's attachment list current; the group
//! player walks it item by item and the byte cache keeps video payloads
//! on disk between runs.

pub mod api;
pub mod assets;
pub mod cache;
pub mod config;
pub mod error;
pub mod group;
pub mod player;
pub mod realtime;
pub mod surface;
#[cfg(feature = "gst")]
pub mod video;
pub mod viewer;

pub use assets::{Attachment, MediaKind};
pub use config::ViewerConfig;
pub use error::{ViewerError, ViewerResult};
pub use viewer::{Viewer, ViewerHandle, ViewerServices};
