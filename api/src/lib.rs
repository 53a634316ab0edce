//! Embedded media server: live frame polling and a photo gallery over HTTP.

pub mod assets;
pub mod error;
pub mod gallery;
pub mod net;
pub mod routes;
pub mod server;
pub mod store;

pub use error::{ApiError, ServerError};
pub use server::MediaServer;
pub use store::{DirectoryPhotoStore, PhotoStore};
