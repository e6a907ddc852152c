pub mod client;
pub mod digest;
pub mod image_reference;
pub mod models;

// Re-export main client types for convenience
pub use client::{Client, ClientSession, Credentials, ManifestResponse};
pub use digest::OciDigest;
pub use image_reference::{Identifier, ImageReference};
pub use models::{Descriptor, ImageManifest};
