pub mod sessions;
pub mod upload;
