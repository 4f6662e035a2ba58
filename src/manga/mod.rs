pub mod api_types;
pub mod cached_client;
pub mod client;
pub mod keys;
pub mod types;
