pub mod crypto;
pub mod models;
