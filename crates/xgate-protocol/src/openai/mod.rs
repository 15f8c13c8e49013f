pub mod chat;
pub mod error;
pub mod images;
pub mod models;
