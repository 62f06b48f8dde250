//! API routes

pub mod cache;
pub mod models;
pub mod openai;
