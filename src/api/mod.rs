//! Wire types of the HTTP API

pub mod management;
pub mod openai_compat;
