//! Per-endpoint handlers (C9/C10), one module per surface.

pub mod admin;
pub mod chat;
pub mod models;
pub mod passthrough;
