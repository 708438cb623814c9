//! HTTP API: the membership check as seen by the hosting proxy.

pub mod app;
pub mod context;
pub mod middleware;
