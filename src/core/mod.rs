//! Core domain: token authority, keyed stores and service plumbing

pub mod auth;
pub mod config;
pub mod context;
pub mod store;
