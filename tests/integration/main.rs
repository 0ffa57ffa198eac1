//! Integration tests against local HTTP servers and the filesystem

#[path = "../helpers.rs"]
mod helpers;

mod filesystem;
mod trust_client;
mod vault_client;
