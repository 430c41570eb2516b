//! ConectaSEI - multi-tenant SEI process extraction service.
//!
//! Periodically extracts legal-process records and their attached documents
//! from tenant-specific instances of the upstream SEI system and archives
//! the documents in an object store.

pub mod browser;
pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod scrapers;
pub mod services;
pub mod storage;
pub mod utils;
pub mod vault;
