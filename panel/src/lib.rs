//! Micropanel Library
//!
//! Archive ingestion and atomic release pipeline for statically hosted sites.

pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod storage;
pub mod utils;
