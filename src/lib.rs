//! Retrieve, decrypt and import the Agricoll contact directory export.

pub mod logging;

pub mod channel;
pub mod config;
pub mod crypto;
pub mod importer;
pub mod pipeline;
pub mod selector;
pub mod storage;
