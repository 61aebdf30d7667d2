//! Core library: filters, tag extraction, the file store, directory
//! scanning, and live views.

pub mod config;
pub mod extractor;
pub mod filter;
pub mod models;
pub mod scanner;
pub mod store;
pub mod tags_view;
pub mod updater;
pub mod view;
