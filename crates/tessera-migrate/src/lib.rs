//! Tessera startup: configuration, logging, connectivity probe and schema
//! migrations, run once before the application serves traffic.

pub mod config;
pub mod startup;
