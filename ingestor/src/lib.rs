pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod logs;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod rest;
pub mod validate;

#[cfg(test)]
mod testing;
