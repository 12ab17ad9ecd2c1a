//! Breach Wire - a breach-news feed aggregator
//!
//! Fetches RSS and Atom feeds from configured sources in small concurrent
//! batches, normalizes and deduplicates their entries, and serves the merged
//! newest-first stream as a paginated JSON API.

pub mod aggregator;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod model;
pub mod normalize;
pub mod parser;
pub mod routes;
pub mod store;
