//! Pagebeacon - page-view beacon ingestion and hourly traffic rollups
//!
//! - `POST /api/event` stores a beacon enriched with IP geolocation
//! - `GET /api/events/:session_id` returns a session's raw events
//! - `GET /api/aggregated-data` folds hourly rollups into daily totals

pub mod aggregate;
pub mod config;
pub mod db;
pub mod error;
pub mod geoip;
pub mod ingest;
pub mod rollup;
pub mod web;
