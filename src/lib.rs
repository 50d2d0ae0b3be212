//! Inactive user cleanup service.
//!
//! Periodically (and on request) deletes users that are deactivated or have
//! been inactive past a threshold, in bounded transactional chunks, under an
//! advisory run lock, and records an audit report per run.

pub mod cleanup;
pub mod config;
pub mod db;
pub mod web;
