//! Sentra Reconciliation Library
//!
//! Core components for reconciling internally-tracked trading positions
//! against authoritative broker state and enforcing hard equity-risk limits.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
