//! Tiergate - Multi-tier Request Rate Limiting
//!
//! This crate decides, per inbound HTTP request, whether the caller may
//! proceed. Requests are counted against independent tiers (client IP,
//! authenticated user, sensitive actions such as login and password reset)
//! using a weighted sliding window, in memory or in a shared Redis store.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
