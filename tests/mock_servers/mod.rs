//! Mock servers for integration tests
//!
//! Each server binds 127.0.0.1 on a random port and simulates one of the
//! engine's external collaborators: the Web API player endpoints, the
//! accounts (token) service, and a Connect device's Zeroconf endpoint.
#![allow(dead_code)]

pub mod accounts;
pub mod device;
pub mod web_api;
