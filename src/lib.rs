//! Switchyard - a configurable reverse proxy
//!
//! This library provides:
//! - A tree of request handlers selected by method, host and path patterns
//! - Actions: fixed replies, redirects, static files, reverse proxying,
//!   FastCGI and a status document
//! - Bounded per-upstream connection pools with protocol upgrade support
//! - Round-robin load balancing across named upstream lists
//! - Raw TCP relaying through the same byte pump used for upgrades

pub mod access_log;
pub mod action;
pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod fastcgi;
pub mod handler;
pub mod headers;
pub mod loadbalancer;
pub mod matcher;
pub mod pattern;
pub mod pool;
pub mod proxy;
pub mod pump;
pub mod reverse_proxy;
pub mod serve;
pub mod service;
pub mod stats;
pub mod tcp;
pub mod tls;
