//! HTTP middleware for the Session Controller.

pub mod http_metrics;

pub use http_metrics::http_metrics_middleware;
