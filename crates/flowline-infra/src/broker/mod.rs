//! Distributed broker clients.

pub mod http;

pub use http::HttpBrokerClient;
