pub mod client;

pub use client::{GatewayClient, GatewayError};
pub use reqwest::{Method, StatusCode};
