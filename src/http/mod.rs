//! REST transport: routes, multipart bodies and the rate-limited executor

pub mod client;
pub mod form;
pub mod route;

pub use client::{HttpConfig, RequestExecutor};
pub use form::{prepare_form, File};
pub use route::Route;
pub use reqwest::Method;
