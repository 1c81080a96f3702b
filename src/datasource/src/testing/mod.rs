//! Test utilities for the Open-Falcon datasource.
//!
//! Only available with the `testing` feature or during tests:
//!
//! ```toml
//! [dependencies]
//! openfalcon-datasource = { path = "src/datasource", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use openfalcon_datasource::testing::RecordingTransport;
//!
//! let transport = RecordingTransport::new().with_response(json!({"data": []}));
//! ```

mod recording_transport;

pub use recording_transport::RecordingTransport;
