//! Library crate for intruder-watch exposing the capture pipeline, the
//! dashboard sync consumer and the upload API.
pub mod attempts;
pub mod camera;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod geo;
pub mod login;
pub mod recorder;
pub mod server;
pub mod store;
pub mod types;
