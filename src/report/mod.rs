//! Report rendering.
//!
//! Turns a `Report` into the console summary line and the JSON shape
//! shared by the HTTP server, the webhook listener and `--output`.

pub mod generator;

pub use generator::*;
