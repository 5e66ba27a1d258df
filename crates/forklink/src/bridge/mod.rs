//! Wire-level pieces shared by the controller and the forked worker.
//!
//! # Architecture
//!
//! - **descriptor**: session token and the `tcp://host:port?sessionId=token` string
//! - **codec**: JSON framing codec for the command and event streams

pub mod codec;
pub mod descriptor;
