// Discovery v5 node library
// Exposes the protocol modules for the binary and the integration tests

extern crate log;

pub mod discovery;
