//! sysupdated - system update coordination daemon.
//!
//! Exposes the daemon's components for integration testing.

pub mod discovery;
pub mod error;
pub mod grpc;
pub mod job;
pub mod manager;
pub mod notify;
pub mod policy;
pub mod target;
pub mod worker;

pub mod proto {
    tonic::include_proto!("sysupdate.v1");
}
