pub mod config;
pub mod error;
pub mod gateway;
pub mod raft;
pub mod shutdown;
