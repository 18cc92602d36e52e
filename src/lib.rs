pub mod cluster;
pub mod harness;
#[cfg(test)]
mod integration_test;
pub mod keyvalue;
pub mod raft;
