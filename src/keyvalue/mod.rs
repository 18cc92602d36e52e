// This module provides a string key-value store which is replicated through a
// raft cluster. Every node applies the same committed commands, in the same
// order, to its own KeyStore.

pub use command::{Command, DecodeError, Operation};
pub use fsm::{KeyValueSnapshot, KeyValueStateMachine};
pub use service::{KeyValueService, ServiceError};
pub use store::KeyStore;

pub(in crate::keyvalue) mod command;
pub(in crate::keyvalue) mod fsm;
pub(in crate::keyvalue) mod service;
pub(in crate::keyvalue) mod store;
pub(in crate::keyvalue) mod wire;
