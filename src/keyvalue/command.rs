use bytes::Bytes;
use prost::Message;
use thiserror::Error;

use crate::keyvalue::wire::{CommandProto, OperationProto};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Set,
    Delete,
}

// A single mutation of the key-value map, as carried in a log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    operation: Operation,
    key: String,
    value: String,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed command: {0}")]
    Malformed(#[from] prost::DecodeError),

    #[error("Unknown operation tag {0}")]
    UnknownOperation(i32),

    #[error("Command has no key")]
    MissingKey,

    #[error("Delete command carries a value")]
    UnexpectedValue,
}

impl Command {
    pub fn set(key: &str, value: &str) -> Self {
        Command {
            operation: Operation::Set,
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn delete(key: &str) -> Self {
        Command {
            operation: Operation::Delete,
            key: key.to_string(),
            value: String::new(),
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn encode(&self) -> Bytes {
        let operation = match self.operation {
            Operation::Set => OperationProto::Set,
            Operation::Delete => OperationProto::Delete,
        };
        let proto = CommandProto {
            operation: operation as i32,
            key: Some(self.key.clone()),
            value: self.value.clone(),
        };
        Bytes::from(proto.encode_to_vec())
    }

    pub fn decode(payload: &[u8]) -> Result<Command, DecodeError> {
        let proto = CommandProto::decode(payload)?;
        let operation = match OperationProto::try_from(proto.operation) {
            Ok(OperationProto::Set) => Operation::Set,
            Ok(OperationProto::Delete) => Operation::Delete,
            Err(_) => return Err(DecodeError::UnknownOperation(proto.operation)),
        };
        let key = proto.key.ok_or(DecodeError::MissingKey)?;
        if operation == Operation::Delete && !proto.value.is_empty() {
            return Err(DecodeError::UnexpectedValue);
        }
        Ok(Command {
            operation,
            key,
            value: proto.value,
        })
    }
}
