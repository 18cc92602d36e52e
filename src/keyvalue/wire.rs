// Protobuf messages carried in log entries and snapshots.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum OperationProto {
    Set = 0,
    Delete = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CommandProto {
    #[prost(enumeration = "OperationProto", tag = "1")]
    pub operation: i32,
    #[prost(string, optional, tag = "2")]
    pub key: Option<String>,
    #[prost(string, tag = "3")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EntryProto {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SnapshotProto {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<EntryProto>,
}
