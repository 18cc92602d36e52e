use bytes::Bytes;
use std::fmt;

pub type ServerId = String;
pub type ServerAddress = String;

// Whether a server takes part in quorum decisions or just receives entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Suffrage {
    Voter,
    Nonvoter,
}

// A single member of a cluster configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Server {
    pub suffrage: Suffrage,
    pub id: ServerId,
    pub address: ServerAddress,
}

impl Server {
    pub fn voter(id: &str, address: &str) -> Self {
        Server {
            suffrage: Suffrage::Voter,
            id: id.to_string(),
            address: address.to_string(),
        }
    }

    pub fn nonvoter(id: &str, address: &str) -> Self {
        Server {
            suffrage: Suffrage::Nonvoter,
            id: id.to_string(),
            address: address.to_string(),
        }
    }

    pub fn is_voter(&self) -> bool {
        self.suffrage == Suffrage::Voter
    }
}

// The set of servers making up a cluster. The authoritative copy is the latest
// configuration entry in the log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Configuration {
    pub servers: Vec<Server>,
}

impl Configuration {
    pub fn new(servers: Vec<Server>) -> Self {
        Configuration { servers }
    }

    pub fn voters(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter().filter(|s| s.is_voter())
    }

    pub fn get(&self, id: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn is_voter(&self, id: &str) -> bool {
        self.get(id).is_some_and(|s| s.is_voter())
    }

    // Number of votes (or acknowledgements) needed for a majority.
    pub fn quorum(&self) -> usize {
        self.voters().count() / 2 + 1
    }

    // Returns a copy of this configuration with the supplied server added, or
    // replacing an existing server with the same id.
    pub fn with_server(&self, server: Server) -> Self {
        let mut servers: Vec<Server> = self
            .servers
            .iter()
            .filter(|s| s.id != server.id)
            .cloned()
            .collect();
        servers.push(server);
        Configuration { servers }
    }

    // Checks the structural rules every configuration must satisfy.
    pub fn validate(&self) -> Result<(), String> {
        if self.voters().next().is_none() {
            return Err("configuration has no voters".to_string());
        }
        for (i, server) in self.servers.iter().enumerate() {
            if server.id.is_empty() {
                return Err("server with empty id".to_string());
            }
            if server.address.is_empty() {
                return Err(format!("server {} has an empty address", server.id));
            }
            for other in &self.servers[i + 1..] {
                if other.id == server.id {
                    return Err(format!("duplicate server id {}", server.id));
                }
                if other.address == server.address {
                    return Err(format!("duplicate server address {}", server.address));
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EntryData {
    // Appended by every new leader so that entries from earlier terms commit.
    Noop,
    Command(Bytes),
    Configuration(Configuration),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryId {
    pub index: u64,
    pub term: u64,
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(term={},index={})", self.term, self.index)
    }
}

// A single entry in the replicated log.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub data: EntryData,
}

impl Entry {
    pub fn id(&self) -> EntryId {
        EntryId {
            index: self.index,
            term: self.term,
        }
    }

    // Returns the command payload if this entry carries one.
    pub fn command(&self) -> Option<&Bytes> {
        match &self.data {
            EntryData::Command(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        match &self.data {
            EntryData::Command(payload) => payload.len() as u64,
            _ => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderInfo {
    pub address: ServerAddress,
    pub id: ServerId,
}

// Term and vote, the state that must survive restarts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<ServerId>,
}

// Describes a persisted snapshot of the state machine.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotMeta {
    pub id: String,

    // The last log entry covered by the snapshot.
    pub index: u64,
    pub term: u64,

    // The latest configuration as of "index".
    pub configuration: Configuration,
    pub configuration_index: u64,

    pub size: u64,
}

impl SnapshotMeta {
    pub fn last(&self) -> EntryId {
        EntryId {
            index: self.index,
            term: self.term,
        }
    }
}

// A point-in-time view of an engine, mostly useful for tests and logging.
#[derive(Clone, Debug, PartialEq)]
pub struct RaftStats {
    pub role: Role,
    pub term: u64,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub last_snapshot_index: u64,
    pub configuration_index: u64,
    pub leader: Option<LeaderInfo>,
}

#[derive(Clone, Debug)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: ServerId,
    pub last_log: EntryId,
}

#[derive(Clone, Debug)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Clone, Debug)]
pub struct AppendRequest {
    pub term: u64,
    pub leader: LeaderInfo,
    pub previous: EntryId,
    pub entries: Vec<Entry>,
    pub leader_commit: u64,
}

#[derive(Clone, Debug)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,

    // The last index in the follower's log, used to skip back quickly after a
    // rejected append.
    pub last_log_index: u64,
}

#[derive(Clone, Debug)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader: LeaderInfo,
    pub meta: SnapshotMeta,
    pub data: Bytes,
}

#[derive(Clone, Debug)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum() {
        let one = Configuration::new(vec![Server::voter("a", "mem://a")]);
        assert_eq!(1, one.quorum());

        let three = one
            .with_server(Server::voter("b", "mem://b"))
            .with_server(Server::voter("c", "mem://c"))
            .with_server(Server::nonvoter("d", "mem://d"));
        assert_eq!(2, three.quorum());
        assert!(three.is_voter("c"));
        assert!(!three.is_voter("d"));
    }

    #[test]
    fn test_with_server_replaces() {
        let config = Configuration::new(vec![Server::nonvoter("a", "mem://a")]);
        let updated = config.with_server(Server::voter("a", "mem://a"));
        assert_eq!(1, updated.servers.len());
        assert!(updated.is_voter("a"));
    }

    #[test]
    fn test_validate() {
        assert!(Configuration::default().validate().is_err());
        assert!(
            Configuration::new(vec![Server::nonvoter("a", "mem://a")])
                .validate()
                .is_err()
        );
        assert!(
            Configuration::new(vec![
                Server::voter("a", "mem://a"),
                Server::voter("a", "mem://b"),
            ])
            .validate()
            .is_err()
        );
        assert!(
            Configuration::new(vec![
                Server::voter("a", "mem://a"),
                Server::voter("b", "mem://a"),
            ])
            .validate()
            .is_err()
        );
        assert!(
            Configuration::new(vec![Server::voter("a", "mem://a")])
                .validate()
                .is_ok()
        );
    }
}
