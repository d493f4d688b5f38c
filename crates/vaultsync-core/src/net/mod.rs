//! Networking: gossip transport, replication protocol, swarm control

pub mod gossip;
pub mod protocol;
pub mod swarm;

pub use gossip::{GossipMessage, GossipNet, TopicEvent, TopicReceiver, TopicSender};
pub use protocol::WireMessage;
pub use swarm::{DkeyMap, SwarmController};
