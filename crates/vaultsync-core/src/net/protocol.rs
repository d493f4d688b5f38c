//! Replication wire protocol
//!
//! Messages are serialized with postcard and broadcast on the vault's
//! discovery-key topic.
//!
//! ## Message Flow
//!
//! ```text
//! Replica A                        Peer B
//!   |                                |
//!   |--- Announce {version: 3} ----->|
//!   |<-- Announce {version: 7} ------|
//!   |                                |
//!   |    (behind, catch up)          |
//!   |                                |
//!   |--- Request {from: 3} --------->|
//!   |<-- Entries {[3..7]} -----------|
//!   |                                |
//!   |    (verify + apply, then       |
//!   |     fetch wanted content)      |
//!   |                                |
//!   |--- BlobRequest {hashes} ------>|
//!   |<-- BlobData {blobs} -----------|
//! ```
//!
//! Entries are individually signed by the vault owner, so it does not
//! matter which peer serves them.

use serde::{Deserialize, Serialize};

use crate::store::SignedEntry;

/// Entries per `Entries` message; large histories are served in batches
pub const MAX_ENTRIES_PER_MESSAGE: usize = 64;
/// Blob payload budget per `BlobData` message (fits the gossip frame)
pub const MAX_BLOB_BYTES_PER_MESSAGE: usize = 512 * 1024;

/// Messages sent over a vault's replication topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Announce the local log length; peers compare to detect lag
    Announce { version: u64 },

    /// Ask any peer for log entries starting at `from`
    Request { from: u64 },

    /// A batch of signed log entries, in sequence order
    Entries { entries: Vec<SignedEntry> },

    /// Ask any peer for content blobs by hash
    BlobRequest { hashes: Vec<[u8; 32]> },

    /// Content blobs: (blake3 hash, bytes) pairs
    BlobData { blobs: Vec<([u8; 32], Vec<u8>)> },
}

impl WireMessage {
    /// Encode to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let msg = WireMessage::Announce { version: 42 };
        let bytes = msg.encode().unwrap();
        match WireMessage::decode(&bytes).unwrap() {
            WireMessage::Announce { version } => assert_eq!(version, 42),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(WireMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_blob_message_roundtrip() {
        let hash = *blake3::hash(b"content").as_bytes();
        let msg = WireMessage::BlobData {
            blobs: vec![(hash, b"content".to_vec())],
        };
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            WireMessage::BlobData { blobs } => {
                assert_eq!(blobs.len(), 1);
                assert_eq!(blobs[0].0, hash);
                assert_eq!(blobs[0].1, b"content");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }
}
