//! Gossip networking layer using iroh-gossip
//!
//! One endpoint per process, bound to the persistent network identity.
//! Each vault's swarm membership is a gossip topic derived from its
//! discovery key; all vaults share the endpoint's connection pool.

use std::sync::Arc;

use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, PublicKey, SecretKey};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{VaultError, VaultResult};
use crate::types::DiscoveryKey;

/// Message received from a gossip topic
#[derive(Debug, Clone)]
pub struct GossipMessage {
    /// The sender's public key
    pub from: PublicKey,
    /// The raw message content
    pub content: Vec<u8>,
}

/// Event from a gossip topic (message or neighbor change)
#[derive(Debug)]
pub enum TopicEvent {
    /// A message was received from a peer
    Message(GossipMessage),
    /// A neighbor joined the topic
    NeighborUp(PublicKey),
    /// A neighbor left the topic
    NeighborDown(PublicKey),
}

/// Handle to a subscribed gossip topic for sending messages.
///
/// The sender can be cloned and shared across threads; the receiver is
/// returned separately and polled by a single task.
#[derive(Clone)]
pub struct TopicSender {
    sender: Arc<Mutex<iroh_gossip::api::GossipSender>>,
    topic_id: TopicId,
}

/// Handle to receive events from a gossip topic
pub struct TopicReceiver {
    receiver: iroh_gossip::api::GossipReceiver,
    topic_id: TopicId,
}

impl TopicSender {
    /// Broadcast a message to all peers on this topic
    pub async fn broadcast(&self, msg: impl Into<Vec<u8>>) -> VaultResult<()> {
        let data: Vec<u8> = msg.into();
        debug!(topic = ?self.topic_id, len = data.len(), "Broadcasting message");
        self.sender
            .lock()
            .await
            .broadcast(data.into())
            .await
            .map_err(|e| VaultError::Gossip(format!("Failed to broadcast: {}", e)))?;
        Ok(())
    }

    pub fn topic_id(&self) -> TopicId {
        self.topic_id
    }
}

impl TopicReceiver {
    /// Receive the next event from the topic.
    ///
    /// Returns None when the topic subscription is closed.
    pub async fn recv_event(&mut self) -> Option<TopicEvent> {
        use iroh_gossip::api::Event;
        use n0_future::StreamExt;

        loop {
            match self.receiver.try_next().await {
                Ok(Some(event)) => match event {
                    Event::Received(msg) => {
                        debug!(topic = ?self.topic_id, from = ?msg.delivered_from, "Received message");
                        return Some(TopicEvent::Message(GossipMessage {
                            from: msg.delivered_from,
                            content: msg.content.to_vec(),
                        }));
                    }
                    Event::NeighborUp(peer) => {
                        info!(topic = ?self.topic_id, ?peer, "Neighbor joined");
                        return Some(TopicEvent::NeighborUp(peer));
                    }
                    Event::NeighborDown(peer) => {
                        info!(topic = ?self.topic_id, ?peer, "Neighbor left");
                        return Some(TopicEvent::NeighborDown(peer));
                    }
                    Event::Lagged => {
                        warn!(topic = ?self.topic_id, "Lagged behind on topic");
                    }
                },
                Ok(None) => {
                    debug!(topic = ?self.topic_id, "Topic subscription closed");
                    return None;
                }
                Err(e) => {
                    warn!(topic = ?self.topic_id, error = ?e, "Error receiving from topic");
                    return None;
                }
            }
        }
    }

    pub fn topic_id(&self) -> TopicId {
        self.topic_id
    }
}

/// TopicId for a vault's discovery key
pub fn topic_for(dkey: &DiscoveryKey) -> TopicId {
    TopicId::from_bytes(*dkey.as_bytes())
}

/// Process-wide gossip networking
///
/// Manages one iroh endpoint with the gossip protocol attached, allowing
/// subscription to one topic per flocking vault.
#[derive(Debug)]
pub struct GossipNet {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    /// Static discovery provider for out-of-band peer addresses
    static_provider: StaticProvider,
}

impl GossipNet {
    /// Spawn the endpoint bound to the given persistent identity.
    pub async fn with_secret_key(secret_key: Option<SecretKey>) -> VaultResult<Self> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));

        let static_provider = StaticProvider::new();
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| VaultError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        // Replication batches can carry blob payloads; the 4KB default is
        // far too small.
        const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
        let gossip = Gossip::builder()
            .max_message_size(MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());

        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .spawn();

        Ok(Self {
            endpoint,
            gossip,
            router,
            static_provider,
        })
    }

    /// This node's public network identity
    pub fn public_key(&self) -> PublicKey {
        self.endpoint.id()
    }

    /// Add a peer's address to static discovery for faster connection
    /// establishment.
    pub fn add_peer_addr(&self, endpoint_addr: EndpointAddr) {
        debug!(peer = %endpoint_addr.id, "Adding peer address to static discovery");
        self.static_provider.add_endpoint_info(endpoint_addr);
    }

    /// Subscribe to a topic; the receiver is polled by a single task.
    pub async fn subscribe_split(
        &self,
        topic_id: TopicId,
        bootstrap_peers: Vec<iroh::EndpointId>,
    ) -> VaultResult<(TopicSender, TopicReceiver)> {
        info!(?topic_id, peer_count = bootstrap_peers.len(), "Subscribing to topic");
        let gossip_topic = self
            .gossip
            .subscribe(topic_id, bootstrap_peers)
            .await
            .map_err(|e| VaultError::Gossip(format!("Failed to subscribe: {}", e)))?;
        let (sender, receiver) = gossip_topic.split();
        Ok((
            TopicSender {
                sender: Arc::new(Mutex::new(sender)),
                topic_id,
            },
            TopicReceiver { receiver, topic_id },
        ))
    }

    /// This node's full addressing information
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Gracefully shut down the router and endpoint
    pub async fn shutdown(&self) -> VaultResult<()> {
        info!("Shutting down gossip networking");
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
        Ok(())
    }
}
