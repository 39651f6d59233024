//! Party registry: one entry per party, bridging graph nodes to connections.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::PartyAddress;
use crate::connection::{PeerConnection, Receipt};
use crate::error::{ProtocolError, Result, RuntimeError};
use crate::frame::Tag;
use crate::graph::Node;
use crate::slot::Slot;
use crate::value::Value;

/// A participant in the session.
pub struct Party {
    id: u8,
    /// `None` for the local party.
    address: Option<PartyAddress>,
    /// Set exactly once, when the handshake with this party completes.
    connection: OnceCell<Arc<PeerConnection>>,
}

impl Party {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn address(&self) -> Option<&PartyAddress> {
        self.address.as_ref()
    }

    pub fn connection(&self) -> Option<&Arc<PeerConnection>> {
        self.connection.get()
    }

    fn connected(&self) -> Result<&Arc<PeerConnection>> {
        self.connection().ok_or(RuntimeError::NotConnected)
    }

    /// Serialize a resolved node and send it under the node's tag.
    pub async fn send(&self, node: &Node) -> Result<()> {
        let value = node
            .value()
            .ok_or_else(|| RuntimeError::Unresolved(node.label()))?;
        let tag = wire_tag(node)?;
        let connection = self.connected()?;
        let payload = value.encode()?;
        debug!("{self}.send({node}) tag={tag} bytes={}", payload.len());
        connection.send(tag, &payload).await
    }

    /// Resolve `node` from this party's delivery, now if it has already
    /// arrived, otherwise whenever it does. Never blocks.
    pub fn receive(&self, node: &Node) -> Result<()> {
        let tag = wire_tag(node)?;
        let connection = self.connected()?;
        debug!("{self}.receive({node}) tag={tag}");

        let slot = node.slot();
        let label = node.label();
        match connection.request(tag)? {
            Receipt::Ready(payload) => apply_payload(&slot, &label, self.id, &payload),
            Receipt::Pending(rx) => {
                let peer = self.id;
                tokio::spawn(async move {
                    match rx.await {
                        Ok(payload) => apply_payload(&slot, &label, peer, &payload),
                        Err(_) => debug!("Connection to party {peer} closed before {label} arrived"),
                    }
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.address {
            Some(addr) => write!(f, "<Party {}: {}>", self.id, addr),
            None => write!(f, "<Party {}>", self.id),
        }
    }
}

/// Decode a delivered payload and resolve `slot` with it, unless the slot was
/// already resolved by another path.
fn apply_payload(slot: &Slot<Value>, label: &str, peer: u8, payload: &[u8]) {
    if payload.is_empty() {
        warn!("Empty payload for {label} from party {peer}, dropped");
        return;
    }
    match Value::decode(payload) {
        Ok(value) => {
            if slot.resolve(value) {
                debug!("Resolved {label} from party {peer}");
            } else {
                debug!("{label} already resolved, delivery from party {peer} discarded");
            }
        }
        Err(e) => warn!("Undecodable payload for {label} from party {peer}, dropped: {e}"),
    }
}

/// The node's sequence tag as carried on the wire.
pub(crate) fn wire_tag(node: &Node) -> Result<Tag> {
    Tag::try_from(node.tag()).map_err(|_| RuntimeError::TagOverflow(node.tag()))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All parties of the session, indexed by identity.
pub struct PartyRegistry {
    local: u8,
    parties: Vec<Party>,
    registered: watch::Sender<usize>,
}

impl PartyRegistry {
    /// Build the registry from the resolved address list. The local party's
    /// address is kept for listening but the party itself never connects.
    pub fn new(local: u8, addresses: Vec<PartyAddress>) -> Result<Self> {
        if addresses.is_empty() || addresses.len() > usize::from(u8::MAX) + 1 {
            return Err(RuntimeError::Config(format!(
                "expected 1..=256 parties, got {}",
                addresses.len()
            )));
        }
        if usize::from(local) >= addresses.len() {
            return Err(RuntimeError::Config(format!(
                "local party {local} out of range for {} parties",
                addresses.len()
            )));
        }

        let parties = addresses
            .into_iter()
            .enumerate()
            .map(|(i, addr)| Party {
                id: i as u8,
                address: (i != usize::from(local)).then_some(addr),
                connection: OnceCell::new(),
            })
            .collect();
        let (registered, _) = watch::channel(0);
        Ok(Self {
            local,
            parties,
            registered,
        })
    }

    pub fn local(&self) -> u8 {
        self.local
    }

    /// Total number of parties, including the local one.
    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }

    pub fn get(&self, id: u8) -> Option<&Party> {
        self.parties.get(usize::from(id))
    }

    /// Every party other than the local one.
    pub fn peers(&self) -> impl Iterator<Item = &Party> {
        let local = self.local;
        self.parties.iter().filter(move |p| p.id != local)
    }

    /// Parties the local party dials (strictly greater identities).
    pub fn dial_targets(&self) -> impl Iterator<Item = &Party> {
        let local = self.local;
        self.parties.iter().filter(move |p| p.id > local)
    }

    /// Number of parties expected to dial in (strictly lesser identities).
    pub fn expected_inbound(&self) -> usize {
        usize::from(self.local)
    }

    /// Check that an inbound handshake names a party allowed to dial us.
    pub fn check_inbound(&self, peer: u8) -> Result<(), ProtocolError> {
        let party = self.get(peer).ok_or(ProtocolError::UnknownPeer(peer))?;
        if peer >= self.local || party.connection().is_some() {
            return Err(ProtocolError::UnexpectedPeer(peer));
        }
        Ok(())
    }

    /// Attach a handshaken connection to its party's slot. Each slot is
    /// written once; the barrier opens when every peer slot is filled.
    pub fn register(&self, peer: u8, connection: Arc<PeerConnection>) -> Result<(), ProtocolError> {
        if peer == self.local {
            return Err(ProtocolError::UnexpectedPeer(peer));
        }
        let party = self.get(peer).ok_or(ProtocolError::UnknownPeer(peer))?;
        party
            .connection
            .set(Arc::clone(&connection))
            .map_err(|_| ProtocolError::UnexpectedPeer(peer))?;
        connection.mark_established();

        self.registered.send_modify(|n| *n += 1);
        let count = self.connected_count();
        debug!("Registered {party} ({count}/{})", self.len() - 1);
        if self.is_connected() {
            info!("Party {}: all {} peers connected", self.local, count);
        }
        Ok(())
    }

    /// Number of peer slots filled so far.
    pub fn connected_count(&self) -> usize {
        *self.registered.borrow()
    }

    /// Whether every peer slot is filled.
    pub fn is_connected(&self) -> bool {
        self.connected_count() == self.len() - 1
    }

    /// The session barrier: resolves once every peer slot is filled.
    pub async fn wait_connected(&self) {
        let expected = self.len() - 1;
        let mut rx = self.registered.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == expected).await;
    }

    /// Close every registered connection. Slots that never filled are skipped.
    pub async fn close_all(&self) {
        for party in self.peers() {
            if let Some(connection) = party.connection() {
                connection.close().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
