//! Bind a usable registry contract to every running node.
//!
//! A [Connection] is only valid for the process generation it was established against: once
//! the [Registry] relaunches a node, the connection must be recreated before it is used again.

use crate::{
    registry::{Launcher, Registry},
    rpc::{Address, Client, Dialer},
    Error, NodeId,
};
use std::collections::BTreeMap;
use tracing::{error, info};

/// A deployed and authorized registry contract on one node.
#[derive(Clone)]
pub struct Connection<C: Client> {
    /// Client bound to the node's endpoint
    pub client: C,

    /// Address of the registry contract deployed on the node
    pub contract: Address,

    /// Process generation the contract was deployed against
    pub generation: u64,
}

/// Establishes and tracks [Connection]s.
pub struct Connector<D: Dialer> {
    identity: Address,
    connections: BTreeMap<NodeId, Connection<D::Client>>,
}

impl<D: Dialer> Connector<D> {
    /// Create a connector that deploys and issues as `identity`.
    pub fn new(identity: Address) -> Self {
        Self {
            identity,
            connections: BTreeMap::new(),
        }
    }

    /// Returns the account used for every transaction.
    pub fn identity(&self) -> &Address {
        &self.identity
    }

    /// Deploy a fresh registry contract on `id` and authorize the harness identity as an issuer.
    ///
    /// Any previous connection to `id` is discarded first, so a failed attempt never leaves a
    /// stale connection behind.
    pub async fn connect<L: Launcher>(
        &mut self,
        registry: &mut Registry<L, D>,
        id: NodeId,
    ) -> Result<(), Error> {
        self.connections.remove(&id);
        match self.try_connect(registry, id).await {
            Ok(connection) => {
                info!(
                    node = id,
                    contract = %connection.contract,
                    generation = connection.generation,
                    "connected to node"
                );
                self.connections.insert(id, connection);
                Ok(())
            }
            Err(e) => {
                error!(node = id, error = %e, "failed to connect to node");
                Err(e)
            }
        }
    }

    async fn try_connect<L: Launcher>(
        &self,
        registry: &mut Registry<L, D>,
        id: NodeId,
    ) -> Result<Connection<D::Client>, Error> {
        if !registry.is_running(id).await {
            return Err(Error::NodeNotRunning(id));
        }
        let endpoint = registry.endpoint(id).ok_or(Error::UnknownNode(id))?;
        let generation = registry.generation(id).ok_or(Error::UnknownNode(id))?;
        let client = registry.dialer().dial(endpoint);

        let contract = client.deploy(&self.identity).await?;
        client
            .authorize(&contract, &self.identity, &self.identity)
            .await?;
        Ok(Connection {
            client,
            contract,
            generation,
        })
    }

    /// Connect to every node in `ids`, returning those that succeeded.
    pub async fn connect_all<L: Launcher>(
        &mut self,
        registry: &mut Registry<L, D>,
        ids: &[NodeId],
    ) -> Vec<NodeId> {
        let mut connected = Vec::new();
        for id in ids {
            if self.connect(registry, *id).await.is_ok() {
                connected.push(*id);
            }
        }
        connected
    }

    /// Forget the connection to `id`.
    pub fn disconnect(&mut self, id: NodeId) {
        self.connections.remove(&id);
    }

    /// Returns the connection to `id`, if any (live or not).
    pub fn get(&self, id: NodeId) -> Option<&Connection<D::Client>> {
        self.connections.get(&id)
    }

    /// Returns the connection to `id` if it was established against the node's current
    /// process generation.
    pub fn live<L: Launcher>(
        &self,
        registry: &Registry<L, D>,
        id: NodeId,
    ) -> Option<&Connection<D::Client>> {
        let generation = registry.generation(id)?;
        self.connections
            .get(&id)
            .filter(|connection| connection.generation == generation)
    }

    /// Returns the ids with a connection established against the node's current generation.
    pub fn live_nodes<L: Launcher>(&self, registry: &Registry<L, D>) -> Vec<NodeId> {
        self.connections
            .keys()
            .copied()
            .filter(|id| self.live(registry, *id).is_some())
            .collect()
    }
}
