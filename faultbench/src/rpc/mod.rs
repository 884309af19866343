//! Interface to a ledger node and the credential registry contract deployed on it.
//!
//! The harness treats the ledger as an opaque collaborator: it only needs to query chain
//! height, deploy a fresh registry instance, authorize an issuer, issue a record, and read a
//! record's status. [Dialer] binds a [Client] to one node's endpoint. [jsonrpc] provides the
//! implementation used against Ethereum-style development nodes.

use crate::Error;
use std::{future::Future, time::Duration};

pub use alloy_primitives::{Address, B256};

pub mod identity;
pub mod jsonrpc;

/// Hash arbitrary text into a record identifier.
pub fn hash(text: &str) -> B256 {
    alloy_primitives::keccak256(text)
}

/// Binds [Client]s to node endpoints.
pub trait Dialer: Clone + Send + Sync + 'static {
    /// Client bound to a single endpoint.
    type Client: Client;

    /// Bind a client to `endpoint`. No I/O is performed until the client is used.
    fn dial(&self, endpoint: &str) -> Self::Client;
}

/// Operations the harness performs against one node's ledger.
pub trait Client: Clone + Send + Sync + 'static {
    /// Returns the node's current chain height.
    fn block_number(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Deploy a fresh registry contract owned by `from` and return its address.
    fn deploy(&self, from: &Address) -> impl Future<Output = Result<Address, Error>> + Send;

    /// Authorize `issuer` to issue records on `contract`.
    fn authorize(
        &self,
        contract: &Address,
        from: &Address,
        issuer: &Address,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Issue `record` on `contract` and wait up to `confirmation` for it to be confirmed.
    fn issue(
        &self,
        contract: &Address,
        from: &Address,
        record: &B256,
        confirmation: Duration,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Read the status of `record` on `contract`.
    ///
    /// Returns [Error::Reverted] if the record cannot be resolved.
    fn status(
        &self,
        contract: &Address,
        record: &B256,
    ) -> impl Future<Output = Result<u64, Error>> + Send;
}
