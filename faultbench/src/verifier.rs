//! Compare the observed state of a fixed probe set across nodes.
//!
//! The probe set is derived from fixed labels and never overlaps the records issued while a
//! fault is injected, so a positive result establishes agreement on a static baseline rather
//! than on the records mutated during the scenario.

use crate::{
    connector::Connection,
    rpc::{self, Client, B256},
    Error, NodeId,
};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// Number of records in the probe set.
pub const PROBE_RECORDS: usize = 5;

/// Observed status of every probe record that resolved on one node.
pub type Sample = BTreeMap<B256, u64>;

/// Returns the fixed probe set.
pub fn probe_set() -> Vec<B256> {
    (0..PROBE_RECORDS)
        .map(|i| rpc::hash(&format!("test-cert-{i}")))
        .collect()
}

/// Query every record of `probes` on one node.
///
/// Records that cannot be resolved are omitted. Any other failure aborts the sample.
pub async fn sample<C: Client>(
    id: NodeId,
    connection: &Connection<C>,
    probes: &[B256],
) -> Result<Sample, Error> {
    let mut sample = Sample::new();
    for record in probes {
        match connection.client.status(&connection.contract, record).await {
            Ok(status) => {
                sample.insert(*record, status);
            }
            Err(Error::Reverted(_)) => {}
            Err(e) => {
                return Err(Error::ConsistencyProbe {
                    node: id,
                    reason: e.to_string(),
                })
            }
        }
    }
    Ok(sample)
}

/// Returns true if every node reports exactly the same sample as the first.
///
/// Returns false if no nodes are provided or any node fails while probing.
pub async fn verify<C: Client>(nodes: &[(NodeId, &Connection<C>)]) -> bool {
    let probes = probe_set();
    let mut reference: Option<(NodeId, Sample)> = None;
    for (id, connection) in nodes {
        let observed = match sample(*id, connection, &probes).await {
            Ok(observed) => observed,
            Err(e) => {
                error!(error = %e, "consistency probe failed");
                return false;
            }
        };
        debug!(node = id, resolved = observed.len(), "sampled probe set");
        match &reference {
            None => reference = Some((*id, observed)),
            Some((reference_id, expected)) => {
                if *expected != observed {
                    warn!(
                        node = id,
                        reference = reference_id,
                        ?expected,
                        ?observed,
                        "node state diverges"
                    );
                    return false;
                }
            }
        }
    }
    if reference.is_none() {
        warn!("no nodes available for consistency check");
        return false;
    }
    true
}
