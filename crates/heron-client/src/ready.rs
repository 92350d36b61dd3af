// Splits the consumer's in-flight budget into per-connection RDY targets.
//
// Pure functions over a snapshot of the live connections: the engine builds
// the snapshot, calls `distribute`, and sends the resulting RDY counts.
// Connections that vanished are simply absent from the next snapshot, so
// their share flows to the survivors on the next cycle.
use rand::Rng;
use rand::seq::SliceRandom;

use crate::ConnectionId;
use crate::backoff::BackoffMode;

/// What the distributor needs to know about one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCredit {
    pub id: ConnectionId,
    /// Ceiling advertised by the peer in its identify response.
    pub max_rdy: u32,
    /// Last RDY count sent.
    pub granted: u32,
    pub in_flight: u32,
    /// No message received for longer than the low-ready idle timeout.
    pub idle: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Distribution {
    /// One entry per input connection, in input order.
    pub targets: Vec<(ConnectionId, u32)>,
    /// Connection carrying the throughput-test credit, if any.
    pub probe: Option<ConnectionId>,
}

impl Distribution {
    pub fn total(&self) -> u64 {
        self.targets.iter().map(|(_, target)| *target as u64).sum()
    }

    pub fn target(&self, id: ConnectionId) -> Option<u32> {
        self.targets
            .iter()
            .find(|(candidate, _)| *candidate == id)
            .map(|(_, target)| *target)
    }
}

/// Computes a target credit per connection. `connections` must be in
/// insertion order; remainders go to the earliest ones.
///
/// ```
/// use heron_client::ConnectionId;
/// use heron_client::backoff::BackoffMode;
/// use heron_client::ready::{ConnectionCredit, distribute};
///
/// let credit = |id| ConnectionCredit {
///     id: ConnectionId(id),
///     max_rdy: 2500,
///     granted: 0,
///     in_flight: 0,
///     idle: false,
/// };
/// let plan = distribute(
///     10,
///     BackoffMode::Normal,
///     &[credit(1), credit(2)],
///     None,
///     &mut rand::thread_rng(),
/// );
/// assert_eq!(plan.targets, vec![(ConnectionId(1), 5), (ConnectionId(2), 5)]);
/// ```
pub fn distribute<R: Rng + ?Sized>(
    budget: u32,
    mode: BackoffMode,
    connections: &[ConnectionCredit],
    probe_holder: Option<ConnectionId>,
    rng: &mut R,
) -> Distribution {
    if connections.is_empty() {
        return Distribution::default();
    }
    match mode {
        BackoffMode::Backoff => zeroed(connections, None),
        BackoffMode::ThroughputTest => throughput_test(connections, probe_holder, rng),
        BackoffMode::Normal if budget == 0 => zeroed(connections, None),
        BackoffMode::Normal if connections.len() as u64 <= budget as u64 => {
            even_split(budget, connections)
        }
        BackoffMode::Normal => rotate(budget, connections, rng),
    }
}

/// True when the remaining credit on a connection is low enough that its
/// target should be re-sent before it runs dry.
pub fn needs_refresh(target: u32, remaining: u32) -> bool {
    target > 0 && (remaining <= 1 || remaining < target / 4)
}

fn zeroed(connections: &[ConnectionCredit], probe: Option<ConnectionId>) -> Distribution {
    Distribution {
        targets: connections.iter().map(|conn| (conn.id, 0)).collect(),
        probe,
    }
}

fn throughput_test<R: Rng + ?Sized>(
    connections: &[ConnectionCredit],
    probe_holder: Option<ConnectionId>,
    rng: &mut R,
) -> Distribution {
    let holder = probe_holder.and_then(|id| connections.iter().find(|conn| conn.id == id));
    if connections.iter().any(|conn| conn.in_flight > 0) {
        return zeroed(connections, holder.map(|conn| conn.id));
    }
    let probe = match holder {
        // A holder that has gone quiet hands the credit to another peer.
        Some(conn) if conn.idle && connections.len() > 1 => {
            let others: Vec<&ConnectionCredit> = connections
                .iter()
                .filter(|other| other.id != conn.id)
                .collect();
            others[rng.gen_range(0..others.len())].id
        }
        Some(conn) => conn.id,
        None => connections[rng.gen_range(0..connections.len())].id,
    };
    Distribution {
        targets: connections
            .iter()
            .map(|conn| (conn.id, u32::from(conn.id == probe)))
            .collect(),
        probe: Some(probe),
    }
}

fn even_split(budget: u32, connections: &[ConnectionCredit]) -> Distribution {
    let mut targets: Vec<u32> = vec![0; connections.len()];
    let active: Vec<usize> = connections
        .iter()
        .enumerate()
        .filter(|(_, conn)| !conn.idle)
        .map(|(index, _)| index)
        .collect();
    // Idle connections are parked on a single credit, unless nothing is
    // active, in which case everyone shares equally.
    let sharing: Vec<usize> = if active.is_empty() {
        (0..connections.len()).collect()
    } else {
        for (index, conn) in connections.iter().enumerate() {
            if conn.idle {
                targets[index] = 1;
            }
        }
        active
    };
    let parked = (connections.len() - sharing.len()) as u32;
    let available = budget - parked;
    let share = available / sharing.len() as u32;
    let remainder = available as usize % sharing.len();
    for (position, index) in sharing.iter().enumerate() {
        targets[*index] = share + u32::from(position < remainder);
    }

    let mut excess = 0u32;
    for (index, conn) in connections.iter().enumerate() {
        let ceiling = conn.max_rdy.max(1);
        if targets[index] > ceiling {
            excess += targets[index] - ceiling;
            targets[index] = ceiling;
        }
    }
    for index in &sharing {
        if excess == 0 {
            break;
        }
        let headroom = connections[*index].max_rdy.max(1) - targets[*index];
        let extra = headroom.min(excess);
        targets[*index] += extra;
        excess -= extra;
    }

    Distribution {
        targets: connections
            .iter()
            .zip(targets)
            .map(|(conn, target)| (conn.id, target))
            .collect(),
        probe: None,
    }
}

// More connections than credit: each connection gets at most one, holders
// that are still receiving keep theirs, and the rest rotate randomly.
fn rotate<R: Rng + ?Sized>(
    budget: u32,
    connections: &[ConnectionCredit],
    rng: &mut R,
) -> Distribution {
    let mut targets: Vec<u32> = vec![0; connections.len()];
    let mut slots = budget;
    for (index, conn) in connections.iter().enumerate() {
        if slots == 0 {
            break;
        }
        if conn.granted > 0 && !conn.idle {
            targets[index] = 1;
            slots -= 1;
        }
    }

    let mut starving: Vec<usize> = Vec::new();
    let mut idle_holders: Vec<usize> = Vec::new();
    for (index, conn) in connections.iter().enumerate() {
        if targets[index] > 0 {
            continue;
        }
        if conn.granted == 0 {
            starving.push(index);
        } else {
            idle_holders.push(index);
        }
    }
    starving.shuffle(rng);
    idle_holders.shuffle(rng);
    for index in starving.into_iter().chain(idle_holders) {
        if slots == 0 {
            break;
        }
        targets[index] = 1;
        slots -= 1;
    }

    Distribution {
        targets: connections
            .iter()
            .zip(targets)
            .map(|(conn, target)| (conn.id, target))
            .collect(),
        probe: None,
    }
}
