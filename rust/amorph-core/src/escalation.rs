//! Escalation routing for aborted work items.
//!
//! When an iteration aborts on a conflict, its item is re-enqueued on some
//! worker's retry queue. Each retry must increase the expected physical
//! distance between the retrying worker and the worker it previously
//! conflicted with, so contention on a hot logical lock dissipates with
//! growing radius. The routing here is pure arithmetic over a
//! [`Topology`]; the abort handler in `amorph-rt` applies it.

use crate::ids::WorkerId;
use crate::topology::Topology;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// How aborted items are placed on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationPolicy {
    /// Always climb the package tree: retries land on the leader of package
    /// `p / 2`. Suited to small machines (two packages or fewer).
    Basic,
    /// Alternate between retrying locally (odd retries) and moving halfway
    /// toward the package leader, then up the package tree (even retries).
    /// The default on machines with more than two packages.
    Double,
    /// Stay local for the first two retries, climb within the package up to
    /// retry five, then climb the package tree.
    Bounded,
    /// Never move: every retry stays on the aborting worker.
    Eager,
}

/// The policy used when the caller does not pick one: [`Basic`] on two
/// packages or fewer, [`Double`] otherwise.
///
/// [`Basic`]: EscalationPolicy::Basic
/// [`Double`]: EscalationPolicy::Double
pub fn auto_policy(topo: &Topology) -> EscalationPolicy {
    if topo.packages() <= 2 {
        EscalationPolicy::Basic
    } else {
        EscalationPolicy::Double
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// The worker whose retry queue receives an item aborted on `from` for the
/// `retries`-th time (`retries >= 1`).
pub fn destination(
    policy: EscalationPolicy,
    topo: &Topology,
    from: WorkerId,
    retries: u32,
) -> WorkerId {
    match policy {
        EscalationPolicy::Eager => from,
        EscalationPolicy::Basic => climb_packages(topo, from),
        EscalationPolicy::Double => {
            if retries % 2 == 1 {
                from
            } else if !topo.is_package_leader(from) {
                halfway_to_leader(topo, from)
            } else {
                climb_packages(topo, from)
            }
        }
        EscalationPolicy::Bounded => {
            if retries < 2 {
                from
            } else if retries < 5 && !topo.is_package_leader(from) {
                halfway_to_leader(topo, from)
            } else {
                climb_packages(topo, from)
            }
        }
    }
}

/// The integer midpoint between a worker and its package leader.
fn halfway_to_leader(topo: &Topology, from: WorkerId) -> WorkerId {
    let leader = topo.package_leader(from);
    WorkerId::new((from.index() + leader.index()) / 2)
}

/// The leader of package `p / 2`, where `p` is `from`'s package.
fn climb_packages(topo: &Topology, from: WorkerId) -> WorkerId {
    let p = topo.package_of(from);
    topo.leader_of(crate::ids::PackageId::new(p.index() / 2))
}
