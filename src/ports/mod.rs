//! Port arbitration: advisory allocations, live probing, stack heuristics
//! and conflict detection.

pub mod conflict;
pub mod probe;
pub mod registry;
pub mod stack;

pub use conflict::{check_conflicts, Claimant, PortConflict};
pub use probe::{HostProcess, PortOccupant, PortProbe, SystemProbe};
pub use registry::{
    AllocationOwner, BandUsage, PortAllocation, PortRecommendation, PortRegistry, PortStatistics,
};
pub use stack::{default_port, detect_tech_stack, PortBand, PORT_BANDS};
