//! Buzz runtime
//!
//! The virtual machine and swarm-coordination runtime. A host embeds one
//! [`Vm`] per robot, loads bytecode produced by the compiler, and drives
//! it once per control step:
//!
//! ```rust,ignore
//! // 1. Deliver whatever the radio heard since the last step.
//! for packet in radio.received() {
//!     vm.receive_packet(&packet);
//! }
//! vm.process_in_messages();
//!
//! // 2. Rebuild the neighbor table from range-and-bearing readings.
//! vm.neighbors_reset();
//! for obs in sensors.neighbors() {
//!     vm.neighbors_add(obs.id, obs.distance, obs.azimuth, obs.elevation);
//! }
//!
//! // 3. Run the script's step function.
//! vm.function_call("step", 0);
//!
//! // 4. Collect this step's outbound packet and transmit it.
//! vm.process_out_messages();
//! radio.transmit(vm.send_packet());
//! ```
//!
//! Everything a script can reach lives inside the `Vm`: heap, string
//! interner, stacks, globals, message queues, swarm state. Nothing is
//! process-global, so many VMs can coexist in one simulator process.

pub mod neighbors;
pub mod queues;
pub mod stdlib;
pub mod swarm;
pub mod vm;
pub mod vstig;

pub use queues::{InMsgQueue, OutMessage, OutMsgQueue};
pub use swarm::SwarmMembers;
pub use vm::{BuzzFn, Vm, VmConfig, VmError, VmErrorKind, VmState};
pub use vstig::{Vstig, VstigEntry};
