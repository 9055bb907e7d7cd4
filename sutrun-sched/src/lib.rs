//! Fault-tolerant test scheduling.
//!
//! [`TestScheduler`] runs a batch of tests on a SUT and turns kernel panics,
//! taints and unresponsive SUTs into typed errors once every attempt is
//! recorded. [`SuiteScheduler`] runs suites on top of it and reboots the SUT
//! whenever such an error comes back.

pub mod scheduler;
pub mod suite_scheduler;
pub mod test_scheduler;

pub use scheduler::Scheduler;
pub use suite_scheduler::SuiteScheduler;
pub use test_scheduler::TestScheduler;
