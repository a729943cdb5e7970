//! Definition of structures shared by the router and processes:
//! process identities, protocol commands and inbound queues.

pub mod command;
pub mod pid;
pub mod queue;

#[cfg(test)]
mod tests;
