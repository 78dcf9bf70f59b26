pub mod config;
pub mod controller;
pub mod iptables;
pub mod logging;
pub mod node;
pub mod reconcile;
pub mod rules;
pub mod shell_command_ext;

#[cfg(test)]
mod mocks;

