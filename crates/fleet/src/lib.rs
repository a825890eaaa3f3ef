//! Fleet command-line front end
//!
//! `fleet run` owns the control loop. Every other mutating subcommand drops a
//! command into the loop's inbox directory, so the CLI never writes the queue
//! file behind the running engine's back.

pub mod app;
pub mod cli;
pub mod render;
