//! Programs the supervisor starts by default: the worker HTTP service and the built-in
//! actions. Both talk to the supervisor through [`crate::process::link`].

pub mod update;
pub mod worker;
