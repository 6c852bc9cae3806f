//! Pulse-sequencing controller daemon.
//!
//! The crate splits along the thread boundary of the runtime: the frontend
//! ([`iface::CtrlIface`], driven by the transport [`server::Server`]) and
//! the backend worker ([`controller::Controller`]) that owns the
//! [`pulser::Pulser`] hardware capability. Requests travel through the
//! filter queues in [`queue`], replies come back through the read cache in
//! [`cache`] and the sequence notifications in [`api::SeqEvent`].

pub mod api;
pub mod cache;
pub mod config;
pub mod controller;
pub mod evt;
pub mod iface;
pub mod names;
pub mod proto;
pub mod queue;
mod runner;
pub mod seq;
pub mod server;
pub mod startup;

pub use pulser;
