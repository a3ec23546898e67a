//! Knative xDS controller indexes
//!
//! The indexes hold the cluster state that configuration is derived from. They are updated by
//! watch tasks and read by the reconciler at the start of each pass:
//!
//! - Each Knative `Route` becomes a routable service. Its externally visible host and its
//!   resolved traffic targets are taken from the route's status.
//! - Each `EndpointSlice` belonging to a revision's service contributes the ready addresses and
//!   the HTTP port of that revision.
//!
//! ```text
//! [ Route ] -> [ TrafficTarget ] -> revision name <- [ EndpointSlice ]
//! ```
//!
//! Both indexes raise a change signal whenever their content changes. Signals carry no payload:
//! the reconciler always reads the current state of both indexes, regardless of which signal
//! woke it.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoints;
pub mod routes;
