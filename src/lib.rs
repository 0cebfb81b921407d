// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The HTLC forwarding core of a lightning node.
//!
//! This crate implements the plumbing which sits between the per-channel
//! state machines of a lightning node, routing HTLCs between them. It is
//! runtime-agnostic and transport-agnostic: peers, invoice storage and
//! durable forwarding logs are pluggable via traits, and onion processing is
//! left to the caller, which hands links already-decoded per-hop routing
//! instructions.
//!
//! At a high level the pieces fit together as follows:
//!  * [`ln::switch::Switch`] is the central router. It resolves outgoing
//!    short channel ids to links, tracks in-flight payment circuits, and
//!    batches forwarding events for durable storage.
//!  * [`ln::link::Link`] adapts one channel to the switch, enforcing the
//!    channel's forwarding policy and bandwidth and talking to its peer.
//!  * [`ln::mailbox::MailBox`] is the bounded inbox through which all
//!    messages reach a link, decoupling message producers from the link's
//!    worker.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

#[macro_use]
pub mod util;
pub mod ln;
