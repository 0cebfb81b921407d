// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Traits which describe the boundary between the switch, its links, and the subsystems a node
//! plugs in around them.

use crate::ln::link::ForwardingPolicy;
use crate::ln::mailbox::{MailBox, MailboxFull};
use crate::ln::msgs::{FailureReason, Message};
use crate::ln::switch::{ForwardError, ForwardingEvent, HtlcPacket, HtlcResolution};
use crate::ln::types::{ChannelId, PaymentHash, PaymentPreimage};
use crate::util::errors::APIError;

use bitcoin::secp256k1::PublicKey;

use std::sync::Arc;

/// An interface which adapts a single payment channel to the switch.
///
/// A link owns the channel's view of pending HTLCs and its forwarding policy, consumes the
/// mailbox attached via [`ChannelLink::attach_mailbox`], and talks to the channel's counterparty
/// through a [`Peer`].
pub trait ChannelLink: Send + Sync {
	/// Returns the channel ID which uniquely identifies this link's channel.
	fn chan_id(&self) -> ChannelId;

	/// Returns the short channel id by which the rest of the network addresses this channel, or
	/// `None` if the funding transaction has not yet confirmed.
	fn short_chan_id(&self) -> Option<u64>;

	/// Re-derives the short channel id from the current confirmed location of the funding
	/// transaction, e.g. after a reorg has moved it.
	///
	/// Callers other than [`Switch::update_link_scid`] must arrange for the switch's index to be
	/// rebuilt, or the link will no longer be addressable.
	///
	/// [`Switch::update_link_scid`]: crate::ln::switch::Switch::update_link_scid
	fn update_short_chan_id(&self) -> Result<u64, APIError>;

	/// Atomically replaces the forwarding policy applied to HTLCs which have not yet been
	/// admitted. In-flight HTLCs are unaffected.
	fn update_forwarding_policy(&self, policy: ForwardingPolicy);

	/// Checks whether an HTLC with the given amounts and expiries may be forwarded over this
	/// channel under its current policy and bandwidth.
	///
	/// The bandwidth portion of this check is a point-in-time snapshot. The switch re-validates
	/// it under its own in-flight reservations before committing to the forward.
	fn htlc_satisfies_policy(
		&self, payment_hash: &PaymentHash, incoming_amt_msat: u64, amt_to_forward: u64,
		incoming_cltv_expiry: u32, outgoing_cltv_value: u32, best_block_height: u32,
	) -> Result<(), FailureReason>;

	/// Returns the value, in msat, this link can currently carry in a new outgoing HTLC: the
	/// local balance less in-flight outbound HTLCs and the channel reserve.
	fn bandwidth_msat(&self) -> u64;

	/// Returns `(total updates processed, total msat sent, total msat received)` over this
	/// link's lifetime.
	fn stats(&self) -> (u64, u64, u64);

	/// Returns the node ID of the channel's counterparty.
	fn peer_node_id(&self) -> PublicKey;

	/// Whether the switch may route new HTLCs over this link. Requires the link to be active
	/// with a confirmed funding transaction and free bandwidth.
	fn eligible_to_forward(&self) -> bool;

	/// Attaches the mailbox this link consumes from. Must be called before [`ChannelLink::start`].
	///
	/// Re-attaching a previously-used mailbox hands the link any messages delivered while it was
	/// stopped.
	fn attach_mailbox(&self, mailbox: Arc<MailBox>);

	/// Delivers an HTLC admitted by the switch for forwarding over this channel.
	fn handle_switch_packet(&self, packet: HtlcPacket) -> Result<(), MailboxFull>;

	/// Delivers the resolution of an HTLC this link previously handed to the switch.
	fn handle_switch_resolution(&self, resolution: HtlcResolution) -> Result<(), MailboxFull>;

	/// Delivers a channel-update message received from the link's peer.
	fn handle_channel_update(&self, msg: Message) -> Result<(), MailboxFull>;

	/// Starts the link's worker, which drains the attached mailbox until [`ChannelLink::stop`].
	///
	/// Errors if no mailbox has been attached or the link is already running.
	fn start(&self) -> Result<(), APIError>;

	/// Signals the link's worker to exit and blocks until it has.
	fn stop(&self);

	/// Instructs the link's peer to forget all state for the channel, called by the switch after
	/// the link has been permanently removed.
	fn wipe_channel(&self);
}

/// The error returned when a [`Peer`] cannot act on a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerError {
	/// The message could not be sent, e.g. the connection is down.
	SendFailed,
}

/// The connection to a channel counterparty, provided by the node's transport layer.
pub trait Peer: Send + Sync {
	/// Enqueues a message to the remote peer. If `sync` is set, blocks until the message has
	/// been handed to the underlying transport.
	fn send_message(&self, msg: Message, sync: bool) -> Result<(), PeerError>;

	/// Removes all state the transport layer holds for the channel with the given funding
	/// outpoint, after its link has been permanently removed.
	fn wipe_channel(&self, channel_point: &bitcoin::OutPoint) -> Result<(), PeerError>;

	/// Returns the node ID of the remote peer.
	fn node_id(&self) -> PublicKey;
}

/// An invoice registered with the node, payable by an HTLC terminating here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invoice {
	/// The preimage released to the payer on settlement.
	pub payment_preimage: PaymentPreimage,
	/// The value, in msat, the invoice demands.
	pub amt_msat: u64,
	/// The minimum number of blocks which must remain on an HTLC's expiry, beyond the current
	/// height, for it to be accepted in payment of this invoice.
	pub min_final_cltv_expiry_delta: u32,
	/// Whether the invoice has already been settled.
	pub settled: bool,
}

/// The error returned by [`InvoiceDatabase`] lookups and settlement attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvoiceError {
	/// No invoice with the given payment hash is registered.
	NotFound,
	/// The invoice was already settled and cannot be settled again.
	AlreadySettled,
}

/// The node's registry of payable invoices, consulted when an HTLC names this node as its final
/// hop.
pub trait InvoiceDatabase: Send + Sync {
	/// Looks up the invoice with the given payment hash.
	fn lookup_invoice(&self, payment_hash: &PaymentHash) -> Result<Invoice, InvoiceError>;

	/// Marks the invoice with the given payment hash settled, releasing its preimage for use.
	///
	/// Settlement is not idempotent: a second attempt errors with
	/// [`InvoiceError::AlreadySettled`], which callers must treat as a failed payment rather
	/// than settle the same invoice twice.
	fn settle_invoice(&self, payment_hash: &PaymentHash) -> Result<(), InvoiceError>;
}

/// A durable log of completed forwards, written in batches by the switch.
pub trait ForwardingLog: Send + Sync {
	/// Persists a batch of forwarding events.
	///
	/// On error the switch re-queues the batch and retries on a later flush, so implementations
	/// which partially persisted a batch must tolerate seeing its events again.
	fn add_forwarding_events(&self, events: &[ForwardingEvent]) -> Result<(), ()>;
}

/// The switch functionality a link depends on, kept narrow so links need not know about the
/// concrete [`Switch`].
///
/// [`Switch`]: crate::ln::switch::Switch
pub trait HtlcForwarder: Send + Sync {
	/// Routes an HTLC received by the calling link towards its outgoing channel, or to the local
	/// invoice registry if this node is the final hop.
	fn forward_htlc(&self, packet: HtlcPacket) -> Result<(), ForwardError>;

	/// Resolves an in-flight HTLC, propagating a settle or fail back towards the channel it
	/// arrived on.
	fn resolve_htlc(&self, resolution: HtlcResolution);

	/// Notes that the outgoing link has taken ownership of a forwarded HTLC, so the switch can
	/// release its bandwidth reservation in favor of the link's own accounting.
	fn packet_committed(&self, incoming_chan_id: ChannelId, incoming_htlc_id: u64);
}
