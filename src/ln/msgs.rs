// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire messages, traits representing wire message handlers, and a few error types live here.
//!
//! Only the channel-update subset of the BOLT#2 message set is represented, as these are the
//! messages which flow through a link while a channel is operating. Serialization to and from the
//! raw wire encoding is the responsibility of the transport layer, which hands us structs.

use crate::ln::types::{ChannelId, PaymentHash, PaymentPreimage};

use std::fmt;

/// The maximum value which may be expressed in millisatoshi, i.e. 21 million bitcoin.
pub const MAX_VALUE_MSAT: u64 = 21_000_000_0000_0000_000;

// BOLT#4 failure code flags.
/// The failure is permanent for this node or channel.
pub const PERM: u16 = 0x4000;
/// The failure may be transient and carries a channel update.
pub const UPDATE: u16 = 0x1000;

/// The per-hop routing instruction recovered from an onion packet.
///
/// Onion processing is performed outside this crate. The decoded instruction for the local hop is
/// attached to the [`UpdateAddHTLC`] which carried the onion, telling the switch where the HTLC
/// goes next and under what terms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HopData {
	/// The short channel id of the channel over which the HTLC should be forwarded next, or 0 if
	/// this node is the final hop and should claim the HTLC against a local invoice.
	pub short_channel_id: u64,
	/// The value, in msat, which should be offered to the next hop (or claimed locally).
	pub amt_to_forward: u64,
	/// The CLTV expiry, as an absolute block height, of the HTLC offered to the next hop.
	pub outgoing_cltv_value: u32,
}

/// An [`update_add_htlc`] message to be sent to or received from a peer.
///
/// [`update_add_htlc`]: https://github.com/lightning/bolts/blob/master/02-peer-protocol.md
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateAddHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The HTLC value in milli-satoshi
	pub amount_msat: u64,
	/// The payment hash, the pre-image of which controls HTLC redemption
	pub payment_hash: PaymentHash,
	/// The expiry height of the HTLC
	pub cltv_expiry: u32,
	/// The routing instruction for the local hop, recovered from the onion by the transport
	/// layer. `None` on locally-constructed outbound messages, as the onion for the next hop can
	/// only be peeled by its recipient.
	pub hop_data: Option<HopData>,
}

/// An [`update_fulfill_htlc`] message to be sent to or received from a peer.
///
/// [`update_fulfill_htlc`]: https://github.com/lightning/bolts/blob/master/02-peer-protocol.md
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFulfillHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The pre-image of the payment hash, allowing HTLC redemption
	pub payment_preimage: PaymentPreimage,
}

/// An [`update_fail_htlc`] message to be sent to or received from a peer.
///
/// [`update_fail_htlc`]: https://github.com/lightning/bolts/blob/master/02-peer-protocol.md
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The reason the HTLC failed. On the wire this would be an encrypted blob only readable by
	/// the payment's originator, but encryption of failures is the onion layer's concern.
	pub reason: FailureReason,
}

/// A [`commitment_signed`] message to be sent to or received from a peer, committing all pending
/// updates on a channel to a new commitment transaction.
///
/// [`commitment_signed`]: https://github.com/lightning/bolts/blob/master/02-peer-protocol.md
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitmentSigned {
	/// The channel ID
	pub channel_id: ChannelId,
}

/// A wrapper for a channel-update message as it flows through a link's mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
	/// An update_add_htlc message
	UpdateAddHTLC(UpdateAddHTLC),
	/// An update_fulfill_htlc message
	UpdateFulfillHTLC(UpdateFulfillHTLC),
	/// An update_fail_htlc message
	UpdateFailHTLC(UpdateFailHTLC),
	/// A commitment_signed message
	CommitmentSigned(CommitmentSigned),
}

impl Message {
	/// The channel this message pertains to.
	pub fn channel_id(&self) -> ChannelId {
		match self {
			Message::UpdateAddHTLC(msg) => msg.channel_id,
			Message::UpdateFulfillHTLC(msg) => msg.channel_id,
			Message::UpdateFailHTLC(msg) => msg.channel_id,
			Message::CommitmentSigned(msg) => msg.channel_id,
		}
	}
}

/// The reason an HTLC was failed back to the sender, mapping onto the BOLT#4 failure codes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
	/// The channel to the next hop cannot currently carry the HTLC, e.g. it has insufficient
	/// bandwidth or its link is temporarily unavailable.
	TemporaryChannelFailure,
	/// The channel to the next hop is gone and will not come back.
	PermanentChannelFailure,
	/// No channel with the requested outgoing short channel id is known.
	UnknownNextPeer,
	/// The HTLC value is below the outgoing channel's advertised htlc_minimum_msat.
	AmountBelowMinimum {
		/// The offered value, in msat.
		htlc_msat: u64,
	},
	/// The HTLC value is above the outgoing channel's htlc_maximum_msat.
	///
	/// BOLT#4 has no dedicated code for this, so it maps to `temporary_channel_failure` on the
	/// wire, but the distinction is kept internally for logging and diagnostics.
	AmountAboveMaximum {
		/// The offered value, in msat.
		htlc_msat: u64,
	},
	/// The fee implied by the incoming and outgoing HTLC values does not meet the outgoing
	/// channel's advertised fee policy.
	FeeInsufficient {
		/// The incoming value, in msat.
		htlc_msat: u64,
	},
	/// The difference between the incoming and outgoing CLTV expiries is below the outgoing
	/// channel's advertised cltv_expiry_delta.
	IncorrectCltvExpiry {
		/// The incoming CLTV expiry, as an absolute block height.
		cltv_expiry: u32,
	},
	/// The HTLC would expire too close to the current block height to be safely forwarded or
	/// claimed.
	ExpiryTooSoon,
	/// The final hop has no matching invoice, the invoice is no longer payable, or the HTLC
	/// does not satisfy the invoice's terms.
	IncorrectOrUnknownPaymentDetails,
	/// The routing instruction recovered from the onion was missing or inconsistent.
	InvalidOnionPayload,
}

impl FailureReason {
	/// The BOLT#4 failure code sent over the wire for this failure.
	pub fn failure_code(&self) -> u16 {
		match self {
			FailureReason::TemporaryChannelFailure => UPDATE | 7,
			FailureReason::PermanentChannelFailure => PERM | 8,
			FailureReason::UnknownNextPeer => PERM | 10,
			FailureReason::AmountBelowMinimum { .. } => UPDATE | 11,
			FailureReason::AmountAboveMaximum { .. } => UPDATE | 7,
			FailureReason::FeeInsufficient { .. } => UPDATE | 12,
			FailureReason::IncorrectCltvExpiry { .. } => UPDATE | 13,
			FailureReason::ExpiryTooSoon => UPDATE | 14,
			FailureReason::IncorrectOrUnknownPaymentDetails => PERM | 15,
			FailureReason::InvalidOnionPayload => PERM | 22,
		}
	}
}

impl fmt::Display for FailureReason {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			FailureReason::TemporaryChannelFailure => write!(f, "temporary_channel_failure"),
			FailureReason::PermanentChannelFailure => write!(f, "permanent_channel_failure"),
			FailureReason::UnknownNextPeer => write!(f, "unknown_next_peer"),
			FailureReason::AmountBelowMinimum { htlc_msat } => {
				write!(f, "amount_below_minimum ({} msat)", htlc_msat)
			},
			FailureReason::AmountAboveMaximum { htlc_msat } => {
				write!(f, "amount above htlc_maximum_msat ({} msat)", htlc_msat)
			},
			FailureReason::FeeInsufficient { htlc_msat } => {
				write!(f, "fee_insufficient ({} msat)", htlc_msat)
			},
			FailureReason::IncorrectCltvExpiry { cltv_expiry } => {
				write!(f, "incorrect_cltv_expiry (expiry {})", cltv_expiry)
			},
			FailureReason::ExpiryTooSoon => write!(f, "expiry_too_soon"),
			FailureReason::IncorrectOrUnknownPaymentDetails => {
				write!(f, "incorrect_or_unknown_payment_details")
			},
			FailureReason::InvalidOnionPayload => write!(f, "invalid_onion_payload"),
		}
	}
}
