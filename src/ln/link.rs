// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The [`Link`] which adapts a single payment channel to the switch, and its forwarding policy.

use crate::ln::interfaces::{ChannelLink, HtlcForwarder, Peer};
use crate::ln::mailbox::{MailBox, MailboxFull, MailboxMessage};
use crate::ln::msgs::{
	FailureReason, Message, UpdateAddHTLC, UpdateFailHTLC, UpdateFulfillHTLC, MAX_VALUE_MSAT,
};
use crate::ln::switch::{HtlcPacket, HtlcResolution, ResolutionOutcome};
use crate::ln::types::{ChannelId, PaymentHash};
use crate::util::errors::APIError;
use crate::util::logger::Logger;
use crate::util::scid_utils::scid_from_parts;

use bitcoin::secp256k1::PublicKey;
use bitcoin::OutPoint;

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// The number of blocks we expect to hear about a new block within, used as slack when deciding
/// whether an HTLC's outgoing expiry is already too close to be worth offering onwards.
pub(crate) const LATENCY_GRACE_PERIOD_BLOCKS: u32 = 3;

/// The number of blocks before an HTLC's expiry at which it must be failed backwards, leaving
/// time to claim or fail it on-chain without racing the downstream timeout.
pub(crate) const HTLC_FAIL_BACK_BUFFER: u32 = 6;

/// The number of channel updates a link will apply without seeing a `commitment_signed` before
/// it declares itself stalled and stops accepting new forwards.
pub(crate) const MAX_UNCOMMITTED_UPDATES: usize = 50;

/// How long a link's worker blocks on its mailbox before re-checking for shutdown.
const MAILBOX_POLL_MILLIS: u64 = 100;

/// The parameters under which a link is willing to forward HTLCs over its channel, matching the
/// fields this node advertises in its `channel_update` for the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForwardingPolicy {
	/// The flat fee, in msat, charged on every forward regardless of value.
	pub fee_base_msat: u32,
	/// The value-proportional fee, in parts-per-million of the forwarded amount.
	pub fee_proportional_millionths: u32,
	/// The number of blocks the incoming HTLC's expiry must exceed the outgoing HTLC's expiry
	/// by, bounding the time this node has to claim a settled HTLC on-chain.
	pub cltv_expiry_delta: u16,
	/// The smallest forwarded value, in msat, this channel will carry.
	pub htlc_minimum_msat: u64,
	/// The largest forwarded value, in msat, this channel will carry.
	pub htlc_maximum_msat: u64,
}

impl Default for ForwardingPolicy {
	fn default() -> Self {
		Self {
			fee_base_msat: 1000,
			fee_proportional_millionths: 0,
			cltv_expiry_delta: 6 * 12,
			htlc_minimum_msat: 1,
			htlc_maximum_msat: MAX_VALUE_MSAT,
		}
	}
}

impl ForwardingPolicy {
	/// The fee, in msat, this policy demands for forwarding the given amount onwards.
	///
	/// `None` if the calculation overflows, in which case the HTLC cannot satisfy the policy.
	pub fn expected_fee_msat(&self, amt_to_forward: u64) -> Option<u64> {
		amt_to_forward
			.checked_mul(self.fee_proportional_millionths as u64)
			.map(|prop| prop / 1_000_000)
			.and_then(|prop_fee| prop_fee.checked_add(self.fee_base_msat as u64))
	}

	/// Checks the policy for internal consistency.
	pub fn validate(&self) -> Result<(), APIError> {
		if self.htlc_minimum_msat > self.htlc_maximum_msat {
			return Err(APIError::APIMisuseError {
				err: format!(
					"htlc_minimum_msat ({}) exceeds htlc_maximum_msat ({})",
					self.htlc_minimum_msat, self.htlc_maximum_msat
				),
			});
		}
		if self.htlc_maximum_msat > MAX_VALUE_MSAT {
			return Err(APIError::APIMisuseError {
				err: format!("htlc_maximum_msat ({}) exceeds total bitcoin supply", self.htlc_maximum_msat),
			});
		}
		Ok(())
	}
}

/// The lifecycle state of a [`Link`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
	/// The link exists but its worker has not been started.
	Created,
	/// The worker is running but the channel is not yet usable, e.g. its funding transaction
	/// has not confirmed.
	Starting,
	/// The link is fully operational.
	Active,
	/// Too many updates are pending a `commitment_signed`, so the link has stopped accepting
	/// new forwards until its counterparty catches up.
	Stalled,
	/// The worker has been stopped.
	Stopped,
}

#[derive(Clone)]
struct OutboundHtlc {
	amt_msat: u64,
	payment_hash: PaymentHash,
	incoming_chan_id: ChannelId,
	incoming_htlc_id: u64,
}

#[derive(Clone)]
struct InboundHtlc {
	amt_msat: u64,
	payment_hash: PaymentHash,
}

struct ChannelState {
	local_balance_msat: u64,
	channel_reserve_msat: u64,
	pending_outbound: HashMap<u64, OutboundHtlc>,
	pending_inbound: HashMap<u64, InboundHtlc>,
	next_htlc_id: u64,
	uncommitted_updates: usize,
	channel_ready: bool,
}

struct LinkInner<P: Deref, L: Deref>
where
	P::Target: Peer,
	L::Target: Logger,
{
	chan_id: ChannelId,
	funding_outpoint: OutPoint,
	state: Mutex<LinkState>,
	short_chan_id: Mutex<Option<u64>>,
	/// (block height, tx index, vout) of the funding output, once confirmed.
	funding_location: Mutex<Option<(u32, u32, u16)>>,
	policy: Mutex<ForwardingPolicy>,
	channel: Mutex<ChannelState>,
	mailbox: Mutex<Option<Arc<MailBox>>>,
	forwarder: Weak<dyn HtlcForwarder>,
	peer: P,
	logger: L,
	stop_thread: AtomicBool,
	updates_processed: AtomicU64,
	msat_sent: AtomicU64,
	msat_received: AtomicU64,
}

/// A [`ChannelLink`] backed by an in-memory channel state machine.
///
/// The link consumes messages from its attached [`MailBox`] on a dedicated worker thread started
/// via [`ChannelLink::start`], applying peer updates to the channel, handing forwardable HTLCs to
/// the switch, and relaying resolutions back out to its peer.
pub struct Link<P: Deref, L: Deref>
where
	P::Target: Peer,
	L::Target: Logger,
{
	inner: Arc<LinkInner<P, L>>,
	thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Deref + Send + Sync + 'static, L: Deref + Send + Sync + 'static> Link<P, L>
where
	P::Target: Peer,
	L::Target: Logger,
{
	/// Constructs a new link for the channel with the given funding outpoint.
	///
	/// `forwarder` is the switch the link hands forwardable HTLCs to; it is held weakly so that
	/// dropping the switch tears the routing mesh down without a reference cycle.
	///
	/// Fails with [`APIError::APIMisuseError`] if `policy` is not internally consistent.
	pub fn new(
		funding_outpoint: OutPoint, local_balance_msat: u64, channel_reserve_msat: u64,
		policy: ForwardingPolicy, peer: P, forwarder: Weak<dyn HtlcForwarder>, logger: L,
	) -> Result<Link<P, L>, APIError> {
		policy.validate()?;
		let chan_id = ChannelId::v1_from_funding_outpoint(&funding_outpoint);
		Ok(Link {
			inner: Arc::new(LinkInner {
				chan_id,
				funding_outpoint,
				state: Mutex::new(LinkState::Created),
				short_chan_id: Mutex::new(None),
				funding_location: Mutex::new(None),
				policy: Mutex::new(policy),
				channel: Mutex::new(ChannelState {
					local_balance_msat,
					channel_reserve_msat,
					pending_outbound: HashMap::new(),
					pending_inbound: HashMap::new(),
					next_htlc_id: 0,
					uncommitted_updates: 0,
					channel_ready: false,
				}),
				mailbox: Mutex::new(None),
				forwarder,
				peer,
				logger,
				stop_thread: AtomicBool::new(false),
				updates_processed: AtomicU64::new(0),
				msat_sent: AtomicU64::new(0),
				msat_received: AtomicU64::new(0),
			}),
			thread_handle: Mutex::new(None),
		})
	}

	/// Marks the channel's funding transaction confirmed at the given chain location, deriving
	/// and returning the channel's short channel id.
	///
	/// If the worker is already running the link becomes [`LinkState::Active`].
	pub fn funding_locked(&self, block_height: u32, tx_index: u32, vout: u16) -> Result<u64, APIError> {
		let scid = scid_from_parts(block_height as u64, tx_index as u64, vout as u64)
			.map_err(|e| APIError::APIMisuseError { err: format!("Invalid funding location: {:?}", e) })?;
		*self.inner.funding_location.lock().unwrap() = Some((block_height, tx_index, vout));
		*self.inner.short_chan_id.lock().unwrap() = Some(scid);
		self.inner.channel.lock().unwrap().channel_ready = true;
		{
			let mut state = self.inner.state.lock().unwrap();
			if *state == LinkState::Starting {
				*state = LinkState::Active;
			}
		}
		log_info!(
			self.inner.logger,
			"Channel {} is live with short channel id {}",
			self.inner.chan_id,
			scid
		);
		Ok(scid)
	}

	/// Records that a reorg has moved the funding transaction to a new confirmed location.
	///
	/// The short channel id is not re-derived until [`ChannelLink::update_short_chan_id`] is
	/// called, normally via [`Switch::update_link_scid`] so the switch's index stays coherent.
	///
	/// [`Switch::update_link_scid`]: crate::ln::switch::Switch::update_link_scid
	pub fn funding_reorganized(&self, block_height: u32, tx_index: u32, vout: u16) {
		*self.inner.funding_location.lock().unwrap() = Some((block_height, tx_index, vout));
		log_info!(
			self.inner.logger,
			"Channel {} funding moved to block {} tx {} vout {}",
			self.inner.chan_id,
			block_height,
			tx_index,
			vout
		);
	}

	/// The funding outpoint which the channel was opened with.
	pub fn funding_outpoint(&self) -> OutPoint {
		self.inner.funding_outpoint
	}

	/// Synchronously drains and processes every message currently in the mailbox.
	///
	/// This is the body of the worker started by [`ChannelLink::start`]. Users driving links
	/// from their own scheduler may call it directly instead of starting workers.
	pub fn process_pending_messages(&self) {
		let mailbox = match self.inner.mailbox.lock().unwrap().clone() {
			Some(mailbox) => mailbox,
			None => return,
		};
		while let Some(msg) = mailbox.try_take() {
			self.inner.process_message(msg);
		}
	}

	#[cfg(test)]
	pub(crate) fn start_inline(&self) {
		let ready = self.inner.channel.lock().unwrap().channel_ready;
		*self.inner.state.lock().unwrap() =
			if ready { LinkState::Active } else { LinkState::Starting };
	}

	#[cfg(test)]
	pub(crate) fn state(&self) -> LinkState {
		*self.inner.state.lock().unwrap()
	}
}

impl<P: Deref + Send + Sync + 'static, L: Deref + Send + Sync + 'static> ChannelLink for Link<P, L>
where
	P::Target: Peer,
	L::Target: Logger,
{
	fn chan_id(&self) -> ChannelId {
		self.inner.chan_id
	}

	fn short_chan_id(&self) -> Option<u64> {
		*self.inner.short_chan_id.lock().unwrap()
	}

	fn update_short_chan_id(&self) -> Result<u64, APIError> {
		let location = *self.inner.funding_location.lock().unwrap();
		let (block_height, tx_index, vout) = location.ok_or_else(|| APIError::ChannelUnavailable {
			err: format!("Channel {} has no confirmed funding transaction", self.inner.chan_id),
		})?;
		let scid = scid_from_parts(block_height as u64, tx_index as u64, vout as u64)
			.map_err(|e| APIError::APIMisuseError { err: format!("Invalid funding location: {:?}", e) })?;
		*self.inner.short_chan_id.lock().unwrap() = Some(scid);
		log_debug!(self.inner.logger, "Channel {} now has short channel id {}", self.inner.chan_id, scid);
		Ok(scid)
	}

	fn update_forwarding_policy(&self, policy: ForwardingPolicy) {
		*self.inner.policy.lock().unwrap() = policy;
		log_debug!(
			self.inner.logger,
			"Updated forwarding policy on channel {}: base fee {} msat, proportional fee {} ppm, cltv delta {}",
			self.inner.chan_id,
			policy.fee_base_msat,
			policy.fee_proportional_millionths,
			policy.cltv_expiry_delta
		);
	}

	fn htlc_satisfies_policy(
		&self, payment_hash: &PaymentHash, incoming_amt_msat: u64, amt_to_forward: u64,
		incoming_cltv_expiry: u32, outgoing_cltv_value: u32, best_block_height: u32,
	) -> Result<(), FailureReason> {
		let policy = *self.inner.policy.lock().unwrap();
		if amt_to_forward < policy.htlc_minimum_msat {
			return Err(FailureReason::AmountBelowMinimum { htlc_msat: amt_to_forward });
		}
		if amt_to_forward > policy.htlc_maximum_msat {
			return Err(FailureReason::AmountAboveMaximum { htlc_msat: amt_to_forward });
		}
		match policy.expected_fee_msat(amt_to_forward) {
			Some(fee) if incoming_amt_msat >= fee && incoming_amt_msat - fee >= amt_to_forward => {},
			_ => return Err(FailureReason::FeeInsufficient { htlc_msat: incoming_amt_msat }),
		}
		if (incoming_cltv_expiry as u64) < outgoing_cltv_value as u64 + policy.cltv_expiry_delta as u64 {
			return Err(FailureReason::IncorrectCltvExpiry { cltv_expiry: incoming_cltv_expiry });
		}
		// There needs to be enough blocks left on the incoming HTLC for us to pull the outgoing
		// one on-chain, and enough on the outgoing one for the next hop to bother.
		if incoming_cltv_expiry <= best_block_height + HTLC_FAIL_BACK_BUFFER {
			return Err(FailureReason::ExpiryTooSoon);
		}
		if outgoing_cltv_value <= best_block_height + LATENCY_GRACE_PERIOD_BLOCKS {
			return Err(FailureReason::ExpiryTooSoon);
		}
		if self.bandwidth_msat() < amt_to_forward {
			log_debug!(
				self.inner.logger,
				"Channel {} lacks bandwidth for HTLC with hash {} of {} msat",
				self.inner.chan_id,
				payment_hash,
				amt_to_forward
			);
			return Err(FailureReason::TemporaryChannelFailure);
		}
		Ok(())
	}

	fn bandwidth_msat(&self) -> u64 {
		let chan = self.inner.channel.lock().unwrap();
		let pending: u64 = chan.pending_outbound.values().map(|htlc| htlc.amt_msat).sum();
		chan.local_balance_msat.saturating_sub(pending).saturating_sub(chan.channel_reserve_msat)
	}

	fn stats(&self) -> (u64, u64, u64) {
		(
			self.inner.updates_processed.load(Ordering::Acquire),
			self.inner.msat_sent.load(Ordering::Acquire),
			self.inner.msat_received.load(Ordering::Acquire),
		)
	}

	fn peer_node_id(&self) -> PublicKey {
		self.inner.peer.node_id()
	}

	fn eligible_to_forward(&self) -> bool {
		if *self.inner.state.lock().unwrap() != LinkState::Active {
			return false;
		}
		if self.inner.short_chan_id.lock().unwrap().is_none() {
			return false;
		}
		self.bandwidth_msat() > 0
	}

	fn attach_mailbox(&self, mailbox: Arc<MailBox>) {
		*self.inner.mailbox.lock().unwrap() = Some(mailbox);
	}

	fn handle_switch_packet(&self, packet: HtlcPacket) -> Result<(), MailboxFull> {
		self.inner.deliver(MailboxMessage::SwitchAdd(packet))
	}

	fn handle_switch_resolution(&self, resolution: HtlcResolution) -> Result<(), MailboxFull> {
		self.inner.deliver(MailboxMessage::SwitchResolution(resolution))
	}

	fn handle_channel_update(&self, msg: Message) -> Result<(), MailboxFull> {
		self.inner.deliver(MailboxMessage::PeerMessage(msg))
	}

	fn start(&self) -> Result<(), APIError> {
		if self.inner.mailbox.lock().unwrap().is_none() {
			return Err(APIError::APIMisuseError {
				err: format!("Channel {} started with no mailbox attached", self.inner.chan_id),
			});
		}
		{
			let mut state = self.inner.state.lock().unwrap();
			match *state {
				LinkState::Created | LinkState::Stopped => {},
				_ => {
					return Err(APIError::APIMisuseError {
						err: format!("Channel {} is already started", self.inner.chan_id),
					});
				},
			}
			*state = if self.inner.channel.lock().unwrap().channel_ready {
				LinkState::Active
			} else {
				LinkState::Starting
			};
		}
		self.inner.stop_thread.store(false, Ordering::Release);
		let inner = Arc::clone(&self.inner);
		let handle = thread::spawn(move || inner.run());
		*self.thread_handle.lock().unwrap() = Some(handle);
		log_info!(self.inner.logger, "Started link for channel {}", self.inner.chan_id);
		Ok(())
	}

	fn stop(&self) {
		self.inner.stop_thread.store(true, Ordering::Release);
		let handle = self.thread_handle.lock().unwrap().take();
		if let Some(handle) = handle {
			let _ = handle.join();
		}
		*self.inner.state.lock().unwrap() = LinkState::Stopped;
		log_info!(self.inner.logger, "Stopped link for channel {}", self.inner.chan_id);
	}

	fn wipe_channel(&self) {
		if self.inner.peer.wipe_channel(&self.inner.funding_outpoint).is_err() {
			log_error!(
				self.inner.logger,
				"Peer failed to wipe state for removed channel {}",
				self.inner.chan_id
			);
		}
	}
}

impl<P: Deref, L: Deref> Drop for Link<P, L>
where
	P::Target: Peer,
	L::Target: Logger,
{
	fn drop(&mut self) {
		self.inner.stop_thread.store(true, Ordering::Release);
		let handle = self.thread_handle.lock().unwrap().take();
		if let Some(handle) = handle {
			let _ = handle.join();
		}
	}
}

impl<P: Deref, L: Deref> LinkInner<P, L>
where
	P::Target: Peer,
	L::Target: Logger,
{
	fn deliver(&self, msg: MailboxMessage) -> Result<(), MailboxFull> {
		match self.mailbox.lock().unwrap().as_ref() {
			Some(mailbox) => mailbox.deliver(msg),
			// A link with no mailbox cannot buffer anything.
			None => Err(MailboxFull),
		}
	}

	fn run(&self) {
		loop {
			if self.stop_thread.load(Ordering::Acquire) {
				break;
			}
			let mailbox = self.mailbox.lock().unwrap().clone();
			let msg = match mailbox {
				Some(mailbox) => mailbox.take(Duration::from_millis(MAILBOX_POLL_MILLIS)),
				None => {
					thread::sleep(Duration::from_millis(MAILBOX_POLL_MILLIS));
					None
				},
			};
			if let Some(msg) = msg {
				self.process_message(msg);
			}
		}
	}

	fn process_message(&self, msg: MailboxMessage) {
		match msg {
			MailboxMessage::SwitchAdd(packet) => self.process_switch_add(packet),
			MailboxMessage::SwitchResolution(resolution) => {
				self.process_switch_resolution(resolution)
			},
			MailboxMessage::PeerMessage(Message::UpdateAddHTLC(msg)) => self.process_peer_add(msg),
			MailboxMessage::PeerMessage(Message::UpdateFulfillHTLC(msg)) => {
				self.process_peer_fulfill(msg)
			},
			MailboxMessage::PeerMessage(Message::UpdateFailHTLC(msg)) => self.process_peer_fail(msg),
			MailboxMessage::PeerMessage(Message::CommitmentSigned(_)) => {
				self.process_commitment_signed()
			},
		}
	}

	/// An HTLC the switch admitted for forwarding over our channel: offer it to our peer.
	fn process_switch_add(&self, packet: HtlcPacket) {
		let (htlc_id, msg) = {
			let mut chan = self.channel.lock().unwrap();
			let htlc_id = chan.next_htlc_id;
			chan.next_htlc_id += 1;
			chan.pending_outbound.insert(
				htlc_id,
				OutboundHtlc {
					amt_msat: packet.amt_to_forward,
					payment_hash: packet.payment_hash,
					incoming_chan_id: packet.incoming_chan_id,
					incoming_htlc_id: packet.incoming_htlc_id,
				},
			);
			chan.uncommitted_updates += 1;
			let msg = Message::UpdateAddHTLC(UpdateAddHTLC {
				channel_id: self.chan_id,
				htlc_id,
				amount_msat: packet.amt_to_forward,
				payment_hash: packet.payment_hash,
				cltv_expiry: packet.outgoing_cltv_value,
				hop_data: None,
			});
			(htlc_id, msg)
		};
		self.updates_processed.fetch_add(1, Ordering::AcqRel);
		self.check_uncommitted_updates();
		if let Some(forwarder) = self.forwarder.upgrade() {
			forwarder.packet_committed(packet.incoming_chan_id, packet.incoming_htlc_id);
		}
		if self.peer.send_message(msg, false).is_err() {
			log_error!(
				self.logger,
				"Failed to send update_add_htlc {} on channel {}, failing HTLC backwards",
				htlc_id,
				self.chan_id
			);
			self.channel.lock().unwrap().pending_outbound.remove(&htlc_id);
			if let Some(forwarder) = self.forwarder.upgrade() {
				forwarder.resolve_htlc(HtlcResolution {
					incoming_chan_id: packet.incoming_chan_id,
					incoming_htlc_id: packet.incoming_htlc_id,
					outcome: ResolutionOutcome::Fail(FailureReason::TemporaryChannelFailure),
				});
			}
		} else {
			log_trace!(
				self.logger,
				"Forwarded HTLC with hash {} over channel {} as HTLC {} of {} msat",
				packet.payment_hash,
				self.chan_id,
				htlc_id,
				packet.amt_to_forward
			);
		}
	}

	/// The switch resolved an HTLC we previously received: relay the outcome to our peer.
	fn process_switch_resolution(&self, resolution: HtlcResolution) {
		let htlc_id = resolution.incoming_htlc_id;
		let htlc = match self.channel.lock().unwrap().pending_inbound.get(&htlc_id).cloned() {
			Some(htlc) => htlc,
			None => {
				log_debug!(
					self.logger,
					"Dropping resolution for unknown inbound HTLC {} on channel {}",
					htlc_id,
					self.chan_id
				);
				return;
			},
		};
		let msg = match resolution.outcome {
			ResolutionOutcome::Settle(payment_preimage) => {
				if payment_preimage.payment_hash() != htlc.payment_hash {
					log_error!(
						self.logger,
						"Refusing to fulfill inbound HTLC {} on channel {}: preimage does not match hash {}",
						htlc_id,
						self.chan_id,
						htlc.payment_hash
					);
					return;
				}
				{
					let mut chan = self.channel.lock().unwrap();
					chan.pending_inbound.remove(&htlc_id);
					chan.local_balance_msat += htlc.amt_msat;
					chan.uncommitted_updates += 1;
				}
				self.msat_received.fetch_add(htlc.amt_msat, Ordering::AcqRel);
				log_trace!(
					self.logger,
					"Fulfilling inbound HTLC {} on channel {} with hash {}",
					htlc_id,
					self.chan_id,
					htlc.payment_hash
				);
				Message::UpdateFulfillHTLC(UpdateFulfillHTLC {
					channel_id: self.chan_id,
					htlc_id,
					payment_preimage,
				})
			},
			ResolutionOutcome::Fail(reason) => {
				{
					let mut chan = self.channel.lock().unwrap();
					chan.pending_inbound.remove(&htlc_id);
					chan.uncommitted_updates += 1;
				}
				log_trace!(
					self.logger,
					"Failing inbound HTLC {} on channel {}: {}",
					htlc_id,
					self.chan_id,
					reason
				);
				Message::UpdateFailHTLC(UpdateFailHTLC { channel_id: self.chan_id, htlc_id, reason })
			},
		};
		self.updates_processed.fetch_add(1, Ordering::AcqRel);
		self.check_uncommitted_updates();
		if self.peer.send_message(msg, false).is_err() {
			log_error!(
				self.logger,
				"Failed to send resolution of inbound HTLC {} on channel {}",
				htlc_id,
				self.chan_id
			);
		}
	}

	/// Our peer offered us an HTLC: record it and hand it to the switch for routing.
	fn process_peer_add(&self, msg: UpdateAddHTLC) {
		if msg.channel_id != self.chan_id {
			log_error!(
				self.logger,
				"Got update_add_htlc for channel {} on link for channel {}",
				msg.channel_id,
				self.chan_id
			);
			return;
		}
		let hop_data = match msg.hop_data {
			Some(hop_data) => hop_data,
			None => {
				log_warn!(
					self.logger,
					"Got update_add_htlc {} on channel {} with no usable routing instruction",
					msg.htlc_id,
					self.chan_id
				);
				self.fail_inbound_htlc(msg.htlc_id, FailureReason::InvalidOnionPayload);
				return;
			},
		};
		{
			let mut chan = self.channel.lock().unwrap();
			if chan.pending_inbound.contains_key(&msg.htlc_id) {
				log_error!(
					self.logger,
					"Got duplicate update_add_htlc {} on channel {}, dropping",
					msg.htlc_id,
					self.chan_id
				);
				return;
			}
			chan.pending_inbound.insert(
				msg.htlc_id,
				InboundHtlc { amt_msat: msg.amount_msat, payment_hash: msg.payment_hash },
			);
			chan.uncommitted_updates += 1;
		}
		self.updates_processed.fetch_add(1, Ordering::AcqRel);
		self.check_uncommitted_updates();
		let packet = HtlcPacket {
			incoming_chan_id: self.chan_id,
			incoming_htlc_id: msg.htlc_id,
			outgoing_scid: hop_data.short_channel_id,
			payment_hash: msg.payment_hash,
			incoming_amt_msat: msg.amount_msat,
			amt_to_forward: hop_data.amt_to_forward,
			incoming_cltv_expiry: msg.cltv_expiry,
			outgoing_cltv_value: hop_data.outgoing_cltv_value,
		};
		let forwarder = match self.forwarder.upgrade() {
			Some(forwarder) => forwarder,
			None => {
				log_error!(
					self.logger,
					"Switch is gone, failing back HTLC {} on channel {}",
					msg.htlc_id,
					self.chan_id
				);
				self.fail_inbound_htlc(msg.htlc_id, FailureReason::TemporaryChannelFailure);
				return;
			},
		};
		if let Err(err) = forwarder.forward_htlc(packet) {
			let reason = err.failure_reason();
			log_debug!(
				self.logger,
				"Failing back HTLC {} on channel {}: {}",
				msg.htlc_id,
				self.chan_id,
				reason
			);
			self.fail_inbound_htlc(msg.htlc_id, reason);
		}
	}

	/// Our peer settled an HTLC we previously offered: claim the funds and propagate the
	/// preimage back through the switch.
	fn process_peer_fulfill(&self, msg: UpdateFulfillHTLC) {
		let htlc = match self.channel.lock().unwrap().pending_outbound.get(&msg.htlc_id).cloned() {
			Some(htlc) => htlc,
			None => {
				log_debug!(
					self.logger,
					"Got update_fulfill_htlc for unknown HTLC {} on channel {}",
					msg.htlc_id,
					self.chan_id
				);
				return;
			},
		};
		if msg.payment_preimage.payment_hash() != htlc.payment_hash {
			log_error!(
				self.logger,
				"Got update_fulfill_htlc {} on channel {} with a preimage not matching hash {}, dropping",
				msg.htlc_id,
				self.chan_id,
				htlc.payment_hash
			);
			return;
		}
		{
			let mut chan = self.channel.lock().unwrap();
			chan.pending_outbound.remove(&msg.htlc_id);
			chan.local_balance_msat = chan.local_balance_msat.saturating_sub(htlc.amt_msat);
			chan.uncommitted_updates += 1;
		}
		self.msat_sent.fetch_add(htlc.amt_msat, Ordering::AcqRel);
		self.updates_processed.fetch_add(1, Ordering::AcqRel);
		self.check_uncommitted_updates();
		log_trace!(
			self.logger,
			"Outbound HTLC {} on channel {} fulfilled with preimage for hash {}",
			msg.htlc_id,
			self.chan_id,
			htlc.payment_hash
		);
		if let Some(forwarder) = self.forwarder.upgrade() {
			forwarder.resolve_htlc(HtlcResolution {
				incoming_chan_id: htlc.incoming_chan_id,
				incoming_htlc_id: htlc.incoming_htlc_id,
				outcome: ResolutionOutcome::Settle(msg.payment_preimage),
			});
		}
	}

	/// Our peer failed an HTLC we previously offered: propagate the failure back through the
	/// switch.
	fn process_peer_fail(&self, msg: UpdateFailHTLC) {
		let htlc = {
			let mut chan = self.channel.lock().unwrap();
			match chan.pending_outbound.remove(&msg.htlc_id) {
				Some(htlc) => {
					chan.uncommitted_updates += 1;
					htlc
				},
				None => {
					log_debug!(
						self.logger,
						"Got update_fail_htlc for unknown HTLC {} on channel {}",
						msg.htlc_id,
						self.chan_id
					);
					return;
				},
			}
		};
		self.updates_processed.fetch_add(1, Ordering::AcqRel);
		self.check_uncommitted_updates();
		log_trace!(
			self.logger,
			"Outbound HTLC {} on channel {} failed by peer: {}",
			msg.htlc_id,
			self.chan_id,
			msg.reason
		);
		if let Some(forwarder) = self.forwarder.upgrade() {
			forwarder.resolve_htlc(HtlcResolution {
				incoming_chan_id: htlc.incoming_chan_id,
				incoming_htlc_id: htlc.incoming_htlc_id,
				outcome: ResolutionOutcome::Fail(msg.reason),
			});
		}
	}

	fn process_commitment_signed(&self) {
		self.channel.lock().unwrap().uncommitted_updates = 0;
		self.updates_processed.fetch_add(1, Ordering::AcqRel);
		let mut state = self.state.lock().unwrap();
		if *state == LinkState::Stalled {
			*state = LinkState::Active;
			log_info!(
				self.logger,
				"Channel {} caught up on commitments, accepting forwards again",
				self.chan_id
			);
		}
	}

	fn fail_inbound_htlc(&self, htlc_id: u64, reason: FailureReason) {
		{
			let mut chan = self.channel.lock().unwrap();
			chan.pending_inbound.remove(&htlc_id);
			chan.uncommitted_updates += 1;
		}
		let msg = Message::UpdateFailHTLC(UpdateFailHTLC { channel_id: self.chan_id, htlc_id, reason });
		if self.peer.send_message(msg, false).is_err() {
			log_error!(
				self.logger,
				"Failed to send update_fail_htlc {} on channel {}",
				htlc_id,
				self.chan_id
			);
		}
	}

	fn check_uncommitted_updates(&self) {
		let uncommitted = self.channel.lock().unwrap().uncommitted_updates;
		if uncommitted > MAX_UNCOMMITTED_UPDATES {
			let mut state = self.state.lock().unwrap();
			if *state == LinkState::Active {
				*state = LinkState::Stalled;
				log_warn!(
					self.logger,
					"Channel {} has {} updates pending a commitment_signed, stalling",
					self.chan_id,
					uncommitted
				);
			}
		}
	}
}
