// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The [`Switch`] which routes HTLCs between the channel links registered with it.

use crate::ln::interfaces::{
	ChannelLink, ForwardingLog, HtlcForwarder, InvoiceDatabase, InvoiceError,
};
use crate::ln::link::HTLC_FAIL_BACK_BUFFER;
use crate::ln::mailbox::MailBox;
use crate::ln::msgs::FailureReason;
use crate::ln::types::{ChannelId, PaymentHash, PaymentPreimage};
use crate::util::errors::APIError;
use crate::util::logger::Logger;

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// How often, in seconds, the [`SwitchBackground`] worker flushes batched forwarding events to
/// the [`ForwardingLog`].
#[cfg(not(test))]
const FWD_EVENT_FLUSH_INTERVAL_SECS: u64 = 15;
#[cfg(test)]
const FWD_EVENT_FLUSH_INTERVAL_SECS: u64 = 1;

/// An HTLC in flight between two links, as handed to the switch by the link it arrived on.
///
/// The amounts and expiries describe both sides of the hop: what the incoming channel carries,
/// and what the routing instruction says the outgoing channel should carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HtlcPacket {
	/// The channel the HTLC arrived on.
	pub incoming_chan_id: ChannelId,
	/// The HTLC's id on the incoming channel.
	pub incoming_htlc_id: u64,
	/// The short channel id the HTLC should leave on, or 0 if this node is the final hop.
	pub outgoing_scid: u64,
	/// The payment hash locking the HTLC.
	pub payment_hash: PaymentHash,
	/// The value, in msat, of the incoming HTLC.
	pub incoming_amt_msat: u64,
	/// The value, in msat, to offer onwards. The difference with `incoming_amt_msat` is the fee
	/// this node collects.
	pub amt_to_forward: u64,
	/// The expiry, as an absolute block height, of the incoming HTLC.
	pub incoming_cltv_expiry: u32,
	/// The expiry, as an absolute block height, the outgoing HTLC should carry.
	pub outgoing_cltv_value: u32,
}

/// How an in-flight HTLC ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolutionOutcome {
	/// The HTLC was fulfilled downstream (or locally); the preimage is propagated backwards so
	/// each hop can claim its incoming HTLC.
	Settle(PaymentPreimage),
	/// The HTLC failed downstream (or locally) and each hop should cancel its incoming HTLC.
	Fail(FailureReason),
}

/// The resolution of an HTLC, addressed by the circuit it opened when it was forwarded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HtlcResolution {
	/// The channel the original HTLC arrived on.
	pub incoming_chan_id: ChannelId,
	/// The original HTLC's id on that channel.
	pub incoming_htlc_id: u64,
	/// Whether the HTLC settled or failed.
	pub outcome: ResolutionOutcome,
}

/// The key under which the switch tracks an in-flight HTLC: the channel it arrived on and its
/// HTLC id there, which together are unique for the lifetime of the HTLC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CircuitKey {
	/// The channel the HTLC arrived on.
	pub chan_id: ChannelId,
	/// The HTLC's id on that channel.
	pub htlc_id: u64,
}

impl fmt::Display for CircuitKey {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "({}, {})", self.chan_id, self.htlc_id)
	}
}

/// A completed forward, recorded when the settle for a forwarded HTLC is handed back upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardingEvent {
	/// When the forward completed, as a duration since the unix epoch.
	pub timestamp: Duration,
	/// The channel the HTLC arrived on.
	pub incoming_chan_id: ChannelId,
	/// The channel the HTLC left on.
	pub outgoing_chan_id: ChannelId,
	/// The value, in msat, of the incoming HTLC.
	pub amt_in_msat: u64,
	/// The value, in msat, of the outgoing HTLC.
	pub amt_out_msat: u64,
	/// The fee, in msat, this node earned on the forward.
	pub fee_msat: u64,
}

/// The error returned when the switch cannot admit an HTLC for forwarding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardError {
	/// No link is registered for the requested outgoing short channel id.
	UnknownChannel,
	/// The outgoing link exists but cannot currently forward, e.g. it is stalled, stopped, or
	/// has no free bandwidth.
	LinkNotEligible,
	/// An HTLC with the same incoming channel and id is already in flight, so this add is a
	/// retransmission which must not be forwarded a second time.
	DuplicateAdd,
	/// The HTLC does not satisfy the outgoing channel's forwarding policy.
	PolicyFailure(FailureReason),
	/// A mailbox on the HTLC's path is full and the HTLC was not admitted.
	MailboxFull,
}

impl ForwardError {
	/// The BOLT#4 failure to relay to the upstream peer for this error.
	pub fn failure_reason(&self) -> FailureReason {
		match self {
			ForwardError::UnknownChannel => FailureReason::UnknownNextPeer,
			ForwardError::LinkNotEligible => FailureReason::TemporaryChannelFailure,
			ForwardError::DuplicateAdd => FailureReason::TemporaryChannelFailure,
			ForwardError::PolicyFailure(reason) => reason.clone(),
			ForwardError::MailboxFull => FailureReason::TemporaryChannelFailure,
		}
	}
}

impl fmt::Display for ForwardError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			ForwardError::UnknownChannel => write!(f, "unknown outgoing channel"),
			ForwardError::LinkNotEligible => write!(f, "outgoing link not eligible to forward"),
			ForwardError::DuplicateAdd => write!(f, "duplicate add for an in-flight circuit"),
			ForwardError::PolicyFailure(reason) => write!(f, "policy failure: {}", reason),
			ForwardError::MailboxFull => write!(f, "mailbox full"),
		}
	}
}

struct OpenCircuit {
	outgoing_chan_id: ChannelId,
	payment_hash: PaymentHash,
	amt_in_msat: u64,
	amt_out_msat: u64,
	outgoing_cltv_value: u32,
	/// Whether the outgoing link has taken ownership of the HTLC. Until it has, the HTLC's
	/// value is counted against the outgoing channel in `CircuitMap::reserved_msat`.
	committed: bool,
	/// The circuit's outcome once decided downstream. Set when the incoming link's mailbox
	/// could not take the resolution; redelivered until the link accepts it, since a settle
	/// already claimed downstream must never be turned into a fail upstream.
	pending_resolution: Option<ResolutionOutcome>,
}

struct CircuitMap {
	open: HashMap<CircuitKey, OpenCircuit>,
	/// Value admitted for forwarding per outgoing channel but not yet reflected in the link's
	/// own bandwidth, keeping concurrent forwards from over-committing a channel.
	reserved_msat: HashMap<ChannelId, u64>,
}

struct LinkHolder {
	by_id: HashMap<ChannelId, Arc<dyn ChannelLink>>,
	short_to_id: HashMap<u64, ChannelId>,
	/// Mailboxes outlive their links so messages delivered while a link is down are handed to
	/// its replacement.
	mailboxes: HashMap<ChannelId, Arc<MailBox>>,
}

/// The central router of a node: moves HTLCs between the [`ChannelLink`]s registered with it,
/// claims HTLCs terminating at this node against the [`InvoiceDatabase`], and records completed
/// forwards to the [`ForwardingLog`].
///
/// The switch is handed to links as a [`Weak`] [`HtlcForwarder`], so it is expected to be held
/// in an [`Arc`] by the node.
///
/// [`Weak`]: std::sync::Weak
pub struct Switch<L: Deref, I: Deref, E: Deref>
where
	L::Target: Logger,
	I::Target: InvoiceDatabase,
	E::Target: ForwardingLog,
{
	links: Mutex<LinkHolder>,
	circuits: Mutex<CircuitMap>,
	pending_fwd_events: Mutex<Vec<ForwardingEvent>>,
	best_block_height: AtomicUsize,
	invoices: I,
	fwd_log: E,
	logger: L,
}

impl<L: Deref, I: Deref, E: Deref> Switch<L, I, E>
where
	L::Target: Logger,
	I::Target: InvoiceDatabase,
	E::Target: ForwardingLog,
{
	/// Constructs a new switch with no links attached.
	///
	/// `current_block_height` seeds the chain height used for expiry checks; keep it current
	/// via [`Switch::best_block_updated`].
	pub fn new(invoices: I, fwd_log: E, logger: L, current_block_height: u32) -> Self {
		Switch {
			links: Mutex::new(LinkHolder {
				by_id: HashMap::new(),
				short_to_id: HashMap::new(),
				mailboxes: HashMap::new(),
			}),
			circuits: Mutex::new(CircuitMap { open: HashMap::new(), reserved_msat: HashMap::new() }),
			pending_fwd_events: Mutex::new(Vec::new()),
			best_block_height: AtomicUsize::new(current_block_height as usize),
			invoices,
			fwd_log,
			logger,
		}
	}

	/// Registers a link with the switch, attaching it to the channel's mailbox.
	///
	/// If a link for the same channel was previously removed, its mailbox (and any messages
	/// delivered in the meantime) is handed to the new link.
	pub fn add_link(&self, link: Arc<dyn ChannelLink>) -> Result<(), APIError> {
		let chan_id = link.chan_id();
		let mut links = self.links.lock().unwrap();
		if links.by_id.contains_key(&chan_id) {
			return Err(APIError::APIMisuseError {
				err: format!("A link for channel {} is already registered", chan_id),
			});
		}
		let mailbox =
			Arc::clone(links.mailboxes.entry(chan_id).or_insert_with(|| Arc::new(MailBox::new())));
		link.attach_mailbox(mailbox);
		if let Some(scid) = link.short_chan_id() {
			links.short_to_id.insert(scid, chan_id);
		}
		links.by_id.insert(chan_id, link);
		log_debug!(self.logger, "Registered link for channel {}", chan_id);
		Ok(())
	}

	/// Deregisters the link for the given channel, stopping it and failing back every circuit
	/// which would have left over it.
	///
	/// The channel's mailbox is retained so a replacement link added later resumes where this
	/// one left off.
	pub fn remove_link(&self, chan_id: &ChannelId) -> Result<(), APIError> {
		let link = {
			let mut links = self.links.lock().unwrap();
			let link = links.by_id.remove(chan_id).ok_or_else(|| APIError::ChannelUnavailable {
				err: format!("No link registered for channel {}", chan_id),
			})?;
			if let Some(scid) = link.short_chan_id() {
				links.short_to_id.remove(&scid);
			}
			link
		};
		link.stop();
		link.wipe_channel();
		log_info!(self.logger, "Removed link for channel {}", chan_id);

		// Circuits which arrived on the removed channel can no longer be resolved upstream,
		// while circuits leaving over it must be failed back to their incoming channels.
		let mut to_fail = Vec::new();
		{
			let mut circuits = self.circuits.lock().unwrap();
			let keys: Vec<CircuitKey> = circuits.open.keys().cloned().collect();
			for key in keys {
				if key.chan_id == *chan_id {
					if let Some(circuit) = circuits.open.remove(&key) {
						if !circuit.committed {
							Self::release_reservation(
								&mut circuits.reserved_msat,
								&circuit.outgoing_chan_id,
								circuit.amt_out_msat,
							);
						}
					}
				} else if circuits.open.get(&key).map(|c| c.outgoing_chan_id) == Some(*chan_id) {
					to_fail.push(key);
				}
			}
			circuits.reserved_msat.remove(chan_id);
		}
		for key in to_fail {
			log_warn!(
				self.logger,
				"Failing circuit {} whose outgoing channel {} was removed",
				key,
				chan_id
			);
			self.fail_circuit_back(key, FailureReason::PermanentChannelFailure);
		}
		Ok(())
	}

	/// Fetches the link registered for the given channel.
	pub fn get_link(&self, chan_id: &ChannelId) -> Option<Arc<dyn ChannelLink>> {
		self.links.lock().unwrap().by_id.get(chan_id).cloned()
	}

	/// Fetches the link whose channel currently has the given short channel id.
	pub fn get_link_by_scid(&self, scid: u64) -> Option<Arc<dyn ChannelLink>> {
		let links = self.links.lock().unwrap();
		links.short_to_id.get(&scid).and_then(|chan_id| links.by_id.get(chan_id)).cloned()
	}

	/// Replaces the forwarding policy of the given channel's link, after validating it.
	///
	/// HTLCs already in flight are unaffected; the new policy applies from the next admission.
	pub fn update_link_policy(
		&self, chan_id: &ChannelId, policy: crate::ln::link::ForwardingPolicy,
	) -> Result<(), APIError> {
		policy.validate()?;
		let link = self.get_link(chan_id).ok_or_else(|| APIError::ChannelUnavailable {
			err: format!("No link registered for channel {}", chan_id),
		})?;
		link.update_forwarding_policy(policy);
		Ok(())
	}

	/// Re-derives the short channel id of the given channel's link (e.g. after a reorg moved
	/// its funding transaction) and rebuilds the switch's index so the channel stays
	/// addressable under the new id.
	pub fn update_link_scid(&self, chan_id: &ChannelId) -> Result<u64, APIError> {
		let mut links = self.links.lock().unwrap();
		let link = links.by_id.get(chan_id).cloned().ok_or_else(|| APIError::ChannelUnavailable {
			err: format!("No link registered for channel {}", chan_id),
		})?;
		let old_scid = link.short_chan_id();
		let new_scid = link.update_short_chan_id()?;
		if let Some(old_scid) = old_scid {
			links.short_to_id.remove(&old_scid);
		}
		links.short_to_id.insert(new_scid, *chan_id);
		log_info!(
			self.logger,
			"Channel {} is now addressable under short channel id {}",
			chan_id,
			new_scid
		);
		Ok(new_scid)
	}

	/// The chain height the switch currently validates expiries against.
	pub fn best_block_height(&self) -> u32 {
		self.best_block_height.load(Ordering::Acquire) as u32
	}

	/// Updates the chain height, redelivering any resolution a full mailbox forced the switch
	/// to hold on to, then failing back any unresolved HTLC whose outgoing expiry is now too
	/// close to be resolved safely.
	pub fn best_block_updated(&self, height: u32) {
		self.best_block_height.store(height as usize, Ordering::Release);
		let (resolved, expired): (Vec<CircuitKey>, Vec<CircuitKey>) = {
			let circuits = self.circuits.lock().unwrap();
			let resolved = circuits
				.open
				.iter()
				.filter(|(_, circuit)| circuit.pending_resolution.is_some())
				.map(|(key, _)| *key)
				.collect();
			let expired = circuits
				.open
				.iter()
				.filter(|(_, circuit)| {
					circuit.pending_resolution.is_none()
						&& height + HTLC_FAIL_BACK_BUFFER >= circuit.outgoing_cltv_value
				})
				.map(|(key, _)| *key)
				.collect();
			(resolved, expired)
		};
		for key in resolved {
			self.redeliver_stored_resolution(key);
		}
		for key in expired {
			log_warn!(
				self.logger,
				"Failing circuit {} at height {}: outgoing HTLC is too close to expiry",
				key,
				height
			);
			self.fail_circuit_back(key, FailureReason::ExpiryTooSoon);
		}
	}

	/// The number of HTLCs currently in flight through the switch.
	pub fn num_open_circuits(&self) -> usize {
		self.circuits.lock().unwrap().open.len()
	}

	/// Returns the forwarding events batched since the last call, clearing the batch.
	///
	/// Callers using a [`SwitchBackground`] worker (or [`Switch::flush_forwarding_events`])
	/// should not also call this, as each event is only returned once.
	pub fn get_and_clear_pending_forwarding_events(&self) -> Vec<ForwardingEvent> {
		mem::take(&mut *self.pending_fwd_events.lock().unwrap())
	}

	/// Writes the batched forwarding events to the [`ForwardingLog`].
	///
	/// On failure the batch is retained and retried on a later flush, ahead of any events
	/// recorded in the meantime, so the log sees every event at least once and in order.
	pub fn flush_forwarding_events(&self) -> Result<(), ()> {
		let events = self.get_and_clear_pending_forwarding_events();
		if events.is_empty() {
			return Ok(());
		}
		match self.fwd_log.add_forwarding_events(&events) {
			Ok(()) => {
				log_trace!(self.logger, "Flushed {} forwarding events", events.len());
				Ok(())
			},
			Err(()) => {
				log_error!(
					self.logger,
					"Failed to persist {} forwarding events, will retry",
					events.len()
				);
				let mut pending = self.pending_fwd_events.lock().unwrap();
				let newer = mem::replace(&mut *pending, events);
				pending.extend(newer);
				Err(())
			},
		}
	}

	/// Shuts the switch down: stops every link, fails every unresolved in-flight HTLC back
	/// towards its incoming channel (delivering held resolutions as-is), and flushes any
	/// batched forwarding events.
	pub fn stop(&self) {
		log_info!(self.logger, "Switch shutting down");
		let links: Vec<Arc<dyn ChannelLink>> =
			self.links.lock().unwrap().by_id.values().cloned().collect();
		for link in links {
			link.stop();
		}
		let open: Vec<(CircuitKey, ResolutionOutcome)> = {
			let mut circuits = self.circuits.lock().unwrap();
			circuits.reserved_msat.clear();
			circuits
				.open
				.drain()
				.map(|(key, circuit)| {
					let outcome = circuit.pending_resolution.unwrap_or(ResolutionOutcome::Fail(
						FailureReason::TemporaryChannelFailure,
					));
					(key, outcome)
				})
				.collect()
		};
		for (key, outcome) in open {
			// Stopped links still accept mailbox deliveries, leaving the resolution for the
			// link to relay when it next runs.
			if !self.deliver_resolution(HtlcResolution {
				incoming_chan_id: key.chan_id,
				incoming_htlc_id: key.htlc_id,
				outcome,
			}) {
				log_error!(self.logger, "Failed to resolve circuit {} during shutdown", key);
			}
		}
		let _ = self.flush_forwarding_events();
	}

	/// Routes an HTLC terminating at this node: looks up the invoice for its payment hash and
	/// settles or fails the HTLC against it.
	///
	/// A settle is never dropped: if the incoming link's mailbox cannot take the fulfill, the
	/// settled HTLC is recorded as a resolved circuit and the fulfill redelivered later.
	fn process_final_hop(&self, packet: HtlcPacket) -> Result<(), ForwardError> {
		let key = CircuitKey { chan_id: packet.incoming_chan_id, htlc_id: packet.incoming_htlc_id };
		let best_block_height = self.best_block_height();
		let outcome = match self.invoices.lookup_invoice(&packet.payment_hash) {
			Err(_) => {
				log_debug!(
					self.logger,
					"Received HTLC with hash {} terminating here with no matching invoice",
					packet.payment_hash
				);
				ResolutionOutcome::Fail(FailureReason::IncorrectOrUnknownPaymentDetails)
			},
			Ok(invoice) => {
				if packet.amt_to_forward < invoice.amt_msat {
					log_debug!(
						self.logger,
						"Received HTLC of {} msat for invoice with hash {} demanding {} msat",
						packet.amt_to_forward,
						packet.payment_hash,
						invoice.amt_msat
					);
					ResolutionOutcome::Fail(FailureReason::IncorrectOrUnknownPaymentDetails)
				} else if packet.incoming_cltv_expiry
					<= best_block_height + invoice.min_final_cltv_expiry_delta
				{
					log_debug!(
						self.logger,
						"Received HTLC for invoice with hash {} expiring too soon at {}",
						packet.payment_hash,
						packet.incoming_cltv_expiry
					);
					ResolutionOutcome::Fail(FailureReason::IncorrectOrUnknownPaymentDetails)
				} else {
					match self.invoices.settle_invoice(&packet.payment_hash) {
						Ok(()) => {
							log_info!(
								self.logger,
								"Settled invoice with hash {} for {} msat",
								packet.payment_hash,
								packet.amt_to_forward
							);
							ResolutionOutcome::Settle(invoice.payment_preimage)
						},
						Err(InvoiceError::AlreadySettled) | Err(InvoiceError::NotFound) => {
							log_warn!(
								self.logger,
								"Refusing to settle invoice with hash {} twice",
								packet.payment_hash
							);
							ResolutionOutcome::Fail(FailureReason::IncorrectOrUnknownPaymentDetails)
						},
					}
				}
			},
		};
		let resolution = HtlcResolution {
			incoming_chan_id: packet.incoming_chan_id,
			incoming_htlc_id: packet.incoming_htlc_id,
			outcome: outcome.clone(),
		};
		if self.deliver_resolution(resolution) {
			return Ok(());
		}
		if !matches!(outcome, ResolutionOutcome::Settle(_)) {
			return Err(ForwardError::MailboxFull);
		}
		// The invoice is settled, so the fulfill must reach the peer even though the link's
		// mailbox is momentarily full.
		log_warn!(
			self.logger,
			"Incoming link for settled HTLC {} cannot take its fulfill, holding it for redelivery",
			key
		);
		self.circuits.lock().unwrap().open.insert(
			key,
			OpenCircuit {
				outgoing_chan_id: packet.incoming_chan_id,
				payment_hash: packet.payment_hash,
				amt_in_msat: packet.amt_to_forward,
				amt_out_msat: packet.amt_to_forward,
				outgoing_cltv_value: packet.incoming_cltv_expiry,
				committed: true,
				pending_resolution: Some(outcome),
			},
		);
		Ok(())
	}

	/// Hands a resolution to the link its HTLC arrived on. Returns whether the link took it.
	fn deliver_resolution(&self, resolution: HtlcResolution) -> bool {
		let link = self.links.lock().unwrap().by_id.get(&resolution.incoming_chan_id).cloned();
		match link {
			Some(link) => link.handle_switch_resolution(resolution).is_ok(),
			None => {
				log_warn!(
					self.logger,
					"Cannot resolve HTLC {} on channel {}: no link registered",
					resolution.incoming_htlc_id,
					resolution.incoming_chan_id
				);
				false
			},
		}
	}

	/// If the circuit's outcome is already decided but its resolution has not yet been accepted
	/// by the incoming link, tries delivering it again. Returns whether the circuit was in that
	/// state.
	fn redeliver_stored_resolution(&self, key: CircuitKey) -> bool {
		let outcome = {
			let circuits = self.circuits.lock().unwrap();
			match circuits.open.get(&key).and_then(|c| c.pending_resolution.clone()) {
				Some(outcome) => outcome,
				None => return false,
			}
		};
		if self.deliver_resolution(HtlcResolution {
			incoming_chan_id: key.chan_id,
			incoming_htlc_id: key.htlc_id,
			outcome,
		}) {
			// The reservation was already released when the outcome was first recorded.
			self.circuits.lock().unwrap().open.remove(&key);
		} else {
			log_warn!(
				self.logger,
				"Incoming link for circuit {} still cannot take its resolution",
				key
			);
		}
		true
	}

	/// Fails the circuit with the given key back to its incoming channel, unless its outcome
	/// was already decided, in which case the stored resolution is redelivered instead. The
	/// circuit is only removed once the incoming link has accepted the message, so delivery
	/// failures are retried by the caller's next sweep.
	fn fail_circuit_back(&self, key: CircuitKey, reason: FailureReason) {
		if self.redeliver_stored_resolution(key) {
			return;
		}
		if !self.deliver_resolution(HtlcResolution {
			incoming_chan_id: key.chan_id,
			incoming_htlc_id: key.htlc_id,
			outcome: ResolutionOutcome::Fail(reason),
		}) {
			log_error!(self.logger, "Failed to deliver fail for circuit {}, will retry", key);
			return;
		}
		let mut circuits = self.circuits.lock().unwrap();
		if let Some(circuit) = circuits.open.remove(&key) {
			if !circuit.committed {
				Self::release_reservation(
					&mut circuits.reserved_msat,
					&circuit.outgoing_chan_id,
					circuit.amt_out_msat,
				);
			}
		}
	}

	fn release_reservation(
		reserved_msat: &mut HashMap<ChannelId, u64>, chan_id: &ChannelId, amt_msat: u64,
	) {
		if let Some(reserved) = reserved_msat.get_mut(chan_id) {
			*reserved = reserved.saturating_sub(amt_msat);
			if *reserved == 0 {
				reserved_msat.remove(chan_id);
			}
		}
	}
}

impl<L: Deref + Send + Sync, I: Deref + Send + Sync, E: Deref + Send + Sync> HtlcForwarder
	for Switch<L, I, E>
where
	L::Target: Logger,
	I::Target: InvoiceDatabase,
	E::Target: ForwardingLog,
{
	fn forward_htlc(&self, packet: HtlcPacket) -> Result<(), ForwardError> {
		let key = CircuitKey { chan_id: packet.incoming_chan_id, htlc_id: packet.incoming_htlc_id };
		if self.redeliver_stored_resolution(key) {
			// A retransmission of an HTLC whose outcome is already decided; the stored
			// resolution is delivered again rather than re-admitting the HTLC.
			return Ok(());
		}
		if packet.outgoing_scid == 0 {
			return self.process_final_hop(packet);
		}
		let (outgoing_chan_id, link) = {
			let links = self.links.lock().unwrap();
			let chan_id =
				*links.short_to_id.get(&packet.outgoing_scid).ok_or(ForwardError::UnknownChannel)?;
			let link =
				links.by_id.get(&chan_id).cloned().ok_or(ForwardError::UnknownChannel)?;
			(chan_id, link)
		};
		if !link.eligible_to_forward() {
			return Err(ForwardError::LinkNotEligible);
		}
		let best_block_height = self.best_block_height();
		{
			let mut circuits = self.circuits.lock().unwrap();
			if circuits.open.contains_key(&key) {
				return Err(ForwardError::DuplicateAdd);
			}
			link.htlc_satisfies_policy(
				&packet.payment_hash,
				packet.incoming_amt_msat,
				packet.amt_to_forward,
				packet.incoming_cltv_expiry,
				packet.outgoing_cltv_value,
				best_block_height,
			)
			.map_err(ForwardError::PolicyFailure)?;
			// The link's bandwidth does not yet account for concurrently-admitted HTLCs it has
			// not picked up, so re-check it under our reservations.
			let reserved = circuits.reserved_msat.get(&outgoing_chan_id).copied().unwrap_or(0);
			if link.bandwidth_msat().saturating_sub(reserved) < packet.amt_to_forward {
				return Err(ForwardError::PolicyFailure(FailureReason::TemporaryChannelFailure));
			}
			circuits.open.insert(
				key,
				OpenCircuit {
					outgoing_chan_id,
					payment_hash: packet.payment_hash,
					amt_in_msat: packet.incoming_amt_msat,
					amt_out_msat: packet.amt_to_forward,
					outgoing_cltv_value: packet.outgoing_cltv_value,
					committed: false,
					pending_resolution: None,
				},
			);
			*circuits.reserved_msat.entry(outgoing_chan_id).or_insert(0) += packet.amt_to_forward;
		}
		let payment_hash = packet.payment_hash;
		let amt_to_forward = packet.amt_to_forward;
		if link.handle_switch_packet(packet).is_err() {
			let mut circuits = self.circuits.lock().unwrap();
			circuits.open.remove(&key);
			Self::release_reservation(&mut circuits.reserved_msat, &outgoing_chan_id, amt_to_forward);
			return Err(ForwardError::MailboxFull);
		}
		log_trace!(
			self.logger,
			"Admitted HTLC with hash {} for forwarding over channel {} as circuit {}",
			payment_hash,
			outgoing_chan_id,
			key
		);
		Ok(())
	}

	fn resolve_htlc(&self, resolution: HtlcResolution) {
		let key = CircuitKey {
			chan_id: resolution.incoming_chan_id,
			htlc_id: resolution.incoming_htlc_id,
		};
		let (first, outcome, outgoing_chan_id, payment_hash, amt_in_msat, amt_out_msat) = {
			let mut guard = self.circuits.lock().unwrap();
			let circuits = &mut *guard;
			match circuits.open.get_mut(&key) {
				Some(circuit) => {
					if !circuit.committed {
						circuit.committed = true;
						Self::release_reservation(
							&mut circuits.reserved_msat,
							&circuit.outgoing_chan_id,
							circuit.amt_out_msat,
						);
					}
					// The first resolution to arrive decides the circuit's outcome; anything
					// later for the same circuit only retries delivering it.
					let first = circuit.pending_resolution.is_none();
					if first {
						circuit.pending_resolution = Some(resolution.outcome.clone());
					}
					let outcome =
						circuit.pending_resolution.clone().unwrap_or(resolution.outcome.clone());
					(
						first,
						outcome,
						circuit.outgoing_chan_id,
						circuit.payment_hash,
						circuit.amt_in_msat,
						circuit.amt_out_msat,
					)
				},
				None => {
					// Resolutions are idempotent: a duplicate settle or fail for a circuit
					// already torn down is dropped here.
					log_debug!(self.logger, "Ignoring resolution for unknown circuit {}", key);
					return;
				},
			}
		};
		if first && matches!(outcome, ResolutionOutcome::Settle(_)) {
			log_info!(
				self.logger,
				"Completed forward of {} msat with hash {} from channel {} to channel {}, earning {} msat",
				amt_out_msat,
				payment_hash,
				key.chan_id,
				outgoing_chan_id,
				amt_in_msat.saturating_sub(amt_out_msat)
			);
			self.pending_fwd_events.lock().unwrap().push(ForwardingEvent {
				timestamp: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO),
				incoming_chan_id: key.chan_id,
				outgoing_chan_id,
				amt_in_msat,
				amt_out_msat,
				fee_msat: amt_in_msat.saturating_sub(amt_out_msat),
			});
		} else if first {
			log_debug!(self.logger, "Resolved circuit {} with a failure", key);
		}
		if self.deliver_resolution(HtlcResolution {
			incoming_chan_id: key.chan_id,
			incoming_htlc_id: key.htlc_id,
			outcome,
		}) {
			self.circuits.lock().unwrap().open.remove(&key);
		} else {
			log_warn!(
				self.logger,
				"Incoming link for circuit {} cannot take its resolution, holding it for redelivery",
				key
			);
		}
	}

	fn packet_committed(&self, incoming_chan_id: ChannelId, incoming_htlc_id: u64) {
		let key = CircuitKey { chan_id: incoming_chan_id, htlc_id: incoming_htlc_id };
		let mut guard = self.circuits.lock().unwrap();
		let circuits = &mut *guard;
		if let Some(circuit) = circuits.open.get_mut(&key) {
			if !circuit.committed {
				circuit.committed = true;
				Self::release_reservation(
					&mut circuits.reserved_msat,
					&circuit.outgoing_chan_id,
					circuit.amt_out_msat,
				);
			}
		}
	}
}

/// A background worker which periodically flushes a [`Switch`]'s batched forwarding events to
/// its [`ForwardingLog`].
///
/// The worker runs until [`SwitchBackground::stop`] is called or the handle is dropped, and
/// performs a final flush on the way out.
pub struct SwitchBackground {
	stop_thread: Arc<AtomicBool>,
	thread_handle: Option<JoinHandle<()>>,
}

impl SwitchBackground {
	/// Starts the background worker for the given switch.
	pub fn start<L, I, E>(switch: Arc<Switch<L, I, E>>) -> Self
	where
		L: 'static + Deref + Send + Sync,
		I: 'static + Deref + Send + Sync,
		E: 'static + Deref + Send + Sync,
		L::Target: Logger,
		I::Target: InvoiceDatabase,
		E::Target: ForwardingLog,
	{
		let stop_thread = Arc::new(AtomicBool::new(false));
		let stop_thread_clone = Arc::clone(&stop_thread);
		let handle = thread::spawn(move || {
			let mut last_flush = Instant::now();
			loop {
				if stop_thread_clone.load(Ordering::Acquire) {
					break;
				}
				thread::sleep(Duration::from_millis(100));
				if last_flush.elapsed().as_secs() >= FWD_EVENT_FLUSH_INTERVAL_SECS {
					let _ = switch.flush_forwarding_events();
					last_flush = Instant::now();
				}
			}
			let _ = switch.flush_forwarding_events();
		});
		Self { stop_thread, thread_handle: Some(handle) }
	}

	/// Stops the worker, blocking until it has flushed a final time and exited.
	pub fn stop(mut self) {
		self.stop_and_join_thread();
	}

	fn stop_and_join_thread(&mut self) {
		self.stop_thread.store(true, Ordering::Release);
		if let Some(handle) = self.thread_handle.take() {
			let _ = handle.join();
		}
	}
}

impl Drop for SwitchBackground {
	fn drop(&mut self) {
		self.stop_and_join_thread();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::{TestForwardingLog, TestInvoiceDatabase, TestLogger};

	use std::sync::Arc;

	type TestSwitch = Switch<Arc<TestLogger>, Arc<TestInvoiceDatabase>, Arc<TestForwardingLog>>;

	fn new_test_switch() -> (Arc<TestSwitch>, Arc<TestForwardingLog>, Arc<TestLogger>) {
		let logger = Arc::new(TestLogger::new());
		let invoices = Arc::new(TestInvoiceDatabase::new());
		let fwd_log = Arc::new(TestForwardingLog::new());
		let switch =
			Arc::new(Switch::new(invoices, Arc::clone(&fwd_log), Arc::clone(&logger), 100));
		(switch, fwd_log, logger)
	}

	fn dummy_event(byte: u8) -> ForwardingEvent {
		ForwardingEvent {
			timestamp: Duration::from_secs(byte as u64),
			incoming_chan_id: ChannelId([byte; 32]),
			outgoing_chan_id: ChannelId([byte.wrapping_add(1); 32]),
			amt_in_msat: 1000,
			amt_out_msat: 990,
			fee_msat: 10,
		}
	}

	#[test]
	fn get_and_clear_forwarding_events() {
		let (switch, _, _) = new_test_switch();
		assert!(switch.get_and_clear_pending_forwarding_events().is_empty());
		switch.pending_fwd_events.lock().unwrap().push(dummy_event(1));
		switch.pending_fwd_events.lock().unwrap().push(dummy_event(2));
		let events = switch.get_and_clear_pending_forwarding_events();
		assert_eq!(events.len(), 2);
		assert_eq!(events[0], dummy_event(1));
		assert!(switch.get_and_clear_pending_forwarding_events().is_empty());
	}

	#[test]
	fn flush_retries_failed_batches_in_order() {
		let (switch, fwd_log, _) = new_test_switch();
		switch.pending_fwd_events.lock().unwrap().push(dummy_event(1));
		fwd_log.fail_next_batch();
		assert_eq!(switch.flush_forwarding_events(), Err(()));
		assert!(fwd_log.events().is_empty());

		// Events recorded between flushes stay ordered behind the retried batch.
		switch.pending_fwd_events.lock().unwrap().push(dummy_event(2));
		assert_eq!(switch.flush_forwarding_events(), Ok(()));
		let events = fwd_log.events();
		assert_eq!(events.len(), 2);
		assert_eq!(events[0], dummy_event(1));
		assert_eq!(events[1], dummy_event(2));

		// Nothing pending is a no-op.
		assert_eq!(switch.flush_forwarding_events(), Ok(()));
		assert_eq!(fwd_log.events().len(), 2);
	}

	#[test]
	fn tracks_best_block_height() {
		let (switch, _, _) = new_test_switch();
		assert_eq!(switch.best_block_height(), 100);
		switch.best_block_updated(105);
		assert_eq!(switch.best_block_height(), 105);
	}

	#[test]
	fn background_worker_flushes_periodically() {
		let (switch, fwd_log, _) = new_test_switch();
		switch.pending_fwd_events.lock().unwrap().push(dummy_event(1));
		let background = SwitchBackground::start(Arc::clone(&switch));
		// The test-mode flush interval is one second.
		for _ in 0..50 {
			if !fwd_log.events().is_empty() {
				break;
			}
			thread::sleep(Duration::from_millis(100));
		}
		assert_eq!(fwd_log.events().len(), 1);

		// A final flush happens on stop.
		switch.pending_fwd_events.lock().unwrap().push(dummy_event(2));
		background.stop();
		assert_eq!(fwd_log.events().len(), 2);
	}
}
