// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use crate::ln::interfaces::{
	ForwardingLog, HtlcForwarder, Invoice, InvoiceDatabase, InvoiceError, Peer, PeerError,
};
use crate::ln::msgs::Message;
use crate::ln::switch::{ForwardError, ForwardingEvent, HtlcPacket, HtlcResolution};
use crate::ln::types::{ChannelId, PaymentHash, PaymentPreimage};
use crate::util::logger::{Level, Logger, Record};

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::OutPoint;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub struct TestLogger {
	level: Level,
	id: String,
	pub lines: Mutex<HashMap<(String, String), usize>>,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		Self::with_id("".to_owned())
	}
	pub fn with_id(id: String) -> TestLogger {
		TestLogger { level: Level::Trace, id, lines: Mutex::new(HashMap::new()) }
	}
	#[allow(dead_code)]
	pub fn enable(&mut self, level: Level) {
		self.level = level;
	}
	#[allow(dead_code)]
	pub fn assert_log(&self, module: &str, line: String, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		assert_eq!(log_entries.get(&(module.to_string(), line)), Some(&count));
	}

	/// Search for the number of occurrences of a partially-matching log entry, asserting it
	/// equals the given count
	pub fn assert_log_contains(&self, module: &str, line: &str, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		let l: usize = log_entries
			.iter()
			.filter(|&(&(ref m, ref l), _c)| m == module && l.contains(line))
			.map(|(_, c)| c)
			.sum();
		assert_eq!(l, count, "expected {} occurrences of \"{}\", found {}", count, line, l);
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		*self
			.lines
			.lock()
			.unwrap()
			.entry((record.module_path.to_string(), format!("{}", record.args)))
			.or_insert(0) += 1;
		if record.level >= self.level {
			println!(
				"{:<5} {} [{} : {}] {}",
				record.level, self.id, record.module_path, record.line, record.args
			);
		}
	}
}

pub fn pubkey(seed: u8) -> PublicKey {
	let secp_ctx = Secp256k1::new();
	PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[seed; 32]).unwrap())
}

pub struct TestPeer {
	node_id: PublicKey,
	pub sent_messages: Mutex<Vec<(Message, bool)>>,
	pub wiped_channels: Mutex<Vec<OutPoint>>,
	fail_sends: AtomicBool,
}

impl TestPeer {
	pub fn new(seed: u8) -> TestPeer {
		TestPeer {
			node_id: pubkey(seed),
			sent_messages: Mutex::new(Vec::new()),
			wiped_channels: Mutex::new(Vec::new()),
			fail_sends: AtomicBool::new(false),
		}
	}

	pub fn fail_sends(&self, fail: bool) {
		self.fail_sends.store(fail, Ordering::Release);
	}

	pub fn sent_messages(&self) -> Vec<(Message, bool)> {
		self.sent_messages.lock().unwrap().clone()
	}

	pub fn clear_sent_messages(&self) {
		self.sent_messages.lock().unwrap().clear();
	}
}

impl Peer for TestPeer {
	fn send_message(&self, msg: Message, sync: bool) -> Result<(), PeerError> {
		if self.fail_sends.load(Ordering::Acquire) {
			return Err(PeerError::SendFailed);
		}
		self.sent_messages.lock().unwrap().push((msg, sync));
		Ok(())
	}

	fn wipe_channel(&self, channel_point: &OutPoint) -> Result<(), PeerError> {
		self.wiped_channels.lock().unwrap().push(*channel_point);
		Ok(())
	}

	fn node_id(&self) -> PublicKey {
		self.node_id
	}
}

pub struct TestInvoiceDatabase {
	invoices: Mutex<HashMap<PaymentHash, Invoice>>,
}

impl TestInvoiceDatabase {
	pub fn new() -> TestInvoiceDatabase {
		TestInvoiceDatabase { invoices: Mutex::new(HashMap::new()) }
	}

	pub fn add_invoice(
		&self, payment_preimage: PaymentPreimage, amt_msat: u64, min_final_cltv_expiry_delta: u32,
	) -> PaymentHash {
		let payment_hash = payment_preimage.payment_hash();
		self.invoices.lock().unwrap().insert(
			payment_hash,
			Invoice { payment_preimage, amt_msat, min_final_cltv_expiry_delta, settled: false },
		);
		payment_hash
	}

	pub fn is_settled(&self, payment_hash: &PaymentHash) -> bool {
		self.invoices.lock().unwrap().get(payment_hash).map(|inv| inv.settled).unwrap_or(false)
	}
}

impl InvoiceDatabase for TestInvoiceDatabase {
	fn lookup_invoice(&self, payment_hash: &PaymentHash) -> Result<Invoice, InvoiceError> {
		self.invoices.lock().unwrap().get(payment_hash).cloned().ok_or(InvoiceError::NotFound)
	}

	fn settle_invoice(&self, payment_hash: &PaymentHash) -> Result<(), InvoiceError> {
		let mut invoices = self.invoices.lock().unwrap();
		let invoice = invoices.get_mut(payment_hash).ok_or(InvoiceError::NotFound)?;
		if invoice.settled {
			return Err(InvoiceError::AlreadySettled);
		}
		invoice.settled = true;
		Ok(())
	}
}

pub struct TestForwardingLog {
	events: Mutex<Vec<ForwardingEvent>>,
	fail_next: AtomicBool,
}

impl TestForwardingLog {
	pub fn new() -> TestForwardingLog {
		TestForwardingLog { events: Mutex::new(Vec::new()), fail_next: AtomicBool::new(false) }
	}

	pub fn fail_next_batch(&self) {
		self.fail_next.store(true, Ordering::Release);
	}

	pub fn events(&self) -> Vec<ForwardingEvent> {
		self.events.lock().unwrap().clone()
	}
}

impl ForwardingLog for TestForwardingLog {
	fn add_forwarding_events(&self, events: &[ForwardingEvent]) -> Result<(), ()> {
		if self.fail_next.swap(false, Ordering::AcqRel) {
			return Err(());
		}
		self.events.lock().unwrap().extend_from_slice(events);
		Ok(())
	}
}

/// A recording [`HtlcForwarder`] standing in for a full switch in link-level tests.
pub struct TestForwarder {
	pub forwarded_packets: Mutex<Vec<HtlcPacket>>,
	pub resolutions: Mutex<Vec<HtlcResolution>>,
	pub committed: Mutex<Vec<(ChannelId, u64)>>,
	pub forward_result: Mutex<Result<(), ForwardError>>,
}

impl TestForwarder {
	pub fn new() -> TestForwarder {
		TestForwarder {
			forwarded_packets: Mutex::new(Vec::new()),
			resolutions: Mutex::new(Vec::new()),
			committed: Mutex::new(Vec::new()),
			forward_result: Mutex::new(Ok(())),
		}
	}

	pub fn fail_forwards_with(&self, err: ForwardError) {
		*self.forward_result.lock().unwrap() = Err(err);
	}
}

impl HtlcForwarder for TestForwarder {
	fn forward_htlc(&self, packet: HtlcPacket) -> Result<(), ForwardError> {
		self.forwarded_packets.lock().unwrap().push(packet);
		self.forward_result.lock().unwrap().clone()
	}

	fn resolve_htlc(&self, resolution: HtlcResolution) {
		self.resolutions.lock().unwrap().push(resolution);
	}

	fn packet_committed(&self, incoming_chan_id: ChannelId, incoming_htlc_id: u64) {
		self.committed.lock().unwrap().push((incoming_chan_id, incoming_htlc_id));
	}
}
