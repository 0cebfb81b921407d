// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The bounded inbox through which every message reaches a link.

use crate::ln::msgs::Message;
use crate::ln::switch::{HtlcPacket, HtlcResolution};

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// The number of messages a [`MailBox`] created via [`MailBox::new`] will buffer before
/// [`MailBox::deliver`] starts failing.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 50;

/// A message addressed to a link, from either its peer or the switch.
#[derive(Clone, Debug)]
pub enum MailboxMessage {
	/// An HTLC admitted by the switch which the link should offer to its peer.
	SwitchAdd(HtlcPacket),
	/// The resolution of an HTLC the link previously received from its peer, which the link
	/// should relay by fulfilling or failing the corresponding update.
	SwitchResolution(HtlcResolution),
	/// A channel-update message received from the link's peer.
	PeerMessage(Message),
}

/// The error returned when delivering to a [`MailBox`] which is at capacity.
///
/// Delivery is never blocking - a slow link must push back on its producers rather than stall
/// them, so a full mailbox is surfaced immediately and the caller decides whether to retry,
/// drop, or fail the HTLC back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MailboxFull;

/// A bounded FIFO inbox for a single link.
///
/// All deliveries into a link flow through its mailbox, serializing concurrent producers (the
/// switch forwarding HTLCs in, the transport layer delivering peer messages) into a single
/// stream consumed by the link's worker.
///
/// A mailbox's contents are independent of any link's lifecycle: messages delivered while a
/// link is stopped are consumed once a link is attached to the same mailbox again.
pub struct MailBox {
	queue: Mutex<VecDeque<MailboxMessage>>,
	condvar: Condvar,
	capacity: usize,
}

impl MailBox {
	/// Creates a new mailbox buffering up to [`DEFAULT_MAILBOX_CAPACITY`] messages.
	pub fn new() -> Self {
		Self::with_capacity(DEFAULT_MAILBOX_CAPACITY)
	}

	/// Creates a new mailbox buffering up to `capacity` messages.
	pub fn with_capacity(capacity: usize) -> Self {
		Self { queue: Mutex::new(VecDeque::with_capacity(capacity)), condvar: Condvar::new(), capacity }
	}

	/// Appends a message, waking the consumer if one is blocked in [`Self::take`].
	///
	/// Errors with [`MailboxFull`] if the mailbox is at capacity, leaving its contents
	/// unchanged.
	pub fn deliver(&self, msg: MailboxMessage) -> Result<(), MailboxFull> {
		{
			let mut queue = self.queue.lock().unwrap();
			if queue.len() >= self.capacity {
				return Err(MailboxFull);
			}
			queue.push_back(msg);
		}
		self.condvar.notify_one();
		Ok(())
	}

	/// Removes and returns the oldest message, blocking up to `timeout` for one to arrive.
	///
	/// Returns `None` if the timeout elapses with the mailbox still empty.
	pub fn take(&self, timeout: Duration) -> Option<MailboxMessage> {
		let deadline = Instant::now() + timeout;
		let mut queue = self.queue.lock().unwrap();
		loop {
			if let Some(msg) = queue.pop_front() {
				return Some(msg);
			}
			let now = Instant::now();
			if now >= deadline {
				return None;
			}
			let (guard, _) = self.condvar.wait_timeout(queue, deadline - now).unwrap();
			queue = guard;
		}
	}

	/// Removes and returns the oldest message if one is immediately available.
	pub fn try_take(&self) -> Option<MailboxMessage> {
		self.queue.lock().unwrap().pop_front()
	}

	/// The number of messages currently queued.
	pub fn len(&self) -> usize {
		self.queue.lock().unwrap().len()
	}

	/// Whether no messages are currently queued.
	pub fn is_empty(&self) -> bool {
		self.queue.lock().unwrap().is_empty()
	}
}

impl Default for MailBox {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ln::msgs::CommitmentSigned;
	use crate::ln::types::ChannelId;

	use std::sync::Arc;
	use std::thread;

	fn dummy_msg(byte: u8) -> MailboxMessage {
		MailboxMessage::PeerMessage(Message::CommitmentSigned(CommitmentSigned {
			channel_id: ChannelId([byte; 32]),
		}))
	}

	fn msg_byte(msg: &MailboxMessage) -> u8 {
		match msg {
			MailboxMessage::PeerMessage(m) => m.channel_id().0[0],
			_ => panic!("unexpected message"),
		}
	}

	#[test]
	fn delivers_in_fifo_order() {
		let mailbox = MailBox::new();
		for i in 0..5u8 {
			mailbox.deliver(dummy_msg(i)).unwrap();
		}
		assert_eq!(mailbox.len(), 5);
		for i in 0..5u8 {
			assert_eq!(msg_byte(&mailbox.try_take().unwrap()), i);
		}
		assert!(mailbox.is_empty());
	}

	#[test]
	fn rejects_past_capacity() {
		let mailbox = MailBox::with_capacity(2);
		mailbox.deliver(dummy_msg(0)).unwrap();
		mailbox.deliver(dummy_msg(1)).unwrap();
		assert_eq!(mailbox.deliver(dummy_msg(2)), Err(MailboxFull));
		assert_eq!(mailbox.len(), 2);

		// Draining one slot makes delivery possible again.
		assert_eq!(msg_byte(&mailbox.try_take().unwrap()), 0);
		mailbox.deliver(dummy_msg(2)).unwrap();
		assert_eq!(msg_byte(&mailbox.try_take().unwrap()), 1);
		assert_eq!(msg_byte(&mailbox.try_take().unwrap()), 2);
	}

	#[test]
	fn take_times_out_when_empty() {
		let mailbox = MailBox::new();
		assert!(mailbox.try_take().is_none());
		assert!(mailbox.take(Duration::from_millis(10)).is_none());
	}

	#[test]
	fn take_wakes_on_delivery() {
		let mailbox = Arc::new(MailBox::new());
		let consumer_box = Arc::clone(&mailbox);
		let consumer = thread::spawn(move || {
			let msg = consumer_box.take(Duration::from_secs(30)).unwrap();
			msg_byte(&msg)
		});
		// Give the consumer a chance to block first.
		thread::sleep(Duration::from_millis(20));
		mailbox.deliver(dummy_msg(7)).unwrap();
		assert_eq!(consumer.join().unwrap(), 7);
	}

	#[test]
	fn concurrent_producers_are_serialized() {
		let mailbox = Arc::new(MailBox::with_capacity(100));
		let mut producers = Vec::new();
		for i in 0..4u8 {
			let producer_box = Arc::clone(&mailbox);
			producers.push(thread::spawn(move || {
				for _ in 0..10 {
					producer_box.deliver(dummy_msg(i)).unwrap();
				}
			}));
		}
		for producer in producers {
			producer.join().unwrap();
		}
		let mut counts = [0usize; 4];
		while let Some(msg) = mailbox.try_take() {
			counts[msg_byte(&msg) as usize] += 1;
		}
		assert_eq!(counts, [10, 10, 10, 10]);
	}

	#[test]
	fn contents_survive_consumer_turnover() {
		// A mailbox keeps its messages when no consumer exists, so a link which is stopped and
		// later re-attached to the same mailbox picks up where it left off.
		let mailbox = MailBox::new();
		mailbox.deliver(dummy_msg(1)).unwrap();
		mailbox.deliver(dummy_msg(2)).unwrap();
		assert_eq!(msg_byte(&mailbox.try_take().unwrap()), 1);
		assert_eq!(mailbox.len(), 1);
		assert_eq!(msg_byte(&mailbox.take(Duration::from_millis(10)).unwrap()), 2);
	}
}
