// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various wrapper types (most around 32-byte arrays) for use in lightning.

use crate::util::macro_logger::DebugBytes;

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::Hash as _;
use bitcoin::OutPoint;

use std::fmt;

/// A unique 32-byte identifier for a channel.
/// Depending on how the ID is generated, several varieties are distinguished
/// (but all are stored as 32 bytes):
///   _v1_ method, same as BOLT#2 (representing the funding txid concatenated with the channel
///   output index, interpreted as big-endian), and a _temporary_ variety, not covered here.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
	/// Create _v1_ channel ID based on a funding TX ID and output index
	pub fn v1_from_funding_txid(txid: &[u8; 32], output_index: u16) -> Self {
		let mut res = [0; 32];
		res[..].copy_from_slice(&txid[..]);
		res[30] ^= ((output_index >> 8) & 0xff) as u8;
		res[31] ^= ((output_index >> 0) & 0xff) as u8;
		Self(res)
	}

	/// Create _v1_ channel ID from a funding tx outpoint
	pub fn v1_from_funding_outpoint(outpoint: &OutPoint) -> Self {
		Self::v1_from_funding_txid(outpoint.txid.as_ref(), outpoint.vout as u16)
	}

	/// Create a channel ID consisting of all-zeros data (e.g. when uninitialized or a placeholder).
	pub fn new_zero() -> Self {
		Self([0; 32])
	}

	/// Check whether ID is consisting of all zeros (uninitialized)
	pub fn is_zero(&self) -> bool {
		self.0[..] == [0; 32]
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		DebugBytes(&self.0).fmt(f)
	}
}

impl fmt::Debug for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

/// The payment hash is the hash of the [`PaymentPreimage`] which is the value used to lock funds
/// in HTLCs while they transit the lightning network.
///
/// This is not exported to bindings users as we just use [u8; 32] directly.
#[derive(Hash, Copy, Clone, PartialEq, Eq)]
pub struct PaymentHash(pub [u8; 32]);

impl fmt::Display for PaymentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		DebugBytes(&self.0).fmt(f)
	}
}

impl fmt::Debug for PaymentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

/// The payment preimage is the "secret" which is provided to claim an HTLC locked with the
/// matching [`PaymentHash`].
///
/// This is not exported to bindings users as we just use [u8; 32] directly.
#[derive(Hash, Copy, Clone, PartialEq, Eq)]
pub struct PaymentPreimage(pub [u8; 32]);

impl fmt::Display for PaymentPreimage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		DebugBytes(&self.0).fmt(f)
	}
}

impl fmt::Debug for PaymentPreimage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl PaymentPreimage {
	/// Derives the [`PaymentHash`] which locks HTLCs claimable with this preimage.
	pub fn payment_hash(&self) -> PaymentHash {
		PaymentHash(Sha256::hash(&self.0).to_byte_array())
	}
}
