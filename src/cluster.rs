//! Node discovery handshake.
//!
//! When a node joins, the existing member introduces itself by sending its address as one
//! JSON line; the joining side reads that line, acknowledges it and builds a delegate bound to
//! the address. The address type is chosen by the [`Council`] implementation.

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, BufRead, Write};
use thiserror::Error;

/// A cluster member that can be reached at an address.
pub trait Council: Sized {
	type Address: Serialize + DeserializeOwned;

	fn address(&self) -> Self::Address;

	fn from_address(address: Self::Address) -> Self;
}

/// Handshake failures.
#[derive(Error, Debug)]
pub enum HandshakeError {
	#[error("handshake i/o: {0}")]
	Io(#[from] io::Error),

	#[error("malformed address: {0}")]
	Malformed(#[from] serde_json::Error),

	/// The peer closed the channel before sending an address.
	#[error("channel closed before an address arrived")]
	Closed,
}

/// Wraps a [`Council`] for the join handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouncilDelegate<C> {
	council: C,
}

impl<C: Council> CouncilDelegate<C> {
	pub fn new(council: C) -> Self {
		CouncilDelegate {
			council,
		}
	}

	pub fn council(&self) -> &C {
		&self.council
	}

	/// Sends this member's address to a joining node.
	pub fn introduce_new_node<W: Write>(&self, mut out: W) -> Result<(), HandshakeError> {
		serde_json::to_writer(&mut out, &self.council.address())?;
		out.write_all(b"\n")?;
		out.flush()?;
		debug!("introduced council address to a new node");
		Ok(())
	}

	/// Reads an address sent by [`CouncilDelegate::introduce_new_node`], calls `done` to
	/// acknowledge it, and returns a delegate bound to it.
	pub fn construct<R, F>(mut input: R, done: F) -> Result<Self, HandshakeError>
	where
		R: BufRead,
		F: FnOnce(),
	{
		let mut line = String::new();
		if input.read_line(&mut line)? == 0 {
			return Err(HandshakeError::Closed);
		}
		let address: C::Address = serde_json::from_str(line.trim_end())?;
		done();
		debug!("constructed council delegate from a received address");
		Ok(CouncilDelegate::new(C::from_address(address)))
	}
}
