//! Cache value encoding, expiration and the value-size calculator.
//!
//! ```text
//! ┌──────┬───────────┬─────────┬─────────────┬───────────────────────────────┐
//! │ meta │ flags u32 │ cas u64 │ exptime u32 │ body                          │
//! │  u8  │ if FLAGS  │ if CAS  │ if EXPTIME  │ inline: [len u16][bytes]      │
//! │      │           │         │             │ large:  [len u32][blob u64]   │
//! └──────┴───────────┴─────────┴─────────────┴───────────────────────────────┘
//! ```
//!
//! All integers are little endian. Payloads longer than the inline limit of a
//! [`CacheValueSizer`] live out of line as blobs and can only be fetched through the
//! transaction that pinned the snapshot.

use bytes::Bytes;
use thiserror::Error;

use crate::node::BlobId;
use crate::store::BlockSize;

const META_FLAGS: u8 = 0x01;
const META_CAS: u8 = 0x02;
const META_EXPTIME: u8 = 0x04;
const META_LARGE: u8 = 0x80;
const META_KNOWN: u8 = META_FLAGS | META_CAS | META_EXPTIME | META_LARGE;

/// A point in time, in seconds. As an expiration time, `0` means "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ExpTime(pub u32);

impl ExpTime {
	pub const NEVER: ExpTime = ExpTime(0);

	/// Returns `true` if a value carrying this expiration time is dead at `now`.
	#[inline]
	pub fn has_passed(self, now: ExpTime) -> bool {
		self.0 != 0 && self.0 <= now.0
	}
}

/// Why a value header could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
	#[error("value truncated: needed {needed} bytes, {available} available")]
	Truncated {
		needed: usize,
		available: usize,
	},

	#[error("unknown meta bits {0:#04x}")]
	UnknownMeta(u8),

	#[error("inline payload of {len} bytes exceeds the {max} byte limit")]
	InlineTooLarge {
		len: usize,
		max: usize,
	},
}

/// Where a value's payload lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
	Inline(&'a [u8]),
	Blob {
		id: BlobId,
		len: u32,
	},
}

/// Capabilities a stored value exposes to the query path.
pub trait StoredValue {
	/// Returns `true` if the value is dead as of `now`.
	fn expired(&self, now: ExpTime) -> bool;

	/// Opaque client flags.
	fn flags(&self) -> u32;

	fn cas(&self) -> Option<u64>;

	/// Returns a reference to the payload, which may be out of line.
	fn payload(&self) -> Payload<'_>;
}

/// Computes the encoded size of stored values so leaves can be parsed.
pub trait ValueSizer: Send + Sync {
	/// Returns the number of bytes the value at the start of `buf` occupies.
	fn size(&self, buf: &[u8]) -> Result<usize, DecodeError>;

	/// Longest payload stored inside a leaf.
	fn max_inline(&self) -> usize;
}

/// [`ValueSizer`] for cache values. The inline limit is a quarter of the block size.
#[derive(Debug, Clone, Copy)]
pub struct CacheValueSizer {
	max_inline: usize,
}

impl CacheValueSizer {
	pub fn new(block_size: BlockSize) -> CacheValueSizer {
		CacheValueSizer {
			max_inline: (block_size.value() / 4).min(u16::MAX as usize),
		}
	}
}

impl ValueSizer for CacheValueSizer {
	fn size(&self, buf: &[u8]) -> Result<usize, DecodeError> {
		let header = Header::decode(buf)?;
		if let Body::Inline {
			len,
		} = header.body
		{
			if len > self.max_inline {
				return Err(DecodeError::InlineTooLarge {
					len,
					max: self.max_inline,
				});
			}
		}
		Ok(header.total_len())
	}

	fn max_inline(&self) -> usize {
		self.max_inline
	}
}

#[derive(Debug, Clone, Copy)]
enum Body {
	Inline {
		len: usize,
	},
	Large {
		len: u32,
		blob: BlobId,
	},
}

#[derive(Debug, Clone, Copy)]
struct Header {
	flags: Option<u32>,
	cas: Option<u64>,
	exptime: Option<ExpTime>,
	header_len: usize,
	body: Body,
}

impl Header {
	fn decode(buf: &[u8]) -> Result<Header, DecodeError> {
		let mut reader = Reader {
			buf,
			pos: 0,
		};
		let meta = reader.u8()?;
		if meta & !META_KNOWN != 0 {
			return Err(DecodeError::UnknownMeta(meta));
		}

		let flags = if meta & META_FLAGS != 0 {
			Some(reader.u32()?)
		} else {
			None
		};
		let cas = if meta & META_CAS != 0 {
			Some(reader.u64()?)
		} else {
			None
		};
		let exptime = if meta & META_EXPTIME != 0 {
			Some(ExpTime(reader.u32()?))
		} else {
			None
		};

		let body = if meta & META_LARGE != 0 {
			let len = reader.u32()?;
			let blob = BlobId(reader.u64()?);
			Body::Large {
				len,
				blob,
			}
		} else {
			Body::Inline {
				len: reader.u16()? as usize,
			}
		};

		Ok(Header {
			flags,
			cas,
			exptime,
			header_len: reader.pos,
			body,
		})
	}

	fn total_len(&self) -> usize {
		match self.body {
			Body::Inline {
				len,
			} => self.header_len + len,
			Body::Large {
				..
			} => self.header_len,
		}
	}
}

struct Reader<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
		let end = self.pos + N;
		let bytes = self.buf.get(self.pos..end).ok_or(DecodeError::Truncated {
			needed: end,
			available: self.buf.len(),
		})?;
		self.pos = end;
		let mut out = [0u8; N];
		out.copy_from_slice(bytes);
		Ok(out)
	}

	fn u8(&mut self) -> Result<u8, DecodeError> {
		Ok(self.take::<1>()?[0])
	}

	fn u16(&mut self) -> Result<u16, DecodeError> {
		Ok(u16::from_le_bytes(self.take()?))
	}

	fn u32(&mut self) -> Result<u32, DecodeError> {
		Ok(u32::from_le_bytes(self.take()?))
	}

	fn u64(&mut self) -> Result<u64, DecodeError> {
		Ok(u64::from_le_bytes(self.take()?))
	}
}

/// A decoded view over an encoded cache value.
#[derive(Debug, Clone, Copy)]
pub struct CacheValue<'a> {
	header: Header,
	buf: &'a [u8],
}

impl<'a> CacheValue<'a> {
	/// Decodes the value at the start of `buf`; trailing bytes are ignored.
	pub fn decode(buf: &'a [u8]) -> Result<CacheValue<'a>, DecodeError> {
		let header = Header::decode(buf)?;
		let total = header.total_len();
		if total > buf.len() {
			return Err(DecodeError::Truncated {
				needed: total,
				available: buf.len(),
			});
		}
		Ok(CacheValue {
			header,
			buf: &buf[..total],
		})
	}

	pub fn exptime(&self) -> ExpTime {
		self.header.exptime.unwrap_or(ExpTime::NEVER)
	}

	/// Length of the payload, wherever it lives.
	pub fn payload_len(&self) -> usize {
		match self.header.body {
			Body::Inline {
				len,
			} => len,
			Body::Large {
				len,
				..
			} => len as usize,
		}
	}
}

impl<'a> StoredValue for CacheValue<'a> {
	fn expired(&self, now: ExpTime) -> bool {
		self.exptime().has_passed(now)
	}

	fn flags(&self) -> u32 {
		self.header.flags.unwrap_or(0)
	}

	fn cas(&self) -> Option<u64> {
		self.header.cas
	}

	fn payload(&self) -> Payload<'_> {
		match self.header.body {
			Body::Inline {
				..
			} => Payload::Inline(&self.buf[self.header.header_len..]),
			Body::Large {
				len,
				blob,
			} => Payload::Blob {
				id: blob,
				len,
			},
		}
	}
}

/// Builder for encoded cache values.
#[derive(Debug, Clone)]
pub struct EncodedValue<'a> {
	flags: Option<u32>,
	cas: Option<u64>,
	exptime: Option<ExpTime>,
	body: EncodedBody<'a>,
}

#[derive(Debug, Clone, Copy)]
enum EncodedBody<'a> {
	Inline(&'a [u8]),
	Blob(BlobId, u32),
}

impl<'a> EncodedValue<'a> {
	/// A value whose payload is stored inside the leaf.
	pub fn inline(data: &'a [u8]) -> EncodedValue<'a> {
		EncodedValue {
			flags: None,
			cas: None,
			exptime: None,
			body: EncodedBody::Inline(data),
		}
	}

	/// A value whose payload was stored out of line.
	pub fn blob(id: BlobId, len: u32) -> EncodedValue<'a> {
		EncodedValue {
			flags: None,
			cas: None,
			exptime: None,
			body: EncodedBody::Blob(id, len),
		}
	}

	pub fn flags(mut self, flags: u32) -> Self {
		self.flags = (flags != 0).then_some(flags);
		self
	}

	pub fn cas(mut self, cas: Option<u64>) -> Self {
		self.cas = cas;
		self
	}

	pub fn exptime(mut self, exptime: ExpTime) -> Self {
		self.exptime = (exptime != ExpTime::NEVER).then_some(exptime);
		self
	}

	/// # Panics
	///
	/// Panics if an inline payload is longer than `u16::MAX`.
	pub fn build(&self) -> Vec<u8> {
		let mut meta = 0u8;
		let mut out = vec![0u8];

		if let Some(flags) = self.flags {
			meta |= META_FLAGS;
			out.extend_from_slice(&flags.to_le_bytes());
		}
		if let Some(cas) = self.cas {
			meta |= META_CAS;
			out.extend_from_slice(&cas.to_le_bytes());
		}
		if let Some(exptime) = self.exptime {
			meta |= META_EXPTIME;
			out.extend_from_slice(&exptime.0.to_le_bytes());
		}

		match self.body {
			EncodedBody::Inline(data) => {
				let len = u16::try_from(data.len()).expect("inline payload longer than u16::MAX");
				out.extend_from_slice(&len.to_le_bytes());
				out.extend_from_slice(data);
			}
			EncodedBody::Blob(id, len) => {
				meta |= META_LARGE;
				out.extend_from_slice(&len.to_le_bytes());
				out.extend_from_slice(&id.0.to_le_bytes());
			}
		}

		out[0] = meta;
		out
	}
}

/// A value as handed to the bulk loader.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Item {
	pub flags: u32,
	pub cas: Option<u64>,
	pub exptime: ExpTime,
	pub data: Bytes,
}

impl Item {
	pub fn new(data: impl Into<Bytes>) -> Item {
		Item {
			data: data.into(),
			..Item::default()
		}
	}

	pub fn with_flags(mut self, flags: u32) -> Item {
		self.flags = flags;
		self
	}

	pub fn with_cas(mut self, cas: u64) -> Item {
		self.cas = Some(cas);
		self
	}

	pub fn expiring_at(mut self, exptime: ExpTime) -> Item {
		self.exptime = exptime;
		self
	}
}
