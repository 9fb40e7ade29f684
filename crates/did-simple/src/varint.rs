//! Unsigned varints, as used by [multicodec] prefixes.
//!
//! Only values that fit in a `u16` are supported, which covers every
//! multicodec used by this crate.
//!
//! [multicodec]: https://github.com/multiformats/unsigned-varint

/// bitmask for 7 least significant bits
const LSB_7: u8 = u8::MAX / 2;
/// bitmask for most significant bit
const MSB: u8 = !LSB_7;

#[inline]
const fn msb_is_1(val: u8) -> bool {
	val & MSB == MSB
}

#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
pub struct VarintEncoding {
	buf: [u8; 3],
	len: u8,
}

impl VarintEncoding {
	pub const fn as_slice(&self) -> &[u8] {
		self.buf.split_at(self.len as usize).0
	}
}

/// Encodes a value as a varint.
pub const fn encode_varint(value: u16) -> VarintEncoding {
	let mut out_buf = [0; 3];
	// ilog2 gives the 0-indexed position of the MSB, we want a length.
	let in_bit_length: u16 = if let Some(x) = value.checked_ilog2() {
		(x + 1) as u16
	} else {
		// Zero still takes up a single byte.
		return VarintEncoding {
			buf: out_buf,
			len: 1,
		};
	};

	let mut out = 0u32;
	let mut in_bit_pos = 0u16;
	// Each time we need to write a carry bit into the MSB, we increment this.
	let mut carry_counter = 0;
	// Have to use macro because consts can't use closures or &mut in functions :(
	macro_rules! copy_chunk {
		() => {
			let retrieved_bits = value & ((LSB_7 as u16) << in_bit_pos);
			// Shift left to leave room for the carry bits written so far.
			out |= (retrieved_bits as u32) << carry_counter;
			in_bit_pos += 7;
		};
	}
	copy_chunk!();
	while in_bit_pos < in_bit_length {
		carry_counter += 1;
		out |= 1 << (carry_counter * 8 - 1); // turns on MSB to indicate carry.
		copy_chunk!();
	}

	let num_output_bytes = carry_counter + 1;

	// No for loops or copy_from_slice in const fn :(
	let mut idx = 0;
	let output_bytes = out.to_le_bytes();
	while idx < num_output_bytes {
		out_buf[idx] = output_bytes[idx];
		idx += 1;
	}

	VarintEncoding {
		buf: out_buf,
		len: num_output_bytes as u8,
	}
}

/// Decodes the varint at the start of `encoded`, returning the value and the
/// number of bytes that it occupied. Trailing bytes are left untouched, so this
/// can be used to strip a multicodec prefix off of a buffer.
pub const fn decode_varint(encoded: &[u8]) -> Result<(u16, usize), DecodeError> {
	if encoded.is_empty() {
		return Err(DecodeError::MissingBytes);
	}

	let a = encoded[0];
	let mut result: u16 = (a & LSB_7) as u16;
	if !msb_is_1(a) {
		return Ok((result, 1));
	}
	if encoded.len() < 2 {
		return Err(DecodeError::MissingBytes);
	}
	let b = encoded[1];
	result |= ((b & LSB_7) as u16) << 7;
	if !msb_is_1(b) {
		return Ok((result, 2));
	}
	// TODO: Three byte encodings with a small enough last byte fit into a u16,
	// none of the multicodecs we use need them.
	Err(DecodeError::WouldOverflow)
}

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum DecodeError {
	#[error("expected more bytes than what were provided")]
	MissingBytes,
	#[error(
		"the decoded number is too large to fit into the type without overflowing"
	)]
	WouldOverflow,
}
