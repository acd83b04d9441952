//! Codec for fixed-size wire structures.
//!
//! Every field of the signalling commands and HCI parameters handled here has a size
//! known at compile time. Values are little endian. Structures get their impls
//! from `#[derive(Codec)]`.

use heapless::Vec;

/// A wire type whose encoding always takes [`SIZE`](Self::SIZE) bytes.
pub trait FixedSize: Sized {
    const SIZE: usize;

    fn size(&self) -> usize {
        Self::SIZE
    }
}

pub trait Encode: FixedSize {
    /// Write `self` to the start of `dest`.
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error>;
}

pub trait Decode<'d>: FixedSize {
    /// Read a value from the start of `src`. Trailing bytes are ignored.
    fn decode(src: &'d [u8]) -> Result<Self, Error>;
}

/// Encode `value` into a buffer of its own.
pub fn to_bytes<T: Encode, const N: usize>(value: &T) -> Result<Vec<u8, N>, Error> {
    let mut bytes = Vec::new();
    bytes.resize(T::SIZE, 0).map_err(|_| Error::InsufficientSpace)?;
    value.encode(&mut bytes)?;
    Ok(bytes)
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Source or destination is shorter than the encoding.
    InsufficientSpace,
    /// A field holds a value outside its range.
    InvalidValue,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InsufficientSpace => f.write_str("buffer too short"),
            Self::InvalidValue => f.write_str("value out of range"),
        }
    }
}
