use crate::codec::{Decode, Encode, Error, FixedSize};

//
// Implementations for primitives
//
impl FixedSize for u8 {
    const SIZE: usize = 1;
}

impl FixedSize for u16 {
    const SIZE: usize = 2;
}

impl FixedSize for u32 {
    const SIZE: usize = 4;
}

impl Decode<'_> for u8 {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        match src {
            [b, ..] => Ok(*b),
            _ => Err(Error::InsufficientSpace),
        }
    }
}

impl Decode<'_> for u16 {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        match src {
            [a, b, ..] => Ok(u16::from_le_bytes([*a, *b])),
            _ => Err(Error::InsufficientSpace),
        }
    }
}

impl Decode<'_> for u32 {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        match src {
            [a, b, c, d, ..] => Ok(u32::from_le_bytes([*a, *b, *c, *d])),
            _ => Err(Error::InsufficientSpace),
        }
    }
}

impl Encode for u8 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let d = dest.first_mut().ok_or(Error::InsufficientSpace)?;
        *d = *self;
        Ok(())
    }
}

impl Encode for u16 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let d = dest.get_mut(..2).ok_or(Error::InsufficientSpace)?;
        d.copy_from_slice(&self.to_le_bytes()[..]);
        Ok(())
    }
}

impl Encode for u32 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let d = dest.get_mut(..4).ok_or(Error::InsufficientSpace)?;
        d.copy_from_slice(&self.to_le_bytes()[..]);
        Ok(())
    }
}

impl<const N: usize> FixedSize for [u8; N] {
    const SIZE: usize = N;
}

impl<const N: usize> Decode<'_> for [u8; N] {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        src.get(..N)
            .and_then(|s| s.try_into().ok())
            .ok_or(Error::InsufficientSpace)
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let d = dest.get_mut(..N).ok_or(Error::InsufficientSpace)?;
        d.copy_from_slice(&self[..]);
        Ok(())
    }
}
