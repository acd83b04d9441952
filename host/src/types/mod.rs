//! Common types.

pub mod hci;
pub mod l2cap;
pub(crate) mod primitives;

/// Physical transport of a link.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    BrEdr,
    Le,
}
