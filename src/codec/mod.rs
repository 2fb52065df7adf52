//! # SOME/IP Codec Module
//!
//! Byte-level encoding shared by the SD message model.
//!
//! ## Key Types
//!
//! - [`SomeIpHeader`] - 16-byte SOME/IP header; SD messages use service 0xFFFF, method 0x8100
//! - [`SomeIpSerialize`] / [`SomeIpDeserialize`] - Traits for big endian wire encoding
//!
//! ## Example
//!
//! ```
//! use fusion_sd::codec::SomeIpHeader;
//!
//! let header = SomeIpHeader::sd(1, 12);
//! let bytes = header.serialize();
//! assert_eq!(&bytes[0..4], &[0xff, 0xff, 0x81, 0x00]);
//! ```

pub mod header;
pub mod traits;
pub mod primitives;

pub use header::*;
pub use traits::{SomeIpSerialize, SomeIpDeserialize};

mod tests;
