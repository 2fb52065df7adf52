use std::io::{Result, Write, Read};

/// Types that can be written in SOME/IP (big endian) wire format.
pub trait SomeIpSerialize {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<()>;
}

/// Types that can be read from SOME/IP wire format.
pub trait SomeIpDeserialize: Sized {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self>;
}
