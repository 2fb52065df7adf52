use super::traits::{SomeIpSerialize, SomeIpDeserialize};
use std::io::{Result, Write, Read};

macro_rules! impl_primitive {
    ($type:ty, $bytes:expr) => {
        impl SomeIpSerialize for $type {
            fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
                writer.write_all(&self.to_be_bytes())
            }
        }

        impl SomeIpDeserialize for $type {
            fn deserialize<R: Read>(reader: &mut R) -> Result<Self> {
                let mut buf = [0u8; $bytes];
                reader.read_exact(&mut buf)?;
                Ok(<$type>::from_be_bytes(buf))
            }
        }
    };
}

impl_primitive!(u8, 1);
impl_primitive!(u16, 2);
impl_primitive!(u32, 4);
