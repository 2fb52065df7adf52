use crate::codec::{SomeIpSerialize, SomeIpDeserialize, SomeIpHeader};
use crate::error::{Result as SdResult, SdError};
use crate::sd::entries::SdEntry;
use crate::sd::options::{EndpointOption, SdOption};
use std::io::{Error, ErrorKind, Result, Write, Read};

/// [PRS_SOMEIPSD_00278] Reboot flag
pub const FLAG_REBOOT: u8 = 0x80;
/// Unicast flag: the sender supports receiving unicast SD messages
pub const FLAG_UNICAST: u8 = 0x40;

const ENTRY_LEN: usize = 16;
/// Options addressable through the 8-bit option index of an entry.
pub const MAX_OPTIONS: usize = u8::MAX as usize + 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// [PRS_SOMEIPSD_00016] SD Header Format
pub struct SdPacket {
    pub flags: u8,
    pub entries: Vec<SdEntry>,
    pub options: Vec<SdOption>,
}

impl SdPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reboot_flag(&self) -> bool {
        self.flags & FLAG_REBOOT != 0
    }

    /// Appends `entry` referencing `options` through its first option run.
    /// An identical run already present in the packet is shared instead of duplicated.
    pub fn push(&mut self, mut entry: SdEntry, options: &[SdOption]) {
        entry.index_1 = 0;
        entry.number_of_opts_1 = 0;
        entry.index_2 = 0;
        entry.number_of_opts_2 = 0;
        if !options.is_empty() {
            let start = match self.find_run(options) {
                Some(start) => start,
                None => {
                    let start = self.options.len();
                    self.options.extend_from_slice(options);
                    start
                }
            };
            entry.index_1 = start as u8;
            entry.number_of_opts_1 = options.len() as u8;
        }
        self.entries.push(entry);
    }

    /// Whether every option of `other` still gets an index reachable from an entry
    /// once appended here.
    pub fn can_append(&self, other: &SdPacket) -> bool {
        self.options.len() + other.options.len() <= MAX_OPTIONS
    }

    /// Moves every entry of `other` into this packet, rebasing option references.
    pub fn append(&mut self, other: &SdPacket) {
        for entry in &other.entries {
            let options: Vec<SdOption> = other.options_of(entry).into_iter().cloned().collect();
            self.push(entry.clone(), &options);
        }
    }

    fn find_run(&self, options: &[SdOption]) -> Option<usize> {
        if options.len() > self.options.len() {
            return None;
        }
        self.options.windows(options.len()).position(|w| w == options)
    }

    /// Resolves both option runs of `entry`. Runs pointing outside the options array are ignored.
    pub fn options_of(&self, entry: &SdEntry) -> Vec<&SdOption> {
        let mut resolved = Vec::with_capacity(entry.option_count());
        for (index, count) in [
            (entry.index_1, entry.number_of_opts_1),
            (entry.index_2, entry.number_of_opts_2),
        ] {
            if count == 0 {
                continue;
            }
            let start = index as usize;
            let end = start + count as usize;
            if let Some(run) = self.options.get(start..end) {
                resolved.extend(run.iter());
            }
        }
        resolved
    }

    pub fn endpoints_of(&self, entry: &SdEntry) -> Vec<EndpointOption> {
        self.options_of(entry)
            .into_iter()
            .filter_map(|o| o.endpoint().copied())
            .collect()
    }

    /// Size of the SD payload on the wire.
    pub fn encoded_len(&self) -> usize {
        let options: usize = self
            .options
            .iter()
            .map(|o| match o {
                SdOption::Endpoint(ep) if ep.address.is_ipv4() => 12,
                SdOption::Endpoint(_) => 24,
                SdOption::Unknown { data, .. } => 3 + data.len(),
            })
            .sum();
        12 + self.entries.len() * ENTRY_LEN + options
    }

    /// Full datagram: SOME/IP header followed by the SD payload.
    pub fn encode(&self, session_id: u16) -> SdResult<Vec<u8>> {
        let mut payload = Vec::with_capacity(self.encoded_len());
        self.serialize(&mut payload)?;

        let header = SomeIpHeader::sd(session_id, payload.len() as u32);
        let mut message = Vec::with_capacity(SomeIpHeader::HEADER_LENGTH + payload.len());
        message.extend_from_slice(&header.serialize());
        message.extend_from_slice(&payload);
        Ok(message)
    }

    pub fn decode(datagram: &[u8]) -> SdResult<(SomeIpHeader, SdPacket)> {
        let header = SomeIpHeader::deserialize(datagram)?;
        if !header.is_sd() {
            return Err(SdError::Malformed("not a service discovery message"));
        }
        let end = SomeIpHeader::HEADER_LENGTH + header.payload_len();
        let Some(mut payload) = datagram.get(SomeIpHeader::HEADER_LENGTH..end) else {
            return Err(SdError::Malformed("SOME/IP length exceeds datagram"));
        };
        let packet = SdPacket::deserialize(&mut payload)?;
        Ok((header, packet))
    }
}

impl SomeIpSerialize for SdPacket {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[self.flags])?;
        // Reserved (24 bits)
        writer.write_all(&[0x00, 0x00, 0x00])?;

        let mut enc_entries = Vec::with_capacity(self.entries.len() * ENTRY_LEN);
        for e in &self.entries {
            e.serialize(&mut enc_entries)?;
        }
        (enc_entries.len() as u32).serialize(writer)?;
        writer.write_all(&enc_entries)?;

        let mut enc_opts = Vec::new();
        for o in &self.options {
            o.serialize(&mut enc_opts)?;
        }
        (enc_opts.len() as u32).serialize(writer)?;
        writer.write_all(&enc_opts)?;

        Ok(())
    }
}

impl SomeIpDeserialize for SdPacket {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header_buf = [0u8; 4]; // Flags(1) + Res(3)
        reader.read_exact(&mut header_buf)?;
        let flags = header_buf[0];

        let entries_len = u32::deserialize(reader)? as usize;
        if entries_len % ENTRY_LEN != 0 {
            return Err(Error::new(ErrorKind::InvalidData, "entries array length is not a multiple of 16"));
        }
        let mut entries = Vec::with_capacity(entries_len / ENTRY_LEN);
        for _ in 0..entries_len / ENTRY_LEN {
            entries.push(SdEntry::deserialize(reader)?);
        }

        let options_len = u32::deserialize(reader)?;
        let mut options = Vec::new();
        {
            let mut options_reader = reader.take(options_len as u64);
            // `Take` shrinks its limit as options are consumed
            while options_reader.limit() > 0 {
                options.push(SdOption::deserialize(&mut options_reader)?);
            }
        }

        Ok(SdPacket { flags, entries, options })
    }
}
