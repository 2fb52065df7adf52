use crate::codec::{SomeIpSerialize, SomeIpDeserialize};
use std::io::{Result, Write, Read};

/// TTL value meaning "valid until explicitly stopped".
pub const TTL_INFINITE: u32 = 0x00FF_FFFF;
pub const ANY_INSTANCE: u16 = 0xFFFF;
pub const ANY_MAJOR: u8 = 0xFF;
pub const ANY_MINOR: u32 = 0xFFFF_FFFF;

/// SD Entry Types as defined in AUTOSAR SOME/IP-SD Specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    /// Find Service Entry (Type 1)
    FindService = 0x00,
    /// Offer Service Entry (Type 1); TTL=0 is a StopOffer
    OfferService = 0x01,
    /// Subscribe Eventgroup Entry (Type 2); TTL=0 is a StopSubscribe
    SubscribeEventgroup = 0x06,
    /// Subscribe Eventgroup Acknowledgement Entry (Type 2); TTL=0 is a Nack
    SubscribeEventgroupAck = 0x07,
    /// Unknown entry type
    Unknown = 0xFF,
}

impl EntryType {
    /// Check if this is a Type 1 (Service) entry
    pub fn is_service_entry(&self) -> bool {
        matches!(self, EntryType::FindService | EntryType::OfferService)
    }

    /// Check if this is a Type 2 (Eventgroup) entry
    pub fn is_eventgroup_entry(&self) -> bool {
        matches!(self, EntryType::SubscribeEventgroup | EntryType::SubscribeEventgroupAck)
    }
}

impl From<u8> for EntryType {
    fn from(v: u8) -> Self {
        match v {
            0x00 => EntryType::FindService,
            0x01 => EntryType::OfferService,
            0x06 => EntryType::SubscribeEventgroup,
            0x07 => EntryType::SubscribeEventgroupAck,
            _ => EntryType::Unknown,
        }
    }
}

impl From<EntryType> for u8 {
    fn from(et: EntryType) -> u8 {
        et as u8
    }
}

/// Semantic tag of an entry, resolving the "TTL 0 means stop/nack" overloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    FindService,
    OfferService,
    StopOfferService,
    SubscribeEventgroup,
    StopSubscribeEventgroup,
    SubscribeEventgroupAck,
    SubscribeEventgroupNack,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdEntry {
    pub entry_type: EntryType,
    pub index_1: u8,
    pub index_2: u8,
    pub number_of_opts_1: u8,
    pub number_of_opts_2: u8,
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    /// 24 bits, seconds
    pub ttl: u32,
    /// Service entries only
    pub minor_version: u32,
    /// Eventgroup entries only
    pub eventgroup_id: u16,
    pub counter: u8,
    pub initial_data_requested: bool,
}

impl SdEntry {
    pub fn service(entry_type: EntryType, service_id: u16, instance_id: u16, major_version: u8, minor_version: u32, ttl: u32) -> Self {
        SdEntry {
            entry_type,
            index_1: 0,
            index_2: 0,
            number_of_opts_1: 0,
            number_of_opts_2: 0,
            service_id,
            instance_id,
            major_version,
            ttl: ttl & TTL_INFINITE,
            minor_version,
            eventgroup_id: 0,
            counter: 0,
            initial_data_requested: false,
        }
    }

    pub fn eventgroup(entry_type: EntryType, service_id: u16, instance_id: u16, major_version: u8, eventgroup_id: u16, ttl: u32) -> Self {
        SdEntry {
            eventgroup_id,
            minor_version: 0,
            ..Self::service(entry_type, service_id, instance_id, major_version, 0, ttl)
        }
    }

    pub fn with_counter(mut self, counter: u8) -> Self {
        self.counter = counter & 0x0F;
        self
    }

    pub fn with_initial_data_requested(mut self, requested: bool) -> Self {
        self.initial_data_requested = requested;
        self
    }

    pub fn kind(&self) -> EntryKind {
        let stop = self.ttl == 0;
        match (self.entry_type, stop) {
            (EntryType::FindService, _) => EntryKind::FindService,
            (EntryType::OfferService, false) => EntryKind::OfferService,
            (EntryType::OfferService, true) => EntryKind::StopOfferService,
            (EntryType::SubscribeEventgroup, false) => EntryKind::SubscribeEventgroup,
            (EntryType::SubscribeEventgroup, true) => EntryKind::StopSubscribeEventgroup,
            (EntryType::SubscribeEventgroupAck, false) => EntryKind::SubscribeEventgroupAck,
            (EntryType::SubscribeEventgroupAck, true) => EntryKind::SubscribeEventgroupNack,
            (EntryType::Unknown, _) => EntryKind::Unknown,
        }
    }

    /// Total number of options referenced through both option runs.
    pub fn option_count(&self) -> usize {
        self.number_of_opts_1 as usize + self.number_of_opts_2 as usize
    }
}

impl SomeIpSerialize for SdEntry {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        u8::from(self.entry_type).serialize(writer)?;
        self.index_1.serialize(writer)?;
        self.index_2.serialize(writer)?;

        let opts_byte = (self.number_of_opts_1 << 4) | (self.number_of_opts_2 & 0x0F);
        opts_byte.serialize(writer)?;

        self.service_id.serialize(writer)?;
        self.instance_id.serialize(writer)?;
        self.major_version.serialize(writer)?;

        // TTL is 24 bits
        let ttl_bytes = self.ttl.to_be_bytes();
        writer.write_all(&ttl_bytes[1..4])?;

        if self.entry_type.is_eventgroup_entry() {
            // Reserved, then [I flag | reserved(3) | counter(4)], then eventgroup id
            let initial = if self.initial_data_requested { 0x80 } else { 0x00 };
            let flags = initial | (self.counter & 0x0F);
            writer.write_all(&[0x00, flags])?;
            self.eventgroup_id.serialize(writer)?;
        } else {
            self.minor_version.serialize(writer)?;
        }
        Ok(())
    }
}

impl SomeIpDeserialize for SdEntry {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 16];
        reader.read_exact(&mut buf)?;

        let entry_type = EntryType::from(buf[0]);
        let mut entry = SdEntry {
            entry_type,
            index_1: buf[1],
            index_2: buf[2],
            number_of_opts_1: buf[3] >> 4,
            number_of_opts_2: buf[3] & 0x0F,
            service_id: u16::from_be_bytes([buf[4], buf[5]]),
            instance_id: u16::from_be_bytes([buf[6], buf[7]]),
            major_version: buf[8],
            ttl: u32::from_be_bytes([0, buf[9], buf[10], buf[11]]),
            minor_version: 0,
            eventgroup_id: 0,
            counter: 0,
            initial_data_requested: false,
        };
        if entry_type.is_eventgroup_entry() {
            entry.initial_data_requested = buf[13] & 0x80 != 0;
            entry.counter = buf[13] & 0x0F;
            entry.eventgroup_id = u16::from_be_bytes([buf[14], buf[15]]);
        } else {
            entry.minor_version = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        }
        Ok(entry)
    }
}
