//! DNS wire codec.
//!
//! [DnsIncoming] is the logic representation of an incoming DNS packet.
//! [DnsOutgoing] is the logic representation of an outgoing DNS message
//! of one or more packets. [DnsOutPacket] is one encoded packet of a
//! [DnsOutgoing].

#[cfg(feature = "logging")]
use crate::log::debug;
use crate::{Error, Result};
use std::{
    any::Any,
    collections::HashMap,
    convert::TryInto,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str,
    time::SystemTime,
};

pub(crate) const CLASS_IN: u16 = 1;
pub(crate) const CLASS_MASK: u16 = 0x7FFF;

/// The top bit of the "class" field on a resource record. It is orthogonal
/// to the class value: on a record we publish it marks the record as
/// unique (owner-claimed), on a received record it asks the cache to
/// flush other records of the same name. RFC 6762 section 10.2.
pub(crate) const CLASS_CACHE_FLUSH: u16 = 0x8000;

// Definitions for DNS message header "flags" field
//
// The "flags" field is 16-bit long, in this format:
// (RFC 1035 section 4.1.1)
//
//   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
// |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
//
pub(crate) const FLAGS_QR_MASK: u16 = 0x8000; // mask for query/response bit
pub(crate) const FLAGS_QR_QUERY: u16 = 0x0000;
pub(crate) const FLAGS_QR_RESPONSE: u16 = 0x8000;
pub(crate) const FLAGS_AA: u16 = 0x0400; // mask for Authoritative answer bit
pub(crate) const FLAGS_TC: u16 = 0x0200; // mask for Truncated bit

/// Max size of an outgoing packet, to stay under the typical link MTU.
pub(crate) const MAX_MSG_TYPICAL: usize = 1460;

/// Absolute max size of an mDNS packet we are willing to send or receive.
pub(crate) const MAX_MSG_ABSOLUTE: usize = 9000;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;

/// A pointer in a compressed name: two top bits set, 14-bit offset.
const POINTER_MASK: u16 = 0xC000;
const MAX_POINTER_OFFSET: u16 = 0x3FFF;

/// The original implementation of the Bonjour conformance test emitted SRV
/// targets that were not in domain name format. The canonical encoding is
/// label-encoded; flip this to read the target as a plain character-string.
const SRV_TARGET_IS_NAME: bool = true;

pub(crate) type DnsRecordBox = Box<dyn DnsRecordExt + Send>;

impl Clone for DnsRecordBox {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// The resource record types handled by this library, with their
/// 16-bit wire indexes. RFC 1035 section 3.2.2 and RFC 3596.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u16)]
#[non_exhaustive]
pub enum RRType {
    A = 1,
    CNAME = 5,
    PTR = 12,
    HINFO = 13,
    TXT = 16,
    AAAA = 28,
    SRV = 33,
    ANY = 255,
}

impl RRType {
    pub(crate) const fn index(self) -> u16 {
        self as u16
    }

    /// Returns `None` for a wire index we do not handle. The caller is
    /// expected to skip such records.
    pub(crate) const fn from_index(index: u16) -> Option<RRType> {
        match index {
            1 => Some(RRType::A),
            5 => Some(RRType::CNAME),
            12 => Some(RRType::PTR),
            13 => Some(RRType::HINFO),
            16 => Some(RRType::TXT),
            28 => Some(RRType::AAAA),
            33 => Some(RRType::SRV),
            255 => Some(RRType::ANY),
            _ => None,
        }
    }
}

impl fmt::Display for RRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RRType::A => write!(f, "TYPE_A"),
            RRType::CNAME => write!(f, "TYPE_CNAME"),
            RRType::PTR => write!(f, "TYPE_PTR"),
            RRType::HINFO => write!(f, "TYPE_HINFO"),
            RRType::TXT => write!(f, "TYPE_TXT"),
            RRType::AAAA => write!(f, "TYPE_AAAA"),
            RRType::SRV => write!(f, "TYPE_SRV"),
            RRType::ANY => write!(f, "TYPE_ANY"),
        }
    }
}

/// Returns the RR type of an IP address, i.e. A or AAAA.
pub(crate) const fn ip_address_rr_type(address: &IpAddr) -> RRType {
    match address {
        IpAddr::V4(_) => RRType::A,
        IpAddr::V6(_) => RRType::AAAA,
    }
}

/// The identity of a DNS entry: name, type and class, where the
/// cache-flush/unique bit has been split out of the class.
///
/// Names compare case-insensitively per RFC 1035 section 2.3.3.
#[derive(Debug, Clone)]
pub(crate) struct DnsEntry {
    pub(crate) name: String,
    pub(crate) ty: RRType,
    pub(crate) class: u16,
    pub(crate) unique: bool,
}

impl DnsEntry {
    fn new(name: String, ty: RRType, class: u16) -> Self {
        Self {
            name,
            ty,
            class: class & CLASS_MASK,
            unique: (class & CLASS_CACHE_FLUSH) != 0,
        }
    }
}

impl PartialEq for DnsEntry {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.ty == other.ty
            && self.class == other.class
    }
}

/// A DNS question entry. Unlike a record, a question never expires.
#[derive(Debug)]
pub(crate) struct DnsQuestion {
    pub(crate) entry: DnsEntry,
}

/// A DNS Resource Record - like a DNS entry, but has a TTL.
/// RFC: https://www.rfc-editor.org/rfc/rfc1035#section-3.2.1
///      https://www.rfc-editor.org/rfc/rfc1035#section-4.1.3
#[derive(Debug, Clone)]
pub(crate) struct DnsRecord {
    pub(crate) entry: DnsEntry,
    ttl: u32,     // in seconds, 0 means this record should not be cached
    created: u64, // UNIX time in millis
    expires: u64, // expires at this UNIX time in millis
}

impl DnsRecord {
    fn new(name: &str, ty: RRType, class: u16, ttl: u32) -> Self {
        let created = current_time_millis();
        let expires = expire_time(created, ttl, 100);
        Self {
            entry: DnsEntry::new(name.to_string(), ty, class),
            ttl,
            created,
            expires,
        }
    }

    pub(crate) fn get_created(&self) -> u64 {
        self.created
    }

    pub(crate) fn get_ttl(&self) -> u32 {
        self.ttl
    }

    pub(crate) fn get_expire_time(&self) -> u64 {
        self.expires
    }

    pub(crate) fn set_expire(&mut self, expire_at: u64) {
        self.expires = expire_at;
    }

    pub(crate) fn is_expired(&self, now: u64) -> bool {
        now >= self.expires
    }

    pub(crate) fn halflife_passed(&self, now: u64) -> bool {
        now >= expire_time(self.created, self.ttl, 50)
    }

    /// Returns the remaining TTL in seconds
    fn get_remaining_ttl(&self, now: u64) -> u32 {
        if now >= self.expires {
            0
        } else {
            ((self.expires - now) / 1000) as u32
        }
    }

    fn reset_ttl(&mut self, other: &DnsRecord) {
        self.ttl = other.ttl;
        self.created = other.created;
        self.expires = expire_time(self.created, self.ttl, 100);
    }
}

pub(crate) trait DnsRecordExt: fmt::Debug {
    fn get_record(&self) -> &DnsRecord;
    fn get_record_mut(&mut self) -> &mut DnsRecord;
    fn write_rdata(&self, packet: &mut DnsOutPacket) -> Result<()>;
    fn any(&self) -> &dyn Any;
    fn clone_box(&self) -> DnsRecordBox;

    /// Returns whether `other` carries the same rdata, regardless of TTL.
    fn same_rdata(&self, other: &dyn DnsRecordExt) -> bool;

    /// A short display form of the rdata.
    fn rdata_print(&self) -> String;

    fn get_name(&self) -> &str {
        self.get_record().entry.name.as_str()
    }

    fn get_type(&self) -> RRType {
        self.get_record().entry.ty
    }

    fn get_class(&self) -> u16 {
        self.get_record().entry.class
    }

    fn is_unique(&self) -> bool {
        self.get_record().entry.unique
    }

    /// Returns whether `other` is the same record except TTL: same entry
    /// identity and same rdata.
    fn matches(&self, other: &dyn DnsRecordExt) -> bool {
        self.get_record().entry == other.get_record().entry && self.same_rdata(other)
    }

    /// Returns whether `other` disputes our ownership of this record:
    /// same unique (name, type, class) but different rdata.
    fn conflicts_with(&self, other: &dyn DnsRecordExt) -> bool {
        self.get_record().entry == other.get_record().entry
            && other.is_unique()
            && !self.same_rdata(other)
    }

    fn reset_ttl(&mut self, other: &dyn DnsRecordExt) {
        self.get_record_mut().reset_ttl(other.get_record());
    }

    /// Returns true if another record has matched content,
    /// and if its TTL is at least half of this record's.
    fn suppressed_by_answer(&self, other: &dyn DnsRecordExt) -> bool {
        self.matches(other) && (other.get_record().ttl > self.get_record().ttl / 2)
    }

    /// Required by RFC 6762 Section 7.1: Known-Answer Suppression.
    fn suppressed_by(&self, msg: &DnsIncoming) -> bool {
        msg.answers
            .iter()
            .any(|answer| self.suppressed_by_answer(answer.as_ref()))
    }
}

/// An A or AAAA record.
#[derive(Debug, Clone)]
pub(crate) struct DnsAddress {
    pub(crate) record: DnsRecord,
    pub(crate) address: IpAddr,
}

impl DnsAddress {
    pub(crate) fn new(name: &str, ty: RRType, class: u16, ttl: u32, address: IpAddr) -> Self {
        let record = DnsRecord::new(name, ty, class, ttl);
        Self { record, address }
    }
}

impl DnsRecordExt for DnsAddress {
    fn get_record(&self) -> &DnsRecord {
        &self.record
    }

    fn get_record_mut(&mut self) -> &mut DnsRecord {
        &mut self.record
    }

    fn write_rdata(&self, packet: &mut DnsOutPacket) -> Result<()> {
        match self.address {
            IpAddr::V4(addr) => packet.write_bytes(addr.octets().as_ref()),
            IpAddr::V6(addr) => packet.write_bytes(addr.octets().as_ref()),
        }
    }

    fn any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> DnsRecordBox {
        Box::new(self.clone())
    }

    fn same_rdata(&self, other: &dyn DnsRecordExt) -> bool {
        if let Some(other_a) = other.any().downcast_ref::<DnsAddress>() {
            return self.address == other_a.address;
        }
        false
    }

    fn rdata_print(&self) -> String {
        self.address.to_string()
    }
}

/// A DNS pointer record: the rdata is the alias, i.e. the full name
/// of a service instance.
#[derive(Debug, Clone)]
pub(crate) struct DnsPointer {
    record: DnsRecord,
    pub(crate) alias: String,
}

impl DnsPointer {
    pub(crate) fn new(name: &str, ty: RRType, class: u16, ttl: u32, alias: String) -> Self {
        let record = DnsRecord::new(name, ty, class, ttl);
        Self { record, alias }
    }
}

impl DnsRecordExt for DnsPointer {
    fn get_record(&self) -> &DnsRecord {
        &self.record
    }

    fn get_record_mut(&mut self) -> &mut DnsRecord {
        &mut self.record
    }

    fn write_rdata(&self, packet: &mut DnsOutPacket) -> Result<()> {
        packet.write_name(&self.alias)
    }

    fn any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> DnsRecordBox {
        Box::new(self.clone())
    }

    fn same_rdata(&self, other: &dyn DnsRecordExt) -> bool {
        if let Some(other_ptr) = other.any().downcast_ref::<DnsPointer>() {
            return self.alias.eq_ignore_ascii_case(&other_ptr.alias);
        }
        false
    }

    fn rdata_print(&self) -> String {
        self.alias.clone()
    }
}

// In common cases, there is one and only one SRV record for a particular fullname.
#[derive(Debug, Clone)]
pub(crate) struct DnsSrv {
    pub(crate) record: DnsRecord,
    pub(crate) priority: u16,
    // lower number means higher priority. Should be 0 in common cases.
    pub(crate) weight: u16,
    // Should be 0 in common cases
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl DnsSrv {
    pub(crate) fn new(
        name: &str,
        class: u16,
        ttl: u32,
        priority: u16,
        weight: u16,
        port: u16,
        host: String,
    ) -> Self {
        let record = DnsRecord::new(name, RRType::SRV, class, ttl);
        Self {
            record,
            priority,
            weight,
            host,
            port,
        }
    }
}

impl DnsRecordExt for DnsSrv {
    fn get_record(&self) -> &DnsRecord {
        &self.record
    }

    fn get_record_mut(&mut self) -> &mut DnsRecord {
        &mut self.record
    }

    fn write_rdata(&self, packet: &mut DnsOutPacket) -> Result<()> {
        packet.write_short(self.priority)?;
        packet.write_short(self.weight)?;
        packet.write_short(self.port)?;
        packet.write_name(&self.host)
    }

    fn any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> DnsRecordBox {
        Box::new(self.clone())
    }

    fn same_rdata(&self, other: &dyn DnsRecordExt) -> bool {
        if let Some(other_svc) = other.any().downcast_ref::<DnsSrv>() {
            return self.host.eq_ignore_ascii_case(&other_svc.host)
                && self.port == other_svc.port
                && self.weight == other_svc.weight
                && self.priority == other_svc.priority;
        }
        false
    }

    fn rdata_print(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// From RFC 6763 section 6:
//
// The format of each constituent string within the DNS TXT record is a
// single length byte, followed by 0-255 bytes of text data.
//
// DNS-SD uses DNS TXT records to store arbitrary key/value pairs
//    conveying additional information about the named service. Each
//    key/value pair is encoded as its own constituent string within the
//    DNS TXT record, in the form "key=value".
#[derive(Debug, Clone)]
pub(crate) struct DnsTxt {
    pub(crate) record: DnsRecord,
    pub(crate) text: Vec<u8>,
}

impl DnsTxt {
    pub(crate) fn new(name: &str, class: u16, ttl: u32, text: Vec<u8>) -> Self {
        let record = DnsRecord::new(name, RRType::TXT, class, ttl);
        Self { record, text }
    }
}

impl DnsRecordExt for DnsTxt {
    fn get_record(&self) -> &DnsRecord {
        &self.record
    }

    fn get_record_mut(&mut self) -> &mut DnsRecord {
        &mut self.record
    }

    fn write_rdata(&self, packet: &mut DnsOutPacket) -> Result<()> {
        packet.write_bytes(&self.text)
    }

    fn any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> DnsRecordBox {
        Box::new(self.clone())
    }

    fn same_rdata(&self, other: &dyn DnsRecordExt) -> bool {
        if let Some(other_txt) = other.any().downcast_ref::<DnsTxt>() {
            return self.text == other_txt.text;
        }
        false
    }

    fn rdata_print(&self) -> String {
        format!("{} bytes", self.text.len())
    }
}

/// A DNS host information record
#[derive(Debug, Clone)]
pub(crate) struct DnsHostInfo {
    record: DnsRecord,
    cpu: String,
    os: String,
}

impl DnsHostInfo {
    pub(crate) fn new(name: &str, class: u16, ttl: u32, cpu: String, os: String) -> Self {
        let record = DnsRecord::new(name, RRType::HINFO, class, ttl);
        Self { record, cpu, os }
    }
}

impl DnsRecordExt for DnsHostInfo {
    fn get_record(&self) -> &DnsRecord {
        &self.record
    }

    fn get_record_mut(&mut self) -> &mut DnsRecord {
        &mut self.record
    }

    fn write_rdata(&self, packet: &mut DnsOutPacket) -> Result<()> {
        packet.write_char_string(self.cpu.as_bytes())?;
        packet.write_char_string(self.os.as_bytes())
    }

    fn any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> DnsRecordBox {
        Box::new(self.clone())
    }

    fn same_rdata(&self, other: &dyn DnsRecordExt) -> bool {
        if let Some(other_hinfo) = other.any().downcast_ref::<DnsHostInfo>() {
            return self.cpu == other_hinfo.cpu && self.os == other_hinfo.os;
        }
        false
    }

    fn rdata_print(&self) -> String {
        format!("cpu {} os {}", self.cpu, self.os)
    }
}

/// One encoded packet of an outgoing message.
///
/// The buffer is preallocated at [MAX_MSG_TYPICAL] and every write is
/// bounds-checked: a write that would not fit fails with
/// [Error::BufferFull] and a partially written record is rolled back by
/// the caller.
pub(crate) struct DnsOutPacket {
    data: Vec<u8>,
    names: HashMap<String, u16>, // k: name suffix, v: offset
}

impl DnsOutPacket {
    pub(crate) fn new() -> Self {
        let mut data = Vec::with_capacity(MAX_MSG_TYPICAL);
        data.resize(12, 0); // reserve space for the header
        Self {
            data,
            names: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.data.len() == 12
    }

    fn write_question(&mut self, question: &DnsQuestion) -> Result<()> {
        let save = self.data.len();
        let result = self.write_question_inner(question);
        if result.is_err() {
            self.rewind(save);
        }
        result
    }

    fn write_question_inner(&mut self, question: &DnsQuestion) -> Result<()> {
        self.write_name(&question.entry.name)?;
        self.write_short(question.entry.ty.index())?;
        self.write_short(question.entry.class)
    }

    /// Writes a record (answer, authoritative answer, additional).
    ///
    /// On failure the packet is restored to its state before the call, so
    /// the record can be retried in a fresh packet.
    fn write_record(&mut self, record_ext: &dyn DnsRecordExt, now: u64) -> Result<()> {
        let save = self.data.len();
        let result = self.write_record_inner(record_ext, now);
        if result.is_err() {
            self.rewind(save);
        }
        result
    }

    fn write_record_inner(&mut self, record_ext: &dyn DnsRecordExt, now: u64) -> Result<()> {
        let record = record_ext.get_record();
        self.write_name(&record.entry.name)?;
        self.write_short(record.entry.ty.index())?;
        if record.entry.unique {
            // check "multicast"
            self.write_short(record.entry.class | CLASS_CACHE_FLUSH)?;
        } else {
            self.write_short(record.entry.class)?;
        }

        if now == 0 {
            self.write_u32(record.ttl)?;
        } else {
            self.write_u32(record.get_remaining_ttl(now))?;
        }

        // The rdata length is stamped after the rdata has been written.
        self.write_short(0)?;
        let start = self.data.len();
        record_ext.write_rdata(self)?;
        let length = (self.data.len() - start) as u16;
        self.data[start - 2..start].copy_from_slice(&length.to_be_bytes());
        Ok(())
    }

    /// Rolls the packet back to `offset`, dropping any compression table
    /// entries that point into the discarded region.
    fn rewind(&mut self, offset: usize) {
        self.data.truncate(offset);
        self.names.retain(|_, v| (*v as usize) < offset);
    }

    // Write name to packet
    //
    // [RFC1035]
    // 4.1.4. Message compression
    //
    // In order to reduce the size of messages, the domain system utilizes a
    // compression scheme which eliminates the repetition of domain names in a
    // message. In this scheme, an entire domain name or a list of labels at
    // the end of a domain name is replaced with a pointer to a prior occurrence
    // of the same name.
    // The pointer takes the form of a two octet sequence:
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //     | 1  1|                OFFSET                   |
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    // The OFFSET field specifies an offset from the start of the message.
    pub(crate) fn write_name(&mut self, name: &str) -> Result<()> {
        // ignore the ending "." if exists
        let end = name.strip_suffix('.').unwrap_or(name).len();
        if end + 2 > MAX_NAME_LEN {
            return Err(Error::Msg(format!("name too long: {}", name)));
        }

        let mut here = 0;
        while here < end {
            let remaining = &name[here..end];

            if cfg!(feature = "compression") {
                // Check if 'remaining' already appeared in this message
                if let Some(offset) = self.names.get(remaining).copied() {
                    self.write_short(offset | POINTER_MASK)?;
                    return Ok(());
                }

                // Remember the remaining part so later names can point to it.
                if self.data.len() <= MAX_POINTER_OFFSET as usize {
                    self.names
                        .insert(remaining.to_string(), self.data.len() as u16);
                }
            }

            // Find the current label to write into the packet
            let stop = match remaining.find('.') {
                Some(i) => here + i,
                None => end,
            };
            let label = &name[here..stop];
            if label.len() > MAX_LABEL_LEN {
                return Err(Error::Msg(format!("label too long: {}", label)));
            }
            self.write_byte(label.len() as u8)?;
            self.write_bytes(label.as_bytes())?;

            here = stop + 1; // move past the current label
        }

        self.write_byte(0) // name ends with the root label
    }

    fn write_char_string(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_byte(bytes.len().min(255) as u8)?;
        self.write_bytes(&bytes[..bytes.len().min(255)])
    }

    fn write_bytes(&mut self, s: &[u8]) -> Result<()> {
        if self.data.len() + s.len() > MAX_MSG_TYPICAL {
            return Err(Error::BufferFull);
        }
        self.data.extend_from_slice(s);
        Ok(())
    }

    fn write_u32(&mut self, int: u32) -> Result<()> {
        self.write_bytes(&int.to_be_bytes())
    }

    fn write_short(&mut self, short: u16) -> Result<()> {
        self.write_bytes(&short.to_be_bytes())
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.write_bytes(&[byte])
    }

    /// Stamps the header and returns the wire bytes.
    fn finish(mut self, id: u16, flags: u16, counts: [u16; 4]) -> Vec<u8> {
        self.data[0..2].copy_from_slice(&id.to_be_bytes());
        self.data[2..4].copy_from_slice(&flags.to_be_bytes());
        for (i, count) in counts.iter().enumerate() {
            let at = 4 + i * 2;
            self.data[at..at + 2].copy_from_slice(&count.to_be_bytes());
        }
        self.data
    }
}

/// Representation of an outgoing message, which may encode into more
/// than one packet. The actual encoded packets are [DnsOutPacket]s.
pub(crate) struct DnsOutgoing {
    pub(crate) flags: u16,
    pub(crate) id: u16,
    multicast: bool,
    pub(crate) questions: Vec<DnsQuestion>,
    pub(crate) answers: Vec<(DnsRecordBox, u64)>,
    pub(crate) authorities: Vec<DnsRecordBox>,
    pub(crate) additionals: Vec<DnsRecordBox>,
    known_answer_count: i64,
}

impl DnsOutgoing {
    pub(crate) fn new(flags: u16) -> Self {
        DnsOutgoing {
            flags,
            id: 0,
            multicast: true,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
            known_answer_count: 0,
        }
    }

    pub(crate) fn is_query(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_QUERY
    }

    pub(crate) fn set_id(&mut self, id: u16) {
        self.id = id;
    }

    pub(crate) fn answers_count(&self) -> usize {
        self.answers.len()
    }

    pub(crate) fn known_answer_count(&self) -> i64 {
        self.known_answer_count
    }

    pub(crate) fn add_question(&mut self, name: &str, qtype: RRType) {
        assert!(
            self.answers.is_empty() && self.authorities.is_empty() && self.additionals.is_empty(),
            "questions must be added before answers, authorities and additionals"
        );
        let q = DnsQuestion {
            entry: DnsEntry::new(name.to_string(), qtype, CLASS_IN),
        };
        self.questions.push(q);
    }

    /// Returns true if `answer` is added to the outgoing msg.
    /// Returns false if `answer` was suppressed by a known answer
    /// of the incoming `msg`.
    pub(crate) fn add_answer(&mut self, msg: &DnsIncoming, answer: DnsRecordBox) -> bool {
        if answer.suppressed_by(msg) {
            self.known_answer_count += 1;
            return false;
        }
        self.add_answer_at_time(answer, 0)
    }

    /// Returns true if `answer` is added to the outgoing msg.
    /// Returns false if the answer is expired at `now` hence not added.
    /// If `now` is 0, the answer is written with its full TTL.
    pub(crate) fn add_answer_at_time(&mut self, answer: DnsRecordBox, now: u64) -> bool {
        assert!(
            self.authorities.is_empty() && self.additionals.is_empty(),
            "answers must be added before authorities and additionals"
        );
        if now == 0 || !answer.get_record().is_expired(now) {
            self.answers.push((answer, now));
            return true;
        }
        false
    }

    /// Adds a record the sender is probing for ownership of.
    ///
    /// RFC 6762 section 8.2: for tiebreaking to work correctly the
    /// Authority Section must contain all the proposed rdata.
    pub(crate) fn add_authority(&mut self, record: DnsRecordBox) {
        assert!(
            self.additionals.is_empty(),
            "authorities must be added before additionals"
        );
        self.authorities.push(record);
    }

    // Adds an additional answer.
    //
    // From RFC 6763 section 12: a responder should place records the
    // client is likely to query for next into the additional section.
    // For a PTR answer these are the SRV, TXT and address records of the
    // instance; for an SRV answer the address records of the target.
    pub(crate) fn add_additional_answer(&mut self, answer: DnsRecordBox) {
        self.additionals.push(answer);
    }

    /// Encodes the message into one or more packets.
    ///
    /// When a record does not fit in the current packet, the packet is
    /// closed with the TC flag set and encoding continues into a new
    /// packet, per the truncation chain of RFC 6762 section 7.2. Each
    /// packet carries the counts of the entries it actually holds.
    pub(crate) fn to_data_on_wire(&self) -> Vec<Vec<u8>> {
        let mut builds: Vec<(DnsOutPacket, [u16; 4])> = Vec::new();
        let mut packet = DnsOutPacket::new();
        let mut counts = [0u16; 4];

        let mut rotate = |packet: &mut DnsOutPacket, counts: &mut [u16; 4]| {
            let full = std::mem::replace(packet, DnsOutPacket::new());
            builds.push((full, *counts));
            *counts = [0u16; 4];
        };

        for question in self.questions.iter() {
            match packet.write_question(question) {
                Ok(()) => counts[0] += 1,
                Err(Error::BufferFull) => {
                    rotate(&mut packet, &mut counts);
                    match packet.write_question(question) {
                        Ok(()) => counts[0] += 1,
                        Err(e) => debug!("question dropped from outgoing message: {}", e),
                    }
                }
                Err(e) => debug!("question dropped from outgoing message: {}", e),
            }
        }

        let sections: [(usize, Box<dyn Iterator<Item = (&DnsRecordBox, u64)> + '_>); 3] = [
            (1, Box::new(self.answers.iter().map(|(r, t)| (r, *t)))),
            (2, Box::new(self.authorities.iter().map(|r| (r, 0)))),
            (3, Box::new(self.additionals.iter().map(|r| (r, 0)))),
        ];

        for (section, records) in sections {
            for (record, time) in records {
                match packet.write_record(record.as_ref(), time) {
                    Ok(()) => counts[section] += 1,
                    Err(Error::BufferFull) => {
                        rotate(&mut packet, &mut counts);
                        match packet.write_record(record.as_ref(), time) {
                            Ok(()) => counts[section] += 1,
                            Err(e) => debug!("record dropped from outgoing message: {}", e),
                        }
                    }
                    Err(e) => debug!("record dropped from outgoing message: {}", e),
                }
            }
        }

        // Keep a trailing empty packet only if it is the whole message.
        if packet.is_empty() && !builds.is_empty() {
            debug!("outgoing message ended on an empty packet");
        } else {
            builds.push((packet, counts));
        }

        let id = if self.multicast { 0 } else { self.id };
        let last = builds.len() - 1;
        builds
            .into_iter()
            .enumerate()
            .map(|(i, (p, c))| {
                let flags = if i < last {
                    self.flags | FLAGS_TC
                } else {
                    self.flags
                };
                p.finish(id, flags, c)
            })
            .collect()
    }
}

/// A parsed incoming DNS message.
#[derive(Debug)]
pub(crate) struct DnsIncoming {
    offset: usize,
    data: Vec<u8>,
    pub(crate) questions: Vec<DnsQuestion>,
    pub(crate) answers: Vec<DnsRecordBox>,
    pub(crate) authorities: Vec<DnsRecordBox>,
    pub(crate) additionals: Vec<DnsRecordBox>,
    pub(crate) id: u16,
    flags: u16,
    pub(crate) num_questions: u16,
    pub(crate) num_answers: u16,
    pub(crate) num_authorities: u16,
    pub(crate) num_additionals: u16,
}

impl DnsIncoming {
    pub(crate) fn new(data: Vec<u8>) -> Result<Self> {
        let mut incoming = Self {
            offset: 0,
            data,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
            id: 0,
            flags: 0,
            num_questions: 0,
            num_answers: 0,
            num_authorities: 0,
            num_additionals: 0,
        };

        incoming.read_header()?;
        incoming.read_questions()?;
        incoming.read_records()?;
        Ok(incoming)
    }

    pub(crate) fn is_query(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_QUERY
    }

    pub(crate) fn is_response(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_RESPONSE
    }

    pub(crate) fn is_truncated(&self) -> bool {
        (self.flags & FLAGS_TC) != 0
    }

    /// All records across the answer, authority and additional sections.
    pub(crate) fn all_records(&self) -> impl Iterator<Item = &DnsRecordBox> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
    }

    /// Merges a truncation-chain continuation into this query.
    ///
    /// RFC 6762 section 7.2: a querier with too many known answers sets
    /// TC and sends the rest in follow-up messages. Calling this on a
    /// message that is not a truncated query is a programmer error.
    pub(crate) fn append(&mut self, other: DnsIncoming) {
        assert!(
            self.is_query() && self.is_truncated() && other.is_query(),
            "append is only valid on a truncated query with a query continuation"
        );
        self.questions.extend(other.questions);
        self.answers.extend(other.answers);
        self.authorities.extend(other.authorities);
        self.additionals.extend(other.additionals);
        self.num_questions += other.num_questions;
        self.num_answers += other.num_answers;
        self.num_authorities += other.num_authorities;
        self.num_additionals += other.num_additionals;
    }

    fn read_header(&mut self) -> Result<()> {
        if self.data.len() < 12 {
            return Err(Error::Malformed(format!(
                "incoming header is too short: {} bytes",
                self.data.len()
            )));
        }

        let data = &self.data[0..];
        self.id = u16_from_be_slice(&data[..2]);
        self.flags = u16_from_be_slice(&data[2..4]);
        self.num_questions = u16_from_be_slice(&data[4..6]);
        self.num_answers = u16_from_be_slice(&data[6..8]);
        self.num_authorities = u16_from_be_slice(&data[8..10]);
        self.num_additionals = u16_from_be_slice(&data[10..12]);

        self.offset = 12;
        Ok(())
    }

    fn read_questions(&mut self) -> Result<()> {
        let count = self.num_questions;
        for i in 0..count {
            let name = self.read_name()?;

            let data = &self.data[self.offset..];
            if data.len() < 4 {
                return Err(Error::Malformed(format!(
                    "question idx {} too short: {}",
                    i,
                    data.len()
                )));
            }
            let ty = u16_from_be_slice(&data[..2]);
            let class = u16_from_be_slice(&data[2..4]);
            self.offset += 4;

            match RRType::from_index(ty) {
                Some(ty) => self.questions.push(DnsQuestion {
                    entry: DnsEntry::new(name, ty, class),
                }),
                None => {
                    debug!("skipping question with unknown type {}", ty);
                    self.num_questions -= 1;
                }
            }
        }
        Ok(())
    }

    /// Decodes all answers, authorities and additionals.
    ///
    /// The cursor is advanced to `start + rdlength` for every record,
    /// even when its rdata cannot be parsed, so one bad record cannot
    /// desynchronize the rest of the stream. Unknown record types are
    /// skipped silently; the section counts are adjusted best-effort so
    /// that the visible counts match the retained records.
    fn read_records(&mut self) -> Result<()> {
        let num_answers = self.num_answers;
        let num_authorities = self.num_authorities;
        let n = num_answers + num_authorities + self.num_additionals;

        for i in 0..n {
            let name = self.read_name()?;
            let slice = &self.data[self.offset..];
            if slice.len() < 10 {
                return Err(Error::Malformed(format!(
                    "record for {} is too short: {} bytes",
                    &name,
                    slice.len()
                )));
            }
            let ty = u16_from_be_slice(&slice[..2]);
            let class = u16_from_be_slice(&slice[2..4]);
            let ttl = u32_from_be_slice(&slice[4..8]);
            let length = u16_from_be_slice(&slice[8..10]) as usize;
            self.offset += 10;
            let next_offset = self.offset + length;
            if next_offset > self.data.len() {
                return Err(Error::Malformed(format!(
                    "rdata of {} overruns the message: rdlength {}",
                    &name, length
                )));
            }

            let rec = match self.read_rdata(&name, ty, class, ttl, length) {
                Ok(rec) => rec,
                Err(e) => {
                    // Consume the rdata anyway and keep going.
                    debug!("undecodable rdata for {} (type {}): {}", &name, ty, e);
                    None
                }
            };

            self.offset = next_offset;

            let section = if i < num_answers {
                &mut self.answers
            } else if i < num_answers + num_authorities {
                &mut self.authorities
            } else {
                &mut self.additionals
            };

            match rec {
                Some(record) => section.push(record),
                None => {
                    // Adjust the count for the skipped record. The counts
                    // are for debug display only after this point.
                    if i < num_answers {
                        self.num_answers -= 1;
                    } else if i < num_answers + num_authorities {
                        self.num_authorities -= 1;
                    } else {
                        self.num_additionals -= 1;
                    }
                }
            }
        }

        Ok(())
    }

    /// Decodes the rdata of one record based on its type. Returns
    /// `Ok(None)` for record types we do not handle.
    fn read_rdata(
        &mut self,
        name: &str,
        ty: u16,
        class: u16,
        ttl: u32,
        length: usize,
    ) -> Result<Option<DnsRecordBox>> {
        let rec: Option<DnsRecordBox> = match RRType::from_index(ty) {
            Some(RRType::CNAME) | Some(RRType::PTR) => Some(Box::new(DnsPointer::new(
                name,
                RRType::PTR,
                class,
                ttl,
                self.read_name()?,
            ))),
            Some(RRType::TXT) => Some(Box::new(DnsTxt::new(
                name,
                class,
                ttl,
                self.read_vec(length)?,
            ))),
            Some(RRType::SRV) => {
                let priority = self.read_u16()?;
                let weight = self.read_u16()?;
                let port = self.read_u16()?;
                let host = if SRV_TARGET_IS_NAME {
                    self.read_name()?
                } else {
                    self.read_char_string()?
                };
                Some(Box::new(DnsSrv::new(
                    name, class, ttl, priority, weight, port, host,
                )))
            }
            Some(RRType::HINFO) => Some(Box::new(DnsHostInfo::new(
                name,
                class,
                ttl,
                self.read_char_string()?,
                self.read_char_string()?,
            ))),
            Some(RRType::A) => Some(Box::new(DnsAddress::new(
                name,
                RRType::A,
                class,
                ttl,
                self.read_ipv4()?.into(),
            ))),
            Some(RRType::AAAA) => Some(Box::new(DnsAddress::new(
                name,
                RRType::AAAA,
                class,
                ttl,
                self.read_ipv6()?.into(),
            ))),
            _ => None,
        };
        Ok(rec)
    }

    fn read_char_string(&mut self) -> Result<String> {
        if self.offset >= self.data.len() {
            return Err(Error::Malformed("char-string at end of message".to_string()));
        }
        let length = self.data[self.offset] as usize;
        self.offset += 1;
        let bytes = self.read_vec(length)?;
        str::from_utf8(&bytes)
            .map(str::to_string)
            .map_err(|e| Error::Malformed(format!("char-string not utf-8: {}", e)))
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.offset + 2 > self.data.len() {
            return Err(Error::Malformed("u16 beyond end of message".to_string()));
        }
        let num = u16_from_be_slice(&self.data[self.offset..]);
        self.offset += 2;
        Ok(num)
    }

    fn read_vec(&mut self, length: usize) -> Result<Vec<u8>> {
        if self.offset + length > self.data.len() {
            return Err(Error::Malformed(format!(
                "{} bytes beyond end of message",
                length
            )));
        }
        let v = self.data[self.offset..self.offset + length].to_vec();
        self.offset += length;
        Ok(v)
    }

    fn read_ipv4(&mut self) -> Result<Ipv4Addr> {
        let bytes: [u8; 4] = self
            .read_vec(4)?
            .try_into()
            .expect("read_vec returned wrong length");
        Ok(Ipv4Addr::from(bytes))
    }

    fn read_ipv6(&mut self) -> Result<Ipv6Addr> {
        let bytes: [u8; 16] = self
            .read_vec(16)?
            .try_into()
            .expect("read_vec returned wrong length");
        Ok(Ipv6Addr::from(bytes))
    }

    /// Reads a domain name at the current location of `self.data`.
    ///
    /// See https://datatracker.ietf.org/doc/html/rfc1035#section-3.1 for
    /// domain name encoding. Pointer offsets must be strictly decreasing:
    /// every pointer has to land before the lowest offset visited so far,
    /// which is stricter than RFC 1035 but rejects all pointer loops.
    ///
    /// After the name, the cursor sits either at the byte behind the
    /// first pointer (if any pointer was followed) or behind the
    /// terminating zero.
    fn read_name(&mut self) -> Result<String> {
        let data = &self.data[..];
        let mut offset = self.offset;
        let mut name = "".to_string();
        let mut continuation = None;
        let mut floor = self.offset;

        loop {
            if offset >= data.len() {
                return Err(Error::Malformed(format!(
                    "name runs past the end of the message: offset {} len {}",
                    offset,
                    data.len()
                )));
            }
            let length = data[offset];

            // A name is terminated by the zero-length root label.
            if length == 0 {
                if continuation.is_none() {
                    self.offset = offset + 1;
                }
                break;
            }

            // The two top bits of the length byte select the label kind.
            match length & 0xC0 {
                0x00 => {
                    // a literal label of up to 63 bytes
                    offset += 1;
                    let end = offset + length as usize;
                    if end > data.len() {
                        return Err(Error::Malformed(format!(
                            "label of {} runs past the end of the message",
                            length
                        )));
                    }
                    name += str::from_utf8(&data[offset..end])
                        .map_err(|e| Error::Malformed(format!("label is not utf-8: {}", e)))?;
                    name += ".";
                    offset = end;
                }
                0xC0 => {
                    // Message compression.
                    // See https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.4
                    if offset + 1 >= data.len() {
                        return Err(Error::Malformed(
                            "pointer runs past the end of the message".to_string(),
                        ));
                    }
                    let pointer = (u16_from_be_slice(&data[offset..]) ^ POINTER_MASK) as usize;
                    if pointer >= floor {
                        return Err(Error::CircularName(format!(
                            "pointer to {} does not precede offset {}",
                            pointer, floor
                        )));
                    }

                    if continuation.is_none() {
                        self.offset = offset + 2;
                        continuation = Some(offset + 2);
                    }
                    floor = pointer;
                    offset = pointer;
                }
                _ => {
                    return Err(Error::Malformed(format!(
                        "unsupported label type: 0x{:x} at offset {}",
                        length, offset
                    )));
                }
            };
        }

        Ok(name)
    }
}

/// Returns UNIX time in millis
pub(crate) fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("failed to get current UNIX time")
        .as_millis() as u64
}

fn u16_from_be_slice(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn u32_from_be_slice(s: &[u8]) -> u32 {
    u32::from_be_bytes([s[0], s[1], s[2], s[3]])
}

/// Returns the time in millis at which a record created at `created`
/// with `ttl` reaches `percent` of its lifetime.
fn expire_time(created: u64, ttl: u32, percent: u32) -> u64 {
    created + u64::from(ttl) * u64::from(percent) * 10
}

#[cfg(test)]
mod tests {
    use super::{
        current_time_millis, DnsAddress, DnsHostInfo, DnsIncoming, DnsOutPacket, DnsOutgoing,
        DnsPointer, DnsRecordBox, DnsRecordExt, DnsSrv, DnsTxt, Error, RRType, CLASS_CACHE_FLUSH,
        CLASS_IN, FLAGS_AA, FLAGS_QR_QUERY, FLAGS_QR_RESPONSE, FLAGS_TC,
    };
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn sample_records() -> Vec<DnsRecordBox> {
        vec![
            Box::new(DnsAddress::new(
                "myhost.local.",
                RRType::A,
                CLASS_IN | CLASS_CACHE_FLUSH,
                120,
                Ipv4Addr::new(192, 168, 1, 5).into(),
            )),
            Box::new(DnsAddress::new(
                "myhost.local.",
                RRType::AAAA,
                CLASS_IN | CLASS_CACHE_FLUSH,
                120,
                Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1).into(),
            )),
            Box::new(DnsPointer::new(
                "_http._tcp.local.",
                RRType::PTR,
                CLASS_IN,
                4500,
                "web._http._tcp.local.".to_string(),
            )),
            Box::new(DnsSrv::new(
                "web._http._tcp.local.",
                CLASS_IN | CLASS_CACHE_FLUSH,
                120,
                0,
                0,
                8080,
                "myhost.local.".to_string(),
            )),
            Box::new(DnsTxt::new(
                "web._http._tcp.local.",
                CLASS_IN | CLASS_CACHE_FLUSH,
                4500,
                vec![7, b'p', b'a', b't', b'h', b'=', b'/', b'x'],
            )),
            Box::new(DnsHostInfo::new(
                "myhost.local.",
                CLASS_IN,
                120,
                "x86_64".to_string(),
                "linux".to_string(),
            )),
        ]
    }

    #[test]
    fn test_round_trip_records() {
        let records = sample_records();
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        for record in records.iter() {
            assert!(out.add_answer_at_time(record.clone(), 0));
        }

        let packets = out.to_data_on_wire();
        assert_eq!(packets.len(), 1);

        let incoming = DnsIncoming::new(packets.into_iter().next().unwrap()).unwrap();
        assert!(incoming.is_response());
        assert_eq!(incoming.answers.len(), records.len());
        for (decoded, original) in incoming.answers.iter().zip(records.iter()) {
            assert!(
                decoded.matches(original.as_ref()),
                "decoded {:?} != original {:?}",
                decoded,
                original
            );
            assert_eq!(
                decoded.get_record().get_ttl(),
                original.get_record().get_ttl()
            );
        }
    }

    #[test]
    #[cfg(feature = "compression")]
    fn test_ptr_wire_layout() {
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        out.add_answer_at_time(
            Box::new(DnsPointer::new(
                "_http._tcp.local.",
                RRType::PTR,
                CLASS_IN,
                120,
                "MyServer._http._tcp.local.".to_string(),
            )),
            0,
        );
        let data = out.to_data_on_wire().remove(0);

        // The record name starts right after the 12-byte header.
        assert_eq!(data[12], 5);
        assert_eq!(&data[13..18], b"_http");

        // name(18) + type(2) + class(2) + ttl(4) => rdlength at offset 38.
        // The alias shares the "_http._tcp.local" suffix with the record
        // name, so its encoding is one label plus a pointer to offset 12.
        assert_eq!(&data[38..40], &[0, 11]);
        assert_eq!(data[40], 8);
        assert_eq!(&data[41..49], b"MyServer");
        assert_eq!(&data[49..51], &[0xC0, 12]);

        // And it must decode back to an equal record.
        let incoming = DnsIncoming::new(data).unwrap();
        assert_eq!(incoming.answers.len(), 1);
        assert_eq!(incoming.answers[0].get_name(), "_http._tcp.local.");
        let ptr = incoming.answers[0]
            .any()
            .downcast_ref::<DnsPointer>()
            .unwrap();
        assert_eq!(ptr.alias, "MyServer._http._tcp.local.");
    }

    #[test]
    fn test_read_name_invalid_label_type() {
        // 0b10xxxxxx is a reserved label type.
        let mut data = vec![0u8; 12];
        data[5] = 1; // one question
        data.extend_from_slice(&[0x80, 0x00]);
        data.extend_from_slice(&[0, 12, 0, 1]); // type PTR, class IN

        let invalid = DnsIncoming::new(data);
        assert!(matches!(invalid, Err(Error::Malformed(_))));

        // A bad datagram must not affect the next one parsed.
        let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
        out.add_question("_printer._tcp.local.", RRType::PTR);
        let good = DnsIncoming::new(out.to_data_on_wire().remove(0));
        assert!(good.is_ok());
    }

    #[test]
    fn test_read_name_circular_pointer() {
        // A name whose pointer lands on itself.
        let mut data = vec![0u8; 12];
        data[5] = 1; // one question
        data.extend_from_slice(&[0xC0, 12]);
        data.extend_from_slice(&[0, 12, 0, 1]);

        let invalid = DnsIncoming::new(data);
        assert!(matches!(invalid, Err(Error::CircularName(_))));
    }

    #[test]
    fn test_read_name_pointer_continuation() {
        // Two questions where the second name is entirely a pointer to
        // the first. The cursor must continue after the pointer bytes.
        let mut data = vec![0u8; 12];
        data[5] = 2; // two questions
        data.extend_from_slice(&[1, b'a', 5, b'l', b'o', b'c', b'a', b'l', 0]);
        data.extend_from_slice(&[0, 12, 0, 1]);
        data.extend_from_slice(&[0xC0, 12]);
        data.extend_from_slice(&[0, 12, 0, 1]);

        let incoming = DnsIncoming::new(data).unwrap();
        assert_eq!(incoming.questions.len(), 2);
        assert_eq!(incoming.questions[0].entry.name, "a.local.");
        assert_eq!(incoming.questions[1].entry.name, "a.local.");
    }

    #[test]
    fn test_truncated_query_append() {
        let ptr_record = |i: u32| -> DnsRecordBox {
            Box::new(DnsPointer::new(
                "_music._tcp.local.",
                RRType::PTR,
                CLASS_IN,
                4500,
                format!("box{}._music._tcp.local.", i),
            ))
        };

        let mut first = DnsOutgoing::new(FLAGS_QR_QUERY | FLAGS_TC);
        first.add_question("_music._tcp.local.", RRType::PTR);
        for i in 0..10 {
            first.add_answer_at_time(ptr_record(i), 0);
        }

        let mut second = DnsOutgoing::new(FLAGS_QR_QUERY);
        for i in 10..30 {
            second.add_answer_at_time(ptr_record(i), 0);
        }

        let mut q1 = DnsIncoming::new(first.to_data_on_wire().remove(0)).unwrap();
        let q2 = DnsIncoming::new(second.to_data_on_wire().remove(0)).unwrap();
        assert!(q1.is_truncated());

        q1.append(q2);
        assert_eq!(q1.questions.len(), 1);
        assert_eq!(q1.answers.len(), 30);
        assert_eq!(q1.num_answers, 30);
    }

    #[test]
    #[should_panic(expected = "truncated query")]
    fn test_append_requires_truncated_query() {
        let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
        out.add_question("_x._udp.local.", RRType::PTR);
        let data = out.to_data_on_wire().remove(0);

        let mut not_truncated = DnsIncoming::new(data.clone()).unwrap();
        let other = DnsIncoming::new(data).unwrap();
        not_truncated.append(other);
    }

    #[test]
    fn test_unknown_record_type_skipped() {
        let mut data = vec![0u8; 12];
        data[2] = 0x80; // response
        data[7] = 2; // two answers

        // A record of type 99 with 4 bytes of rdata.
        data.extend_from_slice(&[1, b'x', 5, b'l', b'o', b'c', b'a', b'l', 0]);
        data.extend_from_slice(&[0, 99, 0, 1]);
        data.extend_from_slice(&[0, 0, 0, 60]);
        data.extend_from_slice(&[0, 4, 1, 2, 3, 4]);

        // Followed by a well-formed A record.
        data.extend_from_slice(&[1, b'x', 5, b'l', b'o', b'c', b'a', b'l', 0]);
        data.extend_from_slice(&[0, 1, 0, 1]);
        data.extend_from_slice(&[0, 0, 0, 60]);
        data.extend_from_slice(&[0, 4, 127, 0, 0, 1]);

        let incoming = DnsIncoming::new(data).unwrap();
        assert_eq!(incoming.answers.len(), 1);
        assert_eq!(incoming.num_answers, 1);
        let addr = incoming.answers[0]
            .any()
            .downcast_ref::<DnsAddress>()
            .unwrap();
        assert_eq!(addr.address, IpAddr::from(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn test_overflow_splits_into_truncation_chain() {
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        let count = 30;
        for i in 0..count {
            out.add_answer_at_time(
                Box::new(DnsTxt::new(
                    &format!("big{}._test._udp.local.", i),
                    CLASS_IN | CLASS_CACHE_FLUSH,
                    4500,
                    vec![b'a'; 100],
                )),
                0,
            );
        }

        let packets = out.to_data_on_wire();
        assert!(packets.len() > 1, "expected a multi-packet chain");

        let mut total = 0;
        for (i, packet) in packets.iter().enumerate() {
            let flags = u16::from_be_bytes([packet[2], packet[3]]);
            if i < packets.len() - 1 {
                assert!(flags & FLAGS_TC != 0, "non-final packet must set TC");
            } else {
                assert!(flags & FLAGS_TC == 0, "final packet must not set TC");
            }
            let incoming = DnsIncoming::new(packet.clone()).unwrap();
            total += incoming.answers.len();
        }
        assert_eq!(total, count);
    }

    #[test]
    fn test_known_answer_suppression() {
        let ptr = |ttl: u32| -> DnsRecordBox {
            Box::new(DnsPointer::new(
                "_ipp._tcp.local.",
                RRType::PTR,
                CLASS_IN,
                ttl,
                "printer._ipp._tcp.local.".to_string(),
            ))
        };

        // The querier already knows the answer with a fresh TTL.
        let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
        query.add_question("_ipp._tcp.local.", RRType::PTR);
        query.add_answer_at_time(ptr(120), 0);
        let msg = DnsIncoming::new(query.to_data_on_wire().remove(0)).unwrap();

        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        assert!(!out.add_answer(&msg, ptr(120)));
        assert_eq!(out.answers_count(), 0);
        assert_eq!(out.known_answer_count(), 1);

        // A known answer at or below half the TTL does not suppress.
        let mut stale_query = DnsOutgoing::new(FLAGS_QR_QUERY);
        stale_query.add_question("_ipp._tcp.local.", RRType::PTR);
        stale_query.add_answer_at_time(ptr(50), 0);
        let stale = DnsIncoming::new(stale_query.to_data_on_wire().remove(0)).unwrap();

        let mut out2 = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        assert!(out2.add_answer(&stale, ptr(120)));
        assert_eq!(out2.answers_count(), 1);
    }

    #[test]
    fn test_label_too_long_rejected() {
        let mut packet = DnsOutPacket::new();
        let label = "a".repeat(64);
        let result = packet.write_name(&format!("{}.local.", label));
        assert!(matches!(result, Err(Error::Msg(_))));
    }

    #[test]
    fn test_name_too_long_rejected() {
        let mut packet = DnsOutPacket::new();
        let long: String = std::iter::repeat("abcdefg.").take(40).collect();
        let result = packet.write_name(&long);
        assert!(matches!(result, Err(Error::Msg(_))));
    }

    #[test]
    fn test_entry_equality_case_insensitive() {
        let a = DnsPointer::new(
            "_HTTP._tcp.local.",
            RRType::PTR,
            CLASS_IN,
            120,
            "Web._HTTP._tcp.local.".to_string(),
        );
        let b = DnsPointer::new(
            "_http._TCP.local.",
            RRType::PTR,
            CLASS_IN,
            120,
            "web._http._tcp.local.".to_string(),
        );
        assert!(a.matches(&b));
    }

    #[test]
    fn test_record_expiry() {
        let record = DnsAddress::new(
            "host.local.",
            RRType::A,
            CLASS_IN,
            60,
            Ipv4Addr::new(10, 0, 0, 1).into(),
        );
        let created = record.get_record().get_created();
        assert!(!record.get_record().is_expired(created + 59_999));
        assert!(record.get_record().is_expired(created + 60_000));
        assert!(record.get_record().halflife_passed(created + 30_000));
        assert!(!record.get_record().halflife_passed(created + 29_999));
    }

    #[test]
    fn test_empty_message_encodes_header_only() {
        let out = DnsOutgoing::new(0);
        let packets = out.to_data_on_wire();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 12);
    }

    #[test]
    fn test_expired_answer_not_added() {
        let record: DnsRecordBox = Box::new(DnsPointer::new(
            "_gone._udp.local.",
            RRType::PTR,
            CLASS_IN,
            1,
            "x._gone._udp.local.".to_string(),
        ));
        let now = current_time_millis();
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        assert!(!out.add_answer_at_time(record, now + 10_000));
        assert_eq!(out.answers_count(), 0);
    }
}
