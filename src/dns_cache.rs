//! A cache for DNS records.
//!
//! This is an internal implementation, not visible to the public API.

use crate::dns_parser::{
    current_time_millis, DnsPointer, DnsRecordBox, DnsRecordExt, DnsSrv, RRType,
};
#[cfg(feature = "logging")]
use crate::log::debug;
use crate::service_info::split_sub_domain;
use std::collections::HashMap;

/// A cache of received DNS records, keyed by the lowercased record name.
/// Each name holds an unordered bag of records of any type.
///
/// At most one record exists per (name, type, class, rdata): a fresh
/// arrival either refreshes the TTL of its match or is inserted anew.
pub(crate) struct DnsCache {
    records: HashMap<String, Vec<DnsRecordBox>>,

    /// A reverse lookup table from "instance fullname" to "subtype PTR name"
    subtype: HashMap<String, String>,
}

impl DnsCache {
    pub(crate) fn new() -> Self {
        Self {
            records: HashMap::new(),
            subtype: HashMap::new(),
        }
    }

    fn key(name: &str) -> String {
        name.to_lowercase()
    }

    /// All records stored under `name`.
    pub(crate) fn get_by_name(&self, name: &str) -> Option<&Vec<DnsRecordBox>> {
        self.records.get(&Self::key(name))
    }

    /// The records stored under `name` with record type `ty`.
    pub(crate) fn records_by_type(
        &self,
        name: &str,
        ty: RRType,
    ) -> impl Iterator<Item = &DnsRecordBox> {
        self.records
            .get(&Self::key(name))
            .into_iter()
            .flatten()
            .filter(move |r| r.get_type() == ty)
    }

    /// Returns the stored record equal to `record` (same entry identity
    /// and same rdata), if any.
    pub(crate) fn get(&self, record: &dyn DnsRecordExt) -> Option<&DnsRecordBox> {
        self.records
            .get(&Self::key(record.get_name()))
            .into_iter()
            .flatten()
            .find(|r| r.matches(record))
    }

    /// Inserts `record` without looking for an existing match. Callers
    /// consult [DnsCache::get] first, or use [DnsCache::add_or_refresh].
    pub(crate) fn put(&mut self, record: DnsRecordBox) {
        self.records
            .entry(Self::key(record.get_name()))
            .or_default()
            .insert(0, record);
    }

    /// Updates the TTL of the existing matching record, or inserts
    /// `incoming` as a new record.
    ///
    /// Returns a reference to the cached record and whether it is new.
    pub(crate) fn add_or_refresh(&mut self, incoming: DnsRecordBox) -> (&DnsRecordBox, bool) {
        let entry_key = Self::key(incoming.get_name());

        // If it is a PTR under a subtype domain, remember the mapping from
        // the instance fullname to the subtype.
        if incoming.get_type() == RRType::PTR {
            let (_, subtype_opt) = split_sub_domain(incoming.get_name());
            if let Some(subtype) = subtype_opt {
                if let Some(ptr) = incoming.any().downcast_ref::<DnsPointer>() {
                    if !self.subtype.contains_key(&ptr.alias) {
                        self.subtype.insert(ptr.alias.clone(), subtype.to_string());
                    }
                }
            }
        }

        let record_vec = self.records.entry(entry_key).or_default();

        if incoming.is_unique() {
            let now = current_time_millis();
            let class = incoming.get_class();
            let rtype = incoming.get_type();

            record_vec.iter_mut().for_each(|r| {
                // How the cache-flush bit works (RFC 6762 section 10.2):
                // records of the same name, type and class that were
                // created more than one second ago are set to expire one
                // second in the future. When the updated record actually
                // expires it will trigger events normally.
                if class == r.get_class()
                    && rtype == r.get_type()
                    && now > r.get_record().get_created() + 1000
                    && r.get_record().get_expire_time() > now + 1000
                {
                    debug!("cache flush shortens record: {:?}", r);
                    r.get_record_mut().set_expire(now + 1000);
                }
            });
        }

        let (idx, new) = match record_vec
            .iter_mut()
            .enumerate()
            .find(|(_idx, r)| r.matches(incoming.as_ref()))
        {
            Some((i, r)) => {
                // The existing record may have just been shortened by the
                // cache-flush pass. Resetting here is still correct.
                r.reset_ttl(incoming.as_ref());
                (i, false)
            }
            None => {
                record_vec.insert(0, incoming);
                (0, true)
            }
        };

        (record_vec.get(idx).unwrap(), new)
    }

    /// Removes the record matching `record`, if it exists.
    /// Returns whether a record was removed.
    pub(crate) fn remove(&mut self, record: &dyn DnsRecordExt) -> bool {
        let mut found = false;
        if let Some(record_vec) = self.records.get_mut(&Self::key(record.get_name())) {
            record_vec.retain(|x| {
                if x.matches(record) {
                    found = true;
                    return false;
                }
                true
            });
        }
        found
    }

    /// Removes every record that has expired by `now`, and returns them.
    ///
    /// The caller turns the removed PTR/SRV records into service-removal
    /// events; reaping itself does no notification.
    pub(crate) fn reap(&mut self, now: u64) -> Vec<DnsRecordBox> {
        let mut removed = Vec::new();
        for records in self.records.values_mut() {
            records.retain(|record| {
                let expired = record.get_record().is_expired(now);
                if expired {
                    debug!("reaping expired record: {:?}", record);
                    removed.push(record.clone());
                }
                !expired
            });
        }
        self.records.retain(|_, v| !v.is_empty());
        removed
    }

    /// A reverse lookup from "instance fullname" to "subtype PTR name"
    pub(crate) fn get_subtype(&self, fullname: &str) -> Option<&String> {
        self.subtype.get(fullname)
    }

    /// Returns the list of instance fullnames whose SRV points at `host`.
    pub(crate) fn instances_on_host(&self, host: &str) -> Vec<String> {
        self.records
            .values()
            .flatten()
            .filter_map(|record| {
                let srv = record.any().downcast_ref::<DnsSrv>()?;
                if srv.host.eq_ignore_ascii_case(host) {
                    Some(record.get_name().to_string())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Returns the Known Answers for a question of `name` with `qtype`.
    ///
    /// RFC 6762 section 7.1: only Shared records are listed, and a
    /// querier should not include records past half of their TTL.
    pub(crate) fn known_answers<'a>(
        &'a self,
        name: &str,
        qtype: RRType,
        now: u64,
    ) -> Vec<&'a DnsRecordBox> {
        self.records
            .get(&Self::key(name))
            .into_iter()
            .flatten()
            .filter(|r| {
                (r.get_type() == qtype || qtype == RRType::ANY)
                    && !r.is_unique()
                    && !r.get_record().halflife_passed(now)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::DnsCache;
    use crate::dns_parser::{
        DnsPointer, DnsRecordBox, DnsRecordExt, DnsSrv, RRType, CLASS_CACHE_FLUSH, CLASS_IN,
    };

    fn music_ptr(ttl: u32) -> DnsRecordBox {
        Box::new(DnsPointer::new(
            "_music._tcp.local.",
            RRType::PTR,
            CLASS_IN,
            ttl,
            "box._music._tcp.local.".to_string(),
        ))
    }

    #[test]
    fn test_add_refresh_and_reap() {
        let mut cache = DnsCache::new();

        let (_, new) = cache.add_or_refresh(music_ptr(60));
        assert!(new);

        // An identical record with a new TTL refreshes in place: the
        // cached entry takes the arrival's created time and TTL, and no
        // new record is created.
        let arriving = music_ptr(120);
        let arriving_created = arriving.get_record().get_created();
        let (cached, new) = cache.add_or_refresh(arriving);
        assert!(!new);
        assert_eq!(cached.get_record().get_ttl(), 120);
        assert_eq!(cached.get_record().get_created(), arriving_created);
        assert_eq!(cache.get_by_name("_music._tcp.local.").unwrap().len(), 1);

        // Reaping exactly at created + ttl * 1000 removes the record.
        let removed = cache.reap(arriving_created + 120_000);
        assert_eq!(removed.len(), 1);
        assert!(cache.get_by_name("_music._tcp.local.").is_none());
    }

    #[test]
    fn test_rdata_change_inserts_new_record() {
        let mut cache = DnsCache::new();
        cache.add_or_refresh(music_ptr(60));

        let other: DnsRecordBox = Box::new(DnsPointer::new(
            "_music._tcp.local.",
            RRType::PTR,
            CLASS_IN,
            60,
            "other._music._tcp.local.".to_string(),
        ));
        let (_, new) = cache.add_or_refresh(other);
        assert!(new);
        assert_eq!(cache.get_by_name("_music._tcp.local.").unwrap().len(), 2);
    }

    #[test]
    fn test_get_and_remove() {
        let mut cache = DnsCache::new();
        cache.put(music_ptr(60));

        let probe = music_ptr(10);
        assert!(cache.get(probe.as_ref()).is_some());
        assert!(cache.remove(probe.as_ref()));
        assert!(!cache.remove(probe.as_ref()));
        assert!(cache.get(probe.as_ref()).is_none());
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut cache = DnsCache::new();
        cache.put(music_ptr(60));
        assert!(cache.get_by_name("_MUSIC._TCP.local.").is_some());
    }

    #[test]
    fn test_known_answers_exclude_unique_and_stale() {
        let mut cache = DnsCache::new();
        let shared = music_ptr(100);
        let created = shared.get_record().get_created();
        cache.put(shared);
        cache.put(Box::new(DnsSrv::new(
            "_music._tcp.local.",
            CLASS_IN | CLASS_CACHE_FLUSH,
            100,
            0,
            0,
            9000,
            "host.local.".to_string(),
        )));

        // Fresh: only the shared PTR qualifies.
        let answers = cache.known_answers("_music._tcp.local.", RRType::ANY, created + 1000);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].get_type(), RRType::PTR);

        // Past half life nothing qualifies.
        let answers = cache.known_answers("_music._tcp.local.", RRType::ANY, created + 51_000);
        assert!(answers.is_empty());
    }

    #[test]
    fn test_instances_on_host() {
        let mut cache = DnsCache::new();
        cache.put(Box::new(DnsSrv::new(
            "box._music._tcp.local.",
            CLASS_IN | CLASS_CACHE_FLUSH,
            120,
            0,
            0,
            9000,
            "Host.local.".to_string(),
        )));
        let instances = cache.instances_on_host("host.local.");
        assert_eq!(instances, vec!["box._music._tcp.local.".to_string()]);
    }

    #[test]
    fn test_subtype_mapping() {
        let mut cache = DnsCache::new();
        cache.add_or_refresh(Box::new(DnsPointer::new(
            "_printer._sub._http._tcp.local.",
            RRType::PTR,
            CLASS_IN,
            4500,
            "laser._http._tcp.local.".to_string(),
        )));
        assert_eq!(
            cache.get_subtype("laser._http._tcp.local."),
            Some(&"_printer._sub._http._tcp.local.".to_string())
        );
    }
}
