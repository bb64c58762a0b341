//! Three-way classification between the attachment registry and a remote
//! listing.
use crate::model::{AttachmentRecord, Discrepancy, DiscrepancyKind, RemoteObjectRecord};
use crate::storage::KeyMapper;
use std::collections::{BTreeSet, HashMap};

/// Remote originals keyed by repository-relative path.
///
/// Holds one entry per remote original, so its size grows with the bucket.
/// Thumbnails are never inserted.
#[derive(Debug, Clone, Default)]
pub struct RemoteMap {
    entries: HashMap<String, RemoteObjectRecord>,
    total_bytes: i64,
}

impl RemoteMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, relative_path: String, record: RemoteObjectRecord) {
        self.total_bytes += record.size;
        if let Some(previous) = self.entries.insert(relative_path, record) {
            self.total_bytes -= previous.size;
        }
    }

    pub fn get(&self, relative_path: &str) -> Option<&RemoteObjectRecord> {
        self.entries.get(relative_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> i64 {
        self.total_bytes
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RemoteObjectRecord)> {
        self.entries.iter()
    }

    /// The remote entry backing an attachment. The stored key wins over the
    /// relative path, so a record whose key drifted still matches the object
    /// it points at.
    pub fn lookup<'m>(
        &'m self,
        keys: &KeyMapper,
        record: &AttachmentRecord,
    ) -> Option<(&'m str, &'m RemoteObjectRecord)> {
        let by_key = record
            .remote_key
            .as_deref()
            .and_then(|key| keys.relative_path(key))
            .and_then(|rel| self.entries.get_key_value(rel.as_str()));
        by_key
            .or_else(|| self.entries.get_key_value(record.relative_path.as_str()))
            .map(|(rel, remote)| (rel.as_str(), remote))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassificationCounts {
    pub attachments: i64,
    pub migrated: i64,
    pub not_migrated: i64,
    pub local_missing: i64,
    pub not_on_remote: i64,
    pub not_marked_migrated: i64,
    pub orphan_remote: i64,
    pub matched_bytes: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub discrepancies: Vec<Discrepancy>,
    /// Migrated attachments whose remote object was found.
    pub matched_attachments: BTreeSet<i64>,
    /// Remote entries (relative paths) claimed by some attachment.
    pub matched_remote: BTreeSet<String>,
    pub counts: ClassificationCounts,
}

/// Incremental classifier: attachments are fed one page at a time, orphans
/// are computed once the registry is exhausted.
pub struct Classifier<'a> {
    remote: &'a RemoteMap,
    keys: &'a KeyMapper,
    out: Classification,
}

impl<'a> Classifier<'a> {
    pub fn new(remote: &'a RemoteMap, keys: &'a KeyMapper) -> Self {
        Self {
            remote,
            keys,
            out: Classification::default(),
        }
    }

    pub fn observe(&mut self, record: &AttachmentRecord, local_exists: bool) {
        let counts = &mut self.out.counts;
        counts.attachments += 1;
        if !local_exists {
            counts.local_missing += 1;
        }

        let found = self.remote.lookup(self.keys, record);
        if record.migrated {
            counts.migrated += 1;
            match found {
                Some((rel, remote)) => {
                    counts.matched_bytes += remote.size;
                    self.out.matched_attachments.insert(record.id);
                    self.out.matched_remote.insert(rel.to_string());
                }
                None => {
                    counts.not_on_remote += 1;
                    self.out.discrepancies.push(Discrepancy {
                        kind: DiscrepancyKind::NotOnRemote,
                        attachment_id: Some(record.id),
                        relative_path: record.relative_path.clone(),
                        remote: None,
                        local_exists: Some(local_exists),
                    });
                }
            }
        } else {
            counts.not_migrated += 1;
            if let Some((rel, remote)) = found {
                counts.not_marked_migrated += 1;
                self.out.matched_remote.insert(rel.to_string());
                self.out.discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::NotMarkedMigrated,
                    attachment_id: Some(record.id),
                    relative_path: record.relative_path.clone(),
                    remote: Some(remote.clone()),
                    local_exists: Some(local_exists),
                });
            }
        }
    }

    pub fn finish(mut self) -> Classification {
        let remote = self.remote;
        let mut orphans: Vec<(&String, &RemoteObjectRecord)> = remote
            .iter()
            .filter(|(rel, _)| !self.out.matched_remote.contains(rel.as_str()))
            .collect();
        orphans.sort_by(|a, b| a.0.cmp(b.0));
        for (rel, remote) in orphans {
            self.out.counts.orphan_remote += 1;
            self.out.discrepancies.push(Discrepancy {
                kind: DiscrepancyKind::OrphanRemote,
                attachment_id: None,
                relative_path: rel.clone(),
                remote: Some(remote.clone()),
                local_exists: None,
            });
        }
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(id: i64, path: &str, migrated: bool, key: Option<&str>) -> AttachmentRecord {
        AttachmentRecord {
            id,
            relative_path: path.into(),
            byte_size: 10,
            mime_type: Some("image/jpeg".into()),
            variants: Vec::new(),
            migrated,
            remote_key: key.map(str::to_string),
            remote_url: None,
            optimized: false,
        }
    }

    fn remote(entries: &[(&str, i64)]) -> RemoteMap {
        let mut map = RemoteMap::new();
        for (rel, size) in entries {
            map.insert(
                rel.to_string(),
                RemoteObjectRecord {
                    key: rel.to_string(),
                    size: *size,
                },
            );
        }
        map
    }

    fn kinds(c: &Classification) -> Vec<(DiscrepancyKind, String)> {
        c.discrepancies
            .iter()
            .map(|d| (d.kind, d.relative_path.clone()))
            .collect()
    }

    #[test]
    fn migrated_with_matching_key_has_no_discrepancy() {
        let keys = KeyMapper::new("", "");
        let map = remote(&[("u/5.jpg", 10)]);
        let mut classifier = Classifier::new(&map, &keys);
        classifier.observe(&attachment(5, "u/5.jpg", true, Some("u/5.jpg")), true);
        let out = classifier.finish();
        assert!(out.discrepancies.is_empty());
        assert!(out.matched_attachments.contains(&5));
        assert_eq!(out.counts.matched_bytes, 10);
    }

    #[test]
    fn unmigrated_with_remote_copy_is_not_marked_migrated() {
        let keys = KeyMapper::new("", "");
        let map = remote(&[("u/7.jpg", 3)]);
        let mut classifier = Classifier::new(&map, &keys);
        classifier.observe(&attachment(7, "u/7.jpg", false, None), true);
        let out = classifier.finish();
        assert_eq!(
            kinds(&out),
            vec![(DiscrepancyKind::NotMarkedMigrated, "u/7.jpg".to_string())]
        );
        assert_eq!(out.discrepancies[0].attachment_id, Some(7));
        // claimed, so not an orphan
        assert_eq!(out.counts.orphan_remote, 0);
    }

    #[test]
    fn stale_key_falls_back_to_relative_path() {
        let keys = KeyMapper::new("site", "");
        let map = remote(&[("2024/a.jpg", 1)]);
        let mut classifier = Classifier::new(&map, &keys);
        classifier.observe(
            &attachment(1, "2024/a.jpg", true, Some("site/old/a.jpg")),
            false,
        );
        let out = classifier.finish();
        assert!(out.discrepancies.is_empty());
        assert_eq!(out.counts.local_missing, 1);
    }

    #[test]
    fn partitions_both_datasets() {
        let keys = KeyMapper::new("", "");
        let map = remote(&[("a.jpg", 1), ("b.jpg", 2), ("c.jpg", 3), ("d.jpg", 4)]);
        let records = vec![
            attachment(1, "a.jpg", true, Some("a.jpg")),
            attachment(2, "b.jpg", false, None),
            attachment(3, "x.jpg", true, Some("x.jpg")),
            attachment(4, "y.jpg", false, None),
            attachment(5, "c.jpg", true, None),
        ];
        let mut classifier = Classifier::new(&map, &keys);
        for r in &records {
            classifier.observe(r, true);
        }
        let out = classifier.finish();

        let not_on_remote: BTreeSet<i64> = out
            .discrepancies
            .iter()
            .filter(|d| d.kind == DiscrepancyKind::NotOnRemote)
            .filter_map(|d| d.attachment_id)
            .collect();
        let migrated: BTreeSet<i64> = records.iter().filter(|r| r.migrated).map(|r| r.id).collect();
        let union: BTreeSet<i64> = not_on_remote
            .union(&out.matched_attachments)
            .copied()
            .collect();
        assert_eq!(union, migrated);
        assert!(not_on_remote.is_disjoint(&out.matched_attachments));

        let orphans: BTreeSet<String> = out
            .discrepancies
            .iter()
            .filter(|d| d.kind == DiscrepancyKind::OrphanRemote)
            .map(|d| d.relative_path.clone())
            .collect();
        let all_remote: BTreeSet<String> = map.iter().map(|(rel, _)| rel.clone()).collect();
        let union: BTreeSet<String> = orphans.union(&out.matched_remote).cloned().collect();
        assert_eq!(union, all_remote);
        assert!(orphans.is_disjoint(&out.matched_remote));
        assert_eq!(orphans, BTreeSet::from(["d.jpg".to_string()]));
    }

    #[test]
    fn replacing_an_entry_keeps_byte_total() {
        let mut map = remote(&[("a.jpg", 5)]);
        map.insert(
            "a.jpg".into(),
            RemoteObjectRecord {
                key: "a.jpg".into(),
                size: 7,
            },
        );
        assert_eq!(map.len(), 1);
        assert_eq!(map.total_bytes(), 7);
    }
}
