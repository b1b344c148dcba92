#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use idmap_contracts::mapping::{
    CommonPartyPair, IdentityId, NonAssociationRecord, PairSequence, PrimaryKey,
};
use idmap_storage::repo::NonAssociationStore;
use idmap_storage::table::StorageError;

/// Read-only query for third identities paired with both `a` and `b`.
#[derive(Debug, Default)]
pub struct CommonPartyFinder;

impl CommonPartyFinder {
    /// Pairs ordered by `(common_identity, with_first.primary_key, with_second.primary_key)`.
    /// The two linking records must carry the same sequence number.
    pub fn find_common_pairs<S>(
        store: &S,
        a: &IdentityId,
        b: &IdentityId,
    ) -> Result<Vec<CommonPartyPair>, StorageError>
    where
        S: NonAssociationStore + ?Sized,
    {
        if a == b {
            return Ok(Vec::new());
        }

        let with_b = store.find_by_identity(b)?;
        let mut b_links: BTreeMap<(&IdentityId, PairSequence), Vec<&NonAssociationRecord>> =
            BTreeMap::new();
        for y in &with_b {
            if let Some(c) = y.secondary_key.counterpart(b) {
                b_links
                    .entry((c, y.secondary_key.sequence))
                    .or_default()
                    .push(y);
            }
        }

        let mut pairs = Vec::new();
        for x in store.find_by_identity(a)? {
            let Some(c) = x.secondary_key.counterpart(a) else {
                continue;
            };
            // A record pairing a with b directly has no third party.
            if c == b {
                continue;
            }
            let Some(ys) = b_links.get(&(c, x.secondary_key.sequence)) else {
                continue;
            };
            for y in ys {
                pairs.push(CommonPartyPair {
                    common_identity: c.clone(),
                    with_first: x.clone(),
                    with_second: (*y).clone(),
                });
            }
        }

        pairs.sort_by(|p, q| {
            (
                &p.common_identity,
                &p.with_first.primary_key,
                &p.with_second.primary_key,
            )
                .cmp(&(
                    &q.common_identity,
                    &q.with_first.primary_key,
                    &q.with_second.primary_key,
                ))
        });
        Ok(pairs)
    }

    /// Flat, de-duplicated list of every record taking part in a match,
    /// ascending by primary key. Empty when nothing matches.
    pub fn find_common<S>(
        store: &S,
        a: &IdentityId,
        b: &IdentityId,
    ) -> Result<Vec<NonAssociationRecord>, StorageError>
    where
        S: NonAssociationStore + ?Sized,
    {
        let mut by_primary: BTreeMap<PrimaryKey, NonAssociationRecord> = BTreeMap::new();
        for pair in Self::find_common_pairs(store, a, b)? {
            by_primary.insert(pair.with_first.primary_key.clone(), pair.with_first);
            by_primary.insert(pair.with_second.primary_key.clone(), pair.with_second);
        }
        Ok(by_primary.into_values().collect())
    }
}
