//! Retention policy evaluator
//!
//! Pure: given a policy and the artifact listing for one
//! (target, destination) pair, computes the artifacts to delete. Never
//! performs I/O; the pipeline executes the deletions.

use chrono::{DateTime, Datelike, Duration, Utc};
use std::collections::HashSet;

use crate::models::{ArtifactInfo, RetentionRule, SmartBuckets};

/// Compute the artifacts to delete under `rule`.
///
/// Artifacts may arrive in any order; evaluation sorts newest-first with
/// lexicographic-descending filenames breaking timestamp ties. The returned
/// set preserves that order.
pub fn evaluate(
    rule: &RetentionRule,
    artifacts: &[ArtifactInfo],
    now: DateTime<Utc>,
) -> Vec<ArtifactInfo> {
    let mut sorted: Vec<ArtifactInfo> = artifacts.to_vec();
    sorted.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.name.cmp(&a.name))
    });

    match rule {
        RetentionRule::MaxCount(n) => sorted.into_iter().skip(*n as usize).collect(),
        RetentionRule::MaxDays(days) => {
            let cutoff = now - Duration::days(*days as i64);
            sorted
                .into_iter()
                .filter(|a| a.created_at < cutoff)
                .collect()
        }
        RetentionRule::MaxSizeMb(mb) => {
            let budget = mb.saturating_mul(1024 * 1024);
            let mut total: u64 = 0;
            let mut delete = Vec::new();
            for (index, artifact) in sorted.into_iter().enumerate() {
                total = total.saturating_add(artifact.size);
                // The newest artifact survives even when it alone blows the
                // budget; there must always be something to restore from.
                if index > 0 && total > budget {
                    delete.push(artifact);
                }
            }
            delete
        }
        RetentionRule::Smart(buckets) => evaluate_smart(buckets, sorted),
    }
}

/// Bucketed keep policy: newest artifact per calendar day / ISO week /
/// calendar month / calendar year (UTC), over the most recent N distinct
/// buckets of each granularity. An artifact kept by any bucket is kept.
fn evaluate_smart(buckets: &SmartBuckets, sorted: Vec<ArtifactInfo>) -> Vec<ArtifactInfo> {
    let mut keep: HashSet<String> = HashSet::new();

    mark_kept(&sorted, buckets.daily, &mut keep, |ts| {
        (ts.year(), ts.ordinal())
    });
    mark_kept(&sorted, buckets.weekly, &mut keep, |ts| {
        let week = ts.iso_week();
        (week.year(), week.week())
    });
    mark_kept(&sorted, buckets.monthly, &mut keep, |ts| {
        (ts.year(), ts.month())
    });
    mark_kept(&sorted, buckets.yearly, &mut keep, |ts| (ts.year(), 0));

    sorted
        .into_iter()
        .filter(|a| !keep.contains(&a.id))
        .collect()
}

/// Keep the newest artifact in each of the most recent `count` distinct
/// buckets. `sorted` is newest-first, so the first artifact seen per bucket
/// is its newest (name-descending already broke timestamp ties).
fn mark_kept<K, F>(sorted: &[ArtifactInfo], count: u32, keep: &mut HashSet<String>, bucket_of: F)
where
    K: Eq + std::hash::Hash,
    F: Fn(&DateTime<Utc>) -> K,
{
    if count == 0 {
        return;
    }
    let mut seen: HashSet<K> = HashSet::new();
    for artifact in sorted {
        let bucket = bucket_of(&artifact.created_at);
        if seen.contains(&bucket) {
            continue;
        }
        if seen.len() as u32 >= count {
            break;
        }
        seen.insert(bucket);
        keep.insert(artifact.id.clone());
    }
}
