//! Keystore key layout.
//!
//! Every per-batch key embeds the batch id inside a `{...}` hash tag, so a
//! sharded keystore routes all four keys of one batch to the same partition
//! and the multi-key cache pipeline can apply atomically.

/// Set of live worker instance ids; trimmed by recovery.
pub const WORKERS_SET: &str = "alya:workers";

pub fn status_key(batch: &str) -> String {
    format!("ALYA_{{{batch}}}_STATUS")
}

pub fn result_key(batch: &str) -> String {
    format!("ALYA_{{{batch}}}_RESULT")
}

pub fn output_files_key(batch: &str) -> String {
    format!("ALYA_{{{batch}}}_OUTFILES")
}

pub fn summary_key(batch: &str) -> String {
    format!("ALYA_{{{batch}}}_SUMMARY")
}

pub fn heartbeat_key(instance: &str) -> String {
    format!("alya:worker:{instance}:hb")
}

pub fn rows_key(instance: &str) -> String {
    format!("alya:worker:{instance}:rows")
}

/// The shard-affinity tag of a key: the substring between the first `{` and
/// the next `}`, per the cluster hashing convention. Keys with equal tags
/// always land on the same slot.
pub fn hash_tag(key: &str) -> Option<&str> {
    let open = key.find('{')?;
    let close = key[open + 1..].find('}')?;
    if close == 0 {
        return None;
    }
    Some(&key[open + 1..open + 1 + close])
}
