//! Mutation slice utilities.

use std::collections::HashMap;

use bytes::Bytes;

use crate::types::Mutation;

/// Collapses mutations that share a `(time, key)` pair; the last occurrence
/// wins. Output preserves the input order of the surviving elements, so
/// batch contents are deterministic.
pub fn unique_by_time_key(muts: Vec<Mutation>) -> Vec<Mutation> {
    if muts.len() < 2 {
        return muts;
    }
    let mut last_index: HashMap<(i64, i32, Bytes), usize> = HashMap::with_capacity(muts.len());
    for (idx, m) in muts.iter().enumerate() {
        last_index.insert((m.time.nanos(), m.time.logical(), m.key.clone()), idx);
    }
    if last_index.len() == muts.len() {
        return muts;
    }
    let keep: Vec<usize> = {
        let mut v: Vec<usize> = last_index.into_values().collect();
        v.sort_unstable();
        v
    };
    let mut out = Vec::with_capacity(keep.len());
    let mut muts = muts;
    // Drain from the back so earlier indices stay valid.
    for idx in keep.into_iter().rev() {
        out.push(muts.swap_remove(idx));
    }
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sluice_base::hlc::Time;

    fn mutation(key: &str, nanos: i64, data: &str) -> Mutation {
        Mutation {
            key: Bytes::copy_from_slice(key.as_bytes()),
            data: Some(Bytes::copy_from_slice(data.as_bytes())),
            time: Time::new(nanos, 0),
            ..Mutation::default()
        }
    }

    #[test]
    fn last_occurrence_wins() {
        let deduped = unique_by_time_key(vec![
            mutation("[1]", 1, "a"),
            mutation("[2]", 1, "b"),
            mutation("[1]", 1, "c"),
        ]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].data.as_deref(), Some(&b"b"[..]));
        assert_eq!(deduped[1].data.as_deref(), Some(&b"c"[..]));
    }

    #[test]
    fn distinct_times_are_kept() {
        let deduped = unique_by_time_key(vec![mutation("[1]", 1, "a"), mutation("[1]", 2, "b")]);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn small_inputs_pass_through() {
        assert!(unique_by_time_key(Vec::new()).is_empty());
        assert_eq!(unique_by_time_key(vec![mutation("[1]", 1, "a")]).len(), 1);
    }
}
