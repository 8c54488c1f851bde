//! Points-to oracle.
//! The points-to engine itself is an external collaborator: it registers,
//! for each queried SSA value, the set of labels (abstract allocation sites
//! or globals) the value may refer to. Labels are canonicalized into stable
//! lock-class labels before use, since raw labels tend to carry pointer
//! sigils and allocation-site decorations that would split one class into
//! many.

use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;

use crate::ir::ValueId;

/// Strips `&`/`*` prefixes and a trailing parenthesized location, e.g.
/// `"&runtime.sched (proc.go:42)"` -> `"runtime.sched"`.
static LABEL_CANONICAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[&*]*(.*?)(?:\s*\([^()]*\))?$").unwrap());

/// Canonical lock-class label for a raw points-to label.
pub fn canonical_label(raw: &str) -> String {
    match LABEL_CANONICAL.captures(raw.trim()) {
        Some(caps) => caps[1].trim().to_owned(),
        None => raw.trim().to_owned(),
    }
}

/// Query results of the external points-to analysis, keyed by SSA value.
/// Values that were never registered have an empty points-to set.
#[derive(Default)]
pub struct PointsTo {
    queries: FxHashMap<ValueId, Vec<String>>,
}

impl PointsTo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the labels `v` may point to. Labels are canonicalized and
    /// deduplicated; repeated registration extends the set.
    pub fn register(&mut self, v: ValueId, labels: impl IntoIterator<Item = impl AsRef<str>>) {
        let set = self.queries.entry(v).or_default();
        for label in labels {
            let canonical = canonical_label(label.as_ref());
            if canonical.is_empty() {
                continue;
            }
            if !set.contains(&canonical) {
                set.push(canonical);
            }
        }
    }

    /// The canonical labels `v` may point to; empty for unregistered values.
    pub fn points_to(&self, v: ValueId) -> &[String] {
        self.queries.get(&v).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_label_strips_sigils_and_sites() {
        assert_eq!(canonical_label("runtime.sched"), "runtime.sched");
        assert_eq!(canonical_label("&runtime.sched"), "runtime.sched");
        assert_eq!(canonical_label("*runtime.mheap_"), "runtime.mheap_");
        assert_eq!(
            canonical_label("&runtime.sched (proc.go:42)"),
            "runtime.sched"
        );
        assert_eq!(canonical_label("new mutex (lock.go:10)"), "new mutex");
    }

    #[test]
    fn register_dedups_aliasing_labels() {
        let mut pta = PointsTo::new();
        let v = ValueId(0);
        pta.register(v, ["&runtime.sched", "runtime.sched (proc.go:7)"]);
        assert_eq!(pta.points_to(v), &["runtime.sched".to_owned()]);
    }

    #[test]
    fn unregistered_value_has_empty_set() {
        let pta = PointsTo::new();
        assert!(pta.points_to(ValueId(3)).is_empty());
    }
}
