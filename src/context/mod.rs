//! Hierarchical context tree (C5).
//!
//! A [`Context`] is a named, depth-tracked container for one [`Value`]. The
//! [`ContextMap`] is the flat name → context mapping reachable while
//! executing a given step; it is copy-on-extend — `newChild`/`newOverlay`/
//! `newWorking` all return a *new* map that shares the caller's canonical
//! entries by reference and adds exactly one entry, never mutating the
//! caller's map. Canonical context values are reachable from multiple maps
//! at once (they live on in ancestor iterations); every read-modify-write of
//! one goes through the single plan-scoped [`MergeLock`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

/// The immutable identity fields of a context, plus a handle to its mutable
/// value. Cheap to clone: cloning shares the same underlying value cell.
#[derive(Clone)]
pub struct Context {
    cell: Arc<Mutex<Value>>,
    pub parent: String,
    pub key: String,
    pub depth: usize,
}

impl Context {
    fn new(key: impl Into<String>, parent: impl Into<String>, depth: usize, value: Value) -> Self {
        Self {
            cell: Arc::new(Mutex::new(value)),
            parent: parent.into(),
            key: key.into(),
            depth,
        }
    }

    /// Snapshot the current value. Callers doing read-modify-write must hold
    /// the [`MergeLock`] first so the snapshot can't be invalidated by a
    /// concurrent writer between the read and the later `set`.
    pub fn get(&self) -> Value {
        self.cell.lock().expect("context mutex poisoned").clone()
    }

    pub fn set(&self, value: Value) {
        *self.cell.lock().expect("context mutex poisoned") = value;
    }
}

/// Flat name → [`Context`] mapping reachable during execution of a step.
#[derive(Clone, Default)]
pub struct ContextMap {
    entries: HashMap<String, Context>,
}

impl ContextMap {
    /// Builds the map containing exactly the root context, per the
    /// invariant "exactly one context named `root`, depth 0, created at Run
    /// entry".
    pub fn with_root(root_value: Value) -> Self {
        let mut entries = HashMap::new();
        entries.insert("root".to_string(), Context::new("root", "", 0, root_value));
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&Context> {
        self.entries.get(name)
    }

    pub fn root(&self) -> &Context {
        self.entries.get("root").expect("root context always present")
    }

    /// `newChild(caller, key, value)`: used by `forEach`. Parent = caller's
    /// key, depth = caller's depth + 1. Returns a new map extending `self`.
    pub fn new_child(&self, caller: &Context, key: &str, value: Value) -> (ContextMap, Context) {
        let child = Context::new(key, caller.key.clone(), caller.depth + 1, value);
        (self.extended(key, child.clone()), child)
    }

    /// `newOverlay(caller, key, value)`: used by `forValues`. Same depth and
    /// parent pointer as the caller.
    pub fn new_overlay(&self, caller: &Context, key: &str, value: Value) -> (ContextMap, Context) {
        let overlay = Context::new(key, caller.parent.clone(), caller.depth, value);
        (self.extended(key, overlay.clone()), overlay)
    }

    /// `newWorking(caller, value, canonicalSet)`: used by `request` to hold a
    /// response while nested steps run. If `caller.key` is itself a
    /// canonical name, the working context is renamed `_response_<name>` so
    /// the canonical context remains addressable by merges.
    pub fn new_working(
        &self,
        caller: &Context,
        value: Value,
        is_canonical: impl Fn(&str) -> bool,
    ) -> (ContextMap, Context, String) {
        let working_key = if is_canonical(&caller.key) {
            format!("_response_{}", caller.key)
        } else {
            caller.key.clone()
        };
        let working = Context::new(&working_key, caller.parent.clone(), caller.depth + 1, value);
        (self.extended(&working_key, working.clone()), working, working_key)
    }

    fn extended(&self, key: &str, ctx: Context) -> ContextMap {
        let mut entries = self.entries.clone();
        entries.insert(key.to_string(), ctx);
        ContextMap { entries }
    }

    /// Names of contexts considered canonical: `root` plus every other entry
    /// that isn't a `_response_*` working context. Used to decide renaming
    /// in `newWorking` and to know which contexts are merge targets.
    pub fn canonical_names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .keys()
            .filter(|k| !k.starts_with("_response_"))
            .map(|s| s.as_str())
    }

    pub fn is_canonical(&self, name: &str) -> bool {
        self.entries.contains_key(name) && !name.starts_with("_response_")
    }
}

/// The single plan-scoped mutex serializing every read-modify-write of any
/// context's value and every construction of the template view. Never held
/// across HTTP I/O or rate-limiter waits (see the concurrency model this
/// crate implements).
#[derive(Clone, Default)]
pub struct MergeLock(Arc<tokio::sync::Mutex<()>>);

impl MergeLock {
    pub fn new() -> Self {
        Self(Arc::new(tokio::sync::Mutex::new(())))
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

/// Runtime variables supplied by the caller at `Run`. Numeric values are
/// normalized so integral floats render as integers and non-integral floats
/// render as plain decimal strings rather than scientific notation.
pub fn normalize_variables(vars: Map<String, Value>) -> Map<String, Value> {
    vars.into_iter().map(|(k, v)| (k, normalize_value(v))).collect()
}

fn normalize_value(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
                    Value::Number((f as i64).into())
                } else if f.is_finite() {
                    // Non-integral floats render as decimal strings so templates
                    // never see scientific notation (e.g. `3.2` not `3.2e0`).
                    Value::String(format_decimal(f))
                } else {
                    Value::Number(n)
                }
            } else {
                Value::Number(n)
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, normalize_value(v))).collect())
        }
        other => other,
    }
}

/// Formats a finite, non-integral `f64` as a plain decimal string (no
/// exponent, no trailing zeros beyond what's needed).
fn format_decimal(f: f64) -> String {
    let s = format!("{f}");
    if s.contains('e') || s.contains('E') {
        format!("{f:.17}").trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

/// Builds the read-only template view handed to query/template execution:
/// deep-copies each context's value (normalizing floats), spreads
/// mapping-valued working contexts (`_response_*`) at the top level, then
/// the root mapping at lower priority, then runtime variables at highest
/// priority. Must be called while holding the [`MergeLock`].
pub fn build_template_view(map: &ContextMap, variables: &Map<String, Value>) -> Value {
    let mut out = Map::new();

    if let Value::Object(root_map) = map.root().get() {
        for (k, v) in root_map {
            out.insert(k, normalize_value(v));
        }
    }

    for (name, ctx) in map.entries.iter() {
        if name.starts_with("_response_") {
            if let Value::Object(working_map) = ctx.get() {
                for (k, v) in working_map {
                    out.insert(k, normalize_value(v));
                }
            }
        }
    }

    // Canonical, non-root contexts are addressable by their own name too
    // (e.g. a forEach's `as` binding, visible in nested templates).
    for (name, ctx) in map.entries.iter() {
        if name != "root" && !name.starts_with("_response_") {
            out.insert(name.clone(), normalize_value(ctx.get()));
        }
    }

    for (k, v) in variables.iter() {
        out.insert(k.clone(), normalize_value(v.clone()));
    }

    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_context_has_depth_zero_and_empty_parent() {
        let map = ContextMap::with_root(json!({}));
        let root = map.root();
        assert_eq!(root.depth, 0);
        assert_eq!(root.parent, "");
        assert_eq!(root.key, "root");
    }

    #[test]
    fn new_child_does_not_mutate_callers_map() {
        let map = ContextMap::with_root(json!({}));
        let root = map.root().clone();
        let (extended, child) = map.new_child(&root, "item", json!({"id": 1}));

        assert!(map.get("item").is_none());
        assert!(extended.get("item").is_some());
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent, "root");
    }

    #[test]
    fn new_overlay_shares_callers_depth_and_parent() {
        let map = ContextMap::with_root(json!({}));
        let root = map.root().clone();
        let (extended, overlay) = map.new_overlay(&root, "v", json!(42));
        assert_eq!(overlay.depth, root.depth);
        assert_eq!(overlay.parent, root.parent);
        assert_eq!(extended.get("v").unwrap().get(), json!(42));
    }

    #[test]
    fn new_working_renames_on_collision_with_canonical() {
        let map = ContextMap::with_root(json!({}));
        let root = map.root().clone();
        let (with_station, station) = map.new_child(&root, "station", json!({}));

        let (working_map, working, key) =
            with_station.new_working(&station, json!({"a": 1}), |n| with_station.is_canonical(n));

        assert_eq!(key, "_response_station");
        assert_eq!(working.parent, station.parent);
        assert!(working_map.get("_response_station").is_some());
        assert!(working_map.get("station").is_some());
    }

    #[test]
    fn new_working_keeps_name_when_no_collision() {
        let map = ContextMap::with_root(json!({}));
        let root = map.root().clone();
        let (working_map, _working, key) =
            map.new_working(&root, json!({"a": 1}), |n| map.is_canonical(n));
        assert_eq!(key, "root");
        assert_eq!(working_map.root().get(), json!({"a": 1}));
    }

    #[test]
    fn normalize_collapses_integral_floats() {
        let v = normalize_value(json!(3.0));
        assert_eq!(v, json!(3));
    }

    #[test]
    fn normalize_renders_non_integral_floats_as_decimal_strings() {
        let v = normalize_value(json!(3.5));
        assert_eq!(v, json!("3.5"));
        let v = normalize_value(json!(0.0001));
        assert_eq!(v, json!("0.0001"));
    }

    #[test]
    fn template_view_priority_variables_over_working_over_root() {
        let map = ContextMap::with_root(json!({"name": "root-val", "shared": "root"}));
        let root = map.root().clone();
        let (map, _working, _key) =
            map.new_working(&root, json!({"shared": "working"}), |n| map.is_canonical(n));

        let mut vars = Map::new();
        vars.insert("shared".to_string(), json!("variable"));

        let view = build_template_view(&map, &vars);
        assert_eq!(view["shared"], json!("variable"));
        assert_eq!(view["name"], json!("root-val"));
    }
}
