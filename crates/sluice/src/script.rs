//! User-script binding surface.
//!
//! The actual script sandbox is an external collaborator; what the core
//! consumes is a [`UserScript`]: a set of source and table bindings
//! registered through [`UserScript::configure_source`] and
//! [`UserScript::configure_table`]. Binding names are matched
//! case-insensitively, mirroring identifier canonicalization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use sluice_base::hlc::Time;
use sluice_base::ident::{Ident, Table};

use crate::types::{Acceptor, Mutation, TableBatch};

/// A JSON document flowing through user transformations.
pub type Document = Map<String, Value>;

/// Routes one document to zero or more named target tables.
pub type DispatchMap = HashMap<String, Vec<Document>>;

/// `(doc, meta) -> {target: [doc, ...]}`. `meta` carries at least the
/// source table name under `"table"`.
pub type DispatchFn =
    Arc<dyn Fn(&Document, &Document) -> anyhow::Result<DispatchMap> + Send + Sync>;

/// Rewrites a single row document before it is applied.
pub type MapFn = Arc<dyn Fn(Document) -> anyhow::Result<Document> + Send + Sync>;

/// Rewrites the primary-key vector of a deletion.
pub type DeleteKeyFn = Arc<dyn Fn(Vec<Value>) -> anyhow::Result<Vec<Value>> + Send + Sync>;

/// Replaces the default apply path for a table. The override receives the
/// full batch and must forward it through [`ApplyTx::apply`] exactly once.
#[async_trait]
pub trait ApplyOverride: Send + Sync {
    async fn apply(&self, tx: &ApplyTx<'_>, ops: Vec<Mutation>) -> anyhow::Result<()>;
}

/// Transactional handle passed to an [`ApplyOverride`]. Forwards into the
/// inner delegate; double application is a correctness bug and is refused.
pub struct ApplyTx<'a> {
    delegate: &'a dyn Acceptor,
    table: &'a Table,
    time: Time,
    used: AtomicBool,
}

impl<'a> ApplyTx<'a> {
    pub(crate) fn new(delegate: &'a dyn Acceptor, table: &'a Table, time: Time) -> Self {
        Self {
            delegate,
            table,
            time,
            used: AtomicBool::new(false),
        }
    }

    pub async fn apply(&self, ops: Vec<Mutation>) -> anyhow::Result<()> {
        if self.used.swap(true, Ordering::SeqCst) {
            anyhow::bail!("apply() called more than once for table {}", self.table);
        }
        self.delegate
            .accept_table_batch(&TableBatch::new(self.table.clone(), self.time, ops))
            .await
    }
}

/// Routing configuration for one named source.
#[derive(Clone)]
pub struct SourceBinding {
    pub dispatch: DispatchFn,
    /// Routes deletions. When absent, deletions flow through `dispatch`.
    pub deletes_to: Option<DispatchFn>,
}

/// Per-target-table transformations.
#[derive(Clone, Default)]
pub struct TableBinding {
    pub map: Option<MapFn>,
    pub delete_key: Option<DeleteKeyFn>,
    pub apply: Option<Arc<dyn ApplyOverride>>,
    /// Column collecting document fields not listed in `columns`.
    pub extras: Option<String>,
    /// Known target columns; meaningful only together with `extras`.
    pub columns: Vec<String>,
}

/// The registered bindings of one user script.
#[derive(Clone, Default)]
pub struct UserScript {
    sources: HashMap<String, SourceBinding>,
    tables: HashMap<String, TableBinding>,
}

impl UserScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure_source(&mut self, name: impl Into<String>, binding: SourceBinding) {
        self.sources.insert(Ident::new(name.into()).canonical(), binding);
    }

    pub fn configure_table(&mut self, name: impl Into<String>, binding: TableBinding) {
        self.tables.insert(Ident::new(name.into()).canonical(), binding);
    }

    pub fn source_for(&self, name: &Ident) -> Option<&SourceBinding> {
        self.sources.get(&name.canonical())
    }

    pub fn table_for(&self, name: &Ident) -> Option<&TableBinding> {
        self.tables.get(&name.canonical())
    }
}

/// Parses a mutation's data payload as a JSON object. Deletions yield the
/// before-image when available, otherwise an empty document.
pub(crate) fn document_of(mutation: &Mutation) -> anyhow::Result<Document> {
    let raw = match (&mutation.data, &mutation.before) {
        (Some(data), _) => data,
        (None, Some(before)) => before,
        (None, None) => return Ok(Document::new()),
    };
    match serde_json::from_slice::<Value>(raw)? {
        Value::Object(doc) => Ok(doc),
        other => anyhow::bail!("mutation payload is not a JSON object: {other}"),
    }
}

/// The metadata document handed to dispatch functions.
pub(crate) fn meta_of(table: &Table, mutation: &Mutation) -> Document {
    let mut meta = mutation.meta.clone();
    meta.insert("table".to_string(), Value::String(table.name().raw().to_string()));
    if let Ok(key) = serde_json::from_slice::<Value>(&mutation.key) {
        meta.insert("key".to_string(), key);
    }
    meta
}

/// Applies the `map` transformation and extras folding for a table binding.
pub(crate) fn transform_document(
    binding: &TableBinding,
    doc: Document,
) -> anyhow::Result<Document> {
    let mut doc = match &binding.map {
        Some(map) => map(doc)?,
        None => doc,
    };
    if let (Some(extras), false) = (&binding.extras, binding.columns.is_empty()) {
        let mut unmapped = Document::new();
        let names: Vec<String> = doc
            .keys()
            .filter(|k| !binding.columns.iter().any(|c| c.eq_ignore_ascii_case(k)) && *k != extras)
            .cloned()
            .collect();
        for name in names {
            if let Some(value) = doc.remove(&name) {
                unmapped.insert(name, value);
            }
        }
        if !unmapped.is_empty() {
            doc.insert(extras.clone(), Value::Object(unmapped));
        }
    }
    Ok(doc)
}

/// Applies `delete_key` to a deletion's key vector.
pub(crate) fn rewrite_delete_key(
    binding: &TableBinding,
    mutation: &mut Mutation,
) -> anyhow::Result<()> {
    let Some(delete_key) = &binding.delete_key else {
        return Ok(());
    };
    let key: Vec<Value> = serde_json::from_slice(&mutation.key)?;
    let rewritten = delete_key(key)?;
    mutation.key = Bytes::from(serde_json::to_vec(&rewritten)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_base::ident::Schema;

    #[test]
    fn source_names_fold_case() {
        let mut script = UserScript::new();
        script.configure_source(
            "Src1",
            SourceBinding {
                dispatch: Arc::new(|_, _| Ok(DispatchMap::new())),
                deletes_to: None,
            },
        );
        assert!(script.source_for(&Ident::new("SRC1")).is_some());
        assert!(script.source_for(&Ident::new("other")).is_none());
    }

    #[test]
    fn extras_folding_collects_unknown_fields() {
        let binding = TableBinding {
            extras: Some("extras".to_string()),
            columns: vec!["k".to_string(), "v".to_string()],
            ..TableBinding::default()
        };
        let doc: Document =
            serde_json::from_str(r#"{"k":1,"v":"a","more_stuff":"more_better"}"#).unwrap();
        let out = transform_document(&binding, doc).unwrap();
        assert_eq!(out.get("k"), Some(&Value::from(1)));
        assert!(out.get("more_stuff").is_none());
        let extras = out.get("extras").and_then(Value::as_object).expect("extras object");
        assert_eq!(extras.get("more_stuff"), Some(&Value::from("more_better")));
    }

    #[test]
    fn delete_key_rewrites_vector() {
        let binding = TableBinding {
            delete_key: Some(Arc::new(|mut key| {
                key.push(Value::from("suffix"));
                Ok(key)
            })),
            ..TableBinding::default()
        };
        let mut m = Mutation {
            key: Bytes::from_static(b"[1]"),
            time: Time::new(1, 0),
            ..Mutation::default()
        };
        rewrite_delete_key(&binding, &mut m).unwrap();
        assert_eq!(&m.key[..], br#"[1,"suffix"]"#);
    }

    #[test]
    fn documents_for_deletes_prefer_before_image() {
        let m = Mutation {
            key: Bytes::from_static(b"[1]"),
            before: Some(Bytes::from_static(br#"{"k":1}"#)),
            time: Time::new(1, 0),
            ..Mutation::default()
        };
        let doc = document_of(&m).unwrap();
        assert_eq!(doc.get("k"), Some(&Value::from(1)));

        let meta = meta_of(&Schema::new("s").table("T"), &m);
        assert_eq!(meta.get("table"), Some(&Value::from("T")));
        assert_eq!(meta.get("key"), Some(&serde_json::json!([1])));
    }
}
