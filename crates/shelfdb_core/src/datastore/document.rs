//! Documents, queries and updates.
//!
//! The query engine is deliberately small: field equality on dot paths.

use crate::error::{CoreError, CoreResult};
use serde_json::{Map, Value};

/// A stored document.
pub type Document = Map<String, Value>;

/// Name of the identifier field.
pub const ID_FIELD: &str = "_id";

/// Returns the `_id` of a document, if it is a string.
#[must_use]
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

/// Generates a fresh document id.
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Looks up a dot-separated path such as `address.city`.
#[must_use]
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> CoreResult<()> {
    let (parents, last) = match path.rsplit_once('.') {
        Some((parents, last)) => (Some(parents), last),
        None => (None, path),
    };
    let mut target = doc;
    if let Some(parents) = parents {
        for part in parents.split('.') {
            let slot = target
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            target = slot.as_object_mut().ok_or_else(|| {
                CoreError::invalid_document(format!("cannot set {path}: {part} is not an object"))
            })?;
        }
    }
    target.insert(last.to_string(), value);
    Ok(())
}

/// Checks field names and the `_id` type.
///
/// # Errors
///
/// Returns `InvalidDocument` for `$`-prefixed or dotted field names, or a
/// non-string `_id`.
pub fn validate(doc: &Document) -> CoreResult<()> {
    if let Some(id) = doc.get(ID_FIELD) {
        if !id.is_string() {
            return Err(CoreError::invalid_document("_id must be a string"));
        }
    }
    validate_fields(doc)
}

fn validate_fields(map: &Document) -> CoreResult<()> {
    for (key, value) in map {
        if key.starts_with('$') {
            return Err(CoreError::invalid_document(format!(
                "field names cannot begin with '$': {key}"
            )));
        }
        if key.contains('.') {
            return Err(CoreError::invalid_document(format!(
                "field names cannot contain '.': {key}"
            )));
        }
        if let Value::Object(inner) = value {
            validate_fields(inner)?;
        }
    }
    Ok(())
}

/// Field-equality query. An empty query matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    conditions: Vec<(String, Value)>,
}

impl Query {
    /// Matches every document.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches documents whose `_id` equals `id`.
    #[must_use]
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::all().field(ID_FIELD, Value::String(id.into()))
    }

    /// Adds an equality condition on a dot path.
    #[must_use]
    pub fn field(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((path.into(), value.into()));
        self
    }

    /// Builds a query from a JSON object of `path: value` pairs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `value` is not an object.
    pub fn from_json(value: Value) -> CoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self {
                conditions: map.into_iter().collect(),
            }),
            other => Err(CoreError::invalid_operation(format!(
                "query must be an object, got {other}"
            ))),
        }
    }

    /// Returns true if `doc` satisfies every condition.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions
            .iter()
            .all(|(path, expected)| get_path(doc, path) == Some(expected))
    }

    /// Builds the document an upsert inserts when nothing matched.
    fn seed_document(&self) -> CoreResult<Document> {
        let mut doc = Document::new();
        for (path, value) in &self.conditions {
            set_path(&mut doc, path, value.clone())?;
        }
        Ok(doc)
    }
}

/// How matched documents are modified.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Replace the whole document, keeping its `_id`.
    Replace(Document),
    /// Set individual dot-path fields.
    Set(Map<String, Value>),
}

impl Update {
    /// Applies this update to `doc`, returning the new document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDocument` if the result is invalid or the update tries
    /// to change `_id`.
    pub fn apply(&self, doc: &Document) -> CoreResult<Document> {
        let id = doc.get(ID_FIELD).cloned();
        let mut next = match self {
            Self::Replace(replacement) => replacement.clone(),
            Self::Set(fields) => {
                let mut next = doc.clone();
                for (path, value) in fields {
                    set_path(&mut next, path, value.clone())?;
                }
                next
            }
        };
        match (&id, next.get(ID_FIELD)) {
            (Some(old), Some(new)) if old != new => {
                return Err(CoreError::invalid_document("cannot change _id"));
            }
            (Some(old), None) => {
                next.insert(ID_FIELD.to_string(), old.clone());
            }
            _ => {}
        }
        validate(&next)?;
        Ok(next)
    }

    /// Builds the document inserted by an upsert matching nothing.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDocument` if the result is invalid.
    pub fn upsert_document(&self, query: &Query) -> CoreResult<Document> {
        match self {
            Self::Replace(replacement) => {
                validate(replacement)?;
                Ok(replacement.clone())
            }
            Self::Set(_) => {
                let seed = query.seed_document()?;
                self.apply(&seed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn ids_are_simple_uuids() {
        let id = new_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_id());
    }

    #[test]
    fn dot_paths() {
        let d = doc(json!({"a": {"b": {"c": 3}}, "x": 1}));
        assert_eq!(get_path(&d, "a.b.c"), Some(&json!(3)));
        assert_eq!(get_path(&d, "x"), Some(&json!(1)));
        assert_eq!(get_path(&d, "x.y"), None);
        assert_eq!(get_path(&d, "missing"), None);
    }

    #[test]
    fn query_equality() {
        let d = doc(json!({"_id": "1", "name": "ada", "tags": {"lang": "en"}}));
        assert!(Query::all().matches(&d));
        assert!(Query::by_id("1").matches(&d));
        assert!(Query::all().field("tags.lang", "en").field("name", "ada").matches(&d));
        assert!(!Query::all().field("name", "bob").matches(&d));
        assert!(Query::from_json(json!({"name": "ada"})).unwrap().matches(&d));
        assert!(Query::from_json(json!([1])).is_err());
    }

    #[test]
    fn validation_rules() {
        assert!(validate(&doc(json!({"_id": "a", "ok": {"nested": 1}}))).is_ok());
        assert!(validate(&doc(json!({"_id": 3}))).is_err());
        assert!(validate(&doc(json!({"$bad": 1}))).is_err());
        assert!(validate(&doc(json!({"a": {"b.c": 1}}))).is_err());
    }

    #[test]
    fn set_update_keeps_other_fields() {
        let d = doc(json!({"_id": "1", "a": 1, "n": {"x": 1}}));
        let update = Update::Set(doc(json!({"a": 2, "n.y": 3})));
        let next = update.apply(&d).unwrap();
        assert_eq!(Value::Object(next), json!({"_id": "1", "a": 2, "n": {"x": 1, "y": 3}}));
    }

    #[test]
    fn replace_keeps_id() {
        let d = doc(json!({"_id": "1", "a": 1}));
        let next = Update::Replace(doc(json!({"b": 2}))).apply(&d).unwrap();
        assert_eq!(Value::Object(next), json!({"_id": "1", "b": 2}));

        let err = Update::Replace(doc(json!({"_id": "2"}))).apply(&d).unwrap_err();
        assert!(matches!(err, CoreError::InvalidDocument { .. }));
    }

    #[test]
    fn upsert_seeds_from_query() {
        let query = Query::all().field("user.name", "ada");
        let update = Update::Set(doc(json!({"visits": 1})));
        let seeded = update.upsert_document(&query).unwrap();
        assert_eq!(Value::Object(seeded), json!({"user": {"name": "ada"}, "visits": 1}));
    }
}
