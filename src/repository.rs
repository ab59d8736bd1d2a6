use crate::error::FormPressError;
use crate::model::{Document, Template};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const IMMUTABLE_KEYS: [&str; 2] = ["id", "created_at"];

pub trait Entity: Serialize + DeserializeOwned + Clone + Send {
    /// Name of the collection the record lives in.
    const COLLECTION: &'static str;

    fn id(&self) -> &str;

    fn touch(&mut self, at: DateTime<Utc>);

    /// Invariants checked before a record is stored.
    fn validate(&self) -> Result<(), FormPressError> {
        Ok(())
    }
}

impl Entity for Document {
    const COLLECTION: &'static str = "documents";

    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

impl Entity for Template {
    const COLLECTION: &'static str = "templates";

    fn id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn validate(&self) -> Result<(), FormPressError> {
        Template::validate(self)
    }
}

pub trait Repository<E: Entity> {
    fn list(&self) -> Result<Vec<E>, FormPressError>;

    fn get(&self, id: &str) -> Result<Option<E>, FormPressError>;

    fn create(&self, entity: E) -> Result<E, FormPressError>;

    /// Merges the keys of a JSON object onto the stored record and refreshes
    /// its update timestamp.
    fn update(&self, id: &str, patch: Value) -> Result<E, FormPressError>;

    fn delete(&self, id: &str) -> Result<bool, FormPressError>;
}

// Insertion-ordered records shared by every backend.
struct RecordSet<E> {
    records: Vec<E>,
}

impl<E: Entity> RecordSet<E> {
    fn new(records: Vec<E>) -> Self {
        Self { records }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id() == id)
    }

    fn get(&self, id: &str) -> Option<E> {
        self.position(id).map(|idx| self.records[idx].clone())
    }

    fn create(&mut self, entity: E) -> Result<E, FormPressError> {
        if entity.id().trim().is_empty() {
            return Err(FormPressError::Validation(format!(
                "{} record without id",
                E::COLLECTION
            )));
        }
        if self.position(entity.id()).is_some() {
            return Err(FormPressError::Validation(format!(
                "duplicate id {} in {}",
                entity.id(),
                E::COLLECTION
            )));
        }
        entity.validate()?;
        self.records.push(entity.clone());
        Ok(entity)
    }

    fn update(&mut self, id: &str, patch: Value) -> Result<E, FormPressError> {
        let idx = self
            .position(id)
            .ok_or_else(|| FormPressError::NotFound(id.to_string()))?;
        let updated = merge_patch(&self.records[idx], patch)?;
        updated.validate()?;
        self.records[idx] = updated.clone();
        Ok(updated)
    }

    fn delete(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(idx) => {
                self.records.remove(idx);
                true
            }
            None => false,
        }
    }
}

fn merge_patch<E: Entity>(current: &E, patch: Value) -> Result<E, FormPressError> {
    let Value::Object(patch) = patch else {
        return Err(FormPressError::Validation(
            "update patch must be a JSON object".to_string(),
        ));
    };
    let mut base = match serde_json::to_value(current)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (key, value) in patch {
        if IMMUTABLE_KEYS.contains(&key.as_str()) {
            if base.get(&key) != Some(&value) {
                return Err(FormPressError::Validation(format!(
                    "field `{}` cannot be changed",
                    key
                )));
            }
            continue;
        }
        base.insert(key, value);
    }
    let mut merged: E = serde_json::from_value(Value::Object(base))
        .map_err(|err| FormPressError::Validation(err.to_string()))?;
    merged.touch(Utc::now());
    Ok(merged)
}

/// Process-local store; the default for tests and previews.
pub struct MemoryRepository<E> {
    inner: Mutex<RecordSet<E>>,
}

impl<E: Entity> MemoryRepository<E> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RecordSet::new(Vec::new())),
        }
    }

    fn with_set<T>(
        &self,
        op: impl FnOnce(&mut RecordSet<E>) -> Result<T, FormPressError>,
    ) -> Result<T, FormPressError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| FormPressError::Storage("memory store lock poisoned".to_string()))?;
        op(&mut guard)
    }
}

impl<E: Entity> Default for MemoryRepository<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> Repository<E> for MemoryRepository<E> {
    fn list(&self) -> Result<Vec<E>, FormPressError> {
        self.with_set(|set| Ok(set.records.clone()))
    }

    fn get(&self, id: &str) -> Result<Option<E>, FormPressError> {
        self.with_set(|set| Ok(set.get(id)))
    }

    fn create(&self, entity: E) -> Result<E, FormPressError> {
        self.with_set(|set| set.create(entity))
    }

    fn update(&self, id: &str, patch: Value) -> Result<E, FormPressError> {
        self.with_set(|set| set.update(id, patch))
    }

    fn delete(&self, id: &str) -> Result<bool, FormPressError> {
        self.with_set(|set| Ok(set.delete(id)))
    }
}

/// JSON-file backed store: one array of records per file, rewritten through a
/// temporary sibling file on every mutation.
pub struct JsonFileRepository<E> {
    path: PathBuf,
    lock: Mutex<()>,
    _entity: std::marker::PhantomData<fn() -> E>,
}

impl<E: Entity> JsonFileRepository<E> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            _entity: std::marker::PhantomData,
        }
    }

    /// Store at `<dir>/<collection>.json`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(format!("{}.json", E::COLLECTION)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<RecordSet<E>, FormPressError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RecordSet::new(Vec::new()));
            }
            Err(err) => return Err(self.storage_error("read", err.to_string())),
        };
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(RecordSet::new(Vec::new()));
        }
        let records: Vec<E> = serde_json::from_slice(&raw)
            .map_err(|err| self.storage_error("decode", err.to_string()))?;
        Ok(RecordSet::new(records))
    }

    fn save(&self, set: &RecordSet<E>) -> Result<(), FormPressError> {
        let bytes = serde_json::to_vec_pretty(&set.records)
            .map_err(|err| self.storage_error("encode", err.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| self.storage_error("mkdir", err.to_string()))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|err| self.storage_error("write", err.to_string()))
    }

    fn storage_error(&self, op: &str, message: String) -> FormPressError {
        tracing::warn!(
            collection = E::COLLECTION,
            path = %self.path.display(),
            op,
            error = %message,
            "repository storage failure"
        );
        FormPressError::Storage(format!("{} {}: {}", op, self.path.display(), message))
    }

    fn with_set<T>(
        &self,
        mutate: bool,
        op: impl FnOnce(&mut RecordSet<E>) -> Result<T, FormPressError>,
    ) -> Result<T, FormPressError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| FormPressError::Storage("file store lock poisoned".to_string()))?;
        let mut set = self.load()?;
        let out = op(&mut set)?;
        if mutate {
            self.save(&set)?;
        }
        Ok(out)
    }
}

impl<E: Entity> Repository<E> for JsonFileRepository<E> {
    fn list(&self) -> Result<Vec<E>, FormPressError> {
        self.with_set(false, |set| Ok(set.records.clone()))
    }

    fn get(&self, id: &str) -> Result<Option<E>, FormPressError> {
        self.with_set(false, |set| Ok(set.get(id)))
    }

    fn create(&self, entity: E) -> Result<E, FormPressError> {
        self.with_set(true, |set| set.create(entity))
    }

    fn update(&self, id: &str, patch: Value) -> Result<E, FormPressError> {
        self.with_set(true, |set| set.update(id, patch))
    }

    fn delete(&self, id: &str) -> Result<bool, FormPressError> {
        self.with_set(true, |set| Ok(set.delete(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FieldKind, FieldValue, Status};
    use serde_json::json;

    fn exercise_crud(repo: &dyn Repository<Document>) {
        let doc = Document::new("Checklist");
        let id = doc.id.clone();
        let created_at = doc.created_at;
        repo.create(doc.clone()).unwrap();
        assert!(repo.create(doc).is_err(), "duplicate ids are rejected");

        let updated = repo
            .update(
                &id,
                json!({
                    "title": "Checklist de obra",
                    "cancelled": true,
                    "values": {"obs": {"type": "text", "value": "ok"}}
                }),
            )
            .unwrap();
        assert_eq!(updated.title, "Checklist de obra");
        assert!(updated.cancelled);
        assert_eq!(updated.created_at, created_at);
        assert!(updated.updated_at >= created_at);
        assert_eq!(updated.value("obs"), &FieldValue::Text("ok".into()));

        let fetched = repo.get(&id).unwrap().unwrap();
        assert_eq!(fetched.title, "Checklist de obra");
        assert_eq!(repo.list().unwrap().len(), 1);

        assert!(repo.delete(&id).unwrap());
        assert!(!repo.delete(&id).unwrap());
        assert!(repo.get(&id).unwrap().is_none());
    }

    #[test]
    fn memory_repository_supports_crud() {
        exercise_crud(&MemoryRepository::<Document>::new());
    }

    #[test]
    fn file_repository_supports_crud_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::<Document>::in_dir(dir.path());
        exercise_crud(&repo);

        let doc = Document::new("Persistido");
        let id = doc.id.clone();
        repo.create(doc).unwrap();
        let reopened = JsonFileRepository::<Document>::in_dir(dir.path());
        assert_eq!(reopened.get(&id).unwrap().unwrap().title, "Persistido");
        assert!(reopened.path().ends_with("documents.json"));
    }

    #[test]
    fn update_rejects_identity_changes_and_bad_types() {
        let repo = MemoryRepository::<Document>::new();
        let doc = repo.create(Document::new("A")).unwrap();
        let err = repo.update(&doc.id, json!({"id": "other"})).unwrap_err();
        assert!(matches!(err, FormPressError::Validation(_)));
        let err = repo.update(&doc.id, json!({"cancelled": "yes"})).unwrap_err();
        assert!(matches!(err, FormPressError::Validation(_)));
        let err = repo.update(&doc.id, json!(["not", "an", "object"])).unwrap_err();
        assert!(matches!(err, FormPressError::Validation(_)));
        let err = repo.update("missing", json!({})).unwrap_err();
        assert!(matches!(err, FormPressError::NotFound(_)));
    }

    fn two_field_template() -> Template {
        let mut template = Template::new("Vistoria");
        let section = template.add_section("Dados");
        template
            .add_field(&section, Field::new("a", FieldKind::Text, "A"))
            .unwrap();
        template
            .add_field(&section, Field::new("b", FieldKind::Text, "B"))
            .unwrap();
        template
    }

    #[test]
    fn template_patches_cannot_break_field_invariants() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::<Template>::in_dir(dir.path());
        let template = repo.create(two_field_template()).unwrap();

        let mut sections = serde_json::to_value(&template.sections).unwrap();
        sections[0]["fields"][1]["id"] = json!("a");
        let err = repo
            .update(&template.id, json!({ "sections": sections }))
            .unwrap_err();
        assert!(matches!(err, FormPressError::Validation(ref msg) if msg.contains("duplicate")));

        let mut sections = serde_json::to_value(&template.sections).unwrap();
        sections[0]["fields"][1]["order"] = sections[0]["fields"][0]["order"].clone();
        let err = repo
            .update(&template.id, json!({ "sections": sections }))
            .unwrap_err();
        assert!(matches!(err, FormPressError::Validation(_)));

        let stored = repo.get(&template.id).unwrap().unwrap();
        assert_eq!(stored.sections, template.sections);
    }

    #[test]
    fn invalid_templates_are_not_created() {
        let repo = MemoryRepository::<Template>::new();
        let mut template = two_field_template();
        let copy = template.sections[0].fields[0].clone();
        template.sections[0].fields.push(copy);
        assert!(matches!(
            repo.create(template),
            Err(FormPressError::Validation(_))
        ));
        assert!(repo.list().unwrap().is_empty());
    }

    #[test]
    fn status_flag_marks_deleted_without_removing() {
        let repo = MemoryRepository::<Document>::new();
        let doc = repo.create(Document::new("A")).unwrap();
        let updated = repo.update(&doc.id, json!({"status": "deleted"})).unwrap();
        assert_eq!(updated.status, Status::Deleted);
        assert_eq!(repo.list().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_file_surfaces_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("documents.json");
        std::fs::write(&path, b"{not json").unwrap();
        let repo = JsonFileRepository::<Document>::new(&path);
        assert!(matches!(repo.list(), Err(FormPressError::Storage(_))));
    }
}
