//! In-process document engine.
//!
//! Collections are vectors of BSON documents behind one lock. Predicates
//! support the operators the filter compiler emits (`$and`, `$eq`, `$ne`,
//! `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$regex` with `$options`, `$not`);
//! updates support `$set`, `$setOnInsert`, `$unset` and whole-document
//! replacement. Only `_id` is unique.
//!
//! A session works on a snapshot of every collection. Committing publishes
//! only the collections the session wrote to, so writes made elsewhere to
//! other collections survive; the last commit wins per collection.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, Document};
use parking_lot::RwLock;
use regex::RegexBuilder;

use super::{DocumentDriver, FindSpec, UpsertOp};
use crate::error::{BoxError, BulkWriteError, BulkWriteFailure, StoreError, StoreResult};
use crate::filter::document::ID_KEY;
use crate::store::{BulkWriteResult, UpdateResult};
use crate::value::Value;

type Collections = HashMap<String, Vec<Document>>;

#[derive(Debug, Clone)]
pub struct MemoryDriver {
    collections: Arc<RwLock<Collections>>,
    transactions: bool,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of every collection taken when the session started, plus the
/// names of the collections written through it.
#[derive(Debug)]
pub struct MemorySession {
    collections: Collections,
    written: HashSet<String>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
            transactions: true,
        }
    }

    /// Whether [`start_session`](DocumentDriver::start_session) succeeds.
    /// Disabled, the driver behaves like a standalone server.
    pub fn transactions(mut self, enabled: bool) -> Self {
        self.transactions = enabled;
        self
    }

    /// Every document of a collection, in insertion order.
    pub fn dump(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    fn read<R>(&self, session: Option<&mut MemorySession>, f: impl FnOnce(&Collections) -> R) -> R {
        match session {
            Some(session) => f(&session.collections),
            None => f(&*self.collections.read()),
        }
    }

    fn write<R>(
        &self,
        session: Option<&mut MemorySession>,
        collection: &str,
        f: impl FnOnce(&mut Vec<Document>) -> R,
    ) -> R {
        match session {
            Some(session) => {
                session.written.insert(collection.to_string());
                f(session.collections.entry(collection.to_string()).or_default())
            }
            None => {
                let mut guard = self.collections.write();
                f(guard.entry(collection.to_string()).or_default())
            }
        }
    }
}

#[async_trait]
impl DocumentDriver for MemoryDriver {
    type Session = MemorySession;

    async fn find(
        &self,
        session: Option<&mut MemorySession>,
        collection: &str,
        filter: Document,
        spec: FindSpec,
    ) -> StoreResult<Vec<Document>> {
        let mut found = self.read(session, |all| -> StoreResult<Vec<Document>> {
            let mut found = Vec::new();
            for doc in all.get(collection).into_iter().flatten() {
                if matches(doc, &filter)? {
                    found.push(doc.clone());
                }
            }
            Ok(found)
        })?;

        if let Some(sort) = &spec.sort {
            found.sort_by(|a, b| compare_by(a, b, sort));
        }
        let skip = usize::try_from(spec.skip).unwrap_or(usize::MAX);
        let found = found.into_iter().skip(skip);
        Ok(match spec.limit {
            limit if limit > 0 => found.take(limit as usize).collect(),
            _ => found.collect(),
        })
    }

    async fn count(
        &self,
        session: Option<&mut MemorySession>,
        collection: &str,
        filter: Document,
    ) -> StoreResult<u64> {
        self.read(session, |all| -> StoreResult<u64> {
            let mut count = 0;
            for doc in all.get(collection).into_iter().flatten() {
                if matches(doc, &filter)? {
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    async fn insert_one(
        &self,
        session: Option<&mut MemorySession>,
        collection: &str,
        document: Document,
    ) -> StoreResult<Bson> {
        self.write(session, collection, |docs| insert(docs, document))
    }

    async fn insert_many(
        &self,
        session: Option<&mut MemorySession>,
        collection: &str,
        documents: Vec<Document>,
        ordered: bool,
    ) -> StoreResult<Vec<Bson>> {
        self.write(session, collection, |docs| {
            let mut ids = Vec::with_capacity(documents.len());
            let mut partial = BulkWriteResult::default();
            let mut failures = Vec::new();

            for (index, document) in documents.into_iter().enumerate() {
                match insert(docs, document) {
                    Ok(id) => {
                        partial.inserted_count += 1;
                        ids.push(id);
                    }
                    Err(err) => {
                        failures.push(BulkWriteFailure {
                            index,
                            message: err.to_string(),
                        });
                        if ordered {
                            break;
                        }
                    }
                }
            }

            if failures.is_empty() {
                Ok(ids)
            } else {
                Err(StoreError::BulkWrite(Box::new(BulkWriteError {
                    partial,
                    failures,
                    ordered,
                })))
            }
        })
    }

    async fn update_one(
        &self,
        session: Option<&mut MemorySession>,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> StoreResult<UpdateResult> {
        self.write(session, collection, |docs| update_one(docs, &filter, &update, upsert))
    }

    async fn update_many(
        &self,
        session: Option<&mut MemorySession>,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> StoreResult<UpdateResult> {
        self.write(session, collection, |docs| -> StoreResult<UpdateResult> {
            let mut result = UpdateResult::default();
            for doc in docs.iter_mut() {
                if matches(doc, &filter)? {
                    result.matched_count += 1;
                    if apply_update(doc, &update, false)? {
                        result.modified_count += 1;
                    }
                }
            }
            Ok(result)
        })
    }

    async fn delete_one(
        &self,
        session: Option<&mut MemorySession>,
        collection: &str,
        filter: Document,
    ) -> StoreResult<u64> {
        self.write(session, collection, |docs| -> StoreResult<u64> {
            for index in 0..docs.len() {
                if matches(&docs[index], &filter)? {
                    docs.remove(index);
                    return Ok(1);
                }
            }
            Ok(0)
        })
    }

    async fn delete_many(
        &self,
        session: Option<&mut MemorySession>,
        collection: &str,
        filter: Document,
    ) -> StoreResult<u64> {
        self.write(session, collection, |docs| -> StoreResult<u64> {
            let mut doomed = Vec::with_capacity(docs.len());
            for doc in docs.iter() {
                doomed.push(matches(doc, &filter)?);
            }
            let before = docs.len();
            let mut doomed = doomed.into_iter();
            docs.retain(|_| !doomed.next().unwrap_or(false));
            Ok((before - docs.len()) as u64)
        })
    }

    async fn bulk_upsert(
        &self,
        session: Option<&mut MemorySession>,
        collection: &str,
        ops: Vec<UpsertOp>,
        ordered: bool,
    ) -> StoreResult<BulkWriteResult> {
        self.write(session, collection, |docs| {
            let mut partial = BulkWriteResult::default();
            let mut failures = Vec::new();

            for (index, op) in ops.iter().enumerate() {
                match update_one(docs, &op.filter, &op.update, true) {
                    Ok(result) => partial.record_upsert(index, &result),
                    Err(err) => {
                        failures.push(BulkWriteFailure {
                            index,
                            message: err.to_string(),
                        });
                        if ordered {
                            break;
                        }
                    }
                }
            }

            if failures.is_empty() {
                Ok(partial)
            } else {
                Err(StoreError::BulkWrite(Box::new(BulkWriteError {
                    partial,
                    failures,
                    ordered,
                })))
            }
        })
    }

    async fn start_session(&self) -> StoreResult<MemorySession> {
        if !self.transactions {
            return Err(StoreError::TransactionUnsupported(
                "in-memory driver built without transactions".into(),
            ));
        }
        Ok(MemorySession {
            collections: self.collections.read().clone(),
            written: HashSet::new(),
        })
    }

    async fn commit(&self, session: MemorySession) -> Result<(), BoxError> {
        let MemorySession {
            mut collections,
            written,
        } = session;
        let mut published = self.collections.write();
        for name in written {
            if let Some(docs) = collections.remove(&name) {
                published.insert(name, docs);
            }
        }
        Ok(())
    }

    async fn abort(&self, session: MemorySession) -> Result<(), BoxError> {
        drop(session);
        Ok(())
    }
}

// ============================================================================
// Writes
// ============================================================================

fn insert(docs: &mut Vec<Document>, mut document: Document) -> StoreResult<Bson> {
    let id = match document.get(ID_KEY) {
        Some(id) if *id != Bson::Null => id.clone(),
        _ => {
            let id = Bson::ObjectId(ObjectId::new());
            document.insert(ID_KEY, id.clone());
            id
        }
    };
    if docs.iter().any(|d| d.get(ID_KEY).is_some_and(|existing| equals(existing, &id))) {
        return Err(StoreError::DuplicateKey(format!("_id {}", id)));
    }
    docs.push(document);
    Ok(id)
}

fn update_one(docs: &mut Vec<Document>, filter: &Document, update: &Document, upsert: bool) -> StoreResult<UpdateResult> {
    for doc in docs.iter_mut() {
        if matches(doc, filter)? {
            let modified = apply_update(doc, update, false)?;
            return Ok(UpdateResult {
                matched_count: 1,
                modified_count: u64::from(modified),
                ..Default::default()
            });
        }
    }
    if !upsert {
        return Ok(UpdateResult::default());
    }

    let mut document = Document::new();
    seed_from_filter(&mut document, filter);
    apply_update(&mut document, update, true)?;
    let id = insert(docs, document)?;
    Ok(UpdateResult {
        upserted_count: 1,
        upserted_id: Some(Value::from(id)),
        ..Default::default()
    })
}

/// Copy the equality conditions of an upsert filter into the new document.
fn seed_from_filter(document: &mut Document, filter: &Document) {
    for (key, condition) in filter {
        if key == "$and" {
            if let Bson::Array(parts) = condition {
                for part in parts {
                    if let Bson::Document(part) = part {
                        seed_from_filter(document, part);
                    }
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        match condition {
            Bson::Document(ops) if is_operator_doc(ops) => {
                if let Some(value) = ops.get("$eq") {
                    document.insert(key.clone(), value.clone());
                }
            }
            value => {
                document.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Apply an update document, returning whether `doc` changed.
fn apply_update(doc: &mut Document, update: &Document, inserting: bool) -> StoreResult<bool> {
    let before = doc.clone();

    if !is_operator_doc(update) {
        let id = doc.get(ID_KEY).cloned();
        *doc = update.clone();
        if let Some(id) = id {
            doc.insert(ID_KEY, id);
        }
        return Ok(*doc != before);
    }

    for (op, fields) in update {
        let fields = match fields {
            Bson::Document(fields) => fields,
            other => {
                return Err(StoreError::validation(format!(
                    "`{}` expects a document, got {}",
                    op, other
                )));
            }
        };
        match op.as_str() {
            "$set" => {
                for (key, value) in fields {
                    doc.insert(key.clone(), value.clone());
                }
            }
            "$setOnInsert" if inserting => {
                for (key, value) in fields {
                    doc.insert(key.clone(), value.clone());
                }
            }
            "$setOnInsert" => {}
            "$unset" => {
                for key in fields.keys() {
                    doc.remove(key);
                }
            }
            other => {
                return Err(StoreError::validation(format!("unsupported update operator `{}`", other)));
            }
        }
    }
    Ok(*doc != before)
}

// ============================================================================
// Predicates
// ============================================================================

fn is_operator_doc(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn matches(doc: &Document, filter: &Document) -> StoreResult<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let Bson::Array(parts) = condition else {
                    return Err(StoreError::validation("`$and` expects an array"));
                };
                let mut all = true;
                for part in parts {
                    let Bson::Document(part) = part else {
                        return Err(StoreError::validation("`$and` entries must be documents"));
                    };
                    if !matches(doc, part)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            _ => {
                let field = doc.get(key);
                match condition {
                    Bson::Document(ops) if is_operator_doc(ops) => evaluate(field, ops)?,
                    expected => equals(field.unwrap_or(&Bson::Null), expected),
                }
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn evaluate(field: Option<&Bson>, ops: &Document) -> StoreResult<bool> {
    let value = field.unwrap_or(&Bson::Null);

    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => equals(value, operand),
            "$ne" => !equals(value, operand),
            "$gt" => compare(value, operand) == Some(Ordering::Greater),
            "$gte" => matches!(compare(value, operand), Some(Ordering::Greater | Ordering::Equal)),
            "$lt" => compare(value, operand) == Some(Ordering::Less),
            "$lte" => matches!(compare(value, operand), Some(Ordering::Less | Ordering::Equal)),
            "$in" => match operand {
                Bson::Array(items) => items.iter().any(|item| equals(value, item)),
                _ => return Err(StoreError::validation("`$in` expects an array")),
            },
            "$regex" => {
                let options = ops.get_str("$options").unwrap_or("");
                regex_match(value, operand, options)?
            }
            "$options" => true,
            "$not" => match operand {
                Bson::Document(inner) => !evaluate(field, inner)?,
                _ => return Err(StoreError::validation("`$not` expects an operator document")),
            },
            other => {
                return Err(StoreError::validation(format!("unsupported query operator `{}`", other)));
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn regex_match(value: &Bson, pattern: &Bson, options: &str) -> StoreResult<bool> {
    let Bson::String(pattern) = pattern else {
        return Err(StoreError::validation("`$regex` expects a string pattern"));
    };
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .dot_matches_new_line(options.contains('s'))
        .multi_line(options.contains('m'))
        .build()
        .map_err(|e| StoreError::validation(format!("invalid pattern `{}`: {}", pattern, e)))?;
    Ok(match value {
        Bson::String(s) => regex.is_match(s),
        _ => false,
    })
}

fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(f) => Some(*f),
        _ => None,
    }
}

fn equals(a: &Bson, b: &Bson) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering between values of the same kind; `None` across kinds.
fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.cmp(y)),
        (Bson::Binary(x), Bson::Binary(y)) => Some(x.bytes.cmp(&y.bytes)),
        _ => None,
    }
}

/// Position of a value kind in the cross-type sort order.
fn rank(value: &Bson) -> u8 {
    match value {
        Bson::Null | Bson::Undefined => 0,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 1,
        Bson::String(_) | Bson::Symbol(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::Binary(_) => 5,
        Bson::ObjectId(_) => 6,
        Bson::Boolean(_) => 7,
        Bson::DateTime(_) => 8,
        Bson::Timestamp(_) => 9,
        _ => 10,
    }
}

fn compare_by(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (key, direction) in sort {
        let x = a.get(key).unwrap_or(&Bson::Null);
        let y = b.get(key).unwrap_or(&Bson::Null);
        let ordering = rank(x)
            .cmp(&rank(y))
            .then_with(|| compare(x, y).unwrap_or(Ordering::Equal));
        let ordering = match as_number(direction) {
            Some(d) if d < 0.0 => ordering.reverse(),
            _ => ordering,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
