//! In-memory fakes of the loader's collaborator seams
//!
//! The allocation-store fake reproduces the atomic-claim semantics of the
//! relational implementation (one lock acquisition per call, deterministic
//! ordering), so the coordination properties can be exercised without a
//! database.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use medbundle_loader::allocation::AllocationStore;
use medbundle_loader::error::{AllocationError, SourceError, WriteError};
use medbundle_loader::models::{
    AllocatedItem, FileType, InstanceStatus, LoaderInstance, LogicalResourceRecord, PathFilter,
    WorkItem,
};
use medbundle_loader::object_store::{OutcomeStore, PartHandle};
use medbundle_loader::source::{
    Issue, PersistenceCapability, RecordSource, RecordSourceFactory, SourceItem, SourceRecord,
    StoredRecord, Validator,
};

// ---------------------------------------------------------------------------
// Allocation store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AttemptRow {
    pub id: i64,
    pub work_item_id: i64,
    pub allocation_id: i64,
    pub loader_instance_id: Uuid,
    pub item_version: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rows_processed: Option<i64>,
    pub failure_count: Option<i64>,
    pub checkpoint: Option<Value>,
}

#[derive(Default)]
struct StoreInner {
    items: Vec<WorkItem>,
    attempts: Vec<AttemptRow>,
    instances: HashMap<Uuid, InstanceStatus>,
    records: HashMap<(String, String), LogicalResourceRecord>,
    next_allocation: i64,
    next_attempt: i64,
}

pub struct InMemoryAllocationStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryAllocationStore {
    pub fn with_items(items: Vec<WorkItem>) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                items,
                next_allocation: 1,
                next_attempt: 1,
                ..Default::default()
            }),
        }
    }

    pub fn item(&self, id: i64) -> WorkItem {
        let inner = self.inner.lock().unwrap();
        inner.items.iter().find(|i| i.id == id).cloned().unwrap()
    }

    pub fn attempt(&self, load_attempt_id: i64) -> AttemptRow {
        let inner = self.inner.lock().unwrap();
        inner
            .attempts
            .iter()
            .find(|a| a.id == load_attempt_id)
            .cloned()
            .unwrap()
    }

    pub fn resource_records(&self) -> Vec<LogicalResourceRecord> {
        let inner = self.inner.lock().unwrap();
        inner.records.values().cloned().collect()
    }

    pub fn instance_status(&self, id: Uuid) -> Option<InstanceStatus> {
        self.inner.lock().unwrap().instances.get(&id).copied()
    }

    pub fn instances(&self) -> Vec<(Uuid, InstanceStatus)> {
        let inner = self.inner.lock().unwrap();
        inner.instances.iter().map(|(id, s)| (*id, *s)).collect()
    }

    pub fn attempts_for(&self, work_item_id: i64) -> Vec<AttemptRow> {
        let inner = self.inner.lock().unwrap();
        inner
            .attempts
            .iter()
            .filter(|a| a.work_item_id == work_item_id)
            .cloned()
            .collect()
    }

    /// Simulate a liveness reclaim plus fresh allocation of one item,
    /// producing a new attempt under a new allocation run.
    pub fn reallocate(&self, work_item_id: i64, instance_id: Uuid) -> AllocatedItem {
        let mut inner = self.inner.lock().unwrap();
        let allocation_id = inner.next_allocation;
        inner.next_allocation += 1;
        let attempt_id = inner.next_attempt;
        inner.next_attempt += 1;

        let item = inner
            .items
            .iter_mut()
            .find(|i| i.id == work_item_id)
            .unwrap();
        item.allocation_id = Some(allocation_id);
        item.loader_instance_id = Some(instance_id);
        let version = item.version;
        let snapshot = item.clone();

        inner.attempts.push(AttemptRow {
            id: attempt_id,
            work_item_id,
            allocation_id,
            loader_instance_id: instance_id,
            item_version: version,
            started_at: Utc::now(),
            completed_at: None,
            rows_processed: None,
            failure_count: None,
            checkpoint: None,
        });

        AllocatedItem {
            item: snapshot,
            load_attempt_id: attempt_id,
        }
    }
}

#[async_trait]
impl AllocationStore for InMemoryAllocationStore {
    async fn register_instance(&self, instance: &LoaderInstance) -> Result<(), AllocationError> {
        let mut inner = self.inner.lock().unwrap();
        inner.instances.insert(instance.id, instance.status);
        Ok(())
    }

    async fn touch_heartbeat(&self, _instance_id: Uuid) -> Result<(), AllocationError> {
        Ok(())
    }

    async fn set_instance_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
    ) -> Result<(), AllocationError> {
        let mut inner = self.inner.lock().unwrap();
        inner.instances.insert(instance_id, status);
        Ok(())
    }

    async fn allocate_work(
        &self,
        file_type: FileType,
        instance_id: Uuid,
        max_count: i64,
        path_filters: &[PathFilter],
    ) -> Result<Vec<AllocatedItem>, AllocationError> {
        if max_count <= 0 {
            return Ok(Vec::new());
        }

        // One lock acquisition is this fake's stand-in for one atomic
        // statement.
        let mut inner = self.inner.lock().unwrap();
        let allocation_id = inner.next_allocation;
        inner.next_allocation += 1;

        let mut candidate_ids: Vec<(DateTime<Utc>, i64)> = inner
            .items
            .iter()
            .filter(|item| {
                item.allocation_id.is_none()
                    && item.file_type == file_type
                    && (path_filters.is_empty()
                        || path_filters.iter().any(|f| {
                            item.bucket == f.bucket && item.object_path.starts_with(&f.path_prefix)
                        }))
            })
            .map(|item| (item.last_modified, item.id))
            .collect();
        candidate_ids.sort();
        candidate_ids.truncate(max_count as usize);

        let mut allocated = Vec::new();
        for (_, id) in candidate_ids {
            let attempt_id = inner.next_attempt;
            inner.next_attempt += 1;

            let item = inner.items.iter_mut().find(|i| i.id == id).unwrap();
            item.allocation_id = Some(allocation_id);
            item.loader_instance_id = Some(instance_id);
            let snapshot = item.clone();
            let version = snapshot.version;

            inner.attempts.push(AttemptRow {
                id: attempt_id,
                work_item_id: id,
                allocation_id,
                loader_instance_id: instance_id,
                item_version: version,
                started_at: Utc::now(),
                completed_at: None,
                rows_processed: None,
                failure_count: None,
                checkpoint: None,
            });

            allocated.push(AllocatedItem {
                item: snapshot,
                load_attempt_id: attempt_id,
            });
        }

        Ok(allocated)
    }

    async fn work_item_size(&self, work_item_id: i64) -> Result<i64, AllocationError> {
        let inner = self.inner.lock().unwrap();
        inner
            .items
            .iter()
            .find(|i| i.id == work_item_id)
            .map(|i| i.size_bytes)
            .ok_or_else(|| AllocationError::InconsistentRow("unknown work item".to_string()))
    }

    async fn save_checkpoint(
        &self,
        load_attempt_id: i64,
        blob: &Value,
    ) -> Result<(), AllocationError> {
        let mut inner = self.inner.lock().unwrap();
        let attempt = inner
            .attempts
            .iter_mut()
            .find(|a| a.id == load_attempt_id)
            .ok_or_else(|| AllocationError::InconsistentRow("unknown attempt".to_string()))?;
        attempt.checkpoint = Some(blob.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, work_item_id: i64) -> Result<Option<Value>, AllocationError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .attempts
            .iter()
            .filter(|a| a.work_item_id == work_item_id && a.checkpoint.is_some())
            .max_by_key(|a| a.id)
            .and_then(|a| a.checkpoint.clone()))
    }

    async fn complete_attempt(
        &self,
        load_attempt_id: i64,
        rows_processed: i64,
        failure_count: i64,
    ) -> Result<(), AllocationError> {
        let mut inner = self.inner.lock().unwrap();
        let attempt = inner
            .attempts
            .iter_mut()
            .find(|a| a.id == load_attempt_id)
            .ok_or_else(|| AllocationError::InconsistentRow("unknown attempt".to_string()))?;
        attempt.completed_at = Some(Utc::now());
        attempt.rows_processed = Some(rows_processed);
        attempt.failure_count = Some(failure_count);
        Ok(())
    }

    async fn append_resource_record(
        &self,
        record: &LogicalResourceRecord,
    ) -> Result<bool, AllocationError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (record.resource_type.clone(), record.logical_id.clone());
        if inner.records.contains_key(&key) {
            return Ok(false);
        }
        inner.records.insert(key, record.clone());
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Persistence capability
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryPersistence {
    records: Mutex<HashMap<(String, String), StoredRecord>>,
    next_id: AtomicI64,
    calls: AtomicI64,
    failing: AtomicBool,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(&self, resource_type: &str, logical_id: &str) -> Option<StoredRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&(resource_type.to_string(), logical_id.to_string()))
            .cloned()
    }

    pub fn insert(&self, resource_type: &str, logical_id: &str, record: StoredRecord) {
        self.records
            .lock()
            .unwrap()
            .insert((resource_type.to_string(), logical_id.to_string()), record);
    }

    pub fn stored_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Total capability invocations (create + read + update)
    pub fn call_count(&self) -> i64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), WriteError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(WriteError::Persistence("backend unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistenceCapability for InMemoryPersistence {
    async fn create(
        &self,
        resource_type: &str,
        logical_id: &str,
        body: &Value,
    ) -> Result<(), WriteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.records.lock().unwrap().insert(
            (resource_type.to_string(), logical_id.to_string()),
            StoredRecord {
                body: body.clone(),
                generation: 1,
                deleted: false,
            },
        );
        Ok(())
    }

    async fn read(
        &self,
        resource_type: &str,
        logical_id: &str,
    ) -> Result<Option<StoredRecord>, WriteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.stored(resource_type, logical_id))
    }

    async fn update(
        &self,
        resource_type: &str,
        logical_id: &str,
        body: &Value,
        generation: i32,
    ) -> Result<(), WriteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.records.lock().unwrap().insert(
            (resource_type.to_string(), logical_id.to_string()),
            StoredRecord {
                body: body.clone(),
                generation,
                deleted: false,
            },
        );
        Ok(())
    }

    fn generate_id(&self) -> String {
        format!("gen-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Outcome store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ObjectState {
    pub parts: Vec<(i32, Vec<u8>)>,
    pub finished: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct InMemoryOutcomeStore {
    objects: Mutex<HashMap<String, ObjectState>>,
    next_upload: AtomicI64,
}

impl InMemoryOutcomeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn object_key(bucket: &str, key: &str) -> String {
        format!("{}/{}", bucket, key)
    }

    pub fn finished_object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&Self::object_key(bucket, key))
            .and_then(|o| o.finished.clone())
    }

    pub fn uploaded_parts(&self, bucket: &str, key: &str) -> Vec<(i32, Vec<u8>)> {
        self.objects
            .lock()
            .unwrap()
            .get(&Self::object_key(bucket, key))
            .map(|o| o.parts.clone())
            .unwrap_or_default()
    }

    pub fn object_exists(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains_key(&Self::object_key(bucket, key))
    }
}

#[async_trait]
impl OutcomeStore for InMemoryOutcomeStore {
    async fn start_multipart_upload(&self, bucket: &str, key: &str) -> anyhow::Result<String> {
        let mut objects = self.objects.lock().unwrap();
        objects.insert(Self::object_key(bucket, key), ObjectState::default());
        Ok(format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst)))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        _upload_id: &str,
        part_number: i32,
        bytes: Vec<u8>,
    ) -> anyhow::Result<PartHandle> {
        let mut objects = self.objects.lock().unwrap();
        let object = objects
            .get_mut(&Self::object_key(bucket, key))
            .ok_or_else(|| anyhow::anyhow!("upload not started"))?;
        object.parts.push((part_number, bytes));
        Ok(PartHandle {
            part_number,
            etag: format!("\"etag-{}\"", part_number),
        })
    }

    async fn finish_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        _upload_id: &str,
        parts: Vec<PartHandle>,
    ) -> anyhow::Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let object = objects
            .get_mut(&Self::object_key(bucket, key))
            .ok_or_else(|| anyhow::anyhow!("upload not started"))?;

        // Commit in the caller's recorded order; part numbers must be
        // strictly increasing from 1 the way the real store requires.
        let mut content = Vec::new();
        for (expected, handle) in parts.iter().enumerate() {
            anyhow::ensure!(
                handle.part_number == expected as i32 + 1,
                "part numbers not sequential"
            );
            let (_, bytes) = object
                .parts
                .iter()
                .find(|(n, _)| *n == handle.part_number)
                .ok_or_else(|| anyhow::anyhow!("unknown part {}", handle.part_number))?;
            content.extend_from_slice(bytes);
        }
        object.finished = Some(content);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Record source
// ---------------------------------------------------------------------------

pub struct VecRecordSource {
    items: Vec<SourceItem>,
    size_bytes: i64,
    loaded: i64,
    parse_failures: i64,
    /// When set, the read with this 0-based call index fails once
    fail_on_call: Option<usize>,
    calls: usize,
}

impl VecRecordSource {
    pub fn new(items: Vec<SourceItem>) -> Self {
        Self {
            size_bytes: items.len() as i64 * 100,
            items,
            loaded: 0,
            parse_failures: 0,
            fail_on_call: None,
            calls: 0,
        }
    }

    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }
}

#[async_trait]
impl RecordSource for VecRecordSource {
    async fn size(&self) -> Result<i64, SourceError> {
        Ok(self.size_bytes)
    }

    async fn read_batch(&mut self, skip: i64, max: usize) -> Result<Vec<SourceItem>, SourceError> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on_call == Some(call) {
            return Err(SourceError::Read("injected read failure".to_string()));
        }

        let start = (skip as usize).min(self.items.len());
        let end = (start + max).min(self.items.len());
        let batch: Vec<SourceItem> = self.items[start..end].to_vec();

        for item in &batch {
            match item {
                SourceItem::Record(_) => self.loaded += 1,
                SourceItem::ParseFailure { .. } => self.parse_failures += 1,
            }
        }

        Ok(batch)
    }

    fn parse_failures(&self) -> i64 {
        self.parse_failures
    }

    fn records_loaded(&self) -> i64 {
        self.loaded
    }
}

/// Hands each work item the same programmed item list
pub struct VecSourceFactory {
    data: Mutex<HashMap<i64, Vec<SourceItem>>>,
}

impl VecSourceFactory {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, work_item_id: i64, items: Vec<SourceItem>) {
        self.data.lock().unwrap().insert(work_item_id, items);
    }
}

#[async_trait]
impl RecordSourceFactory for VecSourceFactory {
    async fn open(&self, item: &WorkItem) -> Result<Box<dyn RecordSource>, SourceError> {
        let items = self
            .data
            .lock()
            .unwrap()
            .get(&item.id)
            .cloned()
            .ok_or_else(|| SourceError::Unavailable(format!("no data for item {}", item.id)))?;
        Ok(Box::new(VecRecordSource::new(items)))
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Accepts everything
pub struct PassValidator;

impl Validator for PassValidator {
    fn validate(&self, _body: &Value) -> Vec<Issue> {
        Vec::new()
    }
}

/// Rejects bodies tagged `"invalid": true`
pub struct RejectingValidator;

impl Validator for RejectingValidator {
    fn validate(&self, body: &Value) -> Vec<Issue> {
        if body.get("invalid") == Some(&Value::Bool(true)) {
            vec![Issue::error("record failed structural validation")]
        } else {
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn work_item(id: i64, object_name: &str, modified_offset_secs: i64) -> WorkItem {
    let base = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
    WorkItem {
        id,
        bucket: "ingest".to_string(),
        object_path: format!("site-a/{}", object_name),
        object_name: object_name.to_string(),
        size_bytes: 4096,
        file_type: FileType::NdJson,
        etag: None,
        last_modified: base + Duration::seconds(modified_offset_secs),
        version: 1,
        allocation_id: None,
        loader_instance_id: None,
    }
}

pub fn patient_record(logical_id: Option<&str>, line_number: i64) -> SourceItem {
    SourceItem::Record(SourceRecord {
        resource_type: "Patient".to_string(),
        logical_id: logical_id.map(str::to_string),
        body: serde_json::json!({
            "resourceType": "Patient",
            "active": true,
            "name": [{"family": format!("Line{}", line_number)}]
        }),
        line_number,
    })
}

pub fn typed_record(resource_type: &str, logical_id: Option<&str>, line_number: i64) -> SourceItem {
    SourceItem::Record(SourceRecord {
        resource_type: resource_type.to_string(),
        logical_id: logical_id.map(str::to_string),
        body: serde_json::json!({"resourceType": resource_type, "line": line_number}),
        line_number,
    })
}
