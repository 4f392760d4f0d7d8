//! End-to-end tests for the mapping engine over the in-memory backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use uuid::Uuid;

use tablemap::{
    Cascade, ColumnDescriptor, ColumnKind, Condition, DatabaseManager, EngineConfig,
    GeneratorDescriptor, JoinKind, LifecycleError, MemoryBackend, OrmError, QueryBuilder,
    QuerySpec, Record, ReferenceDescriptor, Result, Row, SequenceSpec, SortDirection,
    StorageBackend, TableDescriptor, Value, VerifyProvider,
};

fn customer_descriptor() -> TableDescriptor {
    TableDescriptor::new("customer", "customers")
        .column(ColumnDescriptor::new("id", ColumnKind::Number).primary_key())
        .column(ColumnDescriptor::new("name", ColumnKind::Text).not_null())
}

fn order_descriptor() -> TableDescriptor {
    TableDescriptor::new("order", "orders")
        .column(ColumnDescriptor::new("id", ColumnKind::Number).primary_key())
        .column(ColumnDescriptor::new("total", ColumnKind::decimal(10, 2)))
        .column(ColumnDescriptor::new("customer_id", ColumnKind::Number))
        .column(ColumnDescriptor::new("notes", ColumnKind::Text).lazy())
        .reference(
            ReferenceDescriptor::new("customer", "customer", vec![(
                "customer_id".into(),
                "id".into(),
            )])
            .cascade(Cascade::Delete),
        )
        .generator(GeneratorDescriptor::Sequence(
            SequenceSpec::new("order_seq"),
        ))
}

fn key(id: i64) -> Row {
    let mut params = Row::new();
    params.insert("id".into(), Value::Int(id));
    params
}

fn customer(id: i64, name: &str) -> Record {
    let mut record = Record::new("customer");
    record.set("id", id);
    record.set("name", name);
    record
}

fn order(total: i64, customer_id: i64, notes: &str) -> Record {
    let mut record = Record::new("order");
    record.set("total", Decimal::from(total));
    record.set("customer_id", customer_id);
    record.set("notes", notes);
    record
}

/// A manager over a fresh in-memory backend with customers and orders
/// registered and seeded.
fn seeded_manager() -> DatabaseManager {
    let manager = DatabaseManager::new(Arc::new(MemoryBackend::new()), EngineConfig::default());
    manager.initialize();
    manager
        .register_tables([customer_descriptor(), order_descriptor()])
        .unwrap();

    let client = manager.generate_client();
    let mut customers = [
        customer(1, "Alice"),
        customer(2, "Amanda"),
        customer(3, "Bruno"),
    ];
    client.save_records(&mut customers).unwrap();

    let mut orders = [
        order(250, 1, "gift wrap"),
        order(120, 2, "expedite"),
        order(75, 3, "none"),
        order(410, 2, "fragile"),
    ];
    client.save_records(&mut orders).unwrap();
    client.end_transactional().unwrap();
    manager
}

// ==================== Join / Filter / Order Scenario ====================

#[test]
fn test_join_filter_order_scenario() {
    let manager = seeded_manager();
    let registry = manager.registry();

    let spec = QueryBuilder::new(registry, "order")
        .unwrap()
        .join(JoinKind::Inner, "order", "customer", &[("customer_id", "id")])
        .unwrap()
        .filter(Condition::like(registry, "customer", "name", "A%").unwrap())
        .unwrap()
        .order_by("order", "total", 1, SortDirection::Desc)
        .unwrap()
        .confirm()
        .unwrap();

    let results = manager.read_only_client().query(&spec).unwrap();
    assert_eq!(results.total, 3);

    let totals: Vec<Value> = results
        .records
        .iter()
        .map(|r| r.peek("total").cloned().unwrap())
        .collect();
    assert_eq!(
        totals,
        vec![
            Value::Decimal(Decimal::from(410)),
            Value::Decimal(Decimal::from(250)),
            Value::Decimal(Decimal::from(120)),
        ]
    );
}

#[test]
fn test_query_total_matches_unpaged_query() {
    let manager = seeded_manager();
    let registry = manager.registry();
    let client = manager.read_only_client();

    let spec = QueryBuilder::new(registry, "order")
        .unwrap()
        .filter(Condition::ge(registry, "order", "total", 100i64).unwrap())
        .unwrap()
        .page(1, u64::MAX)
        .unwrap()
        .confirm()
        .unwrap();

    let total = client.query_total(&spec).unwrap();
    let results = client.query(&spec).unwrap();
    assert_eq!(total, results.records.len() as u64);
    assert_eq!(total, 3);
}

#[test]
fn test_pager_windows_results() {
    let manager = seeded_manager();
    let registry = manager.registry();
    let client = manager.read_only_client();

    let spec = QueryBuilder::new(registry, "order")
        .unwrap()
        .order_by("order", "total", 1, SortDirection::Asc)
        .unwrap()
        .page(2, 2)
        .unwrap()
        .confirm()
        .unwrap();

    let results = client.query(&spec).unwrap();
    assert_eq!(results.total, 4);
    assert_eq!(results.records.len(), 2);
    assert_eq!(results.page, 2);
    assert_eq!(
        results.records[0].peek("total"),
        Some(&Value::Decimal(Decimal::from(250)))
    );
}

// ==================== Sequence Generation ====================

#[test]
fn test_sequence_assigns_keys_in_order() {
    let manager = seeded_manager();
    let client = manager.read_only_client();

    // Seeding issued 1..=4 from the order sequence.
    for expected in 1..=4 {
        let record = client
            .retrieve(key(expected), "order", false)
            .unwrap()
            .unwrap();
        assert_eq!(record.peek("id"), Some(&Value::Int(expected)));
    }
}

// ==================== Record Lifecycle ====================

#[test]
fn test_data_modified_truth_table() {
    let manager = seeded_manager();
    let client = manager.generate_client();

    // A new record with no writes is still considered modified.
    let fresh = Record::new("order");
    assert!(fresh.data_modified());

    // An attached, unmodified record is not.
    let mut attached = client.retrieve(key(1), "order", true).unwrap().unwrap();
    assert!(!attached.data_modified());

    // Overwriting a loaded field makes it dirty.
    attached.set("total", Decimal::from(300));
    assert!(attached.data_modified());

    client.end_transactional().unwrap();
}

#[test]
fn test_update_persists_modified_fields_only() {
    let manager = seeded_manager();
    let client = manager.generate_client();

    let mut record = client.retrieve(key(1), "order", true).unwrap().unwrap();
    record.set("total", Decimal::from(999));
    client.update_records(std::slice::from_mut(&mut record)).unwrap();
    client.end_transactional().unwrap();

    let reread = manager
        .read_only_client()
        .retrieve(key(1), "order", false)
        .unwrap()
        .unwrap();
    assert_eq!(reread.peek("total"), Some(&Value::Decimal(Decimal::from(999))));
    assert_eq!(reread.peek("customer_id"), Some(&Value::Int(1)));
}

#[test]
fn test_update_requires_modified_data() {
    let manager = seeded_manager();
    let client = manager.generate_client();

    let mut record = client.retrieve(key(1), "order", true).unwrap().unwrap();
    let result = client.update_records(std::slice::from_mut(&mut record));
    assert!(matches!(
        result,
        Err(OrmError::Lifecycle(LifecycleError::IllegalState { .. }))
    ));
}

#[test]
fn test_retrieve_for_update_binds_transaction() {
    let manager = seeded_manager();
    let client = manager.generate_client();
    let code = client.transactional_code().unwrap();

    let record = client.retrieve(key(1), "order", true).unwrap().unwrap();
    assert!(record.state().for_update());
    assert_eq!(record.state().transactional_code(), Some(code));

    client.end_transactional().unwrap();
}

#[test]
fn test_read_only_client_rejects_writes() {
    let manager = seeded_manager();
    let client = manager.read_only_client();

    let mut record = customer(9, "Zoe");
    assert!(client.save_records(std::slice::from_mut(&mut record)).is_err());
    assert!(client.retrieve(key(1), "order", true).is_err());
}

// ==================== Lazy Resolution ====================

/// Counts backend fetches so lazy idempotence is observable.
struct CountingBackend {
    inner: MemoryBackend,
    fetches: AtomicUsize,
}

impl StorageBackend for CountingBackend {
    fn drop_table(&self, table: &TableDescriptor) -> std::result::Result<(), tablemap::ExecError> {
        self.inner.drop_table(table)
    }

    fn insert(
        &self,
        table: &TableDescriptor,
        rows: Vec<Row>,
        txn: Option<Uuid>,
    ) -> std::result::Result<usize, tablemap::ExecError> {
        self.inner.insert(table, rows, txn)
    }

    fn update(
        &self,
        table: &TableDescriptor,
        key: &Row,
        changes: &Row,
        txn: Option<Uuid>,
    ) -> std::result::Result<u64, tablemap::ExecError> {
        self.inner.update(table, key, changes, txn)
    }

    fn delete(
        &self,
        table: &TableDescriptor,
        key: &Row,
        txn: Option<Uuid>,
    ) -> std::result::Result<u64, tablemap::ExecError> {
        self.inner.delete(table, key, txn)
    }

    fn fetch(
        &self,
        table: &TableDescriptor,
        params: &Row,
        lock: Option<Uuid>,
    ) -> std::result::Result<Option<Row>, tablemap::ExecError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(table, params, lock)
    }

    fn select(
        &self,
        spec: &QuerySpec,
        registry: &tablemap::Registry,
        lock: Option<Uuid>,
    ) -> std::result::Result<Vec<tablemap::QueryRow>, tablemap::ExecError> {
        self.inner.select(spec, registry, lock)
    }

    fn count(
        &self,
        spec: &QuerySpec,
        registry: &tablemap::Registry,
    ) -> std::result::Result<u64, tablemap::ExecError> {
        self.inner.count(spec, registry)
    }

    fn commit(&self, txn: Uuid) -> std::result::Result<(), tablemap::ExecError> {
        self.inner.commit(txn)
    }

    fn rollback(&self, txn: Uuid) -> std::result::Result<(), tablemap::ExecError> {
        self.inner.rollback(txn)
    }
}

#[test]
fn test_lazy_column_fetches_exactly_once() {
    let backend = Arc::new(CountingBackend {
        inner: MemoryBackend::new(),
        fetches: AtomicUsize::new(0),
    });
    let manager = DatabaseManager::new(backend.clone(), EngineConfig::default());
    manager.initialize();
    manager
        .register_tables([customer_descriptor(), order_descriptor()])
        .unwrap();

    let client = manager.generate_client();
    let mut records = [customer(1, "Alice"), ];
    client.save_records(&mut records).unwrap();
    let mut orders = [order(250, 1, "gift wrap")];
    client.save_records(&mut orders).unwrap();
    client.end_transactional().unwrap();

    let mut record = manager
        .read_only_client()
        .retrieve(key(1), "order", false)
        .unwrap()
        .unwrap();
    // Lazy columns are excluded from materialization.
    assert!(record.peek("notes").is_none());

    let before = backend.fetches.load(Ordering::SeqCst);
    assert_eq!(record.get("notes"), &Value::from("gift wrap"));
    assert_eq!(record.get("notes"), &Value::from("gift wrap"));
    assert_eq!(backend.fetches.load(Ordering::SeqCst), before + 1);
}

#[test]
fn test_lazy_reference_resolves_target() {
    let manager = seeded_manager();
    let mut record = manager
        .read_only_client()
        .retrieve(key(4), "order", false)
        .unwrap()
        .unwrap();

    let customers = record.reference("customer");
    assert_eq!(customers.len(), 1);
    assert_eq!(customers[0].peek("name"), Some(&Value::from("Amanda")));

    // Idempotent: the association is cached on the instance.
    assert_eq!(record.reference("customer").len(), 1);
}

#[test]
fn test_lazy_failure_leaves_zero_value_and_does_not_raise() {
    let manager = seeded_manager();
    let client = manager.generate_client();

    let mut record = client.retrieve(key(1), "order", true).unwrap().unwrap();
    // Ending the transaction makes the record's code stale.
    client.end_transactional().unwrap();

    assert_eq!(record.get("notes"), &Value::Null);
    let error = record.take_lazy_error().expect("contained error is reported");
    assert!(error.contains("no transaction context"));

    // Second read does not retry and still does not raise.
    assert_eq!(record.get("notes"), &Value::Null);
    assert!(record.take_lazy_error().is_none());
}

// ==================== Transactions ====================

#[test]
fn test_rollback_discards_writes() {
    let manager = seeded_manager();
    let registry = manager.registry();

    let client = manager.generate_client();
    let mut record = client.retrieve(key(1), "order", true).unwrap().unwrap();
    record.set("total", Decimal::from(1));
    client.update_records(std::slice::from_mut(&mut record)).unwrap();
    client
        .rollback_transactional(&OrmError::Exec(tablemap::ExecError::update("caller abort")))
        .unwrap();

    let spec = QueryBuilder::new(registry, "order")
        .unwrap()
        .filter(Condition::eq(registry, "order", "id", 1i64).unwrap())
        .unwrap()
        .confirm()
        .unwrap();
    let results = manager.read_only_client().query(&spec).unwrap();
    assert_eq!(
        results.records[0].peek("total"),
        Some(&Value::Decimal(Decimal::from(250)))
    );
}

#[test]
fn test_lock_conflict_between_transactions() {
    let manager = seeded_manager();

    let first = manager.generate_client();
    let second = manager.generate_client();

    let _locked = first.retrieve(key(1), "order", true).unwrap().unwrap();
    assert!(second.retrieve(key(1), "order", true).is_err());

    first.end_transactional().unwrap();
    assert!(second.retrieve(key(1), "order", true).is_ok());
    second.end_transactional().unwrap();
}

#[test]
fn test_for_update_query_locks_window() {
    let manager = seeded_manager();
    let registry = manager.registry();

    let holder = manager.generate_client();
    let spec = QueryBuilder::new(registry, "order")
        .unwrap()
        .filter(Condition::eq(registry, "order", "id", 2i64).unwrap())
        .unwrap()
        .for_update()
        .lock(tablemap::LockOption::PessimisticRead)
        .unwrap()
        .confirm()
        .unwrap();
    let held = holder.query(&spec).unwrap();
    assert_eq!(held.records.len(), 1);
    assert!(held.records[0].state().for_update());

    let contender = manager.generate_client();
    assert!(contender.retrieve(key(2), "order", true).is_err());

    holder.end_transactional().unwrap();
    assert!(contender.retrieve(key(2), "order", true).is_ok());
    contender.end_transactional().unwrap();
}

#[test]
fn test_lock_policy_denies_for_update() {
    let manager = DatabaseManager::new(Arc::new(MemoryBackend::new()), EngineConfig::default());
    manager.initialize();
    manager
        .register_tables([TableDescriptor::new("audit_entry", "audit_entries")
            .column(ColumnDescriptor::new("id", ColumnKind::Number).primary_key())
            .lock_policy(tablemap::LockPolicy::Deny)])
        .unwrap();

    let client = manager.generate_client();
    let mut record = Record::new("audit_entry");
    record.set("id", 1i64);
    client.save_records(std::slice::from_mut(&mut record)).unwrap();

    assert!(client.retrieve(key(1), "audit_entry", true).is_err());
    assert!(client.retrieve(key(1), "audit_entry", false).unwrap().is_some());
    client.end_transactional().unwrap();
}

#[test]
fn test_cascade_delete_removes_children() {
    let manager = seeded_manager();
    let client = manager.generate_client();

    let mut amanda = client.retrieve(key(2), "customer", true).unwrap().unwrap();
    client.drop_records(std::slice::from_mut(&mut amanda)).unwrap();
    client.end_transactional().unwrap();

    let reader = manager.read_only_client();
    // Amanda's two orders (ids 2 and 4) cascade away.
    assert!(reader.retrieve(key(2), "order", false).unwrap().is_none());
    assert!(reader.retrieve(key(4), "order", false).unwrap().is_none());
    assert!(reader.retrieve(key(1), "order", false).unwrap().is_some());
}

// ==================== Verification ====================

struct RejectingVerify;

impl VerifyProvider for RejectingVerify {
    fn sign(&self, _record: &Record) -> Result<()> {
        Ok(())
    }

    fn verify(&self, _record: &Record) -> Result<bool> {
        Ok(false)
    }
}

#[test]
fn test_verify_mismatch_surfaces_as_data_modified() {
    let manager = DatabaseManager::with_verify_provider(
        Arc::new(MemoryBackend::new()),
        EngineConfig::default(),
        Some(Arc::new(RejectingVerify)),
    );
    manager.initialize();
    manager.register_tables([customer_descriptor()]).unwrap();

    let client = manager.generate_client();
    let mut records = [customer(1, "Alice")];
    client.save_records(&mut records).unwrap();
    client.end_transactional().unwrap();

    let result = manager.read_only_client().retrieve(key(1), "customer", false);
    assert!(matches!(
        result,
        Err(OrmError::Lifecycle(LifecycleError::DataModified { .. }))
    ));
}

// ==================== Serialization ====================

#[test]
fn test_collection_round_trip() {
    let manager = seeded_manager();
    let registry = manager.registry();

    let spec = QueryBuilder::new(registry, "order")
        .unwrap()
        .order_by("order", "id", 1, SortDirection::Asc)
        .unwrap()
        .page(1, 2)
        .unwrap()
        .confirm()
        .unwrap();

    let collection = manager.read_only_client().query(&spec).unwrap();
    let json = serde_json::to_string(&collection).unwrap();
    let back: tablemap::PartialCollection = serde_json::from_str(&json).unwrap();
    assert_eq!(collection, back);
    assert_eq!(back.total, 4);
}

#[test]
fn test_spec_round_trip_through_text() {
    let manager = seeded_manager();
    let registry = manager.registry();

    let spec = QueryBuilder::new(registry, "order")
        .unwrap()
        .join_reference(JoinKind::Left, "order", "customer")
        .unwrap()
        .filter(Condition::between(registry, "order", "total", 50i64, 500i64).unwrap())
        .unwrap()
        .group_by("customer", "name", 1)
        .unwrap()
        .order_by("customer", "name", 1, SortDirection::Asc)
        .unwrap()
        .page(1, 50)
        .unwrap()
        .cacheable(true)
        .confirm()
        .unwrap();

    let json = serde_json::to_string_pretty(&spec).unwrap();
    let back: QuerySpec = serde_json::from_str(&json).unwrap();
    assert_eq!(spec, back);

    // A deserialized spec executes identically.
    let a = manager.read_only_client().query_total(&spec).unwrap();
    let b = manager.read_only_client().query_total(&back).unwrap();
    assert_eq!(a, b);
}

// ==================== Typed Entities ====================

#[derive(Debug, PartialEq)]
struct Customer {
    id: i64,
    name: String,
}

impl tablemap::Entity for Customer {
    fn entity_name() -> &'static str {
        "customer"
    }

    fn descriptor() -> TableDescriptor {
        customer_descriptor()
    }

    fn from_record(record: &Record) -> Result<Self> {
        let id = record
            .peek("id")
            .and_then(Value::as_int)
            .ok_or_else(|| tablemap::ExecError::retrieve("customer id missing"))?;
        let name = record
            .peek("name")
            .and_then(|v| v.as_text().map(str::to_string))
            .ok_or_else(|| tablemap::ExecError::retrieve("customer name missing"))?;
        Ok(Self { id, name })
    }

    fn to_record(&self) -> Record {
        let mut record = Record::new("customer");
        record.set("id", self.id);
        record.set("name", self.name.as_str());
        record
    }
}

#[test]
fn test_query_as_typed_entities() {
    let manager = seeded_manager();
    let registry = manager.registry();

    let spec = QueryBuilder::new(registry, "customer")
        .unwrap()
        .filter(Condition::like(registry, "customer", "name", "A%").unwrap())
        .unwrap()
        .order_by("customer", "name", 1, SortDirection::Asc)
        .unwrap()
        .confirm()
        .unwrap();

    let customers: Vec<Customer> = manager.read_only_client().query_as(&spec).unwrap();
    assert_eq!(
        customers,
        vec![
            Customer { id: 1, name: "Alice".into() },
            Customer { id: 2, name: "Amanda".into() },
        ]
    );
}
