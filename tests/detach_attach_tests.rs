/// Detach / attach tests
///
/// Detached copies, merging their changes back and version checks on attach.
/// Run with: cargo test --test detach_attach_tests
use memorm::prelude::*;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Persistable)]
#[persistable(class = "Account", version = "number", detachable)]
struct Account {
    #[persistable(primary_key)]
    id: i64,
    owner: String,
    balance: i64,
    #[persistable(lazy)]
    memo: Option<String>,
    tags: TrackedList,
    #[persistable(state)]
    state: StateSlot,
}

fn unit_with(config: PersistenceConfig) -> (Arc<MemoryPersistenceHandler>, PersistenceUnit) {
    let handler = Arc::new(MemoryPersistenceHandler::new());
    let unit = PersistenceUnit::new(config, handler.clone(), EnhancementRegistry::init()).unwrap();
    unit.register::<Account>().unwrap();
    (handler, unit)
}

fn seed_ann(unit: &PersistenceUnit) -> ObjectId {
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    ctx.make_persistent(Account {
        id: 1,
        owner: "ann".into(),
        balance: 100,
        memo: Some("first customer".into()),
        ..Default::default()
    })
    .unwrap();
    ctx.commit().unwrap();
    ObjectId::long("Account", 1)
}

fn detach_account(unit: &PersistenceUnit, id: &ObjectId) -> DetachedGraph {
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let h = ctx.find_object(id, false).unwrap();
    let graph = ctx.detach_copy(h).unwrap();
    ctx.commit().unwrap();
    graph
}

#[test]
fn test_detach_copy_holds_fetch_plan_fields_only() {
    let (_handler, unit) = unit_with(PersistenceConfig::default());
    let id = seed_ann(&unit);
    let graph = detach_account(&unit, &id);

    assert_eq!(graph.root_id(), &id);
    assert_eq!(graph.len(), 1);
    assert_eq!(graph.root::<Account>().unwrap().owner, "ann");
    assert_eq!(graph.get_field(&id, "balance").unwrap(), FieldValue::Long(100));

    let err = graph.get_field(&id, "memo").unwrap_err();
    assert!(matches!(err, PersistenceError::DetachedFieldAccess { .. }));
}

#[test]
fn test_detach_copy_keeps_original_managed() {
    let (_handler, unit) = unit_with(PersistenceConfig::default());
    let id = seed_ann(&unit);

    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let h = ctx.find_object(&id, false).unwrap();
    ctx.detach_copy(h).unwrap();
    assert!(ctx.contains(h));

    let graph = ctx.detach(h).unwrap();
    assert!(!ctx.contains(h));
    assert!(graph.contains(&id));
    ctx.commit().unwrap();
}

#[test]
fn test_attach_merges_detached_changes() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    let id = seed_ann(&unit);
    let mut graph = detach_account(&unit, &id);

    graph.set_field(&id, "balance", 50i64).unwrap();
    assert_eq!(graph.get_field(&id, "balance").unwrap(), FieldValue::Long(50));

    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let h = ctx.attach_copy(&graph).unwrap();
    assert_eq!(ctx.get_long_field(h, "balance").unwrap(), 50);
    ctx.commit().unwrap();

    assert_eq!(handler.stored_value(&id, Account::FIELD_BALANCE), Some(FieldValue::Long(50)));
    assert_eq!(handler.stored_version(&id), Some(Version::Number(2)));
    // Fields that were never detached are left as stored
    assert_eq!(
        handler.stored_value(&id, Account::FIELD_MEMO),
        Some(FieldValue::from("first customer"))
    );
}

#[test]
fn test_attach_of_stale_copy_is_an_optimistic_conflict() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    let id = seed_ann(&unit);
    let mut graph = detach_account(&unit, &id);

    // Someone else updates the row while the copy is away
    let mut other = unit.open_context().unwrap();
    other.begin().unwrap();
    let h = other.find_object(&id, false).unwrap();
    other.set_long_field(h, "balance", 7).unwrap();
    other.commit().unwrap();
    assert_eq!(handler.stored_version(&id), Some(Version::Number(2)));

    graph.set_field(&id, "balance", 50i64).unwrap();
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let err = ctx.attach_copy(&graph).unwrap_err();
    assert!(matches!(err, PersistenceError::OptimisticConflict { .. }));
    ctx.rollback().unwrap();

    assert_eq!(handler.stored_value(&id, Account::FIELD_BALANCE), Some(FieldValue::Long(7)));
}

#[test]
fn test_attach_into_empty_datastore_replicates() {
    let (_handler, unit) = unit_with(PersistenceConfig::default());
    let id = seed_ann(&unit);
    let graph = detach_account(&unit, &id);

    let (replica, replica_unit) = unit_with(PersistenceConfig::default());
    let mut ctx = replica_unit.open_context().unwrap();
    ctx.begin().unwrap();
    let h = ctx.attach_copy(&graph).unwrap();
    ctx.commit().unwrap();

    assert!(replica.contains(&id));
    assert_eq!(replica.stored_value(&id, Account::FIELD_OWNER), Some(FieldValue::from("ann")));
    assert_eq!(ctx.object_id(h).unwrap(), Some(id));
}

#[test]
fn test_detached_root_can_be_taken_out() {
    let (_handler, unit) = unit_with(PersistenceConfig::default());
    let id = seed_ann(&unit);
    let graph = detach_account(&unit, &id);

    let account: Account = graph.into_root().unwrap();
    assert_eq!(account.id, 1);
    assert_eq!(account.balance, 100);
    assert!(account.state.is_detached());
}
