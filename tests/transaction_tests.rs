/// Transaction tests
///
/// Commit, rollback, deferred datastore operations and deletion.
/// Run with: cargo test --test transaction_tests
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

fn account(id: i64, owner: &str, balance: i64) -> Account {
    Account {
        id,
        owner: owner.to_string(),
        balance,
        memo: Some(format!("memo for {}", owner)),
        ..Default::default()
    }
}

fn unit_with(config: PersistenceConfig) -> (Arc<MemoryPersistenceHandler>, PersistenceUnit) {
    let handler = Arc::new(MemoryPersistenceHandler::new());
    let unit = PersistenceUnit::new(config, handler.clone(), EnhancementRegistry::init()).unwrap();
    unit.register::<Account>().unwrap();
    (handler, unit)
}

fn seed(unit: &PersistenceUnit, accounts: &[(i64, &str)]) {
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    for (id, owner) in accounts {
        ctx.make_persistent(account(*id, owner, 100)).unwrap();
    }
    ctx.commit().unwrap();
    ctx.close().unwrap();
}

#[test]
fn test_commit_leaves_objects_hollow_and_reloads_from_level2() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let h = ctx.make_persistent(account(1, "ann", 100)).unwrap();
    ctx.commit().unwrap();

    assert_eq!(ctx.stage(h).unwrap(), LifecycleStage::Hollow);
    assert!(!ctx.is_loaded(h, "owner").unwrap());

    handler.reset_stats();
    assert_eq!(ctx.get_string_field(h, "owner").unwrap(), "ann");
    assert_eq!(handler.stats().fetches, 0);
    assert_eq!(ctx.stage(h).unwrap(), LifecycleStage::PersistentClean);
}

#[test]
fn test_commit_with_retained_values() {
    let (_handler, unit) = unit_with(PersistenceConfig::default().retain_values(true));
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let h = ctx.make_persistent(account(1, "ann", 100)).unwrap();
    ctx.commit().unwrap();

    assert_eq!(ctx.stage(h).unwrap(), LifecycleStage::PersistentClean);
    assert!(ctx.is_loaded(h, "owner").unwrap());
    assert!(!ctx.is_dirty(h).unwrap());
}

#[test]
fn test_update_bumps_version() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    seed(&unit, &[(1, "ann")]);
    let id = ObjectId::long("Account", 1);
    assert_eq!(handler.stored_version(&id), Some(Version::Number(1)));

    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let h = ctx.find_object(&id, false).unwrap();
    ctx.set_long_field(h, "balance", 250).unwrap();
    assert_eq!(ctx.stage(h).unwrap(), LifecycleStage::PersistentDirty);
    ctx.commit().unwrap();

    assert_eq!(handler.stored_value(&id, Account::FIELD_BALANCE), Some(FieldValue::Long(250)));
    assert_eq!(handler.stored_version(&id), Some(Version::Number(2)));
}

#[test]
fn test_rollback_restores_fields_and_drops_new_objects() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    seed(&unit, &[(1, "ann")]);

    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let h = ctx.find_object(&ObjectId::long("Account", 1), false).unwrap();
    ctx.set_string_field(h, "owner", "zed".to_string()).unwrap();
    let added = ctx.make_persistent(account(2, "bob", 5)).unwrap();
    assert_eq!(handler.row_count("Account"), 2);
    ctx.rollback().unwrap();

    assert_eq!(ctx.get_string_field(h, "owner").unwrap(), "ann");
    assert!(!ctx.contains(added));
    assert!(!handler.contains(&ObjectId::long("Account", 2)));
    assert_eq!(handler.row_count("Account"), 1);
    assert_eq!(
        handler.stored_value(&ObjectId::long("Account", 1), Account::FIELD_OWNER),
        Some(FieldValue::from("ann"))
    );
}

#[test]
fn test_optimistic_transaction_defers_writes_to_flush() {
    let (handler, unit) = unit_with(PersistenceConfig::default().optimistic(true));
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let h = ctx.make_persistent(account(1, "ann", 100)).unwrap();
    assert_eq!(handler.stats().inserts, 0);
    assert!(!ctx.state_manager(h).unwrap().is_flushed_new());

    ctx.flush().unwrap();
    assert_eq!(handler.stats().inserts, 1);
    assert!(ctx.state_manager(h).unwrap().is_flushed_new());

    ctx.commit().unwrap();
    assert_eq!(handler.stats().inserts, 1);
}

#[test]
fn test_delayed_datastore_transaction_writes_at_commit() {
    let (handler, unit) = unit_with(PersistenceConfig::default().delay_datastore_operations(true));
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    ctx.make_persistent(account(1, "ann", 100)).unwrap();
    assert_eq!(handler.stats().inserts, 0);
    ctx.commit().unwrap();
    assert_eq!(handler.stats().inserts, 1);
}

#[test]
fn test_nontransactional_write_commits_immediately() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    let mut ctx = unit.open_context().unwrap();
    ctx.make_persistent(account(1, "ann", 100)).unwrap();
    assert!(handler.contains(&ObjectId::long("Account", 1)));
    assert!(!ctx.is_transaction_active());
}

#[test]
fn test_write_outside_transaction_rejected_when_disabled() {
    let (handler, unit) = unit_with(PersistenceConfig::default().nontransactional_write(false));
    let mut ctx = unit.open_context().unwrap();
    let err = ctx.make_persistent(account(1, "ann", 100)).unwrap_err();
    assert!(matches!(err, PersistenceError::Transaction(_)));
    assert_eq!(handler.row_count("Account"), 0);
}

#[test]
fn test_transaction_demarcation_errors() {
    let (_handler, unit) = unit_with(PersistenceConfig::default());
    let mut ctx = unit.open_context().unwrap();
    assert!(matches!(ctx.commit(), Err(PersistenceError::Transaction(_))));
    ctx.begin().unwrap();
    assert!(matches!(ctx.begin(), Err(PersistenceError::Transaction(_))));
    ctx.rollback().unwrap();
    assert!(!ctx.is_transaction_active());
}

#[test]
fn test_deleted_object_keeps_only_fields_loaded_before_delete() {
    let (handler, unit) = unit_with(PersistenceConfig::default().optimistic(true));
    seed(&unit, &[(1, "ann")]);
    let id = ObjectId::long("Account", 1);

    let mut ctx = unit.open_context().unwrap();
    let h = ctx.find_object(&id, false).unwrap();
    ctx.unload_field(h, "memo").unwrap();

    ctx.begin().unwrap();
    ctx.delete_persistent(h).unwrap();
    assert_eq!(ctx.stage(h).unwrap(), LifecycleStage::PersistentDeleted);
    assert!(ctx.state_manager(h).unwrap().pre_delete_loaded_fields().is_some());

    handler.reset_stats();
    assert_eq!(ctx.get_string_field(h, "owner").unwrap(), "ann");
    assert_eq!(handler.stats().fetches, 0);

    let err = ctx.get_field(h, "memo").unwrap_err();
    assert!(matches!(err, PersistenceError::FieldNotAvailable { .. }));

    ctx.commit().unwrap();
    assert_eq!(handler.stats().deletes, 1);
    assert!(!handler.contains(&id));
    assert!(!ctx.contains(h));
}

#[test]
fn test_delete_in_datastore_transaction_is_immediate() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    seed(&unit, &[(1, "ann")]);
    let id = ObjectId::long("Account", 1);

    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let h = ctx.find_object(&id, false).unwrap();
    ctx.delete_persistent(h).unwrap();
    assert!(!handler.contains(&id));

    ctx.rollback().unwrap();
    assert!(handler.contains(&id));
}

#[test]
fn test_write_to_deleted_object_fails() {
    let (_handler, unit) = unit_with(PersistenceConfig::default().optimistic(true));
    seed(&unit, &[(1, "ann")]);

    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let h = ctx.find_object(&ObjectId::long("Account", 1), false).unwrap();
    ctx.delete_persistent(h).unwrap();
    let err = ctx.set_long_field(h, "balance", 1).unwrap_err();
    assert!(matches!(err, PersistenceError::ObjectDeleted(_)));
}

#[test]
fn test_new_object_deleted_before_flush_sends_nothing() {
    let (handler, unit) = unit_with(PersistenceConfig::default().optimistic(true));
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let h = ctx.make_persistent(account(1, "ann", 100)).unwrap();
    ctx.delete_persistent(h).unwrap();
    assert_eq!(ctx.stage(h).unwrap(), LifecycleStage::PersistentNewDeleted);

    ctx.commit().unwrap();
    let stats = handler.stats();
    assert_eq!(stats.inserts, 0);
    assert_eq!(stats.deletes, 0);
    assert_eq!(handler.row_count("Account"), 0);
    assert!(!ctx.contains(h));
}

#[test]
fn test_new_object_deleted_after_flush_is_removed_again() {
    let (handler, unit) = unit_with(PersistenceConfig::default().optimistic(true));
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let h = ctx.make_persistent(account(1, "ann", 100)).unwrap();
    ctx.flush().unwrap();
    ctx.delete_persistent(h).unwrap();
    assert_eq!(ctx.stage(h).unwrap(), LifecycleStage::PersistentNewDeleted);

    ctx.commit().unwrap();
    let stats = handler.stats();
    assert_eq!(stats.inserts, 1);
    assert_eq!(stats.deletes, 1);
    assert!(!handler.contains(&ObjectId::long("Account", 1)));
}
