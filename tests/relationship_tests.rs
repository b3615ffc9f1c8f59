/// Relationship tests
///
/// Bidirectional relations kept in step at flush, cascading deletes and
/// persistence by reachability.
/// Run with: cargo test --test relationship_tests
use memorm::prelude::*;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Persistable)]
#[persistable(class = "Department")]
struct Department {
    #[persistable(primary_key)]
    id: i64,
    name: String,
    #[persistable(target = "Employee", mapped_by = "department")]
    employees: TrackedList,
    #[persistable(state)]
    state: StateSlot,
}

#[derive(Debug, Default, Clone, Persistable)]
#[persistable(class = "Employee")]
struct Employee {
    #[persistable(primary_key)]
    id: i64,
    name: String,
    #[persistable(target = "Department")]
    department: Option<ObjectRef>,
    #[persistable(state)]
    state: StateSlot,
}

#[derive(Debug, Default, Clone, Persistable)]
#[persistable(class = "Badge")]
struct Badge {
    #[persistable(primary_key)]
    id: i64,
    code: String,
    #[persistable(state)]
    state: StateSlot,
}

#[derive(Debug, Default, Clone, Persistable)]
#[persistable(class = "Holder")]
struct Holder {
    #[persistable(primary_key)]
    id: i64,
    #[persistable(dependent)]
    badge: Option<ObjectRef>,
    #[persistable(state)]
    state: StateSlot,
}

fn unit_with(config: PersistenceConfig) -> (Arc<MemoryPersistenceHandler>, PersistenceUnit) {
    let handler = Arc::new(MemoryPersistenceHandler::new());
    let unit = PersistenceUnit::new(config, handler.clone(), EnhancementRegistry::init()).unwrap();
    unit.register::<Department>().unwrap();
    unit.register::<Employee>().unwrap();
    unit.register::<Badge>().unwrap();
    unit.register::<Holder>().unwrap();
    (handler, unit)
}

fn optimistic() -> PersistenceConfig {
    PersistenceConfig::default().optimistic(true).retain_values(true)
}

fn department(id: i64, name: &str) -> Department {
    Department {
        id,
        name: name.to_string(),
        ..Default::default()
    }
}

fn employees_of(ctx: &mut ExecutionContext, dept: ObjectHandle) -> TrackedList {
    match ctx.get_field(dept, "employees").unwrap() {
        FieldValue::TrackedList(list) => list,
        other => panic!("expected a tracked list, got {}", other),
    }
}

#[test]
fn test_many_side_assignment_updates_collection() {
    let (handler, unit) = unit_with(optimistic());
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let d = ctx.make_persistent(department(1, "eng")).unwrap();
    let e = ctx
        .make_persistent(Employee {
            id: 10,
            name: "eve".into(),
            department: Some(ObjectRef::Managed(d)),
            ..Default::default()
        })
        .unwrap();
    ctx.flush().unwrap();

    let employees = employees_of(&mut ctx, d);
    assert_eq!(employees.len(), 1);
    assert!(employees.contains(&FieldValue::from(e)));
    ctx.commit().unwrap();

    assert_eq!(
        handler.stored_value(&ObjectId::long("Department", 1), Department::FIELD_EMPLOYEES),
        Some(FieldValue::List(vec![FieldValue::Ref(ObjectRef::Id(
            ObjectId::long("Employee", 10)
        ))]))
    );
    assert_eq!(
        handler.stored_value(&ObjectId::long("Employee", 10), Employee::FIELD_DEPARTMENT),
        Some(FieldValue::Ref(ObjectRef::Id(ObjectId::long("Department", 1))))
    );
}

#[test]
fn test_reassignment_moves_between_collections() {
    let (_handler, unit) = unit_with(optimistic());
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let eng = ctx.make_persistent(department(1, "eng")).unwrap();
    let e = ctx
        .make_persistent(Employee {
            id: 10,
            name: "eve".into(),
            department: Some(ObjectRef::Managed(eng)),
            ..Default::default()
        })
        .unwrap();
    ctx.commit().unwrap();

    ctx.begin().unwrap();
    let ops = ctx.make_persistent(department(2, "ops")).unwrap();
    ctx.set_field(e, "department", ops).unwrap();
    ctx.flush().unwrap();

    assert!(employees_of(&mut ctx, eng).is_empty());
    assert!(employees_of(&mut ctx, ops).contains(&FieldValue::from(e)));
    ctx.commit().unwrap();
}

#[test]
fn test_deleting_member_removes_back_reference() {
    let (handler, unit) = unit_with(optimistic());
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let d = ctx.make_persistent(department(1, "eng")).unwrap();
    let e = ctx
        .make_persistent(Employee {
            id: 10,
            name: "eve".into(),
            department: Some(ObjectRef::Managed(d)),
            ..Default::default()
        })
        .unwrap();
    ctx.commit().unwrap();
    assert_eq!(employees_of(&mut ctx, d).len(), 1);

    ctx.begin().unwrap();
    ctx.delete_persistent(e).unwrap();
    assert!(employees_of(&mut ctx, d).is_empty());
    ctx.commit().unwrap();

    assert!(!handler.contains(&ObjectId::long("Employee", 10)));
    assert_eq!(
        handler.stored_value(&ObjectId::long("Department", 1), Department::FIELD_EMPLOYEES),
        Some(FieldValue::List(Vec::new()))
    );
}

#[test]
fn test_related_objects_load_in_new_context() {
    let (_handler, unit) = unit_with(optimistic());
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let d = ctx.make_persistent(department(1, "eng")).unwrap();
    ctx.make_persistent(Employee {
        id: 10,
        name: "eve".into(),
        department: Some(ObjectRef::Managed(d)),
        ..Default::default()
    })
    .unwrap();
    ctx.commit().unwrap();
    ctx.close().unwrap();

    let mut reader = unit.open_context().unwrap();
    let dept = reader
        .find_object(&ObjectId::long("Department", 1), false)
        .unwrap();
    let employees = employees_of(&mut reader, dept);
    assert_eq!(employees.len(), 1);
    let member = employees.get(0).and_then(|v| v.as_handle()).unwrap();
    assert_eq!(
        reader.object_id(member).unwrap(),
        Some(ObjectId::long("Employee", 10))
    );
    assert_eq!(reader.get_string_field(member, "name").unwrap(), "eve");
}

#[test]
fn test_reachable_objects_are_persisted() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let holder = ctx
        .make_persistent(Holder {
            id: 1,
            badge: Some(ObjectRef::new(Badge {
                id: 7,
                code: "B-7".into(),
                ..Default::default()
            })),
            ..Default::default()
        })
        .unwrap();
    let badge = ctx.get_field(holder, "badge").unwrap().as_handle().unwrap();
    assert_eq!(ctx.stage(badge).unwrap(), LifecycleStage::PersistentNew);
    ctx.commit().unwrap();

    assert!(handler.contains(&ObjectId::long("Badge", 7)));
    assert_eq!(handler.row_count("Holder"), 1);
}

#[test]
fn test_dependent_referent_is_deleted_with_owner() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let holder = ctx
        .make_persistent(Holder {
            id: 1,
            badge: Some(ObjectRef::new(Badge {
                id: 7,
                code: "B-7".into(),
                ..Default::default()
            })),
            ..Default::default()
        })
        .unwrap();
    ctx.commit().unwrap();

    ctx.begin().unwrap();
    ctx.delete_persistent(holder).unwrap();
    ctx.commit().unwrap();

    assert!(!handler.contains(&ObjectId::long("Holder", 1)));
    assert!(!handler.contains(&ObjectId::long("Badge", 7)));
}

#[test]
fn test_replacing_dependent_referent_deletes_orphan() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let holder = ctx
        .make_persistent(Holder {
            id: 1,
            badge: Some(ObjectRef::new(Badge {
                id: 7,
                code: "B-7".into(),
                ..Default::default()
            })),
            ..Default::default()
        })
        .unwrap();
    ctx.set_field(holder, "badge", FieldValue::Null).unwrap();
    ctx.commit().unwrap();

    assert!(handler.contains(&ObjectId::long("Holder", 1)));
    assert!(!handler.contains(&ObjectId::long("Badge", 7)));
}

#[test]
fn test_contradicting_sides_fail_until_corrected() {
    let (handler, unit) = unit_with(optimistic());
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let eng = ctx.make_persistent(department(1, "eng")).unwrap();
    let ops = ctx.make_persistent(department(2, "ops")).unwrap();
    let e = ctx
        .make_persistent(Employee {
            id: 10,
            name: "eve".into(),
            ..Default::default()
        })
        .unwrap();
    ctx.commit().unwrap();

    ctx.begin().unwrap();
    employees_of(&mut ctx, eng).push(FieldValue::from(e));
    ctx.set_field(e, "department", ops).unwrap();

    let err = ctx.flush().unwrap_err();
    assert!(matches!(err, PersistenceError::User(_)));
    // Nothing was applied, so the retry sees the same contradiction
    let err = ctx.flush().unwrap_err();
    assert!(matches!(err, PersistenceError::User(_)));
    assert!(ctx.commit().is_err());
    if ctx.is_transaction_active() {
        ctx.rollback().unwrap();
    }

    assert_eq!(
        handler.stored_value(&ObjectId::long("Employee", 10), Employee::FIELD_DEPARTMENT),
        Some(FieldValue::Null)
    );
    assert_eq!(
        handler.stored_value(&ObjectId::long("Department", 1), Department::FIELD_EMPLOYEES),
        Some(FieldValue::List(Vec::new()))
    );
}

#[test]
fn test_consistent_sides_pass_the_check() {
    let (handler, unit) = unit_with(optimistic());
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let eng = ctx.make_persistent(department(1, "eng")).unwrap();
    let e = ctx
        .make_persistent(Employee {
            id: 10,
            name: "eve".into(),
            ..Default::default()
        })
        .unwrap();
    ctx.commit().unwrap();

    ctx.begin().unwrap();
    employees_of(&mut ctx, eng).push(FieldValue::from(e));
    ctx.set_field(e, "department", eng).unwrap();
    ctx.commit().unwrap();

    assert_eq!(employees_of(&mut ctx, eng).len(), 1);
    assert_eq!(
        handler.stored_value(&ObjectId::long("Employee", 10), Employee::FIELD_DEPARTMENT),
        Some(FieldValue::Ref(ObjectRef::Id(ObjectId::long("Department", 1))))
    );
}
