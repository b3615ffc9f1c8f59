/// Embedded object tests
///
/// Objects stored inline with their owner and sharing its lifecycle.
/// Run with: cargo test --test embedded_tests
use memorm::prelude::*;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Persistable)]
#[persistable(class = "Address", identity = "native")]
struct Address {
    street: String,
    city: String,
    #[persistable(state)]
    state: StateSlot,
}

#[derive(Debug, Default, Clone, Persistable)]
#[persistable(class = "Person")]
struct Person {
    #[persistable(primary_key)]
    id: i64,
    name: String,
    #[persistable(embedded)]
    address: Option<ObjectRef>,
    #[persistable(state)]
    state: StateSlot,
}

fn unit_with(config: PersistenceConfig) -> (Arc<MemoryPersistenceHandler>, PersistenceUnit) {
    let handler = Arc::new(MemoryPersistenceHandler::new());
    let unit = PersistenceUnit::new(config, handler.clone(), EnhancementRegistry::init()).unwrap();
    unit.register::<Address>().unwrap();
    unit.register::<Person>().unwrap();
    (handler, unit)
}

fn seed_person(unit: &PersistenceUnit) -> ObjectId {
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    ctx.make_persistent(Person {
        id: 1,
        name: "ann".into(),
        address: Some(ObjectRef::new(Address {
            street: "1 Rue Haute".into(),
            city: "Paris".into(),
            ..Default::default()
        })),
        ..Default::default()
    })
    .unwrap();
    ctx.commit().unwrap();
    ctx.close().unwrap();
    ObjectId::long("Person", 1)
}

fn address_of(ctx: &mut ExecutionContext, person: ObjectHandle) -> ObjectHandle {
    ctx.get_field(person, "address")
        .unwrap()
        .as_handle()
        .expect("embedded address should be managed")
}

#[test]
fn test_embedded_object_is_stored_inline() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    let id = seed_person(&unit);

    assert_eq!(handler.row_count("Person"), 1);
    assert_eq!(handler.row_count("Address"), 0);
    match handler.stored_value(&id, Person::FIELD_ADDRESS) {
        Some(FieldValue::Embedded(image)) => {
            assert_eq!(image.class, "Address");
            assert!(image.fields.contains(&FieldValue::from("Paris")));
        }
        other => panic!("expected an inline address, got {:?}", other),
    }
}

#[test]
fn test_embedded_object_is_managed_with_its_owner() {
    let (_handler, unit) = unit_with(PersistenceConfig::default());
    let id = seed_person(&unit);

    let mut ctx = unit.open_context().unwrap();
    let person = ctx.find_object(&id, false).unwrap();
    let address = address_of(&mut ctx, person);

    let sm = ctx.state_manager(address).unwrap();
    assert!(sm.is_embedded());
    assert!(sm.object_id().is_none());
    assert_eq!(ctx.get_string_field(address, "city").unwrap(), "Paris");

    let err = ctx.delete_persistent(address).unwrap_err();
    assert!(matches!(err, PersistenceError::User(_)));
}

#[test]
fn test_write_to_embedded_object_updates_owner() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    let id = seed_person(&unit);

    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let person = ctx.find_object(&id, false).unwrap();
    let address = address_of(&mut ctx, person);
    ctx.set_string_field(address, "city", "Lyon".to_string())
        .unwrap();
    assert_eq!(ctx.stage(person).unwrap(), LifecycleStage::PersistentDirty);
    ctx.commit().unwrap();
    assert_eq!(handler.row_count("Address"), 0);

    let mut reader = unit.open_context().unwrap();
    let person = reader.find_object(&id, false).unwrap();
    let address = address_of(&mut reader, person);
    assert_eq!(reader.get_string_field(address, "city").unwrap(), "Lyon");
    assert_eq!(reader.get_string_field(address, "street").unwrap(), "1 Rue Haute");
}

#[test]
fn test_deleting_owner_takes_embedded_object_along() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    let id = seed_person(&unit);

    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let person = ctx.find_object(&id, false).unwrap();
    let address = address_of(&mut ctx, person);
    ctx.delete_persistent(person).unwrap();
    ctx.commit().unwrap();

    assert!(!handler.contains(&id));
    assert!(!ctx.contains(person));
    assert!(!ctx.contains(address));
}

#[test]
fn test_uncached_embedded_value_is_read_fresh() {
    let (_handler, unit) = unit_with(PersistenceConfig::default().cache_embedded(false));
    let id = seed_person(&unit);

    let mut reader = unit.open_context().unwrap();
    let person = reader.find_object(&id, false).unwrap();
    let address = address_of(&mut reader, person);
    assert_eq!(reader.get_string_field(address, "city").unwrap(), "Paris");
    reader.close().unwrap();

    let mut writer = unit.open_context().unwrap();
    writer.begin().unwrap();
    let person = writer.find_object(&id, false).unwrap();
    let address = address_of(&mut writer, person);
    writer
        .set_string_field(address, "city", "Lyon".to_string())
        .unwrap();
    writer.commit().unwrap();
    writer.close().unwrap();

    let cached = unit.level2_cache().unwrap().get(&id).unwrap().unwrap();
    assert_eq!(cached.value(Person::FIELD_ADDRESS), None);

    let mut next = unit.open_context().unwrap();
    let person = next.find_object(&id, false).unwrap();
    let address = address_of(&mut next, person);
    assert_eq!(next.get_string_field(address, "city").unwrap(), "Lyon");
}

#[test]
fn test_close_releases_owners_and_embedded_objects() {
    let (_handler, unit) = unit_with(PersistenceConfig::default());
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    let people: Vec<ObjectHandle> = (1..=25)
        .map(|i| {
            ctx.make_persistent(Person {
                id: i,
                name: format!("p{}", i),
                address: Some(ObjectRef::new(Address {
                    street: format!("{} Main St", i),
                    city: "Paris".into(),
                    ..Default::default()
                })),
                ..Default::default()
            })
            .unwrap()
        })
        .collect();
    let addresses: Vec<ObjectHandle> = people
        .iter()
        .map(|p| address_of(&mut ctx, *p))
        .collect();
    assert_eq!(ctx.len(), 50);

    // Replacing an embedded value releases the old one
    ctx.set_field(
        people[0],
        "address",
        ObjectRef::new(Address {
            street: "2 Rue Basse".into(),
            city: "Nice".into(),
            ..Default::default()
        }),
    )
    .unwrap();
    assert!(!ctx.contains(addresses[0]));
    assert_eq!(ctx.len(), 50);
    ctx.commit().unwrap();

    ctx.close().unwrap();
    assert!(ctx.is_empty());
    assert!(addresses.iter().all(|a| !ctx.contains(*a)));
}
