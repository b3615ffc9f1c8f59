/// Second-level cache tests
///
/// Objects shared between contexts through the level 2 cache.
/// Run with: cargo test --test cache_tests
use memorm::prelude::*;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Persistable)]
#[persistable(class = "Product", version = "number")]
struct Product {
    #[persistable(primary_key)]
    id: i64,
    name: String,
    price: f64,
    #[persistable(state)]
    state: StateSlot,
}

fn unit_with(config: PersistenceConfig) -> (Arc<MemoryPersistenceHandler>, PersistenceUnit) {
    let handler = Arc::new(MemoryPersistenceHandler::new());
    let unit = PersistenceUnit::new(config, handler.clone(), EnhancementRegistry::init()).unwrap();
    unit.register::<Product>().unwrap();
    (handler, unit)
}

fn seed(unit: &PersistenceUnit, count: i64) {
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    for id in 1..=count {
        ctx.make_persistent(Product {
            id,
            name: format!("product-{}", id),
            price: 9.5,
            ..Default::default()
        })
        .unwrap();
    }
    ctx.commit().unwrap();
    ctx.close().unwrap();
}

#[test]
fn test_find_in_new_context_is_served_from_cache() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    seed(&unit, 1);
    let l2 = unit.level2_cache().unwrap().clone();
    assert!(l2.contains(&ObjectId::long("Product", 1)).unwrap());

    handler.reset_stats();
    let mut ctx = unit.open_context().unwrap();
    let h = ctx.find_object(&ObjectId::long("Product", 1), false).unwrap();
    assert_eq!(ctx.get_string_field(h, "name").unwrap(), "product-1");

    let stats = handler.stats();
    assert_eq!(stats.finds, 0);
    assert_eq!(stats.fetches, 0);
    assert!(l2.stats().hits >= 1);
}

#[test]
fn test_evicted_class_is_read_from_datastore() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    seed(&unit, 2);
    let l2 = unit.level2_cache().unwrap().clone();
    assert_eq!(l2.evict_all_of("Product", false).unwrap(), 2);
    assert!(l2.is_empty());

    handler.reset_stats();
    let mut ctx = unit.open_context().unwrap();
    let h = ctx.find_object(&ObjectId::long("Product", 2), false).unwrap();
    assert_eq!(ctx.get_double_field(h, "price").unwrap(), 9.5);
    assert_eq!(handler.stats().finds, 1);
    // The datastore read repopulates the cache
    assert!(l2.contains(&ObjectId::long("Product", 2)).unwrap());
}

#[test]
fn test_pinned_entries_survive_reclaim() {
    let (_handler, unit) = unit_with(PersistenceConfig::default());
    seed(&unit, 3);
    let l2 = unit.level2_cache().unwrap().clone();
    let pinned = ObjectId::long("Product", 1);
    l2.pin(&pinned).unwrap();
    assert!(l2.is_pinned(&pinned).unwrap());

    assert_eq!(l2.reclaim(10).unwrap(), 2);
    assert_eq!(l2.len(), 1);
    assert!(l2.contains(&pinned).unwrap());
    assert!(!l2.contains(&ObjectId::long("Product", 2)).unwrap());
}

#[test]
fn test_bounded_cache_holds_at_most_max_size() {
    let (_handler, unit) = unit_with(PersistenceConfig::default().l2_max_size(2));
    seed(&unit, 3);
    let l2 = unit.level2_cache().unwrap();
    assert_eq!(l2.max_size(), Some(2));
    assert!(l2.len() <= 2);
}

#[test]
fn test_rollback_evicts_cache_writes() {
    let (_handler, unit) = unit_with(PersistenceConfig::default());
    let l2 = unit.level2_cache().unwrap().clone();
    let mut ctx = unit.open_context().unwrap();
    ctx.begin().unwrap();
    ctx.make_persistent(Product {
        id: 1,
        name: "gone".into(),
        ..Default::default()
    })
    .unwrap();
    ctx.rollback().unwrap();
    assert!(!l2.contains(&ObjectId::long("Product", 1)).unwrap());
}

#[test]
fn test_disabled_cache() {
    let (handler, unit) = unit_with(PersistenceConfig::default().l2_cache(false));
    assert!(unit.level2_cache().is_none());
    seed(&unit, 1);

    handler.reset_stats();
    let mut ctx = unit.open_context().unwrap();
    ctx.find_object(&ObjectId::long("Product", 1), false).unwrap();
    assert_eq!(handler.stats().finds, 1);
}
