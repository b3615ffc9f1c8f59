/// Concurrency tests
///
/// A shared context used from several threads, and unrelated sessions
/// reading and writing through one level 2 cache at the same time.
/// Run with: cargo test --test concurrency_tests
use memorm::prelude::*;
use std::sync::Arc;
use std::thread;

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

fn unit_with(config: PersistenceConfig) -> (Arc<MemoryPersistenceHandler>, Arc<PersistenceUnit>) {
    let handler = Arc::new(MemoryPersistenceHandler::new());
    let unit = PersistenceUnit::new(config, handler.clone(), EnhancementRegistry::init()).unwrap();
    unit.register::<Product>().unwrap();
    (handler, Arc::new(unit))
}

fn product(id: i64, price: f64) -> Product {
    Product {
        id,
        name: format!("product-{}", id),
        price,
        ..Default::default()
    }
}

#[test]
fn test_shared_context_requires_multithreaded() {
    let (_handler, unit) = unit_with(PersistenceConfig::default());
    let err = unit.open_shared_context().unwrap_err();
    assert!(matches!(err, PersistenceError::Configuration(_)));
}

#[test]
fn test_shared_context_used_from_several_threads() {
    let (handler, unit) = unit_with(PersistenceConfig::default().multithreaded(true));
    let shared = unit.open_shared_context().unwrap();

    let workers: Vec<_> = (0..4i64)
        .map(|worker| {
            let shared = shared.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    let id = worker * 100 + i;
                    shared
                        .with(|ctx| {
                            ctx.begin()?;
                            let h = ctx.make_persistent(product(id, 1.0))?;
                            ctx.set_double_field(h, "price", 2.0)?;
                            ctx.commit()
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(handler.row_count("Product"), 100);
    assert_eq!(
        handler.stored_value(&ObjectId::long("Product", 324), Product::FIELD_PRICE),
        Some(FieldValue::Double(2.0))
    );

    let mut ctx = shared.lock().unwrap();
    assert!(!ctx.is_transaction_active());
    let h = ctx.find_object(&ObjectId::long("Product", 7), false).unwrap();
    assert_eq!(ctx.get_double_field(h, "price").unwrap(), 2.0);
}

#[test]
fn test_sessions_share_the_cache_concurrently() {
    let (handler, unit) = unit_with(PersistenceConfig::default());
    {
        let mut ctx = unit.open_context().unwrap();
        ctx.begin().unwrap();
        for id in 0..40 {
            ctx.make_persistent(product(id, 1.0)).unwrap();
        }
        ctx.commit().unwrap();
        ctx.close().unwrap();
    }

    // Each session writes its own products and reads everybody's
    let workers: Vec<_> = (0..4i64)
        .map(|worker| {
            let unit = unit.clone();
            thread::spawn(move || {
                for round in 0..10 {
                    let mut ctx = unit.open_context().unwrap();
                    ctx.begin().unwrap();
                    for id in (0..40).filter(|id| id % 4 == worker) {
                        let h = ctx.find_object(&ObjectId::long("Product", id), false).unwrap();
                        ctx.set_double_field(h, "price", f64::from(round + 1)).unwrap();
                    }
                    for id in 0..40 {
                        let h = ctx.find_object(&ObjectId::long("Product", id), false).unwrap();
                        assert!(ctx.get_double_field(h, "price").unwrap() >= 1.0);
                    }
                    ctx.commit().unwrap();
                    ctx.close().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let l2 = unit.level2_cache().unwrap();
    for id in 0..40 {
        let id = ObjectId::long("Product", id);
        assert_eq!(handler.stored_value(&id, Product::FIELD_PRICE), Some(FieldValue::Double(10.0)));
        if let Some(cached) = l2.get(&id).unwrap() {
            assert_eq!(cached.value(Product::FIELD_PRICE), Some(&FieldValue::Double(10.0)));
        }
    }

    let mut reader = unit.open_context().unwrap();
    let h = reader.find_object(&ObjectId::long("Product", 13), false).unwrap();
    assert_eq!(reader.get_double_field(h, "price").unwrap(), 10.0);
}
