//! Integration tests for registry invariants.
//!
//! Every test checks the identity maps against each other through the
//! public API only: `get` (id → entity), `id_of` (entity → id) and the raw
//! index accessors.

use std::sync::Arc;
use std::thread;

use kiosk_protocol::{Cart, Menu, Order, OrderStatus};
use kiosk_registry::{MenuRegistry, OrderRegistry, RegistryError};

fn menu(id: &str, price: i64) -> Menu {
    Menu {
        id: id.into(),
        name: format!("menu {id}"),
        price,
        category_id: "coffee".into(),
        image_path: String::new(),
        description: String::new(),
        option_groups: Vec::new(),
    }
}

fn order(id: i64, status: OrderStatus) -> Order {
    Order {
        order_id: id,
        customer: format!("customer {id}"),
        order_time: 1_700_000_000_000 + id as u64,
        status,
        cart: Cart::default(),
    }
}

/// `get(id_of(e)) == e` and `id_of(get(id)) == id` for everything stored,
/// and raw indices are exactly `0..len`.
fn assert_consistent(reg: &MenuRegistry) {
    let all = reg.get_all();
    assert_eq!(all.len(), reg.len());
    for (i, entity) in all.iter().enumerate() {
        let id = reg.id_of(entity).expect("stored entity has an id");
        assert_eq!(reg.get(&id).as_ref(), Some(entity));
        assert_eq!(reg.raw_index_of(entity), Some(i));
        assert_eq!(reg.get_by_raw(i).as_ref(), Some(entity));
    }
    assert_eq!(reg.get_by_raw(all.len()), None);
}

#[test]
fn test_identity_maps_stay_inverse() {
    let reg = MenuRegistry::new("menus");
    reg.add("latte", menu("latte", 4500)).unwrap();
    reg.add("mocha", menu("mocha", 5000)).unwrap();
    reg.add("tea", menu("tea", 3000)).unwrap();
    assert_consistent(&reg);

    // Replace under an existing id.
    reg.add("mocha", menu("mocha", 5200)).unwrap();
    assert_consistent(&reg);
    assert_eq!(reg.get("mocha").map(|m| m.price), Some(5200));

    // Same value under a new id evicts the old id.
    reg.add("chai", menu("tea", 3000)).unwrap();
    assert_consistent(&reg);
    assert_eq!(reg.get("tea"), None);
    assert_eq!(reg.len(), 3);
}

#[test]
fn test_raw_indices_dense_after_removals() {
    let reg = MenuRegistry::new("menus");
    for (i, id) in ["a", "b", "c", "d", "e"].into_iter().enumerate() {
        reg.add(id, menu(id, i as i64)).unwrap();
    }

    assert!(reg.remove("b").unwrap());
    assert!(reg.remove("d").unwrap());
    assert!(!reg.remove("zzz").unwrap());
    assert_consistent(&reg);

    let ids: Vec<String> = reg.get_all().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, ["a", "c", "e"]);
    assert_eq!(reg.raw_index_of(&menu("e", 4)), Some(2));
}

#[test]
fn test_order_dedup_by_order_id() {
    let reg = OrderRegistry::new("order");
    reg.add("7", order(7, OrderStatus::Pending)).unwrap();
    reg.add("anything", order(7, OrderStatus::Accepted)).unwrap();

    assert_eq!(reg.len(), 1);
    assert_eq!(reg.get("7").map(|o| o.status), Some(OrderStatus::Accepted));
}

#[test]
fn test_orders_listed_descending() {
    let reg = OrderRegistry::new("order");
    reg.add_all(vec![
        order(2, OrderStatus::Pending),
        order(10, OrderStatus::Pending),
        order(5, OrderStatus::Canceled),
        order(1, OrderStatus::Accepted),
    ])
    .unwrap();

    let ids: Vec<i64> = reg.get_all().into_iter().map(|o| o.order_id).collect();
    assert_eq!(ids, [10, 5, 2, 1]);
}

#[test]
fn test_frozen_mutations_fail_without_change() {
    let reg = MenuRegistry::new("menus");
    reg.add_all(vec![menu("latte", 4500), menu("tea", 3000)]).unwrap();
    reg.freeze();
    let before = reg.get_all();

    assert!(matches!(
        reg.add("mocha", menu("mocha", 5000)),
        Err(RegistryError::Frozen { .. })
    ));
    assert!(matches!(
        reg.add_all(vec![menu("x", 1), menu("y", 2)]),
        Err(RegistryError::Frozen { .. })
    ));
    assert!(matches!(reg.remove("latte"), Err(RegistryError::Frozen { .. })));
    assert!(matches!(reg.clear(), Err(RegistryError::Frozen { .. })));

    assert_eq!(reg.get_all(), before);

    reg.unfreeze();
    reg.add("mocha", menu("mocha", 5000)).unwrap();
    assert_eq!(reg.len(), 3);
}

#[test]
fn test_replace_all_swaps_contents_and_refreezes() {
    let reg = MenuRegistry::new("menus");
    reg.add_all(vec![menu("old", 1)]).unwrap();
    reg.freeze();

    reg.replace_all(vec![menu("new-a", 2), menu("new-b", 3)]);

    assert!(reg.is_frozen());
    assert_eq!(reg.get("old"), None);
    assert_eq!(reg.len(), 2);
    assert_consistent(&reg);
}

#[test]
fn test_concurrent_transactions_never_interleave() {
    let reg = Arc::new(MenuRegistry::new("menus"));
    reg.freeze();

    // Each writer replaces the whole registry with its own batch of ten.
    // Readers must only ever see one complete batch.
    let writers: Vec<_> = (0..4)
        .map(|w| {
            let reg = Arc::clone(&reg);
            thread::spawn(move || {
                for round in 0..50 {
                    let batch = (0..10)
                        .map(|i| menu(&format!("w{w}-{i}"), round))
                        .collect();
                    reg.replace_all(batch);
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let reg = Arc::clone(&reg);
            thread::spawn(move || {
                for _ in 0..200 {
                    let snapshot = reg.get_all();
                    if snapshot.is_empty() {
                        continue;
                    }
                    assert_eq!(snapshot.len(), 10);
                    let writer = &snapshot[0].id[..2];
                    let price = snapshot[0].price;
                    assert!(snapshot.iter().all(|m| m.id.starts_with(writer)));
                    assert!(snapshot.iter().all(|m| m.price == price));
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().expect("thread panicked");
    }
    assert!(reg.is_frozen());
}

#[test]
fn test_freeze_orders_against_mutation() {
    let reg = Arc::new(MenuRegistry::new("menus"));

    // Either the add lands before the freeze or fails after it; it never
    // half-applies.
    let adder = {
        let reg = Arc::clone(&reg);
        thread::spawn(move || {
            (0..100)
                .map(|i| reg.add(&format!("m{i}"), menu(&format!("m{i}"), i)).is_ok())
                .filter(|ok| *ok)
                .count()
        })
    };
    let freezer = {
        let reg = Arc::clone(&reg);
        thread::spawn(move || reg.freeze())
    };

    let added = adder.join().unwrap();
    freezer.join().unwrap();
    assert_eq!(reg.len(), added);
    assert!(reg.is_frozen());
}
