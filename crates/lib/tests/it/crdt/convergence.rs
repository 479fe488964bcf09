//! Merge laws checked on every model.

use convergent::crdt::{CrdtModel, CrdtSet, Primitive};

use super::helpers::*;

fn assert_commutative<M>(replicas: &[M])
where
    M: CrdtModel,
    M::ConsumerView: PartialEq + std::fmt::Debug,
{
    for a in replicas {
        for b in replicas {
            let ab = merged(a, b);
            let ba = merged(b, a);
            assert_eq!(ab.consumer_view(), ba.consumer_view());
            assert_eq!(ab.version_map(), ba.version_map());
        }
    }
}

fn assert_associative<M>(replicas: &[M])
where
    M: CrdtModel,
    M::ConsumerView: PartialEq + std::fmt::Debug,
{
    let [a, b, c] = replicas else {
        panic!("expected three replicas");
    };
    let left = merged(&merged(a, b), c);
    let right = merged(a, &merged(b, c));
    assert_eq!(left.consumer_view(), right.consumer_view());
    assert_eq!(left.version_map(), right.version_map());
}

fn assert_idempotent<M: CrdtModel>(replicas: &[M]) {
    for replica in replicas {
        let mut model = replica.clone();
        let changes = model.merge(replica.data()).unwrap();
        assert!(changes.is_empty(), "self merge produced {changes:?}");
        assert_eq!(model.data(), replica.data());
    }
}

fn assert_dominates_inputs<M: CrdtModel>(replicas: &[M]) {
    for a in replicas {
        for b in replicas {
            let result = merged(a, b).version_map();
            assert!(result.dominates(&a.version_map()));
            assert!(result.dominates(&b.version_map()));
        }
    }
}

#[test]
fn test_set_merge_laws() {
    let replicas = set_replicas();
    assert_commutative(&replicas);
    assert_associative(&replicas);
    assert_idempotent(&replicas);
    assert_dominates_inputs(&replicas);
}

#[test]
fn test_singleton_merge_laws() {
    let replicas = singleton_replicas();
    assert_commutative(&replicas);
    assert_associative(&replicas);
    assert_idempotent(&replicas);
    assert_dominates_inputs(&replicas);
}

#[test]
fn test_entity_merge_laws() {
    let replicas = entity_replicas();
    assert_commutative(&replicas);
    assert_associative(&replicas);
    assert_idempotent(&replicas);
    assert_dominates_inputs(&replicas);
}

#[test]
fn test_count_merge_laws() {
    let replicas = count_replicas();
    assert_commutative(&replicas);
    assert_associative(&replicas);
    assert_idempotent(&replicas);
    assert_dominates_inputs(&replicas);
}

#[test]
fn test_set_merge_result() {
    let replicas = set_replicas();
    let all = merged(&merged(&replicas[0], &replicas[1]), &replicas[2]);
    assert_eq!(
        all.consumer_view(),
        vec![text("apple"), text("banana"), text("berry")]
    );
}

#[test]
fn test_other_change_catches_the_other_side_up() {
    let replicas = set_replicas();
    let (a, b) = (&replicas[0], &replicas[1]);

    let mut model = a.clone();
    let changes = model.merge(b.data()).unwrap();
    let convergent::crdt::CrdtChange::Operations(ops) = changes.other_change else {
        panic!("set merges produce operations for the other side");
    };
    assert!(!ops.is_empty());

    let mut other: CrdtSet<Primitive> = b.clone();
    for op in &ops {
        apply(&mut other, op.clone());
    }
    assert_eq!(other.data(), model.data());
}

#[test]
fn test_concurrent_singletons_agree_on_one_value() {
    let replicas = singleton_replicas();
    let ab = merged(&replicas[0], &replicas[1]);
    let ba = merged(&replicas[1], &replicas[0]);
    assert_eq!(ab.consumer_view(), Some(text("left")));
    assert_eq!(ba.consumer_view(), Some(text("left")));
}

#[test]
fn test_entity_fields_merge_independently() {
    let replicas = entity_replicas();
    let raw = merged(&replicas[0], &replicas[1]).consumer_view();
    assert_eq!(raw.id, "e1");
    assert_eq!(raw.singletons["name"], Some(text("Ada")));
    assert!(raw.collections["tags"].contains(&text("math")));
    assert!(raw.collections["tags"].contains(&text("engines")));
}

#[test]
fn test_count_merge_sums_actors() {
    let replicas = count_replicas();
    let total = merged(&replicas[0], &replicas[1]);
    assert_eq!(total.consumer_view(), 7);
    assert_eq!(total.actor_value("a"), 2);
    assert_eq!(total.actor_value("b"), 5);
}
