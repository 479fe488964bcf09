use convergent::crdt::{
    CountOperation, CrdtCount, CrdtEntity, CrdtModel, CrdtSet, CrdtSingleton, EntityOperation,
    Primitive, SetOperation, SingletonOperation, VersionMap,
};

pub fn text(s: &str) -> Primitive {
    Primitive::from(s)
}

pub fn add(actor: &str, clock: VersionMap, value: &str) -> SetOperation<Primitive> {
    SetOperation::Add {
        actor: actor.into(),
        clock,
        added: text(value),
    }
}

pub fn remove(actor: &str, clock: VersionMap, value: &str) -> SetOperation<Primitive> {
    SetOperation::Remove {
        actor: actor.into(),
        clock,
        removed: text(value),
    }
}

/// Apply `op`, failing the test if it is rejected.
pub fn apply<M: CrdtModel>(model: &mut M, op: M::Operation) {
    let applied = model.apply_operation(&op).expect("operation errored");
    assert!(applied, "operation was rejected: {op:?}");
}

/// Merge `other` into a copy of `model`.
pub fn merged<M: CrdtModel>(model: &M, other: &M) -> M {
    let mut result = model.clone();
    result.merge(other.data()).expect("merge failed");
    result
}

/// Three set replicas that diverged from a common base holding "shared".
///
/// - `a` added "apple" and removed "shared"
/// - `b` added "banana" and "berry"
/// - `c` only observed the base
pub fn set_replicas() -> Vec<CrdtSet<Primitive>> {
    let mut base = CrdtSet::new();
    apply(&mut base, add("base", VersionMap::from([("base", 1)]), "shared"));

    let mut a = base.clone();
    apply(&mut a, add("a", VersionMap::from([("base", 1), ("a", 1)]), "apple"));
    apply(&mut a, remove("a", VersionMap::from([("base", 1), ("a", 1)]), "shared"));

    let mut b = base.clone();
    apply(&mut b, add("b", VersionMap::from([("base", 1), ("b", 1)]), "banana"));
    apply(&mut b, add("b", VersionMap::from([("base", 1), ("b", 2)]), "berry"));

    let c = base;
    vec![a, b, c]
}

/// Two singleton replicas updated concurrently from an empty start.
pub fn singleton_replicas() -> Vec<CrdtSingleton<Primitive>> {
    let mut a = CrdtSingleton::new();
    apply(
        &mut a,
        SingletonOperation::Update {
            actor: "a".into(),
            clock: VersionMap::from([("a", 1)]),
            value: text("left"),
        },
    );
    let mut b = CrdtSingleton::new();
    apply(
        &mut b,
        SingletonOperation::Update {
            actor: "b".into(),
            clock: VersionMap::from([("b", 1)]),
            value: text("right"),
        },
    );
    vec![a, b, CrdtSingleton::new()]
}

/// Entity replicas of record "e1" edited by different actors.
///
/// Field operations are versioned per field, so each field starts at 1.
pub fn entity_replicas() -> Vec<CrdtEntity> {
    let base = CrdtEntity::with_fields("e1", ["name"], ["tags"]);

    let mut a = base.clone();
    apply(
        &mut a,
        EntityOperation::SetSingleton {
            actor: "a".into(),
            clock: VersionMap::from([("a", 1)]),
            field: "name".into(),
            value: text("Ada"),
        },
    );
    apply(
        &mut a,
        EntityOperation::AddToSet {
            actor: "a".into(),
            clock: VersionMap::from([("a", 1)]),
            field: "tags".into(),
            added: text("math"),
        },
    );

    let mut b = base.clone();
    apply(
        &mut b,
        EntityOperation::AddToSet {
            actor: "b".into(),
            clock: VersionMap::from([("b", 1)]),
            field: "tags".into(),
            added: text("engines"),
        },
    );
    vec![a, b, base]
}

/// Count replicas incremented by different actors.
pub fn count_replicas() -> Vec<CrdtCount> {
    let mut a = CrdtCount::new();
    apply(
        &mut a,
        CountOperation::Increment {
            actor: "a".into(),
            clock: VersionMap::from([("a", 1)]),
        },
    );
    apply(
        &mut a,
        CountOperation::Increment {
            actor: "a".into(),
            clock: VersionMap::from([("a", 2)]),
        },
    );
    let mut b = CrdtCount::new();
    apply(
        &mut b,
        CountOperation::MultiIncrement {
            actor: "b".into(),
            clock: VersionMap::from([("b", 3)]),
            delta: 5,
        },
    );
    vec![a, b, CrdtCount::new()]
}
