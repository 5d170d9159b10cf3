//! Cache / ground-truth equivalence
//!
//! For random tuple sets over a small universe, every check answered through
//! the cache layers (result cache, Tiger bitmaps, Leopard closures, boundary
//! cache) must match a cache-free traversal, before and after revocations.

use auth_rebac::*;
use proptest::prelude::*;
use std::sync::Arc;

const USERS: [&str; 3] = ["alice", "bob", "carol"];
const GROUPS: [&str; 2] = ["eng", "ops"];
const RELATIONS: [&str; 3] = ["viewer", "editor", "owner"];
const DIRS: [&str; 2] = ["/a", "/a/b"];
const DIR_USERSETS: [&str; 2] = ["viewer", "editor"];

fn targets() -> Vec<Object> {
    vec![
        Object::dir("/a"),
        Object::dir("/a/b"),
        Object::file("/a/f1"),
        Object::file("/a/b/f2"),
        Object::file("/g"),
    ]
}

fn files() -> Vec<Object> {
    vec![Object::file("/a/f1"), Object::file("/a/b/f2"), Object::file("/g")]
}

/// One generated write: `(kind, a, b, c)` indexes into the universe.
fn tuple_for(op: (u8, usize, usize, usize)) -> RelationshipTuple {
    let (kind, a, b, c) = op;
    let user = Subject::user(USERS[a % USERS.len()]);
    let group = |i: usize| Object::new("group", GROUPS[i % GROUPS.len()]);
    let member_of = |i: usize| Subject::userset("group", GROUPS[i % GROUPS.len()], "member");
    // Usersets that are not group membership, e.g. `dir:/a#viewer`
    let dir_set = |i: usize, j: usize| Subject::userset("dir", DIRS[i % DIRS.len()], DIR_USERSETS[j % DIR_USERSETS.len()]);
    let relation = RELATIONS[b % RELATIONS.len()];
    let target = targets()[c % 5].clone();

    match kind % 7 {
        0 => RelationshipTuple::new(user, "member", group(b), "z1"),
        1 => RelationshipTuple::new(member_of(a), "member", group(b), "z1"),
        2 => RelationshipTuple::new(user, relation, target, "z1"),
        3 => RelationshipTuple::new(member_of(a), relation, target, "z1"),
        4 => RelationshipTuple::new(dir_set(a, c), "member", group(b), "z1"),
        5 => RelationshipTuple::new(dir_set(a, b), "viewer", target, "z1"),
        _ => RelationshipTuple::new(user, "blocked", files()[c % 3].clone(), "z1"),
    }
}

async fn assert_equivalent(engine: &RebacManager, consistency: Consistency) {
    for user in USERS {
        for object in targets() {
            for permission in ["viewer", "editor", "read"] {
                if permission == "read" && object.object_type != "file" {
                    continue;
                }
                let request = CheckRequest::new(Subject::user(user), permission, object.clone(), "z1");
                let truth = engine.check(&request, Consistency::Strong(None)).await.unwrap();
                // Twice: the second answer may come from a cache the first one filled
                for _ in 0..2 {
                    let outcome = engine.check_with_outcome(&request, consistency.clone()).await.unwrap();
                    assert_eq!(
                        outcome.allowed, truth,
                        "{} {} {} via {:?}",
                        user, permission, object, outcome.strategy
                    );
                }
            }
        }
    }
}

async fn run_case(writes: Vec<(u8, usize, usize, usize)>, deletions: Vec<bool>) {
    let engine = RebacManager::new(
        Arc::new(InMemoryTupleRepository::new()),
        Schema::filesystem(),
        EngineConfig::default(),
    )
    .unwrap();

    for (dir, child) in [
        ("/a", Object::dir("/a/b")),
        ("/a", Object::file("/a/f1")),
        ("/a/b", Object::file("/a/b/f2")),
    ] {
        engine
            .write(RelationshipTuple::new(Object::dir(dir).as_subject(), "parent", child, "z1"))
            .await
            .unwrap();
    }

    let mut written = Vec::new();
    for op in writes {
        let (id, _) = engine.write(tuple_for(op)).await.unwrap();
        written.push(id);
    }
    assert_equivalent(&engine, Consistency::Eventual).await;

    for (id, delete) in written.iter().zip(deletions) {
        if delete {
            engine.delete(*id).await.unwrap();
        }
    }
    assert_equivalent(&engine, Consistency::Eventual).await;
    assert_equivalent(&engine, Consistency::CloseToOpen(None)).await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn cached_checks_match_traversal(
        writes in prop::collection::vec((0u8..7, 0usize..3, 0usize..3, 0usize..5), 1..16),
        deletions in prop::collection::vec(any::<bool>(), 16),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_case(writes, deletions));
    }
}
