//! Shared Workspace Workflow Tests
//!
//! These tests walk through everyday file-sharing scenarios:
//! 1. Team folder: onboarding and offboarding through group membership
//! 2. Nested groups: company-wide handbook reached through team groups
//! 3. Contractor with time-bound access
//! 4. Partner organisation reading through a cross-zone share
//! 5. Sensitive file blocked inside an otherwise shared folder
//! 6. Listing what a user can open in a folder

use auth_rebac::*;
use chrono::{Duration, Utc};
use std::sync::Arc;

fn create_test_engine() -> RebacManager {
    let repo = Arc::new(InMemoryTupleRepository::new());
    RebacManager::new(repo, Schema::filesystem(), EngineConfig::default()).unwrap()
}

async fn link(engine: &RebacManager, dir: &str, child: Object) {
    engine
        .write(RelationshipTuple::new(Object::dir(dir).as_subject(), "parent", child, "acme"))
        .await
        .unwrap();
}

async fn can(engine: &RebacManager, user: &str, permission: &str, object: &Object) -> bool {
    let request = CheckRequest::new(Subject::user(user), permission, object.clone(), "acme");
    engine.check(&request, Consistency::Eventual).await.unwrap()
}

// ============================================================================
// TEST 1: Team Folder - Onboarding and Offboarding
// ============================================================================

#[tokio::test]
async fn test_team_folder_onboarding_and_offboarding() {
    println!("\n📁 TEST 1: Team Folder - Onboarding and Offboarding");
    let engine = create_test_engine();

    let roadmap = Object::file("/projects/platform/roadmap.md");
    link(&engine, "/projects", Object::dir("/projects/platform")).await;
    link(&engine, "/projects/platform", roadmap.clone()).await;

    println!("  ✓ platform team gets editor on /projects");
    engine
        .write(RelationshipTuple::new(
            Subject::userset("group", "platform", "member"),
            "editor",
            Object::dir("/projects"),
            "acme",
        ))
        .await
        .unwrap();

    assert!(!can(&engine, "dana", "editor", &roadmap).await);

    println!("  ✓ dana joins the platform team");
    let (membership, _) = engine
        .write(RelationshipTuple::new(
            Subject::user("dana"),
            "member",
            Object::new("group", "platform"),
            "acme",
        ))
        .await
        .unwrap();

    assert!(can(&engine, "dana", "editor", &roadmap).await);
    assert!(can(&engine, "dana", "viewer", &roadmap).await);

    println!("  ✓ dana leaves the team");
    engine.delete(membership).await.unwrap();
    assert!(!can(&engine, "dana", "editor", &roadmap).await);
    assert!(!can(&engine, "dana", "viewer", &roadmap).await);
}

// ============================================================================
// TEST 2: Nested Groups - Company Handbook
// ============================================================================

#[tokio::test]
async fn test_nested_groups_reach_company_handbook() {
    println!("\n📚 TEST 2: Nested Groups - Company Handbook");
    let engine = create_test_engine();
    let handbook = Object::file("/handbook.pdf");

    for team in ["platform", "sales"] {
        engine
            .write(RelationshipTuple::new(
                Subject::userset("group", team, "member"),
                "member",
                Object::new("group", "all-staff"),
                "acme",
            ))
            .await
            .unwrap();
    }
    engine
        .write(RelationshipTuple::new(
            Subject::userset("group", "all-staff", "member"),
            "viewer",
            handbook.clone(),
            "acme",
        ))
        .await
        .unwrap();
    engine
        .write(RelationshipTuple::new(
            Subject::user("erin"),
            "member",
            Object::new("group", "sales"),
            "acme",
        ))
        .await
        .unwrap();

    assert!(can(&engine, "erin", "viewer", &handbook).await);
    assert!(!can(&engine, "erin", "editor", &handbook).await);
    assert!(!can(&engine, "mallory", "viewer", &handbook).await);

    let tree = engine.expand("viewer", &handbook, "acme").await.unwrap();
    assert!(tree.leaf_subjects().contains(&Subject::user("erin")));
}

// ============================================================================
// TEST 3: Contractor - Time-Bound Access
// ============================================================================

#[tokio::test]
async fn test_contractor_time_bound_access() {
    println!("\n⏱️  TEST 3: Contractor - Time-Bound Access");
    let engine = create_test_engine();
    let specs = Object::dir("/specs");
    let api = Object::file("/specs/api.yaml");
    link(&engine, "/specs", api.clone()).await;

    println!("  ✓ frank gets viewer on /specs for one week");
    engine
        .write(
            RelationshipTuple::new(Subject::user("frank"), "viewer", specs.clone(), "acme")
                .with_expiry(Utc::now() + Duration::days(7)),
        )
        .await
        .unwrap();
    assert!(can(&engine, "frank", "viewer", &api).await);

    println!("  ✓ grace's engagement already ended");
    engine
        .write(
            RelationshipTuple::new(Subject::user("grace"), "viewer", specs, "acme")
                .with_expiry(Utc::now() - Duration::hours(1)),
        )
        .await
        .unwrap();
    assert!(!can(&engine, "grace", "viewer", &api).await);

    let purged = engine.purge_expired(Utc::now()).await.unwrap();
    assert_eq!(purged, 1);
    assert!(can(&engine, "frank", "viewer", &api).await);
}

// ============================================================================
// TEST 4: Partner Organisation - Cross-Zone Share
// ============================================================================

#[tokio::test]
async fn test_partner_reads_through_cross_zone_share() {
    println!("\n🤝 TEST 4: Partner Organisation - Cross-Zone Share");
    let engine = create_test_engine();
    let brief = Object::file("/partners/brief.md");
    let partner_check = |permission: &str| {
        CheckRequest::new(Subject::user("henry"), permission, brief.clone(), "acme").with_subject_zone("globex")
    };

    assert!(engine.check(&partner_check("viewer"), Consistency::Eventual).await.is_err());

    println!("  ✓ acme shares the brief with henry@globex");
    let (_, token) = engine
        .write(
            RelationshipTuple::new(Subject::user("henry"), "shared-viewer", brief.clone(), "acme")
                .with_subject_zone("globex"),
        )
        .await
        .unwrap();

    let view = engine
        .check(&partner_check("viewer"), Consistency::CloseToOpen(Some(token)))
        .await
        .unwrap();
    assert!(view);
    assert!(!engine.check(&partner_check("editor"), Consistency::Eventual).await.unwrap());

    // henry inside acme is a different principal
    assert!(!can(&engine, "henry", "viewer", &brief).await);
}

// ============================================================================
// TEST 5: Sensitive File - Blocked Inside a Shared Folder
// ============================================================================

#[tokio::test]
async fn test_blocked_file_inside_shared_folder() {
    println!("\n🔒 TEST 5: Sensitive File - Blocked Inside a Shared Folder");
    let engine = create_test_engine();
    let notes = Object::file("/finance/notes.md");
    let salaries = Object::file("/finance/salaries.csv");
    link(&engine, "/finance", notes.clone()).await;
    link(&engine, "/finance", salaries.clone()).await;

    engine
        .write(RelationshipTuple::new(Subject::user("ivan"), "viewer", Object::dir("/finance"), "acme"))
        .await
        .unwrap();
    assert!(can(&engine, "ivan", "read", &salaries).await);

    let (block, _) = engine
        .write(RelationshipTuple::new(Subject::user("ivan"), "blocked", salaries.clone(), "acme"))
        .await
        .unwrap();

    assert!(!can(&engine, "ivan", "read", &salaries).await);
    assert!(can(&engine, "ivan", "read", &notes).await);

    println!("  ✓ lifting the block restores read");
    engine.delete(block).await.unwrap();
    assert!(can(&engine, "ivan", "read", &salaries).await);
}

// ============================================================================
// TEST 6: Folder Listing
// ============================================================================

#[tokio::test]
async fn test_list_files_in_folder() {
    println!("\n🗂️  TEST 6: Folder Listing");
    let engine = create_test_engine();

    for name in ["a.txt", "b.txt", "c.txt"] {
        link(&engine, "/shared", Object::file(&format!("/shared/{}", name))).await;
    }
    engine
        .write(RelationshipTuple::new(Subject::user("judy"), "viewer", Object::dir("/shared"), "acme"))
        .await
        .unwrap();
    engine
        .write(RelationshipTuple::new(Subject::user("judy"), "owner", Object::file("/private/d.txt"), "acme"))
        .await
        .unwrap();

    let request = ListObjectsRequest::new(Subject::user("judy"), "viewer", "file", "acme").with_prefix("/shared");
    let page = engine.list_objects(&request).await.unwrap();
    let mut ids: Vec<_> = page.objects.iter().map(|o| o.object_id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec!["/shared/a.txt", "/shared/b.txt", "/shared/c.txt"]);

    let everything = ListObjectsRequest::new(Subject::user("judy"), "viewer", "file", "acme");
    assert_eq!(engine.list_objects(&everything).await.unwrap().objects.len(), 4);

    assert!(engine
        .is_directory_visible(&Subject::user("judy"), "viewer", &Object::dir("/private"), "acme")
        .await
        .unwrap());
}
