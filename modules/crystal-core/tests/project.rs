//! Project lifecycle and catalog tests (no network involved).

use crystal_core::{CrystalError, GroupSource, Project};

async fn create_project(dir: &std::path::Path) -> Project {
    Project::create(dir.join("test.crystalproj")).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resources_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let project = create_project(dir.path()).await;
    let resource = project
        .create_resource("https://example.com/page")
        .await
        .unwrap();
    project.close().await;

    let project = Project::open(dir.path().join("test.crystalproj"), false)
        .await
        .unwrap();
    let resources = project.resources().await;
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].id, resource.id);
    assert_eq!(resources[0].url, "https://example.com/page");
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resource_urls_are_unique_and_fragment_free() {
    let dir = tempfile::tempdir().unwrap();
    let project = create_project(dir.path()).await;

    let a = project
        .create_resource("https://example.com/page#intro")
        .await
        .unwrap();
    assert_eq!(a.url, "https://example.com/page");

    // Same URL with a different fragment resolves to the same resource
    let b = project
        .create_resource("https://example.com/page#outro")
        .await
        .unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(project.resources().await.len(), 1);
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_most_one_root_resource_per_resource() {
    let dir = tempfile::tempdir().unwrap();
    let project = create_project(dir.path()).await;
    let resource = project
        .create_resource("https://example.com/")
        .await
        .unwrap();

    project.create_root_resource("Home", resource.id).await.unwrap();
    let err = project
        .create_root_resource("Home again", resource.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CrystalError::RootResourceAlreadyExists));
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_root_resource_clears_group_sources() {
    let dir = tempfile::tempdir().unwrap();
    let project = create_project(dir.path()).await;
    let resource = project
        .create_resource("https://example.com/archive")
        .await
        .unwrap();
    let root = project.create_root_resource("Archive", resource.id).await.unwrap();
    let group = project
        .create_resource_group(
            "Pages",
            "https://example.com/page/#",
            Some(GroupSource::RootResource(root.id)),
            false,
        )
        .await
        .unwrap();

    project.delete_root_resource(root.id).await.unwrap();

    let groups = project.resource_groups().await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].id, group.id);
    assert_eq!(groups[0].source, None);
    assert!(project.root_resources().await.is_empty());
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn group_source_cycles_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let project = create_project(dir.path()).await;
    let a = project
        .create_resource_group("A", "https://example.com/a/**", None, false)
        .await
        .unwrap();
    let b = project
        .create_resource_group(
            "B",
            "https://example.com/b/**",
            Some(GroupSource::Group(a.id)),
            false,
        )
        .await
        .unwrap();

    // a -> b would close the loop b -> a
    let err = project
        .set_group_source(a.id, Some(GroupSource::Group(b.id)))
        .await
        .unwrap_err();
    assert!(matches!(err, CrystalError::GroupSourceCycle));

    // Self-source is the smallest cycle
    let err = project
        .set_group_source(a.id, Some(GroupSource::Group(a.id)))
        .await
        .unwrap_err();
    assert!(matches!(err, CrystalError::GroupSourceCycle));
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_group_clears_dependent_sources() {
    let dir = tempfile::tempdir().unwrap();
    let project = create_project(dir.path()).await;
    let a = project
        .create_resource_group("A", "https://example.com/a/**", None, false)
        .await
        .unwrap();
    let b = project
        .create_resource_group(
            "B",
            "https://example.com/b/**",
            Some(GroupSource::Group(a.id)),
            false,
        )
        .await
        .unwrap();

    project.delete_resource_group(a.id).await.unwrap();

    let groups = project.resource_groups().await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].id, b.id);
    assert_eq!(groups[0].source, None);
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn group_membership_is_derived_from_the_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let project = create_project(dir.path()).await;
    project
        .create_resource("https://example.com/post/1")
        .await
        .unwrap();
    project
        .create_resource("https://example.com/post/2")
        .await
        .unwrap();
    project
        .create_resource("https://example.com/about")
        .await
        .unwrap();

    let group = project
        .create_resource_group("Posts", "https://example.com/post/#", None, false)
        .await
        .unwrap();
    let members = project.group_members(group.id).await.unwrap();
    let urls: Vec<&str> = members.iter().map(|m| m.url.as_str()).collect();
    assert_eq!(
        urls,
        vec!["https://example.com/post/1", "https://example.com/post/2"]
    );

    // A resource created later extends the membership
    project
        .create_resource("https://example.com/post/3")
        .await
        .unwrap();
    assert_eq!(project.group_members(group.id).await.unwrap().len(), 3);
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_group_pattern_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let project = create_project(dir.path()).await;
    let err = project
        .create_resource_group("Bad", "", None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, CrystalError::Pattern(_)));
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_only_projects_refuse_writes() {
    let dir = tempfile::tempdir().unwrap();
    let project = create_project(dir.path()).await;
    project
        .create_resource("https://example.com/")
        .await
        .unwrap();
    project.close().await;

    let project = Project::open(dir.path().join("test.crystalproj"), true)
        .await
        .unwrap();
    assert!(project.readonly());
    let err = project
        .create_resource("https://example.com/other")
        .await
        .unwrap_err();
    assert!(matches!(err, CrystalError::ProjectReadOnly));
    // Reads still work
    assert_eq!(project.resources().await.len(), 1);
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn newer_format_versions_refuse_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let project = create_project(dir.path()).await;
    project
        .set_property("major_version", Some("99"))
        .await
        .unwrap();
    project.close().await;

    let err = Project::open(dir.path().join("test.crystalproj"), false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CrystalError::ProjectTooNew { found: 99, supported: _ }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_project_directories_refuse_to_open() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("random.txt"), b"hello").unwrap();
    let err = Project::open(dir.path(), false).await.unwrap_err();
    assert!(matches!(err, CrystalError::NotAProject(_)));

    let err = Project::open(dir.path().join("absent.crystalproj"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, CrystalError::NotAProject(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn properties_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let project = create_project(dir.path()).await;
    project
        .set_default_url_prefix(Some("https://example.com"))
        .await
        .unwrap();
    project.close().await;

    let project = Project::open(dir.path().join("test.crystalproj"), false)
        .await
        .unwrap();
    assert_eq!(
        project.property("default_url_prefix").await.as_deref(),
        Some("https://example.com")
    );
    assert_eq!(
        project.display_url("https://example.com/a/b").await,
        "/a/b"
    );
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_resource_cascades() {
    let dir = tempfile::tempdir().unwrap();
    let project = create_project(dir.path()).await;
    let resource = project
        .create_resource("https://example.com/goner")
        .await
        .unwrap();
    project.create_root_resource("Goner", resource.id).await.unwrap();

    project.delete_resource(resource.id).await.unwrap();
    assert!(project.resources().await.is_empty());
    assert!(project.root_resources().await.is_empty());

    // The URL can be registered again afterwards, with a fresh id
    let again = project
        .create_resource("https://example.com/goner")
        .await
        .unwrap();
    assert_ne!(again.id, resource.id);
    project.close().await;
}
