//! End-to-end download tests against a local origin server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::Response;
use axum::Router;

use crystal_core::{CrystalError, DownloadConfig, Project};

// === Local origin server ===

#[derive(Clone)]
struct Page {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

#[derive(Clone)]
struct Hit {
    path: String,
    cookie: Option<String>,
}

#[derive(Clone, Default)]
struct Site {
    pages: Arc<Mutex<HashMap<String, Page>>>,
    hits: Arc<Mutex<Vec<Hit>>>,
}

impl Site {
    fn new() -> Site {
        Site::default()
    }

    fn page(&self, path: &str, content_type: &'static str, body: &str) {
        self.page_with_status(path, 200, content_type, body.as_bytes());
    }

    fn page_with_status(&self, path: &str, status: u16, content_type: &'static str, body: &[u8]) {
        self.pages.lock().unwrap().insert(
            path.to_string(),
            Page {
                status,
                content_type,
                body: body.to_vec(),
            },
        );
    }

    /// A 302 page; the handler turns the marker body into a Location header.
    fn redirect(&self, path: &str, location: &str) {
        self.page_with_status(
            path,
            302,
            "text/html",
            format!("@redirect:{location}").as_bytes(),
        );
    }

    fn requested_paths(&self) -> Vec<String> {
        self.hits.lock().unwrap().iter().map(|h| h.path.clone()).collect()
    }

    fn cookies_seen(&self) -> Vec<Option<String>> {
        self.hits.lock().unwrap().iter().map(|h| h.cookie.clone()).collect()
    }

    async fn serve(&self) -> String {
        let app = Router::new().fallback(handler).with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }
}

async fn handler(State(site): State<Site>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_string();
    site.hits.lock().unwrap().push(Hit {
        path: path.clone(),
        cookie: headers
            .get(header::COOKIE)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned()),
    });
    let page = site.pages.lock().unwrap().get(&path).cloned();
    match page {
        Some(page) => {
            if let Some(location) = page
                .body
                .strip_prefix(b"@redirect:".as_slice())
                .map(|b| String::from_utf8_lossy(b).into_owned())
            {
                return Response::builder()
                    .status(StatusCode::FOUND)
                    .header(header::LOCATION, location)
                    .header(header::CONTENT_TYPE, page.content_type)
                    .body(Body::from("moved"))
                    .unwrap();
            }
            Response::builder()
                .status(page.status)
                .header(header::CONTENT_TYPE, page.content_type)
                .body(Body::from(page.body))
                .unwrap()
        }
        None => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(header::CONTENT_TYPE, "text/html")
            .body(Body::from("<html>not found</html>"))
            .unwrap(),
    }
}

// === Helpers ===

fn test_config() -> DownloadConfig {
    DownloadConfig {
        delay_between_downloads: Duration::from_millis(1),
        poll_interval: Duration::from_millis(5),
        ..DownloadConfig::default()
    }
}

async fn open_project(dir: &std::path::Path) -> Project {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Project::open_with(&dir.join("test.crystalproj"), false, test_config(), None)
        .await
        .unwrap()
}

// === Scenarios ===

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn page_with_embedded_image_downloads_both() {
    let site = Site::new();
    site.page(
        "/index.html",
        "text/html",
        r#"<html><img src="/a.png"></html>"#,
    );
    site.page_with_status("/a.png", 200, "image/png", b"\x89PNG fake");
    let base = site.serve().await;

    let dir = tempfile::tempdir().unwrap();
    let project = open_project(dir.path()).await;
    let resource = project
        .create_resource(&format!("{base}/index.html"))
        .await
        .unwrap();

    let mut handle = project.download_resource(resource.id, true).await.unwrap();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.revision.status_code(), Some(200));
    assert!(result.did_download);

    project.wait_for_tasks().await;
    assert_eq!(site.requested_paths(), vec!["/index.html", "/a.png"]);

    // Both resources exist with one successful revision each
    let resources = project.resources().await;
    assert_eq!(resources.len(), 2);
    for resource in &resources {
        let revisions = project.revisions(resource.id).await.unwrap();
        assert_eq!(revisions.len(), 1);
        assert!(revisions[0].error.is_none());
        let body = project.read_revision_body(&revisions[0]).await.unwrap();
        assert!(!body.is_empty());
    }
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_page_schedules_no_embedded_children() {
    let site = Site::new();
    site.page_with_status(
        "/missing.html",
        404,
        "text/html",
        br#"<html><img src="/a.png"></html>"#,
    );
    let base = site.serve().await;

    let dir = tempfile::tempdir().unwrap();
    let project = open_project(dir.path()).await;
    let resource = project
        .create_resource(&format!("{base}/missing.html"))
        .await
        .unwrap();

    let mut handle = project.download_resource(resource.id, true).await.unwrap();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.revision.status_code(), Some(404));

    project.wait_for_tasks().await;
    assert_eq!(site.requested_paths(), vec!["/missing.html"]);
    assert_eq!(project.resources().await.len(), 1);
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn embedded_self_reference_terminates() {
    let site = Site::new();
    site.page("/p.html", "text/html", r#"<img src="/q.html">"#);
    site.page("/q.html", "text/html", r#"<img src="/q.html">"#);
    let base = site.serve().await;

    let dir = tempfile::tempdir().unwrap();
    let project = open_project(dir.path()).await;
    let resource = project
        .create_resource(&format!("{base}/p.html"))
        .await
        .unwrap();

    project.download_resource(resource.id, false).await.unwrap();
    project.wait_for_tasks().await;

    assert_eq!(site.requested_paths(), vec!["/p.html", "/q.html"]);
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn embedded_recursion_stops_at_depth_ceiling() {
    let site = Site::new();
    site.page("/a.html", "text/html", r#"<img src="/b.html">"#);
    site.page("/b.html", "text/html", r#"<img src="/c.html">"#);
    site.page("/c.html", "text/html", r#"<img src="/d.html">"#);
    site.page("/d.html", "text/html", r#"<img src="/e.html">"#);
    site.page("/e.html", "text/html", r#"<img src="/f.html">"#);
    let base = site.serve().await;

    let dir = tempfile::tempdir().unwrap();
    let project = open_project(dir.path()).await;
    let resource = project
        .create_resource(&format!("{base}/a.html"))
        .await
        .unwrap();

    project.download_resource(resource.id, false).await.unwrap();
    project.wait_for_tasks().await;

    assert_eq!(
        site.requested_paths(),
        vec!["/a.html", "/b.html", "/c.html", "/d.html"]
    );
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_download_reuses_cached_revision() {
    let site = Site::new();
    site.page("/page.html", "text/html", "<html>hello</html>");
    let base = site.serve().await;

    let dir = tempfile::tempdir().unwrap();
    let project = open_project(dir.path()).await;
    let resource = project
        .create_resource(&format!("{base}/page.html"))
        .await
        .unwrap();

    let mut first = project.download_resource(resource.id, true).await.unwrap();
    let first_result = first.wait().await.unwrap();
    project.wait_for_tasks().await;

    let mut second = project.download_resource(resource.id, true).await.unwrap();
    let second_result = second.wait().await.unwrap();
    project.wait_for_tasks().await;

    assert_eq!(first_result.revision.id, second_result.revision.id);
    assert!(!second_result.did_download);
    assert_eq!(site.requested_paths(), vec!["/page.html"]);
    assert_eq!(project.revisions(resource.id).await.unwrap().len(), 1);
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn implicit_favicon_is_fetched_for_site_root() {
    let site = Site::new();
    site.page("/", "text/html", "<html>root</html>");
    let base = site.serve().await;

    let dir = tempfile::tempdir().unwrap();
    let project = open_project(dir.path()).await;
    let resource = project.create_resource(&format!("{base}/")).await.unwrap();

    project.download_resource(resource.id, false).await.unwrap();
    project.wait_for_tasks().await;

    assert_eq!(site.requested_paths(), vec!["/", "/favicon.ico"]);
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirects_archive_their_target() {
    let site = Site::new();
    site.redirect("/old.html", "/new.html");
    site.page("/new.html", "text/html", "<html>new home</html>");
    let base = site.serve().await;

    let dir = tempfile::tempdir().unwrap();
    let project = open_project(dir.path()).await;
    let resource = project
        .create_resource(&format!("{base}/old.html"))
        .await
        .unwrap();

    let mut handle = project.download_resource(resource.id, true).await.unwrap();
    let result = handle.wait().await.unwrap();
    assert!(result.revision.is_redirect());
    assert_eq!(result.revision.redirect_url(), Some("/new.html"));

    project.wait_for_tasks().await;
    assert_eq!(site.requested_paths(), vec!["/old.html", "/new.html"]);
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn configured_cookie_is_sent_when_in_scope() {
    let site = Site::new();
    site.page("/private.html", "text/html", "<html>secret</html>");
    let base = site.serve().await;

    let dir = tempfile::tempdir().unwrap();
    let project = open_project(dir.path()).await;
    project
        .set_request_cookie(Some("session=abc123"))
        .await
        .unwrap();
    let resource = project
        .create_resource(&format!("{base}/private.html"))
        .await
        .unwrap();

    project.download_resource(resource.id, false).await.unwrap();
    project.wait_for_tasks().await;

    assert_eq!(
        site.cookies_seen(),
        vec![Some("session=abc123".to_string())]
    );
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn do_not_download_group_members_are_skipped() {
    let site = Site::new();
    site.page(
        "/page.html",
        "text/html",
        r#"<img src="/ad.png"><img src="/photo.png">"#,
    );
    site.page_with_status("/ad.png", 200, "image/png", b"ad");
    site.page_with_status("/photo.png", 200, "image/png", b"photo");
    let base = site.serve().await;

    let dir = tempfile::tempdir().unwrap();
    let project = open_project(dir.path()).await;
    project
        .create_resource_group("Ads", "**/ad.png", None, true)
        .await
        .unwrap();
    let resource = project
        .create_resource(&format!("{base}/page.html"))
        .await
        .unwrap();

    project.download_resource(resource.id, false).await.unwrap();
    project.wait_for_tasks().await;

    assert_eq!(site.requested_paths(), vec!["/page.html", "/photo.png"]);
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn group_download_discovers_members_from_source() {
    let site = Site::new();
    site.page(
        "/list.html",
        "text/html",
        r#"<a href="/page/1.html">one</a><a href="/page/2.html">two</a>"#,
    );
    site.page("/page/1.html", "text/html", "<html>one</html>");
    site.page("/page/2.html", "text/html", "<html>two</html>");
    let base = site.serve().await;

    let dir = tempfile::tempdir().unwrap();
    let project = open_project(dir.path()).await;
    let list = project
        .create_resource(&format!("{base}/list.html"))
        .await
        .unwrap();
    let root = project.create_root_resource("List", list.id).await.unwrap();
    let group = project
        .create_resource_group(
            "Pages",
            &format!("{base}/page/#.html"),
            Some(crystal_core::GroupSource::RootResource(root.id)),
            false,
        )
        .await
        .unwrap();

    project.download_resource_group(group.id).await.unwrap();
    project.wait_for_tasks().await;

    let paths = site.requested_paths();
    assert_eq!(paths[0], "/list.html");
    assert!(paths.contains(&"/page/1.html".to_string()));
    assert!(paths.contains(&"/page/2.html".to_string()));
    assert_eq!(paths.len(), 3);

    // Membership is now cached and queryable
    let members = project.group_members(group.id).await.unwrap();
    assert_eq!(members.len(), 2);
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn group_members_with_existing_revisions_resume_without_refetch() {
    let site = Site::new();
    for i in 1..=4 {
        site.page(
            &format!("/c/{i}.html"),
            "text/html",
            &format!("<html>comic {i}</html>"),
        );
    }
    let base = site.serve().await;

    let dir = tempfile::tempdir().unwrap();
    let project = open_project(dir.path()).await;
    let group = project
        .create_resource_group("Comics", &format!("{base}/c/#.html"), None, false)
        .await
        .unwrap();
    for i in 1..=4 {
        project
            .create_resource(&format!("{base}/c/{i}.html"))
            .await
            .unwrap();
    }

    // First session: download members 1 and 2 individually, then stop.
    for i in 1..=2 {
        let resource = project
            .get_resource(&format!("{base}/c/{i}.html"))
            .await
            .unwrap();
        let mut handle = project.download_resource(resource.id, true).await.unwrap();
        handle.wait().await.unwrap();
    }
    project.wait_for_tasks().await;
    assert_eq!(site.requested_paths(), vec!["/c/1.html", "/c/2.html"]);
    project.close().await;

    // Second session: a full group download fetches only members 3 and 4.
    let project = open_project(dir.path()).await;
    project.download_resource_group(group.id).await.unwrap();
    project.wait_for_tasks().await;
    let paths = site.requested_paths();
    assert_eq!(paths.len(), 4);
    assert_eq!(&paths[2..], &["/c/3.html".to_string(), "/c/4.html".to_string()]);
    project.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_cancels_scheduling() {
    let site = Site::new();
    site.page("/page.html", "text/html", "<html>hello</html>");
    let base = site.serve().await;

    let dir = tempfile::tempdir().unwrap();
    let project = open_project(dir.path()).await;
    let resource = project
        .create_resource(&format!("{base}/page.html"))
        .await
        .unwrap();
    project.download_resource(resource.id, false).await.unwrap();
    project.close().await;

    // Enqueueing after close fails
    let err = project
        .download_resource(resource.id, true)
        .await
        .unwrap_err();
    assert!(matches!(err, CrystalError::ProjectClosed));
}
