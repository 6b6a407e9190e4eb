//! End-to-end tests for cross-document completion, references and rename.
//!
//! These drive the dispatch layer against a `WorldState` backed by an
//! in-memory request service, the same way the LSP backend does minus the
//! transport.
//!
//! Run with: `cargo test -p classlink --test scenarios`

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use classlink::config::ServerConfig;
use classlink::dispatch::{self, Outcome};
use classlink::document::TextDocument;
use classlink::language::LanguageId;
use classlink::request::{FetchError, RequestService};
use classlink::state::{ensure_scanned, WorldState};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{
    CompletionItem, CompletionResponse, Position, TextDocumentContentChangeEvent, Url,
};

// ============================================================================
// Test Helpers
// ============================================================================

/// Files by `file` URL and remote stylesheets by their real `http(s)` URL.
#[derive(Default)]
struct StaticContent {
    files: Mutex<HashMap<Url, Result<String, FetchError>>>,
}

impl StaticContent {
    fn set(&self, uri: &Url, text: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(uri.clone(), Ok(text.to_string()));
    }

    fn fail(&self, uri: &Url, error: FetchError) {
        self.files.lock().unwrap().insert(uri.clone(), Err(error));
    }

    fn get(&self, uri: &Url) -> Result<String, FetchError> {
        self.files
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::NotFound(uri.to_string())))
    }
}

#[async_trait]
impl RequestService for StaticContent {
    async fn get_file_content(&self, uri: &Url) -> Result<String, FetchError> {
        self.get(uri)
    }

    async fn get_http_content(&self, uri: &Url) -> Result<String, FetchError> {
        self.get(uri)
    }
}

struct Fixture {
    state: Arc<RwLock<WorldState>>,
    content: Arc<StaticContent>,
    root: Url,
}

impl Fixture {
    /// No workspace scan: only forward references are followed.
    fn new() -> Self {
        Self::with_config(
            Url::parse("file:///site/").unwrap(),
            ServerConfig {
                workspace_scan: false,
                ..ServerConfig::default()
            },
        )
    }

    /// Scans `dir`, whose files are also served by the request service.
    fn scanned(dir: &Path) -> Self {
        let root = Url::from_directory_path(dir).unwrap();
        let fixture = Self::with_config(root.clone(), ServerConfig::default());
        fixture.state.try_write().unwrap().workspace_folders.push(root);
        fixture
    }

    fn with_config(root: Url, config: ServerConfig) -> Self {
        let content = Arc::new(StaticContent::default());
        let state = WorldState::new(config, content.clone());
        Self {
            state: Arc::new(RwLock::new(state)),
            content,
            root,
        }
    }

    fn url(&self, name: &str) -> Url {
        self.root.join(name).unwrap()
    }

    /// Serve `text` for `name`, writing it to disk too for scanned fixtures.
    fn file(&self, name: &str, text: &str) -> Url {
        let uri = self.url(name);
        if let Ok(path) = uri.to_file_path() {
            if path.parent().map(Path::exists).unwrap_or(false) {
                std::fs::write(&path, text).unwrap();
            }
        }
        self.content.set(&uri, text);
        uri
    }

    async fn open(&self, name: &str, text: &str) -> Url {
        let uri = self.url(name);
        let language = LanguageId::from_uri(&uri).unwrap();
        let document = TextDocument::new(uri.clone(), language, 1, text);
        self.state.write().await.open_document(document);
        uri
    }

    async fn replace(&self, uri: &Url, version: i32, text: &str) {
        let change = TextDocumentContentChangeEvent {
            range: None,
            range_length: None,
            text: text.to_string(),
        };
        self.state
            .write()
            .await
            .change_document(uri, version, vec![change]);
    }

    async fn complete(&self, uri: &Url, position: Position) -> (Vec<CompletionItem>, bool) {
        let outcome =
            dispatch::do_complete(&self.state, uri, position, &CancellationToken::new()).await;
        match outcome {
            Outcome::Done(Some(CompletionResponse::List(list))) => (list.items, list.is_incomplete),
            other => panic!("expected a completion list, got {:?}", other),
        }
    }
}

/// Position just past `needle` on a single-line ASCII document.
fn after(text: &str, needle: &str) -> Position {
    let offset = text.find(needle).expect("needle present") + needle.len();
    Position::new(0, offset as u32)
}

/// Position inside `needle`, one character in.
fn inside(text: &str, needle: &str) -> Position {
    let offset = text.find(needle).expect("needle present") + 1;
    Position::new(0, offset as u32)
}

fn labels(items: &[CompletionItem]) -> Vec<&str> {
    items.iter().map(|item| item.label.as_str()).collect()
}

// ============================================================================
// Completion
// ============================================================================

#[tokio::test]
async fn test_used_and_linked_names_complete_once() {
    let fx = Fixture::new();
    fx.file("b.css", ".foo { }");
    let text = r#"<link rel="stylesheet" href="b.css"><div class="foo bar"></div><p class="foo "></p>"#;
    let a = fx.open("a.html", text).await;

    let (items, incomplete) = fx.complete(&a, after(text, r#"<p class="foo "#)).await;
    assert!(!incomplete);
    let names = labels(&items);
    assert_eq!(names.iter().filter(|n| **n == "foo").count(), 1);
    assert!(names.contains(&"bar"));

    let foo = items.iter().find(|item| item.label == "foo").unwrap();
    assert_eq!(foo.detail.as_deref(), Some("b.css"));
}

#[tokio::test]
async fn test_stylesheet_change_on_disk_reaches_completion() {
    let fx = Fixture::new();
    let b = fx.file("b.css", ".foo { } .other { }");
    let text = r#"<link href="b.css"><p class=""></p>"#;
    let a = fx.open("a.html", text).await;
    let position = after(text, r#"class=""#);

    let (items, _) = fx.complete(&a, position).await;
    assert_eq!(labels(&items), vec!["foo", "other"]);

    fx.file("b.css", ".other { }");
    fx.state.write().await.on_file_changed(&b, None);

    let (items, incomplete) = fx.complete(&a, position).await;
    assert_eq!(labels(&items), vec!["other"]);
    assert!(!incomplete);
}

#[tokio::test]
async fn test_deleted_stylesheet_stops_completing() {
    let fx = Fixture::new();
    let b = fx.file("b.css", ".foo { }");
    let text = r#"<link href="b.css"><p class=""></p>"#;
    let a = fx.open("a.html", text).await;
    let position = after(text, r#"class=""#);

    let (items, _) = fx.complete(&a, position).await;
    assert_eq!(labels(&items), vec!["foo"]);

    fx.content.fail(&b, FetchError::NotFound(b.to_string()));
    fx.state.write().await.on_file_deleted(&b);

    let (items, incomplete) = fx.complete(&a, position).await;
    assert!(items.is_empty());
    assert!(!incomplete);

    // Recreating the file brings its names back
    fx.file("b.css", ".again { }");
    fx.state.write().await.on_file_changed(&b, None);
    let (items, _) = fx.complete(&a, position).await;
    assert_eq!(labels(&items), vec!["again"]);
}

#[tokio::test]
async fn test_stylesheet_edit_in_editor_reaches_completion() {
    let fx = Fixture::new();
    fx.file("b.css", ".foo { }");
    let text = r#"<link href="b.css"><p class=""></p>"#;
    let a = fx.open("a.html", text).await;
    let b = fx.open("b.css", ".foo { }").await;
    let position = after(text, r#"class=""#);

    let (items, _) = fx.complete(&a, position).await;
    assert_eq!(labels(&items), vec!["foo"]);

    fx.replace(&b, 2, ".renamed { }").await;
    let (items, _) = fx.complete(&a, position).await;
    assert_eq!(labels(&items), vec!["renamed"]);

    // Closing keeps the editor's last text while a.html still links it
    fx.state.write().await.close_document(&b);
    let (items, _) = fx.complete(&a, position).await;
    assert_eq!(labels(&items), vec!["renamed"]);
}

#[tokio::test]
async fn test_missing_remote_stylesheet_keeps_local_names() {
    let fx = Fixture::new();
    fx.content.fail(
        &Url::parse("https://x/y.css").unwrap(),
        FetchError::Http {
            uri: "https://x/y.css".to_string(),
            status: 404,
        },
    );
    let text = r#"<style>.local { }</style><link href="https://x/y.css"><p class="used "></p>"#;
    let a = fx.open("a.html", text).await;

    let (items, _) = fx.complete(&a, after(text, r#"class="used "#)).await;
    assert_eq!(labels(&items), vec!["local", "used"]);
}

#[tokio::test]
async fn test_id_attribute_offers_ids() {
    let fx = Fixture::new();
    fx.file("b.css", ".foo { } #header { } #footer { }");
    let text = r#"<link href="b.css"><div id=""></div>"#;
    let a = fx.open("a.html", text).await;

    let (items, _) = fx.complete(&a, after(text, r#"id=""#)).await;
    assert_eq!(labels(&items), vec!["header", "footer"]);
}

#[tokio::test]
async fn test_jsx_class_name_completes_from_imported_stylesheet() {
    let fx = Fixture::new();
    fx.file("App.css", ".card { } .title { }");
    let text = r#"import "./App.css"; export const App = () => <div className="" />;"#;
    let app = fx.open("App.jsx", text).await;

    let (items, _) = fx.complete(&app, after(text, r#"className=""#)).await;
    assert_eq!(labels(&items), vec!["card", "title"]);
}

// ============================================================================
// Reference map
// ============================================================================

#[tokio::test]
async fn test_changed_href_moves_backward_edges() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::scanned(dir.path());
    let b = fx.file("b.css", ".foo { }");
    let c = fx.file("c.css", ".bar { }");
    fx.file("a.html", r#"<link href="b.css">"#);

    assert!(ensure_scanned(&fx.state).await);
    let a = fx.open("a.html", r#"<link href="b.css">"#).await;
    {
        let state = fx.state.read().await;
        assert!(state.reference_map.dependents(&b).unwrap().contains(&a));
        assert!(state.reference_map.dependents(&c).is_none());
    }

    fx.replace(&a, 2, r#"<link href="c.css">"#).await;
    let state = fx.state.read().await;
    assert!(state.reference_map.dependents(&b).is_none());
    assert!(state.reference_map.dependents(&c).unwrap().contains(&a));
}

// ============================================================================
// References and rename
// ============================================================================

const RENAME_PAGE: &str =
    r#"<link href="b.css"><link href="https://x/y.css"><div class="foo bar"></div>"#;

async fn rename_fixture(dir: &Path) -> (Fixture, Url) {
    let fx = Fixture::scanned(dir);
    fx.file("b.css", ".foo { color: red; }");
    fx.file("other.html", r#"<link href="b.css"><span class="foo"></span>"#);
    fx.file("a.html", RENAME_PAGE);
    fx.content
        .set(&Url::parse("https://x/y.css").unwrap(), ".foo { }");
    let a = fx.open("a.html", RENAME_PAGE).await;
    (fx, a)
}

#[tokio::test]
async fn test_rename_edits_writable_documents_only() {
    let dir = tempfile::tempdir().unwrap();
    let (fx, a) = rename_fixture(dir.path()).await;

    let outcome = dispatch::do_rename(
        &fx.state,
        &a,
        inside(RENAME_PAGE, "foo bar"),
        "baz",
        &CancellationToken::new(),
    )
    .await;
    let Outcome::Done(Some(edit)) = outcome else {
        panic!("expected a workspace edit");
    };
    let changes = edit.changes.unwrap();

    let mut edited: Vec<&str> = changes.keys().map(|uri| uri.path()).collect();
    edited.sort();
    let mut expected = vec![
        fx.url("a.html").path().to_string(),
        fx.url("b.css").path().to_string(),
        fx.url("other.html").path().to_string(),
    ];
    expected.sort();
    assert_eq!(edited, expected);

    for edits in changes.values() {
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].new_text, "baz");
    }
    let a_edit = &changes[&fx.url("a.html")][0];
    let start = RENAME_PAGE.find("foo bar").unwrap() as u32;
    assert_eq!(a_edit.range.start, Position::new(0, start));
    assert_eq!(a_edit.range.end, Position::new(0, start + 3));
}

#[tokio::test]
async fn test_references_include_read_only_sources() {
    let dir = tempfile::tempdir().unwrap();
    let (fx, a) = rename_fixture(dir.path()).await;

    let outcome = dispatch::find_references(
        &fx.state,
        &a,
        inside(RENAME_PAGE, "foo bar"),
        true,
        &CancellationToken::new(),
    )
    .await;
    let Outcome::Done(Some(locations)) = outcome else {
        panic!("expected locations");
    };
    let schemes: Vec<&str> = locations.iter().map(|l| l.uri.scheme()).collect();
    assert_eq!(locations.len(), 4);
    assert!(schemes.contains(&"css-https"));
}

#[tokio::test]
async fn test_rename_from_stylesheet_reaches_markup() {
    let dir = tempfile::tempdir().unwrap();
    let (fx, _) = rename_fixture(dir.path()).await;
    let b_text = ".foo { color: red; }";
    let b = fx.open("b.css", b_text).await;

    let outcome =
        dispatch::do_rename(&fx.state, &b, Position::new(0, 2), "baz", &CancellationToken::new())
            .await;
    let Outcome::Done(Some(edit)) = outcome else {
        panic!("expected a workspace edit");
    };
    let changes = edit.changes.unwrap();
    assert!(changes.contains_key(&fx.url("a.html")));
    assert!(changes.contains_key(&fx.url("other.html")));
    assert!(changes.contains_key(&b));
}

#[tokio::test]
async fn test_canceled_request_is_not_empty() {
    let dir = tempfile::tempdir().unwrap();
    let (fx, a) = rename_fixture(dir.path()).await;
    let token = CancellationToken::new();
    token.cancel();

    let outcome =
        dispatch::find_references(&fx.state, &a, inside(RENAME_PAGE, "foo bar"), true, &token)
            .await;
    assert!(outcome.is_canceled());

    // Nothing under the cursor is a genuine empty result
    let outcome = dispatch::find_references(
        &fx.state,
        &a,
        Position::new(0, 0),
        true,
        &CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, Outcome::Done(None));
}
