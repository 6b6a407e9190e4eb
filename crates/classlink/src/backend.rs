//
// backend.rs
//
// LSP protocol surface
//

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_lsp::jsonrpc::{Error, ErrorCode, Result};
use tower_lsp::lsp_types::*;
use tower_lsp::Client;
use tower_lsp::LanguageServer;
use tower_lsp::LspService;
use tower_lsp::Server;

use crate::config::{parse_config, ServerConfig};
use crate::dispatch::{self, Outcome};
use crate::document::TextDocument;
use crate::language::{LanguageId, SCANNED_EXTENSIONS};
use crate::state::{is_scanned_path, scan_file, WorldState};

pub const CLEAR_CACHE_COMMAND: &str = "classlink.clearCache";

const STYLESHEET_EXTENSIONS: &[&str] = &["css", "scss", "less"];

pub struct Backend {
    client: Client,
    state: Arc<RwLock<WorldState>>,
    /// Parent of every request token; fired on shutdown.
    shutdown: CancellationToken,
}

impl Backend {
    pub fn new(client: Client) -> Self {
        let state = WorldState::with_default_service(ServerConfig::default());
        Self {
            client,
            state: Arc::new(RwLock::new(state)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token for one request. The transport drops the handler future on
    /// `$/cancelRequest`; this token additionally ends requests that are
    /// still waiting on fetches when the server shuts down.
    fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    async fn register_file_watchers(&self) {
        let extensions: Vec<&str> = SCANNED_EXTENSIONS
            .iter()
            .chain(STYLESHEET_EXTENSIONS)
            .copied()
            .collect();
        let watcher = FileSystemWatcher {
            glob_pattern: GlobPattern::String(format!("**/*.{{{}}}", extensions.join(","))),
            kind: None,
        };
        let options = DidChangeWatchedFilesRegistrationOptions {
            watchers: vec![watcher],
        };
        let registration = Registration {
            id: String::from("classlink-watched-files"),
            method: String::from("workspace/didChangeWatchedFiles"),
            register_options: serde_json::to_value(options).ok(),
        };
        if let Err(e) = self.client.register_capability(vec![registration]).await {
            log::warn!("Client declined file watching: {}", e);
        }
    }

    async fn clear_remote_cache(&self) {
        let Some(cache) = self.state.read().await.remote_cache.clone() else {
            log::info!("No remote cache to clear");
            return;
        };
        let cleared = tokio::task::spawn_blocking(move || cache.clear()).await;
        match cleared {
            Ok(Ok(())) => log::info!("Cleared remote stylesheet cache"),
            Ok(Err(e)) => log::error!("Failed to clear remote cache: {}", e),
            Err(e) => log::error!("Remote cache clear task failed: {}", e),
        }
    }
}

fn canceled() -> Error {
    Error {
        code: ErrorCode::RequestCancelled,
        message: "Request canceled".into(),
        data: None,
    }
}

fn respond<T>(outcome: Outcome<T>) -> Result<T> {
    match outcome {
        Outcome::Done(value) => Ok(value),
        Outcome::Canceled => Err(canceled()),
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        log::info!("Initializing classlink");

        let mut state = self.state.write().await;

        if let Some(config) = params.initialization_options.as_ref().and_then(parse_config) {
            log::info!("Applying initialization options");
            state.apply_config(config);
        }

        if let Some(folders) = params.workspace_folders {
            for folder in folders {
                log::info!("Adding workspace folder: {}", folder.uri);
                state.workspace_folders.push(folder.uri);
            }
        } else if let Some(root_uri) = params.root_uri {
            log::info!("Adding root URI as workspace folder: {}", root_uri);
            state.workspace_folders.push(root_uri);
        }

        drop(state);

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::INCREMENTAL,
                )),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(vec![
                        String::from("\""),
                        String::from("'"),
                        String::from(" "),
                    ]),
                    ..Default::default()
                }),
                references_provider: Some(OneOf::Left(true)),
                rename_provider: Some(OneOf::Right(RenameOptions {
                    prepare_provider: Some(true),
                    work_done_progress_options: Default::default(),
                })),
                execute_command_provider: Some(ExecuteCommandOptions {
                    commands: vec![String::from(CLEAR_CACHE_COMMAND)],
                    ..Default::default()
                }),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: String::from("classlink"),
                version: Some(String::from(env!("CARGO_PKG_VERSION"))),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        log::info!("classlink initialized");
        self.register_file_watchers().await;
    }

    async fn shutdown(&self) -> Result<()> {
        log::info!("classlink shutting down");
        self.shutdown.cancel();
        self.state.write().await.shutdown();
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let item = params.text_document;
        let Some(language) = LanguageId::from_lsp(&item.language_id)
            .or_else(|| LanguageId::from_uri(&item.uri))
        else {
            log::trace!("Ignoring {} ({})", item.uri, item.language_id);
            return;
        };
        let document = TextDocument::new(item.uri, language, item.version, &item.text);
        self.state.write().await.open_document(document);
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        let version = params.text_document.version;
        self.state
            .write()
            .await
            .change_document(&uri, version, params.content_changes);
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        let max_file_size = {
            let mut state = self.state.write().await;
            state.close_document(&uri);
            state.config.max_file_size_bytes
        };

        // Unsaved edits die with the editor; fall back to the saved file
        let references = match uri.to_file_path() {
            Ok(path) if is_scanned_path(&path) => {
                tokio::task::spawn_blocking(move || scan_file(&path, max_file_size))
                    .await
                    .unwrap_or_else(|e| {
                        log::warn!("Failed to rescan {}: {}", uri, e);
                        None
                    })
                    .map(|(_, references)| references)
            }
            _ => None,
        };
        self.state
            .write()
            .await
            .restore_disk_references(&uri, references);
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        log::trace!("Configuration changed");
        let Some(config) = parse_config(&params.settings) else {
            log::warn!("No classlink section in settings, keeping current configuration");
            return;
        };
        self.state.write().await.apply_config(config);
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        log::trace!(
            "Received watched files change: {} changes",
            params.changes.len()
        );
        let max_file_size = self.state.read().await.config.max_file_size_bytes;

        for change in params.changes {
            let uri = change.uri;
            if change.typ == FileChangeType::DELETED {
                self.state.write().await.on_file_deleted(&uri);
                continue;
            }

            // Extract references off the lock; open documents are
            // authoritative and skipped inside `on_file_changed`
            let references = match uri.to_file_path() {
                Ok(path) if is_scanned_path(&path) => {
                    tokio::task::spawn_blocking(move || scan_file(&path, max_file_size))
                        .await
                        .unwrap_or_else(|e| {
                            log::warn!("Failed to rescan {}: {}", uri, e);
                            None
                        })
                        .map(|(_, references)| references)
                }
                _ => None,
            };
            self.state
                .write()
                .await
                .on_file_changed(&uri, references);
        }
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let token = self.request_token();
        respond(
            dispatch::do_complete(
                &self.state,
                &params.text_document_position.text_document.uri,
                params.text_document_position.position,
                &token,
            )
            .await,
        )
    }

    async fn references(&self, params: ReferenceParams) -> Result<Option<Vec<Location>>> {
        let token = self.request_token();
        respond(
            dispatch::find_references(
                &self.state,
                &params.text_document_position.text_document.uri,
                params.text_document_position.position,
                params.context.include_declaration,
                &token,
            )
            .await,
        )
    }

    async fn prepare_rename(
        &self,
        params: TextDocumentPositionParams,
    ) -> Result<Option<PrepareRenameResponse>> {
        Ok(dispatch::prepare_rename(&self.state, &params.text_document.uri, params.position).await)
    }

    async fn rename(&self, params: RenameParams) -> Result<Option<WorkspaceEdit>> {
        let token = self.request_token();
        respond(
            dispatch::do_rename(
                &self.state,
                &params.text_document_position.text_document.uri,
                params.text_document_position.position,
                &params.new_name,
                &token,
            )
            .await,
        )
    }

    async fn execute_command(
        &self,
        params: ExecuteCommandParams,
    ) -> Result<Option<serde_json::Value>> {
        match params.command.as_str() {
            CLEAR_CACHE_COMMAND => {
                self.clear_remote_cache().await;
                Ok(None)
            }
            other => {
                log::warn!("Unknown command: {}", other);
                Err(Error::invalid_params(format!("Unknown command: {other}")))
            }
        }
    }
}

pub async fn start_lsp() -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::build(Backend::new).finish();
    Server::new(stdin, stdout, socket).serve(service).await;

    Ok(())
}
