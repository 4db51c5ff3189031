//! tellus HTTP server binary.
//!
//! # Environment Variables
//!
//! - `PORT` — HTTP port (default: 8080)
//! - `TELLUS_PERSIST_ROOT` — root directory for save files (default: the
//!   working directory, which should only happen in development)
//! - `TELLUS_SOURCE_PERIOD_SECS` — seconds between source reloads
//!   (default: 3600)
//! - `TELLUS_VALID_USERNAMES` — comma-separated roster of valid usernames;
//!   enables the user-info source
//! - `TELLUS_TOOL_FILE_DIR` — directory whose subdirectories hold tool
//!   definition files; enables the tool YAML source
//! - `RUST_LOG` — tracing filter (default: "info")
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin server
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use tellus::config::SAVE_FILE_NAME;
use tellus::persistence::FilePersistor;
use tellus::server::{app_router, AppState};
use tellus::sources::initialization::InitializationSource;
use tellus::sources::socializer::Socializer;
use tellus::sources::tool_yaml::{is_tool_file, ToolFile, ToolFileProvider, ToolYamlSource};
use tellus::sources::user_info::{DirectoryProvider, UserInfoSource, UserProfile};
use tellus::sources::{start_periodic_loads, Source, Sourcer, DEFAULT_PERIOD};
use tellus::teller::Teller;
use tellus::users::UserManager;

/// A directory whose roster comes from the environment. Real directory
/// connectors live outside this crate; this stands in for development
/// deployments.
struct EnvDirectory {
    usernames: Vec<String>,
}

#[async_trait]
impl DirectoryProvider for EnvDirectory {
    async fn valid_usernames(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.usernames.clone())
    }

    async fn profile(&self, _username: &str) -> anyhow::Result<Option<UserProfile>> {
        Ok(None)
    }
}

/// Serves tool definition files from a local directory tree, one
/// subdirectory per "repository".
struct LocalToolFiles {
    root: PathBuf,
}

#[async_trait]
impl ToolFileProvider for LocalToolFiles {
    async fn fetch_tool_files(&self) -> anyhow::Result<Vec<ToolFile>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let repo_dir = entry?.path();
            if !repo_dir.is_dir() {
                continue;
            }
            for file in std::fs::read_dir(&repo_dir)? {
                let path = file?.path();
                let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                    continue;
                };
                if path.is_file() && is_tool_file(name) {
                    files.push(ToolFile {
                        repo_url: format!("file://{}", repo_dir.display()),
                        path: name.to_string(),
                        content: std::fs::read_to_string(&path)?,
                    });
                }
            }
        }
        Ok(files)
    }
}

fn env_roster() -> Vec<String> {
    std::env::var("TELLUS_VALID_USERNAMES")
        .map(|raw| {
            raw.split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tellus=debug".into()),
        )
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_addr = format!("0.0.0.0:{}", port);

    let persist_root = std::env::var("TELLUS_PERSIST_ROOT").ok().map(PathBuf::from);
    let persistor =
        FilePersistor::new(persist_root, SAVE_FILE_NAME).expect("Persistor configuration failed");

    let teller = Arc::new(RwLock::new(Teller::new(Box::new(persistor))));
    let users = Arc::new(RwLock::new(UserManager::new()));

    // Order matters here: the first source wins for creating any new tells,
    // and later sources are affected by the results of earlier ones.
    let mut enabled_sources: Vec<Box<dyn Source>> = vec![Box::new(
        InitializationSource::new(Arc::clone(&teller))
            .expect("Initialization source configuration failed"),
    )];
    let roster = env_roster();
    if roster.is_empty() {
        tracing::warn!("TELLUS_VALID_USERNAMES is not set; the user-info source is disabled.");
    } else {
        enabled_sources.push(Box::new(
            UserInfoSource::new(
                Arc::clone(&teller),
                Arc::clone(&users),
                Box::new(EnvDirectory { usernames: roster }),
            )
            .expect("User-info source configuration failed"),
        ));
    }
    match std::env::var("TELLUS_TOOL_FILE_DIR").ok().map(PathBuf::from) {
        Some(root) => enabled_sources.push(Box::new(
            ToolYamlSource::new(Arc::clone(&teller), Box::new(LocalToolFiles { root }))
                .expect("Tool YAML source configuration failed"),
        )),
        None => {
            tracing::warn!("TELLUS_TOOL_FILE_DIR is not set; the tool YAML source is disabled.")
        }
    }
    enabled_sources.push(Box::new(
        Socializer::new(Arc::clone(&teller), Arc::clone(&users))
            .expect("Socializer configuration failed"),
    ));

    let sourcer = Arc::new(Mutex::new(
        Sourcer::new(Arc::clone(&teller), enabled_sources).expect("Sourcer configuration failed"),
    ));

    let state = AppState::new(Arc::clone(&teller), Arc::clone(&users), Arc::clone(&sourcer));

    // Load persisted state, run the initial source pass in the background,
    // and flip readiness once the registry is usable.
    {
        let state = state.clone();
        let teller = Arc::clone(&teller);
        let sourcer = Arc::clone(&sourcer);
        tokio::spawn(async move {
            if let Err(error) = teller.write().await.load_tells() {
                tracing::error!("Failed to load persisted tells: {error}");
            }
            state.set_ready().await;
            tracing::info!("Tellus is ready for telling.");
            sourcer.lock().await.run_all().await;
        });
    }

    let period = std::env::var("TELLUS_SOURCE_PERIOD_SECS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_PERIOD);
    start_periodic_loads(Arc::clone(&sourcer), period);

    let app = app_router(state);
    tracing::info!("tellus server starting on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind");
    axum::serve(listener, app).await.expect("Server failed");
}
